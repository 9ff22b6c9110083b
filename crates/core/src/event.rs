//! Watch event vocabulary.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::id::ResourceId;
use crate::tree::Value;

/// One change delivered by a watch query, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Full listing for the query (first sync or relist).
    InitialList(Vec<Value>),
    Add(Value),
    Update(Value),
    Remove(ResourceId),
}

impl WatchEvent {
    pub fn label(&self) -> &'static str {
        match self {
            WatchEvent::InitialList(_) => "initial_list",
            WatchEvent::Add(_) => "add",
            WatchEvent::Update(_) => "update",
            WatchEvent::Remove(_) => "remove",
        }
    }
}

/// Failure reported by a watch source. Recorded as data on the store.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct WatchError {
    pub message: String,
    pub at: DateTime<Utc>,
}

impl WatchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), at: Utc::now() }
    }
}

/// What a watch stream carries.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchMessage {
    Event(WatchEvent),
    Error(WatchError),
}

impl From<WatchEvent> for WatchMessage {
    fn from(e: WatchEvent) -> Self {
        WatchMessage::Event(e)
    }
}

impl From<WatchError> for WatchMessage {
    fn from(e: WatchError) -> Self {
        WatchMessage::Error(e)
    }
}
