//! Kestrel core types: tree values, resource identity, watch events.

#![forbid(unsafe_code)]

pub mod event;
pub mod id;
pub mod tree;

pub use event::{WatchError, WatchEvent, WatchMessage};
pub use id::{group_by_namespace, ResourceId, WatchQuery};
pub use tree::{Kind, Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvkKey(String),
}

pub mod prelude {
    pub use super::{Kind, Map, ResourceId, Value, WatchError, WatchEvent, WatchMessage, WatchQuery};
}
