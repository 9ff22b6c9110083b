//! Kestrel store: a client-side cache of watched resources.
//!
//! Watch sources push [`WatchMessage`](kestrel_core::WatchMessage)s into a
//! bounded channel. A single ingest task buffers them, folds each burst into
//! one copy-on-write [`StoreSnapshot`] and publishes it through `ArcSwap`
//! and a `watch` channel of epochs.

#![forbid(unsafe_code)]

pub mod builder;
pub mod coalesce;
pub mod config;
mod ingest;
pub mod source;
mod store;

pub use builder::{StoreBuilder, StoreSnapshot, StoreState};
pub use coalesce::Coalescer;
pub use config::StoreConfig;
pub use source::{CancelHandle, MemorySource, WatchSource, WatchStream};
pub use store::{ListenerId, ResourceStore, StoreError};
