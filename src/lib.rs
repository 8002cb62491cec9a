#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod engine;
mod error;
mod hash;
pub mod spec;
mod state;

pub use crate::cache::{CacheEntry, CacheStore, CallRequest};
pub use crate::engine::{
    Dep, Dependencies, ElementId, Engine, Input, ListNode, Mutations, Node, Probe, Scope,
};
pub use crate::error::{CallError, RuntimeError, SnapshotError};
pub use crate::hash::Fingerprint;
pub use crate::state::State;

/// Initializes a `tracing` subscriber reading its filter from the
/// `RUST_LOG` environment variable. Call it once, early; a host that
/// installs its own subscriber should skip this.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}
