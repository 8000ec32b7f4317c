//! Informer-backed caches and work queues.
//!
//! Watch events land here via `kubert::index`: each event updates the cached
//! view for its object and, when something projection-relevant actually
//! changed, enqueues the object's `<namespace>/<name>` key onto the matching
//! work queue. The reconcile workers drain the queues and read the cache
//! through [`Index`]'s accessors.
//!
//! Cached entries are immutable `Arc`s replaced wholesale on update, so
//! readers never observe partial state and never need to copy defensively.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod config;
mod index;
mod pod;
pub mod queue;
#[cfg(test)]
mod test_helpers;

pub use self::{
    index::{split_key, Index, SharedIndex},
    queue::{Queue, QueueMetrics, RateLimiter, DELETED_PREFIX},
};
