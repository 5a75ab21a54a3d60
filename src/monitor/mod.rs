//! Filesystem watching: raw OS events in, coalesced scanner tasks out.
//!
//! [`coalescer`] holds the pure, time-injected state machine; [`watcher`]
//! wires it to the `notify` crate and a tokio task.

pub mod coalescer;
pub mod watcher;

pub use coalescer::{Coalescer, RawEvent, RawEventKind, ScanRequest};

// vim: ts=4
