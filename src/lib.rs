//! # zisync - a peer-to-peer file synchronization engine
//!
//! zisync keeps a set of directory trees, spread across devices, mirrored
//! with each other. Each tree keeps a local [`store::path_store::PathStore`]
//! of per-path vector clocks; [`reconciler`] decides what a session should
//! do with each path difference it finds between two trees.

#![deny(unsafe_code)]
#![warn(dead_code)]

pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod orchestrator;
pub mod reconciler;
pub mod rpc;
pub mod scanner;
pub mod session;
pub mod store;
pub mod transfer;
pub mod types;
pub mod util;
pub mod validation;
pub mod vclock;

pub use error::{
	DiscoveryError, ReconcileError, SessionError, StoreError, VClockError, ZiError,
};
pub use reconciler::{reconcile, Action, ReconcileCtx};
pub use store::content_store::ContentStore;
pub use store::path_store::PathStore;
pub use types::{Device, FileRecord, Sync, Tree};

// vim: ts=4
