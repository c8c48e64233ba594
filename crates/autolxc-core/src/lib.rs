//! Core logic for autolxc test-container lifecycle management
//!
//! This crate provides:
//! - Container identities and the per-container state machine
//! - A bucket owning every container cloned from one base container
//! - Single-flight base image download guarded by a host-wide lock file
//! - Monotonic clone-index allocation persisted next to the containers
//! - Lifecycle observers

mod archive;
mod base;
mod bucket;
mod container;
mod error;
mod factory;
mod identity;
mod ledger;
mod lock;
mod observer;

pub use base::*;
pub use bucket::*;
pub use container::*;
pub use error::*;
pub use factory::*;
pub use identity::*;
pub use ledger::*;
pub use observer::*;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
