//! warpgrid-state: rollout state for WarpGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for applications (spec, revisions, per-instance changes,
//! deployments and job run history) and the system-wide version status.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Each application is one record, so a read-modify-write of an application
//! is a single write transaction. Writers serialize per application through
//! [`StateStore::lock_and_store`], whose lock acquisition times out instead
//! of blocking forever.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{ApplicationLock, StateStore};
pub use types::*;
