//! # stateline-checkpoint - Durable Snapshots for Workflow Executions
//!
//! **Trait-based checkpoint abstractions and an in-memory implementation** for
//! persisting and restoring workflow execution state. Checkpoints are what let
//! an execution survive a process restart: a Checkpoint state (or a suspended
//! Approval) snapshots the execution document, trace, and accounting totals,
//! and the runner can later restore all of it and resume stepping.
//!
//! ## Overview
//!
//! The crate provides:
//!
//! - [`Checkpoint`] - A snapshot of one execution at a resume point
//! - [`CheckpointStore`] - The storage backend trait (put/get/delete/expire)
//! - [`InMemoryCheckpointStore`] - Reference implementation for development
//!   and tests
//! - [`Totals`] - Token/cost accounting carried inside a snapshot
//! - [`parse_ttl`] - Human-friendly TTL strings (`"24h"`, `"7d"`, `"30m"`,
//!   `"never"`) translated to seconds
//!
//! The snapshot payload is opaque to the store: implementations persist the
//! serialized [`Checkpoint`] under a caller-chosen id and hand it back on
//! `get`. TTL expiry is cooperative - stores drop expired entries on
//! [`CheckpointStore::expire`] and are free to also drop them lazily.
//!
//! ## Implementing a Backend
//!
//! ```rust,ignore
//! use stateline_checkpoint::{Checkpoint, CheckpointStore, Result};
//! use async_trait::async_trait;
//!
//! struct PostgresStore { pool: sqlx::PgPool }
//!
//! #[async_trait]
//! impl CheckpointStore for PostgresStore {
//!     async fn put(&self, id: &str, checkpoint: Checkpoint) -> Result<()> {
//!         let payload = serde_json::to_vec(&checkpoint)?;
//!         // INSERT INTO checkpoints (id, payload) VALUES ($1, $2) ...
//!         Ok(())
//!     }
//!     // get / delete / expire ...
//! #   async fn get(&self, id: &str) -> Result<Option<Checkpoint>> { Ok(None) }
//! #   async fn delete(&self, id: &str) -> Result<()> { Ok(()) }
//! #   async fn expire(&self) -> Result<usize> { Ok(0) }
//! }
//! ```

mod checkpoint;
mod error;
mod memory;
mod traits;

pub use checkpoint::{parse_ttl, Checkpoint, Totals};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointStore;
pub use traits::CheckpointStore;
