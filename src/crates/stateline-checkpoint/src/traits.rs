//! Storage backend trait for checkpoint persistence
//!
//! [`CheckpointStore`] is the seam between the engine and durable storage.
//! The engine serializes an execution into a [`Checkpoint`] and hands it to
//! the store under an id of the caller's choosing; everything about *where*
//! and *how* the snapshot lives is the implementation's business. The crate
//! ships [`crate::InMemoryCheckpointStore`]; production deployments implement
//! this trait over their database of choice.

use async_trait::async_trait;

use crate::checkpoint::Checkpoint;
use crate::error::Result;

/// Opaque durable put/get of execution snapshots keyed by checkpoint id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a snapshot under `id`, replacing any previous snapshot with
    /// the same id.
    async fn put(&self, id: &str, checkpoint: Checkpoint) -> Result<()>;

    /// Fetch the snapshot stored under `id`, or `None` if absent or already
    /// expired.
    async fn get(&self, id: &str) -> Result<Option<Checkpoint>>;

    /// Remove the snapshot stored under `id`. Removing an absent id is not
    /// an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Drop every snapshot whose TTL has elapsed, returning how many were
    /// removed.
    async fn expire(&self) -> Result<usize>;
}
