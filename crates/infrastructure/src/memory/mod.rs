//! In-memory coordination store and repositories.
//!
//! Functional doubles for the Redis/Postgres implementations, used by
//! tests and embedded single-process runs. Same contracts, no external
//! services.

mod repositories;
mod store;

pub use repositories::{
    MemoryBatchExecutionRepository, MemoryCheckpointRepository, MemoryPlaceRepository,
};
pub use store::MemoryStore;
