pub mod database;
pub mod memory;
pub mod redis_store;

pub use database::postgres::{
    PostgresBatchExecutionRepository, PostgresCheckpointRepository, PostgresPlaceRepository,
    ResumePolicy, ShardedPage, ShardedPlaceReader,
};
pub use database::{connect_pool, run_migrations};
pub use memory::{
    MemoryBatchExecutionRepository, MemoryCheckpointRepository, MemoryPlaceRepository, MemoryStore,
};
pub use redis_store::RedisStore;
