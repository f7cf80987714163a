mod batch_execution_repository;
mod checkpoint_repository;
mod place_repository;
mod sharded_reader;

pub use batch_execution_repository::PostgresBatchExecutionRepository;
pub use checkpoint_repository::PostgresCheckpointRepository;
pub use place_repository::PostgresPlaceRepository;
pub use sharded_reader::{belongs_to_shard, ResumePolicy, ShardedPage, ShardedPlaceReader};
