pub mod entities;
pub mod handler;
pub mod repositories;
pub mod store;

pub use entities::*;
pub use handler::{TaskError, TaskHandler};
pub use repositories::{BatchExecutionRepository, CheckpointRepository, PlaceRepository};
pub use store::{CoordinationStore, QueueDepths, StatCounter, TaskSet};
