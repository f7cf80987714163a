pub mod components;
pub mod monitor;
pub mod service;
#[cfg(test)]
mod service_test;

pub use monitor::QueueMonitor;
pub use service::{QueueWorker, QueueWorkerBuilder};
