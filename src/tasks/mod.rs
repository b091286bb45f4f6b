pub mod logger;
pub mod queue;

pub use logger::TaskLogger;
pub use queue::{channel, QueueClient, QueueWorker, QueueWorkerConfig};
