//! eventcast: asynchronous participation-prediction dispatch.
//!
//! Publishes prediction tasks onto a durable broker channel, processes
//! them in a pool of worker processes, and returns scored results over
//! a results channel. The model itself is a transparent heuristic over
//! features pulled from the platform database.

pub mod cli;
pub mod config;
pub mod envelope;
pub mod features;
pub mod model;
pub mod publisher;
pub mod queue;
pub mod store;
pub mod supervisor;
pub mod worker;

// Re-export the types most callers need
pub use envelope::{
    HintMap, HintValue, Prediction, PredictionLabel, ResultEnvelope, TaskEnvelope, TaskStatus,
};
pub use model::{HeuristicModel, ParticipationModel};
pub use publisher::TaskPublisher;
pub use queue::{QueueNames, TaskQueue};
pub use worker::{TaskProcessor, Worker, WorkerConfig};
