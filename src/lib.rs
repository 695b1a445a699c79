// src/lib.rs
// Public library surface for the host binary, the demo and integration tests.

pub mod app;
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod publisher;
pub mod scanner;
pub mod scheduler;
pub mod sources;
pub mod telemetry;
pub mod worker;

// ---- Re-exports for stable public API ----
pub use crate::app::{App, Collaborators, Pipeline};
pub use crate::channel::{
    Channel, ChannelConsumer, ChannelProducer, LogBroker, SqliteLog, StartOffset,
};
pub use crate::clock::DedupClock;
pub use crate::config::NotifierConfig;
pub use crate::error::{ChannelError, PipelineError, PublishError};
pub use crate::model::{Article, NotificationEnvelope, Subscription, UserId};
pub use crate::publisher::Publisher;
pub use crate::scanner::Scanner;
pub use crate::scheduler::{CheckReport, Scheduler, SchedulerCfg, SchedulerState};
pub use crate::worker::{DeliveryWorker, WorkerCfg};
