//! Durable, restart-safe scheduled work.
//!
//! ```text
//! enqueue ──► jobs table ──► JobRunner.run() ──► JobRegistry.dispatch()
//!                 ▲                                      │
//!                 └──────────── fail() / complete() ─────┘
//! ```

mod model;
mod registry;
mod repository;
mod runner;

pub use model::{EnqueueOptions, Job, JobStatus};
pub use registry::{JobRegistry, SharedJobRegistry};
pub use repository::JobRepository;
pub use runner::{JobRunner, JobRunnerConfig};
