//! Durable job queue, outbox, and inbound dedup ledger for a messaging
//! pipeline, backed by either an embedded SQLite file or a networked
//! Postgres database.
//!
//! The crate owns three state machines (jobs, outbox messages, inbound
//! dedup records), the single-instance lock that makes optimistic claiming
//! safe, and the polling loops that drive jobs and outbox sends forward.
//! Everything above this — HTTP surfaces, domain models, transport clients
//! — is the embedding application's concern.

pub mod config;
pub mod dedup;
pub mod dsn;
pub mod error;
pub mod jobs;
pub mod lock;
pub mod logging;
pub mod outbox;
pub mod store;
pub mod supervisor;

pub use config::Config;
pub use store::Store;
pub use supervisor::{Supervisor, SupervisorError};
