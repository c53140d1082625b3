//! Resilience core for a desktop client supervising a local sync daemon.
//!
//! The daemon is a separate process reached over its local REST API; it can
//! be slow, restarting, or gone. This crate owns everything that keeps the
//! UI responsive and honest while that happens: a circuit breaker and retry
//! stack around daemon calls, a health monitor with automated recovery, and
//! a long-poll event dispatcher feeding cache invalidation and user
//! notifications. The UI shell plugs in through the [`daemon::DaemonAdapter`],
//! [`events::CacheSink`] and [`notify::Notifier`] traits.

pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod notify;

pub use config::CoreConfig;
pub use daemon::{DaemonAdapter, HttpDaemonClient};
pub use engine::breaker::{BreakerSnapshot, CircuitState};
pub use engine::health::{HealthCheck, HealthStatus, HealthSummary};
pub use engine::{EngineSnapshot, ResilienceEngine};
pub use error::AppError;
pub use events::{CacheSink, CacheTag, DaemonEvent, EventClass};
pub use notify::{Notification, Notifier, Severity};
