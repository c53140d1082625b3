//! The resilience engine: composition root for the breaker, retry, health,
//! recovery and dispatch layers.
//!
//! Layering for a guarded daemon call: the retry executor absorbs transient
//! blips inside one logical call, and the circuit breaker counts the whole
//! sequence as a single success or failure. The health monitor probes the
//! daemon outside the breaker so a dead daemon is still observed while the
//! circuit is open.

pub mod breaker;
pub mod cooldown;
pub mod dispatch;
pub mod health;
pub mod recovery;
pub mod retry;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::CoreConfig;
use crate::daemon::DaemonAdapter;
use crate::error::AppError;
use crate::events::CacheSink;
use crate::notify::Notifier;

use breaker::{BreakerSnapshot, CircuitBreaker};
use dispatch::EventDispatcher;
use health::{HealthCheck, HealthMonitor, HealthSummary};
use recovery::AutoRecoveryOrchestrator;
use retry::{Retry, RetryPolicy};

/// Name of the built-in daemon liveness check.
pub const DAEMON_CHECK: &str = "daemon";

/// One-shot view of the engine for the diagnostics panel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub breaker: BreakerSnapshot,
    pub health: HealthSummary,
    pub event_cursor: u64,
}

pub struct ResilienceEngine {
    config: CoreConfig,
    adapter: Arc<dyn DaemonAdapter>,
    breaker: Arc<CircuitBreaker>,
    retry_policy: RetryPolicy,
    health: Arc<HealthMonitor>,
    recovery: Arc<AutoRecoveryOrchestrator>,
    dispatcher: Arc<EventDispatcher>,
}

impl ResilienceEngine {
    pub fn new(
        config: CoreConfig,
        adapter: Arc<dyn DaemonAdapter>,
        cache: Arc<dyn CacheSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let health = HealthMonitor::new(&config.health, notifier.clone());
        let recovery =
            AutoRecoveryOrchestrator::new(health.clone(), &config.recovery, &config.health);
        let dispatcher = EventDispatcher::new(
            adapter.clone(),
            cache,
            notifier,
            config.dispatch.clone(),
        );
        Arc::new(Self {
            breaker: Arc::new(CircuitBreaker::new(&config.breaker)),
            retry_policy: RetryPolicy::from_config(&config.retry),
            adapter,
            health,
            recovery,
            dispatcher,
            config,
        })
    }

    /// Run a daemon call under the full protection stack. The retry sequence
    /// runs inside one breaker admission, so three quick transient failures
    /// count as one failure against the breaker, not three.
    pub async fn guarded<T, F, Fut>(&self, op: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.breaker
            .execute(
                Retry::new(self.retry_policy.clone())
                    .retry_if(AppError::is_transient)
                    .run(op),
            )
            .await
    }

    /// Register the built-in daemon supervision (liveness check plus restart
    /// strategy) and start the recovery and dispatch loops.
    pub fn start(self: &Arc<Self>) {
        let probe_adapter = self.adapter.clone();
        self.health.register(HealthCheck::new(
            DAEMON_CHECK,
            Duration::from_secs(self.config.health.default_interval_secs),
            true,
            move || {
                let adapter = probe_adapter.clone();
                async move { adapter.probe().await }
            },
        ));

        let restart_adapter = self.adapter.clone();
        self.recovery.register_strategy(DAEMON_CHECK, move || {
            let adapter = restart_adapter.clone();
            async move {
                match adapter.restart_process().await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        // A daemon that cannot answer the restart request is
                        // likely gone entirely; fall back to launching it.
                        tracing::warn!(error = %e, "Restart request failed, trying process launch");
                        adapter.start_process().await
                    }
                }
            }
        });

        self.recovery.start_monitoring();
        self.dispatcher.start();
        tracing::info!("Resilience engine started");
    }

    /// Stop every loop and probe. Idempotent; safe to call on a never-started
    /// engine.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        self.recovery.stop_monitoring();
        self.health.shutdown();
        tracing::info!("Resilience engine shut down");
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            breaker: self.breaker.snapshot(),
            health: self.health.summary(),
            event_cursor: self.dispatcher.cursor(),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn recovery(&self) -> &Arc<AutoRecoveryOrchestrator> {
        &self.recovery
    }
}
