//! Auto-recovery orchestrator: watches the health monitor and invokes
//! registered remediation strategies for critical checks that stay unhealthy
//! past the alert threshold.
//!
//! Each strategy has its own cooldown, independent of the tick interval, as
//! a second slower backoff layer: a daemon that keeps failing is not
//! restarted on every tick. Strategy errors are logged and absorbed; they
//! never terminate the monitoring loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{HealthConfig, RecoveryConfig};
use crate::error::AppError;
use crate::engine::health::HealthMonitor;

pub type StrategyFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), AppError>> + Send + Sync>;

struct StrategyState {
    action: StrategyFn,
    /// Current cooldown; doubles on failure up to the cap, shrinks back to
    /// base on success.
    cooldown: Duration,
    last_attempt: Option<Instant>,
}

pub struct AutoRecoveryOrchestrator {
    monitor: Arc<HealthMonitor>,
    alert_threshold: u32,
    tick_interval: Duration,
    base_cooldown: Duration,
    cooldown_cap: Duration,
    strategies: Mutex<HashMap<String, StrategyState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoRecoveryOrchestrator {
    pub fn new(
        monitor: Arc<HealthMonitor>,
        recovery: &RecoveryConfig,
        health: &HealthConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            monitor,
            alert_threshold: health.alert_threshold.max(1),
            tick_interval: Duration::from_secs(recovery.tick_interval_secs.max(1)),
            base_cooldown: Duration::from_secs(recovery.base_cooldown_secs),
            cooldown_cap: Duration::from_secs(
                recovery.cooldown_cap_secs.max(recovery.base_cooldown_secs),
            ),
            strategies: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        })
    }

    /// Register the remediation for one critical check. Re-registering
    /// replaces the old strategy and resets its cooldown.
    pub fn register_strategy<F, Fut>(&self, check_name: impl Into<String>, action: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), AppError>> + Send + 'static,
    {
        let mut strategies = self.lock_strategies();
        strategies.insert(
            check_name.into(),
            StrategyState {
                action: Arc::new(move || Box::pin(action())),
                cooldown: self.base_cooldown,
                last_attempt: None,
            },
        );
    }

    /// Start the tick loop. Idempotent: a second call while running is a
    /// no-op.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let orchestrator = Arc::clone(self);
        tracing::info!(
            tick_secs = self.tick_interval.as_secs(),
            "Auto-recovery monitoring started",
        );
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(orchestrator.tick_interval).await;
                orchestrator.tick().await;
            }
        }));
    }

    /// Stop the tick loop. Idempotent and safe when nothing is running.
    pub fn stop_monitoring(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
            tracing::info!("Auto-recovery monitoring stopped");
        }
    }

    /// One pass over the health snapshot. Public so a manual "recover now"
    /// action can run it out of band.
    pub async fn tick(&self) {
        let statuses = self.monitor.statuses();
        for status in statuses.values() {
            if !status.critical
                || status.healthy
                || status.consecutive_failures < self.alert_threshold
            {
                continue;
            }

            let action = {
                let mut strategies = self.lock_strategies();
                let Some(state) = strategies.get_mut(&status.name) else {
                    continue;
                };
                let in_cooldown = state
                    .last_attempt
                    .is_some_and(|t| t.elapsed() < state.cooldown);
                if in_cooldown {
                    continue;
                }
                state.last_attempt = Some(Instant::now());
                state.action.clone()
            };

            tracing::warn!(
                check = %status.name,
                consecutive_failures = status.consecutive_failures,
                "Attempting automated recovery",
            );

            match action().await {
                Ok(()) => {
                    tracing::info!(check = %status.name, "Recovery strategy succeeded");
                    let mut strategies = self.lock_strategies();
                    if let Some(state) = strategies.get_mut(&status.name) {
                        state.cooldown = self.base_cooldown;
                        state.last_attempt = None;
                    }
                }
                Err(e) => {
                    let mut strategies = self.lock_strategies();
                    if let Some(state) = strategies.get_mut(&status.name) {
                        state.cooldown = (state.cooldown * 2).min(self.cooldown_cap);
                        tracing::error!(
                            check = %status.name,
                            error = %e,
                            next_attempt_in_secs = state.cooldown.as_secs(),
                            "Recovery strategy failed",
                        );
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn current_cooldown(&self, check_name: &str) -> Option<Duration> {
        self.lock_strategies().get(check_name).map(|s| s.cooldown)
    }

    fn lock_strategies(&self) -> std::sync::MutexGuard<'_, HashMap<String, StrategyState>> {
        self.strategies.lock().unwrap_or_else(|e| e.into_inner())
    }
}
