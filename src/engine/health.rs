//! Health monitor: a registry of independently-scheduled named probes.
//!
//! Each registered check runs on its own spawned task with fixed-delay
//! scheduling (the next run is scheduled only after the current one,
//! including its timeout, completes), so a slow or hung probe can never
//! overlap itself. Probe outcomes land in a status map that subscribers
//! receive as copied snapshots; failures never propagate as errors out of
//! the monitor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::HealthConfig;
use crate::error::AppError;
use crate::notify::{Notification, Notifier, Severity};

/// Detailed per-failure logging stops after this many consecutive failures
/// to keep a sustained outage from flooding the log.
const DETAILED_FAILURE_LOG_LIMIT: u32 = 3;

pub type ProbeFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), AppError>> + Send + Sync>;

/// A named probe with its own schedule. Registered once; lives until
/// explicitly unregistered or monitor shutdown.
pub struct HealthCheck {
    pub name: String,
    pub interval: Duration,
    pub critical: bool,
    pub probe: ProbeFn,
}

impl HealthCheck {
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, critical: bool, probe: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), AppError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            critical,
            probe: Arc::new(move || Box::pin(probe())),
        }
    }
}

/// Current state of one check. Mutated only by that check's own run path
/// (single writer); everyone else sees copies.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub name: String,
    pub healthy: bool,
    pub critical: bool,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl HealthStatus {
    fn initial(name: &str, critical: bool) -> Self {
        Self {
            name: name.to_string(),
            healthy: true,
            critical,
            consecutive_failures: 0,
            last_check: None,
            last_success: None,
            last_failure: None,
            error: None,
        }
    }
}

/// Aggregate view for the status bar.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: Vec<String>,
    pub all_healthy: bool,
    pub critical_healthy: bool,
}

type SubscriberFn = Arc<dyn Fn(HashMap<String, HealthStatus>) + Send + Sync>;

struct RegisteredCheck {
    probe: ProbeFn,
    interval: Duration,
    critical: bool,
    /// Set when the critical alert for the current failure streak has been
    /// surfaced; gates the user-visible recovery notice.
    alerted: bool,
    task: Option<JoinHandle<()>>,
}

struct MonitorInner {
    checks: HashMap<String, RegisteredCheck>,
    statuses: HashMap<String, HealthStatus>,
    subscribers: HashMap<u64, SubscriberFn>,
    next_subscriber_id: u64,
}

pub struct HealthMonitor {
    probe_timeout: Duration,
    alert_threshold: u32,
    notifier: Arc<dyn Notifier>,
    inner: Mutex<MonitorInner>,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig, notifier: Arc<dyn Notifier>) -> Arc<Self> {
        Arc::new(Self {
            probe_timeout: config.probe_timeout(),
            alert_threshold: config.alert_threshold.max(1),
            notifier,
            inner: Mutex::new(MonitorInner {
                checks: HashMap::new(),
                statuses: HashMap::new(),
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
            }),
        })
    }

    /// Register a check: stores an initially-healthy status, runs the probe
    /// immediately, then reschedules with fixed-delay semantics.
    /// Re-registering an existing name replaces the old check.
    pub fn register(self: &Arc<Self>, check: HealthCheck) {
        let name = check.name.clone();
        {
            let mut inner = self.lock_inner();
            if let Some(old) = inner.checks.remove(&name) {
                if let Some(task) = old.task {
                    task.abort();
                }
            }
            inner
                .statuses
                .insert(name.clone(), HealthStatus::initial(&name, check.critical));
            inner.checks.insert(
                name.clone(),
                RegisteredCheck {
                    probe: check.probe,
                    interval: check.interval,
                    critical: check.critical,
                    alerted: false,
                    task: None,
                },
            );
        }

        let monitor = Arc::clone(self);
        let loop_name = name.clone();
        let interval = check.interval;
        let task = tokio::spawn(async move {
            // Immediate first run, then sleep-after-completion so runs of
            // one check never overlap.
            if !monitor.run_check_once(&loop_name).await {
                return;
            }
            loop {
                tokio::time::sleep(interval).await;
                if !monitor.run_check_once(&loop_name).await {
                    return;
                }
            }
        });

        let mut inner = self.lock_inner();
        if let Some(registered) = inner.checks.get_mut(&name) {
            registered.task = Some(task);
        } else {
            // Unregistered between the insert above and here
            task.abort();
        }
        tracing::debug!(check = %name, interval_secs = interval.as_secs(), "Health check registered");
    }

    /// Cancel a check's schedule and drop its status. Safe to call for an
    /// unknown name or repeatedly.
    pub fn unregister(&self, name: &str) {
        let removed = {
            let mut inner = self.lock_inner();
            inner.statuses.remove(name);
            inner.checks.remove(name)
        };
        if let Some(check) = removed {
            if let Some(task) = check.task {
                task.abort();
            }
            tracing::debug!(check = %name, "Health check unregistered");
        }
    }

    /// Subscribe to status snapshots: the listener is called immediately
    /// with the current map, then after every run of any check. Returns a
    /// cancellation handle.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> HealthSubscription
    where
        F: Fn(HashMap<String, HealthStatus>) + Send + Sync + 'static,
    {
        let listener: SubscriberFn = Arc::new(listener);
        let (id, snapshot) = {
            let mut inner = self.lock_inner();
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.subscribers.insert(id, listener.clone());
            (id, inner.statuses.clone())
        };
        listener(snapshot);
        HealthSubscription {
            id,
            monitor: Arc::downgrade(self),
        }
    }

    /// Force an immediate out-of-band run of every registered check. Each
    /// check's normal schedule is untouched beyond this one extra run.
    pub async fn run_all_checks(&self) {
        let names: Vec<String> = {
            let inner = self.lock_inner();
            inner.checks.keys().cloned().collect()
        };
        for name in names {
            self.run_check_once(&name).await;
        }
    }

    pub fn status(&self, name: &str) -> Option<HealthStatus> {
        self.lock_inner().statuses.get(name).cloned()
    }

    pub fn statuses(&self) -> HashMap<String, HealthStatus> {
        self.lock_inner().statuses.clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.lock_inner().statuses.values().all(|s| s.healthy)
    }

    pub fn is_critical_healthy(&self) -> bool {
        self.lock_inner()
            .statuses
            .values()
            .filter(|s| s.critical)
            .all(|s| s.healthy)
    }

    pub fn summary(&self) -> HealthSummary {
        let inner = self.lock_inner();
        let total = inner.statuses.len();
        let healthy = inner.statuses.values().filter(|s| s.healthy).count();
        let mut unhealthy: Vec<String> = inner
            .statuses
            .values()
            .filter(|s| !s.healthy)
            .map(|s| s.name.clone())
            .collect();
        unhealthy.sort();
        let critical_healthy = inner
            .statuses
            .values()
            .filter(|s| s.critical)
            .all(|s| s.healthy);
        HealthSummary {
            total,
            healthy,
            all_healthy: healthy == total,
            critical_healthy,
            unhealthy,
        }
    }

    /// Abort every check task and clear the registry. Called on engine
    /// shutdown; safe to call more than once.
    pub fn shutdown(&self) {
        let mut inner = self.lock_inner();
        for (_, check) in inner.checks.drain() {
            if let Some(task) = check.task {
                task.abort();
            }
        }
        inner.statuses.clear();
        inner.subscribers.clear();
    }

    /// Run one check now. Returns false when the check is no longer
    /// registered, which ends its schedule loop.
    async fn run_check_once(&self, name: &str) -> bool {
        let (probe, critical) = {
            let inner = self.lock_inner();
            match inner.checks.get(name) {
                Some(c) => (c.probe.clone(), c.critical),
                None => return false,
            }
        };

        let result = match tokio::time::timeout(self.probe_timeout, probe()).await {
            Ok(r) => r,
            Err(_) => Err(AppError::ProbeTimeout(self.probe_timeout.as_secs())),
        };

        // The notification (if any) is sent outside the lock so a notifier
        // that reads monitor state cannot deadlock.
        if let Some(notification) = self.apply_outcome(name, critical, result) {
            self.notifier.notify(notification);
        }

        // Snapshot and subscriber list are taken under the lock, but the
        // callbacks run outside it.
        let (snapshot, subscribers) = {
            let inner = self.lock_inner();
            if !inner.checks.contains_key(name) {
                return false;
            }
            let subs: Vec<SubscriberFn> = inner.subscribers.values().cloned().collect();
            (inner.statuses.clone(), subs)
        };
        for sub in subscribers {
            sub(snapshot.clone());
        }
        true
    }

    fn apply_outcome(
        &self,
        name: &str,
        critical: bool,
        result: Result<(), AppError>,
    ) -> Option<Notification> {
        let now = Utc::now();
        let mut inner = self.lock_inner();
        let status = inner.statuses.get_mut(name)?;

        match result {
            Ok(()) => {
                let was_unhealthy = !status.healthy;
                status.healthy = true;
                status.consecutive_failures = 0;
                status.last_check = Some(now);
                status.last_success = Some(now);
                status.error = None;

                if was_unhealthy {
                    tracing::info!(check = %name, "Health check recovered");
                    if let Some(check) = inner.checks.get_mut(name) {
                        if check.alerted {
                            check.alerted = false;
                            // Surface the recovery only because the failure
                            // itself was surfaced.
                            return Some(Notification::new(
                                format!("{name} is healthy again"),
                                "The previously failing check has recovered.",
                                Severity::Info,
                            ));
                        }
                    }
                }
                None
            }
            Err(e) => {
                status.healthy = false;
                status.consecutive_failures += 1;
                status.last_check = Some(now);
                status.last_failure = Some(now);
                status.error = Some(e.to_string());
                let failures = status.consecutive_failures;

                if failures <= DETAILED_FAILURE_LOG_LIMIT {
                    tracing::warn!(
                        check = %name,
                        consecutive_failures = failures,
                        error = %e,
                        "Health check failed",
                    );
                }

                if critical && failures == self.alert_threshold {
                    if let Some(check) = inner.checks.get_mut(name) {
                        check.alerted = true;
                    }
                    return Some(
                        Notification::new(
                            format!("{name} is not responding"),
                            format!(
                                "The check has failed {failures} times in a row: {e}. \
                                 Automated recovery will be attempted."
                            ),
                            Severity::Critical,
                        )
                        .with_action("retry", "Retry now")
                        .with_action("dismiss", "Dismiss"),
                    );
                }
                None
            }
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, MonitorInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cancellation handle returned by [`HealthMonitor::subscribe`]. Holds only
/// a weak back-reference so a forgotten handle never keeps the monitor
/// alive.
pub struct HealthSubscription {
    id: u64,
    monitor: Weak<HealthMonitor>,
}

impl HealthSubscription {
    pub fn cancel(self) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.lock_inner().subscribers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, n: Notification) {
            self.sent.lock().unwrap().push(n);
        }
    }

    fn config() -> HealthConfig {
        HealthConfig {
            probe_timeout_secs: 10,
            alert_threshold: 3,
            default_interval_secs: 10,
        }
    }

    fn flaky_probe(
        calls: Arc<AtomicU32>,
        ok: Arc<AtomicBool>,
    ) -> impl Fn() -> BoxFuture<'static, Result<(), AppError>> + Send + Sync + 'static {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let ok = ok.load(Ordering::SeqCst);
            Box::pin(async move {
                if ok {
                    Ok(())
                } else {
                    Err(AppError::Connect("refused".into()))
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_runs_probe_immediately() {
        let notifier = RecordingNotifier::new();
        let monitor = HealthMonitor::new(&config(), notifier);
        let calls = Arc::new(AtomicU32::new(0));
        let ok = Arc::new(AtomicBool::new(true));
        monitor.register(HealthCheck::new(
            "daemon",
            Duration::from_secs(10),
            true,
            {
                let probe = flaky_probe(calls.clone(), ok);
                move || probe()
            },
        ));

        // Let the spawned loop run its first probe; no interval has elapsed.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let status = monitor.status("daemon").unwrap();
        assert!(status.healthy);
        assert!(status.last_success.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_reruns_and_streak_reset() {
        let notifier = RecordingNotifier::new();
        let monitor = HealthMonitor::new(&config(), notifier);
        let calls = Arc::new(AtomicU32::new(0));
        let ok = Arc::new(AtomicBool::new(false));
        monitor.register(HealthCheck::new("daemon", Duration::from_secs(10), false, {
            let probe = flaky_probe(calls.clone(), ok.clone());
            move || probe()
        }));

        tokio::time::sleep(Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_secs(21)).await;
        let status = monitor.status("daemon").unwrap();
        assert!(!status.healthy);
        assert_eq!(status.consecutive_failures, 3);
        assert!(status.error.is_some());

        // First success after any number of failures resets the streak.
        ok.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let status = monitor.status("daemon").unwrap();
        assert!(status.healthy);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_alert_fires_exactly_once_at_threshold() {
        let notifier = RecordingNotifier::new();
        let monitor = HealthMonitor::new(&config(), notifier.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let ok = Arc::new(AtomicBool::new(false));
        monitor.register(HealthCheck::new("daemon", Duration::from_secs(10), true, {
            let probe = flaky_probe(calls.clone(), ok.clone());
            move || probe()
        }));

        // Runs 1 and 2: below threshold, silent.
        tokio::time::sleep(Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(notifier.sent().is_empty());

        // Run 3: threshold reached, exactly one critical alert.
        tokio::time::sleep(Duration::from_secs(10)).await;
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, Severity::Critical);
        assert!(!sent[0].actions.is_empty());

        // Runs 4 and 5: no re-fire.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_surfaced_only_after_alert() {
        let notifier = RecordingNotifier::new();
        let monitor = HealthMonitor::new(&config(), notifier.clone());
        let ok = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicU32::new(0));
        monitor.register(HealthCheck::new("daemon", Duration::from_secs(10), true, {
            let probe = flaky_probe(calls, ok.clone());
            move || probe()
        }));

        // Fail once, then recover: no alert fired, so no recovery notice.
        tokio::time::sleep(Duration::from_millis(1)).await;
        ok.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(notifier.sent().is_empty());

        // Fail to threshold, then recover: alert plus one recovery notice.
        ok.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        ok.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let sent = notifier.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].severity, Severity::Critical);
        assert_eq!(sent[1].severity, Severity::Info);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        let notifier = RecordingNotifier::new();
        let monitor = HealthMonitor::new(&config(), notifier);
        monitor.register(HealthCheck::new(
            "slow",
            Duration::from_secs(60),
            false,
            || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            },
        ));

        // The run itself takes probe_timeout before it is counted.
        tokio::time::sleep(Duration::from_secs(11)).await;
        let status = monitor.status("slow").unwrap();
        assert!(!status.healthy);
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_immediate_snapshot_and_cancel() {
        let notifier = RecordingNotifier::new();
        let monitor = HealthMonitor::new(&config(), notifier);
        let ok = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicU32::new(0));
        monitor.register(HealthCheck::new("daemon", Duration::from_secs(10), false, {
            let probe = flaky_probe(calls, ok);
            move || probe()
        }));
        tokio::time::sleep(Duration::from_millis(1)).await;

        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = seen.clone();
        let sub = monitor.subscribe(move |snapshot| {
            assert!(snapshot.contains_key("daemon"));
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        // Immediate push on subscribe
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let after_run = seen.load(Ordering::SeqCst);
        assert!(after_run >= 2);

        sub.cancel();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), after_run);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_stops_schedule_and_drops_status() {
        let notifier = RecordingNotifier::new();
        let monitor = HealthMonitor::new(&config(), notifier);
        let calls = Arc::new(AtomicU32::new(0));
        let ok = Arc::new(AtomicBool::new(true));
        monitor.register(HealthCheck::new("daemon", Duration::from_secs(10), false, {
            let probe = flaky_probe(calls.clone(), ok);
            move || probe()
        }));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        monitor.unregister("daemon");
        // Repeated unregister is a no-op
        monitor.unregister("daemon");
        assert!(monitor.status("daemon").is_none());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_all_checks_is_out_of_band() {
        let notifier = RecordingNotifier::new();
        let monitor = HealthMonitor::new(&config(), notifier);
        let calls = Arc::new(AtomicU32::new(0));
        let ok = Arc::new(AtomicBool::new(true));
        monitor.register(HealthCheck::new("daemon", Duration::from_secs(60), false, {
            let probe = flaky_probe(calls.clone(), ok);
            move || probe()
        }));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        monitor.run_all_checks().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_aggregates() {
        let notifier = RecordingNotifier::new();
        let monitor = HealthMonitor::new(&config(), notifier);
        let ok = Arc::new(AtomicBool::new(true));
        let bad = Arc::new(AtomicBool::new(false));
        monitor.register(HealthCheck::new("api", Duration::from_secs(60), true, {
            let probe = flaky_probe(Arc::new(AtomicU32::new(0)), ok);
            move || probe()
        }));
        monitor.register(HealthCheck::new("events", Duration::from_secs(60), false, {
            let probe = flaky_probe(Arc::new(AtomicU32::new(0)), bad);
            move || probe()
        }));
        tokio::time::sleep(Duration::from_millis(1)).await;

        let summary = monitor.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.unhealthy, vec!["events".to_string()]);
        assert!(!summary.all_healthy);
        // The failing check is non-critical
        assert!(summary.critical_healthy);
        assert!(!monitor.is_healthy());
        assert!(monitor.is_critical_healthy());
    }
}
