//! Event dispatcher: the long-poll consumer of the daemon's event stream.
//!
//! One loop, one cursor. Every event invalidates its cache tags
//! unconditionally; user-visible notifications go through the per-subject
//! cooldown so an event storm (a flapping device, a folder rescanning in a
//! tight loop) cannot flood the user. Expected long-poll noise (client
//! timeout, aborted request, truncated body) is treated the same as an
//! empty batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::daemon::DaemonAdapter;
use crate::engine::cooldown::NotificationCooldown;
use crate::events::{CacheSink, DaemonEvent, EventClass};
use crate::notify::{Notification, Notifier, Severity};

/// The cooldown map is pruned after this many processed events.
const PRUNE_EVERY: u64 = 256;

pub struct EventDispatcher {
    adapter: Arc<dyn DaemonAdapter>,
    cache: Arc<dyn CacheSink>,
    notifier: Arc<dyn Notifier>,
    config: DispatchConfig,
    cooldown: NotificationCooldown,
    /// Highest event id consumed so far; the next poll asks for events
    /// strictly after it.
    cursor: AtomicU64,
    processed: AtomicU64,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    pub fn new(
        adapter: Arc<dyn DaemonAdapter>,
        cache: Arc<dyn CacheSink>,
        notifier: Arc<dyn Notifier>,
        config: DispatchConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            cache,
            notifier,
            config,
            cooldown: NotificationCooldown::new(),
            cursor: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Start the long-poll loop. Idempotent while running; a dispatcher that
    /// was shut down stays shut down.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) || self.cancel.is_cancelled() {
            return;
        }
        let dispatcher = Arc::clone(self);
        tracing::info!(
            poll_limit = self.config.poll_limit,
            poll_timeout_secs = self.config.poll_timeout_secs,
            "Event dispatcher started",
        );
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatcher.cancel.cancelled() => break,
                    _ = dispatcher.poll_once() => {}
                }
            }
            tracing::info!("Event dispatcher stopped");
        }));
    }

    /// Stop the loop. Idempotent; in-flight long-polls are abandoned.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }

    /// Highest event id consumed so far, for the diagnostics panel.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    async fn poll_once(&self) {
        let since = self.cursor.load(Ordering::SeqCst);
        let result = self
            .adapter
            .poll_events(since, self.config.poll_limit, self.config.poll_timeout_secs)
            .await;

        match result {
            Ok(events) if events.is_empty() => self.idle_delay().await,
            Ok(events) => self.process_batch(events),
            Err(e) if e.is_idle_poll_noise() => {
                tracing::debug!(error = %e, "Event poll returned expected noise");
                self.idle_delay().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, since, "Event poll failed");
                self.idle_delay().await;
            }
        }
    }

    /// Process one batch in ascending id order. Events at or below the
    /// cursor are duplicates from a retried poll and are skipped.
    fn process_batch(&self, mut events: Vec<DaemonEvent>) {
        events.sort_by_key(|e| e.id);
        tracing::debug!(count = events.len(), "Processing event batch");

        for event in events {
            if event.id <= self.cursor.load(Ordering::SeqCst) && event.id != 0 {
                continue;
            }
            self.cursor.fetch_max(event.id, Ordering::SeqCst);

            let class = event.class();
            // Invalidation is never suppressed; the UI must not go stale
            // just because the user was already notified.
            self.cache.invalidate(class.cache_tags());

            if class.notifies() {
                let subject = event.subject_id();
                let window = class.cooldown(&self.config);
                if self.cooldown.check_and_arm(&subject, class, window) {
                    self.notifier.notify(notification_for(class, &subject));
                }
            }

            let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
            if processed % PRUNE_EVERY == 0 {
                self.cooldown.prune(self.max_cooldown());
            }
        }
    }

    fn max_cooldown(&self) -> Duration {
        let secs = self
            .config
            .device_cooldown_secs
            .max(self.config.folder_cooldown_secs)
            .max(self.config.config_cooldown_secs)
            .max(self.config.pending_cooldown_secs);
        Duration::from_secs(secs)
    }

    async fn idle_delay(&self) {
        tokio::time::sleep(Duration::from_millis(self.config.idle_delay_ms)).await;
    }
}

fn notification_for(class: EventClass, subject: &str) -> Notification {
    match class {
        EventClass::DeviceConnected => Notification::new(
            "Device connected",
            format!("{subject} is now connected."),
            Severity::Info,
        ),
        EventClass::DeviceDisconnected => Notification::new(
            "Device disconnected",
            format!("{subject} has disconnected."),
            Severity::Info,
        ),
        EventClass::FolderCompletion => Notification::new(
            "Folder up to date",
            format!("{subject} has finished syncing."),
            Severity::Info,
        ),
        EventClass::FolderErrors => Notification::new(
            "Folder sync errors",
            format!("{subject} has items that failed to sync."),
            Severity::Warning,
        ),
        EventClass::ConfigSaved => Notification::new(
            "Configuration updated",
            "The daemon configuration has changed.",
            Severity::Info,
        ),
        EventClass::PendingDevices => Notification::new(
            "New device request",
            format!("{subject} wants to connect."),
            Severity::Info,
        )
        .with_action("review-devices", "Review"),
        EventClass::PendingFolders => Notification::new(
            "New folder shared",
            format!("A remote device shared {subject}."),
            Severity::Info,
        )
        .with_action("review-folders", "Review"),
        // notifies() filters these out before we get here
        EventClass::StateChanged | EventClass::Other => Notification::new(
            "Sync activity",
            format!("Activity on {subject}."),
            Severity::Info,
        ),
    }
}
