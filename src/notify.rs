use serde::Serialize;

/// Notification severity, mirrored by the UI's toast styling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Optional action attached to a notification (e.g. "Retry", "Dismiss").
/// The id round-trips back through the shell when the user clicks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationAction {
    pub id: String,
    pub label: String,
}

/// A user-visible notification. The core never renders these itself; the
/// shell decides between a toast, a native OS notification, or both.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<NotificationAction>,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            severity,
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, id: impl Into<String>, label: impl Into<String>) -> Self {
        self.actions.push(NotificationAction {
            id: id.into(),
            label: label.into(),
        });
        self
    }
}

/// Sink for user-visible notifications, implemented by the UI shell.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Tracing-backed notifier for headless runs and tests.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: Notification) {
        match n.severity {
            Severity::Critical => tracing::error!(title = %n.title, "{}", n.body),
            Severity::Warning => tracing::warn!(title = %n.title, "{}", n.body),
            Severity::Info => tracing::info!(title = %n.title, "{}", n.body),
        }
    }
}
