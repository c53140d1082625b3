use serde::Serialize;

/// Crate-wide error type. Every fallible function returns `Result<T, AppError>`.
/// Serializes as `{ error, kind }` so the diagnostics panel gets structured
/// error messages instead of raw strings.
///
/// Transport failures are classified into structured variants at the reqwest
/// boundary (see `From<reqwest::Error>`), so downstream code matches on error
/// kinds rather than inspecting message text.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The request exceeded its deadline.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Could not reach the daemon (connection refused, DNS, TLS).
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The request was aborted before completion (shutdown, dropped future).
    #[error("Request aborted")]
    Aborted,

    /// The daemon returned a body we could not decode.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The daemon answered with a non-success HTTP status.
    #[error("Daemon returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// A health probe did not complete within its deadline.
    #[error("Probe timed out after {0}s")]
    ProbeTimeout(u64),

    /// The circuit breaker is open; the call was never attempted.
    #[error("Circuit breaker is open, call rejected")]
    CircuitOpen,

    /// Caller-classified permanent failure; never retried.
    #[error("Non-retryable error: {0}")]
    NonRetryable(String),

    /// All retry attempts were consumed.
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<AppError>,
    },

    #[error("Process error: {0}")]
    Process(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable kind, surfaced to the UI alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Timeout(_) => "timeout",
            AppError::Connect(_) => "connect",
            AppError::Aborted => "aborted",
            AppError::Parse(_) => "parse",
            AppError::Http { .. } => "http",
            AppError::ProbeTimeout(_) => "probe_timeout",
            AppError::CircuitOpen => "circuit_open",
            AppError::NonRetryable(_) => "non_retryable",
            AppError::RetryExhausted { .. } => "retry_exhausted",
            AppError::Process(_) => "process",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serde(_) => "serde",
            AppError::Internal(_) => "internal",
        }
    }

    /// Whether a retry executor may attempt the operation again.
    ///
    /// Server 5xx counts as transient (daemon restarting mid-request);
    /// 4xx does not — the request itself is wrong.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Timeout(_)
            | AppError::Connect(_)
            | AppError::Aborted
            | AppError::ProbeTimeout(_) => true,
            AppError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Expected transport noise on an idle long-poll: the server held the
    /// request open until its timeout, the connection was torn down during
    /// shutdown, or an empty body failed to decode. The dispatcher waits and
    /// polls again without treating these as monitored failures.
    pub fn is_idle_poll_noise(&self) -> bool {
        matches!(
            self,
            AppError::Timeout(_) | AppError::Aborted | AppError::Parse(_)
        )
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AppError::Timeout(e.to_string())
        } else if e.is_connect() {
            AppError::Connect(e.to_string())
        } else if e.is_decode() {
            AppError::Parse(e.to_string())
        } else if e.is_request() {
            AppError::Aborted
        } else if let Some(status) = e.status() {
            AppError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            AppError::Internal(e.to_string())
        }
    }
}

/// The UI consumes errors as `{ error: "...", kind: "..." }`.
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("error", &self.to_string())?;
        s.serialize_field("kind", self.kind())?;
        s.end()
    }
}
