//! Typed error model: the open error-code sum, the normalized error record,
//! and the concrete failure types the built-in classification rules recognize.

use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Raw failure type produced by tasks. Boxed so `?` works with any error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared handle to a raw failure, kept on normalized errors as `cause`/`raw`.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Error code carried by every [`TypedError`].
///
/// Built-in codes are stable strings; user rules may introduce new codes via
/// [`ErrorCode::custom`]. Equality and hashing go through the string tag, so
/// `ErrorCode::custom("TIMEOUT") == ErrorCode::Timeout`.
#[derive(Debug, Clone)]
pub enum ErrorCode {
    /// The call was cancelled by the caller's signal.
    Aborted,
    /// A per-attempt timeout fired.
    Timeout,
    /// Connection-level failure (reset, refused, DNS, ...).
    Network,
    /// An HTTP response with status >= 400.
    Http,
    /// The circuit breaker rejected the call without running the task.
    CircuitOpen,
    /// Input validation failure; never retried.
    Validation,
    /// Fallback for anything no rule classified.
    Unknown,
    /// A caller-defined code introduced by a custom rule.
    Custom(Cow<'static, str>),
}

impl ErrorCode {
    /// Wrap a caller-defined code.
    pub fn custom(code: impl Into<Cow<'static, str>>) -> Self {
        ErrorCode::Custom(code.into())
    }

    /// The stable string tag for this code.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Network => "NETWORK",
            ErrorCode::Http => "HTTP",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::Custom(code) => code,
        }
    }

    /// Default retryability per the classification table. HTTP retryability
    /// depends on the status: 5xx and 429 retry, other 4xx do not.
    pub fn default_retryable(&self, status: Option<u16>) -> bool {
        match self {
            ErrorCode::Timeout | ErrorCode::Network | ErrorCode::Unknown => true,
            ErrorCode::Aborted | ErrorCode::CircuitOpen | ErrorCode::Validation => false,
            ErrorCode::Http => status.map(|s| s >= 500 || s == 429).unwrap_or(false),
            ErrorCode::Custom(_) => true,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq for ErrorCode {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for ErrorCode {}

impl Hash for ErrorCode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

/// A normalized failure: what every raw error becomes before it reaches a
/// hook or a result.
#[derive(Debug, Clone)]
pub struct TypedError {
    /// Classification code; open set, see [`ErrorCode`].
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Open structured metadata attached by rules.
    pub meta: Option<serde_json::Value>,
    /// HTTP status, when the failure carries one.
    pub status: Option<u16>,
    /// Whether the retry loop may re-attempt after this failure. The
    /// engine's retry decision may still be overridden by `should_retry`.
    pub retryable: bool,
    /// Underlying source error, when known.
    pub cause: Option<SharedError>,
    /// The raw value as originally produced by the task.
    pub raw: Option<SharedError>,
    /// Optional field path, for validation-style failures.
    pub path: Option<String>,
    /// Optional short title for diagnostic UI.
    pub title: Option<String>,
    /// When this record was constructed.
    pub timestamp: SystemTime,
}

impl TypedError {
    /// Construct an error with the given code and message; everything else
    /// defaults (retryability from the code's classification table).
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.default_retryable(None);
        Self {
            code,
            message: message.into(),
            meta: None,
            status: None,
            retryable,
            cause: None,
            raw: None,
            path: None,
            title: None,
            timestamp: SystemTime::now(),
        }
    }

    /// Attach structured metadata.
    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Attach an HTTP status and recompute default retryability for it.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self.retryable = self.code.default_retryable(Some(status));
        self
    }

    /// Override retryability.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attach the underlying source error.
    pub fn with_cause(mut self, cause: SharedError) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Attach the raw value as originally produced.
    pub fn with_raw(mut self, raw: SharedError) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Attach a field path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach a short title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.code == ErrorCode::Aborted
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::Timeout
    }

    pub fn is_circuit_open(&self) -> bool {
        self.code == ErrorCode::CircuitOpen
    }
}

impl fmt::Display for TypedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for TypedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .or(self.raw.as_deref())
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Synthetic error used when a call is cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbortError;

impl AbortError {
    pub fn new() -> Self {
        AbortError
    }
}

impl fmt::Display for AbortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation aborted")
    }
}

impl std::error::Error for AbortError {}

/// Synthetic error produced when a per-attempt timeout fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutError {
    /// Time the attempt had been running when the timer fired.
    pub elapsed: Duration,
    /// The configured per-attempt limit.
    pub timeout: Duration,
}

impl TimeoutError {
    pub fn new(elapsed: Duration, timeout: Duration) -> Self {
        Self { elapsed, timeout }
    }
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation timed out after {:?} (limit: {:?})", self.elapsed, self.timeout)
    }
}

impl std::error::Error for TimeoutError {}

/// An HTTP failure carrying a status code, recognized by the built-in
/// `http` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    pub status: u16,
    pub message: String,
}

impl HttpError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {}: {}", self.status, self.message)
    }
}

impl std::error::Error for HttpError {}
