//! Error taxonomy for the access layer.
//!
//! Backends map their native failures onto [`StoreError`]; the retry governor
//! only ever looks at [`StoreError::class`], never at backend-specific codes.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type StoreResult<T> = Result<T, StoreError>;

/// How the retry governor treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Quota or rate limit hit; retried with a 5x backoff penalty.
    ResourceExhausted,
    /// Backend unreachable; retried with plain exponential backoff.
    Unavailable,
    /// Everything else; never retried.
    Permanent,
}

impl ErrorClass {
    /// Classify a backend status code or message.
    ///
    /// Accepts gRPC-style codes (`resource-exhausted`, `unavailable`) as well as
    /// the free-text messages hosted stores return when a service is down.
    pub fn from_code(code: &str) -> Self {
        let lower = code.to_ascii_lowercase();
        if lower.contains("resource-exhausted")
            || lower.contains("resource_exhausted")
            || lower.contains("quota")
        {
            ErrorClass::ResourceExhausted
        } else if lower.contains("unavailable") || lower.contains("not available") {
            ErrorClass::Unavailable
        } else {
            ErrorClass::Permanent
        }
    }

    pub fn is_transient(self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::ResourceExhausted => write!(f, "resource-exhausted"),
            ErrorClass::Unavailable => write!(f, "unavailable"),
            ErrorClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Access-layer errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Missing or unusable credentials.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Quota exhaustion or unavailability, surfaced after the retry budget is spent.
    #[error("Transient store error ({class}): {message}")]
    Transient { class: ErrorClass, message: String },

    /// The backend refused the operation.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Payload cannot be turned into a document (not an object, no id).
    #[error("Invalid document for [{collection}]: {reason}")]
    InvalidDocument { collection: String, reason: String },

    /// The connector already holds an initialized app.
    #[error("App already initialized: {0}")]
    DuplicateApp(String),

    /// Storage engine failure.
    #[error("Database error: {0}")]
    Database(String),

    /// LZ4 body could not be decoded.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Stored bytes could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Object storage failure with no usable fallback.
    #[error("Media error: {0}")]
    Media(String),

    /// Chat sender is over the message rate; blocked until `until` (ms since epoch).
    #[error("Rate limited until {until}")]
    RateLimited { until: u64 },

    /// The write queue worker is gone.
    #[error("Write queue closed")]
    Closed,
}

impl StoreError {
    /// Build a transient error from a backend status code.
    ///
    /// Codes that do not classify as transient become [`StoreError::Database`].
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = code.to_ascii_lowercase();
        if lower.contains("permission") {
            return StoreError::Permission(message);
        }
        match ErrorClass::from_code(code) {
            ErrorClass::Permanent => StoreError::Database(message),
            class => StoreError::Transient { class, message },
        }
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        StoreError::Transient {
            class: ErrorClass::ResourceExhausted,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        StoreError::Transient {
            class: ErrorClass::Unavailable,
            message: message.into(),
        }
    }

    pub(crate) fn invalid(collection: &str, reason: impl Into<String>) -> Self {
        StoreError::InvalidDocument {
            collection: collection.to_string(),
            reason: reason.into(),
        }
    }

    /// Retry classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Transient { class, .. } => *class,
            _ => ErrorClass::Permanent,
        }
    }
}

/// Status code for a RocksDB failure, in the vocabulary of [`StoreError::from_code`].
pub fn rocks_status_code(kind: rocksdb::ErrorKind) -> &'static str {
    use rocksdb::ErrorKind;
    match kind {
        ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain => "unavailable",
        ErrorKind::Incomplete | ErrorKind::ShutdownInProgress => "unavailable",
        ErrorKind::InvalidArgument | ErrorKind::NotSupported => "invalid-argument",
        _ => "internal",
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::from_code(rocks_status_code(e.kind()), e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
