// ── Chatvend Atoms: Error Types ────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Infrastructure variants are coarse-grained by domain (I/O, DB, cache,
//     network); business outcomes get their own variants because use-cases
//     and the Telegram layer branch on them.
//   • `#[from]` wires std/external conversions; repositories are the only
//     layer allowed to surface `rusqlite::Error`, and they do so through
//     the `Database` variant so driver types never cross a port.
//   • No variant carries secret material (API keys, tokens) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Cache (Redis or in-memory) failure. Callers are expected to treat
    /// this as soft wherever the store is authoritative.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Service configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller passed something that can never be valid.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Aggregate lookup miss; the payload names the aggregate ("user",
    /// "plan", "payment", "activation code", ...).
    #[error("{0} not found")]
    NotFound(&'static str),

    /// User already has an active chat session.
    #[error("an active chat session already exists")]
    ActiveChatExists,

    /// User already holds a reserved subscription for another plan.
    #[error("a reserved subscription already exists")]
    AlreadyHasReserved,

    /// Plan delete guard: an active or reserved subscription references it.
    #[error("plan is referenced by an active or reserved subscription")]
    SubscriptionWithActiveUser,

    /// No active subscription for the user.
    #[error("no active subscription")]
    NoActiveSubscription,

    /// The active subscription's period has ended.
    #[error("subscription expired")]
    ExpiredSubscription,

    /// Credit balance cannot cover the requested debit.
    #[error("insufficient balance: required {required} micros, remaining {remaining}")]
    InsufficientBalance { required: i64, remaining: i64 },

    /// Requested model is not in the plan's supported set or has no
    /// active pricing row.
    #[error("model not available: {0}")]
    ModelNotAvailable(String),

    /// AES-GCM encryption failure (key setup, never data-dependent).
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Ciphertext failed authentication or was truncated. Never carries
    /// partial plaintext.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Payment gateway HTTP or API-level failure.
    #[error("gateway error: {provider}: {message}")]
    Gateway { provider: String, message: String },

    /// LLM provider HTTP or API-level failure.
    #[error("provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    /// An AI job carries neither a stored message id nor inline text.
    #[error("ai job {0} has no message to process")]
    JobWithoutMessage(String),

    /// A conditional write matched no row (lost race, bad prior state).
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// Catch-all. Prefer adding a specific variant over using this in
    /// new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a gateway error with provider name and message.
    pub fn gateway(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Gateway { provider: provider.into(), message: message.into() }
    }

    /// Create an LLM provider error with provider name and message.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider { provider: provider.into(), message: message.into() }
    }

    /// Whether the AI job worker may retry after this error. Resource
    /// outcomes (balance, subscription) are terminal; external call
    /// failures are transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Network(_)
                | EngineError::Provider { .. }
                | EngineError::Gateway { .. }
                | EngineError::Cache(_)
        )
    }
}

// ── Migration bridge: String → EngineError ─────────────────────────────────
// Allows `?` and `.into()` on ad-hoc failure strings in leaf helpers.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;
