/// Result alias that carries the custom [`RepCounterError`] type.
pub type Result<T> = std::result::Result<T, RepCounterError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum RepCounterError {
    /// A session was requested for an exercise that is not in the registry.
    #[error("unknown exercise `{0}`")]
    UnknownExercise(String),
    /// The landmark source could not be opened or read.
    #[error("landmark source unavailable after {attempts} attempt(s): {reason}")]
    SourceUnavailable { attempts: u32, reason: String },
    /// A rule in the static table failed validation while the registry loaded.
    #[error("invalid rule for `{exercise}`: {reason}")]
    InvalidRule { exercise: String, reason: String },
    /// A session log record could not be written. Never fatal to a session.
    #[error("session log write failed: {0}")]
    LogWrite(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl RepCounterError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Shorthand for a single failed attempt at reaching a landmark source.
    pub fn source_unavailable<T: Into<String>>(reason: T) -> Self {
        Self::SourceUnavailable {
            attempts: 1,
            reason: reason.into(),
        }
    }
}

impl From<&str> for RepCounterError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for RepCounterError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
