use encoder_api::{CollaboratorError, ErrorKind};

/// Errors of the lifecycle surface (create / delete / list).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("stream '{0}' already exists")]
    Conflict(String),

    #[error("stream '{0}' not found")]
    NotFound(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StreamError {
    /// Map a collaborator failure for stream `uid` onto the lifecycle taxonomy.
    ///
    /// `Rejected` has no caller-facing counterpart and becomes `Internal`.
    pub fn from_collaborator(uid: &str, err: CollaboratorError) -> Self {
        match err.kind() {
            ErrorKind::Conflict => StreamError::Conflict(uid.to_string()),
            ErrorKind::NotFound => StreamError::NotFound(uid.to_string()),
            ErrorKind::Unavailable => StreamError::Unavailable(err.message().to_string()),
            ErrorKind::Rejected | ErrorKind::Internal => {
                StreamError::Internal(err.message().to_string())
            }
        }
    }
}

/// Errors of engine construction and orchestration.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("component '{component}' failed to start: {source}")]
    Start {
        component: String,
        source: CollaboratorError,
    },

    #[error("recovery: {0}")]
    Recovery(#[from] StreamError),

    #[error("metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Add context to the error.
    ///
    /// For `Start`, context is added to the inner `CollaboratorError`.
    /// For `Config`, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Start { component, source } => EngineError::Start {
                component,
                source: source.with_context(ctx),
            },
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}
