use std::fmt;

/// Category of a collaborator error. The engine maps it onto its own
/// lifecycle taxonomy and decides whether a retry makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The record already exists (duplicate uid).
    Conflict,
    /// The record or subscription does not exist.
    NotFound,
    /// Network or backend fault; transient, may retry.
    Unavailable,
    /// The request was refused for good (bad key, broker refused the filter).
    Rejected,
    /// Unexpected fault inside the collaborator.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Conflict => f.write_str("conflict"),
            ErrorKind::NotFound => f.write_str("not found"),
            ErrorKind::Unavailable => f.write_str("unavailable"),
            ErrorKind::Rejected => f.write_str("rejected"),
            ErrorKind::Internal => f.write_str("internal"),
        }
    }
}

/// Error returned by every collaborator trait method (storage, broker,
/// cipher, datastore).
#[derive(Clone, PartialEq, Eq)]
pub struct CollaboratorError {
    kind: ErrorKind,
    message: String,
}

impl CollaboratorError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, msg)
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rejected, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Add context to the error, preserving the original ErrorKind.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl fmt::Debug for CollaboratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CollaboratorError {}

impl From<std::io::Error> for CollaboratorError {
    fn from(e: std::io::Error) -> Self {
        Self::unavailable(e.to_string())
    }
}
