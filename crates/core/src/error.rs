pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure of a dynamic field-path access. These are programmer errors (the
/// document does not have the assumed shape) and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("empty field path")]
    Empty,
    #[error("malformed field path {path:?}")]
    Malformed { path: String },
    #[error("field {path} not found")]
    NotFound { path: String },
    #[error("field {path} is a {found}, expected {expected}")]
    TypeMismatch { path: String, expected: &'static str, found: &'static str },
    #[error("cannot descend into {path}: it is a {found}")]
    NotContainer { path: String, found: &'static str },
    #[error("index {index} out of bounds at {path} (len {len})")]
    IndexOutOfBounds { path: String, index: usize, len: usize },
    #[error("refusing to create sequence at {path}; set the sequence as a whole")]
    ImplicitSequence { path: String },
}

/// Everything that can go wrong talking to the control plane or running the
/// update protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },
    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: String, name: String },
    /// The supplied resourceVersion is stale: another writer got there first.
    #[error("conflict updating {kind} {name:?}: {message}")]
    Conflict { kind: String, name: String, message: String },
    #[error("gave up updating {name:?} after {attempts} conflicting attempts")]
    RetryExhausted { name: String, attempts: u32 },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("mutation changed resourceVersion of {name:?} ({before:?} -> {after:?})")]
    VersionTampered { name: String, before: Option<String>, after: Option<String> },
    #[error("codec: {0}")]
    Codec(String),
    #[error("api error {code} {reason}: {message}")]
    Api { code: u16, reason: String, message: String },
    #[error("invalid: {0}")]
    Invalid(String),
}

impl Error {
    pub fn is_conflict(&self) -> bool { matches!(self, Error::Conflict { .. }) }

    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound { .. }) }

    /// Short, stable name of the failure kind for logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NotFound",
            Error::AlreadyExists { .. } => "AlreadyExists",
            Error::Conflict { .. } => "Conflict",
            Error::RetryExhausted { .. } => "RetryExhausted",
            Error::Unauthorized(_) => "Unauthorized",
            Error::Timeout(_) => "Timeout",
            Error::Connection(_) => "ConnectionError",
            Error::Cancelled => "Cancelled",
            Error::Path(_) => "PathError",
            Error::VersionTampered { .. } => "VersionTampered",
            Error::Codec(_) => "Codec",
            Error::Api { .. } => "Api",
            Error::Invalid(_) => "Invalid",
        }
    }

    /// Process exit status for a CLI that surfaces this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotFound { .. } => 3,
            Error::AlreadyExists { .. } => 4,
            Error::Conflict { .. } | Error::RetryExhausted { .. } => 5,
            Error::Unauthorized(_) => 6,
            Error::Timeout(_) | Error::Connection(_) => 7,
            Error::Path(_) | Error::VersionTampered { .. } => 8,
            Error::Cancelled => 130,
            Error::Codec(_) | Error::Api { .. } | Error::Invalid(_) => 1,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Error::Codec(e.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_nonzero_and_group_retryable_kinds() {
        let conflict = Error::Conflict { kind: "StatefulSet".into(), name: "a".into(), message: "stale".into() };
        let exhausted = Error::RetryExhausted { name: "a".into(), attempts: 5 };
        assert!(conflict.is_conflict());
        assert!(!exhausted.is_conflict());
        assert_eq!(conflict.exit_code(), exhausted.exit_code());
        assert_ne!(exhausted.kind(), conflict.kind());
        assert_eq!(Error::Cancelled.exit_code(), 130);
        assert_eq!(Error::from(PathError::Empty).kind(), "PathError");
        assert!(Error::Invalid("x".into()).exit_code() != 0);
    }

    #[test]
    fn messages_name_the_object() {
        let e = Error::NotFound { kind: "StatefulSet".into(), name: "book-server".into() };
        assert_eq!(e.to_string(), "StatefulSet \"book-server\" not found");
    }
}
