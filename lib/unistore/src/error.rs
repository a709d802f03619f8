use thiserror::Error;

/// Normalized error for every operation in the pipeline.
///
/// Backend-native failures are converted through `Driver::convert_error`
/// before they surface, so callers only ever see these variants. The
/// `code()`/`status()` accessors give the stable `{message, status, code}`
/// shape other code programs against.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Conditional check failed: {0}")]
    ConditionalCheckFailed(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Validation failed for {table}.{column}: {message}")]
    Validation {
        table: String,
        column: String,
        message: String,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Driver error: {0}")]
    DriverError(String),
}

impl DbError {
    /// Stable string code, independent of the message text.
    pub fn code(&self) -> &'static str {
        match self {
            DbError::NotFound(_) => "NotFound",
            DbError::AlreadyExists(_) => "AlreadyExists",
            DbError::ConditionalCheckFailed(_) => "ConditionalCheckFailed",
            DbError::CapacityExceeded(_) => "CapacityExceeded",
            DbError::ResourceExhausted(_) => "ResourceExhausted",
            DbError::Validation { .. } => "Validation",
            DbError::SerializationError(_) => "Serialization",
            DbError::DriverError(_) => "DriverError",
        }
    }

    /// HTTP-ish numeric status for API layers.
    pub fn status(&self) -> u16 {
        match self {
            DbError::NotFound(_) => 404,
            DbError::AlreadyExists(_) => 409,
            DbError::ConditionalCheckFailed(_) => 412,
            DbError::CapacityExceeded(_) => 429,
            DbError::ResourceExhausted(_) => 503,
            DbError::Validation { .. } => 400,
            DbError::SerializationError(_) => 400,
            DbError::DriverError(_) => 500,
        }
    }

    /// Quiet errors log at debug level instead of error level.
    pub fn is_quiet(&self) -> bool {
        matches!(self, DbError::ConditionalCheckFailed(_))
    }
}

/// Caller policy for suppressing errors and receiving an empty result instead.
#[derive(Debug, Clone, Default)]
pub enum IgnoreError {
    /// Propagate everything.
    #[default]
    None,
    /// Swallow any error.
    All,
    /// Swallow errors whose `code()` is in the list.
    Codes(Vec<String>),
}

impl IgnoreError {
    pub fn matches(&self, err: &DbError) -> bool {
        match self {
            IgnoreError::None => false,
            IgnoreError::All => true,
            IgnoreError::Codes(codes) => codes.iter().any(|c| c == err.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_are_stable() {
        let err = DbError::AlreadyExists("users".into());
        assert_eq!(err.code(), "AlreadyExists");
        assert_eq!(err.status(), 409);
        assert!(!err.is_quiet());

        let err = DbError::ConditionalCheckFailed("users".into());
        assert!(err.is_quiet());
    }

    #[test]
    fn ignore_error_matching() {
        let err = DbError::NotFound("users".into());
        assert!(!IgnoreError::None.matches(&err));
        assert!(IgnoreError::All.matches(&err));
        assert!(IgnoreError::Codes(vec!["NotFound".into()]).matches(&err));
        assert!(!IgnoreError::Codes(vec!["AlreadyExists".into()]).matches(&err));
    }
}
