use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    BsonDeError(bson::de::Error),
    BsonSerError(bson::ser::Error),
    InvalidRequest(String),
    NoQueryPlan(String),
    ResourceExhausted(String),
    WriteConflict(String),
    Interrupted(String),
    QueryPlanKilled(String),
    UnexpectedError(String),
    DuplicateKey { index_name: String, key: String },
    CollectionNotFound { name: String },
    IndexNotFound { collection_name: String, index_name: String },
    IndexAlreadyExists { collection_name: String, index_name: String },
}

/// Coarse classification of errors, allowing callers to decide between
/// fixing the request and retrying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    PlanningFailure,
    ResourceExhausted,
    WriteConflict,
    Interrupted,
    QueryPlanKilled,
    NotFound,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRequest(_)
            | Error::BsonDeError(_)
            | Error::BsonSerError(_)
            | Error::DuplicateKey { .. }
            | Error::IndexAlreadyExists { .. } => ErrorKind::Validation,
            Error::NoQueryPlan(_) => ErrorKind::PlanningFailure,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::WriteConflict(_) => ErrorKind::WriteConflict,
            Error::Interrupted(_) => ErrorKind::Interrupted,
            Error::QueryPlanKilled(_) => ErrorKind::QueryPlanKilled,
            Error::CollectionNotFound { .. } | Error::IndexNotFound { .. } => ErrorKind::NotFound,
            Error::Io(_) | Error::UnexpectedError(_) => ErrorKind::Internal,
        }
    }

    /// Stable numeric code reported to callers.
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidRequest(_) => 2,
            Error::BsonDeError(_) | Error::BsonSerError(_) => 22,
            Error::DuplicateKey { .. } => 11000,
            Error::IndexAlreadyExists { .. } => 68,
            Error::NoQueryPlan(_) => 291,
            Error::ResourceExhausted(_) => 292,
            Error::WriteConflict(_) => 112,
            Error::Interrupted(_) => 11601,
            Error::QueryPlanKilled(_) => 175,
            Error::CollectionNotFound { .. } => 26,
            Error::IndexNotFound { .. } => 27,
            Error::Io(_) => 1001,
            Error::UnexpectedError(_) => 1,
        }
    }

    /// Returns `true` if retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::WriteConflict | ErrorKind::ResourceExhausted)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{}", e),
            Error::BsonSerError(e) => write!(f, "{}", e),
            Error::BsonDeError(e) => write!(f, "{}", e),
            Error::InvalidRequest(reason)
            | Error::UnexpectedError(reason) => write!(f, "{}", reason),
            Error::NoQueryPlan(reason) => write!(f, "No query solutions: {}", reason),
            Error::ResourceExhausted(reason) => write!(f, "Resource exhausted: {}", reason),
            Error::WriteConflict(reason) => write!(f, "Write conflict: {}", reason),
            Error::Interrupted(reason) => write!(f, "Operation interrupted: {}", reason),
            Error::QueryPlanKilled(reason) => write!(f, "Query plan killed: {}", reason),
            Error::DuplicateKey { index_name, key } => {
                write!(f, "E11000 duplicate key error index: {} dup key: {}", index_name, key)
            }
            Error::CollectionNotFound { name } => {
                write!(f, "Collection does not exist: {}", name)
            }
            Error::IndexNotFound { collection_name, index_name } => {
                write!(f, "Index does not exist: {}.{}", collection_name, index_name)
            }
            Error::IndexAlreadyExists { collection_name, index_name } => {
                write!(f, "Index already exists with a different definition: {}.{}", collection_name, index_name)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<bson::de::Error> for Error {
    fn from(err: bson::de::Error) -> Self {
        Error::BsonDeError(err)
    }
}

impl From<bson::ser::Error> for Error {
    fn from(err: bson::ser::Error) -> Self {
        Error::BsonSerError(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_separate_retryable_errors() {
        assert!(Error::WriteConflict("x".into()).is_retryable());
        assert!(Error::ResourceExhausted("x".into()).is_retryable());
        assert!(!Error::InvalidRequest("x".into()).is_retryable());
        assert_eq!(Error::NoQueryPlan("x".into()).kind(), ErrorKind::PlanningFailure);
    }

    #[test]
    fn test_display() {
        let err = Error::IndexNotFound { collection_name: "c".into(), index_name: "a_1".into() };
        assert_eq!(err.to_string(), "Index does not exist: c.a_1");
        assert_eq!(err.code(), 27);
    }
}
