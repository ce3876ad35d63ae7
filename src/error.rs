/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file error.rs
 * @brief HybridDB error handling
 */

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Duplicate key in collection '{collection}': {key}")]
    DuplicateKey { collection: String, key: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid collection name: {0}")]
    InvalidCollectionName(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store access is disabled during the build phase")]
    BuildPhase,
}

impl StoreError {
    /// Connection-class failures mean the store itself is unreachable, as
    /// opposed to a bad request against a healthy store.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

fn caused_by_io(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cause = Some(err);
    while let Some(current) = cause {
        if current.is::<std::io::Error>() {
            return true;
        }
        cause = current.source();
    }
    false
}

// Conversion and protocol errors carry no DB error either, but the session
// is still usable, so only a dead socket counts as a connection failure.
impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() || caused_by_io(&err) {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        StoreError::Connection(format!("Failed to get connection from pool: {}", err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<bson::extjson::de::Error> for StoreError {
    fn from(err: bson::extjson::de::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum HybridError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Secondary connection error: {0}")]
    SecondaryConnection(String),

    #[error("Replication error in collection '{collection}': {source}")]
    Replication {
        collection: String,
        #[source]
        source: StoreError,
    },

    #[error("Primary operation failed: {0}")]
    Primary(#[from] StoreError),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<config::ConfigError> for HybridError {
    fn from(err: config::ConfigError) -> Self {
        HybridError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HybridError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors_are_classified() {
        assert!(StoreError::Connection("refused".into()).is_connection());
        assert!(!StoreError::Backend("syntax".into()).is_connection());
        assert!(!StoreError::BuildPhase.is_connection());
    }

    #[derive(Debug)]
    struct Wrapped(Box<dyn std::error::Error + 'static>);

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "wrapped: {}", self.0)
        }
    }

    impl std::error::Error for Wrapped {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(self.0.as_ref())
        }
    }

    #[test]
    fn test_only_io_causes_count_as_connection() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(caused_by_io(&Wrapped(Box::new(reset))));
        assert!(caused_by_io(&Wrapped(Box::new(Wrapped(Box::new(std::io::Error::from(
            std::io::ErrorKind::BrokenPipe
        )))))));

        let conversion: Box<dyn std::error::Error> = "cannot convert jsonb to i64".into();
        assert!(!caused_by_io(&Wrapped(conversion)));
        assert!(!caused_by_io(&std::fmt::Error));
    }

    #[test]
    fn test_primary_error_keeps_store_message() {
        let err: HybridError = StoreError::DuplicateKey {
            collection: "users".into(),
            key: "42".into(),
        }
        .into();
        let message = err.to_string();
        assert!(message.contains("Primary operation failed"));
        assert!(message.contains("users"));
    }
}
