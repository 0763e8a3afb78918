//! Error types for the Copygram recommendation engine
//!
//! One `thiserror` enum for the whole crate:
//! - Domain variants the recommender recovers from locally (`NotFound`)
//! - Coordination variants the job queue reacts to (`LockContention`)
//! - Upstream variants that are propagated (`Database`, `Store`, `ScoringOracle`)

use std::borrow::Cow;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the recommendation engine
#[derive(Debug, Error)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    #[error("Configuration error: {message}")]
    Config {
        message: Cow<'static, str>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Missing required environment variable: {var}")]
    MissingEnvVar { var: &'static str },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidConfig {
        key: &'static str,
        message: Cow<'static, str>,
    },

    // ========================================================================
    // Database Errors
    // ========================================================================
    #[error("Database error: {message}")]
    Database {
        message: Cow<'static, str>,
        #[source]
        source: Option<sqlx::Error>,
    },

    #[error("Database connection pool exhausted")]
    PoolExhausted,

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound {
        entity_type: &'static str,
        id: String,
    },

    // ========================================================================
    // Recommendation Store / Coordination Errors
    // ========================================================================
    #[error("Recommendation store error: {message}")]
    Store {
        message: Cow<'static, str>,
        #[source]
        source: Option<redis::RedisError>,
    },

    #[error("Batch lock {key} is held by another recomputation")]
    LockContention { key: String },

    // ========================================================================
    // Scoring Oracle Errors
    // ========================================================================
    #[error("Scoring oracle failure: {message}")]
    ScoringOracle {
        message: Cow<'static, str>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // ========================================================================
    // Kafka Errors
    // ========================================================================
    #[error("Kafka error: {message}")]
    Kafka {
        message: Cow<'static, str>,
        #[source]
        source: Option<rdkafka::error::KafkaError>,
    },

    // ========================================================================
    // Serialization Errors
    // ========================================================================
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid data format: {message}")]
    InvalidFormat { message: Cow<'static, str> },

    // ========================================================================
    // Generic Errors
    // ========================================================================
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Internal error")]
    Internal {
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    // ========================================================================
    // Constructors for common error patterns
    // ========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a database error
    pub fn database(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    /// Create a store error
    pub fn store(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Create a Kafka error
    pub fn kafka(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Kafka {
            message: message.into(),
            source: None,
        }
    }

    /// Create a scoring oracle error
    pub fn oracle(message: impl Into<Cow<'static, str>>) -> Self {
        Self::ScoringOracle {
            message: message.into(),
            source: None,
        }
    }

    /// Create a not found error
    pub fn not_found(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    /// Create an internal error
    pub fn internal(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal {
            source: Some(Box::new(source)),
        }
    }

    // ========================================================================
    // Error Classification
    // ========================================================================

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database { .. }
                | Error::PoolExhausted
                | Error::Store { .. }
                | Error::LockContention { .. }
                | Error::Kafka { .. }
                | Error::Timeout { .. }
        )
    }

    /// Returns true if this error should be logged at error level
    pub fn is_error_level(&self) -> bool {
        matches!(
            self,
            Error::Database { .. }
                | Error::Store { .. }
                | Error::Kafka { .. }
                | Error::Internal { .. }
                | Error::Other(_)
        )
    }

    /// Stable error code, used as a structured log field
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } | Error::MissingEnvVar { .. } | Error::InvalidConfig { .. } => {
                "CONFIG_ERROR"
            }
            Error::Database { .. } | Error::PoolExhausted => "DATABASE_ERROR",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::Store { .. } => "STORE_ERROR",
            Error::LockContention { .. } => "LOCK_CONTENTION",
            Error::ScoringOracle { .. } => "SCORING_ORACLE_FAILURE",
            Error::Kafka { .. } => "KAFKA_ERROR",
            Error::Json(_) | Error::InvalidFormat { .. } => "SERIALIZATION_ERROR",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Internal { .. } | Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Error::NotFound {
                entity_type: "record",
                id: "unknown".to_string(),
            },
            sqlx::Error::PoolTimedOut => Error::PoolExhausted,
            sqlx::Error::Database(db_err) => Error::Database {
                message: db_err.message().to_string().into(),
                source: Some(err),
            },
            _ => Error::Database {
                message: err.to_string().into(),
                source: Some(err),
            },
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Store {
            message: err.to_string().into(),
            source: Some(err),
        }
    }
}

impl From<rdkafka::error::KafkaError> for Error {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Error::Kafka {
            message: err.to_string().into(),
            source: Some(err),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::internal(err)
    }
}
