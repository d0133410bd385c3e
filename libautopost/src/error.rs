//! Error types for Autopost

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::types::PostState;

pub type Result<T> = std::result::Result<T, AutopostError>;

#[derive(Error, Debug)]
pub enum AutopostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Authorization error: {0}")]
    Auth(#[from] AuthError),

    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl AutopostError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            AutopostError::InvalidInput(_) | AutopostError::NotFound(_) => 3,
            AutopostError::Auth(_) => 2,
            AutopostError::Platform(PlatformError::AuthExpired(_)) => 2,
            AutopostError::Quota(_) => 4,
            AutopostError::Platform(_) => 1,
            AutopostError::Lifecycle(_) => 1,
            AutopostError::Config(_) => 1,
            AutopostError::Database(_) => 1,
        }
    }

    /// Failure class of this error, if it is one the publishing pipeline classifies
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            AutopostError::Platform(e) => Some(e.class()),
            AutopostError::Auth(e) => Some(e.class()),
            AutopostError::Quota(QuotaError::Exceeded { .. }) => Some(ErrorClass::QuotaExceeded),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Errors reported by a platform adapter, already classified
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlatformError {
    #[error("Authorization expired: {0}")]
    AuthExpired(String),

    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rejected by platform: {0}")]
    Rejected(String),
}

impl PlatformError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PlatformError::AuthExpired(_) => ErrorClass::AuthExpired,
            PlatformError::RateLimited { .. } => ErrorClass::RateLimited,
            PlatformError::Network(_) => ErrorClass::TransientNetwork,
            PlatformError::Rejected(_) => ErrorClass::PlatformRejected,
        }
    }

    /// Server-provided hint for how long to wait before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PlatformError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Errors from obtaining or refreshing a platform credential
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// The connection cannot be repaired without the user going through consent again
    #[error("Re-authorization required: {0}")]
    NeedsReauthorization(String),

    /// The refresh endpoint could not be reached; the connection may recover
    #[error("Credential refresh unavailable: {0}")]
    RefreshUnavailable(String),
}

impl AuthError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AuthError::NeedsReauthorization(_) => ErrorClass::AuthPermanent,
            AuthError::RefreshUnavailable(_) => ErrorClass::TransientNetwork,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuotaError {
    #[error("Quota exceeded for subscriber {subscriber_id} (allocated {allocated})")]
    Exceeded {
        subscriber_id: String,
        allocated: i64,
    },

    #[error("Quota cycle {cycle_id} for subscriber {subscriber_id} has ended and was not renewed")]
    CycleExpired {
        subscriber_id: String,
        cycle_id: i64,
    },

    #[error("Unknown reservation: {0}")]
    UnknownReservation(String),

    #[error("Reservation {0} was already released and cannot be committed")]
    AlreadyReleased(String),

    #[error("Reservation {0} was already committed and cannot be released")]
    AlreadyCommitted(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("Post {post_id} cannot move from {from} to {to}")]
    InvalidTransition {
        post_id: String,
        from: PostState,
        to: PostState,
    },

    #[error("Lease on post {post_id} is no longer held by {owner}")]
    LeaseLost { post_id: String, owner: String },
}

/// Failure taxonomy persisted on failed posts
///
/// Retry policy in the publishing queue is written against this enum only,
/// never against a concrete platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    QuotaExceeded,
    AuthExpired,
    AuthPermanent,
    RateLimited,
    TransientNetwork,
    PlatformRejected,
}

impl ErrorClass {
    /// Whether the queue may schedule another attempt for this class
    ///
    /// `AuthExpired` is not retried by backoff: it gets exactly one
    /// refresh-and-retry inside the attempt, after which it is permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::RateLimited | ErrorClass::TransientNetwork)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::QuotaExceeded => "quota_exceeded",
            ErrorClass::AuthExpired => "auth_expired",
            ErrorClass::AuthPermanent => "auth_permanent",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::TransientNetwork => "transient_network",
            ErrorClass::PlatformRejected => "platform_rejected",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "quota_exceeded" => Ok(ErrorClass::QuotaExceeded),
            "auth_expired" => Ok(ErrorClass::AuthExpired),
            "auth_permanent" => Ok(ErrorClass::AuthPermanent),
            "rate_limited" => Ok(ErrorClass::RateLimited),
            "transient_network" => Ok(ErrorClass::TransientNetwork),
            "platform_rejected" => Ok(ErrorClass::PlatformRejected),
            other => Err(format!("Unknown error class: '{}'", other)),
        }
    }
}
