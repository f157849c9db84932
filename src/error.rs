//! Error types for the outreach engine.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Campaign error: {0}")]
    Campaign(#[from] CampaignError),

    #[error("Leader election error: {0}")]
    Leader(#[from] LeaderError),

    #[error("Copy variation error: {0}")]
    Variation(#[from] VariationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Outcome class of a failed send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Temporary provider or network problem; retry on a later tick.
    Transient,
    /// Hard bounce or invalid address; suppress the recipient.
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        }
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorClass::Transient),
            "permanent" => Ok(ErrorClass::Permanent),
            other => Err(format!("unknown error class: {other}")),
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed send attempt, already classified.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("Transient provider error: {reason}")]
    TransientProvider { reason: String },

    #[error("Permanent provider error: {reason}")]
    PermanentProvider { reason: String },

    #[error("Send attempt timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

impl DeliveryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DeliveryError::PermanentProvider { .. } => ErrorClass::Permanent,
            DeliveryError::TransientProvider { .. } | DeliveryError::Timeout { .. } => {
                ErrorClass::Transient
            }
        }
    }
}

/// Raw transport failure reported by a [`crate::delivery::Mailer`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum MailerError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Server replied {code}: {message}")]
    Rejected { code: u16, message: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Transport timed out")]
    Timeout,

    #[error("Failed to build message: {0}")]
    Build(String),
}

/// Campaign-level errors that abort a single funnel or transmission.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("Transmission {id} not found")]
    TransmissionNotFound { id: Uuid },

    #[error("Transmission {id} cannot move from {state} to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Missing template content: {reason}")]
    MissingContent { reason: String },

    #[error("Invalid send interval: min {min}s > max {max}s")]
    InvalidInterval { min: u64, max: u64 },

    #[error("Scheduled transmission {id} has no scheduled_at")]
    MissingSchedule { id: Uuid },

    #[error("Funnel step {position} delay of {delay} is out of range")]
    DelayOutOfRange { position: i64, delay: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Leader election errors. Failing to win the lease is not one of these.
#[derive(Debug, thiserror::Error)]
pub enum LeaderError {
    #[error("Lease {name} lost to another holder")]
    LeaseLost { name: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// AI copy variation errors. Never surfaced as send failures.
#[derive(Debug, thiserror::Error)]
pub enum VariationError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Variation dropped placeholder {token}")]
    PlaceholderRemoved { token: String },

    #[error("Variation dropped link {url}")]
    LinkRemoved { url: String },

    #[error("Variation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
