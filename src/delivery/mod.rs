//! Delivery: one send attempt through the external mailer, classified and logged.

pub mod executor;
pub mod mailer;

pub use executor::{DeliveryExecutor, DeliveryOutcome};
pub use mailer::{Mailer, OutboundEmail, SmtpMailer, classify_mailer_error};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorClass;

/// Audit row written for every attempt, sent or failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    /// `SendKind::type_tag()` of the originating send.
    pub kind: String,
    pub reference_id: Uuid,
    pub lead_id: Uuid,
    pub email: String,
    pub account_id: Uuid,
    pub account_name: String,
    pub subject: String,
    pub sent: bool,
    pub error_class: Option<ErrorClass>,
    pub error: Option<String>,
    pub variation_applied: bool,
    pub attempted_at: DateTime<Utc>,
}
