//! Suppression registry: the durable block-list consulted before every send.
//!
//! Fed by external bounce/unsubscribe/complaint signals and by the delivery
//! executor when a provider reports a permanent failure. Re-suppressing an
//! address that is already blocked changes nothing.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::DatabaseError;
use crate::leads::normalize_email;
use crate::store::Database;

/// Why an address was suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    HardBounce,
    Unsubscribe,
    Complaint,
    /// Permanent provider failure reported while sending.
    PermanentFailure,
    Manual,
}

impl std::fmt::Display for SuppressionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuppressionReason::HardBounce => write!(f, "hard_bounce"),
            SuppressionReason::Unsubscribe => write!(f, "unsubscribe"),
            SuppressionReason::Complaint => write!(f, "complaint"),
            SuppressionReason::PermanentFailure => write!(f, "permanent_failure"),
            SuppressionReason::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for SuppressionReason {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hard_bounce" => Ok(SuppressionReason::HardBounce),
            "unsubscribe" => Ok(SuppressionReason::Unsubscribe),
            "complaint" => Ok(SuppressionReason::Complaint),
            "permanent_failure" => Ok(SuppressionReason::PermanentFailure),
            "manual" => Ok(SuppressionReason::Manual),
            other => Err(format!("unknown suppression reason: {other}")),
        }
    }
}

/// One block-list row. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub email: String,
    pub reason: SuppressionReason,
    /// Free-form origin, e.g. `"webhook:bounce"` or `"delivery:smtp"`.
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl SuppressionEntry {
    pub fn new(email: &str, reason: SuppressionReason, source: &str, at: DateTime<Utc>) -> Self {
        Self {
            email: normalize_email(email),
            reason,
            source: source.to_string(),
            created_at: at,
        }
    }
}

/// Authoritative suppression lookups and writes.
///
/// All writes go through the store's single transactional `suppress`, which
/// also flags the lead and retires its pending funnel and transmission work.
#[derive(Clone)]
pub struct SuppressionRegistry {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
}

impl SuppressionRegistry {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub async fn is_suppressed(&self, email: &str) -> Result<bool, DatabaseError> {
        self.db.is_suppressed(&normalize_email(email)).await
    }

    /// Block `email`. Returns `true` if this call created the entry.
    pub async fn suppress(
        &self,
        email: &str,
        reason: SuppressionReason,
        source: &str,
    ) -> Result<bool, DatabaseError> {
        let entry = SuppressionEntry::new(email, reason, source, self.clock.now());
        let created = self.db.suppress(&entry).await?;
        if created {
            info!(email = %entry.email, reason = %reason, source, "Address suppressed");
        } else {
            debug!(email = %entry.email, "Address already suppressed");
        }
        Ok(created)
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<SuppressionEntry>, DatabaseError> {
        self.db.list_suppressions(limit).await
    }
}
