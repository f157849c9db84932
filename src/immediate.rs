//! One-off sends queued by inbound producers (purchase confirmations,
//! recovery nudges). Drained by the funnel scheduler ahead of funnel steps.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::content::SendableContent;
use crate::leads::Lead;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImmediateStatus {
    Pending,
    Sent,
    Failed,
}

impl std::fmt::Display for ImmediateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImmediateStatus::Pending => write!(f, "pending"),
            ImmediateStatus::Sent => write!(f, "sent"),
            ImmediateStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ImmediateStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ImmediateStatus::Pending),
            "sent" => Ok(ImmediateStatus::Sent),
            "failed" => Ok(ImmediateStatus::Failed),
            other => Err(format!("unknown immediate send status: {other}")),
        }
    }
}

/// A queued immediate send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImmediateSend {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub content: SendableContent,
    pub status: ImmediateStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImmediateSend {
    pub fn new(lead_id: Uuid, content: SendableContent, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            content,
            status: ImmediateStatus::Pending,
            attempts: 0,
            last_error: None,
            sent_at: None,
            created_at: at,
            updated_at: at,
        }
    }
}

/// A pending immediate send joined with its lead.
#[derive(Debug, Clone)]
pub struct PendingImmediate {
    pub send: ImmediateSend,
    pub lead: Lead,
}
