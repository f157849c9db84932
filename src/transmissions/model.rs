//! Broadcast campaign types: transmissions, their audience, and per-recipient state.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::content::SendableContent;
use crate::error::CampaignError;
use crate::leads::{Lead, LeadStatus};

/// How a transmission starts once launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionMode {
    /// Starts dispatching as soon as it is launched.
    Immediate,
    /// Waits for `scheduled_at`.
    Scheduled,
}

impl std::fmt::Display for TransmissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransmissionMode::Immediate => write!(f, "immediate"),
            TransmissionMode::Scheduled => write!(f, "scheduled"),
        }
    }
}

impl FromStr for TransmissionMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(TransmissionMode::Immediate),
            "scheduled" => Ok(TransmissionMode::Scheduled),
            other => Err(format!("unknown transmission mode: {other}")),
        }
    }
}

/// Dispatch order over recipients, by lead creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

impl std::fmt::Display for SendOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendOrder::NewestFirst => write!(f, "newest_first"),
            SendOrder::OldestFirst => write!(f, "oldest_first"),
        }
    }
}

impl FromStr for SendOrder {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest_first" => Ok(SendOrder::NewestFirst),
            "oldest_first" => Ok(SendOrder::OldestFirst),
            other => Err(format!("unknown send order: {other}")),
        }
    }
}

/// Transmission lifecycle.
///
/// `draft -> scheduled -> processing -> completed`, `processing <-> paused`
/// through the enabled flag, and any non-terminal state `-> failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionStatus {
    Draft,
    Scheduled,
    Processing,
    Paused,
    Completed,
    Failed,
}

impl TransmissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransmissionStatus::Completed | TransmissionStatus::Failed)
    }

    /// Whether the state machine allows `self -> to`.
    pub fn can_transition(&self, to: TransmissionStatus) -> bool {
        use TransmissionStatus::*;
        match (self, to) {
            (Draft, Scheduled | Processing | Completed) => true,
            (Scheduled, Processing) => true,
            (Processing, Paused | Completed) => true,
            (Paused, Processing) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TransmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransmissionStatus::Draft => write!(f, "draft"),
            TransmissionStatus::Scheduled => write!(f, "scheduled"),
            TransmissionStatus::Processing => write!(f, "processing"),
            TransmissionStatus::Paused => write!(f, "paused"),
            TransmissionStatus::Completed => write!(f, "completed"),
            TransmissionStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for TransmissionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(TransmissionStatus::Draft),
            "scheduled" => Ok(TransmissionStatus::Scheduled),
            "processing" => Ok(TransmissionStatus::Processing),
            "paused" => Ok(TransmissionStatus::Paused),
            "completed" => Ok(TransmissionStatus::Completed),
            "failed" => Ok(TransmissionStatus::Failed),
            other => Err(format!("unknown transmission status: {other}")),
        }
    }
}

/// Which leads a transmission targets. Resolved once, at launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Audience {
    AllLeads,
    LeadStatus(LeadStatus),
    Funnel(Uuid),
    Leads(Vec<Uuid>),
}

impl Audience {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Audience::AllLeads => "all_leads",
            Audience::LeadStatus(_) => "lead_status",
            Audience::Funnel(_) => "funnel",
            Audience::Leads(_) => "leads",
        }
    }
}

/// A one-off broadcast campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transmission {
    pub id: Uuid,
    pub name: String,
    pub mode: TransmissionMode,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub min_interval_seconds: u64,
    pub max_interval_seconds: u64,
    pub send_order: SendOrder,
    pub enabled: bool,
    pub status: TransmissionStatus,
    pub audience: Audience,
    pub content: SendableContent,
    pub total_recipients: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub pending_count: i64,
    /// Earliest instant the next recipient may be dispatched.
    pub next_dispatch_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub launched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transmission {
    /// A new immediate-mode draft with no inter-send gap.
    pub fn draft(name: &str, content: SendableContent, audience: Audience) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            mode: TransmissionMode::Immediate,
            scheduled_at: None,
            min_interval_seconds: 0,
            max_interval_seconds: 0,
            send_order: SendOrder::default(),
            enabled: true,
            status: TransmissionStatus::Draft,
            audience,
            content,
            total_recipients: 0,
            sent_count: 0,
            failed_count: 0,
            pending_count: 0,
            next_dispatch_at: None,
            failure_reason: None,
            launched_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.mode = TransmissionMode::Scheduled;
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_interval(mut self, min_seconds: u64, max_seconds: u64) -> Self {
        self.min_interval_seconds = min_seconds;
        self.max_interval_seconds = max_seconds;
        self
    }

    pub fn with_send_order(mut self, order: SendOrder) -> Self {
        self.send_order = order;
        self
    }

    /// Configuration checks run at creation and again before dispatch.
    pub fn validate(&self) -> Result<(), CampaignError> {
        if self.min_interval_seconds > self.max_interval_seconds {
            return Err(CampaignError::InvalidInterval {
                min: self.min_interval_seconds,
                max: self.max_interval_seconds,
            });
        }
        if self.mode == TransmissionMode::Scheduled && self.scheduled_at.is_none() {
            return Err(CampaignError::MissingSchedule { id: self.id });
        }
        self.content.validate()
    }

    /// Status a draft enters on launch, given how many recipients it resolved to.
    pub fn launch_status(&self, recipients: usize) -> TransmissionStatus {
        if recipients == 0 {
            TransmissionStatus::Completed
        } else if self.mode == TransmissionMode::Scheduled {
            TransmissionStatus::Scheduled
        } else {
            TransmissionStatus::Processing
        }
    }

    /// Draw the gap until the next dispatch.
    pub fn next_gap<R: Rng>(&self, rng: &mut R) -> Duration {
        jitter_gap(self.min_interval_seconds, self.max_interval_seconds, rng)
    }
}

/// Uniform gap in `[min, max]` seconds; fixed when `min >= max`.
pub fn jitter_gap<R: Rng>(min: u64, max: u64, rng: &mut R) -> Duration {
    let secs = if min >= max {
        min
    } else {
        rng.gen_range(min..=max)
    };
    Duration::seconds(secs as i64)
}

/// Per-recipient outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientState {
    Pending,
    Sent,
    Failed,
}

impl std::fmt::Display for RecipientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecipientState::Pending => write!(f, "pending"),
            RecipientState::Sent => write!(f, "sent"),
            RecipientState::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for RecipientState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecipientState::Pending),
            "sent" => Ok(RecipientState::Sent),
            "failed" => Ok(RecipientState::Failed),
            other => Err(format!("unknown recipient state: {other}")),
        }
    }
}

/// A lead snapshotted into a transmission at launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransmissionRecipient {
    pub id: Uuid,
    pub transmission_id: Uuid,
    pub lead_id: Uuid,
    pub state: RecipientState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A pending recipient joined with its lead.
#[derive(Debug, Clone)]
pub struct PendingRecipient {
    pub recipient: TransmissionRecipient,
    pub lead: Lead,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn content() -> SendableContent {
        SendableContent::new("News", "<p>Hi {{first_name}}</p>")
    }

    #[test]
    fn fixed_gap_when_min_equals_max() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(jitter_gap(45, 45, &mut rng), Duration::seconds(45));
        }
    }

    #[test]
    fn jittered_gap_within_bounds() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..500 {
            let gap = jitter_gap(30, 90, &mut rng).num_seconds();
            assert!((30..=90).contains(&gap), "gap {gap} out of range");
        }
    }

    #[test]
    fn validate_rejects_inverted_interval() {
        let t = Transmission::draft("t", content(), Audience::AllLeads).with_interval(10, 5);
        assert!(matches!(
            t.validate(),
            Err(CampaignError::InvalidInterval { min: 10, max: 5 })
        ));
    }

    #[test]
    fn validate_requires_schedule_time() {
        let mut t = Transmission::draft("t", content(), Audience::AllLeads);
        t.mode = TransmissionMode::Scheduled;
        assert!(matches!(t.validate(), Err(CampaignError::MissingSchedule { .. })));
    }

    #[test]
    fn launch_status_by_mode() {
        let t = Transmission::draft("t", content(), Audience::AllLeads);
        assert_eq!(t.launch_status(3), TransmissionStatus::Processing);
        assert_eq!(t.launch_status(0), TransmissionStatus::Completed);
        let s = t.scheduled_for(Utc::now());
        assert_eq!(s.launch_status(3), TransmissionStatus::Scheduled);
    }

    #[test]
    fn state_machine_edges() {
        use TransmissionStatus::*;
        assert!(Draft.can_transition(Scheduled));
        assert!(Scheduled.can_transition(Processing));
        assert!(Processing.can_transition(Paused));
        assert!(Paused.can_transition(Processing));
        assert!(Processing.can_transition(Failed));
        assert!(!Completed.can_transition(Failed));
        assert!(!Completed.can_transition(Processing));
        assert!(!Scheduled.can_transition(Draft));
    }

    #[test]
    fn audience_serde_shape() {
        let json = serde_json::to_value(Audience::LeadStatus(LeadStatus::Abandoned)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "lead_status", "value": "abandoned"}));
        let back: Audience = serde_json::from_value(json).unwrap();
        assert_eq!(back, Audience::LeadStatus(LeadStatus::Abandoned));
        let all: Audience = serde_json::from_value(serde_json::json!({"kind": "all_leads"})).unwrap();
        assert_eq!(all, Audience::AllLeads);
    }
}
