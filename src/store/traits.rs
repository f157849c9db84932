//! Unified `Database` trait: single async interface for all engine persistence.
//!
//! Every operation that shares state across the two scheduler loops (send
//! slot, recipient outcome, suppression, lease) is a single call here so the
//! backend can run it as one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::delivery::DeliveryRecord;
use crate::error::DatabaseError;
use crate::funnels::model::{Advance, DueEnrollment, EnrollmentStatus, Funnel, FunnelEnrollment, FunnelStep};
use crate::immediate::{ImmediateSend, ImmediateStatus, PendingImmediate};
use crate::leader::LeaseRecord;
use crate::leads::{Lead, LeadStatus};
use crate::sending::{SendSlot, SendingAccount, SendingConfig, SendingSettings};
use crate::suppression::SuppressionEntry;
use crate::transmissions::model::{
    PendingRecipient, RecipientState, SendOrder, Transmission, TransmissionRecipient,
};

/// What `launch_transmission` did.
#[derive(Debug, Clone)]
pub enum LaunchResult {
    /// Recipients were snapshotted and the status moved out of draft.
    Launched(Transmission),
    /// The transmission had already left draft; nothing changed.
    AlreadyLaunched(Transmission),
    NotFound,
}

/// How a failed attempt should be recorded against its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Count the attempt; go terminal once `max_attempts` is reached.
    Transient { max_attempts: u32 },
    /// Go terminal now.
    Permanent,
}

/// Backend-agnostic database trait covering leads, funnels, transmissions,
/// sending state, suppression, delivery log and scheduler leases.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// Look up by normalised email.
    async fn get_lead_by_email(&self, email: &str) -> Result<Option<Lead>, DatabaseError>;

    async fn update_lead_status(
        &self,
        id: Uuid,
        status: LeadStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Funnels ─────────────────────────────────────────────────────

    async fn create_funnel(&self, funnel: &Funnel) -> Result<(), DatabaseError>;

    async fn get_funnel(&self, id: Uuid) -> Result<Option<Funnel>, DatabaseError>;

    async fn set_funnel_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, DatabaseError>;

    async fn create_funnel_step(&self, step: &FunnelStep) -> Result<(), DatabaseError>;

    async fn set_funnel_step_enabled(
        &self,
        funnel_id: Uuid,
        position: i64,
        enabled: bool,
    ) -> Result<bool, DatabaseError>;

    /// All steps of a funnel, enabled or not, ordered by position.
    async fn list_funnel_steps(&self, funnel_id: Uuid) -> Result<Vec<FunnelStep>, DatabaseError>;

    /// Insert an enrollment. Returns `false` if the lead is already enrolled
    /// in that funnel.
    async fn enroll_lead(&self, enrollment: &FunnelEnrollment) -> Result<bool, DatabaseError>;

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<FunnelEnrollment>, DatabaseError>;

    /// Active enrollments due at `now` whose funnel and current step are
    /// enabled and whose lead is not suppressed, oldest due first.
    async fn list_due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueEnrollment>, DatabaseError>;

    /// Move an enrollment past `from_position`. No-op (returns `false`) if
    /// the enrollment is no longer active at that position.
    async fn advance_enrollment(
        &self,
        id: Uuid,
        from_position: i64,
        advance: Advance,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Record a failed attempt on the enrollment's current step. Returns the
    /// resulting status (`Active` while retries remain).
    async fn record_enrollment_failure(
        &self,
        id: Uuid,
        error: &str,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> Result<EnrollmentStatus, DatabaseError>;

    /// Move an active enrollment to a terminal status.
    async fn finish_enrollment(
        &self,
        id: Uuid,
        status: EnrollmentStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Immediate sends ─────────────────────────────────────────────

    async fn enqueue_immediate_send(&self, send: &ImmediateSend) -> Result<(), DatabaseError>;

    async fn get_immediate_send(&self, id: Uuid) -> Result<Option<ImmediateSend>, DatabaseError>;

    /// Pending sends for non-suppressed leads, oldest first.
    async fn list_pending_immediate_sends(
        &self,
        limit: usize,
    ) -> Result<Vec<PendingImmediate>, DatabaseError>;

    async fn mark_immediate_sent(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    async fn record_immediate_failure(
        &self,
        id: Uuid,
        error: &str,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> Result<ImmediateStatus, DatabaseError>;

    // ── Transmissions ───────────────────────────────────────────────

    async fn create_transmission(&self, transmission: &Transmission) -> Result<(), DatabaseError>;

    async fn get_transmission(&self, id: Uuid) -> Result<Option<Transmission>, DatabaseError>;

    /// Snapshot the audience into recipients and leave draft, atomically.
    /// A transmission that already left draft is returned unchanged.
    async fn launch_transmission(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<LaunchResult, DatabaseError>;

    /// Enabled transmissions in `scheduled` or `processing`.
    async fn list_active_transmissions(&self) -> Result<Vec<Transmission>, DatabaseError>;

    /// `scheduled -> processing` once `scheduled_at <= now`.
    async fn start_scheduled_transmission(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Flip the enabled flag, moving `processing <-> paused` as needed.
    async fn set_transmission_enabled(
        &self,
        id: Uuid,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Transmission>, DatabaseError>;

    async fn set_next_dispatch_at(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Pending recipients in send order (lead creation time, then recipient id).
    async fn list_pending_recipients(
        &self,
        transmission_id: Uuid,
        order: SendOrder,
        limit: usize,
    ) -> Result<Vec<PendingRecipient>, DatabaseError>;

    async fn list_recipients(
        &self,
        transmission_id: Uuid,
    ) -> Result<Vec<TransmissionRecipient>, DatabaseError>;

    /// `pending -> sent` and move one count from pending to sent.
    async fn mark_recipient_sent(
        &self,
        recipient_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Record a failed attempt; on terminal failure move one count from
    /// pending to failed. Returns the resulting state.
    async fn record_recipient_failure(
        &self,
        recipient_id: Uuid,
        error: &str,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> Result<RecipientState, DatabaseError>;

    /// `processing -> completed` when nothing is pending.
    async fn complete_transmission_if_drained(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Any non-terminal status `-> failed`.
    async fn fail_transmission(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Sending accounts & limits ───────────────────────────────────

    async fn insert_sending_account(&self, account: &SendingAccount) -> Result<(), DatabaseError>;

    /// All accounts ordered by position.
    async fn list_sending_accounts(&self) -> Result<Vec<SendingAccount>, DatabaseError>;

    async fn set_sending_account_enabled(
        &self,
        id: Uuid,
        enabled: bool,
    ) -> Result<bool, DatabaseError>;

    async fn get_sending_config(&self) -> Result<SendingConfig, DatabaseError>;

    async fn save_sending_settings(
        &self,
        settings: &SendingSettings,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Check limits, pick the rotation account and consume the slot, atomically.
    async fn acquire_send_slot(&self, now: DateTime<Utc>) -> Result<SendSlot, DatabaseError>;

    // ── Suppression ─────────────────────────────────────────────────

    async fn is_suppressed(&self, email: &str) -> Result<bool, DatabaseError>;

    /// Insert the entry and retire the address's pending work, atomically.
    /// Returns `false` if the address was already suppressed.
    async fn suppress(&self, entry: &SuppressionEntry) -> Result<bool, DatabaseError>;

    /// Most recent first.
    async fn list_suppressions(&self, limit: usize) -> Result<Vec<SuppressionEntry>, DatabaseError>;

    // ── Delivery log ────────────────────────────────────────────────

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), DatabaseError>;

    /// The latest `limit` attempts, in the order they happened.
    async fn list_delivery_log(&self, limit: usize) -> Result<Vec<DeliveryRecord>, DatabaseError>;

    // ── Scheduler leases ────────────────────────────────────────────

    /// Take or renew `name` for `holder` if free, expired, or already ours.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, DatabaseError>;

    async fn release_lease(&self, name: &str, holder: &str) -> Result<bool, DatabaseError>;

    async fn get_lease(&self, name: &str) -> Result<Option<LeaseRecord>, DatabaseError>;
}
