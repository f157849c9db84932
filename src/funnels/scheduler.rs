//! Funnel step scheduler.
//!
//! Each tick drains queued immediate sends first, then due funnel
//! enrollments. Every candidate goes through the same pipeline: suppression
//! check, send slot, delivery, outcome written back to its row. A denied
//! slot ends the tick without touching the candidate; it is picked up again
//! on a later tick.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::FunnelSchedulerConfig;
use crate::content::{SendKind, SendRequest, SendableContent};
use crate::delivery::DeliveryExecutor;
use crate::error::{CampaignError, DatabaseError, DeliveryError, ErrorClass};
use crate::funnels::model::{DueEnrollment, EnrollmentStatus, FunnelEnrollment, advance_after};
use crate::immediate::{ImmediateSend, ImmediateStatus, PendingImmediate};
use crate::sending::{SendRateLimiter, SendSlot, SendingAccount};
use crate::store::{Database, FailureKind};
use crate::suppression::{SuppressionReason, SuppressionRegistry};
use crate::tick::{RunningGuard, TickReport};

/// Whether the tick may continue after a candidate.
enum Flow {
    Continue,
    SlotDenied,
}

pub struct FunnelStepScheduler {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    registry: SuppressionRegistry,
    limiter: SendRateLimiter,
    executor: Arc<DeliveryExecutor>,
    config: FunnelSchedulerConfig,
    running: AtomicBool,
}

impl FunnelStepScheduler {
    pub fn new(
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        registry: SuppressionRegistry,
        limiter: SendRateLimiter,
        executor: Arc<DeliveryExecutor>,
        config: FunnelSchedulerConfig,
    ) -> Self {
        Self {
            db,
            clock,
            registry,
            limiter,
            executor,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &FunnelSchedulerConfig {
        &self.config
    }

    /// Enroll a lead at the funnel's first step. `None` if already enrolled.
    pub async fn enroll(
        &self,
        lead_id: Uuid,
        funnel_id: Uuid,
    ) -> Result<Option<FunnelEnrollment>, CampaignError> {
        let steps = self.db.list_funnel_steps(funnel_id).await?;
        let first = steps.first().ok_or_else(|| CampaignError::MissingContent {
            reason: format!("funnel {funnel_id} has no steps"),
        })?;
        let enrollment = FunnelEnrollment::new(lead_id, first, self.clock.now())?;
        if self.db.enroll_lead(&enrollment).await? {
            info!(%lead_id, %funnel_id, next_send_at = %enrollment.next_send_at, "Lead enrolled");
            Ok(Some(enrollment))
        } else {
            debug!(%lead_id, %funnel_id, "Lead already enrolled");
            Ok(None)
        }
    }

    /// Queue a one-off send for the next tick.
    pub async fn enqueue_immediate(
        &self,
        lead_id: Uuid,
        content: SendableContent,
    ) -> Result<ImmediateSend, CampaignError> {
        content.validate()?;
        let send = ImmediateSend::new(lead_id, content, self.clock.now());
        self.db.enqueue_immediate_send(&send).await?;
        debug!(send_id = %send.id, %lead_id, "Immediate send queued");
        Ok(send)
    }

    /// Run one tick. Skipped (reported as `overlapped`) if the previous tick
    /// is still running.
    pub async fn tick(&self) -> Result<TickReport, DatabaseError> {
        let Some(_guard) = RunningGuard::try_acquire(&self.running) else {
            debug!("Funnel tick still running, skipping");
            return Ok(TickReport::overlapped());
        };

        let mut report = TickReport::default();

        let pending = self
            .db
            .list_pending_immediate_sends(self.config.batch_size)
            .await?;
        for item in pending {
            if let Flow::SlotDenied = self.process_immediate(item, &mut report).await? {
                report.deferred = true;
                return Ok(report);
            }
        }

        let due = self
            .db
            .list_due_enrollments(self.clock.now(), self.config.batch_size)
            .await?;
        for item in due {
            if let Flow::SlotDenied = self.process_enrollment(item, &mut report).await? {
                report.deferred = true;
                break;
            }
        }

        if !report.is_idle() {
            info!(
                sent = report.sent,
                retried = report.retried,
                failed = report.failed,
                skipped = report.skipped,
                "Funnel tick finished"
            );
        }
        Ok(report)
    }

    async fn acquire(&self) -> Result<Option<SendingAccount>, DatabaseError> {
        match self.limiter.acquire_send_slot().await? {
            SendSlot::Allowed(account) => Ok(Some(account)),
            SendSlot::Denied(reason) => {
                debug!(%reason, "Deferring funnel sends to next tick");
                Ok(None)
            }
        }
    }

    async fn process_immediate(
        &self,
        item: PendingImmediate,
        report: &mut TickReport,
    ) -> Result<Flow, DatabaseError> {
        let PendingImmediate { send, lead } = item;

        if self.registry.is_suppressed(&lead.email).await? {
            self.db
                .record_immediate_failure(
                    send.id,
                    "recipient suppressed",
                    FailureKind::Permanent,
                    self.clock.now(),
                )
                .await?;
            report.skipped += 1;
            return Ok(Flow::Continue);
        }

        let Some(account) = self.acquire().await? else {
            return Ok(Flow::SlotDenied);
        };

        let request = SendRequest {
            kind: SendKind::Immediate { send_id: send.id },
            lead,
            content: send.content,
        };
        let outcome = self.executor.attempt_send(&request, &account).await;
        let now = self.clock.now();

        match outcome.error {
            None => {
                self.db.mark_immediate_sent(send.id, now).await?;
                report.sent += 1;
            }
            Some(err) => {
                let status = self
                    .db
                    .record_immediate_failure(send.id, &err.to_string(), self.executor.failure_kind(&err), now)
                    .await?;
                if status == ImmediateStatus::Failed {
                    report.failed += 1;
                    if err.class() == ErrorClass::Permanent {
                        self.suppress(&request, &err).await?;
                    } else {
                        warn!(send_id = %send.id, "Immediate send failed after max attempts");
                    }
                } else {
                    report.retried += 1;
                }
            }
        }
        Ok(Flow::Continue)
    }

    async fn process_enrollment(
        &self,
        item: DueEnrollment,
        report: &mut TickReport,
    ) -> Result<Flow, DatabaseError> {
        let DueEnrollment {
            enrollment,
            lead,
            step,
        } = item;

        if self.registry.is_suppressed(&lead.email).await? {
            self.db
                .finish_enrollment(
                    enrollment.id,
                    EnrollmentStatus::Skipped,
                    Some("recipient suppressed"),
                    self.clock.now(),
                )
                .await?;
            debug!(enrollment_id = %enrollment.id, "Suppressed lead skipped");
            report.skipped += 1;
            return Ok(Flow::Continue);
        }

        if let Err(e) = step.content.validate() {
            warn!(
                enrollment_id = %enrollment.id,
                funnel_id = %step.funnel_id,
                position = step.position,
                error = %e,
                "Funnel step cannot be sent"
            );
            self.db
                .finish_enrollment(
                    enrollment.id,
                    EnrollmentStatus::Failed,
                    Some(&e.to_string()),
                    self.clock.now(),
                )
                .await?;
            report.failed += 1;
            return Ok(Flow::Continue);
        }

        let Some(account) = self.acquire().await? else {
            return Ok(Flow::SlotDenied);
        };

        let request = SendRequest {
            kind: SendKind::FunnelStep {
                enrollment_id: enrollment.id,
                funnel_id: enrollment.funnel_id,
                step_position: step.position,
            },
            lead,
            content: step.content,
        };
        let outcome = self.executor.attempt_send(&request, &account).await;
        let now = self.clock.now();

        match outcome.error {
            None => {
                let steps = self.db.list_funnel_steps(enrollment.funnel_id).await?;
                let advance = match advance_after(&steps, step.position, now) {
                    Ok(advance) => advance,
                    Err(e) => {
                        warn!(enrollment_id = %enrollment.id, error = %e, "Cannot schedule next funnel step");
                        self.db
                            .finish_enrollment(enrollment.id, EnrollmentStatus::Failed, Some(&e.to_string()), now)
                            .await?;
                        report.sent += 1;
                        return Ok(Flow::Continue);
                    }
                };
                if !self
                    .db
                    .advance_enrollment(enrollment.id, step.position, advance, now)
                    .await?
                {
                    warn!(enrollment_id = %enrollment.id, "Enrollment changed during send; not advanced");
                }
                debug!(enrollment_id = %enrollment.id, ?advance, "Enrollment advanced");
                report.sent += 1;
            }
            Some(err) => {
                let status = self
                    .db
                    .record_enrollment_failure(
                        enrollment.id,
                        &err.to_string(),
                        self.executor.failure_kind(&err),
                        now,
                    )
                    .await?;
                if status == EnrollmentStatus::Failed {
                    report.failed += 1;
                    if err.class() == ErrorClass::Permanent {
                        self.suppress(&request, &err).await?;
                    } else {
                        warn!(enrollment_id = %enrollment.id, "Funnel step failed after max attempts");
                    }
                } else {
                    report.retried += 1;
                }
            }
        }
        Ok(Flow::Continue)
    }

    async fn suppress(&self, request: &SendRequest, err: &DeliveryError) -> Result<(), DatabaseError> {
        info!(lead_id = %request.lead.id, error = %err, "Permanent failure, suppressing recipient");
        self.registry
            .suppress(
                &request.lead.email,
                SuppressionReason::PermanentFailure,
                &format!("delivery:{}", request.kind.type_tag()),
            )
            .await?;
        Ok(())
    }
}
