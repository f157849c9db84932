//! Transmission scheduler: broadcast campaigns with jittered pacing.
//!
//! A launched transmission dispatches one recipient per gap, the gap drawn
//! uniformly from `[min_interval_seconds, max_interval_seconds]`. Each tick
//! sends to every transmission whose next dispatch is due, then stops until
//! the next gap elapses; a zero gap lets a tick send up to `batch_size`.
//! A recipient that fails transiently keeps its place in the queue until it
//! is sent or runs out of attempts.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::TransmissionSchedulerConfig;
use crate::content::{SendKind, SendRequest};
use crate::delivery::DeliveryExecutor;
use crate::error::{CampaignError, DatabaseError, ErrorClass};
use crate::sending::{SendRateLimiter, SendSlot, SendingAccount};
use crate::store::{Database, FailureKind, LaunchResult};
use crate::suppression::{SuppressionReason, SuppressionRegistry};
use crate::tick::{RunningGuard, TickReport};
use crate::transmissions::model::{
    PendingRecipient, RecipientState, Transmission, TransmissionStatus,
};

enum Flow {
    Continue,
    SlotDenied,
}

pub struct TransmissionScheduler {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    registry: SuppressionRegistry,
    limiter: SendRateLimiter,
    executor: Arc<DeliveryExecutor>,
    config: TransmissionSchedulerConfig,
    rng: Mutex<StdRng>,
    running: AtomicBool,
}

impl TransmissionScheduler {
    pub fn new(
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        registry: SuppressionRegistry,
        limiter: SendRateLimiter,
        executor: Arc<DeliveryExecutor>,
        config: TransmissionSchedulerConfig,
    ) -> Self {
        Self {
            db,
            clock,
            registry,
            limiter,
            executor,
            config,
            rng: Mutex::new(StdRng::from_entropy()),
            running: AtomicBool::new(false),
        }
    }

    /// Fix the jitter sequence (tests, simulations).
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn config(&self) -> &TransmissionSchedulerConfig {
        &self.config
    }

    // ── Management ──────────────────────────────────────────────────

    /// Store a new draft.
    pub async fn create_transmission(&self, transmission: &Transmission) -> Result<(), CampaignError> {
        if transmission.status != TransmissionStatus::Draft {
            return Err(CampaignError::InvalidTransition {
                id: transmission.id,
                state: transmission.status.to_string(),
                target: TransmissionStatus::Draft.to_string(),
            });
        }
        transmission.validate()?;
        self.db.create_transmission(transmission).await?;
        info!(transmission_id = %transmission.id, name = %transmission.name, "Transmission created");
        Ok(())
    }

    pub async fn get_transmission(&self, id: Uuid) -> Result<Option<Transmission>, CampaignError> {
        Ok(self.db.get_transmission(id).await?)
    }

    /// Snapshot recipients and start the campaign. Calling it again returns
    /// the transmission unchanged. A draft that cannot be sent moves to
    /// `failed` and the validation error is returned.
    pub async fn launch(&self, id: Uuid) -> Result<Transmission, CampaignError> {
        let transmission = self
            .db
            .get_transmission(id)
            .await?
            .ok_or(CampaignError::TransmissionNotFound { id })?;

        if transmission.status == TransmissionStatus::Draft
            && let Err(e) = transmission.validate()
        {
            warn!(transmission_id = %id, error = %e, "Transmission cannot launch");
            self.db
                .fail_transmission(id, &e.to_string(), self.clock.now())
                .await?;
            return Err(e);
        }

        match self.db.launch_transmission(id, self.clock.now()).await? {
            LaunchResult::Launched(t) => {
                info!(
                    transmission_id = %id,
                    status = %t.status,
                    recipients = t.total_recipients,
                    "Transmission launched"
                );
                Ok(t)
            }
            LaunchResult::AlreadyLaunched(t) => {
                debug!(transmission_id = %id, status = %t.status, "Transmission already launched");
                Ok(t)
            }
            LaunchResult::NotFound => Err(CampaignError::TransmissionNotFound { id }),
        }
    }

    /// Pause (`false`) or resume (`true`). Takes effect from the next tick.
    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<Transmission, CampaignError> {
        let t = self
            .db
            .set_transmission_enabled(id, enabled, self.clock.now())
            .await?
            .ok_or(CampaignError::TransmissionNotFound { id })?;
        info!(transmission_id = %id, enabled, status = %t.status, "Transmission enabled flag set");
        Ok(t)
    }

    // ── Tick ────────────────────────────────────────────────────────

    /// Run one tick over every active transmission.
    pub async fn tick(&self) -> Result<TickReport, DatabaseError> {
        let Some(_guard) = RunningGuard::try_acquire(&self.running) else {
            debug!("Transmission tick still running, skipping");
            return Ok(TickReport::overlapped());
        };

        let mut report = TickReport::default();
        for transmission in self.db.list_active_transmissions().await? {
            if let Flow::SlotDenied = self.process(transmission, &mut report).await? {
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
                started = report.started,
                completed = report.completed,
                "Transmission tick finished"
            );
        }
        Ok(report)
    }

    async fn process(
        &self,
        transmission: Transmission,
        report: &mut TickReport,
    ) -> Result<Flow, DatabaseError> {
        let id = transmission.id;
        let now = self.clock.now();

        if transmission.status == TransmissionStatus::Scheduled {
            if !self.db.start_scheduled_transmission(id, now).await? {
                return Ok(Flow::Continue);
            }
            info!(transmission_id = %id, "Scheduled transmission started");
            report.started += 1;
        }

        if let Err(e) = transmission.validate() {
            warn!(transmission_id = %id, error = %e, "Transmission failed validation");
            self.db.fail_transmission(id, &e.to_string(), now).await?;
            return Ok(Flow::Continue);
        }

        // Each recipient is attempted at most once per tick; a transient
        // failure waits for the next tick.
        let batch = self
            .db
            .list_pending_recipients(id, transmission.send_order, self.config.batch_size)
            .await?;
        for next in batch {
            // Re-read every round so a pause or a new dispatch time is seen
            // before the next send starts.
            let Some(current) = self.db.get_transmission(id).await? else {
                break;
            };
            let now = self.clock.now();
            if !current.enabled || current.status != TransmissionStatus::Processing {
                break;
            }
            if current.next_dispatch_at.is_some_and(|at| at > now) {
                break;
            }

            if self.registry.is_suppressed(&next.lead.email).await? {
                self.db
                    .record_recipient_failure(next.recipient.id, "recipient suppressed", FailureKind::Permanent, now)
                    .await?;
                report.skipped += 1;
                continue;
            }

            let account = match self.limiter.acquire_send_slot().await? {
                SendSlot::Allowed(account) => account,
                SendSlot::Denied(reason) => {
                    debug!(transmission_id = %id, %reason, "Deferring transmission to next tick");
                    return Ok(Flow::SlotDenied);
                }
            };

            self.dispatch(&current, next, &account, report).await?;

            let gap = {
                let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                current.next_gap(&mut *rng)
            };
            let next_at = now + gap;
            self.db.set_next_dispatch_at(id, next_at).await?;
            debug!(transmission_id = %id, next_dispatch_at = %next_at, "Next dispatch scheduled");
        }

        if self.db.complete_transmission_if_drained(id, self.clock.now()).await? {
            let done = self.db.get_transmission(id).await?;
            if let Some(t) = done {
                info!(
                    transmission_id = %id,
                    sent = t.sent_count,
                    failed = t.failed_count,
                    "Transmission completed"
                );
            }
            report.completed += 1;
        }
        Ok(Flow::Continue)
    }

    async fn dispatch(
        &self,
        transmission: &Transmission,
        next: PendingRecipient,
        account: &SendingAccount,
        report: &mut TickReport,
    ) -> Result<(), DatabaseError> {
        let recipient_id = next.recipient.id;
        let request = SendRequest {
            kind: SendKind::Transmission {
                transmission_id: transmission.id,
                recipient_id,
            },
            lead: next.lead,
            content: transmission.content.clone(),
        };
        let outcome = self.executor.attempt_send(&request, account).await;
        let now = self.clock.now();

        let Some(err) = outcome.error else {
            self.db.mark_recipient_sent(recipient_id, now).await?;
            report.sent += 1;
            return Ok(());
        };

        let state = self
            .db
            .record_recipient_failure(recipient_id, &err.to_string(), self.executor.failure_kind(&err), now)
            .await?;
        if state != RecipientState::Failed {
            report.retried += 1;
            return Ok(());
        }

        report.failed += 1;
        if err.class() == ErrorClass::Permanent {
            info!(lead_id = %request.lead.id, error = %err, "Permanent failure, suppressing recipient");
            self.registry
                .suppress(
                    &request.lead.email,
                    SuppressionReason::PermanentFailure,
                    "delivery:transmission",
                )
                .await?;
        } else {
            warn!(
                transmission_id = %transmission.id,
                %recipient_id,
                "Recipient failed after max attempts"
            );
        }
        Ok(())
    }
}
