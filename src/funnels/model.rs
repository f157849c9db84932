//! Core types for funnels: ordered steps with delays, and lead enrollments.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::content::SendableContent;
use crate::error::CampaignError;
use crate::leads::Lead;

/// An ordered sequence of templated steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Funnel {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Funnel {
    pub fn new(name: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            enabled: true,
            created_at,
        }
    }
}

/// Unit of a step delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl DelayUnit {
    /// Day-scale units honour a fixed send time-of-day; shorter ones ignore it.
    pub fn is_calendar(&self) -> bool {
        matches!(self, DelayUnit::Days | DelayUnit::Weeks)
    }
}

impl std::fmt::Display for DelayUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DelayUnit::Minutes => write!(f, "minutes"),
            DelayUnit::Hours => write!(f, "hours"),
            DelayUnit::Days => write!(f, "days"),
            DelayUnit::Weeks => write!(f, "weeks"),
        }
    }
}

impl FromStr for DelayUnit {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minutes" => Ok(DelayUnit::Minutes),
            "hours" => Ok(DelayUnit::Hours),
            "days" => Ok(DelayUnit::Days),
            "weeks" => Ok(DelayUnit::Weeks),
            other => Err(format!("unknown delay unit: {other}")),
        }
    }
}

/// Last year a due time may fall in. Timestamps are stored as RFC 3339
/// text and compared as strings, which only orders four-digit years.
const LATEST_DUE_YEAR: i32 = 9999;

/// Compute a delay as a duration. Negative values clamp to zero; `None` if
/// the value does not fit in a `Duration`.
pub fn delay(value: i64, unit: DelayUnit) -> Option<Duration> {
    let value = value.max(0);
    match unit {
        DelayUnit::Minutes => Duration::try_minutes(value),
        DelayUnit::Hours => Duration::try_hours(value),
        DelayUnit::Days => Duration::try_days(value),
        DelayUnit::Weeks => Duration::try_weeks(value),
    }
}

/// One step of a funnel. Read-only to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelStep {
    pub id: Uuid,
    pub funnel_id: Uuid,
    pub position: i64,
    pub delay_value: i64,
    pub delay_unit: DelayUnit,
    /// Fixed UTC time-of-day, applied only to day/week delays.
    pub send_time: Option<NaiveTime>,
    pub enabled: bool,
    pub content: SendableContent,
}

impl FunnelStep {
    pub fn new(
        funnel_id: Uuid,
        position: i64,
        delay_value: i64,
        delay_unit: DelayUnit,
        content: SendableContent,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            funnel_id,
            position,
            delay_value,
            delay_unit,
            send_time: None,
            enabled: true,
            content,
        }
    }

    pub fn with_send_time(mut self, send_time: NaiveTime) -> Self {
        self.send_time = Some(send_time);
        self
    }

    /// When this step becomes due, counted from `from`.
    pub fn due_at(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, CampaignError> {
        let at = delay(self.delay_value, self.delay_unit)
            .and_then(|d| from.checked_add_signed(d))
            .filter(|at| at.year() <= LATEST_DUE_YEAR)
            .ok_or_else(|| CampaignError::DelayOutOfRange {
                position: self.position,
                delay: format!("{} {}", self.delay_value, self.delay_unit),
            })?;
        Ok(match self.send_time {
            Some(time) if self.delay_unit.is_calendar() => at.date_naive().and_time(time).and_utc(),
            _ => at,
        })
    }
}

/// The step following `position`, if any.
pub fn next_step(steps: &[FunnelStep], position: i64) -> Option<&FunnelStep> {
    steps
        .iter()
        .filter(|s| s.position > position)
        .min_by_key(|s| s.position)
}

/// Lifecycle of a lead's path through a funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    /// Recipient was suppressed before the step went out.
    Skipped,
    /// Permanent failure or retries exhausted.
    Failed,
}

impl EnrollmentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EnrollmentStatus::Active)
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnrollmentStatus::Active => write!(f, "active"),
            EnrollmentStatus::Completed => write!(f, "completed"),
            EnrollmentStatus::Skipped => write!(f, "skipped"),
            EnrollmentStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for EnrollmentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EnrollmentStatus::Active),
            "completed" => Ok(EnrollmentStatus::Completed),
            "skipped" => Ok(EnrollmentStatus::Skipped),
            "failed" => Ok(EnrollmentStatus::Failed),
            other => Err(format!("unknown enrollment status: {other}")),
        }
    }
}

/// A lead's position in a funnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelEnrollment {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub funnel_id: Uuid,
    /// Position of the step that goes out next. Never decreases.
    pub current_step_position: i64,
    pub next_send_at: DateTime<Utc>,
    pub status: EnrollmentStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FunnelEnrollment {
    /// Enroll at `now`, aimed at `first_step`.
    pub fn new(
        lead_id: Uuid,
        first_step: &FunnelStep,
        now: DateTime<Utc>,
    ) -> Result<Self, CampaignError> {
        Ok(Self {
            id: Uuid::new_v4(),
            lead_id,
            funnel_id: first_step.funnel_id,
            current_step_position: first_step.position,
            next_send_at: first_step.due_at(now)?,
            status: EnrollmentStatus::Active,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Where an enrollment goes after a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    To {
        position: i64,
        next_send_at: DateTime<Utc>,
    },
    Complete,
}

/// Decide the advance after the step at `position` was sent at `now`.
pub fn advance_after(
    steps: &[FunnelStep],
    position: i64,
    now: DateTime<Utc>,
) -> Result<Advance, CampaignError> {
    Ok(match next_step(steps, position) {
        Some(step) => Advance::To {
            position: step.position,
            next_send_at: step.due_at(now)?,
        },
        None => Advance::Complete,
    })
}

/// An enrollment selected by the eligibility query, with what it needs to send.
#[derive(Debug, Clone)]
pub struct DueEnrollment {
    pub enrollment: FunnelEnrollment,
    pub lead: Lead,
    pub step: FunnelStep,
}
