//! Sending identities and the persisted rate/rotation state.
//!
//! [`SendingConfig::try_acquire`] is the pure decision behind the limiter;
//! the store runs it inside one immediate transaction so the daily counter
//! and the rotation cursor are read and written as a unit.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use secrecy::SecretString;
use uuid::Uuid;

/// An outbound identity (SMTP login + from address).
#[derive(Debug, Clone)]
pub struct SendingAccount {
    pub id: Uuid,
    pub name: String,
    pub from_address: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: SecretString,
    pub enabled: bool,
    /// Rotation order; lower goes first.
    pub position: i64,
}

impl SendingAccount {
    pub fn new(name: &str, from_address: &str, smtp_host: &str, position: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            from_address: from_address.to_string(),
            smtp_host: smtp_host.to_string(),
            smtp_port: 587,
            smtp_username: from_address.to_string(),
            smtp_password: SecretString::from(String::new()),
            enabled: true,
            position,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.smtp_username = username.to_string();
        self.smtp_password = SecretString::from(password.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.smtp_port = port;
        self
    }
}

/// Operator-tunable limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendingSettings {
    pub daily_limit: u32,
    pub min_interval_seconds: u64,
    pub rotation_chunk_size: u32,
}

impl Default for SendingSettings {
    fn default() -> Self {
        Self {
            daily_limit: 200,
            min_interval_seconds: 60,
            rotation_chunk_size: 10,
        }
    }
}

/// Why a send slot was refused. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDenied {
    DailyLimit { sent_today: u32, limit: u32 },
    Interval { retry_at: DateTime<Utc> },
    NoAccounts,
}

impl std::fmt::Display for SlotDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotDenied::DailyLimit { sent_today, limit } => {
                write!(f, "daily limit reached ({sent_today}/{limit})")
            }
            SlotDenied::Interval { retry_at } => {
                write!(f, "minimum interval not elapsed (retry at {retry_at})")
            }
            SlotDenied::NoAccounts => write!(f, "no enabled sending accounts"),
        }
    }
}

/// Process-wide singleton row: limits, today's counter, rotation cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendingConfig {
    pub settings: SendingSettings,
    pub emails_sent_today: u32,
    /// UTC day `emails_sent_today` belongs to.
    pub counter_date: NaiveDate,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub current_account_index: u32,
    /// Sends left on the current account before rotating.
    pub remaining_chunk: u32,
}

impl SendingConfig {
    pub fn new(settings: SendingSettings, today: NaiveDate) -> Self {
        Self {
            settings,
            emails_sent_today: 0,
            counter_date: today,
            last_sent_at: None,
            current_account_index: 0,
            remaining_chunk: settings.rotation_chunk_size.max(1),
        }
    }

    fn chunk_size(&self) -> u32 {
        self.settings.rotation_chunk_size.max(1)
    }

    /// Zero the daily counter when `now` falls on a later UTC day.
    pub fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.counter_date {
            self.emails_sent_today = 0;
            self.counter_date = today;
        }
    }

    /// Try to take one send slot against `account_count` enabled accounts.
    ///
    /// On success returns the index of the account to use and mutates the
    /// counter, `last_sent_at` and the rotation cursor. On denial nothing
    /// changes except a possible day rollover.
    pub fn try_acquire(
        &mut self,
        now: DateTime<Utc>,
        account_count: usize,
    ) -> Result<usize, SlotDenied> {
        self.roll_day(now);

        if self.emails_sent_today >= self.settings.daily_limit {
            return Err(SlotDenied::DailyLimit {
                sent_today: self.emails_sent_today,
                limit: self.settings.daily_limit,
            });
        }

        if let Some(last) = self.last_sent_at {
            let min_gap = Duration::seconds(self.settings.min_interval_seconds as i64);
            if now - last < min_gap {
                return Err(SlotDenied::Interval {
                    retry_at: last + min_gap,
                });
            }
        }

        if account_count == 0 {
            return Err(SlotDenied::NoAccounts);
        }

        let index = self.current_account_index as usize % account_count;
        let remaining = match self.remaining_chunk {
            0 => self.chunk_size(),
            n => n.min(self.chunk_size()),
        } - 1;

        if remaining == 0 {
            self.current_account_index = ((index + 1) % account_count) as u32;
            self.remaining_chunk = self.chunk_size();
        } else {
            self.current_account_index = index as u32;
            self.remaining_chunk = remaining;
        }

        self.emails_sent_today += 1;
        self.last_sent_at = Some(now);
        Ok(index)
    }
}
