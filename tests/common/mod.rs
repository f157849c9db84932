//! Shared harness: in-memory store, manual clock, recording mailer.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use outreach_engine::Engine;
use outreach_engine::clock::ManualClock;
use outreach_engine::config::EngineConfig;
use outreach_engine::content::SendableContent;
use outreach_engine::delivery::{Mailer, OutboundEmail};
use outreach_engine::error::{MailerError, VariationError};
use outreach_engine::leads::Lead;
use outreach_engine::sending::{SendingAccount, SendingSettings};
use outreach_engine::store::{Database, LibSqlBackend};
use outreach_engine::variation::CopyVariator;

/// Monday morning, far from any UTC midnight.
pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-03-03T09:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// How the recording mailer answers for a given recipient.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Transient,
    Permanent,
}

/// One message the mailer accepted or refused.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub account: String,
}

#[derive(Default)]
pub struct RecordingMailer {
    pub attempts: Mutex<Vec<Delivered>>,
    replies: Mutex<HashMap<String, Reply>>,
    latency: Mutex<Option<(ManualClock, chrono::Duration)>>,
}

impl RecordingMailer {
    pub fn fail(&self, email: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(email.to_string(), reply);
    }

    /// Every send moves `clock` forward by `by` before it returns.
    pub fn slow_down(&self, clock: &ManualClock, by: chrono::Duration) {
        *self.latency.lock().unwrap() = Some((clock.clone(), by));
    }

    pub fn heal(&self, email: &str) {
        self.replies.lock().unwrap().remove(email);
    }

    pub fn attempts(&self) -> Vec<Delivered> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn recipients(&self) -> Vec<String> {
        self.attempts().into_iter().map(|d| d.to).collect()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutboundEmail, account: &SendingAccount) -> Result<(), MailerError> {
        self.attempts.lock().unwrap().push(Delivered {
            to: email.to.clone(),
            subject: email.subject.clone(),
            html: email.html.clone(),
            account: account.name.clone(),
        });
        if let Some((clock, by)) = self.latency.lock().unwrap().as_ref() {
            clock.advance(*by);
        }
        match self.replies.lock().unwrap().get(&email.to) {
            None => Ok(()),
            Some(Reply::Transient) => Err(MailerError::Rejected {
                code: 451,
                message: "try again later".into(),
            }),
            Some(Reply::Permanent) => Err(MailerError::Rejected {
                code: 550,
                message: "mailbox unavailable".into(),
            }),
        }
    }
}

/// Prefixes the subject; optionally drops every placeholder.
pub struct PrefixVariator {
    pub break_placeholders: bool,
}

#[async_trait]
impl CopyVariator for PrefixVariator {
    fn name(&self) -> &str {
        "prefix"
    }

    async fn variate(
        &self,
        content: &SendableContent,
        _scope_key: &str,
    ) -> Result<SendableContent, VariationError> {
        let html = if self.break_placeholders {
            "<p>Hello there</p>".to_string()
        } else {
            content.html.clone()
        };
        Ok(SendableContent::new(format!("Quick note: {}", content.subject), html))
    }
}

pub struct Harness {
    pub engine: Engine,
    pub db: Arc<dyn Database>,
    pub clock: ManualClock,
    pub mailer: Arc<RecordingMailer>,
}

impl Harness {
    /// No interval, generous daily cap, one account.
    pub async fn new() -> Self {
        Self::with_settings(
            SendingSettings {
                daily_limit: 1000,
                min_interval_seconds: 0,
                rotation_chunk_size: 10,
            },
            1,
        )
        .await
    }

    pub async fn with_settings(settings: SendingSettings, accounts: usize) -> Self {
        Self::build(settings, accounts, None).await
    }

    pub async fn with_variator(variator: Arc<dyn CopyVariator>) -> Self {
        Self::build(
            SendingSettings {
                daily_limit: 1000,
                min_interval_seconds: 0,
                rotation_chunk_size: 10,
            },
            1,
            Some(variator),
        )
        .await
    }

    async fn build(
        settings: SendingSettings,
        accounts: usize,
        variator: Option<Arc<dyn CopyVariator>>,
    ) -> Self {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.save_sending_settings(&settings, start_time()).await.unwrap();
        for i in 0..accounts {
            let account = SendingAccount::new(
                &format!("acct-{i}"),
                &format!("sender{i}@outreach.test"),
                "smtp.outreach.test",
                i as i64,
            );
            db.insert_sending_account(&account).await.unwrap();
        }

        let clock = ManualClock::new(start_time());
        let mailer = Arc::new(RecordingMailer::default());
        let engine = Engine::new(
            Arc::clone(&db),
            Arc::new(clock.clone()),
            mailer.clone(),
            variator,
            EngineConfig::default(),
        );
        Self {
            engine,
            db,
            clock,
            mailer,
        }
    }

    /// Insert a lead created `age_days` before the start time.
    pub async fn lead(&self, email: &str, age_days: i64) -> Lead {
        let lead = Lead::new(email, Some("Ada Lovelace"))
            .with_created_at(start_time() - chrono::Duration::days(age_days));
        self.db.insert_lead(&lead).await.unwrap();
        lead
    }
}

pub fn content() -> SendableContent {
    SendableContent::new(
        "Hello {{first_name}}",
        r#"<p>Hi {{first_name}}, see <a href="https://outreach.test/offer">the offer</a>.</p>"#,
    )
}
