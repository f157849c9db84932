//! Delivery executor: one send attempt, classified and written to the
//! delivery log. Callers own the row state (enrollment, recipient, immediate
//! send) and update it from the returned outcome.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::content::SendRequest;
use crate::delivery::DeliveryRecord;
use crate::delivery::mailer::{Mailer, OutboundEmail, classify_mailer_error};
use crate::error::{DeliveryError, ErrorClass};
use crate::sending::SendingAccount;
use crate::store::{Database, FailureKind};
use crate::variation::{CopyVariator, apply_variation};

/// Result of one attempt.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub error: Option<DeliveryError>,
    pub variation_applied: bool,
}

impl DeliveryOutcome {
    pub fn is_sent(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_ref().map(DeliveryError::class)
    }
}

pub struct DeliveryExecutor {
    db: Arc<dyn Database>,
    mailer: Arc<dyn Mailer>,
    variator: Option<Arc<dyn CopyVariator>>,
    clock: Arc<dyn Clock>,
    send_timeout: Duration,
    variation_timeout: Duration,
    max_attempts: u32,
}

impl DeliveryExecutor {
    pub fn new(db: Arc<dyn Database>, mailer: Arc<dyn Mailer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            mailer,
            variator: None,
            clock,
            send_timeout: Duration::from_secs(30),
            variation_timeout: Duration::from_secs(20),
            max_attempts: 5,
        }
    }

    pub fn with_variator(mut self, variator: Arc<dyn CopyVariator>, timeout: Duration) -> Self {
        self.variator = Some(variator);
        self.variation_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// How a failure should be recorded on its row.
    pub fn failure_kind(&self, error: &DeliveryError) -> FailureKind {
        match error.class() {
            ErrorClass::Transient => FailureKind::Transient {
                max_attempts: self.max_attempts,
            },
            ErrorClass::Permanent => FailureKind::Permanent,
        }
    }

    /// Vary (optionally), render and send `request` through `account`.
    pub async fn attempt_send(
        &self,
        request: &SendRequest,
        account: &SendingAccount,
    ) -> DeliveryOutcome {
        let scope_key = request.kind.scope_key();
        let (content, variation_applied) = match &self.variator {
            Some(variator) => {
                apply_variation(
                    variator.as_ref(),
                    &request.content,
                    &scope_key,
                    self.variation_timeout,
                )
                .await
            }
            None => (request.content.clone(), false),
        };

        let rendered = content.render(&request.lead.render_context());
        let email = OutboundEmail {
            to: request.lead.email.clone(),
            to_name: request.lead.name.clone(),
            subject: rendered.subject,
            html: rendered.html,
        };

        // A self-timed send runs to completion; cancelling it could still deliver.
        let send = self.mailer.send(&email, account);
        let error = if self.mailer.enforces_timeout() {
            send.await.err().map(|e| classify_mailer_error(&e))
        } else {
            match tokio::time::timeout(self.send_timeout, send).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(classify_mailer_error(&e)),
                Err(_) => Some(DeliveryError::Timeout {
                    timeout: self.send_timeout,
                }),
            }
        };

        match &error {
            None => info!(
                kind = request.kind.type_tag(),
                lead_id = %request.lead.id,
                account = %account.name,
                variation_applied,
                "Email sent"
            ),
            Some(e) => warn!(
                kind = request.kind.type_tag(),
                lead_id = %request.lead.id,
                account = %account.name,
                class = %e.class(),
                error = %e,
                "Send attempt failed"
            ),
        }

        let record = DeliveryRecord {
            id: Uuid::new_v4(),
            kind: request.kind.type_tag().to_string(),
            reference_id: request.kind.reference_id(),
            lead_id: request.lead.id,
            email: email.to,
            account_id: account.id,
            account_name: account.name.clone(),
            subject: email.subject,
            sent: error.is_none(),
            error_class: error.as_ref().map(DeliveryError::class),
            error: error.as_ref().map(ToString::to_string),
            variation_applied,
            attempted_at: self.clock.now(),
        };
        // Audit write failures never change the attempt's outcome.
        if let Err(e) = self.db.record_delivery(&record).await {
            warn!(error = %e, "Failed to write delivery log");
        }

        DeliveryOutcome {
            error,
            variation_applied,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::clock::SystemClock;
    use crate::content::{SendKind, SendableContent};
    use crate::error::{MailerError, VariationError};
    use crate::leads::Lead;
    use crate::store::LibSqlBackend;

    struct StubMailer {
        reply: Option<MailerError>,
        delay: Option<Duration>,
        self_timed: bool,
        sent: Mutex<Vec<OutboundEmail>>,
    }

    impl StubMailer {
        fn new(reply: Option<MailerError>) -> Self {
            Self {
                reply,
                delay: None,
                self_timed: false,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Mailer for StubMailer {
        async fn send(
            &self,
            email: &OutboundEmail,
            _account: &SendingAccount,
        ) -> Result<(), MailerError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.sent.lock().unwrap().push(email.clone());
            match &self.reply {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        fn enforces_timeout(&self) -> bool {
            self.self_timed
        }
    }

    struct Shouty;

    #[async_trait]
    impl CopyVariator for Shouty {
        fn name(&self) -> &str {
            "shouty"
        }

        async fn variate(
            &self,
            content: &SendableContent,
            _scope_key: &str,
        ) -> Result<SendableContent, VariationError> {
            Ok(SendableContent::new(
                content.subject.to_uppercase().replace("{{FIRST_NAME}}", "{{first_name}}"),
                content.html.clone(),
            ))
        }
    }

    async fn executor(mailer: Arc<StubMailer>) -> (DeliveryExecutor, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let exec = DeliveryExecutor::new(db.clone(), mailer, Arc::new(SystemClock));
        (exec, db)
    }

    fn request() -> SendRequest {
        SendRequest {
            kind: SendKind::Immediate {
                send_id: Uuid::new_v4(),
            },
            lead: Lead::new("ana@example.com", Some("Ana Lima")),
            content: SendableContent::new("Hi {{first_name}}", "<p>Hello {{ name }}</p>"),
        }
    }

    fn account() -> SendingAccount {
        SendingAccount::new("primary", "sales@example.com", "smtp.example.com", 0)
    }

    #[tokio::test]
    async fn renders_sends_and_logs() {
        let mailer = Arc::new(StubMailer::new(None));
        let (exec, db) = executor(mailer.clone()).await;

        let outcome = exec.attempt_send(&request(), &account()).await;
        assert!(outcome.is_sent());
        assert!(!outcome.variation_applied);

        let sent = mailer.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Hi Ana");
        assert_eq!(sent[0].html, "<p>Hello Ana Lima</p>");

        let log = db.list_delivery_log(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].sent);
        assert_eq!(log[0].kind, "immediate");
        assert_eq!(log[0].account_name, "primary");
    }

    #[tokio::test]
    async fn hard_bounce_is_permanent() {
        let mailer = Arc::new(StubMailer::new(Some(MailerError::Rejected {
            code: 550,
            message: "no such user".into(),
        })));
        let (exec, db) = executor(mailer).await;

        let outcome = exec.attempt_send(&request(), &account()).await;
        assert_eq!(outcome.error_class(), Some(ErrorClass::Permanent));
        assert_eq!(exec.failure_kind(outcome.error.as_ref().unwrap()), FailureKind::Permanent);

        let log = db.list_delivery_log(10).await.unwrap();
        assert!(!log[0].sent);
        assert_eq!(log[0].error_class, Some(ErrorClass::Permanent));
    }

    #[tokio::test]
    async fn slow_mailer_times_out_as_transient() {
        let mut stub = StubMailer::new(None);
        stub.delay = Some(Duration::from_secs(5));
        let (exec, _) = executor(Arc::new(stub)).await;
        let exec = exec
            .with_send_timeout(Duration::from_millis(50))
            .with_max_attempts(3);

        let outcome = exec.attempt_send(&request(), &account()).await;
        assert!(matches!(outcome.error, Some(DeliveryError::Timeout { .. })));
        assert_eq!(
            exec.failure_kind(outcome.error.as_ref().unwrap()),
            FailureKind::Transient { max_attempts: 3 }
        );
    }

    #[tokio::test]
    async fn self_timed_mailer_is_not_cancelled() {
        let mut stub = StubMailer::new(None);
        stub.delay = Some(Duration::from_millis(200));
        stub.self_timed = true;
        let mailer = Arc::new(stub);
        let (exec, db) = executor(mailer.clone()).await;
        let exec = exec.with_send_timeout(Duration::from_millis(50));

        // The send outlives the executor's timeout but is reported as the
        // success it was, so it is never retried.
        let outcome = exec.attempt_send(&request(), &account()).await;
        assert!(outcome.error.is_none());
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
        assert!(db.list_delivery_log(1).await.unwrap()[0].sent);
    }

    #[tokio::test]
    async fn variation_applies_before_render() {
        let mailer = Arc::new(StubMailer::new(None));
        let (exec, db) = executor(mailer.clone()).await;
        let exec = exec.with_variator(Arc::new(Shouty), Duration::from_secs(1));

        let outcome = exec.attempt_send(&request(), &account()).await;
        assert!(outcome.variation_applied);
        assert_eq!(mailer.sent.lock().unwrap()[0].subject, "HI Ana");
        assert!(db.list_delivery_log(1).await.unwrap()[0].variation_applied);
    }
}
