//! Outbound mail transport: SMTP via lettre, one relay per sending account.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::error::{DeliveryError, MailerError};
use crate::sending::SendingAccount;

/// A fully rendered message addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html: String,
}

/// External mail provider. Implementations report raw transport failures;
/// classification happens in [`classify_mailer_error`].
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail, account: &SendingAccount)
    -> Result<(), MailerError>;

    /// Whether `send` bounds its own duration. The executor does not cancel
    /// such a send with its outer timeout.
    fn enforces_timeout(&self) -> bool {
        false
    }
}

/// SMTP mailer. Builds a relay per call from the account's credentials.
///
/// The send runs on a blocking thread that cannot be cancelled, so the time
/// limit is lettre's per-operation socket timeout and the executor never
/// abandons a transaction that may still complete.
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    timeout: Duration,
}

impl SmtpMailer {
    /// `timeout` applies to each SMTP read, write and connect.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for SmtpMailer {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(
        &self,
        email: &OutboundEmail,
        account: &SendingAccount,
    ) -> Result<(), MailerError> {
        let message = build_message(email, account)?;
        let account = account.clone();
        let timeout = self.timeout;

        // lettre's SmtpTransport is blocking.
        tokio::task::spawn_blocking(move || {
            let transport = build_transport(&account, timeout)?;
            transport.send(&message).map_err(map_smtp_error)?;
            Ok(())
        })
        .await
        .map_err(|e| MailerError::Connection(format!("send task failed: {e}")))?
    }

    fn enforces_timeout(&self) -> bool {
        true
    }
}

fn build_transport(account: &SendingAccount, timeout: Duration) -> Result<SmtpTransport, MailerError> {
    let creds = Credentials::new(
        account.smtp_username.clone(),
        account.smtp_password.expose_secret().to_string(),
    );

    // 465 is implicit TLS; everything else negotiates STARTTLS.
    let builder = if account.smtp_port == 465 {
        SmtpTransport::relay(&account.smtp_host)
    } else {
        SmtpTransport::starttls_relay(&account.smtp_host)
    }
    .map_err(|e| MailerError::Connection(format!("SMTP relay error: {e}")))?;

    Ok(builder
        .port(account.smtp_port)
        .credentials(creds)
        .timeout(Some(timeout))
        .build())
}

/// Build the MIME message. A bad recipient address is `InvalidAddress`; a
/// bad sender address is the account's problem and reported as `Build`.
pub fn build_message(email: &OutboundEmail, account: &SendingAccount) -> Result<Message, MailerError> {
    let from: Mailbox = account
        .from_address
        .parse()
        .map_err(|e| MailerError::Build(format!("Invalid from address: {e}")))?;

    let mut to: Mailbox = email.to.parse().map_err(|e| MailerError::InvalidAddress {
        address: email.to.clone(),
        reason: format!("{e}"),
    })?;
    if let Some(name) = email.to_name.as_deref().filter(|n| !n.trim().is_empty()) {
        to.name = Some(name.to_string());
    }

    Message::builder()
        .from(from)
        .to(to)
        .subject(email.subject.clone())
        .multipart(MultiPart::alternative_plain_html(
            strip_html(&email.html),
            email.html.clone(),
        ))
        .map_err(|e| MailerError::Build(format!("Failed to build email: {e}")))
}

fn map_smtp_error(e: lettre::transport::smtp::Error) -> MailerError {
    if let Some(code) = e.status() {
        let fallback = if e.is_permanent() { 550 } else { 451 };
        return MailerError::Rejected {
            code: code.to_string().parse().unwrap_or(fallback),
            message: e.to_string(),
        };
    }
    if e.is_timeout() {
        return MailerError::Timeout;
    }
    MailerError::Connection(e.to_string())
}

/// Map a transport failure onto the retry policy.
///
/// Recipient-side rejections (bad address, 5xx) are permanent. The 5xx
/// authentication replies are about the sending account, not the recipient,
/// and stay transient so the recipient is never suppressed for them.
pub fn classify_mailer_error(err: &MailerError) -> DeliveryError {
    let reason = err.to_string();
    match err {
        MailerError::InvalidAddress { .. } => DeliveryError::PermanentProvider { reason },
        MailerError::Rejected { code, .. } => match code {
            530 | 534 | 535 | 538 => DeliveryError::TransientProvider { reason },
            500..=599 => DeliveryError::PermanentProvider { reason },
            _ => DeliveryError::TransientProvider { reason },
        },
        MailerError::Connection(_) | MailerError::Timeout | MailerError::Build(_) => {
            DeliveryError::TransientProvider { reason }
        }
    }
}

/// Plain-text alternative of an HTML body.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
