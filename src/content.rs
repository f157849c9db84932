//! Sendable content shared by funnel steps, transmissions and immediate sends.
//!
//! Templates carry `{{ token }}` placeholders that are filled from the lead at
//! render time. The same [`SendRequest`] shape flows through suppression,
//! rate limiting and delivery regardless of where the send originated.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CampaignError;
use crate::leads::Lead;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex is valid")
});

static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:href|src)\s*=\s*["']([^"']+)["']"#).expect("link regex is valid")
});

/// Subject + HTML body, still containing placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendableContent {
    pub subject: String,
    pub html: String,
}

impl SendableContent {
    pub fn new(subject: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            html: html.into(),
        }
    }

    /// Reject content that cannot be sent at all.
    pub fn validate(&self) -> Result<(), CampaignError> {
        if self.subject.trim().is_empty() {
            return Err(CampaignError::MissingContent {
                reason: "subject is empty".to_string(),
            });
        }
        if self.html.trim().is_empty() {
            return Err(CampaignError::MissingContent {
                reason: "html body is empty".to_string(),
            });
        }
        Ok(())
    }

    /// Every placeholder token used in subject or body, normalised (`{{name}}`).
    pub fn placeholders(&self) -> BTreeSet<String> {
        [&self.subject, &self.html]
            .into_iter()
            .flat_map(|text| PLACEHOLDER_RE.captures_iter(text))
            .map(|caps| format!("{{{{{}}}}}", &caps[1]))
            .collect()
    }

    /// Every `href`/`src` target in the body.
    pub fn links(&self) -> BTreeSet<String> {
        LINK_RE
            .captures_iter(&self.html)
            .map(|caps| caps[1].to_string())
            .collect()
    }

    /// Fill placeholders from `ctx`. Unknown tokens render empty.
    pub fn render(&self, ctx: &RenderContext) -> RenderedEmail {
        RenderedEmail {
            subject: substitute(&self.subject, ctx),
            html: substitute(&self.html, ctx),
        }
    }
}

fn substitute(template: &str, ctx: &RenderContext) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            ctx.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Values available to placeholders.
pub type RenderContext = HashMap<String, String>;

/// Final subject + HTML, ready for the mailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

/// Where a send originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SendKind {
    FunnelStep {
        enrollment_id: Uuid,
        funnel_id: Uuid,
        step_position: i64,
    },
    Transmission {
        transmission_id: Uuid,
        recipient_id: Uuid,
    },
    Immediate {
        send_id: Uuid,
    },
}

impl SendKind {
    /// The string tag stored in the delivery log.
    pub fn type_tag(&self) -> &'static str {
        match self {
            SendKind::FunnelStep { .. } => "funnel_step",
            SendKind::Transmission { .. } => "transmission",
            SendKind::Immediate { .. } => "immediate",
        }
    }

    /// Id of the row the outcome is written back to.
    pub fn reference_id(&self) -> Uuid {
        match self {
            SendKind::FunnelStep { enrollment_id, .. } => *enrollment_id,
            SendKind::Transmission { recipient_id, .. } => *recipient_id,
            SendKind::Immediate { send_id } => *send_id,
        }
    }

    /// Key handed to the copy variator so variations can be grouped per source.
    pub fn scope_key(&self) -> String {
        match self {
            SendKind::FunnelStep {
                funnel_id,
                step_position,
                ..
            } => format!("funnel:{funnel_id}:{step_position}"),
            SendKind::Transmission {
                transmission_id, ..
            } => format!("transmission:{transmission_id}"),
            SendKind::Immediate { send_id } => format!("immediate:{send_id}"),
        }
    }
}

/// One pending outbound message.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub kind: SendKind,
    pub lead: Lead,
    pub content: SendableContent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_normalised() {
        let content = SendableContent::new(
            "Hi {{ first_name }}",
            "<p>{{first_name}}, see {{ offer.url }}</p>",
        );
        let tokens: Vec<String> = content.placeholders().into_iter().collect();
        assert_eq!(tokens, vec!["{{first_name}}", "{{offer.url}}"]);
    }

    #[test]
    fn render_fills_known_and_blanks_unknown() {
        let content = SendableContent::new("Hi {{first_name}}", "<p>{{ email }} {{missing}}</p>");
        let mut ctx = RenderContext::new();
        ctx.insert("first_name".into(), "Ana".into());
        ctx.insert("email".into(), "ana@example.com".into());
        let out = content.render(&ctx);
        assert_eq!(out.subject, "Hi Ana");
        assert_eq!(out.html, "<p>ana@example.com </p>");
    }

    #[test]
    fn links_extracted_from_href_and_src() {
        let content = SendableContent::new(
            "s",
            r#"<a href="https://a.example/x">x</a><img src='https://cdn.example/i.png'>"#,
        );
        let links = content.links();
        assert!(links.contains("https://a.example/x"));
        assert!(links.contains("https://cdn.example/i.png"));
    }

    #[test]
    fn validate_rejects_empty_parts() {
        assert!(SendableContent::new("", "<p>x</p>").validate().is_err());
        assert!(SendableContent::new("s", "  ").validate().is_err());
        assert!(SendableContent::new("s", "<p>x</p>").validate().is_ok());
    }

    #[test]
    fn scope_key_per_kind() {
        let id = Uuid::new_v4();
        let kind = SendKind::Immediate { send_id: id };
        assert_eq!(kind.scope_key(), format!("immediate:{id}"));
        assert_eq!(kind.type_tag(), "immediate");
        assert_eq!(kind.reference_id(), id);
    }
}
