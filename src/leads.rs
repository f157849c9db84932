//! Lead records produced by inbound webhook ingestion.
//!
//! The engine never deletes leads; it only flips the suppression flag and
//! reads recipient data for rendering.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::content::RenderContext;

/// Lifecycle status of a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Active,
    Abandoned,
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeadStatus::Active => write!(f, "active"),
            LeadStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl FromStr for LeadStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LeadStatus::Active),
            "abandoned" => Ok(LeadStatus::Abandoned),
            other => Err(format!("unknown lead status: {other}")),
        }
    }
}

/// A recipient known to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub status: LeadStatus,
    pub suppressed: bool,
    /// Free-form fields available to templates (`{{ plan }}`, `{{ city }}`...).
    pub fields: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(email: &str, name: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email: normalize_email(email),
            name: name.map(str::to_string),
            status: LeadStatus::Active,
            suppressed: false,
            fields: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    pub fn with_status(mut self, status: LeadStatus) -> Self {
        self.status = status;
        self
    }

    pub fn first_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .and_then(|n| n.split_whitespace().next())
    }

    /// Placeholder values for this lead. Custom fields never override the
    /// built-in `email`, `name` and `first_name` keys.
    pub fn render_context(&self) -> RenderContext {
        let mut ctx = RenderContext::new();
        if let Some(obj) = self.fields.as_object() {
            for (key, value) in obj {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                ctx.insert(key.clone(), text);
            }
        }
        ctx.insert("email".into(), self.email.clone());
        ctx.insert("name".into(), self.name.clone().unwrap_or_default());
        ctx.insert(
            "first_name".into(),
            self.first_name().unwrap_or_default().to_string(),
        );
        ctx
    }
}

/// Canonical form used for suppression lookups and storage.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_lead_normalises_email() {
        let lead = Lead::new("  Ana@Example.COM ", Some("Ana Lima"));
        assert_eq!(lead.email, "ana@example.com");
        assert_eq!(lead.first_name(), Some("Ana"));
    }

    #[test]
    fn render_context_merges_fields() {
        let mut lead = Lead::new("bo@example.com", None);
        lead.fields = serde_json::json!({"plan": "pro", "seats": 3, "email": "spoof"});
        let ctx = lead.render_context();
        assert_eq!(ctx["plan"], "pro");
        assert_eq!(ctx["seats"], "3");
        assert_eq!(ctx["email"], "bo@example.com");
        assert_eq!(ctx["first_name"], "");
    }

    #[test]
    fn status_display_parse() {
        for status in [LeadStatus::Active, LeadStatus::Abandoned] {
            let parsed: LeadStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("gone".parse::<LeadStatus>().is_err());
    }
}
