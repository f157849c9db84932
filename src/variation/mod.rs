//! AI copy variation.
//!
//! A variator rewrites a template's subject and HTML so repeated sends don't
//! go out byte-identical. The rewrite must keep every `{{ placeholder }}` and
//! every link of the original; anything else (provider error, timeout, bad
//! JSON, dropped token) falls back to the original template.

pub mod rig_variator;

pub use rig_variator::{LlmBackend, RigCopyVariator, VariationConfig, create_variator};

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::content::SendableContent;
use crate::error::VariationError;

/// Rewrites template copy.
#[async_trait]
pub trait CopyVariator: Send + Sync {
    /// Provider/model label for logs.
    fn name(&self) -> &str;

    /// Produce a variant of `content`. `scope_key` identifies the send source
    /// (funnel step, transmission, immediate send).
    async fn variate(
        &self,
        content: &SendableContent,
        scope_key: &str,
    ) -> Result<SendableContent, VariationError>;
}

#[derive(Debug, Deserialize)]
struct VariedCopy {
    subject: String,
    html: String,
}

/// Pull the `{subject, html}` object out of a model reply. Tolerates code
/// fences and prose around the JSON.
pub fn parse_variation_response(text: &str) -> Result<SendableContent, VariationError> {
    let start = text
        .find('{')
        .ok_or_else(|| VariationError::InvalidResponse("no JSON object in reply".into()))?;
    let end = text
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| VariationError::InvalidResponse("unterminated JSON object".into()))?;

    let copy: VariedCopy = serde_json::from_str(&text[start..=end])?;
    let varied = SendableContent::new(copy.subject, copy.html);
    varied
        .validate()
        .map_err(|e| VariationError::InvalidResponse(e.to_string()))?;
    Ok(varied)
}

/// Check that `varied` kept every placeholder and link of `original`.
pub fn validate_variation(
    original: &SendableContent,
    varied: &SendableContent,
) -> Result<(), VariationError> {
    let kept = varied.placeholders();
    if let Some(token) = original.placeholders().into_iter().find(|t| !kept.contains(t)) {
        return Err(VariationError::PlaceholderRemoved { token });
    }
    let kept = varied.links();
    if let Some(url) = original.links().into_iter().find(|u| !kept.contains(u)) {
        return Err(VariationError::LinkRemoved { url });
    }
    Ok(())
}

/// Run the variator with a deadline. Returns the content to send and whether
/// the variant was used.
pub async fn apply_variation(
    variator: &dyn CopyVariator,
    original: &SendableContent,
    scope_key: &str,
    timeout: Duration,
) -> (SendableContent, bool) {
    let result = match tokio::time::timeout(timeout, variator.variate(original, scope_key)).await {
        Ok(result) => result,
        Err(_) => Err(VariationError::Timeout { timeout }),
    };

    match result.and_then(|varied| validate_variation(original, &varied).map(|()| varied)) {
        Ok(varied) => {
            debug!(scope = scope_key, variator = variator.name(), "Copy variation applied");
            (varied, true)
        }
        Err(e) => {
            warn!(
                scope = scope_key,
                variator = variator.name(),
                error = %e,
                "Copy variation failed, sending original"
            );
            (original.clone(), false)
        }
    }
}
