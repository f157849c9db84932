//! Copy variator backed by rig-core (Anthropic or OpenAI).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rig::agent::Agent;
use rig::client::CompletionClient;
use rig::completion::{CompletionModel, Prompt};
use secrecy::{ExposeSecret, SecretString};

use crate::content::SendableContent;
use crate::error::VariationError;
use crate::variation::{CopyVariator, parse_variation_response};

const PREAMBLE: &str = "You rewrite marketing emails so that repeated sends are not identical. \
Keep the meaning, tone, language and approximate length. \
Every placeholder written as {{ name }} must appear unchanged in your output, \
and every URL must be kept exactly as given. \
Reply with a single JSON object {\"subject\": \"...\", \"html\": \"...\"} and nothing else.";

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl FromStr for LlmBackend {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" => Ok(LlmBackend::Anthropic),
            "openai" => Ok(LlmBackend::OpenAi),
            other => Err(format!("unknown LLM backend: {other} (expected anthropic or openai)")),
        }
    }
}

impl std::fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmBackend::Anthropic => write!(f, "anthropic"),
            LlmBackend::OpenAi => write!(f, "openai"),
        }
    }
}

/// Configuration for the copy variator. Absent when no API key is set.
#[derive(Debug, Clone)]
pub struct VariationConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
    pub timeout: Duration,
}

/// rig agent with a fixed rewriting preamble.
pub struct RigCopyVariator<M: CompletionModel> {
    agent: Agent<M>,
    label: String,
}

impl<M: CompletionModel> RigCopyVariator<M> {
    pub fn new(agent: Agent<M>, backend: LlmBackend, model: &str) -> Self {
        Self {
            agent,
            label: format!("{backend}:{model}"),
        }
    }
}

#[async_trait]
impl<M> CopyVariator for RigCopyVariator<M>
where
    M: CompletionModel + 'static,
{
    fn name(&self) -> &str {
        &self.label
    }

    async fn variate(
        &self,
        content: &SendableContent,
        scope_key: &str,
    ) -> Result<SendableContent, VariationError> {
        let request = serde_json::json!({
            "source": scope_key,
            "subject": content.subject,
            "html": content.html,
        })
        .to_string();

        let reply: String = self.agent.prompt(request.as_str()).await.map_err(|e| {
            VariationError::RequestFailed {
                provider: self.label.clone(),
                reason: e.to_string(),
            }
        })?;
        parse_variation_response(&reply)
    }
}

/// Create a copy variator from configuration.
pub fn create_variator(config: &VariationConfig) -> Result<Arc<dyn CopyVariator>, VariationError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_variator(config),
        LlmBackend::OpenAi => create_openai_variator(config),
    }
}

fn create_anthropic_variator(
    config: &VariationConfig,
) -> Result<Arc<dyn CopyVariator>, VariationError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            VariationError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {e}"),
            }
        })?;

    let agent = client
        .agent(&config.model)
        .preamble(PREAMBLE)
        .max_tokens(4096)
        .build();
    tracing::info!("Copy variation using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigCopyVariator::new(
        agent,
        LlmBackend::Anthropic,
        &config.model,
    )))
}

fn create_openai_variator(
    config: &VariationConfig,
) -> Result<Arc<dyn CopyVariator>, VariationError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            VariationError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {e}"),
            }
        })?;

    let agent = client
        .agent(&config.model)
        .preamble(PREAMBLE)
        .max_tokens(4096)
        .build();
    tracing::info!("Copy variation using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigCopyVariator::new(
        agent,
        LlmBackend::OpenAi,
        &config.model,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: LlmBackend, model: &str) -> VariationConfig {
        VariationConfig {
            backend,
            api_key: SecretString::from("test-key"),
            model: model.to_string(),
            timeout: Duration::from_secs(20),
        }
    }

    #[tokio::test]
    async fn anthropic_variator_constructs() {
        // Clients accept any key at construction; auth fails on first request.
        let variator = create_variator(&config(LlmBackend::Anthropic, "claude-3-5-haiku-latest"));
        assert_eq!(variator.unwrap().name(), "anthropic:claude-3-5-haiku-latest");
    }

    #[tokio::test]
    async fn openai_variator_constructs() {
        let variator = create_variator(&config(LlmBackend::OpenAi, "gpt-4o-mini"));
        assert_eq!(variator.unwrap().name(), "openai:gpt-4o-mini");
    }

    #[test]
    fn backend_parsing() {
        assert_eq!("OpenAI".parse::<LlmBackend>().unwrap(), LlmBackend::OpenAi);
        assert_eq!("anthropic".parse::<LlmBackend>().unwrap(), LlmBackend::Anthropic);
        assert!("mistral".parse::<LlmBackend>().is_err());
    }
}
