//! Ollama client used to enrich prompts before the texture stage.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::InvokeError;
use crate::config::OllamaConfig;

/// Instruction wrapped around the user's prompt for enhancement.
const ENHANCE_TEMPLATE: &str = "Rewrite the following description as a single detailed prompt \
for a text-to-image model producing a seamless texture. Mention materials, lighting and \
surface detail. Reply with the prompt only.\n\nDescription: ";

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateReply {
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsReply {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(config: &OllamaConfig) -> Result<Self, InvokeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|source| InvokeError::Http {
                url: config.url.clone(),
                source,
            })?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One non-streaming completion.
    pub async fn generate(&self, prompt: &str) -> Result<String, InvokeError> {
        let url = format!("{}/api/generate", self.base_url);
        let http_err = |source| InvokeError::Http {
            url: url.clone(),
            source,
        };
        let reply: GenerateReply = self
            .client
            .post(&url)
            .json(&GenerateBody {
                model: &self.model,
                prompt,
                stream: false,
            })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_err)?
            .json()
            .await
            .map_err(http_err)?;
        Ok(reply.response)
    }

    /// Rewrite `prompt` into a richer texture prompt. Empty replies keep the
    /// original text.
    pub async fn enhance(&self, prompt: &str) -> Result<String, InvokeError> {
        let reply = self.generate(&format!("{ENHANCE_TEMPLATE}{prompt}")).await?;
        let enhanced = reply.trim().trim_matches('"').trim();
        if enhanced.is_empty() {
            debug!("Ollama returned an empty enhancement, keeping prompt");
            return Ok(prompt.to_string());
        }
        info!(model = %self.model, original = %prompt, enhanced = %enhanced, "Prompt enhanced");
        Ok(enhanced.to_string())
    }

    /// Names of the models the server has pulled.
    pub async fn list_models(&self) -> Result<Vec<String>, InvokeError> {
        let url = format!("{}/api/tags", self.base_url);
        let http_err = |source| InvokeError::Http {
            url: url.clone(),
            source,
        };
        let reply: TagsReply = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_err)?
            .json()
            .await
            .map_err(http_err)?;
        Ok(reply.models.into_iter().map(|m| m.name).collect())
    }
}
