//! OpenAI-compatible chat completions backend (xAI Grok, Cerebras).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{Capabilities, GenerationRequest, Generator, ProviderError};

pub struct OpenAiCompatibleProvider {
    provider: &'static str,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        provider: &'static str,
        api_key: String,
        base_url: String,
        model: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ProviderError::Transport { provider, source })?;

        Ok(OpenAiCompatibleProvider {
            provider,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl Generator for OpenAiCompatibleProvider {
    fn name(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::TEXT
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, ProviderError> {
        if request.image.is_some() {
            warn!(provider = self.provider, "Backend has no vision support, image ignored");
        }
        debug!(
            provider = self.provider,
            model = %self.model,
            max_tokens = request.max_tokens,
            temperature = request.temperature,
            "Invoking chat completions backend"
        );

        let body = ChatRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: vec![ChatMessage {
                role: "user",
                content: request.prompt,
            }],
        };

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: self.provider,
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                provider: self.provider,
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse =
            response
                .json()
                .await
                .map_err(|source| ProviderError::Transport {
                    provider: self.provider,
                    source,
                })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.is_empty())
            .ok_or(ProviderError::EmptyResponse {
                provider: self.provider,
            })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_trimmed_from_base_url() {
        let provider = OpenAiCompatibleProvider::new(
            "xai",
            "key".into(),
            "https://api.x.ai/v1/".into(),
            "grok-code-fast-1".into(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(provider.completions_url(), "https://api.x.ai/v1/chat/completions");
        assert_eq!(provider.name(), "xai/grok-code-fast-1");
    }

    #[test]
    fn test_response_content_parsed() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"class A(Scene): pass"}}]}"#,
        )
        .unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("class A(Scene): pass")
        );
    }
}
