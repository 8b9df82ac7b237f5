//! Anthropic Messages API backend. The only backend that accepts images.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{Capabilities, GenerationRequest, Generator, ProviderError};

const PROVIDER: &str = "anthropic";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ProviderError::Transport {
                provider: PROVIDER,
                source,
            })?;

        Ok(AnthropicProvider {
            client,
            base_url,
            api_key,
            model,
        })
    }

    fn build_request<'a>(&'a self, request: &'a GenerationRequest<'a>) -> MessagesRequest<'a> {
        let mut content = Vec::with_capacity(2);
        if let Some(image) = request.image {
            content.push(ContentBlock::Image {
                source: ImageSource {
                    kind: "base64",
                    media_type: &image.media_type,
                    data: &image.data,
                },
            });
        }
        content.push(ContentBlock::Text {
            text: request.prompt,
        });

        MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: vec![Message {
                role: "user",
                content,
            }],
        }
    }
}

#[async_trait]
impl Generator for AnthropicProvider {
    fn name(&self) -> String {
        format!("{PROVIDER}/{}", self.model)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::TEXT_AND_VISION
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, ProviderError> {
        debug!(
            provider = PROVIDER,
            model = %self.model,
            max_tokens = request.max_tokens,
            temperature = request.temperature,
            with_image = request.image.is_some(),
            "Invoking Anthropic backend"
        );

        let body = self.build_request(request);
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: PROVIDER,
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                provider: PROVIDER,
                status: status.as_u16(),
                body,
            });
        }

        let parsed: MessagesResponse =
            response
                .json()
                .await
                .map_err(|source| ProviderError::Transport {
                    provider: PROVIDER,
                    source,
                })?;

        let text = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<String>();

        if text.is_empty() {
            return Err(ProviderError::EmptyResponse { provider: PROVIDER });
        }

        Ok(text)
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentBlock<'a> {
    Image { source: ImageSource<'a> },
    Text { text: &'a str },
}

#[derive(Debug, Serialize)]
struct ImageSource<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    media_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ImagePayload;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(
            "test-key".into(),
            "http://localhost/v1/messages".into(),
            "claude-test".into(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_text_request_has_single_text_block() {
        let provider = provider();
        let request = GenerationRequest {
            prompt: "hello",
            image: None,
            max_tokens: 100,
            temperature: 0.3,
        };
        let json = serde_json::to_value(provider.build_request(&request)).unwrap();
        assert_eq!(json["model"], "claude-test");
        assert_eq!(json["messages"][0]["content"][0]["type"], "text");
        assert_eq!(json["messages"][0]["content"][0]["text"], "hello");
    }

    #[test]
    fn test_image_block_precedes_text() {
        let provider = provider();
        let image = ImagePayload::from_base64("data:image/jpeg;base64,AAAA", None);
        let request = GenerationRequest {
            prompt: "describe",
            image: Some(&image),
            max_tokens: 100,
            temperature: 0.3,
        };
        let json = serde_json::to_value(provider.build_request(&request)).unwrap();
        let content = &json["messages"][0]["content"];
        assert_eq!(content[0]["type"], "image");
        assert_eq!(content[0]["source"]["type"], "base64");
        assert_eq!(content[0]["source"]["media_type"], "image/jpeg");
        assert_eq!(content[0]["source"]["data"], "AAAA");
        assert_eq!(content[1]["type"], "text");
    }
}
