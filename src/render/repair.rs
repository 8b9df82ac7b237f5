use async_trait::async_trait;
use tracing::*;

use super::{RenderError, Repairer};
use crate::prompts;
use crate::providers::{strip_code_fence, GenerationRequest, Need, ProviderError, ProviderRegistry};

/// Repairs failed scene code with one text generation call.
pub struct LlmRepairer {
    providers: ProviderRegistry,
    max_tokens: u32,
    temperature: f32,
    excerpt_chars: usize,
}

impl LlmRepairer {
    pub fn new(providers: ProviderRegistry, max_tokens: u32, temperature: f32, excerpt_chars: usize) -> Self {
        LlmRepairer {
            providers,
            max_tokens,
            temperature,
            excerpt_chars,
        }
    }
}

#[async_trait]
impl Repairer for LlmRepairer {
    async fn repair(&self, code: &str, failure: &RenderError) -> Result<String, ProviderError> {
        let (stdout, stderr) = failure.excerpt(self.excerpt_chars);
        let prompt = prompts::repair_prompt(code, &stdout, &stderr);
        let provider = self
            .providers
            .select(Need::Text)
            .ok_or_else(|| ProviderError::Misconfigured("no provider available for repair".into()))?;

        debug!(message = "Requesting repair", provider = %provider.name());
        let reply = provider
            .generate(&GenerationRequest {
                prompt: &prompt,
                image: None,
                max_tokens: self.max_tokens,
                temperature: self.temperature,
            })
            .await?;

        let revised = strip_code_fence(&reply, "python");
        if revised.trim().is_empty() {
            return Err(ProviderError::EmptyResponse {
                provider: "repair",
            });
        }
        Ok(revised)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Capabilities, Generator};
    use std::sync::{Arc, Mutex};

    struct Recording {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Generator for Recording {
        fn name(&self) -> String {
            "recording".into()
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::TEXT
        }

        async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, ProviderError> {
            self.prompts.lock().unwrap().push(request.prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn test_repair_unwraps_fence_and_sends_excerpts() {
        let generator = Arc::new(Recording {
            reply: "Here you go\n```python\nfrom manim import *\n```".into(),
            prompts: Mutex::new(Vec::new()),
        });
        let repairer = LlmRepairer::new(ProviderRegistry::new(vec![generator.clone() as Arc<dyn Generator>]), 1000, 0.1, 5);
        let failure = RenderError::Failed {
            exit_code: Some(1),
            output_missing: true,
            stdout: "stdout-long".into(),
            stderr: "NameError: Foo".into(),
        };

        let revised = repairer.repair("bad code", &failure).await.unwrap();
        assert_eq!(revised, "from manim import *");

        let prompts = generator.prompts.lock().unwrap();
        assert!(prompts[0].contains("bad code"));
        assert!(prompts[0].contains("stdou\n"));
        assert!(prompts[0].contains("NameE\n"));
    }

    #[tokio::test]
    async fn test_repair_without_provider_fails() {
        let repairer = LlmRepairer::new(ProviderRegistry::default(), 1000, 0.1, 2000);
        let err = repairer
            .repair("x", &RenderError::TimedOut(std::time::Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Misconfigured(_)));
    }
}
