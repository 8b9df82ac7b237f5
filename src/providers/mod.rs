//! Generative model backends.
//!
//! The pipeline only sees [`Generator`]: one prompt (plus an optional image)
//! in, text out. Backends are tagged with the capabilities they support and
//! kept in a priority-ordered [`ProviderRegistry`]; [`select`] picks the first
//! one able to serve a request.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::*;

use crate::config::{EndpointSettings, ProviderSettings};
use crate::ImagePayload;

mod anthropic;
mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiCompatibleProvider;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider} response had no text content")]
    EmptyResponse { provider: &'static str },

    #[error("provider misconfigured: {0}")]
    Misconfigured(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub text: bool,
    pub vision: bool,
}

impl Capabilities {
    pub const TEXT: Capabilities = Capabilities {
        text: true,
        vision: false,
    };
    pub const TEXT_AND_VISION: Capabilities = Capabilities {
        text: true,
        vision: true,
    };

    pub fn supports(&self, need: Need) -> bool {
        match need {
            Need::Text => self.text,
            Need::Vision => self.vision,
        }
    }
}

/// What a request requires from its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Need {
    Text,
    Vision,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    pub image: Option<&'a ImagePayload>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl<'a> GenerationRequest<'a> {
    pub fn need(&self) -> Need {
        if self.image.is_some() {
            Need::Vision
        } else {
            Need::Text
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Label for logs, e.g. `"xai/grok-code-fast-1"`.
    fn name(&self) -> String;

    fn capabilities(&self) -> Capabilities;

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, ProviderError>;
}

/// Named backends that can be listed in the priority settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Grok,
    Claude,
    Cerebras,
}

pub const DEFAULT_PRIORITY: [ProviderKind; 3] =
    [ProviderKind::Grok, ProviderKind::Claude, ProviderKind::Cerebras];

impl ProviderKind {
    fn default_api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::Grok => "XAI_API_KEY",
            ProviderKind::Claude => "ANTHROPIC_API_KEY",
            ProviderKind::Cerebras => "CEREBRAS_API_KEY",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::Grok => "grok-code-fast-1",
            ProviderKind::Claude => "claude-sonnet-4-5-20250929",
            ProviderKind::Cerebras => "qwen-3-235b-a22b-instruct-2507",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::Grok => "https://api.x.ai/v1",
            ProviderKind::Claude => "https://api.anthropic.com/v1/messages",
            ProviderKind::Cerebras => "https://api.cerebras.ai/v1",
        }
    }

    fn overrides<'a>(&self, settings: &'a ProviderSettings) -> &'a EndpointSettings {
        match self {
            ProviderKind::Grok => &settings.xai,
            ProviderKind::Claude => &settings.anthropic,
            ProviderKind::Cerebras => &settings.cerebras,
        }
    }

    /// Endpoint settings with provider defaults filled in.
    pub fn endpoint(&self, settings: &ProviderSettings) -> Endpoint {
        let overrides = self.overrides(settings);
        Endpoint {
            api_key_env: overrides
                .api_key_env
                .clone()
                .unwrap_or_else(|| self.default_api_key_env().to_string()),
            model: overrides
                .model
                .clone()
                .unwrap_or_else(|| self.default_model().to_string()),
            base_url: overrides
                .base_url
                .clone()
                .unwrap_or_else(|| self.default_base_url().to_string()),
        }
    }

    /// Builds the backend, reading its API key from the environment.
    pub fn build(&self, settings: &ProviderSettings) -> Result<Arc<dyn Generator>, ProviderError> {
        let endpoint = self.endpoint(settings);
        let api_key = std::env::var(&endpoint.api_key_env).map_err(|_| {
            ProviderError::Misconfigured(format!(
                "{self} API key not found in environment variable '{}'",
                endpoint.api_key_env
            ))
        })?;
        let timeout = settings.request_timeout();

        Ok(match self {
            ProviderKind::Claude => Arc::new(AnthropicProvider::new(
                api_key,
                endpoint.base_url,
                endpoint.model,
                timeout,
            )?),
            ProviderKind::Grok => Arc::new(OpenAiCompatibleProvider::new(
                "xai",
                api_key,
                endpoint.base_url,
                endpoint.model,
                timeout,
            )?),
            ProviderKind::Cerebras => Arc::new(OpenAiCompatibleProvider::new(
                "cerebras",
                api_key,
                endpoint.base_url,
                endpoint.model,
                timeout,
            )?),
        })
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "grok" | "xai" => Ok(ProviderKind::Grok),
            "claude" | "anthropic" => Ok(ProviderKind::Claude),
            "cerebras" => Ok(ProviderKind::Cerebras),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Grok => write!(f, "grok"),
            ProviderKind::Claude => write!(f, "claude"),
            ProviderKind::Cerebras => write!(f, "cerebras"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub api_key_env: String,
    pub model: String,
    pub base_url: String,
}

/// Resolves a configured priority list: configured names first, then the
/// defaults, without duplicates. Unknown names are returned separately.
pub fn resolve_priority(configured: &[String]) -> (Vec<ProviderKind>, Vec<String>) {
    let mut invalid = Vec::new();
    let mut order = Vec::new();

    let parsed = configured
        .iter()
        .filter(|entry| !entry.trim().is_empty())
        .filter_map(|entry| match entry.parse::<ProviderKind>() {
            Ok(kind) => Some(kind),
            Err(name) => {
                invalid.push(name);
                None
            }
        })
        .collect::<Vec<_>>();

    for kind in parsed.into_iter().chain(DEFAULT_PRIORITY) {
        if !order.contains(&kind) {
            order.push(kind);
        }
    }

    (order, invalid)
}

/// Picks the first generator in priority order that supports `need`.
pub fn select(generators: &[Arc<dyn Generator>], need: Need) -> Option<&Arc<dyn Generator>> {
    generators
        .iter()
        .find(|generator| generator.capabilities().supports(need))
}

/// Priority-ordered list of available content generators.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    generators: Vec<Arc<dyn Generator>>,
}

impl ProviderRegistry {
    pub fn new(generators: Vec<Arc<dyn Generator>>) -> Self {
        ProviderRegistry { generators }
    }

    /// Content generation registry, ordered by `code_gen_priority`.
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self::from_priority(settings, &settings.code_gen_priority)
    }

    /// Builds every backend in `priority` order followed by the defaults.
    /// Backends whose API key is missing are skipped with a warning.
    pub fn from_priority(settings: &ProviderSettings, priority: &[String]) -> Self {
        let (order, invalid) = resolve_priority(priority);
        if !invalid.is_empty() {
            warn!(
                message = "Ignoring unsupported providers",
                invalid = ?invalid,
                supported = "grok, claude, cerebras"
            );
        }

        let generators = order
            .into_iter()
            .filter_map(|kind| match kind.build(settings) {
                Ok(generator) => Some(generator),
                Err(err) => {
                    warn!(message = "Skipping provider", provider = %kind, error = %err);
                    None
                }
            })
            .collect::<Vec<_>>();

        debug!(
            message = "Providers ready",
            priority = ?generators.iter().map(|g| g.name()).collect::<Vec<_>>()
        );
        ProviderRegistry { generators }
    }

    pub fn select(&self, need: Need) -> Option<Arc<dyn Generator>> {
        select(&self.generators, need).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }
}

/// Returns the body of the first fenced code block, preferring one tagged
/// `lang`. Text without fences is returned trimmed.
pub fn strip_code_fence(text: &str, lang: &str) -> String {
    let tagged = format!("```{lang}");
    let body = if let Some((_, rest)) = text.split_once(tagged.as_str()) {
        rest
    } else if let Some((_, rest)) = text.split_once("```") {
        // drop another language tag on the fence line
        match rest.split_once('\n') {
            Some((tag, tail)) if tag.trim().chars().all(|c| c.is_ascii_alphanumeric()) => tail,
            _ => rest,
        }
    } else {
        return text.trim().to_string();
    };
    let body = body.split("```").next().unwrap_or(body);
    body.trim().to_string()
}
