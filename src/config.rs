//! Runtime settings.
//!
//! Everything has a default so the binary runs without a config file; a TOML
//! file passed with `--config` overrides any subset of fields, and command
//! line flags override the file.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// ElevenLabs voice used when the request does not pick one.
pub const DEFAULT_VOICE: &str = "K80wneyktrw2rE11kA2W";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pipeline: PipelineSettings,
    pub providers: ProviderSettings,
    pub render: RenderSettings,
    pub mux: MuxSettings,
    pub cache: CacheSettings,
    pub telemetry: TelemetrySettings,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings = match path {
            None => Settings::default(),
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Settings::from_toml(&raw)?
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.max_render_attempts == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.max_render_attempts must be at least 1".into(),
            ));
        }
        if self.pipeline.render_workers == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.render_workers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub output_dir: PathBuf,
    pub max_render_attempts: u32,
    pub render_attempt_timeout_secs: u64,
    pub render_task_timeout_secs: u64,
    pub job_timeout_secs: u64,
    pub render_workers: u16,
    /// Characters of each output stream handed to the repair provider.
    pub repair_excerpt_chars: usize,
    pub default_voice: String,
    pub public_url_base: Option<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            output_dir: PathBuf::from("outputs"),
            max_render_attempts: 2,
            render_attempt_timeout_secs: 600,
            render_task_timeout_secs: 900,
            job_timeout_secs: 3600,
            render_workers: 8,
            repair_excerpt_chars: 2000,
            default_voice: DEFAULT_VOICE.to_string(),
            public_url_base: None,
        }
    }
}

impl PipelineSettings {
    pub fn render_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.render_attempt_timeout_secs)
    }

    pub fn render_task_timeout(&self) -> Duration {
        Duration::from_secs(self.render_task_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Text-only code generation priority. Names: grok, claude, cerebras.
    pub code_gen_priority: Vec<String>,
    pub planner: String,
    pub repair: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub anthropic: EndpointSettings,
    pub xai: EndpointSettings,
    pub cerebras: EndpointSettings,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        ProviderSettings {
            code_gen_priority: vec!["grok".into(), "claude".into(), "cerebras".into()],
            planner: "claude".into(),
            repair: "claude".into(),
            temperature: 0.3,
            max_tokens: 16000,
            request_timeout_secs: 300,
            anthropic: EndpointSettings::default(),
            xai: EndpointSettings::default(),
            cerebras: EndpointSettings::default(),
        }
    }
}

impl ProviderSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Per-provider overrides. Unset fields fall back to the provider's own
/// defaults (see `providers::ProviderKind`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub manim_bin: String,
    pub frame_rate: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        RenderSettings {
            manim_bin: "manim".into(),
            frame_rate: 12,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuxSettings {
    pub ffmpeg_bin: String,
}

impl Default for MuxSettings {
    fn default() -> Self {
        MuxSettings {
            ffmpeg_bin: "ffmpeg".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            database_url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub jaeger_endpoint: Option<String>,
    pub service_name: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        TelemetrySettings {
            jaeger_endpoint: None,
            service_name: "scenecast".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_pipeline_limits() {
        let settings = Settings::default();
        assert_eq!(settings.pipeline.max_render_attempts, 2);
        assert_eq!(settings.pipeline.render_attempt_timeout(), Duration::from_secs(600));
        assert_eq!(settings.pipeline.render_task_timeout(), Duration::from_secs(900));
        assert_eq!(settings.pipeline.job_timeout(), Duration::from_secs(3600));
        assert_eq!(settings.pipeline.repair_excerpt_chars, 2000);
        assert_eq!(settings.providers.code_gen_priority, vec!["grok", "claude", "cerebras"]);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let settings = Settings::from_toml(
            r#"
            [pipeline]
            max_render_attempts = 3
            output_dir = "/tmp/videos"

            [providers]
            code_gen_priority = ["cerebras"]

            [providers.xai]
            model = "grok-4"
            "#,
        )
        .unwrap();

        assert_eq!(settings.pipeline.max_render_attempts, 3);
        assert_eq!(settings.pipeline.output_dir, PathBuf::from("/tmp/videos"));
        assert_eq!(settings.pipeline.render_task_timeout_secs, 900);
        assert_eq!(settings.providers.code_gen_priority, vec!["cerebras"]);
        assert_eq!(settings.providers.xai.model.as_deref(), Some("grok-4"));
        assert!(settings.providers.xai.api_key_env.is_none());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let settings = Settings::from_toml("[pipeline]\nmax_render_attempts = 0\n").unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_unknown_field_types_rejected() {
        assert!(Settings::from_toml("[pipeline]\nrender_workers = \"many\"\n").is_err());
    }
}
