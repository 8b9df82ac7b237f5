use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod cache;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod joiner;
pub mod mux;
pub mod narration;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod prompts;
pub mod providers;
pub mod render;
pub mod scheduler;
pub mod section;
pub mod telemetry;

/// Topic text the frontend sends when the user only uploads an image.
pub const IMAGE_ONLY_PLACEHOLDER: &str = "Explain this image";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        JobId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        JobId(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Deep,
    Fast,
}

/// Base64 image supplied as visual context for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub data: String,
    pub media_type: String,
    pub filename: Option<String>,
}

impl ImagePayload {
    /// Accepts raw base64 or a `data:image/...;base64,` URI.
    pub fn from_base64(data: impl Into<String>, filename: Option<String>) -> Self {
        let data = data.into();
        let mut media_type = "image/png".to_string();
        let mut payload = data.as_str();

        if let Some(rest) = payload.strip_prefix("data:") {
            if let Some((prefix, body)) = rest.split_once(";base64,") {
                if prefix.starts_with("image/") {
                    media_type = prefix.to_string();
                }
                payload = body;
            }
        }

        ImagePayload {
            data: payload.to_string(),
            media_type,
            filename,
        }
    }

    /// Encodes raw image bytes. The media type comes from the filename
    /// extension, defaulting to PNG.
    pub fn from_bytes(bytes: &[u8], filename: Option<String>) -> Self {
        use base64::Engine as _;

        let extension = filename
            .as_deref()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());
        let media_type = match extension.as_deref() {
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            _ => "image/png",
        };

        ImagePayload {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            media_type: media_type.to_string(),
            filename,
        }
    }
}

/// One pipeline run. Immutable once created.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub topic: String,
    pub image: Option<ImagePayload>,
    pub voice: Option<String>,
    pub mode: Mode,
}

impl Job {
    pub fn new(topic: impl Into<String>) -> Self {
        Job {
            id: JobId::generate(),
            topic: topic.into(),
            image: None,
            voice: None,
            mode: Mode::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_image(mut self, image: ImagePayload) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    /// Whether the topic carries real text, as opposed to being blank or the
    /// image-only placeholder.
    pub fn has_text(&self) -> bool {
        let topic = self.topic.trim();
        !topic.is_empty() && topic != IMAGE_ONLY_PLACEHOLDER
    }

    /// A job needs either text or an image, and an id that is safe to use as
    /// a directory name.
    pub fn validate(&self) -> Result<(), error::PipelineError> {
        let id = self.id.as_str();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(error::PipelineError::InvalidJob(format!(
                "job id {id:?} may only contain letters, digits, '-' and '_'"
            )));
        }
        if self.topic.trim().is_empty() && self.image.is_none() {
            return Err(error::PipelineError::InvalidJob(
                "topic or image is required".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_payload_from_bytes() {
        let image = ImagePayload::from_bytes(b"\xff\xd8", Some("Leaf.JPG".into()));
        assert_eq!(image.data, "/9g=");
        assert_eq!(image.media_type, "image/jpeg");
        assert_eq!(ImagePayload::from_bytes(b"", None).media_type, "image/png");
    }

    #[test]
    fn test_image_payload_strips_data_uri() {
        let image = ImagePayload::from_base64("data:image/jpeg;base64,AAAA", None);
        assert_eq!(image.data, "AAAA");
        assert_eq!(image.media_type, "image/jpeg");
    }

    #[test]
    fn test_image_payload_raw_base64_defaults_to_png() {
        let image = ImagePayload::from_base64("iVBORw0KGgo", Some("leaf.png".into()));
        assert_eq!(image.data, "iVBORw0KGgo");
        assert_eq!(image.media_type, "image/png");
        assert_eq!(image.filename.as_deref(), Some("leaf.png"));
    }

    #[test]
    fn test_placeholder_topic_is_not_text() {
        let job = Job::new(IMAGE_ONLY_PLACEHOLDER);
        assert!(!job.has_text());
        assert!(Job::new("Explain photosynthesis").has_text());
    }

    #[test]
    fn test_validate_requires_topic_or_image() {
        assert!(Job::new("   ").validate().is_err());
        let job = Job::new("").with_image(ImagePayload::from_base64("AAAA", None));
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_path_like_job_ids() {
        for id in ["../x", "/abs", "a/b", "", "job.1"] {
            assert!(Job::new("topic").with_id(id).validate().is_err(), "{id:?} accepted");
        }
        assert!(Job::new("topic").with_id("job_42-b").validate().is_ok());
        assert!(Job::new("topic").validate().is_ok());
    }
}
