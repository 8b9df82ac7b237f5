//! Stable request identity used as the cache key.
//!
//! The key follows the request's inputs:
//! - text only: the normalized topic
//! - image only: the image identity (its filename)
//! - text and image: `"{topic}__{filename}"`
//!
//! The voice is always part of the identity, so the same topic narrated by two
//! voices gets two cache entries. Image bytes never enter the key.

use serde::Serialize;

use crate::Job;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint {
    key: String,
    voice: String,
}

impl Fingerprint {
    pub fn new(key: impl Into<String>, voice: impl Into<String>) -> Self {
        Fingerprint {
            key: key.into(),
            voice: voice.into(),
        }
    }

    /// Derives the fingerprint of `job`, using `default_voice` when the job
    /// does not select one.
    pub fn of(job: &Job, default_voice: &str) -> Self {
        let text = normalize_topic(&job.topic);
        let image_identity = job
            .image
            .as_ref()
            .and_then(|image| image.filename.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty());

        let key = match (job.has_text(), image_identity) {
            (true, Some(name)) => format!("{text}__{name}"),
            (false, Some(name)) => name.to_string(),
            _ => text,
        };

        let voice = job
            .voice
            .as_deref()
            .map(str::trim)
            .filter(|voice| !voice.is_empty())
            .unwrap_or(default_voice);

        Fingerprint::new(key, voice)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn voice(&self) -> &str {
        &self.voice
    }

    /// Hex blake3 digest over key and voice.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.key.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.voice.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Trims, collapses internal whitespace and lowercases.
pub fn normalize_topic(topic: &str) -> String {
    topic
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
