use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::cleanup::clean_scene_code;
use crate::error::SectionError;
use crate::narration::extract_narration;
use crate::planner::SectionSpec;
use crate::prompts;
use crate::providers::{strip_code_fence, GenerationRequest, ProviderRegistry};
use crate::render::{RenderHandle, RenderPool, RenderTask, SectionArtifact};
use crate::Job;

pub enum SectionOutcome {
    /// Render task queued; the handle resolves to its result.
    Dispatched {
        index: u32,
        narration: String,
        handle: RenderHandle,
    },
    Failed {
        index: u32,
        error: SectionError,
    },
}

impl SectionOutcome {
    pub fn index(&self) -> u32 {
        match self {
            SectionOutcome::Dispatched { index, .. } | SectionOutcome::Failed { index, .. } => *index,
        }
    }
}

/// Generates one section's artifact and hands it to the render pool.
pub struct SectionWorker {
    job: Arc<Job>,
    voice: String,
    providers: ProviderRegistry,
    pool: Arc<RenderPool>,
    job_dir: PathBuf,
    cancel_token: CancellationToken,
    max_tokens: u32,
    temperature: f32,
}

impl SectionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job: Arc<Job>,
        voice: String,
        providers: ProviderRegistry,
        pool: Arc<RenderPool>,
        job_dir: PathBuf,
        cancel_token: CancellationToken,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        SectionWorker {
            job,
            voice,
            providers,
            pool,
            job_dir,
            cancel_token,
            max_tokens,
            temperature,
        }
    }

    #[instrument(skip_all, fields(job_id = %self.job.id, section = section.index))]
    pub async fn process(&self, section: &SectionSpec) -> SectionOutcome {
        let index = section.index;
        let artifact = match self.generate(section).await {
            Ok(artifact) => artifact,
            Err(error) => {
                warn!(message = "Section generation failed", error = %error);
                return SectionOutcome::Failed { index, error };
            }
        };

        let narration = artifact.narration.clone();
        let handle = self.pool.submit(
            RenderTask {
                job_id: self.job.id.clone(),
                artifact,
                job_dir: self.job_dir.clone(),
            },
            &self.cancel_token,
        );
        debug!("Render task dispatched");

        SectionOutcome::Dispatched {
            index,
            narration,
            handle,
        }
    }

    async fn generate(&self, section: &SectionSpec) -> Result<SectionArtifact, SectionError> {
        let index = section.index;
        let prompt = prompts::section_prompt(&self.job, &self.voice, section);
        let request = GenerationRequest {
            prompt: &prompt,
            image: self.job.image.as_ref(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        let provider = self
            .providers
            .select(request.need())
            .ok_or(SectionError::NoProvider { index })?;

        debug!(message = "Generating section", provider = %provider.name(), label = %section.label);
        let reply = provider
            .generate(&request)
            .await
            .map_err(|source| SectionError::Generation { index, source })?;

        let code = clean_scene_code(&strip_code_fence(&reply, "python"));
        if code.trim().is_empty() {
            return Err(SectionError::EmptyContent { index });
        }
        let narration = extract_narration(&code);
        if narration.is_empty() {
            debug!("No narration found in generated code");
        }

        Ok(SectionArtifact {
            index,
            code,
            narration,
        })
    }
}
