//! Job orchestration.
//!
//! Cache lookup, planning, fan-out/fan-in, join and cache write for one job,
//! with progress reported on a per-job channel. The render pool is shared by
//! every job run through the same [`Pipeline`].

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::cache::{CacheEntry, CacheMetadata, CacheStore, MemoryCache, PgCache};
use crate::config::Settings;
use crate::error::{CacheError, PipelineError};
use crate::fingerprint::Fingerprint;
use crate::joiner::Joiner;
use crate::mux::{FfmpegMuxer, Muxer};
use crate::planner::{LlmPlanner, Planner, SectionPlan};
use crate::progress::{ProgressEvent, ProgressReporter, Stage};
use crate::providers::ProviderRegistry;
use crate::render::{LlmRepairer, ManimEngine, RenderEngine, RenderLimits, RenderPool, RenderWorker, Repairer};
use crate::scheduler::{ScheduleReport, Scheduler};
use crate::section::SectionWorker;
use crate::{Job, JobId};

/// Collaborators behind the pipeline's capability seams.
pub struct Components {
    pub planner: Arc<dyn Planner>,
    pub generators: ProviderRegistry,
    pub repairer: Arc<dyn Repairer>,
    pub engine: Arc<dyn RenderEngine>,
    pub muxer: Arc<dyn Muxer>,
    pub cache: Arc<dyn CacheStore>,
}

impl Components {
    /// Concrete providers, `manim`, `ffmpeg` and the configured cache.
    /// Without a database URL the cache is process-local.
    pub async fn from_settings(settings: &Settings) -> Result<Self, CacheError> {
        let providers = &settings.providers;
        let planner = LlmPlanner::new(
            ProviderRegistry::from_priority(providers, std::slice::from_ref(&providers.planner)),
            providers.max_tokens,
            providers.temperature,
        );
        let repairer = LlmRepairer::new(
            ProviderRegistry::from_priority(providers, std::slice::from_ref(&providers.repair)),
            providers.max_tokens,
            providers.temperature,
            settings.pipeline.repair_excerpt_chars,
        );

        let cache: Arc<dyn CacheStore> = match &settings.cache.database_url {
            Some(url) => Arc::new(PgCache::connect(url, settings.cache.max_connections).await?),
            None => {
                info!("No cache database configured, using in-memory cache");
                Arc::new(MemoryCache::new())
            }
        };

        Ok(Components {
            planner: Arc::new(planner),
            generators: ProviderRegistry::from_settings(providers),
            repairer: Arc::new(repairer),
            engine: Arc::new(ManimEngine::from_settings(&settings.render)),
            muxer: Arc::new(FfmpegMuxer::from_settings(&settings.mux)),
            cache,
        })
    }
}

/// Final outcome of a job, also sent as the `completed` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub final_artifact: PathBuf,
    pub final_url: Option<String>,
    pub file_size_mb: f64,
    pub sections_succeeded: usize,
    pub sections_attempted: usize,
    pub prompt: String,
    pub cached: bool,
}

pub struct Pipeline {
    settings: Settings,
    planner: Arc<dyn Planner>,
    generators: ProviderRegistry,
    cache: Arc<dyn CacheStore>,
    pool: Arc<RenderPool>,
    scheduler: Scheduler,
    joiner: Joiner,
    /// Ids of jobs currently running; each owns `output_dir/<id>`.
    active: Mutex<HashSet<JobId>>,
}

impl Pipeline {
    /// Starts the shared render pool. It stops when `cancel_token` fires or
    /// [`Pipeline::shutdown`] is called.
    pub fn new(settings: Settings, components: Components, cancel_token: CancellationToken) -> Self {
        let render_worker = RenderWorker::new(
            components.engine,
            components.repairer,
            RenderLimits::from(&settings.pipeline),
        );
        let pool = RenderPool::start(settings.pipeline.render_workers, cancel_token, Arc::new(render_worker));

        Pipeline {
            scheduler: Scheduler,
            joiner: Joiner::new(components.muxer),
            planner: components.planner,
            generators: components.generators,
            cache: components.cache,
            pool: Arc::new(pool),
            active: Mutex::new(HashSet::new()),
            settings,
        }
    }

    /// Runs `job` on its own task and returns the event stream alongside.
    pub fn spawn(
        pipeline: Arc<Self>,
        job: Job,
        cancel: CancellationToken,
    ) -> (
        JoinHandle<Result<JobSummary, PipelineError>>,
        mpsc::UnboundedReceiver<ProgressEvent>,
    ) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let span = info_span!("job", job_id = %job.id);
        let handle = tokio::spawn(async move { pipeline.run(job, sender, cancel).await }.instrument(span));
        (handle, receiver)
    }

    /// Runs one job to completion. The returned error has already been
    /// reported as the terminal `failed` event.
    #[instrument(skip_all, fields(job_id = %job.id))]
    pub async fn run(
        &self,
        job: Job,
        events: mpsc::UnboundedSender<ProgressEvent>,
        cancel: CancellationToken,
    ) -> Result<JobSummary, PipelineError> {
        let mut reporter = ProgressReporter::new(job.id.clone(), events);
        if let Err(err) = job.validate() {
            reporter.failed(err.to_string(), None);
            return Err(err);
        }
        let Some(_claim) = JobClaim::acquire(&self.active, &job.id) else {
            let err = PipelineError::InvalidJob(format!("job {} is already running", job.id));
            reporter.failed(err.to_string(), None);
            return Err(err);
        };

        let job = Arc::new(job);
        let job_token = cancel.child_token();
        // Cancels outstanding render tasks however this function exits.
        let _job_guard = job_token.clone().drop_guard();
        let limit = self.settings.pipeline.job_timeout();

        let result = {
            let work = tokio::time::timeout(limit, self.execute(job.clone(), &mut reporter, &job_token));
            tokio::select! {
                _ = cancel.cancelled() => Err(PipelineError::Cancelled),
                outcome = work => outcome.unwrap_or(Err(PipelineError::TimedOut(limit.as_secs()))),
            }
        };

        match result {
            Ok(summary) => Ok(summary),
            Err(err) => {
                job_token.cancel();
                error!(message = "Job failed", error = %err);
                reporter.failed(err.to_string(), Some(err.detail()));
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        job: Arc<Job>,
        reporter: &mut ProgressReporter,
        job_token: &CancellationToken,
    ) -> Result<JobSummary, PipelineError> {
        let settings = &self.settings.pipeline;
        let fingerprint = Fingerprint::of(&job, &settings.default_voice);

        if job.has_image() {
            debug!("Image supplied, bypassing cache");
        } else if let Some(summary) = self.lookup(&fingerprint).await {
            reporter.completed("Video retrieved from cache", to_payload(&summary), true);
            return Ok(summary);
        }

        let job_dir = settings.output_dir.join(job.id.as_str());
        tokio::fs::create_dir_all(&job_dir)
            .await
            .map_err(|source| PipelineError::Workspace {
                path: job_dir.clone(),
                source,
            })?;

        reporter.stage(Stage::Planning, "Planning video structure", None);
        let plan = self.planner.plan(&job).await?;
        reporter.stage(
            Stage::Planned,
            format!("Planned {} sections", plan.len()),
            Some(to_payload(&plan)),
        );
        write_record(&job_dir.join("plan.json"), &plan).await;

        reporter.stage(
            Stage::Generating,
            format!("Generating and rendering {} sections", plan.len()),
            None,
        );
        let report = self.schedule(&job, &plan, &job_dir, fingerprint.voice(), job_token).await;
        reporter.stage(
            Stage::Rendered,
            format!("Rendered {} of {} sections", report.succeeded(), report.results.len()),
            None,
        );
        write_record(&job_dir.join("scripts.json"), &report.narration).await;

        reporter.stage(Stage::Joining, "Joining sections", None);
        let joined = self.joiner.join(&report.results, &job_dir).await?;

        let summary = JobSummary {
            job_id: job.id.clone(),
            final_url: settings
                .public_url_base
                .as_ref()
                .map(|base| format!("{}/{}/final.mp4", base.trim_end_matches('/'), job.id)),
            file_size_mb: file_size_mb(&joined.path).await,
            final_artifact: joined.path,
            sections_succeeded: joined.succeeded,
            sections_attempted: joined.attempted,
            prompt: job.topic.clone(),
            cached: false,
        };

        if !job.has_image() && !job_token.is_cancelled() {
            self.store(&fingerprint, &summary).await;
        }

        let message = if summary.sections_succeeded < summary.sections_attempted {
            format!(
                "Video ready ({} of {} sections)",
                summary.sections_succeeded, summary.sections_attempted
            )
        } else {
            "Video ready".to_string()
        };
        info!(
            message = "Job completed",
            output = ?summary.final_artifact,
            succeeded = summary.sections_succeeded,
            attempted = summary.sections_attempted
        );
        reporter.completed(message, to_payload(&summary), false);
        Ok(summary)
    }

    async fn schedule(
        &self,
        job: &Arc<Job>,
        plan: &SectionPlan,
        job_dir: &Path,
        voice: &str,
        job_token: &CancellationToken,
    ) -> ScheduleReport {
        let providers = &self.settings.providers;
        let worker = SectionWorker::new(
            job.clone(),
            voice.to_string(),
            self.generators.clone(),
            self.pool.clone(),
            job_dir.to_path_buf(),
            job_token.clone(),
            providers.max_tokens,
            providers.temperature,
        );
        self.scheduler.run(plan, &worker).await
    }

    /// A hit reports the job that produced the cached artifact.
    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<JobSummary> {
        match self.cache.get(fingerprint).await {
            Ok(Some(entry)) => {
                info!(message = "Cache hit", key = %fingerprint.key(), cached_job = %entry.job_id);
                Some(JobSummary {
                    job_id: entry.job_id,
                    final_artifact: entry.final_artifact,
                    final_url: entry.final_url,
                    file_size_mb: entry.metadata.file_size_mb,
                    sections_succeeded: entry.num_sections,
                    sections_attempted: entry.num_sections,
                    prompt: entry.metadata.prompt,
                    cached: true,
                })
            }
            Ok(None) => {
                debug!(message = "Cache miss", key = %fingerprint.key());
                None
            }
            Err(err) => {
                warn!(message = "Cache lookup failed, generating", error = %err);
                None
            }
        }
    }

    async fn store(&self, fingerprint: &Fingerprint, summary: &JobSummary) {
        let entry = CacheEntry {
            job_id: summary.job_id.clone(),
            final_artifact: summary.final_artifact.clone(),
            final_url: summary.final_url.clone(),
            num_sections: summary.sections_succeeded,
            metadata: CacheMetadata {
                prompt: summary.prompt.clone(),
                file_size_mb: summary.file_size_mb,
            },
            created_at: Utc::now(),
        };
        match self.cache.put(fingerprint, &entry).await {
            Ok(()) => debug!(message = "Cached result", key = %fingerprint.key()),
            Err(err) => warn!(message = "Cache write failed", error = %err),
        }
    }

    /// Waits for queued render tasks to drain and stops the render workers.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

/// Marks a job id as running until dropped.
struct JobClaim<'a> {
    active: &'a Mutex<HashSet<JobId>>,
    id: JobId,
}

impl<'a> JobClaim<'a> {
    fn acquire(active: &'a Mutex<HashSet<JobId>>, id: &JobId) -> Option<Self> {
        let inserted = active.lock().unwrap_or_else(PoisonError::into_inner).insert(id.clone());
        inserted.then(|| JobClaim { active, id: id.clone() })
    }
}

impl Drop for JobClaim<'_> {
    fn drop(&mut self) {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.id);
    }
}

fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| json!({ "serialization_error": err.to_string() }))
}

/// Best-effort JSON record in the job workspace.
async fn write_record<T: Serialize>(path: &Path, value: &T) {
    let written = match serde_json::to_vec_pretty(value) {
        Ok(bytes) => tokio::fs::write(path, bytes).await.map_err(|err| err.to_string()),
        Err(err) => Err(err.to_string()),
    };
    if let Err(err) = written {
        warn!(message = "Could not write job record", path = ?path, error = %err);
    }
}

async fn file_size_mb(path: &Path) -> f64 {
    match tokio::fs::metadata(path).await {
        Ok(meta) => (meta.len() as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
        Err(err) => {
            warn!(message = "Could not stat final artifact", path = ?path, error = %err);
            0.0
        }
    }
}
