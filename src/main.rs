use anyhow::{Context, Error};
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use scenecast::config::Settings;
use scenecast::pipeline::{Components, Pipeline};
use scenecast::{telemetry, ImagePayload, Job, Mode};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about)]
pub struct Cli {
    #[arg(help = "Topic to explain", default_value = "")]
    topic: String,

    #[arg(long, help = "Image used as visual context")]
    image: Option<PathBuf>,

    #[arg(long = "image-filename", help = "Name identifying the image in the cache key")]
    image_filename: Option<String>,

    #[arg(long, env = "SCENECAST_VOICE", help = "Voice id for narration")]
    voice: Option<String>,

    #[arg(long, value_enum, default_value_t = Mode::Deep)]
    mode: Mode,

    #[arg(long = "job-id", help = "Job id, generated when omitted")]
    job_id: Option<String>,

    #[arg(
        short = 'c',
        long = "connect_url",
        env = "SCENECAST_DATABASE_URL",
        help = "PostgreSQL Connection URL for the result cache"
    )]
    connect_url: Option<String>,

    #[arg(
        short = 'n',
        long = "number_active",
        env = "SCENECAST_RENDER_WORKERS",
        help = "Number of Active Renders in Parallel"
    )]
    num: Option<u16>,

    #[arg(long, env = "SCENECAST_CONFIG", help = "TOML settings file")]
    config: Option<PathBuf>,

    #[arg(long = "output-dir", env = "SCENECAST_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    #[arg(long = "jaeger-endpoint", env = "SCENECAST_JAEGER_ENDPOINT")]
    jaeger_endpoint: Option<String>,
}

impl Cli {
    fn settings(&self) -> Result<Settings, Error> {
        let mut settings = Settings::load(self.config.as_deref())?;
        if let Some(url) = &self.connect_url {
            settings.cache.database_url = Some(url.clone());
        }
        if let Some(num) = self.num {
            settings.pipeline.render_workers = num;
        }
        if let Some(dir) = &self.output_dir {
            settings.pipeline.output_dir = dir.clone();
        }
        if let Some(endpoint) = &self.jaeger_endpoint {
            settings.telemetry.jaeger_endpoint = Some(endpoint.clone());
        }
        settings.validate()?;
        Ok(settings)
    }

    fn job(&self) -> Result<Job, Error> {
        let mut job = Job::new(self.topic.clone()).with_mode(self.mode);
        if let Some(id) = &self.job_id {
            job = job.with_id(id.as_str());
        }
        if let Some(voice) = &self.voice {
            job = job.with_voice(voice.clone());
        }
        if let Some(path) = &self.image {
            let bytes = std::fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
            let filename = self
                .image_filename
                .clone()
                .or_else(|| path.file_name().map(|name| name.to_string_lossy().into_owned()));
            job = job.with_image(ImagePayload::from_bytes(&bytes, filename));
        }
        Ok(job)
    }
}

#[instrument(skip_all)]
async fn setup(cli: Cli, settings: Settings, cancel_token: CancellationToken) -> Result<(), Error> {
    let job = cli.job()?;
    let components = Components::from_settings(&settings).await?;
    let pipeline = Arc::new(Pipeline::new(settings, components, cancel_token.clone()));

    let (job_handle, mut recv_events) = Pipeline::spawn(pipeline.clone(), job, cancel_token.clone());

    while let Some(event) = recv_events.recv().await {
        match event.to_sse() {
            Ok(frame) => print!("{frame}"),
            Err(err) => error!(message = "Failed to serialize event", error = ?err),
        }
    }
    debug!("Event stream closed");

    let outcome = job_handle.await?;
    pipeline.shutdown().await;

    let summary = outcome?;
    info!(message = "Final artifact", path = ?summary.final_artifact, cached = summary.cached);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "scenecast=DEBUG");
    }

    let cli = Cli::parse();
    let settings = cli.settings()?;
    telemetry::init(&settings.telemetry)?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cli, settings, cloned_token));

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(err), _) | (_, Err(err)) => {
                error!(message = "Could not install signal handlers", error = ?err);
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {info!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {info!("Received SIGINT"); token.cancel()},
        }
    });

    let result = app.await?;
    info!("Shutting down.");
    telemetry::shutdown();

    result.map_err(Into::into)
}
