use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::*;

use crate::config::MuxSettings;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("could not write concat list {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not launch {bin}: {source}")]
    Launch {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("concatenation exited with code {exit_code:?}")]
    Failed {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("concatenation produced no output at {0}")]
    MissingOutput(PathBuf),
}

impl MuxError {
    /// Exit code and complete tool output, unabridged.
    pub fn diagnostic(&self) -> String {
        match self {
            MuxError::Failed {
                exit_code,
                stdout,
                stderr,
            } => format!(
                "concatenation exited with code {exit_code:?}\n\nstdout:\n{stdout}\n\nstderr:\n{stderr}"
            ),
            other => other.to_string(),
        }
    }
}

#[async_trait]
pub trait Muxer: Send + Sync {
    /// Concatenates `inputs` in order into `output`.
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<PathBuf, MuxError>;
}

/// Stream-copy concatenation with the ffmpeg concat demuxer.
#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    bin: String,
}

impl FfmpegMuxer {
    pub fn new(bin: impl Into<String>) -> Self {
        FfmpegMuxer { bin: bin.into() }
    }

    pub fn from_settings(settings: &MuxSettings) -> Self {
        Self::new(settings.ffmpeg_bin.clone())
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    #[instrument(skip_all, fields(inputs = inputs.len(), output = ?output))]
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<PathBuf, MuxError> {
        let list_path = output.with_file_name("concat_list.txt");
        tokio::fs::write(&list_path, concat_list(inputs))
            .await
            .map_err(|source| MuxError::List {
                path: list_path.clone(),
                source,
            })?;

        let result = Command::new(&self.bin)
            .args(["-y", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .args(["-c", "copy"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| MuxError::Launch {
                bin: self.bin.clone(),
                source,
            })?;

        if !result.status.success() {
            return Err(MuxError::Failed {
                exit_code: result.status.code(),
                stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            });
        }
        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(MuxError::MissingOutput(output.to_path_buf()));
        }

        debug!("Concatenation finished");
        Ok(output.to_path_buf())
    }
}

/// Concat demuxer input: one `file '<path>'` line per input, with single
/// quotes escaped the way the demuxer expects.
pub fn concat_list(inputs: &[PathBuf]) -> String {
    inputs
        .iter()
        .map(|path| {
            let path = std::path::absolute(path).unwrap_or_else(|_| path.clone());
            format!("file '{}'\n", path.to_string_lossy().replace('\'', r"'\''"))
        })
        .collect()
}
