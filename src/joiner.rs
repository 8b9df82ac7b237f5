use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::*;

use crate::error::JoinError;
use crate::mux::Muxer;
use crate::render::RenderResult;

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedArtifact {
    pub path: PathBuf,
    pub succeeded: usize,
    pub attempted: usize,
}

impl JoinedArtifact {
    pub fn is_partial(&self) -> bool {
        self.succeeded < self.attempted
    }
}

/// Assembles the final artifact from section results in index order.
pub struct Joiner {
    muxer: Arc<dyn Muxer>,
}

impl Joiner {
    pub fn new(muxer: Arc<dyn Muxer>) -> Self {
        Joiner { muxer }
    }

    /// `results` must already be sorted by index. A single success is used
    /// as-is; several are concatenated into `<job_dir>/final.mp4`.
    #[instrument(skip_all, fields(attempted = results.len()))]
    pub async fn join(&self, results: &[RenderResult], job_dir: &Path) -> Result<JoinedArtifact, JoinError> {
        let outputs = results
            .iter()
            .filter_map(|result| result.output().map(Path::to_path_buf))
            .collect::<Vec<_>>();
        let attempted = results.len();
        let succeeded = outputs.len();

        let path = match outputs.as_slice() {
            [] => {
                let failures = results
                    .iter()
                    .filter_map(|result| match result {
                        RenderResult::Failure { index, error } => Some((*index, error.clone())),
                        RenderResult::Success { .. } => None,
                    })
                    .collect();
                return Err(JoinError::NoSuccessfulSections {
                    attempted,
                    succeeded: 0,
                    failures,
                });
            }
            [single] => {
                debug!(message = "Single section, skipping concatenation", output = ?single);
                single.clone()
            }
            many => self.muxer.concat(many, &job_dir.join("final.mp4")).await?,
        };

        if succeeded < attempted {
            warn!(message = "Joining partial result", succeeded, attempted);
        }
        Ok(JoinedArtifact {
            path,
            succeeded,
            attempted,
        })
    }
}
