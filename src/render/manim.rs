use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::fs;
use tokio::process::Command;
use tracing::*;

use super::{RenderEngine, RenderInput, RenderOutcome};
use crate::config::RenderSettings;

const DEFAULT_SCENE: &str = "ExplainerScene";

/// Low-quality render directories, in the order they are searched.
const QUALITY_DIRS: [&str; 2] = ["480p15", "480p12"];

/// Renders scene files by running the `manim` CLI in a child process.
#[derive(Debug, Clone)]
pub struct ManimEngine {
    bin: String,
    frame_rate: u32,
}

impl ManimEngine {
    pub fn new(bin: impl Into<String>, frame_rate: u32) -> Self {
        ManimEngine {
            bin: bin.into(),
            frame_rate,
        }
    }

    pub fn from_settings(settings: &RenderSettings) -> Self {
        Self::new(settings.manim_bin.clone(), settings.frame_rate)
    }
}

#[async_trait]
impl RenderEngine for ManimEngine {
    async fn render(&self, input: &RenderInput<'_>) -> std::io::Result<RenderOutcome> {
        let scene = scene_class(input.code);
        debug!(message = "Running manim", scene = %scene, source = ?input.source);

        let output = Command::new(&self.bin)
            .args(["-ql", "--format", "mp4", "--frame_rate"])
            .arg(self.frame_rate.to_string())
            .arg("--media_dir")
            .arg(input.work_dir)
            .arg(input.source)
            .arg(&scene)
            .current_dir(input.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        let located = find_output(input.work_dir, input.source).await;
        Ok(RenderOutcome {
            output: located,
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn scene_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^class\s+(?P<name>\w+)\s*\((?P<bases>[^)]*)\)\s*:").expect("scene pattern is valid")
    })
}

/// Name of the first class deriving from a `*Scene` base.
pub fn scene_class(code: &str) -> String {
    scene_pattern()
        .captures_iter(code)
        .find(|caps| caps["bases"].contains("Scene"))
        .map(|caps| caps["name"].to_string())
        .unwrap_or_else(|| DEFAULT_SCENE.to_string())
}

/// Looks for the rendered mp4 under `<media_dir>/videos/<stem>/<quality>/`.
async fn find_output(media_dir: &Path, source: &Path) -> Option<PathBuf> {
    let stem = source.file_stem()?;
    for quality in QUALITY_DIRS {
        let dir = media_dir.join("videos").join(stem).join(quality);
        let Ok(mut entries) = fs::read_dir(&dir).await else {
            continue;
        };
        let mut found = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "mp4") {
                found.push(path);
            }
        }
        found.sort();
        if let Some(path) = found.into_iter().next() {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_class_from_voiceover_scene() {
        let code = "from manim import *\n\nclass Helper:\n    pass\n\nclass LightReactions(VoiceoverScene):\n    def construct(self):\n        pass\n";
        assert_eq!(scene_class(code), "LightReactions");
    }

    #[test]
    fn test_scene_class_defaults() {
        assert_eq!(scene_class("x = 1\n"), DEFAULT_SCENE);
    }

    #[tokio::test]
    async fn test_find_output_prefers_first_quality_dir() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("section_1.py");
        for quality in ["480p12", "480p15"] {
            let out = dir.path().join("videos/section_1").join(quality);
            std::fs::create_dir_all(&out).unwrap();
            std::fs::write(out.join("Intro.mp4"), b"").unwrap();
        }

        let found = find_output(dir.path(), &source).await.unwrap();
        assert!(found.ends_with("videos/section_1/480p15/Intro.mp4"));
    }

    #[tokio::test]
    async fn test_find_output_ignores_other_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("videos/section_1/480p15");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("Intro.mp4"), b"").unwrap();

        let repaired = dir.path().join("section_1_repaired_1.py");
        assert!(find_output(dir.path(), &repaired).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("section_1.py");
        std::fs::write(&source, "x = 1\n").unwrap();

        let engine = ManimEngine::new("scenecast-no-such-manim", 12);
        let input = RenderInput {
            index: 1,
            code: "x = 1\n",
            source: &source,
            work_dir: dir.path(),
        };
        assert!(engine.render(&input).await.is_err());
    }
}
