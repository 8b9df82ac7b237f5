use futures::future::join_all;
use std::collections::BTreeMap;
use tracing::*;

use crate::planner::SectionPlan;
use crate::render::RenderResult;
use crate::section::{SectionOutcome, SectionWorker};

/// Results of one fan-out/fan-in round.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleReport {
    /// One entry per planned section, sorted by index.
    pub results: Vec<RenderResult>,
    /// Narration of every section whose content was generated.
    pub narration: BTreeMap<u32, String>,
}

impl ScheduleReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }
}

/// Fans sections out to a [`SectionWorker`] and collects their renders.
#[derive(Debug, Default)]
pub struct Scheduler;

impl Scheduler {
    /// Generates every section concurrently, then waits for every render
    /// concurrently. Each section is submitted for rendering as soon as its
    /// own generation finishes.
    #[instrument(skip_all, fields(sections = plan.len()))]
    pub async fn run(&self, plan: &SectionPlan, worker: &SectionWorker) -> ScheduleReport {
        let outcomes = join_all(plan.sections.iter().map(|section| worker.process(section))).await;

        let mut narration = BTreeMap::new();
        let mut pending = Vec::new();
        let mut results = Vec::with_capacity(plan.len());
        for outcome in outcomes {
            match outcome {
                SectionOutcome::Dispatched {
                    index,
                    narration: text,
                    handle,
                } => {
                    narration.insert(index, text);
                    pending.push(handle.wait());
                }
                SectionOutcome::Failed { index, error } => {
                    results.push(RenderResult::failure(index, error.to_string()));
                }
            }
        }
        debug!(message = "Sections dispatched", dispatched = pending.len(), failed = results.len());

        results.extend(join_all(pending).await);
        results.sort_by_key(RenderResult::index);

        let report = ScheduleReport { results, narration };
        info!(
            message = "Sections finished",
            succeeded = report.succeeded(),
            attempted = report.results.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::SectionSpec;
    use crate::providers::{Capabilities, GenerationRequest, Generator, ProviderError, ProviderRegistry};
    use crate::render::{
        RenderEngine, RenderError, RenderInput, RenderLimits, RenderOutcome, RenderPool, RenderWorker, Repairer,
    };
    use crate::Job;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Echoes the section label back as a scene with one voiceover line.
    struct EchoGenerator {
        fail_labels: HashSet<String>,
    }

    #[async_trait]
    impl Generator for EchoGenerator {
        fn name(&self) -> String {
            "echo".into()
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::TEXT
        }

        async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, ProviderError> {
            let label = request
                .prompt
                .lines()
                .find_map(|line| line.strip_prefix("Section: "))
                .and_then(|rest| rest.split(" (").next())
                .unwrap_or_default()
                .to_string();
            if self.fail_labels.contains(&label) {
                return Err(ProviderError::EmptyResponse { provider: "echo" });
            }
            Ok(format!(
                "```python\nclass S(VoiceoverScene):\n    def construct(self):\n        with self.voiceover(text=\"{label}\"):\n            pass\n```"
            ))
        }
    }

    /// Appends to a shared log; generation of `Part 2` is slow.
    struct LoggingGenerator {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Generator for LoggingGenerator {
        fn name(&self) -> String {
            "logging".into()
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::TEXT
        }

        async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, ProviderError> {
            let index = if request.prompt.contains("Section: Part 2") { 2 } else { 1 };
            if index == 2 {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            self.log.lock().unwrap().push(format!("generated {index}"));
            Ok("```python\nclass S(Scene):\n    def construct(self):\n        pass\n```".into())
        }
    }

    struct LoggingEngine {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RenderEngine for LoggingEngine {
        async fn render(&self, input: &RenderInput<'_>) -> std::io::Result<RenderOutcome> {
            self.log.lock().unwrap().push(format!("render {}", input.index));
            let output = input.work_dir.join("out.mp4");
            tokio::fs::write(&output, b"mp4").await?;
            Ok(RenderOutcome {
                output: Some(output),
                exit_code: Some(0),
                ..Default::default()
            })
        }
    }

    /// Sleeps a per-section delay; sections named in `broken` never render.
    struct DelayEngine {
        delays_ms: Vec<u64>,
        broken: HashSet<u32>,
    }

    #[async_trait]
    impl RenderEngine for DelayEngine {
        async fn render(&self, input: &RenderInput<'_>) -> std::io::Result<RenderOutcome> {
            let delay = self.delays_ms.get(input.index as usize - 1).copied().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if self.broken.contains(&input.index) {
                return Ok(RenderOutcome {
                    exit_code: Some(1),
                    stderr: "broken".into(),
                    ..Default::default()
                });
            }
            let output = input.work_dir.join("out.mp4");
            tokio::fs::write(&output, b"mp4").await?;
            Ok(RenderOutcome {
                output: Some(output),
                exit_code: Some(0),
                ..Default::default()
            })
        }
    }

    struct IdentityRepair;

    #[async_trait]
    impl Repairer for IdentityRepair {
        async fn repair(&self, code: &str, _failure: &RenderError) -> Result<String, ProviderError> {
            Ok(code.to_string())
        }
    }

    fn plan(count: u32) -> SectionPlan {
        SectionPlan {
            title: None,
            description: None,
            sections: (1..=count)
                .map(|index| SectionSpec {
                    index,
                    label: format!("Part {index}"),
                    duration: "10 seconds".into(),
                    content: format!("content {index}"),
                })
                .collect(),
        }
    }

    async fn schedule(
        count: u32,
        delays_ms: Vec<u64>,
        broken: HashSet<u32>,
        fail_labels: HashSet<String>,
    ) -> ScheduleReport {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(DelayEngine { delays_ms, broken });
        let render_worker = RenderWorker::new(
            engine,
            Arc::new(IdentityRepair),
            RenderLimits {
                max_attempts: 2,
                attempt_timeout: Duration::from_secs(10),
                task_timeout: Duration::from_secs(30),
            },
        );
        let pool = Arc::new(RenderPool::start(3, CancellationToken::new(), Arc::new(render_worker)));
        let worker = SectionWorker::new(
            Arc::new(Job::new("topic")),
            "voice".into(),
            ProviderRegistry::new(vec![Arc::new(EchoGenerator { fail_labels }) as Arc<dyn Generator>]),
            pool.clone(),
            dir.path().to_path_buf(),
            CancellationToken::new(),
            1000,
            0.3,
        );

        let report = Scheduler.run(&plan(count), &worker).await;
        pool.shutdown().await;
        report
    }

    #[tokio::test]
    async fn test_one_entry_per_section_with_mixed_failures() {
        let report = schedule(
            4,
            vec![40, 0, 20, 5],
            HashSet::from([3]),
            HashSet::from(["Part 2".to_string()]),
        )
        .await;

        assert_eq!(
            report.results.iter().map(RenderResult::index).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert!(report.results[0].is_success());
        assert!(!report.results[1].is_success());
        assert!(!report.results[2].is_success());
        assert!(report.results[3].is_success());
        assert_eq!(report.succeeded(), 2);

        // section 2 never produced content, so it has no narration
        assert_eq!(report.narration.keys().copied().collect::<Vec<_>>(), vec![1, 3, 4]);
        assert_eq!(report.narration[&4], "Part 4");
    }

    #[tokio::test]
    async fn test_render_starts_before_sibling_generation_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let render_worker = RenderWorker::new(
            Arc::new(LoggingEngine { log: log.clone() }),
            Arc::new(IdentityRepair),
            RenderLimits {
                max_attempts: 2,
                attempt_timeout: Duration::from_secs(10),
                task_timeout: Duration::from_secs(30),
            },
        );
        let pool = Arc::new(RenderPool::start(2, CancellationToken::new(), Arc::new(render_worker)));
        let worker = SectionWorker::new(
            Arc::new(Job::new("topic")),
            "voice".into(),
            ProviderRegistry::new(vec![Arc::new(LoggingGenerator { log: log.clone() }) as Arc<dyn Generator>]),
            pool.clone(),
            dir.path().to_path_buf(),
            CancellationToken::new(),
            1000,
            0.3,
        );

        let report = Scheduler.run(&plan(2), &worker).await;
        pool.shutdown().await;
        assert_eq!(report.succeeded(), 2);

        let log = log.lock().unwrap().clone();
        let position = |entry: &str| log.iter().position(|e| e == entry).unwrap();
        assert!(
            position("render 1") < position("generated 2"),
            "section 1 waited for section 2: {log:?}"
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_results_sorted_regardless_of_completion_order(delays in prop::collection::vec(0u64..30, 1..6)) {
            let count = delays.len() as u32;
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let report = runtime.block_on(schedule(count, delays, HashSet::new(), HashSet::new()));

            let indices = report.results.iter().map(RenderResult::index).collect::<Vec<_>>();
            prop_assert_eq!(indices, (1..=count).collect::<Vec<_>>());
            prop_assert!(report.results.iter().all(RenderResult::is_success));
        }
    }
}
