use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::error::PlanningError;
use crate::prompts;
use crate::providers::{strip_code_fence, GenerationRequest, ProviderRegistry};
use crate::Job;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionSpec {
    /// 1-based position in the final video.
    pub index: u32,
    pub label: String,
    pub duration: String,
    pub content: String,
}

/// Ordered sections of one job. Indices are 1..=N and fixed once planned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionPlan {
    pub title: Option<String>,
    pub description: Option<String>,
    pub sections: Vec<SectionSpec>,
}

impl SectionPlan {
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Parses the planning model's reply. Fenced code blocks are unwrapped;
    /// an empty or missing `video_structure` becomes a single section covering
    /// the whole topic.
    pub fn parse(raw: &str, topic: &str) -> Result<Self, PlanningError> {
        let body = strip_code_fence(raw, "json");
        let reply: PlanReply =
            serde_json::from_str(&body).map_err(|err| PlanningError::Malformed {
                reason: err.to_string(),
                raw: raw.to_string(),
            })?;

        let sections = if reply.video_structure.is_empty() {
            let content = reply
                .description
                .clone()
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| topic.trim().to_string());
            vec![SectionSpec {
                index: 1,
                label: "Main".into(),
                duration: "60 seconds".into(),
                content,
            }]
        } else {
            reply
                .video_structure
                .into_iter()
                .zip(1u32..)
                .map(|(entry, index)| SectionSpec {
                    index,
                    label: entry.section,
                    duration: entry.duration.unwrap_or_else(|| "N/A".into()),
                    content: entry.content,
                })
                .collect()
        };

        Ok(SectionPlan {
            title: reply.title,
            description: reply.description,
            sections,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PlanReply {
    title: Option<String>,
    description: Option<String>,
    #[serde(default)]
    video_structure: Vec<PlanEntry>,
}

#[derive(Debug, Deserialize)]
struct PlanEntry {
    section: String,
    duration: Option<String>,
    content: String,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, job: &Job) -> Result<SectionPlan, PlanningError>;
}

/// Planner backed by a single generation call. No retries.
pub struct LlmPlanner {
    providers: ProviderRegistry,
    max_tokens: u32,
    temperature: f32,
}

impl LlmPlanner {
    pub fn new(providers: ProviderRegistry, max_tokens: u32, temperature: f32) -> Self {
        LlmPlanner {
            providers,
            max_tokens,
            temperature,
        }
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn plan(&self, job: &Job) -> Result<SectionPlan, PlanningError> {
        let prompt = prompts::plan_prompt(job);
        let request = GenerationRequest {
            prompt: &prompt,
            image: job.image.as_ref(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        let provider = self
            .providers
            .select(request.need())
            .ok_or(PlanningError::NoProvider)?;

        debug!(message = "Requesting plan", provider = %provider.name());
        let raw = provider.generate(&request).await?;
        let plan = SectionPlan::parse(&raw, &job.topic)?;

        info!(
            message = "Plan generated",
            sections = plan.len(),
            labels = ?plan.sections.iter().map(|s| s.label.as_str()).collect::<Vec<_>>()
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_plan() {
        let raw = r#"Sure!
```json
{"title": "Photosynthesis", "video_structure": [
  {"section": "Intro", "duration": "30 seconds", "content": "What plants need"},
  {"section": "Light reactions", "duration": "60 seconds", "content": "Chlorophyll"}
]}
```"#;
        let plan = SectionPlan::parse(raw, "Explain photosynthesis").unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.sections[0].index, 1);
        assert_eq!(plan.sections[1].index, 2);
        assert_eq!(plan.sections[1].label, "Light reactions");
        assert_eq!(plan.title.as_deref(), Some("Photosynthesis"));
    }

    #[test]
    fn test_missing_structure_falls_back_to_description() {
        let plan = SectionPlan::parse(r#"{"description": "All about leaves"}"#, "leaves").unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.sections[0].label, "Main");
        assert_eq!(plan.sections[0].duration, "60 seconds");
        assert_eq!(plan.sections[0].content, "All about leaves");
    }

    #[test]
    fn test_empty_structure_falls_back_to_topic() {
        let plan = SectionPlan::parse(r#"{"video_structure": []}"#, " Explain photosynthesis ").unwrap();
        assert_eq!(plan.sections[0].content, "Explain photosynthesis");
    }

    #[test]
    fn test_missing_duration_defaults() {
        let plan = SectionPlan::parse(
            r#"{"video_structure": [{"section": "Only", "content": "x"}]}"#,
            "t",
        )
        .unwrap();
        assert_eq!(plan.sections[0].duration, "N/A");
    }

    #[test]
    fn test_malformed_json_is_fatal() {
        let err = SectionPlan::parse("not json at all", "t").unwrap_err();
        assert!(matches!(err, PlanningError::Malformed { .. }));
    }

    #[test]
    fn test_entry_without_content_is_malformed() {
        let err = SectionPlan::parse(r#"{"video_structure": [{"section": "x"}]}"#, "t").unwrap_err();
        assert!(matches!(err, PlanningError::Malformed { .. }));
    }
}
