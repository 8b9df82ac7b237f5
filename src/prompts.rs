use crate::planner::SectionSpec;
use crate::{Job, Mode};

const PLAN_PROMPT: &str = r#"You are planning a short educational explainer video rendered with Manim.
Break the topic into self-contained sections that build on each other.

Respond with a single JSON object and nothing else:
{
  "title": "<video title>",
  "description": "<one paragraph summary of the whole video>",
  "video_structure": [
    {"section": "<section title>", "duration": "<e.g. 45 seconds>", "content": "<what the section explains and shows>"}
  ]
}"#;

const SCENE_PROMPT: &str = r#"You write Manim Community v0.18 scenes with voiceover.
Rules:
- Output one Python file in a single ```python block.
- Define exactly one class deriving from VoiceoverScene.
- Configure speech with ElevenLabsService(voice_id="{voice}", transcription_model=None).
- Narrate with `with self.voiceover(text="...") as tracker:` blocks and keep animations inside them.
- Only use objects and methods that exist in Manim Community v0.18."#;

const IMAGE_PLAN_NOTE: &str = "IMPORTANT: An image has been provided as visual context. Reference this image when planning the video structure and visual approach. Use the image to inform what concepts to explain and how to visualize them.";

const IMAGE_SCENE_NOTE: &str = "NOTE: An image was provided as context for this video. When creating visual demonstrations, consider referencing elements or concepts visible in that image.";

pub fn plan_prompt(job: &Job) -> String {
    let pacing = match job.mode {
        Mode::Deep => "Use 4 to 6 sections of 45 to 90 seconds each.",
        Mode::Fast => "Use 2 or 3 short sections of 20 to 40 seconds each.",
    };
    let mut prompt = format!("{PLAN_PROMPT}\n\n{pacing}\n\nTopic: {}", job.topic.trim());
    if job.has_image() {
        prompt.push_str("\n\n");
        prompt.push_str(IMAGE_PLAN_NOTE);
    }
    prompt
}

pub fn section_prompt(job: &Job, voice: &str, section: &SectionSpec) -> String {
    let mut prompt = format!(
        "{}\n\nTopic: {}\nSection: {} (Duration: {})\nContent: {}\n\n\
        Generate a SINGLE scene for this section only. The scene should be self-contained and match the duration specified.",
        SCENE_PROMPT.replace("{voice}", voice),
        job.topic.trim(),
        section.label,
        section.duration,
        section.content,
    );
    if job.has_image() {
        prompt.push_str("\n\n");
        prompt.push_str(IMAGE_SCENE_NOTE);
    }
    prompt
}

pub fn repair_prompt(code: &str, stdout_excerpt: &str, stderr_excerpt: &str) -> String {
    format!(
        "The following Manim code failed to render. Please fix the code.\n\n\
        ORIGINAL CODE:\n```python\n{code}\n```\n\n\
        ERROR OUTPUT (stdout):\n{stdout_excerpt}\n\n\
        ERROR OUTPUT (stderr):\n{stderr_excerpt}\n\n\
        Return ONLY the fixed Python code with the correct TTS service initialization."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ImagePayload;

    fn section() -> SectionSpec {
        SectionSpec {
            index: 1,
            label: "Light reactions".into(),
            duration: "45 seconds".into(),
            content: "Chlorophyll absorbs light".into(),
        }
    }

    #[test]
    fn test_section_prompt_carries_voice_and_brief() {
        let prompt = section_prompt(&Job::new("Explain photosynthesis"), "voice-123", &section());
        assert!(prompt.contains(r#"voice_id="voice-123""#));
        assert!(prompt.contains("Section: Light reactions (Duration: 45 seconds)"));
        assert!(prompt.contains("Content: Chlorophyll absorbs light"));
        assert!(!prompt.contains(IMAGE_SCENE_NOTE));
    }

    #[test]
    fn test_image_notes_added_only_with_image() {
        let job = Job::new("leaf").with_image(ImagePayload::from_base64("AAAA", None));
        assert!(plan_prompt(&job).contains(IMAGE_PLAN_NOTE));
        assert!(section_prompt(&job, "v", &section()).contains(IMAGE_SCENE_NOTE));
        assert!(!plan_prompt(&Job::new("leaf")).contains(IMAGE_PLAN_NOTE));
    }

    #[test]
    fn test_mode_changes_pacing() {
        let deep = plan_prompt(&Job::new("x"));
        let fast = plan_prompt(&Job::new("x").with_mode(Mode::Fast));
        assert!(deep.contains("4 to 6 sections"));
        assert!(fast.contains("2 or 3 short sections"));
    }
}
