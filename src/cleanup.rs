//! Deterministic cleanup for generated scene code.
//!
//! Every rule is idempotent, so cleaning already-clean code is a no-op. The
//! same rules run on freshly generated code and on repaired code.

const MANIM_IMPORT: &str = "from manim import *";
const VOICEOVER_IMPORT: &str = "from manim_voiceover import VoiceoverScene";
const ELEVENLABS_IMPORT: &str = "from manim_voiceover.services.elevenlabs import ElevenLabsService";

const MAX_BLANK_RUN: usize = 2;

pub fn clean_scene_code(code: &str) -> String {
    let code = code
        .replace('\u{feff}', "")
        .replace("\r\n", "\n")
        .replace('\r', "\n");

    let mut lines = code
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .map(|line| expand_indent(line).trim_end().to_string())
        .collect::<Vec<_>>();

    add_missing_imports(&mut lines);
    join_lines(&lines)
}

/// Replaces tabs in the indentation with four spaces.
fn expand_indent(line: &str) -> String {
    let indent_len = line
        .find(|c: char| c != ' ' && c != '\t')
        .unwrap_or(line.len());
    let (indent, rest) = line.split_at(indent_len);
    format!("{}{rest}", indent.replace('\t', "    "))
}

fn add_missing_imports(lines: &mut Vec<String>) {
    let mentions = |needle: &str| lines.iter().any(|line| line.contains(needle));
    let imports = |prefix: &str| {
        lines
            .iter()
            .any(|line| line.trim_start().starts_with(prefix))
    };

    let mut missing = Vec::new();
    if mentions("Scene") && !imports("from manim import") && !imports("import manim") {
        missing.push(MANIM_IMPORT);
    }
    if mentions("VoiceoverScene") && !imports("from manim_voiceover import") {
        missing.push(VOICEOVER_IMPORT);
    }
    if mentions("ElevenLabsService") && !imports("from manim_voiceover.services.elevenlabs import") {
        missing.push(ELEVENLABS_IMPORT);
    }

    if !missing.is_empty() {
        lines.splice(0..0, missing.into_iter().map(str::to_string));
    }
}

/// Drops leading and trailing blank lines, caps blank runs and ends with a
/// single newline.
fn join_lines(lines: &[String]) -> String {
    let mut out = Vec::with_capacity(lines.len());
    let mut blank_run = 0;
    for line in lines {
        if line.is_empty() {
            blank_run += 1;
            if out.is_empty() || blank_run > MAX_BLANK_RUN {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push(line.as_str());
    }
    while out.last().is_some_and(|line| line.is_empty()) {
        out.pop();
    }

    if out.is_empty() {
        String::new()
    } else {
        format!("{}\n", out.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalizes_line_endings_and_trailing_space() {
        let cleaned = clean_scene_code("x = 1  \r\ny = 2\t\r\n");
        assert_eq!(cleaned, "x = 1\ny = 2\n");
    }

    #[test]
    fn test_expands_tab_indentation_only() {
        let cleaned = clean_scene_code("def f():\n\treturn 'a\\tb'\n");
        assert_eq!(cleaned, "def f():\n    return 'a\\tb'\n");
    }

    #[test]
    fn test_strips_stray_fences() {
        let cleaned = clean_scene_code("```python\nx = 1\n```\n");
        assert_eq!(cleaned, "x = 1\n");
    }

    #[test]
    fn test_adds_missing_imports_once() {
        let code = "class Intro(VoiceoverScene):\n    def construct(self):\n        self.set_speech_service(ElevenLabsService(voice_id=\"v\"))\n";
        let cleaned = clean_scene_code(code);
        assert!(cleaned.starts_with(&format!("{MANIM_IMPORT}\n{VOICEOVER_IMPORT}\n{ELEVENLABS_IMPORT}\n")));
        assert_eq!(clean_scene_code(&cleaned), cleaned);
    }

    #[test]
    fn test_existing_imports_kept() {
        let code = "from manim import *\n\nclass A(Scene):\n    pass\n";
        assert_eq!(clean_scene_code(code), code);
    }

    #[test]
    fn test_blank_runs_capped() {
        let cleaned = clean_scene_code("\n\na = 1\n\n\n\n\nb = 2\n\n\n");
        assert_eq!(cleaned, "a = 1\n\n\nb = 2\n");
    }

    #[test]
    fn test_empty_input_stays_empty() {
        assert_eq!(clean_scene_code(""), "");
        assert_eq!(clean_scene_code("\n \n\t\n"), "");
    }

    proptest! {
        #[test]
        fn prop_cleanup_is_idempotent(code in "(?s).{0,200}") {
            let once = clean_scene_code(&code);
            prop_assert_eq!(clean_scene_code(&once), once);
        }
    }
}
