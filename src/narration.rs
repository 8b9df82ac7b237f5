//! Narration extraction from generated scene code.
//!
//! Spoken text lives in `self.voiceover(text="...")` calls. Every string
//! literal passed there is collected in source order, unescaped,
//! whitespace-collapsed and joined with single spaces.

use regex::{Captures, Regex};
use std::sync::OnceLock;

fn voiceover_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r#"self\.voiceover\(\s*(?:text\s*=\s*)?(?P<prefix>[fFbBrRuU]{0,2})"#,
            r#"(?:"""(?P<tdq>(?s:.*?))""""#,
            r#"|'''(?P<tsq>(?s:.*?))'''"#,
            r#"|"(?P<dq>(?:[^"\\\n]|\\.)*)""#,
            r#"|'(?P<sq>(?:[^'\\\n]|\\.)*)')"#,
        ))
        .expect("voiceover pattern is valid")
    })
}

/// Returns the narration spoken by `code`, or an empty string when there is
/// none.
pub fn extract_narration(code: &str) -> String {
    voiceover_pattern()
        .captures_iter(code)
        .filter_map(|caps| literal_text(&caps))
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn literal_text(caps: &Captures<'_>) -> Option<String> {
    let prefix = caps
        .name("prefix")
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_default();
    // bytes literals are not speakable text
    if prefix.contains('b') {
        return None;
    }

    let body = ["tdq", "tsq", "dq", "sq"]
        .iter()
        .find_map(|name| caps.name(name))?
        .as_str();

    if prefix.contains('r') || prefix.contains('f') {
        Some(body.to_string())
    } else {
        Some(unescape(body))
    }
}

fn unescape(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(escape) = chars.next() else {
            out.push('\\');
            break;
        };
        let decoded = match escape {
            'n' => Some('\n'),
            't' => Some('\t'),
            'r' => Some('\r'),
            'a' => Some('\u{7}'),
            'b' => Some('\u{8}'),
            'f' => Some('\u{c}'),
            'v' => Some('\u{b}'),
            '\\' | '\'' | '"' => Some(escape),
            'x' => hex_escape(&mut chars, 2),
            'u' => hex_escape(&mut chars, 4),
            'U' => hex_escape(&mut chars, 8),
            '0'..='7' => {
                let mut value = escape.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(digit) => {
                            value = value * 8 + digit;
                            chars.next();
                        }
                        None => break,
                    }
                }
                char::from_u32(value)
            }
            // line continuation
            '\n' => continue,
            _ => None,
        };
        match decoded {
            Some(decoded) => out.push(decoded),
            // unknown escapes and `\N{..}` names stay as written
            None => {
                out.push('\\');
                out.push(escape);
            }
        }
    }
    out
}

/// Decodes exactly `digits` hex digits. On a short or invalid sequence
/// nothing is consumed.
fn hex_escape(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, digits: usize) -> Option<char> {
    let lookahead = chars.clone().take(digits).collect::<String>();
    if lookahead.len() != digits || !lookahead.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let decoded = u32::from_str_radix(&lookahead, 16).ok().and_then(char::from_u32)?;
    for _ in 0..digits {
        chars.next();
    }
    Some(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_in_source_order() {
        let code = r#"
class Intro(VoiceoverScene):
    def construct(self):
        with self.voiceover(text="Plants make food.") as tracker:
            self.play(Write(title))
        with self.voiceover(text='They use   sunlight.') as tracker:
            pass
"#;
        assert_eq!(extract_narration(code), "Plants make food. They use sunlight.");
    }

    #[test]
    fn test_positional_and_triple_quoted() {
        let code = "with self.voiceover(\"\"\"First line\n   second line\"\"\"):\n    pass\nwith self.voiceover('Next'):\n    pass";
        assert_eq!(extract_narration(code), "First line second line Next");
    }

    #[test]
    fn test_escaped_quotes_are_unescaped() {
        let code = r#"with self.voiceover(text="The \"light\" reactions"):"#;
        assert_eq!(extract_narration(code), r#"The "light" reactions"#);
    }

    #[test]
    fn test_hex_and_unicode_escapes_are_decoded() {
        let code = r#"with self.voiceover(text="caf\xe9 \u03c0r\u00b2 \U0001F331 \101"):"#;
        assert_eq!(extract_narration(code), "café πr² 🌱 A");
    }

    #[test]
    fn test_malformed_and_named_escapes_kept() {
        assert_eq!(unescape(r"\xZZ \u12 \N{BULLET} \q"), r"\xZZ \u12 \N{BULLET} \q");
    }

    #[test]
    fn test_fstring_kept_verbatim() {
        let code = r#"with self.voiceover(text=f"Step {n} begins"):"#;
        assert_eq!(extract_narration(code), "Step {n} begins");
    }

    #[test]
    fn test_raw_string_not_unescaped() {
        let code = r#"with self.voiceover(text=r"a\nb"):"#;
        assert_eq!(extract_narration(code), r"a\nb");
    }

    #[test]
    fn test_bytes_literal_skipped() {
        let code = r#"with self.voiceover(text=b"raw bytes"):
with self.voiceover(text="spoken"):"#;
        assert_eq!(extract_narration(code), "spoken");
    }

    #[test]
    fn test_no_voiceover_is_empty() {
        assert_eq!(extract_narration("class A(Scene):\n    pass\n"), "");
        assert_eq!(extract_narration(""), "");
    }

    #[test]
    fn test_empty_literals_skipped() {
        let code = r#"with self.voiceover(text="   "):
with self.voiceover(text="Hello"):"#;
        assert_eq!(extract_narration(code), "Hello");
    }
}
