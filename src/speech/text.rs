//! Spoken-output text cleaning.
//!
//! [`finalize_spoken_output`] is the one cleaner applied to everything the
//! assistant says aloud, conversational replies and onboarding narration
//! alike. Chunking runs on its output.

/// Clean text for speech.
///
/// Applies the following transformations in order:
/// 1. Rewrite generic self-references ("assistant", "AI assistant",
///    "the AI") to the assistant's name
/// 2. Strip `*` emphasis markers
/// 3. Strip `:shortcode:` emoji
/// 4. Strip pictographic emoji
/// 5. Strip markdown (links keep their text, emphasis underscores, inline
///    code backticks, heading/quote/list markers)
/// 6. Collapse whitespace and repeated punctuation, then trim
pub fn finalize_spoken_output(text: &str, assistant_name: &str) -> String {
    let text = enforce_agent_name(text, assistant_name);
    let text = text.replace('*', "");
    let text = strip_shortcodes(&text);
    let text: String = text.chars().filter(|&c| !is_pictographic(c)).collect();
    let text = strip_markdown(&text);
    normalize_whitespace(&text)
}

/// Generic self-references, longest first so "ai assistant" wins over
/// "assistant".
const SELF_REFERENCES: &[&str] = &["ai assistant", "the ai", "assistant"];

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Replace whole-word, ASCII case-insensitive self-references with `name`.
fn enforce_agent_name(text: &str, name: &str) -> String {
    let lower = text.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        let at_word_start = i == 0 || !is_word_byte(bytes[i - 1]);
        let hit = at_word_start
            .then(|| {
                SELF_REFERENCES.iter().find(|p| {
                    let end = i + p.len();
                    lower[i..].starts_with(*p)
                        && (end == bytes.len() || !is_word_byte(bytes[end]))
                })
            })
            .flatten();
        match hit {
            Some(pattern) => {
                out.push_str(&text[copied..i]);
                out.push_str(name);
                i += pattern.len();
                copied = i;
            }
            None => {
                // Step over a whole char so slicing stays on boundaries.
                i += text[i..].chars().next().map_or(1, char::len_utf8);
            }
        }
    }
    out.push_str(&text[copied..]);
    out
}

/// Remove `:shortcode:` emoji. A shortcode needs at least one letter so
/// clock times like `10:30:45` survive.
fn strip_shortcodes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find(':') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let body_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-')))
            .unwrap_or(after.len());
        let body = &after[..body_len];
        if body_len > 0
            && after[body_len..].starts_with(':')
            && body.chars().any(|c| c.is_ascii_alphabetic())
        {
            rest = &after[body_len + 1..];
        } else {
            out.push(':');
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

fn is_pictographic(c: char) -> bool {
    matches!(
        u32::from(c),
        0x1F000..=0x1FAFF
            | 0x2600..=0x27BF
            | 0x2B05..=0x2B55
            | 0x2300..=0x23FF
            | 0xFE00..=0xFE0F
            | 0x200D
            | 0x20E3
            | 0xE0020..=0xE007F
    )
}

fn strip_markdown(text: &str) -> String {
    let text = strip_links(text);
    let text = strip_emphasis_underscores(&text);
    let text = text.replace('`', "");
    text.split('\n')
        .map(strip_line_marker)
        .collect::<Vec<_>>()
        .join("\n")
}

/// `[text](url)` becomes `text`.
fn strip_links(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let link = after.find(']').and_then(|close| {
            let label = &after[..close];
            let tail = after[close + 1..].strip_prefix('(')?;
            let url_end = tail.find(')')?;
            (!label.is_empty() && url_end > 0).then_some((label, close + 1 + 1 + url_end + 1))
        });
        match link {
            Some((label, consumed)) => {
                out.push_str(label);
                rest = &after[consumed..];
            }
            None => {
                out.push('[');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Drop `_` emphasis markers. Underscores inside a word (`snake_case`) are
/// kept.
fn strip_emphasis_underscores(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    for (i, &c) in chars.iter().enumerate() {
        if c == '_' {
            let prev_word = i > 0 && chars[i - 1].is_alphanumeric();
            let next_word = chars.get(i + 1).is_some_and(|n| n.is_alphanumeric());
            if !(prev_word && next_word) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Strip a leading heading, quote or list marker (up to three spaces of
/// indentation, then `#`..`######`, `>`, `-`, `*` or `+`, then whitespace).
fn strip_line_marker(line: &str) -> &str {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return line;
    }
    let body = &line[indent..];
    let marker_len = if body.starts_with('#') {
        let hashes = body.len() - body.trim_start_matches('#').len();
        if hashes > 6 {
            return line;
        }
        hashes
    } else if body.starts_with(['>', '-', '*', '+']) {
        1
    } else {
        return line;
    };
    let after = &body[marker_len..];
    let trimmed = after.trim_start();
    if trimmed.len() == after.len() {
        return line;
    }
    trimmed
}

fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut gap = Gap::default();
    let mut punct: Option<char> = None;

    for c in text.chars() {
        if matches!(c, '.' | '!' | '?' | ',') {
            // A run of punctuation keeps only its last mark.
            if punct.is_none() {
                gap.emit(&mut out);
            }
            punct = Some(c);
            continue;
        }
        if let Some(p) = punct.take() {
            out.push(p);
        }
        match c {
            ' ' | '\t' => gap.space = true,
            '\n' => gap.newlines += 1,
            _ => {
                gap.emit(&mut out);
                out.push(c);
            }
        }
    }
    if let Some(p) = punct {
        out.push(p);
    }
    out.trim().to_owned()
}

/// Whitespace seen since the last emitted character.
#[derive(Default)]
struct Gap {
    space: bool,
    newlines: usize,
}

impl Gap {
    fn emit(&mut self, out: &mut String) {
        if !out.is_empty() {
            match self.newlines {
                0 if self.space => out.push(' '),
                0 => {}
                1 => out.push('\n'),
                _ => out.push_str("\n\n"),
            }
        }
        *self = Self::default();
    }
}
