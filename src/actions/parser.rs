//! Extraction of `[ACTION: name, {json}]` tags from a completed model reply.
//!
//! Runs once per reply, after the stream has finished, so tags are never
//! seen half-written. Every recognized tag is removed from the visible text,
//! including tags whose JSON payload is malformed; those are logged and
//! skipped without affecting the tags around them.

use super::{ActionError, AgentAction};
use tracing::warn;

const TAG_OPEN: &str = "[ACTION:";

/// A syntactically valid tag before its name is checked.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAction {
    pub name: String,
    pub params: serde_json::Value,
}

/// A reply with its action tags removed and the recognized actions in order
/// of appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    /// The only text ever displayed or spoken for this reply.
    pub cleaned_text: String,
    pub actions: Vec<AgentAction>,
}

/// Parse a completed reply into cleaned text and recognized actions.
///
/// Unknown action names and invalid parameters are logged and dropped.
pub fn parse_agent_actions(text: &str) -> ParsedResponse {
    let (cleaned_text, raw) = extract_action_tags(text);
    let actions = raw
        .iter()
        .filter_map(|r| match AgentAction::from_raw(r) {
            Ok(action) => Some(action),
            Err(ActionError::Unknown(name)) => {
                warn!("ignoring unknown agent action: {name}");
                None
            }
            Err(e) => {
                warn!("dropping agent action: {e}");
                None
            }
        })
        .collect();
    ParsedResponse {
        cleaned_text,
        actions,
    }
}

/// Remove every action tag from `text`, returning the cleaned text and the
/// tags whose JSON payload parsed.
pub fn extract_action_tags(text: &str) -> (String, Vec<RawAction>) {
    let mut out = String::with_capacity(text.len());
    let mut actions = Vec::new();
    let mut cursor = 0;

    while let Some(rel) = text[cursor..].find(TAG_OPEN) {
        let start = cursor + rel;
        let Some(tag) = scan_tag(&text[start..]) else {
            // Looks like a tag opener but is not one; keep the bracket.
            out.push_str(&text[cursor..start + 1]);
            cursor = start + 1;
            continue;
        };

        out.push_str(&text[cursor..start]);
        match tag.payload {
            Ok(params) => actions.push(RawAction {
                name: tag.name.to_owned(),
                params,
            }),
            Err(reason) => warn!("skipping malformed action tag {}: {reason}", tag.name),
        }
        cursor = close_gap(&mut out, text, start + tag.len);
    }

    out.push_str(&text[cursor..]);
    (out.trim().to_owned(), actions)
}

struct ScannedTag<'a> {
    name: &'a str,
    /// Byte length of the whole tag, brackets included.
    len: usize,
    payload: Result<serde_json::Value, String>,
}

/// Scan one tag at the start of `s` (which begins with [`TAG_OPEN`]).
///
/// Returns `None` when the text is not tag-shaped at all. A tag-shaped span
/// whose payload is unbalanced or not JSON is returned with an error payload
/// so it can still be stripped.
fn scan_tag(s: &str) -> Option<ScannedTag<'_>> {
    let mut pos = TAG_OPEN.len();
    pos += leading_ws(&s[pos..]);

    let name_len = s[pos..]
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(s.len() - pos);
    if name_len == 0 {
        return None;
    }
    let name = &s[pos..pos + name_len];
    pos += name_len;
    pos += leading_ws(&s[pos..]);

    // `[ACTION: list_contacts]` carries no payload.
    if s[pos..].starts_with(']') {
        return Some(ScannedTag {
            name,
            len: pos + 1,
            payload: Ok(serde_json::Value::Object(serde_json::Map::new())),
        });
    }
    if !s[pos..].starts_with(',') {
        return None;
    }
    pos += 1;
    pos += leading_ws(&s[pos..]);
    if !s[pos..].starts_with('{') {
        return None;
    }

    if let Some(obj_len) = balanced_object_len(&s[pos..]) {
        let json = &s[pos..pos + obj_len];
        let after = pos + obj_len + leading_ws(&s[pos + obj_len..]);
        if s[after..].starts_with(']') {
            return Some(ScannedTag {
                name,
                len: after + 1,
                payload: serde_json::from_str(json).map_err(|e| e.to_string()),
            });
        }
    }

    // Unbalanced or unterminated payload: strip up to the next bracket.
    let close = s[pos..].find(']')?;
    Some(ScannedTag {
        name,
        len: pos + close + 1,
        payload: Err("unterminated JSON payload".to_owned()),
    })
}

/// Byte length of the balanced `{...}` object at the start of `s`.
///
/// Braces inside JSON strings (with escapes) are ignored.
fn balanced_object_len(s: &str) -> Option<usize> {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn leading_ws(s: &str) -> usize {
    s.len() - s.trim_start().len()
}

/// Join the text on both sides of a removed tag, collapsing the whitespace
/// that surrounded it. Returns the index where copying resumes.
fn close_gap(out: &mut String, text: &str, resume: usize) -> usize {
    let kept = out.trim_end().len();
    let had_ws_before = kept < out.len();
    let newlines_before = out[kept..].matches('\n').count();
    out.truncate(kept);

    let rest = &text[resume..];
    let skipped = leading_ws(rest);
    let newlines_after = rest[..skipped].matches('\n').count();
    let had_gap = had_ws_before || skipped > 0;
    let next = resume + skipped;

    if !out.is_empty() && next < text.len() && had_gap {
        match newlines_before + newlines_after {
            0 => out.push(' '),
            1 => out.push('\n'),
            _ => out.push_str("\n\n"),
        }
    }
    next
}
