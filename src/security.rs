//! Input sanitization and prompt-boundary checks for user submissions, plus
//! a best-effort leak scan over model output.
//!
//! - [`sanitize_input`]: length cap, script removal, event-handler and HTML
//!   neutralization
//! - [`validate_prompt_boundaries`]: rejects text that tries to override the
//!   system prompt ("ignore previous instructions", `system:` labels, ...)
//! - [`scan_model_output`]: warns about emails, SSNs, card and phone numbers,
//!   API keys. Never blocks.

use crate::error::{AssistantError, Result};
use regex::Regex;
use std::sync::LazyLock;
use tracing::{error, warn};

/// Outcome of sanitizing a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputReport {
    /// Sanitized text. Only meaningful when [`InputReport::is_valid`].
    pub sanitized: String,
    /// Problems that reject the submission.
    pub errors: Vec<String>,
    /// Problems that were neutralized in place.
    pub warnings: Vec<String>,
}

impl InputReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Convert into the sanitized text, or an [`AssistantError::InvalidInput`]
    /// listing every error.
    pub fn into_result(self) -> Result<String> {
        if self.is_valid() {
            Ok(self.sanitized)
        } else {
            Err(AssistantError::InvalidInput(self.errors.join(", ")))
        }
    }
}

/// Sanitize a user submission.
///
/// Oversized input and `<script>` blocks are errors. Inline event handlers
/// (`onclick=`) and other HTML tags are neutralized with a warning. SQL-looking
/// fragments only warn, so ordinary prose with apostrophes or words like
/// "create" and "delete" is never rejected.
pub fn sanitize_input(input: &str, max_length: usize) -> InputReport {
    let mut report = InputReport::default();
    let mut text = input.to_owned();

    if input.chars().count() > max_length {
        report.errors.push(format!(
            "Input exceeds maximum length of {max_length} characters"
        ));
        text = input.chars().take(max_length).collect();
    }

    let (stripped, had_script) = replace_all(&SCRIPT_BLOCK, &text, "");
    if had_script {
        error!("script injection attempt detected in submission");
        report.errors.push("Script tags detected and removed".to_owned());
        text = stripped;
    }

    let (neutralized, had_handler) = replace_all(&EVENT_HANDLER, &text, "data-blocked-event=");
    if had_handler {
        report
            .warnings
            .push("Event handlers detected and removed".to_owned());
        text = neutralized;
    }

    if has_match(&HTML_TAG, &text) {
        report
            .warnings
            .push("HTML tags detected and escaped".to_owned());
        text = text.replace('<', "&lt;").replace('>', "&gt;");
    }

    if looks_like_sql_injection(&text) {
        warn!("SQL-like fragment in submission");
        report
            .warnings
            .push("Potential SQL injection pattern detected".to_owned());
    }

    report.sanitized = text;
    report
}

/// Phrases that try to replace the system prompt. Matched against the
/// lowercased input with whitespace runs collapsed to one space.
const INJECTION_PHRASES: &[&str] = &[
    "ignore previous instruction",
    "ignore all previous instruction",
    "ignore previous prompt",
    "ignore all previous prompt",
    "forget everything",
    "forget all instructions",
    "new instruction",
    "new prompt",
    "[inst]",
    "[/inst]",
];

/// Reject input that looks like an instruction to override the system prompt.
pub fn validate_prompt_boundaries(input: &str) -> Result<()> {
    let normalized = collapse_whitespace(&input.to_lowercase());

    let phrase_hit = INJECTION_PHRASES
        .iter()
        .copied()
        .find(|p| normalized.contains(p));
    let label_hit = has_match(&ROLE_LABEL, &normalized).then_some("role label");

    if let Some(hit) = phrase_hit.or(label_hit) {
        error!(pattern = hit, "prompt injection attempt blocked");
        return Err(AssistantError::PromptInjection);
    }
    Ok(())
}

/// Scan a model reply for data that should not have been emitted.
///
/// Returns one warning per category found.
pub fn scan_model_output(output: &str) -> Vec<String> {
    LEAK_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(output))
        .map(|(kind, _)| {
            warn!("potential data leak in model output: {kind}");
            format!("Potential {kind} detected in output")
        })
        .collect()
}

// ── Patterns ───────────────────────────────────────────────────

/// Compile a built-in pattern. A pattern that fails to compile disables its
/// check and is logged.
fn compile(pattern: &str) -> Option<Regex> {
    Regex::new(pattern)
        .map_err(|e| error!("invalid built-in pattern {pattern:?}: {e}"))
        .ok()
}

/// `<script ...>...</script>`, across lines. An opening tag without a
/// matching close is left to the HTML escape pass.
static SCRIPT_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r"(?is)<script[\s/>].*?</script>"));

/// `on<word>=` attribute openers.
static EVENT_HANDLER: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r"(?i)\bon\w+\s*="));

/// Something shaped like `<...>`.
static HTML_TAG: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r"<[^<>]*>"));

/// `system:` or `assistant :` as a whole word, over normalized text.
static ROLE_LABEL: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r"\b(?:system|assistant) ?:"));

/// Output leak detectors, in reporting order.
static LEAK_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
        ("SSN", r"\b[0-9]{3}-[0-9]{2}-[0-9]{4}\b"),
        (
            "credit card",
            r"\b[0-9]{4}[ -]?[0-9]{4}[ -]?[0-9]{4}[ -]?[0-9]{4}\b",
        ),
        ("phone number", r"\b[0-9]{3}[ -]?[0-9]{3}[ -]?[0-9]{4}\b"),
        ("API key", r#"(?i)api[_ ]?key[_ ]?[:=]\s*['"]?[\w-]{20,}"#),
    ]
    .into_iter()
    .filter_map(|(kind, pattern)| compile(pattern).map(|re| (kind, re)))
    .collect()
});

fn has_match(pattern: &Option<Regex>, text: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(text))
}

/// Replace every match, reporting whether anything was replaced.
fn replace_all(pattern: &Option<Regex>, text: &str, with: &str) -> (String, bool) {
    match pattern.as_ref() {
        Some(re) if re.is_match(text) => (re.replace_all(text, with).into_owned(), true),
        _ => (text.to_owned(), false),
    }
}

fn looks_like_sql_injection(text: &str) -> bool {
    let normalized = collapse_whitespace(&text.to_lowercase());
    normalized.contains("union select")
        || normalized.contains("' or '1'='1")
        || normalized.contains("' or 1=1")
        || normalized.contains("; drop table")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
