//! Splitting cleaned text into bounded-length utterances.
//!
//! Text is first split into sentences at terminal punctuation. Any sentence
//! longer than the limit is broken at the last space within the limit, or
//! hard-cut at the limit when no usable space exists.

/// Split `text` into chunks of at most `max_chars` characters.
///
/// Chunks are trimmed and never empty. Joining them with single spaces
/// reproduces the input with its whitespace normalized.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    for sentence in split_sentences(text) {
        split_long(sentence, max_chars, &mut chunks);
    }
    chunks
}

/// Sentence-like units: a run of text ending in `.`, `?` or `!` marks
/// followed by whitespace or the end of the text. Trailing text without a
/// terminator forms the last unit.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut units = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if !matches!(c, '.' | '?' | '!') {
            continue;
        }
        while let Some(&(_, next)) = chars.peek() {
            if matches!(next, '.' | '?' | '!') {
                chars.next();
            } else {
                break;
            }
        }
        let end = chars.peek().map_or(text.len(), |&(i, _)| i);
        let at_boundary = chars.peek().is_none_or(|&(_, n)| n.is_whitespace());
        if at_boundary {
            push_unit(&mut units, &text[start..end]);
            start = end;
        }
    }
    push_unit(&mut units, &text[start..]);
    units
}

fn push_unit<'a>(units: &mut Vec<&'a str>, unit: &'a str) {
    let unit = unit.trim();
    if !unit.is_empty() {
        units.push(unit);
    }
}

fn split_long(sentence: &str, max_chars: usize, chunks: &mut Vec<String>) {
    let mut rest = sentence;
    loop {
        // Byte offset of the first char past the limit.
        let Some((limit, _)) = rest.char_indices().nth(max_chars) else {
            if !rest.is_empty() {
                chunks.push(rest.to_owned());
            }
            return;
        };
        // A space exactly at the limit still yields a full-length chunk.
        let split = if rest[limit..].starts_with(' ') {
            Some(limit)
        } else {
            rest[..limit].rfind(' ')
        };
        let cut = match split {
            Some(pos) if pos > 0 => pos,
            _ => limit,
        };
        chunks.push(rest[..cut].trim_end().to_owned());
        rest = rest[cut..].trim_start();
    }
}
