//! Append-only conversation transcript with a bounded length.
//!
//! Entry ids are strictly increasing for the lifetime of a log, including
//! across evictions and reloads. The only in-place mutation allowed is
//! appending streamed text to (or finalizing) the most recent agent entry.

use crate::error::{AssistantError, Result};
use crate::state::Speaker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;

/// One line of the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: u64,
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Capped transcript log.
#[derive(Debug, Clone)]
pub struct TranscriptLog {
    entries: VecDeque<TranscriptEntry>,
    capacity: usize,
    next_id: u64,
}

impl TranscriptLog {
    /// Create an empty log holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            next_id: 1,
        }
    }

    /// Append a new entry, evicting the oldest ones beyond capacity.
    pub fn append(&mut self, speaker: Speaker, text: impl Into<String>) -> &TranscriptEntry {
        let entry = TranscriptEntry {
            id: self.next_id,
            speaker,
            text: text.into(),
            timestamp: Utc::now(),
        };
        self.next_id += 1;
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        // Just pushed, so the back is present.
        &self.entries[self.entries.len() - 1]
    }

    /// Append a streamed chunk to entry `id`, wherever it sits in the log.
    ///
    /// Returns `None` when the entry has been evicted or cleared.
    pub fn append_to(&mut self, id: u64, chunk: &str) -> Option<&TranscriptEntry> {
        let entry = self.entries.iter_mut().rev().find(|e| e.id == id)?;
        entry.text.push_str(chunk);
        Some(entry)
    }

    /// Replace the text of entry `id`.
    pub fn replace_text(&mut self, id: u64, text: &str) -> Option<&TranscriptEntry> {
        let entry = self.entries.iter_mut().rev().find(|e| e.id == id)?;
        entry.text = text.to_owned();
        Some(entry)
    }

    /// Most recent agent entry anywhere in the log.
    pub fn last_agent(&self) -> Option<&TranscriptEntry> {
        self.entries.iter().rev().find(|e| e.speaker == Speaker::Agent)
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.back()
    }

    pub fn entries(&self) -> impl Iterator<Item = &TranscriptEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry. Ids keep increasing afterwards.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Load a log previously written with [`TranscriptLog::save_to_file`].
    ///
    /// A missing file yields an empty log.
    pub fn load_from_file(path: &Path, capacity: usize) -> Result<Self> {
        let mut log = Self::new(capacity);
        if !path.exists() {
            return Ok(log);
        }
        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<TranscriptEntry> = serde_json::from_str(&raw).map_err(|e| {
            AssistantError::Config(format!(
                "failed to parse transcript {}: {e}",
                path.display()
            ))
        })?;
        log.next_id = entries.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        let skip = entries.len().saturating_sub(log.capacity);
        log.entries = entries.into_iter().skip(skip).collect();
        Ok(log)
    }

    /// Persist the log as a JSON array.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entries: Vec<&TranscriptEntry> = self.entries.iter().collect();
        let json = serde_json::to_string_pretty(&entries)
            .map_err(|e| AssistantError::Config(format!("failed to serialize transcript: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
