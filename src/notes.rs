//! Memory and image notes.
//!
//! Completed turns are batched and saved as a single memory note so later
//! prompts can be given context from earlier conversations. Generated images
//! are saved as image notes. Note storage itself belongs to the UI layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

const MEMORY_TITLE_PREFIX_CHARS: usize = 40;
const MEMORY_PART_SEPARATOR: &str = "\n---\n";

/// One completed exchange, held until the memory batch is flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub user_prompt: String,
    pub agent_response: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoteContent {
    Memory {
        user_prompt: String,
        agent_response: String,
    },
    Image {
        /// `data:<mime>;base64,<payload>` URL.
        data_url: String,
        prompt: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: u64,
    pub title: String,
    pub content: NoteContent,
    pub created_at: DateTime<Utc>,
}

impl Note {
    pub fn is_memory(&self) -> bool {
        matches!(self.content, NoteContent::Memory { .. })
    }
}

/// A note about to be stored; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNote {
    pub title: String,
    pub content: NoteContent,
}

/// Note persistence collaborator.
pub trait NoteStore: Send + Sync {
    fn add(&self, note: NewNote) -> Note;
    fn notes(&self) -> Vec<Note>;

    fn memory_notes(&self) -> Vec<Note> {
        self.notes().into_iter().filter(Note::is_memory).collect()
    }
}

/// Build the memory note for a batch of turns.
///
/// Returns `None` for an empty batch.
pub fn build_memory_note(turns: &[ConversationTurn]) -> Option<NewNote> {
    let first = turns.first()?;
    let prefix: String = first
        .user_prompt
        .chars()
        .take(MEMORY_TITLE_PREFIX_CHARS)
        .collect();
    let join = |f: fn(&ConversationTurn) -> &str| {
        turns
            .iter()
            .map(f)
            .collect::<Vec<_>>()
            .join(MEMORY_PART_SEPARATOR)
    };
    Some(NewNote {
        title: format!("Memory: {prefix}..."),
        content: NoteContent::Memory {
            user_prompt: join(|t| t.user_prompt.as_str()),
            agent_response: join(|t| t.agent_response.as_str()),
        },
    })
}

/// Build an image note from a generated image.
pub fn build_image_note(prompt: &str, mime_type: &str, base64_data: &str) -> NewNote {
    let title: String = prompt.chars().take(MEMORY_TITLE_PREFIX_CHARS).collect();
    NewNote {
        title: format!("Image: {title}"),
        content: NoteContent::Image {
            data_url: format!("data:{mime_type};base64,{base64_data}"),
            prompt: prompt.to_owned(),
        },
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    notes: Vec<Note>,
    next_id: u64,
}

/// Notes kept in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct InMemoryNoteStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NoteStore for InMemoryNoteStore {
    fn add(&self, note: NewNote) -> Note {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.next_id += 1;
        let stored = Note {
            id: inner.next_id,
            title: note.title,
            content: note.content,
            created_at: Utc::now(),
        };
        inner.notes.push(stored.clone());
        stored
    }

    fn notes(&self) -> Vec<Note> {
        match self.inner.lock() {
            Ok(guard) => guard.notes.clone(),
            Err(poisoned) => poisoned.into_inner().notes.clone(),
        }
    }
}
