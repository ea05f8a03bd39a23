//! Hosted model service contract.
//!
//! The turn controller only talks to a [`ModelService`]: streamed text for
//! conversational replies, one-shot image generation, a yes/no visual
//! classifier and memory retrieval. [`gemini::GeminiClient`] is the HTTP
//! implementation.

pub mod gemini;
pub mod sse;

use crate::actions::AgentAction;
use crate::error::{AssistantError, Result};
use crate::notes::{Note, NoteContent};
use crate::state::Feature;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

pub use gemini::{GeminiClient, GeminiConfig};

/// Streamed reply fragments in arrival order.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A camera frame attached to a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFrame {
    pub mime_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

impl ImageFrame {
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        use base64::Engine as _;
        Self {
            mime_type: mime_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

/// One conversational request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub text: String,
    pub image: Option<ImageFrame>,
}

impl PromptRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
        }
    }
}

/// A generated image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub base64_data: String,
}

impl ImagePayload {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64_data)
    }
}

#[async_trait]
pub trait ModelService: Send + Sync {
    /// Start a streamed reply within the ongoing chat session.
    async fn stream_text(&self, request: PromptRequest) -> Result<TextStream>;

    async fn generate_image(&self, prompt: &str) -> Result<ImagePayload>;

    /// Whether answering `prompt` needs the camera feed.
    async fn classify_visual(&self, prompt: &str) -> Result<bool>;

    /// The most relevant earlier exchange for `prompt`, formatted as
    /// context, if any.
    async fn retrieve_memory(&self, prompt: &str, memories: &[Note]) -> Result<Option<String>>;

    /// Start a fresh chat session with a new system instruction.
    fn reset_session(&self, _system_instruction: &str) {}
}

/// Map a failed model call to the error shown to the user.
///
/// HTTP 429 and messages mentioning quota exhaustion become
/// [`AssistantError::QuotaExceeded`].
pub fn normalize_model_error(status: Option<u16>, message: &str) -> AssistantError {
    let lower = message.to_lowercase();
    if status == Some(429)
        || lower.contains("quota")
        || lower.contains("resource_exhausted")
        || lower.contains("429")
    {
        AssistantError::QuotaExceeded
    } else {
        AssistantError::Model(message.to_owned())
    }
}

pub(crate) const VISUAL_CLASSIFIER_INSTRUCTION: &str = "You are a request classifier. \
Decide whether the user's request needs the device camera to see something in the real \
world. Answer only YES or NO. \"What am I wearing?\" or \"Can you see this?\" is YES. \
\"What is the capital of France?\" is NO.";

pub(crate) const MEMORY_RETRIEVAL_INSTRUCTION: &str = "You are a memory retrieval system. \
Pick the past conversation most relevant to the user's current query. Respond only with \
its numeric ID, or NONE if none is relevant.";

pub(crate) fn visual_classifier_prompt(prompt: &str) -> String {
    format!("User request: \"{prompt}\"")
}

/// Classifier replies count as visual when they contain "YES".
pub(crate) fn parse_visual_verdict(reply: &str) -> bool {
    reply.trim().to_uppercase().contains("YES")
}

/// Prompt listing the memory notes by id for the retrieval model.
pub fn memory_retrieval_prompt(query: &str, memories: &[Note]) -> String {
    let list = memories
        .iter()
        .filter_map(|note| match &note.content {
            NoteContent::Memory {
                user_prompt,
                agent_response,
            } => Some(format!(
                "ID: {}\nUser: {user_prompt}\nAgent: {agent_response}\n---",
                note.id
            )),
            NoteContent::Image { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("PAST CONVERSATIONS:\n{list}\n\nCURRENT USER QUERY: \"{query}\"\n\nMOST RELEVANT ID:")
}

/// Turn the retrieval model's reply into context text.
///
/// Anything other than the bare id of a memory note yields `None`.
pub fn resolve_memory_reply(reply: &str, memories: &[Note]) -> Option<String> {
    let id: u64 = reply.trim().parse().ok()?;
    memories.iter().find(|n| n.id == id).and_then(|note| match &note.content {
        NoteContent::Memory {
            user_prompt,
            agent_response,
        } => Some(format!(
            "User asked: \"{user_prompt}\"\nYou responded: \"{agent_response}\""
        )),
        NoteContent::Image { .. } => None,
    })
}

/// Header preceding the user's words in every composed prompt.
pub const USER_REQUEST_HEADER: &str = "CURRENT USER REQUEST:\n";

/// Prompt text sent to the model, with retrieved memory context first.
pub fn compose_prompt(memory_context: Option<&str>, prompt: &str) -> String {
    match memory_context {
        Some(context) => format!(
            "CONTEXT FROM PREVIOUS INTERACTION:\n{context}\n\n{USER_REQUEST_HEADER}{prompt}"
        ),
        None => format!("{USER_REQUEST_HEADER}{prompt}"),
    }
}

/// Persona and action contract for the chat session.
pub fn system_instruction(assistant_name: &str, user_name: Option<&str>) -> String {
    let user = match user_name {
        Some(name) if !name.trim().is_empty() => {
            format!("The user's name is {}. Address them by name now and then.", name.trim())
        }
        _ => "You have not learned the user's name yet.".to_owned(),
    };
    let tabs = Feature::ALL
        .iter()
        .map(|f| format!("'{}'", f.id()))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "You are {assistant_name}, a voice-first personal agent. Always refer to yourself as \
{assistant_name}, never as an AI or an assistant. Keep replies short and conversational, \
because they are spoken aloud. {user}

When the user asks you to do something, say in one sentence what you are about to do and \
append exactly one command tag in this format:
[ACTION: action_name, {{\"param\": \"value\"}}]

AVAILABLE ACTIONS:
1. {browse}: search the web and show results in the in-app browser.
   [ACTION: {browse}, {{\"search_query\": \"terms\"}}]
2. {navigate}: switch the visible panel, optionally running a follow-up prompt there.
   [ACTION: {navigate}, {{\"tab\": \"research\", \"followUpPrompt\": \"task\"}}]
   Valid tabs: {tabs}.
3. {image}: create an image, only when explicitly asked to create, generate or draw one.
   [ACTION: {image}, {{\"prompt\": \"detailed description\"}}]
4. {call}: open the phone dialer for a saved contact or a number.
   [ACTION: {call}, {{\"contact_name\": \"Sarah\"}}] or [ACTION: {call}, {{\"phone_number\": \"555-0100\"}}]
5. {contacts}: read out the saved contacts.
   [ACTION: {contacts}, {{}}]",
        browse = AgentAction::NAMES[0],
        navigate = AgentAction::NAMES[1],
        image = AgentAction::NAMES[2],
        call = AgentAction::NAMES[3],
        contacts = AgentAction::NAMES[4],
    )
}
