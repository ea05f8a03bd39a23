//! Runtime events emitted by the turn controller for the UI layer.
//!
//! Every UI hook the controller drives is one variant here, published on a
//! broadcast channel. Payloads stay small; images travel as data URLs only
//! once per generation.

use crate::state::{AgentState, Feature};
use crate::transcript::TranscriptEntry;

/// What the assistant is doing and what the UI should show.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// The shared agent state changed.
    StateChanged(AgentState),
    /// A new transcript entry.
    TranscriptAppended(TranscriptEntry),
    /// Streamed text appended to the agent entry `id`.
    TranscriptStreamed { id: u64, chunk: String },
    /// An existing entry was rewritten (e.g. tags stripped after streaming).
    TranscriptUpdated(TranscriptEntry),
    /// The log was emptied after a memory batch was saved.
    TranscriptCleared,
    /// Switch the visible panel.
    FeatureChanged(Feature),
    /// Set the prompt input; `auto_submit` marks a follow-up prompt.
    PromptInput { text: String, auto_submit: bool },
    /// User-visible error message.
    Error { message: String },
    /// Open the in-app browser.
    BrowserOpened { url: String },
    /// An image finished generating.
    ImageGenerated { prompt: String, data_url: String },
    /// Hand a number to the native dialer.
    DialRequested { number: String },
    /// A reply mirrored into the active panel's result view.
    ResultRouted { feature: Feature, text: String },
    /// Speech was interrupted; the reply can be resumed.
    InterruptedCaptured(TranscriptEntry),
    /// The interrupted reply was resumed or dismissed.
    InterruptedCleared,
    /// Continuous listening was turned on or off.
    ListeningChanged { continuous: bool },
    /// A submission is waiting for the current turn to finish.
    SubmissionQueued { text: String, pending: usize },
    /// A queued submission was discarded.
    SubmissionDropped { text: String },
    /// Sensitive-looking content in a reply.
    OutputWarnings(Vec<String>),
}
