//! Messages exchanged between the controller handle and the turn controller.

use crate::config::{ConversationConfig, PendingDropPolicy};
use crate::error::Result;
use crate::state::{AgentState, Feature};
use crate::transcript::TranscriptEntry;
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// How an accepted submission was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The turn starts now.
    Started,
    /// A turn is in flight; this one runs after it.
    Queued,
}

/// Requests sent to the turn controller.
#[derive(Debug)]
pub enum ControlCommand {
    /// Submit a prompt typed or spoken by the user.
    Submit {
        text: String,
        reply: oneshot::Sender<Result<SubmitOutcome>>,
    },
    /// Stop the current turn. While speaking, the reply is captured for resume.
    Interrupt,
    /// Flip continuous listening. While speaking this also interrupts.
    ToggleMicrophone,
    SetListening(bool),
    /// Re-speak the captured interrupted reply. Replies `false` when there
    /// is nothing to resume or a turn is in flight.
    ResumeInterrupted { reply: oneshot::Sender<bool> },
    DismissInterrupted,
    /// Replace the prompt input text without submitting it.
    SetPromptInput(String),
    CompleteOnboarding {
        user_name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// The camera became available; a parked visual prompt resumes.
    CameraEnabled,
    Snapshot { reply: oneshot::Sender<Snapshot> },
    Shutdown,
}

/// Point-in-time view of the controller, for UIs and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: AgentState,
    pub active_feature: Feature,
    pub continuous: bool,
    pub prompt_input: String,
    pub auto_submit: bool,
    pub pending: usize,
    pub interrupted: Option<TranscriptEntry>,
    pub transcript: Vec<TranscriptEntry>,
    pub onboarding_complete: bool,
    pub user_name: Option<String>,
    /// Completed turns waiting to be saved as a memory note.
    pub memory_batch: usize,
    pub parked_visual_prompt: Option<String>,
}

/// Result of offering a submission to a [`PendingQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueAction {
    Enqueued,
    /// The queue was full; this queued prompt was discarded.
    DroppedOldest(String),
    /// The queue was full; this queued prompt was replaced.
    DroppedNewest(String),
    /// The queue was full and kept; the incoming prompt was discarded.
    DroppedIncoming,
}

/// Bounded queue for submissions received while a turn is in flight.
#[derive(Debug)]
pub struct PendingQueue {
    max_pending: usize,
    drop_policy: PendingDropPolicy,
    pending: VecDeque<String>,
}

impl PendingQueue {
    pub fn new(max_pending: usize, drop_policy: PendingDropPolicy) -> Self {
        Self {
            max_pending,
            drop_policy,
            pending: VecDeque::new(),
        }
    }

    pub fn from_config(config: &ConversationConfig) -> Self {
        Self::new(config.max_pending, config.pending_drop_policy)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything queued; returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let cleared = self.pending.len();
        self.pending.clear();
        cleared
    }

    pub fn enqueue(&mut self, text: String) -> EnqueueAction {
        if text.trim().is_empty() || self.max_pending == 0 {
            return EnqueueAction::DroppedIncoming;
        }

        if self.pending.len() < self.max_pending {
            self.pending.push_back(text);
            return EnqueueAction::Enqueued;
        }

        match self.drop_policy {
            PendingDropPolicy::Oldest => {
                let dropped = self.pending.pop_front().unwrap_or_default();
                self.pending.push_back(text);
                EnqueueAction::DroppedOldest(dropped)
            }
            PendingDropPolicy::Newest => {
                let dropped = self.pending.pop_back().unwrap_or_default();
                self.pending.push_back(text);
                EnqueueAction::DroppedNewest(dropped)
            }
            PendingDropPolicy::None => EnqueueAction::DroppedIncoming,
        }
    }

    pub fn dequeue(&mut self) -> Option<String> {
        self.pending.pop_front()
    }
}
