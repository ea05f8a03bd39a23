//! Speech input: wake-word listening, continuous listening and silence
//! auto-submit.
//!
//! Two recognizers are driven from one task:
//!
//! - the **wake listener** runs only while the controller is idle and no
//!   active session is running, and flips the manager into continuous mode
//!   when it hears the wake phrase;
//! - the **active listener** runs while continuous mode is on, accumulates
//!   interim text, and submits it after a quiet period.
//!
//! Every timer is a deadline owned by the task and is replaced or cleared
//! whenever a newer event supersedes it, so no stale timer fires against
//! outdated state. Neither recognizer is ever (re)started while the
//! controller is thinking or speaking.

use crate::config::ConversationConfig;
use crate::error::AssistantError;
use crate::state::AgentState;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Recognizer error codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    NoSpeech,
    Aborted,
    AudioCapture,
    Network,
    NotAllowed,
    ServiceNotAllowed,
    Other(String),
}

impl RecognitionErrorKind {
    pub fn from_code(code: &str) -> Self {
        match code {
            "no-speech" => Self::NoSpeech,
            "aborted" => Self::Aborted,
            "audio-capture" => Self::AudioCapture,
            "network" => Self::Network,
            "not-allowed" => Self::NotAllowed,
            "service-not-allowed" => Self::ServiceNotAllowed,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::NoSpeech => "no-speech",
            Self::Aborted => "aborted",
            Self::AudioCapture => "audio-capture",
            Self::Network => "network",
            Self::NotAllowed => "not-allowed",
            Self::ServiceNotAllowed => "service-not-allowed",
            Self::Other(code) => code,
        }
    }

    /// "No speech" is routine and never surfaced.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::NoSpeech)
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::NotAllowed | Self::ServiceNotAllowed)
    }
}

impl fmt::Display for RecognitionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Failure to start a recognizer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecognitionError {
    #[error("recognizer failed to start: {0}")]
    Start(String),
}

impl From<RecognitionError> for AssistantError {
    fn from(e: RecognitionError) -> Self {
        Self::Recognition(e.to_string())
    }
}

/// Speech recognition engine. Results arrive as [`RecognizerEvent`]s on a
/// channel supplied alongside the recognizer.
pub trait SpeechRecognizer: Send + Sync {
    fn start(&self) -> Result<(), RecognitionError>;
    fn stop(&self);
}

/// Events a recognizer reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    Started,
    /// `transcript` is the whole text recognized so far in this session.
    Result {
        transcript: String,
        is_final: bool,
    },
    Error(RecognitionErrorKind),
    Ended,
}

/// Requests from the turn controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputCommand {
    /// Turn continuous listening on or off.
    SetContinuous(bool),
}

/// What the manager reports to the turn controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// The active recognizer started (`true`) or ended (`false`).
    ListeningChanged(bool),
    /// Accumulated text for the prompt input.
    Interim(String),
    /// Text to submit after the silence timeout.
    Finalized(String),
    WakeWordDetected,
    ContinuousChanged(bool),
    /// User-visible, non-fatal recognition error.
    Error(String),
}

/// Receiving ends the manager consumes.
pub struct InputChannels {
    pub active_events: mpsc::UnboundedReceiver<RecognizerEvent>,
    pub wake_events: Option<mpsc::UnboundedReceiver<RecognizerEvent>>,
    pub commands: mpsc::UnboundedReceiver<InputCommand>,
}

pub struct SpeechInputManager {
    config: ConversationConfig,
    active: Arc<dyn SpeechRecognizer>,
    wake: Option<Arc<dyn SpeechRecognizer>>,
    state: watch::Receiver<AgentState>,
    events: mpsc::UnboundedSender<InputEvent>,

    continuous: bool,
    voice_disabled: bool,
    active_running: bool,
    wake_running: bool,
    /// Text carried over from a wake phrase or an ended session.
    prefix: String,
    /// Current active session transcript.
    transcript: String,

    silence_deadline: Option<Instant>,
    active_restart_at: Option<Instant>,
    wake_restart_at: Option<Instant>,
    wake_backoff: Duration,
}

impl SpeechInputManager {
    pub fn new(
        config: ConversationConfig,
        active: Arc<dyn SpeechRecognizer>,
        wake: Option<Arc<dyn SpeechRecognizer>>,
        state: watch::Receiver<AgentState>,
        events: mpsc::UnboundedSender<InputEvent>,
    ) -> Self {
        let wake_backoff = Duration::from_millis(config.wake_error_restart_ms);
        Self {
            config,
            active,
            wake,
            state,
            events,
            continuous: false,
            voice_disabled: false,
            active_running: false,
            wake_running: false,
            prefix: String::new(),
            transcript: String::new(),
            silence_deadline: None,
            active_restart_at: None,
            wake_restart_at: None,
            wake_backoff,
        }
    }

    /// Drive both recognizers until `cancel` fires or the command channel
    /// closes.
    pub async fn run(mut self, mut channels: InputChannels, cancel: CancellationToken) {
        let mut state_changes = self.state.clone();
        self.ensure_wake();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = channels.commands.recv() => match cmd {
                    Some(InputCommand::SetContinuous(on)) => self.set_continuous(on),
                    None => break,
                },
                Some(event) = channels.active_events.recv() => self.on_active_event(event),
                Some(event) = recv_opt(&mut channels.wake_events) => self.on_wake_event(event),
                changed = state_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_changes.borrow_and_update();
                    self.on_state(state);
                }
                _ = sleep_until_opt(self.silence_deadline) => self.on_silence(),
                _ = sleep_until_opt(self.active_restart_at) => {
                    self.active_restart_at = None;
                    self.maybe_start_active();
                }
                _ = sleep_until_opt(self.wake_restart_at) => {
                    self.wake_restart_at = None;
                    if self.wake_startable() {
                        self.start_wake();
                    }
                }
            }
        }

        if self.active_running {
            self.active.stop();
        }
        self.stop_wake();
        debug!("speech input manager stopped");
    }

    fn emit(&self, event: InputEvent) {
        if self.events.send(event).is_err() {
            debug!("input event receiver dropped");
        }
    }

    fn current_state(&self) -> AgentState {
        *self.state.borrow()
    }

    // ── commands & state ────────────────────────────────────────────

    fn set_continuous(&mut self, on: bool) {
        if on {
            if self.voice_disabled {
                self.emit(InputEvent::Error(
                    "Voice input is disabled because microphone access was denied.".to_owned(),
                ));
                return;
            }
            if self.continuous {
                return;
            }
            self.continuous = true;
            self.emit(InputEvent::ContinuousChanged(true));
            self.stop_wake();
            self.wake_restart_at = None;
            self.maybe_start_active();
        } else {
            if !self.continuous && !self.active_running {
                return;
            }
            self.continuous = false;
            self.clear_session();
            self.active_restart_at = None;
            if self.active_running {
                self.active.stop();
            }
            self.emit(InputEvent::ContinuousChanged(false));
            self.ensure_wake();
        }
    }

    fn on_state(&mut self, state: AgentState) {
        if state.is_busy() {
            // Never listen to the assistant's own voice.
            if self.active_running {
                self.active.stop();
            }
            if self.silence_deadline.is_some() {
                debug!("turn started elsewhere, dropping pending speech");
            }
            self.clear_session();
            self.active_restart_at = None;
            self.stop_wake();
            self.wake_restart_at = None;
        } else if state == AgentState::Idle {
            if self.continuous {
                self.schedule_active_restart();
            } else {
                self.ensure_wake();
            }
        }
    }

    // ── active listener ─────────────────────────────────────────────

    fn on_active_event(&mut self, event: RecognizerEvent) {
        match event {
            RecognizerEvent::Started => {
                self.active_running = true;
                self.emit(InputEvent::ListeningChanged(true));
            }
            RecognizerEvent::Result { transcript, .. } => {
                let mut text = transcript;
                if !self.continuous {
                    if !contains_wake_phrase(&text, &self.config.wake_phrase) {
                        return;
                    }
                    self.continuous = true;
                    self.emit(InputEvent::WakeWordDetected);
                    self.emit(InputEvent::ContinuousChanged(true));
                    text = strip_wake_phrase(&text, &self.config.wake_phrase);
                }
                self.transcript = text;
                self.emit(InputEvent::Interim(self.accumulated()));
                self.silence_deadline = Some(Instant::now() + self.config.silence_timeout());
            }
            RecognizerEvent::Error(kind) => self.on_recognition_error(kind),
            RecognizerEvent::Ended => {
                self.active_running = false;
                // Keep pending speech for the silence timer across sessions.
                if self.silence_deadline.is_some() {
                    self.prefix = self.accumulated();
                    self.transcript.clear();
                }
                self.emit(InputEvent::ListeningChanged(false));
                if self.continuous && !self.voice_disabled {
                    self.schedule_active_restart();
                } else if !self.continuous {
                    self.ensure_wake();
                }
            }
        }
    }

    fn on_silence(&mut self) {
        self.silence_deadline = None;
        let text = self.accumulated();
        self.clear_session();
        if text.is_empty() {
            return;
        }
        if self.active_running {
            self.active.stop();
        }
        info!("silence timeout, submitting {} chars", text.len());
        self.emit(InputEvent::Finalized(text));
    }

    fn on_recognition_error(&mut self, kind: RecognitionErrorKind) {
        if kind.is_permission_denied() {
            self.disable_voice(&kind);
            return;
        }
        if kind.is_benign() {
            return;
        }
        warn!("speech recognition error: {kind}");
        self.emit(InputEvent::Error(
            AssistantError::Recognition(kind.to_string()).to_string(),
        ));
    }

    fn maybe_start_active(&mut self) {
        if !self.continuous
            || self.active_running
            || self.voice_disabled
            || self.current_state().is_busy()
        {
            return;
        }
        match self.active.start() {
            Ok(()) => self.active_running = true,
            Err(e) => {
                warn!("{e}");
                self.emit(InputEvent::Error(AssistantError::from(e).to_string()));
            }
        }
    }

    fn schedule_active_restart(&mut self) {
        if self.active_running || self.active_restart_at.is_some() {
            return;
        }
        if self.current_state().is_busy() {
            return;
        }
        self.active_restart_at =
            Some(Instant::now() + Duration::from_millis(self.config.listener_restart_delay_ms));
    }

    fn accumulated(&self) -> String {
        let prefix = self.prefix.trim();
        let transcript = self.transcript.trim();
        match (prefix.is_empty(), transcript.is_empty()) {
            (false, false) => format!("{prefix} {transcript}"),
            (false, true) => prefix.to_owned(),
            _ => transcript.to_owned(),
        }
    }

    fn clear_session(&mut self) {
        self.silence_deadline = None;
        self.prefix.clear();
        self.transcript.clear();
    }

    // ── wake listener ───────────────────────────────────────────────

    fn on_wake_event(&mut self, event: RecognizerEvent) {
        match event {
            RecognizerEvent::Started => self.wake_running = true,
            RecognizerEvent::Result { transcript, .. } => {
                self.reset_wake_backoff();
                if self.continuous || self.active_running {
                    return;
                }
                if !contains_wake_phrase(&transcript, &self.config.wake_phrase) {
                    return;
                }
                info!("wake phrase detected");
                self.stop_wake();
                self.wake_restart_at = None;
                self.emit(InputEvent::WakeWordDetected);
                self.continuous = true;
                self.emit(InputEvent::ContinuousChanged(true));

                let remainder = strip_wake_phrase(&transcript, &self.config.wake_phrase);
                if !remainder.is_empty() {
                    self.prefix = remainder;
                    self.emit(InputEvent::Interim(self.accumulated()));
                    self.silence_deadline =
                        Some(Instant::now() + self.config.silence_timeout());
                }
                self.maybe_start_active();
            }
            RecognizerEvent::Error(kind) => {
                self.wake_running = false;
                if kind.is_permission_denied() {
                    self.disable_voice(&kind);
                    return;
                }
                if kind.is_benign() {
                    return;
                }
                warn!("wake word listener error: {kind}");
                self.schedule_wake_retry();
            }
            RecognizerEvent::Ended => {
                self.wake_running = false;
                if self.wake_restart_at.is_none() && self.wake_startable() {
                    self.wake_restart_at = Some(
                        Instant::now() + Duration::from_millis(self.config.wake_end_restart_ms),
                    );
                }
            }
        }
    }

    fn wake_startable(&self) -> bool {
        self.config.wake_word_enabled
            && self.wake.is_some()
            && !self.continuous
            && !self.active_running
            && !self.wake_running
            && !self.voice_disabled
            && self.current_state() == AgentState::Idle
    }

    fn ensure_wake(&mut self) {
        if self.wake_restart_at.is_none() && self.wake_startable() {
            self.start_wake();
        }
    }

    fn start_wake(&mut self) {
        let Some(wake) = &self.wake else {
            return;
        };
        match wake.start() {
            Ok(()) => self.wake_running = true,
            Err(e) => {
                warn!("wake word listener: {e}");
                self.schedule_wake_retry();
            }
        }
    }

    fn stop_wake(&mut self) {
        if self.wake_running
            && let Some(wake) = &self.wake
        {
            wake.stop();
        }
        self.wake_running = false;
    }

    /// Retry after the current backoff, then double it up to the cap.
    fn schedule_wake_retry(&mut self) {
        self.wake_restart_at = Some(Instant::now() + self.wake_backoff);
        let cap = Duration::from_millis(self.config.max_restart_backoff_ms);
        self.wake_backoff = (self.wake_backoff * 2).min(cap);
    }

    fn reset_wake_backoff(&mut self) {
        self.wake_backoff = Duration::from_millis(self.config.wake_error_restart_ms);
    }

    fn disable_voice(&mut self, kind: &RecognitionErrorKind) {
        warn!("microphone permission denied ({kind}); voice input disabled");
        self.voice_disabled = true;
        self.clear_session();
        self.active_restart_at = None;
        self.wake_restart_at = None;
        if self.active_running {
            self.active.stop();
            self.active_running = false;
        }
        self.stop_wake();
        if self.continuous {
            self.continuous = false;
            self.emit(InputEvent::ContinuousChanged(false));
        }
        self.emit(InputEvent::Error(
            AssistantError::Recognition(kind.to_string()).to_string(),
        ));
    }
}

/// Case-insensitive wake phrase check.
pub fn contains_wake_phrase(transcript: &str, phrase: &str) -> bool {
    !phrase.is_empty()
        && transcript
            .to_ascii_lowercase()
            .contains(&phrase.to_ascii_lowercase())
}

/// Remove every case-insensitive occurrence of the wake phrase and collapse
/// the whitespace left behind.
pub fn strip_wake_phrase(transcript: &str, phrase: &str) -> String {
    if phrase.is_empty() {
        return transcript.trim().to_owned();
    }
    let lower = transcript.to_ascii_lowercase();
    let needle = phrase.to_ascii_lowercase();
    let mut out = String::with_capacity(transcript.len());
    let mut copied = 0;
    for (pos, _) in lower.match_indices(&needle) {
        out.push_str(&transcript[copied..pos]);
        copied = pos + needle.len();
    }
    out.push_str(&transcript[copied..]);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
