//! Sequential, cancelable playback of cleaned text through a speech engine.
//!
//! One call to [`SpeechOutputManager::speak`] is one session: the text is
//! cleaned, chunked, and each chunk is spoken only after the previous one
//! finishes. Engine errors and utterances that outlive
//! `utterance_timeout_ms` end the session as completed so the turn
//! controller never waits on a wedged engine; only [`SpeechOutputManager::cancel`]
//! yields [`SpeakOutcome::Cancelled`].

use super::chunk::chunk_text;
use super::text::finalize_spoken_output;
use super::voice::{Voice, VoicePreferenceStore, select_voice};
use crate::config::SpeechOutputConfig;
use crate::error::AssistantError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Engine-accepted rate bounds.
const RATE_RANGE: (f32, f32) = (0.5, 2.0);
/// Engine-accepted pitch bounds.
const PITCH_RANGE: (f32, f32) = (0.0, 2.0);

/// One utterance handed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub voice_uri: Option<String>,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Utterance {
    /// The near-silent utterance used to keep the engine awake.
    pub fn keep_alive() -> Self {
        Self {
            text: String::new(),
            voice_uri: None,
            rate: 1.0,
            pitch: 1.0,
            volume: 0.0,
        }
    }
}

/// Why an utterance did not play to the end.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SynthesisError {
    #[error("interrupted")]
    Interrupted,
    #[error("canceled")]
    Canceled,
    #[error("{0}")]
    Engine(String),
}

impl SynthesisError {
    /// Interruptions and cancels are normal stops, not failures.
    pub fn is_normal_stop(&self) -> bool {
        matches!(self, Self::Interrupted | Self::Canceled)
    }
}

impl From<SynthesisError> for AssistantError {
    fn from(e: SynthesisError) -> Self {
        Self::Synthesis(e.to_string())
    }
}

/// Speech synthesis engine.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Voices the engine offers.
    async fn voices(&self) -> Vec<Voice>;

    /// Speak one utterance, resolving when it ends.
    async fn speak(&self, utterance: Utterance) -> Result<(), SynthesisError>;

    /// Stop the current utterance and drop anything queued.
    fn cancel(&self);

    fn is_speaking(&self) -> bool;
}

/// How a speak session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// Every chunk played, or the engine stopped on its own.
    Completed,
    /// [`SpeechOutputManager::cancel`] was called.
    Cancelled,
}

/// Apply naturalness jitter to the base rate and pitch.
///
/// `r_rate` and `r_pitch` are uniform samples in `[0, 1)`. Rate varies by up
/// to ±0.1 × naturalness and pitch by up to ±0.2 × naturalness; both are
/// clamped to the engine's accepted range.
pub fn jittered_prosody(
    base_rate: f32,
    base_pitch: f32,
    naturalness: f32,
    r_rate: f32,
    r_pitch: f32,
) -> (f32, f32) {
    if naturalness <= 0.0 {
        return (base_rate, base_pitch);
    }
    let rate = base_rate + (r_rate - 0.5) * 0.2 * naturalness;
    let pitch = base_pitch + (r_pitch - 0.5) * 0.4 * naturalness;
    (
        rate.clamp(RATE_RANGE.0, RATE_RANGE.1),
        pitch.clamp(PITCH_RANGE.0, PITCH_RANGE.1),
    )
}

struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
}

/// Owns every speak session and the keep-alive heartbeat.
pub struct SpeechOutputManager {
    synth: Arc<dyn SpeechSynthesizer>,
    preferences: Arc<dyn VoicePreferenceStore>,
    config: SpeechOutputConfig,
    assistant_name: String,
    voice_uri: OnceCell<Option<String>>,
    session: Mutex<Option<ActiveSession>>,
    next_session: AtomicU64,
}

impl SpeechOutputManager {
    pub fn new(
        synth: Arc<dyn SpeechSynthesizer>,
        preferences: Arc<dyn VoicePreferenceStore>,
        config: SpeechOutputConfig,
        assistant_name: impl Into<String>,
    ) -> Self {
        Self {
            synth,
            preferences,
            config,
            assistant_name: assistant_name.into(),
            voice_uri: OnceCell::new(),
            session: Mutex::new(None),
            next_session: AtomicU64::new(1),
        }
    }

    /// Clean, chunk and speak `text`, resolving when the session ends.
    pub async fn speak(&self, text: &str) -> SpeakOutcome {
        let cleaned = finalize_spoken_output(text, &self.assistant_name);
        if cleaned.is_empty() {
            return SpeakOutcome::Completed;
        }
        let chunks = chunk_text(&cleaned, self.config.max_chunk_chars);
        let voice_uri = self.resolve_voice().await;

        if self.synth.is_speaking() {
            self.synth.cancel();
        }
        let (id, token) = self.begin_session();
        debug!(session = id, chunks = chunks.len(), "speak session started");

        let outcome = self.play(chunks, voice_uri, &token).await;
        self.end_session(id);
        debug!(session = id, ?outcome, "speak session ended");
        outcome
    }

    async fn play(
        &self,
        chunks: Vec<String>,
        voice_uri: Option<String>,
        token: &CancellationToken,
    ) -> SpeakOutcome {
        for chunk in chunks {
            if token.is_cancelled() {
                return SpeakOutcome::Cancelled;
            }
            let utterance = self.utterance(chunk, voice_uri.clone());
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return SpeakOutcome::Cancelled,
                result = self.speak_bounded(utterance) => result,
            };
            match result {
                Ok(()) => {}
                Err(_) if token.is_cancelled() => return SpeakOutcome::Cancelled,
                Err(e) if e.is_normal_stop() => {
                    debug!("utterance stopped by engine: {e}");
                    return SpeakOutcome::Completed;
                }
                Err(e) => {
                    warn!("speech synthesis error: {e}");
                    return SpeakOutcome::Completed;
                }
            }
        }
        SpeakOutcome::Completed
    }

    /// Speak one utterance, abandoning it after `utterance_timeout_ms`.
    async fn speak_bounded(&self, utterance: Utterance) -> Result<(), SynthesisError> {
        if self.config.utterance_timeout_ms == 0 {
            return self.synth.speak(utterance).await;
        }
        let limit = Duration::from_millis(self.config.utterance_timeout_ms);
        match tokio::time::timeout(limit, self.synth.speak(utterance)).await {
            Ok(result) => result,
            Err(_) => {
                self.synth.cancel();
                Err(SynthesisError::Engine(format!(
                    "utterance did not finish within {}ms",
                    limit.as_millis()
                )))
            }
        }
    }

    fn utterance(&self, text: String, voice_uri: Option<String>) -> Utterance {
        let (rate, pitch) = jittered_prosody(
            self.config.rate,
            self.config.pitch,
            self.config.naturalness,
            rand::random::<f32>(),
            rand::random::<f32>(),
        );
        Utterance {
            text,
            voice_uri,
            rate,
            pitch,
            volume: self.config.volume,
        }
    }

    /// Stop the active session immediately. The manager is ready for the
    /// next `speak` as soon as this returns.
    pub fn cancel(&self) {
        if let Some(session) = self.lock_session().take() {
            session.cancel.cancel();
        }
        self.synth.cancel();
    }

    /// Whether a speak session is in progress.
    pub fn is_active(&self) -> bool {
        self.lock_session().is_some()
    }

    fn begin_session(&self) -> (u64, CancellationToken) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = self.lock_session().replace(ActiveSession {
            id,
            cancel: token.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        (id, token)
    }

    fn end_session(&self, id: u64) {
        let mut slot = self.lock_session();
        if slot.as_ref().is_some_and(|s| s.id == id) {
            *slot = None;
        }
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<ActiveSession>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Resolve the voice once and remember it.
    async fn resolve_voice(&self) -> Option<String> {
        self.voice_uri
            .get_or_init(|| async {
                let voices = self.synth.voices().await;
                let saved = self.config.voice_uri.clone().or_else(|| self.preferences.load());
                let chosen = select_voice(&voices, saved.as_deref(), &self.config.preferred_voices)?;
                info!(voice = %chosen.name, "selected speech voice");
                if saved.as_deref() != Some(chosen.uri.as_str())
                    && let Err(e) = self.preferences.save(&chosen.uri)
                {
                    warn!("failed to persist voice preference: {e}");
                }
                Some(chosen.uri.clone())
            })
            .await
            .clone()
    }

    /// Start the keep-alive heartbeat.
    ///
    /// Every interval, a near-silent utterance is spoken if the engine is not
    /// speaking and no session is active. Returns `None` when the interval is
    /// configured as zero.
    pub fn spawn_keep_alive(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self.config.keep_alive_interval_ms == 0 {
            return None;
        }
        let period = Duration::from_millis(self.config.keep_alive_interval_ms);
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if manager.synth.is_speaking() || manager.is_active() {
                            continue;
                        }
                        if let Err(e) = manager.synth.speak(Utterance::keep_alive()).await {
                            debug!("keep-alive utterance failed: {e}");
                        }
                    }
                }
            }
        }))
    }
}
