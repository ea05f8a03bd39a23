//! Configuration types for the assistant core.

use crate::error::{AssistantError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted when `model.api_key` is unset.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Top-level configuration for the assistant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Persona and onboarding state.
    pub assistant: AssistantIdentity,
    /// Wake word, listening timers and busy policy.
    pub conversation: ConversationConfig,
    /// Submission rate limiting.
    pub rate_limit: RateLimitConfig,
    /// Input sanitization limits.
    pub input: InputConfig,
    /// Voice output settings.
    pub speech: SpeechOutputConfig,
    /// Transcript log settings.
    pub transcript: TranscriptConfig,
    /// Memory-note batching.
    pub memory: MemoryConfig,
    /// Hosted model service settings.
    pub model: ModelConfig,
    /// Agent action settings.
    pub actions: ActionsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantIdentity {
    /// Name the assistant answers to and speaks as.
    pub name: String,
    /// How the assistant addresses the user, once known.
    pub user_name: Option<String>,
    /// Submissions are rejected until this is set.
    pub onboarding_complete: bool,
}

impl Default for AssistantIdentity {
    fn default() -> Self {
        Self {
            name: "Agent Lee".to_owned(),
            user_name: None,
            onboarding_complete: false,
        }
    }
}

/// What happens to a submission that arrives while a turn is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Hold it and start it once the controller is idle again.
    #[default]
    Queue,
    /// Reject it with a busy error.
    Reject,
}

/// Drop behaviour when the pending-submission queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingDropPolicy {
    /// Drop the oldest queued submission to keep the newest input.
    #[default]
    Oldest,
    /// Replace the newest queued submission with the incoming one.
    Newest,
    /// Keep the queue as is and drop the incoming submission.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Phrase that wakes the assistant (case-insensitive).
    pub wake_phrase: String,
    /// Run the wake-word listener while idle.
    pub wake_word_enabled: bool,
    /// Quiet period after the last speech event before the accumulated
    /// transcript is submitted.
    pub silence_timeout_ms: u64,
    /// Pause before restarting the active listener after it ends.
    pub listener_restart_delay_ms: u64,
    /// Initial wake listener restart delay after an error.
    pub wake_error_restart_ms: u64,
    /// Wake listener restart delay after a normal end.
    pub wake_end_restart_ms: u64,
    /// Upper bound for the doubling wake restart backoff.
    pub max_restart_backoff_ms: u64,
    pub busy_policy: BusyPolicy,
    /// Maximum queued submissions under [`BusyPolicy::Queue`].
    pub max_pending: usize,
    pub pending_drop_policy: PendingDropPolicy,
    /// Discard queued submissions when the user interrupts.
    pub clear_pending_on_interrupt: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            wake_phrase: "agent lee".to_owned(),
            wake_word_enabled: true,
            silence_timeout_ms: 4_000,
            listener_restart_delay_ms: 500,
            wake_error_restart_ms: 1_000,
            wake_end_restart_ms: 500,
            max_restart_backoff_ms: 8_000,
            busy_policy: BusyPolicy::Queue,
            max_pending: 1,
            pending_drop_policy: PendingDropPolicy::Oldest,
            clear_pending_on_interrupt: true,
        }
    }
}

impl ConversationConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Maximum prompt length in characters.
    pub max_length: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self { max_length: 5_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechOutputConfig {
    /// Saved voice; resolved through the fallback chain when unset or gone.
    pub voice_uri: Option<String>,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
    /// 0.0 disables per-utterance rate/pitch jitter.
    pub naturalness: f32,
    /// Maximum characters per utterance.
    pub max_chunk_chars: usize,
    /// Interval of the near-silent keep-alive utterance. 0 disables it.
    pub keep_alive_interval_ms: u64,
    /// An utterance still playing after this long is abandoned. 0 waits forever.
    pub utterance_timeout_ms: u64,
    /// Voice names tried, in order, before the generic fallbacks.
    pub preferred_voices: Vec<String>,
}

impl Default for SpeechOutputConfig {
    fn default() -> Self {
        Self {
            voice_uri: None,
            rate: 1.0,
            pitch: 1.3,
            volume: 0.8,
            naturalness: 0.5,
            max_chunk_chars: 180,
            keep_alive_interval_ms: 14_000,
            utterance_timeout_ms: 60_000,
            preferred_voices: vec![
                "Microsoft Christopher Online (Natural) - English (United States)".to_owned(),
                "Google UK English Male".to_owned(),
                "Microsoft George - English (United Kingdom)".to_owned(),
                "Microsoft David - English (United States)".to_owned(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptConfig {
    /// Oldest entries are evicted beyond this many.
    pub max_entries: usize,
    /// JSON file the transcript is loaded from and saved to.
    pub persist_path: Option<PathBuf>,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            max_entries: 200,
            persist_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    /// Completed turns per memory note.
    pub batch_turns: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_turns: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// API key; falls back to [`API_KEY_ENV`] when unset.
    pub api_key: Option<String>,
    pub base_url: String,
    /// Chat/streaming model id.
    pub model: String,
    /// Image generation model id.
    pub image_model: String,
    pub request_timeout_secs: u64,
    /// Longest wait for the next chunk of a streamed reply.
    pub stream_idle_timeout_secs: u64,
    /// Minimum spacing between image generation calls.
    pub image_min_interval_secs: u64,
    /// Ask the model whether a prompt needs the camera feed.
    pub classify_visual: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://generativelanguage.googleapis.com".to_owned(),
            model: "gemini-2.5-flash".to_owned(),
            image_model: "imagen-4.0-generate-001".to_owned(),
            request_timeout_secs: 60,
            stream_idle_timeout_secs: 30,
            image_min_interval_secs: 20,
            classify_visual: true,
        }
    }
}

impl ModelConfig {
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    /// The configured key, or the environment fallback.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    /// Prefix the URL-encoded query is appended to for `browse_web`.
    pub search_url: String,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            search_url: "https://lite.duckduckgo.com/lite/?q=".to_owned(),
        }
    }
}

impl AssistantConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| AssistantError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AssistantError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/agent-lee/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("agent-lee").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("agent-lee")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/agent-lee-config/config.toml")
        }
    }

    /// Reject settings that would stall the controller.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.rate_limit.max_requests == 0, "rate_limit.max_requests must be > 0"),
            (self.rate_limit.window_secs == 0, "rate_limit.window_secs must be > 0"),
            (self.speech.max_chunk_chars == 0, "speech.max_chunk_chars must be > 0"),
            (
                self.conversation.silence_timeout_ms == 0,
                "conversation.silence_timeout_ms must be > 0",
            ),
            (
                self.model.stream_idle_timeout_secs == 0,
                "model.stream_idle_timeout_secs must be > 0",
            ),
            (self.input.max_length == 0, "input.max_length must be > 0"),
            (self.transcript.max_entries == 0, "transcript.max_entries must be > 0"),
            (
                self.assistant.name.trim().is_empty(),
                "assistant.name must not be empty",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(AssistantError::Config((*msg).to_owned())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AssistantConfig::default();
        assert_eq!(config.assistant.name, "Agent Lee");
        assert!(!config.assistant.onboarding_complete);
        assert_eq!(config.conversation.silence_timeout(), Duration::from_secs(4));
        assert_eq!(config.conversation.busy_policy, BusyPolicy::Queue);
        assert_eq!(config.rate_limit.max_requests, 30);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.speech.max_chunk_chars, 180);
        assert!((config.speech.pitch - 1.3).abs() < f32::EPSILON);
        assert_eq!(config.speech.preferred_voices.len(), 4);
        assert_eq!(config.transcript.max_entries, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[rate_limit]\nmax_requests = 2\nwindow_secs = 10\n\n[conversation]\nbusy_policy = \"reject\"\n",
        )
        .unwrap();

        let config = AssistantConfig::from_file(&path).unwrap();
        assert_eq!(config.rate_limit.max_requests, 2);
        assert_eq!(config.rate_limit.window_secs, 10);
        assert_eq!(config.conversation.busy_policy, BusyPolicy::Reject);
        assert_eq!(config.conversation.wake_phrase, "agent lee");
        assert_eq!(config.input.max_length, 5_000);
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();
        assert!(matches!(
            AssistantConfig::from_file(&path),
            Err(AssistantError::Config(_))
        ));
    }

    #[test]
    fn from_file_nonexistent_returns_io_error() {
        let result = AssistantConfig::from_file(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(AssistantError::Io(_))));
    }

    #[test]
    fn validate_rejects_zero_window() {
        let mut config = AssistantConfig::default();
        config.rate_limit.window_secs = 0;
        assert!(matches!(config.validate(), Err(AssistantError::Config(_))));
    }

    #[test]
    fn stream_and_utterance_bounds_have_defaults() {
        let mut config = AssistantConfig::default();
        assert_eq!(config.model.stream_idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.speech.utterance_timeout_ms, 60_000);

        config.model.stream_idle_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("model.stream_idle_timeout_secs"));
    }

    #[test]
    fn configured_api_key_wins() {
        let model = ModelConfig {
            api_key: Some("from-file".into()),
            ..ModelConfig::default()
        };
        assert_eq!(model.resolved_api_key().as_deref(), Some("from-file"));
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = AssistantConfig::default_config_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.ends_with("config.toml"));
        assert!(path_str.contains("agent-lee"));
    }
}
