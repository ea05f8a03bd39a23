//! Error types for the voice assistant core.

/// Top-level error type for the assistant core.
///
/// The first group of variants are input rejections: they are raised before
/// anything reaches the model service and their `Display` text is the message
/// shown to the user.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    /// Submission was empty after trimming.
    #[error("Please enter a prompt before submitting.")]
    EmptyPrompt,

    /// Submissions are blocked until onboarding has completed.
    #[error("Please finish onboarding before submitting.")]
    OnboardingIncomplete,

    /// The per-session rate limiter refused the submission.
    #[error("Rate limit exceeded. Please wait before submitting again.")]
    RateLimited {
        /// Seconds until the oldest request leaves the window.
        retry_after_secs: u64,
    },

    /// Input failed sanitization.
    #[error("Input validation failed: {0}")]
    InvalidInput(String),

    /// Input looked like an attempt to override the system prompt.
    #[error("Prompt injection detected. Please rephrase your request.")]
    PromptInjection,

    /// A turn is in flight and the busy policy rejects new submissions.
    #[error("Agent is busy. Please wait for the current response to finish.")]
    Busy,

    /// Model service failure (network, HTTP status, malformed response).
    #[error("model error: {0}")]
    Model(String),

    /// Model service quota or rate limit was hit.
    #[error("API quota exceeded. Please check your plan and billing details, or try again later.")]
    QuotaExceeded,

    /// Speech recognition error other than "no speech".
    #[error("Speech Recognition Error: {0}")]
    Recognition(String),

    /// Speech synthesis error other than a user-initiated cancel.
    #[error("speech synthesis error: {0}")]
    Synthesis(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl AssistantError {
    /// Whether this error rejected a submission locally, before any model call.
    pub fn is_input_rejection(&self) -> bool {
        matches!(
            self,
            Self::EmptyPrompt
                | Self::OnboardingIncomplete
                | Self::RateLimited { .. }
                | Self::InvalidInput(_)
                | Self::PromptInjection
                | Self::Busy
        )
    }
}

impl From<crate::rate_limit::RateLimitError> for AssistantError {
    fn from(e: crate::rate_limit::RateLimitError) -> Self {
        match e {
            crate::rate_limit::RateLimitError::Exceeded { retry_after_secs } => {
                Self::RateLimited { retry_after_secs }
            }
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AssistantError>;
