//! Voice input and output.

pub mod chunk;
pub mod input;
pub mod output;
pub mod text;
pub mod voice;

pub use chunk::chunk_text;
pub use input::{
    InputChannels, InputCommand, InputEvent, RecognitionError, RecognitionErrorKind,
    RecognizerEvent, SpeechInputManager, SpeechRecognizer,
};
pub use output::{
    SpeakOutcome, SpeechOutputManager, SpeechSynthesizer, SynthesisError, Utterance,
};
pub use text::finalize_spoken_output;
pub use voice::{
    InMemoryVoicePreference, TomlVoicePreference, Voice, VoicePreferenceStore, select_voice,
};
