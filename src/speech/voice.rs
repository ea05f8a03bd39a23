//! Voice descriptors, the default-voice fallback chain, and persistence of
//! the chosen voice.

use crate::config::AssistantConfig;
use crate::error::{AssistantError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;

/// A voice offered by the synthesis engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    pub name: String,
    /// Engine-unique identifier, used for persistence.
    pub uri: String,
    /// BCP-47 language tag, e.g. `en-US`.
    pub lang: String,
    /// Whether the engine marks this as its default voice.
    #[serde(default)]
    pub is_default: bool,
}

impl Voice {
    fn is_english(&self) -> bool {
        self.lang.starts_with("en")
    }
}

/// Engine voice that is male on common mobile engines despite its name.
const ENGINE_MALE_FALLBACK: &str = "Google US English";

/// Pick the voice to speak with.
///
/// Order: the saved voice if still offered, then the first available
/// preferred name, then any English voice whose name mentions "male", then
/// [`ENGINE_MALE_FALLBACK`], then the engine's default English voice, then
/// any `en-US` voice, then any English voice, then the first voice.
pub fn select_voice<'a>(
    voices: &'a [Voice],
    saved_uri: Option<&str>,
    preferred: &[String],
) -> Option<&'a Voice> {
    if let Some(uri) = saved_uri
        && let Some(saved) = voices.iter().find(|v| v.uri == uri)
    {
        return Some(saved);
    }

    preferred
        .iter()
        .find_map(|name| voices.iter().find(|v| &v.name == name))
        .or_else(|| {
            voices
                .iter()
                .find(|v| v.is_english() && v.name.to_lowercase().contains("male"))
        })
        .or_else(|| voices.iter().find(|v| v.name == ENGINE_MALE_FALLBACK))
        .or_else(|| voices.iter().find(|v| v.is_default && v.is_english()))
        .or_else(|| voices.iter().find(|v| v.lang.starts_with("en-US")))
        .or_else(|| voices.iter().find(|v| v.is_english()))
        .or_else(|| voices.first())
}

/// Where the chosen voice is remembered between sessions.
pub trait VoicePreferenceStore: Send + Sync {
    fn load(&self) -> Option<String>;
    fn save(&self, uri: &str) -> Result<()>;
}

/// Preference held in memory only.
#[derive(Debug, Default)]
pub struct InMemoryVoicePreference {
    uri: Mutex<Option<String>>,
}

impl InMemoryVoicePreference {
    pub fn new(uri: Option<String>) -> Self {
        Self {
            uri: Mutex::new(uri),
        }
    }
}

impl VoicePreferenceStore for InMemoryVoicePreference {
    fn load(&self) -> Option<String> {
        self.uri.lock().ok().and_then(|guard| guard.clone())
    }

    fn save(&self, uri: &str) -> Result<()> {
        if let Ok(mut guard) = self.uri.lock() {
            *guard = Some(uri.to_owned());
        }
        Ok(())
    }
}

/// Preference stored as `speech.voice_uri` in the TOML config file.
///
/// Saving edits the file in place with `toml_edit`, so comments and every
/// other setting are preserved.
#[derive(Debug, Clone)]
pub struct TomlVoicePreference {
    path: PathBuf,
}

impl TomlVoicePreference {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl VoicePreferenceStore for TomlVoicePreference {
    fn load(&self) -> Option<String> {
        if !self.path.exists() {
            return None;
        }
        AssistantConfig::from_file(&self.path)
            .ok()
            .and_then(|c| c.speech.voice_uri)
    }

    fn save(&self, uri: &str) -> Result<()> {
        let contents = if self.path.exists() {
            std::fs::read_to_string(&self.path)?
        } else {
            String::new()
        };
        let mut doc: toml_edit::DocumentMut = contents.parse().map_err(|e| {
            AssistantError::Config(format!(
                "failed to parse config file '{}': {e}",
                self.path.display()
            ))
        })?;

        match doc.get("speech").map(toml_edit::Item::is_table_like) {
            None => {
                doc["speech"] = toml_edit::table();
            }
            Some(true) => {}
            Some(false) => {
                return Err(AssistantError::Config(
                    "config key 'speech' is not a table".to_owned(),
                ));
            }
        }
        doc["speech"]["voice_uri"] = toml_edit::value(uri);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, doc.to_string())?;
        info!("saved voice preference {uri} to {}", self.path.display());
        Ok(())
    }
}
