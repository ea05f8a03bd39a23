//! Agent actions embedded in model replies.
//!
//! The model requests UI side effects by embedding tags in its reply:
//!
//! | Tag | Effect |
//! |-----|--------|
//! | `[ACTION: browse_web, {"search_query": "..."}]` | open search results in the in-app browser |
//! | `[ACTION: navigate, {"tab": "image", "followUpPrompt": "..."}]` | switch panel, optionally auto-submit a prompt |
//! | `[ACTION: generate_image, {"prompt": "..."}]` | start image generation |
//! | `[ACTION: initiate_call, {"contact_name": "..."}]` | resolve a contact and hand off to the dialer |
//! | `[ACTION: initiate_call, {"phone_number": "..."}]` | hand a raw number to the dialer |
//! | `[ACTION: list_contacts, {}]` | read the saved contacts aloud |
//!
//! [`parser`] extracts and strips the tags; [`executor`] turns each action
//! into an ordered list of effects that the turn controller applies once
//! the spoken reply has finished.

pub mod executor;
pub mod parser;

pub use executor::{ActionExecutor, Effect};
pub use parser::{ParsedResponse, RawAction, extract_action_tags, parse_agent_actions};

use serde::Deserialize;

/// A recognized agent action with validated parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentAction {
    BrowseWeb {
        search_query: String,
    },
    /// `tab` is checked against the feature panels at execution time.
    Navigate {
        tab: String,
        follow_up_prompt: Option<String>,
    },
    GenerateImage {
        prompt: String,
    },
    InitiateCall {
        contact_name: Option<String>,
        phone_number: Option<String>,
    },
    ListContacts,
}

/// Why a raw tag could not become an [`AgentAction`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("unknown agent action: {0}")]
    Unknown(String),
    #[error("invalid params for {name}: {reason}")]
    InvalidParams { name: String, reason: String },
}

#[derive(Deserialize)]
struct BrowseWebParams {
    #[serde(default)]
    search_query: Option<String>,
}

#[derive(Deserialize)]
struct NavigateParams {
    #[serde(default)]
    tab: Option<String>,
    #[serde(default, rename = "followUpPrompt")]
    follow_up_prompt: Option<String>,
}

#[derive(Deserialize)]
struct GenerateImageParams {
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Deserialize)]
struct InitiateCallParams {
    #[serde(default)]
    contact_name: Option<String>,
    #[serde(default)]
    phone_number: Option<String>,
}

impl AgentAction {
    /// Names of every recognized action.
    pub const NAMES: [&'static str; 5] = [
        "browse_web",
        "navigate",
        "generate_image",
        "initiate_call",
        "list_contacts",
    ];

    /// Validate a raw tag against the closed action set.
    pub fn from_raw(raw: &RawAction) -> Result<Self, ActionError> {
        let invalid = |reason: String| ActionError::InvalidParams {
            name: raw.name.clone(),
            reason,
        };
        let params = raw.params.clone();

        match raw.name.as_str() {
            "browse_web" => {
                let p: BrowseWebParams =
                    serde_json::from_value(params).map_err(|e| invalid(e.to_string()))?;
                let search_query = non_empty(p.search_query)
                    .ok_or_else(|| invalid("missing search_query".into()))?;
                Ok(Self::BrowseWeb { search_query })
            }
            "navigate" => {
                let p: NavigateParams =
                    serde_json::from_value(params).map_err(|e| invalid(e.to_string()))?;
                let tab = non_empty(p.tab).ok_or_else(|| invalid("missing tab".into()))?;
                Ok(Self::Navigate {
                    tab,
                    follow_up_prompt: non_empty(p.follow_up_prompt),
                })
            }
            "generate_image" => {
                let p: GenerateImageParams =
                    serde_json::from_value(params).map_err(|e| invalid(e.to_string()))?;
                let prompt = non_empty(p.prompt).ok_or_else(|| invalid("missing prompt".into()))?;
                Ok(Self::GenerateImage { prompt })
            }
            "initiate_call" => {
                let p: InitiateCallParams =
                    serde_json::from_value(params).map_err(|e| invalid(e.to_string()))?;
                Ok(Self::InitiateCall {
                    contact_name: non_empty(p.contact_name),
                    phone_number: non_empty(p.phone_number),
                })
            }
            "list_contacts" => Ok(Self::ListContacts),
            other => Err(ActionError::Unknown(other.to_owned())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::BrowseWeb { .. } => "browse_web",
            Self::Navigate { .. } => "navigate",
            Self::GenerateImage { .. } => "generate_image",
            Self::InitiateCall { .. } => "initiate_call",
            Self::ListContacts => "list_contacts",
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}
