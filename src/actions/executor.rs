//! Maps recognized agent actions onto ordered UI effects.
//!
//! Planning is pure given the contact book. The turn controller applies the
//! effects in order once the spoken reply has finished, so nothing here
//! touches the UI, the speech engine or the model service directly.

use super::AgentAction;
use crate::contacts::ContactBook;
use crate::state::{Feature, Speaker};
use std::sync::Arc;
use tracing::{debug, warn};

/// One side effect requested by an agent action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Append a transcript entry.
    Log { speaker: Speaker, text: String },
    /// Open a URL in the in-app browser.
    OpenBrowser { url: String },
    /// Switch the active feature panel.
    SetFeature(Feature),
    /// Fill the prompt input; with `auto_submit` it is submitted once idle.
    SetPrompt { text: String, auto_submit: bool },
    /// Start image generation for the prompt.
    GenerateImage { prompt: String },
    /// Speak a short confirmation through the speech output manager.
    Speak { text: String },
    /// Hand a number to the native dialer. Applied only if the preceding
    /// `Speak` ran to completion.
    Dial { number: String },
}

/// Plans the effects of each agent action.
pub struct ActionExecutor {
    contacts: Arc<dyn ContactBook>,
    search_url: String,
    assistant_name: String,
}

impl ActionExecutor {
    pub fn new(
        contacts: Arc<dyn ContactBook>,
        search_url: impl Into<String>,
        assistant_name: impl Into<String>,
    ) -> Self {
        Self {
            contacts,
            search_url: search_url.into(),
            assistant_name: assistant_name.into(),
        }
    }

    /// Effects for a whole action list, in action order.
    pub fn plan_all(&self, actions: &[AgentAction]) -> Vec<Effect> {
        actions.iter().flat_map(|a| self.plan(a)).collect()
    }

    /// Effects for one action. A malformed action yields no effects.
    pub fn plan(&self, action: &AgentAction) -> Vec<Effect> {
        debug!(action = action.name(), "planning agent action");
        match action {
            AgentAction::BrowseWeb { search_query } => self.browse_web(search_query),
            AgentAction::Navigate {
                tab,
                follow_up_prompt,
            } => self.navigate(tab, follow_up_prompt.as_deref()),
            AgentAction::GenerateImage { prompt } => self.generate_image(prompt),
            AgentAction::InitiateCall {
                contact_name,
                phone_number,
            } => self.initiate_call(contact_name.as_deref(), phone_number.as_deref()),
            AgentAction::ListContacts => self.list_contacts(),
        }
    }

    fn browse_web(&self, query: &str) -> Vec<Effect> {
        vec![
            system(format!(
                "[System: Opening in-app browser to search for \"{query}\"]"
            )),
            Effect::OpenBrowser {
                url: format!("{}{}", self.search_url, urlencoding::encode(query)),
            },
        ]
    }

    fn navigate(&self, tab: &str, follow_up: Option<&str>) -> Vec<Effect> {
        let Ok(feature) = tab.parse::<Feature>() else {
            warn!("navigate action names an unknown tab: {tab}");
            return Vec::new();
        };
        let mut effects = vec![
            Effect::SetFeature(feature),
            system(format!(
                "[System: {} is navigating to the {tab} tab.]",
                self.assistant_name
            )),
        ];
        if let Some(prompt) = follow_up {
            effects.push(Effect::SetPrompt {
                text: prompt.to_owned(),
                auto_submit: true,
            });
        }
        effects
    }

    fn generate_image(&self, prompt: &str) -> Vec<Effect> {
        vec![
            system(format!(
                "[System: {} is generating an image with prompt: \"{prompt}\"]",
                self.assistant_name
            )),
            Effect::SetFeature(Feature::Image),
            Effect::SetPrompt {
                text: prompt.to_owned(),
                auto_submit: false,
            },
            Effect::GenerateImage {
                prompt: prompt.to_owned(),
            },
        ]
    }

    fn initiate_call(&self, contact_name: Option<&str>, phone_number: Option<&str>) -> Vec<Effect> {
        let (script, number) = match (contact_name, phone_number) {
            (Some(name), raw) => match self.contacts.find_by_name(name) {
                Some(contact) => (
                    format!("Found {}. Opening your phone's dialer now.", contact.name),
                    Some(contact.phone),
                ),
                None => match raw {
                    Some(number) => (dialing_number(number), Some(number.to_owned())),
                    None => (
                        format!("Contact \"{name}\" not found. You can add them in Settings."),
                        None,
                    ),
                },
            },
            (None, Some(number)) => (dialing_number(number), Some(number.to_owned())),
            (None, None) => (
                "I need a contact name or a phone number to initiate a call.".to_owned(),
                None,
            ),
        };

        let mut effects = vec![
            system(format!("[System: {script}]")),
            Effect::Speak { text: script },
        ];
        if let Some(number) = number {
            effects.push(Effect::Dial { number });
            effects.push(Effect::SetFeature(Feature::Call));
        }
        effects
    }

    fn list_contacts(&self) -> Vec<Effect> {
        let contacts = self.contacts.contacts();
        let script = if contacts.is_empty() {
            "You have no contacts saved. You can add them in the Settings tab.".to_owned()
        } else {
            let names: Vec<&str> = contacts.iter().map(|c| c.name.as_str()).collect();
            format!(
                "Here are your saved contacts: {}. Who would you like to call?",
                names.join(", ")
            )
        };
        vec![
            system(format!("[System: {script}]")),
            Effect::Speak { text: script },
        ]
    }
}

fn dialing_number(number: &str) -> String {
    format!("Understood. I'm opening your phone's dialer with the number {number}.")
}

fn system(text: String) -> Effect {
    Effect::Log {
        speaker: Speaker::System,
        text,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::contacts::{Contact, InMemoryContactBook};

    fn executor(contacts: Vec<Contact>) -> ActionExecutor {
        ActionExecutor::new(
            Arc::new(InMemoryContactBook::new(contacts)),
            "https://search.test/?q=",
            "Agent Lee",
        )
    }

    fn sarah() -> Contact {
        Contact {
            name: "Sarah".into(),
            phone: "555-0100".into(),
        }
    }

    // ── browse / navigate ───────────────────────────────────────────

    #[test]
    fn browse_web_encodes_query() {
        let effects = executor(vec![]).plan(&AgentAction::BrowseWeb {
            search_query: "rust & tokio".into(),
        });
        assert_eq!(
            effects[1],
            Effect::OpenBrowser {
                url: "https://search.test/?q=rust%20%26%20tokio".into()
            }
        );
        assert!(matches!(&effects[0], Effect::Log { speaker: Speaker::System, text } if text.contains("rust & tokio")));
    }

    #[test]
    fn navigate_switches_feature() {
        let effects = executor(vec![]).plan(&AgentAction::Navigate {
            tab: "image".into(),
            follow_up_prompt: None,
        });
        assert_eq!(effects[0], Effect::SetFeature(Feature::Image));
        assert!(!effects.iter().any(|e| matches!(e, Effect::SetPrompt { .. })));
    }

    #[test]
    fn navigate_with_follow_up_requests_auto_submit() {
        let effects = executor(vec![]).plan(&AgentAction::Navigate {
            tab: "research".into(),
            follow_up_prompt: Some("latest rust release".into()),
        });
        assert_eq!(
            effects.last().unwrap(),
            &Effect::SetPrompt {
                text: "latest rust release".into(),
                auto_submit: true,
            }
        );
    }

    #[test]
    fn navigate_to_unknown_tab_is_a_no_op() {
        let effects = executor(vec![]).plan(&AgentAction::Navigate {
            tab: "gallery".into(),
            follow_up_prompt: Some("x".into()),
        });
        assert!(effects.is_empty());
    }

    #[test]
    fn generate_image_sets_prompt_without_auto_submit() {
        let effects = executor(vec![]).plan(&AgentAction::GenerateImage {
            prompt: "a red fox".into(),
        });
        assert!(effects.contains(&Effect::SetFeature(Feature::Image)));
        assert!(effects.contains(&Effect::SetPrompt {
            text: "a red fox".into(),
            auto_submit: false,
        }));
        assert_eq!(
            effects.last().unwrap(),
            &Effect::GenerateImage {
                prompt: "a red fox".into()
            }
        );
    }

    // ── calls ───────────────────────────────────────────────────────

    #[test]
    fn call_known_contact_speaks_before_dialing() {
        let effects = executor(vec![sarah()]).plan(&AgentAction::InitiateCall {
            contact_name: Some("sarah".into()),
            phone_number: None,
        });
        let speak = effects
            .iter()
            .position(|e| matches!(e, Effect::Speak { .. }))
            .unwrap();
        let dial = effects
            .iter()
            .position(|e| matches!(e, Effect::Dial { .. }))
            .unwrap();
        assert!(speak < dial);
        assert_eq!(
            effects[speak],
            Effect::Speak {
                text: "Found Sarah. Opening your phone's dialer now.".into()
            }
        );
        assert_eq!(
            effects[dial],
            Effect::Dial {
                number: "555-0100".into()
            }
        );
        assert_eq!(effects.last().unwrap(), &Effect::SetFeature(Feature::Call));
    }

    #[test]
    fn call_unknown_contact_does_not_dial() {
        let effects = executor(vec![sarah()]).plan(&AgentAction::InitiateCall {
            contact_name: Some("Bob".into()),
            phone_number: None,
        });
        assert!(effects.contains(&Effect::Speak {
            text: "Contact \"Bob\" not found. You can add them in Settings.".into()
        }));
        assert!(!effects.iter().any(|e| matches!(e, Effect::Dial { .. })));
    }

    #[test]
    fn call_unknown_contact_falls_back_to_number() {
        let effects = executor(vec![]).plan(&AgentAction::InitiateCall {
            contact_name: Some("Bob".into()),
            phone_number: Some("555-0123".into()),
        });
        assert!(effects.contains(&Effect::Dial {
            number: "555-0123".into()
        }));
    }

    #[test]
    fn call_raw_number() {
        let effects = executor(vec![]).plan(&AgentAction::InitiateCall {
            contact_name: None,
            phone_number: Some("555-0123".into()),
        });
        assert!(effects.contains(&Effect::Speak {
            text: "Understood. I'm opening your phone's dialer with the number 555-0123.".into()
        }));
    }

    #[test]
    fn call_without_target_only_explains() {
        let effects = executor(vec![]).plan(&AgentAction::InitiateCall {
            contact_name: None,
            phone_number: None,
        });
        assert_eq!(effects.len(), 2);
        assert!(!effects.iter().any(|e| matches!(e, Effect::Dial { .. })));
    }

    // ── contacts ────────────────────────────────────────────────────

    #[test]
    fn list_contacts_reads_names() {
        let effects = executor(vec![
            sarah(),
            Contact {
                name: "Marcus".into(),
                phone: "1".into(),
            },
        ])
        .plan(&AgentAction::ListContacts);
        assert_eq!(
            effects[1],
            Effect::Speak {
                text: "Here are your saved contacts: Sarah, Marcus. Who would you like to call?"
                    .into()
            }
        );
    }

    #[test]
    fn list_contacts_when_empty() {
        let effects = executor(vec![]).plan(&AgentAction::ListContacts);
        assert_eq!(
            effects[1],
            Effect::Speak {
                text: "You have no contacts saved. You can add them in the Settings tab.".into()
            }
        );
    }

    #[test]
    fn plan_all_preserves_action_order_and_skips_malformed() {
        let effects = executor(vec![]).plan_all(&[
            AgentAction::Navigate {
                tab: "nowhere".into(),
                follow_up_prompt: None,
            },
            AgentAction::BrowseWeb {
                search_query: "q".into(),
            },
            AgentAction::Navigate {
                tab: "text".into(),
                follow_up_prompt: None,
            },
        ]);
        let browser = effects
            .iter()
            .position(|e| matches!(e, Effect::OpenBrowser { .. }))
            .unwrap();
        let feature = effects
            .iter()
            .position(|e| *e == Effect::SetFeature(Feature::Text))
            .unwrap();
        assert!(browser < feature);
    }
}
