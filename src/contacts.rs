//! Saved contacts used to resolve `initiate_call` actions.

use crate::error::{AssistantError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub phone: String,
}

/// Read access to the user's contact list.
///
/// Storage belongs to the UI layer; the assistant core only looks contacts up.
pub trait ContactBook: Send + Sync {
    /// All contacts in display order.
    fn contacts(&self) -> Vec<Contact>;

    /// Case-insensitive exact name match.
    fn find_by_name(&self, name: &str) -> Option<Contact> {
        let wanted = name.trim().to_lowercase();
        self.contacts()
            .into_iter()
            .find(|c| c.name.trim().to_lowercase() == wanted)
    }
}

/// Contact book held in memory, optionally seeded from a JSON file.
#[derive(Debug, Default)]
pub struct InMemoryContactBook {
    contacts: RwLock<Vec<Contact>>,
}

impl InMemoryContactBook {
    pub fn new(contacts: Vec<Contact>) -> Self {
        Self {
            contacts: RwLock::new(contacts),
        }
    }

    /// Load a JSON array of `{ "name", "phone" }` objects.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let contacts: Vec<Contact> = serde_json::from_str(&raw).map_err(|e| {
            AssistantError::Config(format!("failed to parse contacts {}: {e}", path.display()))
        })?;
        Ok(Self::new(contacts))
    }

    pub fn add(&self, contact: Contact) {
        if let Ok(mut contacts) = self.contacts.write() {
            contacts.push(contact);
        }
    }
}

impl ContactBook for InMemoryContactBook {
    fn contacts(&self) -> Vec<Contact> {
        self.contacts
            .read()
            .map(|contacts| contacts.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn book() -> InMemoryContactBook {
        InMemoryContactBook::new(vec![
            Contact {
                name: "Sarah Lee".into(),
                phone: "555-0100".into(),
            },
            Contact {
                name: "Marcus".into(),
                phone: "555-0199".into(),
            },
        ])
    }

    #[test]
    fn lookup_ignores_case_and_padding() {
        let found = book().find_by_name("  sarah LEE ").unwrap();
        assert_eq!(found.phone, "555-0100");
    }

    #[test]
    fn lookup_requires_full_name() {
        assert!(book().find_by_name("Sarah").is_none());
    }

    #[test]
    fn add_appends_in_order() {
        let book = book();
        book.add(Contact {
            name: "Zed".into(),
            phone: "1".into(),
        });
        let names: Vec<String> = book.contacts().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["Sarah Lee", "Marcus", "Zed"]);
    }

    #[test]
    fn loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contacts.json");
        std::fs::write(&path, r#"[{"name": "Ava", "phone": "555-0111"}]"#).unwrap();
        let book = InMemoryContactBook::from_json_file(&path).unwrap();
        assert_eq!(book.find_by_name("ava").unwrap().phone, "555-0111");
    }

    #[test]
    fn invalid_json_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contacts.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            InMemoryContactBook::from_json_file(&path),
            Err(AssistantError::Config(_))
        ));
    }
}
