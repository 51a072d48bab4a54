use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::borrow::Borrow;
use std::fmt;

/// Public key (DSN key) naming a project's configuration.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectKey(String);

impl ProjectKey {
    pub fn new<K: Into<String>>(key: K) -> Self {
        ProjectKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectKey {
    fn from(key: &str) -> Self {
        ProjectKey(key.to_string())
    }
}

impl From<String> for ProjectKey {
    fn from(key: String) -> Self {
        ProjectKey(key)
    }
}

impl Borrow<str> for ProjectKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DocumentError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("project config must be a JSON object")]
    NotAnObject,
}

/// A project configuration document.
///
/// The document is passed through unchanged. Only the `disabled` flag and the
/// `rev` revision token are read from it.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectConfig {
    document: JsonValue,
    disabled: bool,
    revision: Option<String>,
}

impl ProjectConfig {
    pub fn from_value(document: JsonValue) -> Result<Self, DocumentError> {
        let object = document.as_object().ok_or(DocumentError::NotAnObject)?;

        let disabled = object
            .get("disabled")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);

        let revision = object
            .get("rev")
            .and_then(JsonValue::as_str)
            .map(String::from);

        Ok(ProjectConfig {
            document,
            disabled,
            revision,
        })
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DocumentError> {
        let document: JsonValue = serde_json::from_slice(bytes)?;
        Self::from_value(document)
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    pub fn document(&self) -> &JsonValue {
        &self.document
    }

    /// Keys listed under `publicKeys[].publicKey`.
    pub fn public_keys(&self) -> Vec<ProjectKey> {
        self.document
            .get("publicKeys")
            .and_then(JsonValue::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.get("publicKey").and_then(JsonValue::as_str))
                    .map(ProjectKey::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}
