//! Validated identifiers for providers, groups and tools.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::HangarError;

const MAX_ID_LEN: usize = 64;
const MAX_TOOL_NAME_LEN: usize = 128;

fn valid_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn validate_id(value: &str, what: &str) -> Result<(), HangarError> {
    if value.is_empty() {
        return Err(HangarError::Validation(format!("{what} cannot be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(HangarError::Validation(format!(
            "{what} too long: {} chars (max {MAX_ID_LEN})",
            value.len()
        )));
    }
    if let Some(c) = value.chars().find(|c| !valid_id_char(*c)) {
        return Err(HangarError::Validation(format!(
            "{what} contains invalid character {c:?} (allowed: A-Z a-z 0-9 _ -)"
        )));
    }
    Ok(())
}

/// Identifier of a managed provider. `[A-Za-z0-9_-]`, 1..=64 chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(value: impl Into<String>) -> Result<Self, HangarError> {
        let value = value.into();
        validate_id(&value, "provider id")?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProviderId {
    type Err = HangarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ProviderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of a provider group. Same charset rule as [`ProviderId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(value: impl Into<String>) -> Result<Self, HangarError> {
        let value = value.into();
        validate_id(&value, "group id")?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GroupId {
    type Err = HangarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for GroupId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validate a tool name: dotted/alphanumeric/underscore segments, max 128 chars.
///
/// Slashes are accepted as segment separators since several upstream servers
/// namespace tools as `math/add`.
pub fn validate_tool_name(name: &str) -> Result<(), HangarError> {
    if name.is_empty() {
        return Err(HangarError::Validation("tool name cannot be empty".into()));
    }
    if name.len() > MAX_TOOL_NAME_LEN {
        return Err(HangarError::Validation(format!(
            "tool name too long: {} chars (max {MAX_TOOL_NAME_LEN})",
            name.len()
        )));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'));
    if !valid {
        return Err(HangarError::Validation(format!(
            "tool name {name:?} contains invalid characters"
        )));
    }
    Ok(())
}
