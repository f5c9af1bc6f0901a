//! Permission groups and wildcard pattern matching
//!
//! A group is a named, persisted bag of permission patterns plus chat
//! decoration. Matching order (first match wins, most general first):
//! 1. Literal `*` in the pattern set → matched
//! 2. For each cumulative prefix of the key except the last, `prefix.*`
//! 3. At the final segment, the full key itself or `key.*`
//! 4. Otherwise not matched
//!
//! There is no deny pattern inside a group; denial only exists at the
//! account-override layer.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{PermissionError, PermissionRegistry};
use crate::naming;

/// Persisted group record (`group-<name>.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    pub name: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(default)]
    pub colour: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// A named bundle of permission patterns assignable to accounts
#[derive(Debug, Clone)]
pub struct PermissionGroup {
    name: String,
    patterns: BTreeSet<String>,
    prefix: String,
    suffix: String,
    colour: String,
    is_default: bool,
}

impl PermissionGroup {
    /// Create an empty group: no patterns, no decoration, not default.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            patterns: BTreeSet::new(),
            prefix: String::new(),
            suffix: String::new(),
            colour: String::new(),
            is_default: false,
        }
    }

    /// Rebuild a group from its persisted record. Patterns are folded;
    /// registry validation is deliberately skipped here since group
    /// files may predate the registrations of the plugins that own the
    /// keys.
    pub fn from_record(record: GroupRecord) -> Self {
        Self {
            patterns: record.permissions.iter().map(|p| naming::fold(p)).collect(),
            name: record.name,
            prefix: record.prefix,
            suffix: record.suffix,
            colour: record.colour,
            is_default: record.is_default,
        }
    }

    pub fn to_record(&self) -> GroupRecord {
        GroupRecord {
            name: self.name.clone(),
            prefix: self.prefix.clone(),
            suffix: self.suffix.clone(),
            colour: self.colour.clone(),
            is_default: self.is_default,
            permissions: self.patterns.iter().cloned().collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub(crate) fn set_default(&mut self, default: bool) {
        self.is_default = default;
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn set_prefix(&mut self, prefix: &str) {
        self.prefix = prefix.to_string();
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn set_suffix(&mut self, suffix: &str) {
        self.suffix = suffix.to_string();
    }

    pub fn colour(&self) -> &str {
        &self.colour
    }

    pub fn set_colour(&mut self, colour: &str) {
        self.colour = colour.to_string();
    }

    /// The group's patterns, folded, in order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.as_str())
    }

    /// Add a pattern to the group. Unregistered permissions cannot be
    /// granted: the pattern must be registered exactly, or be a
    /// wildcard covering at least one registered key.
    pub fn add_permission(
        &mut self,
        pattern: &str,
        registry: &PermissionRegistry,
    ) -> Result<(), PermissionError> {
        let pattern = naming::fold(pattern);

        if !naming::valid_pattern(&pattern) {
            return Err(PermissionError::InvalidPattern(pattern));
        }
        if !registry.covers(&pattern) {
            return Err(PermissionError::Unregistered(pattern));
        }

        self.patterns.insert(pattern);
        Ok(())
    }

    /// Remove a pattern from the group. Returns whether it was present.
    pub fn remove_permission(&mut self, pattern: &str) -> bool {
        self.patterns.remove(&naming::fold(pattern))
    }

    /// Insert a pattern without registry validation. Load-path only.
    pub(crate) fn insert_pattern(&mut self, pattern: &str) {
        self.patterns.insert(naming::fold(pattern));
    }

    /// Wildcard permission check, most general wildcard first.
    pub fn has_permission(&self, key: &str) -> bool {
        // Super-wildcard grants everything
        if self.patterns.contains("*") {
            return true;
        }

        let key = naming::fold(key);
        let segments: Vec<&str> = key.split('.').collect();
        let mut prefix = String::new();

        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                prefix.push('.');
            }
            prefix.push_str(segment);

            if i + 1 == segments.len() {
                // Final segment: the key itself or its own wildcard
                return self.patterns.contains(&key)
                    || self.patterns.contains(&format!("{}.*", prefix));
            }

            if self.patterns.contains(&format!("{}.*", prefix)) {
                return true;
            }
        }

        false
    }
}
