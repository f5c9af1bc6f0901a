//! Permission registry and authority
//!
//! The registry is the closed set of valid permission keys: plugins and
//! the server register keys during start-up, and registration fails once
//! the server has started. The authority owns the registry plus the
//! collection of permission groups, resolves the default group, and
//! handles group persistence.
//!
//! Group files live under the permissions directory as
//! `group-<name>.json`. Per-group save failures are logged and skipped,
//! never propagated; the in-memory state stays authoritative.

pub mod group;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::naming;
pub use group::{GroupRecord, PermissionGroup};

/// Baseline patterns granted to a synthesized default group.
const BASELINE_PATTERNS: &[&str] = &["rozd.say", "rozd.me"];

/// Permission errors
#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("invalid permission key: '{0}'")]
    InvalidKey(String),

    #[error("permission already registered: '{0}'")]
    DuplicateKey(String),

    #[error("the server has started, permission registration is closed")]
    RegistrationClosed,

    #[error("invalid permission pattern: '{0}'")]
    InvalidPattern(String),

    #[error("permission not registered: '{0}'")]
    Unregistered(String),

    #[error("group name already in use: '{0}'")]
    DuplicateGroupName(String),

    #[error("unknown group: '{0}'")]
    UnknownGroup(String),
}

/// A registered permission key and its metadata
#[derive(Debug, Clone)]
pub struct Permission {
    pub key: String,
    pub description: String,
    /// The component (server or plugin) that registered the key
    pub registrar: String,
}

/// The closed set of valid permission keys
#[derive(Debug, Default)]
pub struct PermissionRegistry {
    entries: HashMap<String, Permission>,
    closed: bool,
}

impl PermissionRegistry {
    /// Register a permission key. Fails once the registry is closed,
    /// regardless of key validity.
    pub fn register(
        &mut self,
        key: &str,
        description: &str,
        registrar: &str,
    ) -> Result<(), PermissionError> {
        if self.closed {
            return Err(PermissionError::RegistrationClosed);
        }

        let key = naming::fold(key);
        if !naming::valid_permission_key(&key) {
            return Err(PermissionError::InvalidKey(key));
        }
        if self.entries.contains_key(&key) {
            return Err(PermissionError::DuplicateKey(key));
        }

        self.entries.insert(
            key.clone(),
            Permission {
                key,
                description: description.to_string(),
                registrar: registrar.to_string(),
            },
        );
        Ok(())
    }

    /// Close the registry. Called when the server transitions to started.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.entries.contains_key(&naming::fold(key))
    }

    pub fn get(&self, key: &str) -> Option<&Permission> {
        self.entries.get(&naming::fold(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    /// Whether a group pattern is backed by the registry: registered
    /// exactly, or a wildcard whose prefix covers at least one
    /// registered key. The literal `*` is always covered.
    pub fn covers(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if self.entries.contains_key(pattern) {
            return true;
        }
        if let Some(stem) = pattern.strip_suffix(".*") {
            let prefix = format!("{}.", stem);
            return self.entries.keys().any(|k| k.starts_with(&prefix));
        }
        false
    }
}

/// Owns the permission registry and the permission groups
#[derive(Debug)]
pub struct PermissionAuthority {
    registry: PermissionRegistry,
    /// Folded group name -> group
    groups: HashMap<String, PermissionGroup>,
    /// Folded name of the current default group
    default_group: Option<String>,
    perm_dir: PathBuf,
}

impl PermissionAuthority {
    pub fn new(perm_dir: PathBuf) -> Self {
        Self {
            registry: PermissionRegistry::default(),
            groups: HashMap::new(),
            default_group: None,
            perm_dir,
        }
    }

    pub fn registry(&self) -> &PermissionRegistry {
        &self.registry
    }

    /// Register a permission key on behalf of `registrar`.
    pub fn register_permission(
        &mut self,
        key: &str,
        description: &str,
        registrar: &str,
    ) -> Result<(), PermissionError> {
        self.registry.register(key, description, registrar)
    }

    /// Close the registry to further registration.
    pub fn close_registry(&mut self) {
        self.registry.close();
    }

    /// Create a new, empty group. The name must be free ignoring case.
    pub fn create_group(&mut self, name: &str) -> Result<&mut PermissionGroup, PermissionError> {
        match self.groups.entry(naming::fold(name)) {
            Entry::Occupied(_) => Err(PermissionError::DuplicateGroupName(name.to_string())),
            Entry::Vacant(entry) => Ok(entry.insert(PermissionGroup::new(name))),
        }
    }

    pub fn get_group(&self, name: &str) -> Option<&PermissionGroup> {
        self.groups.get(&naming::fold(name))
    }

    pub fn get_group_mut(&mut self, name: &str) -> Option<&mut PermissionGroup> {
        self.groups.get_mut(&naming::fold(name))
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(|k| k.as_str())
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Add a pattern to a group, checked against the registry.
    pub fn add_group_permission(
        &mut self,
        group: &str,
        pattern: &str,
    ) -> Result<(), PermissionError> {
        let Some(found) = self.groups.get_mut(&naming::fold(group)) else {
            return Err(PermissionError::UnknownGroup(group.to_string()));
        };
        found.add_permission(pattern, &self.registry)
    }

    pub fn default_group(&self) -> Option<&PermissionGroup> {
        self.default_group
            .as_deref()
            .and_then(|name| self.groups.get(name))
    }

    pub fn default_group_name(&self) -> Option<&str> {
        self.default_group.as_deref()
    }

    /// Make `name` the default group, clearing the previous default.
    pub fn set_default_group(&mut self, name: &str) -> Result<(), PermissionError> {
        let folded = naming::fold(name);
        if !self.groups.contains_key(&folded) {
            return Err(PermissionError::UnknownGroup(name.to_string()));
        }

        if let Some(previous) = self.default_group.take() {
            if previous != folded {
                if let Some(group) = self.groups.get_mut(&previous) {
                    group.set_default(false);
                }
            }
        }

        if let Some(group) = self.groups.get_mut(&folded) {
            group.set_default(true);
        }
        self.default_group = Some(folded);
        Ok(())
    }

    /// Rename a group, re-keying the lookup table and moving its file.
    /// The storage move is best-effort.
    pub async fn rename_group(&mut self, old: &str, new: &str) -> Result<(), PermissionError> {
        let old_key = naming::fold(old);
        let new_key = naming::fold(new);

        if old_key != new_key && self.groups.contains_key(&new_key) {
            return Err(PermissionError::DuplicateGroupName(new.to_string()));
        }
        let Some(mut group) = self.groups.remove(&old_key) else {
            return Err(PermissionError::UnknownGroup(old.to_string()));
        };

        group.set_name(new);
        self.groups.insert(new_key.clone(), group);
        if self.default_group.as_deref() == Some(old_key.as_str()) {
            self.default_group = Some(new_key.clone());
        }

        if old_key != new_key {
            let old_path = self.group_path(&old_key);
            if let Err(e) = fs::remove_file(&old_path).await {
                warn!("Failed to remove old group file {:?}: {}", old_path, e);
            }
        }
        if let Err(e) = self.write_group(&new_key).await {
            warn!("Failed to save renamed group '{}': {}", new, e);
        }
        Ok(())
    }

    /// Load all persisted groups, then establish the default group.
    ///
    /// On a duplicate name the later file wins with a warning. If no
    /// group named `default_name` exists and none is flagged default,
    /// one is synthesized with a baseline pattern set; this keeps
    /// start-up deterministic instead of aborting.
    pub async fn load(&mut self, default_name: &str) -> Result<()> {
        fs::create_dir_all(&self.perm_dir).await?;

        let mut dir = fs::read_dir(&self.perm_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !file_name.starts_with("group-") || !file_name.ends_with(".json") {
                continue;
            }

            let path = entry.path();
            let record: GroupRecord = match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Failed to parse group file {:?}: {}", path, e);
                        continue;
                    }
                },
                Err(e) => {
                    warn!("Failed to read group file {:?}: {}", path, e);
                    continue;
                }
            };

            let folded = naming::fold(&record.name);
            if self.groups.contains_key(&folded) {
                warn!("Duplicate group entry for '{}', later file wins", record.name);
            }

            let group = PermissionGroup::from_record(record);
            let is_default = group.is_default();
            self.groups.insert(folded.clone(), group);

            if is_default {
                if let Some(previous) = self.default_group.take() {
                    if previous != folded {
                        if let Some(prev) = self.groups.get_mut(&previous) {
                            prev.set_default(false);
                        }
                    }
                }
                self.default_group = Some(folded);
            }
        }

        // The configured default group name beats the persisted flags
        let configured = naming::fold(default_name);
        if self.groups.contains_key(&configured) {
            if let Err(e) = self.set_default_group(&configured) {
                warn!("Failed to apply configured default group: {}", e);
            }
        }

        if self.default_group.is_none() {
            warn!(
                "No default permission group found, synthesizing '{}'",
                default_name
            );
            let mut group = PermissionGroup::new(default_name);
            for pattern in BASELINE_PATTERNS {
                group.insert_pattern(pattern);
            }
            group.set_default(true);
            self.groups.insert(configured.clone(), group);
            self.default_group = Some(configured.clone());

            if let Err(e) = self.write_group(&configured).await {
                warn!("Failed to save synthesized default group: {}", e);
            }
        }

        info!(
            "Loaded {} permission group(s), default is '{}'",
            self.groups.len(),
            self.default_group.as_deref().unwrap_or("?")
        );
        Ok(())
    }

    /// Persist all groups. Per-group failures are logged and skipped.
    pub async fn save(&self) {
        for name in self.groups.keys() {
            if let Err(e) = self.write_group(name).await {
                warn!("Failed to save group '{}': {}", name, e);
            }
        }
    }

    /// Persist one group by name.
    pub async fn save_group(&self, name: &str) -> Result<()> {
        self.write_group(&naming::fold(name)).await
    }

    fn group_path(&self, folded_name: &str) -> PathBuf {
        self.perm_dir.join(format!("group-{}.json", folded_name))
    }

    async fn write_group(&self, folded_name: &str) -> Result<()> {
        let Some(group) = self.groups.get(folded_name) else {
            return Err(PermissionError::UnknownGroup(folded_name.to_string()).into());
        };
        let bytes = serde_json::to_vec_pretty(&group.to_record())?;
        fs::write(self.group_path(folded_name), bytes).await?;
        Ok(())
    }
}
