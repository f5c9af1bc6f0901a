//! Accounts: identity, authentication, and permission resolution
//!
//! An account resolves permissions in override-first order: the server
//! pseudo-account always passes, an account-level Granted/Denied
//! override beats the group, and only an Unset key falls through to the
//! assigned permission group.
//!
//! Login is challenge/response: both sides combine the stored password
//! digest with a shared, time-bound hash time and compare SHA-256
//! digests, so the stored hash itself is never transmitted.

pub mod directory;

use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::naming;
use crate::permissions::{PermissionAuthority, PermissionRegistry};
use crate::ResultCode;

/// Per-key override state. `Unset` is never stored in the override map;
/// it is represented by key absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    Unset,
}

/// Persisted account record (`<username>.<displayname>.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub username: String,
    pub display_name: String,
    /// 32-byte password digest, hex encoded
    pub password_hash: String,
    pub creation_date: DateTime<Utc>,
    pub creation_ip: IpAddr,
    #[serde(default)]
    pub last_login_ip: Option<IpAddr>,
}

/// Persisted per-account permission override record
/// (`player-<username>.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRecord {
    pub name: String,
    pub group: String,
    #[serde(default)]
    pub granted: Vec<String>,
    #[serde(default)]
    pub denied: Vec<String>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(default)]
    pub colour: String,
}

/// An identity record plus its permission overrides
#[derive(Debug, Clone)]
pub struct Account {
    username: String,
    display_name: String,
    password_hash: [u8; 32],
    creation_date: DateTime<Utc>,
    creation_ip: IpAddr,
    last_login_ip: Option<IpAddr>,
    /// Folded name of the assigned permission group
    group: String,
    /// Folded key -> Granted/Denied. Unset keys are absent.
    overrides: HashMap<String, PermissionState>,
    chat_prefix: String,
    chat_suffix: String,
    colour: String,
    logged_in: bool,
    is_server: bool,
}

/// Compute the login comparison digest:
/// `SHA256(stored_hash || hash_time_le_bytes)`.
pub fn challenge_digest(password_hash: &[u8; 32], hash_time: i64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password_hash);
    hasher.update(hash_time.to_le_bytes());
    hasher.finalize().into()
}

impl Account {
    /// Create a fresh account assigned to `group`.
    pub fn new(
        username: &str,
        display_name: &str,
        password_hash: [u8; 32],
        creation_ip: IpAddr,
        group: &str,
    ) -> Self {
        Self {
            username: username.to_string(),
            display_name: display_name.to_string(),
            password_hash,
            creation_date: Utc::now(),
            creation_ip,
            last_login_ip: None,
            group: naming::fold(group),
            overrides: HashMap::new(),
            chat_prefix: String::new(),
            chat_suffix: String::new(),
            colour: String::new(),
            logged_in: false,
            is_server: false,
        }
    }

    /// The singular privileged pseudo-account with implicit full rights.
    /// It never authenticates through the login path.
    pub fn server(group: &str) -> Self {
        let mut account = Self::new(
            "server",
            "server",
            [0u8; 32],
            IpAddr::from([127, 0, 0, 1]),
            group,
        );
        account.is_server = true;
        account
    }

    /// Rebuild an account from its persisted records. Override keys not
    /// present in the registry are dropped with a warning; a record
    /// name mismatch is warned about and otherwise honoured.
    pub fn from_records(
        record: AccountRecord,
        overrides: OverrideRecord,
        registry: &PermissionRegistry,
    ) -> Result<Self> {
        let bytes = hex::decode(&record.password_hash)?;
        let Ok(password_hash) = <[u8; 32]>::try_from(bytes.as_slice()) else {
            bail!(
                "account '{}' has a malformed password digest",
                record.username
            );
        };

        if !naming::fold(&overrides.name).eq(&naming::fold(&record.username)) {
            warn!(
                "Permission record for '{}' carries mismatched name '{}'",
                record.username, overrides.name
            );
        }

        let mut states = HashMap::new();
        for (keys, state) in [
            (&overrides.granted, PermissionState::Granted),
            (&overrides.denied, PermissionState::Denied),
        ] {
            for key in keys {
                let key = naming::fold(key);
                if registry.is_registered(&key) {
                    states.insert(key, state);
                } else {
                    warn!(
                        "Dropping unregistered override '{}' for '{}'",
                        key, record.username
                    );
                }
            }
        }

        Ok(Self {
            username: record.username,
            display_name: record.display_name,
            password_hash,
            creation_date: record.creation_date,
            creation_ip: record.creation_ip,
            last_login_ip: record.last_login_ip,
            group: naming::fold(&overrides.group),
            overrides: states,
            chat_prefix: overrides.prefix,
            chat_suffix: overrides.suffix,
            colour: overrides.colour,
            logged_in: false,
            is_server: false,
        })
    }

    pub fn to_record(&self) -> AccountRecord {
        AccountRecord {
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            password_hash: hex::encode(self.password_hash),
            creation_date: self.creation_date,
            creation_ip: self.creation_ip,
            last_login_ip: self.last_login_ip,
        }
    }

    pub fn to_override_record(&self) -> OverrideRecord {
        let mut granted = Vec::new();
        let mut denied = Vec::new();
        for (key, state) in &self.overrides {
            match state {
                PermissionState::Granted => granted.push(key.clone()),
                PermissionState::Denied => denied.push(key.clone()),
                PermissionState::Unset => {}
            }
        }
        granted.sort();
        denied.sort();

        OverrideRecord {
            name: self.username.clone(),
            group: self.group.clone(),
            granted,
            denied,
            prefix: self.chat_prefix.clone(),
            suffix: self.chat_suffix.clone(),
            colour: self.colour.clone(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn set_username(&mut self, username: &str) {
        self.username = username.to_string();
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub(crate) fn set_display_name(&mut self, display_name: &str) {
        self.display_name = display_name.to_string();
    }

    /// Fully qualified file key: `<username>.<displayname>`, folded.
    pub fn fqn(&self) -> String {
        format!(
            "{}.{}",
            naming::fold(&self.username),
            naming::fold(&self.display_name)
        )
    }

    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }

    pub fn creation_ip(&self) -> IpAddr {
        self.creation_ip
    }

    pub fn last_login_ip(&self) -> Option<IpAddr> {
        self.last_login_ip
    }

    pub fn set_last_login_ip(&mut self, ip: IpAddr) {
        self.last_login_ip = Some(ip);
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Assign a permission group by folded name. The caller (server
    /// layer) validates the group against the authority.
    pub(crate) fn set_group(&mut self, group: &str) {
        self.group = naming::fold(group);
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn chat_prefix(&self) -> &str {
        &self.chat_prefix
    }

    pub fn set_chat_prefix(&mut self, prefix: &str) {
        self.chat_prefix = prefix.to_string();
    }

    pub fn chat_suffix(&self) -> &str {
        &self.chat_suffix
    }

    pub fn set_chat_suffix(&mut self, suffix: &str) {
        self.chat_suffix = suffix.to_string();
    }

    pub fn colour(&self) -> &str {
        &self.colour
    }

    pub fn set_colour(&mut self, colour: &str) {
        self.colour = colour.to_string();
    }

    /// Direct override-map lookup.
    pub fn check_override(&self, key: &str) -> PermissionState {
        self.overrides
            .get(&naming::fold(key))
            .copied()
            .unwrap_or(PermissionState::Unset)
    }

    /// Upsert or clear an override. `Unset` removes the map entry.
    pub fn set_override(&mut self, key: &str, state: PermissionState) {
        let key = naming::fold(key);
        match state {
            PermissionState::Unset => {
                self.overrides.remove(&key);
            }
            _ => {
                self.overrides.insert(key, state);
            }
        }
    }

    /// Resolve a permission. Overrides always take priority over the
    /// group; a missing group falls back to the authority's default.
    pub fn has_permission(&self, key: &str, authority: &PermissionAuthority) -> bool {
        if self.is_server {
            return true;
        }

        match self.check_override(key) {
            PermissionState::Granted => true,
            PermissionState::Denied => false,
            PermissionState::Unset => authority
                .get_group(&self.group)
                .or_else(|| authority.default_group())
                .map(|group| group.has_permission(key))
                .unwrap_or(false),
        }
    }

    /// Verify a challenge/response login attempt.
    ///
    /// An already-logged-in account signals a caller bug and returns
    /// `InternalError` rather than double-instating a session.
    pub fn log_in(&mut self, submitted_hash: &[u8], hash_time: i64) -> ResultCode {
        if self.logged_in {
            return ResultCode::InternalError;
        }

        let expected = challenge_digest(&self.password_hash, hash_time);
        if submitted_hash != expected.as_slice() {
            return ResultCode::IncorrectLogin;
        }

        self.logged_in = true;
        ResultCode::NoError
    }

    pub fn log_out(&mut self) {
        self.logged_in = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PermissionAuthority;
    use std::path::PathBuf;

    fn test_ip() -> IpAddr {
        IpAddr::from([10, 0, 0, 1])
    }

    fn account() -> Account {
        Account::new("alice", "alice", [7u8; 32], test_ip(), "default")
    }

    fn authority_with_mods() -> PermissionAuthority {
        let mut authority = PermissionAuthority::new(PathBuf::from("unused"));
        authority.register_permission("rozd.kick", "", "rozd").unwrap();
        authority.register_permission("rozd.say", "", "rozd").unwrap();
        authority.create_group("mods").unwrap();
        authority.add_group_permission("mods", "rozd.*").unwrap();
        authority
    }

    #[test]
    fn test_override_dominates_group() {
        let authority = authority_with_mods();
        let mut account = account();
        account.set_group("mods");

        // Unset defers to the group
        assert!(account.has_permission("rozd.kick", &authority));

        account.set_override("rozd.kick", PermissionState::Denied);
        assert!(!account.has_permission("rozd.kick", &authority));

        account.set_override("rozd.kick", PermissionState::Granted);
        assert!(account.has_permission("rozd.kick", &authority));

        account.set_override("rozd.kick", PermissionState::Unset);
        assert_eq!(account.check_override("rozd.kick"), PermissionState::Unset);
        assert!(account.has_permission("rozd.kick", &authority));
    }

    #[test]
    fn test_granted_override_without_group() {
        let authority = authority_with_mods();
        let mut account = account();
        account.set_group("nosuchgroup");

        assert!(!account.has_permission("rozd.kick", &authority));
        account.set_override("rozd.kick", PermissionState::Granted);
        assert!(account.has_permission("rozd.kick", &authority));
    }

    #[test]
    fn test_server_account_has_all_permissions() {
        let authority = authority_with_mods();
        let server = Account::server("default");
        assert!(server.has_permission("rozd.kick", &authority));
        assert!(server.has_permission("anything.at.all", &authority));
    }

    #[test]
    fn test_login_challenge() {
        let mut account = account();
        let hash_time = 1_700_000_000i64;
        let submitted = challenge_digest(&[7u8; 32], hash_time);

        assert_eq!(account.log_in(&submitted, hash_time), ResultCode::NoError);
        assert!(account.logged_in());

        // Second immediate attempt while still logged in is a caller bug
        assert_eq!(
            account.log_in(&submitted, hash_time),
            ResultCode::InternalError
        );
    }

    #[test]
    fn test_login_wrong_hash() {
        let mut account = account();
        let submitted = challenge_digest(&[8u8; 32], 12345);

        assert_eq!(account.log_in(&submitted, 12345), ResultCode::IncorrectLogin);
        assert!(!account.logged_in());

        // Right stored hash, different hash time
        let submitted = challenge_digest(&[7u8; 32], 12346);
        assert_eq!(account.log_in(&submitted, 12345), ResultCode::IncorrectLogin);
        assert!(!account.logged_in());
    }

    #[test]
    fn test_record_round_trip_filters_unregistered() {
        let authority = authority_with_mods();
        let mut account = account();
        account.set_group("mods");
        account.set_override("rozd.kick", PermissionState::Denied);
        account.set_override("rozd.say", PermissionState::Granted);
        // Never registered; should not survive a reload
        account.overrides.insert(
            "plugin.unregistered".to_string(),
            PermissionState::Granted,
        );
        account.set_chat_prefix("[A]");

        let restored = Account::from_records(
            account.to_record(),
            account.to_override_record(),
            authority.registry(),
        )
        .unwrap();

        assert_eq!(restored.username(), "alice");
        assert_eq!(restored.group(), "mods");
        assert_eq!(restored.chat_prefix(), "[A]");
        assert_eq!(restored.check_override("rozd.kick"), PermissionState::Denied);
        assert_eq!(restored.check_override("rozd.say"), PermissionState::Granted);
        assert_eq!(
            restored.check_override("plugin.unregistered"),
            PermissionState::Unset
        );
    }

    #[test]
    fn test_fqn_is_folded() {
        let account = Account::new("Alice", "Alice_", [0u8; 32], test_ip(), "default");
        assert_eq!(account.fqn(), "alice.alice_");
    }
}
