//! rozd - game server identity and authorization core
//!
//! Accounts with challenge-based credential checks, permission groups
//! with wildcard patterns, per-account overrides, and the session
//! admission pipeline (bans, whitelist, duplicate eviction). State is
//! held in memory and persisted to flat files under the data
//! directory; the in-memory view is authoritative.

pub mod accounts;
pub mod admission;
pub mod config;
pub mod naming;
pub mod permissions;

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;

use accounts::directory::{AccountDirectory, DirectoryError};
use accounts::{Account, PermissionState};
use admission::{BanList, LoginRequest, SessionAdmission, SessionClient, SignupRequest, Whitelist};
use config::Config;
use permissions::{PermissionAuthority, PermissionError};

/// Wire-stable outcome codes for account operations. The numeric
/// values are part of the client protocol and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    NoError = 0,
    IncorrectLogin = 1,
    InternalError = 2,
    AccountNameInvalid = 3,
    AccountNameTaken = 4,
    Banned = 5,
    NotOnWhitelist = 6,
    HashTimeInvalid = 7,
}

impl ResultCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::NoError
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResultCode::NoError => "no error",
            ResultCode::IncorrectLogin => "incorrect login",
            ResultCode::InternalError => "internal error",
            ResultCode::AccountNameInvalid => "account name invalid",
            ResultCode::AccountNameTaken => "account name taken",
            ResultCode::Banned => "banned",
            ResultCode::NotOnWhitelist => "not on whitelist",
            ResultCode::HashTimeInvalid => "hash time invalid",
        };
        write!(f, "{}", name)
    }
}

/// Built-in permission keys, registered at startup before the
/// registry closes.
const BUILTIN_PERMISSIONS: &[(&str, &str)] = &[
    ("rozd.say", "Send chat messages"),
    ("rozd.say.server", "Broadcast as the server"),
    ("rozd.me", "Send emote messages"),
    ("rozd.kick", "Disconnect other players"),
    ("rozd.ban", "Ban and unban players"),
    ("rozd.whitelist", "Manage the whitelist"),
    ("rozd.accounts.manage", "Rename and delete accounts"),
    ("rozd.groups.manage", "Create and edit permission groups"),
];

/// Everything behind the admission lock. A single mutex serializes
/// admission attempts so check-then-act sequences never interleave.
struct ServerCore {
    authority: PermissionAuthority,
    directory: AccountDirectory,
    admission: SessionAdmission,
    started: bool,
}

/// The rozd server instance
pub struct Server {
    config: Config,
    core: Mutex<ServerCore>,
}

impl Server {
    /// Create a new server instance. No state is loaded until
    /// [`Server::start`].
    pub fn new(config: Config) -> Self {
        let authority = PermissionAuthority::new(config.data_dir.join("permissions"));
        let directory = AccountDirectory::new(
            config.data_dir.join("accounts"),
            config.data_dir.join("permissions"),
            config.display_name_attempts,
        );
        let admission = SessionAdmission::new(
            BanList::new(&config.data_dir),
            Whitelist::new(&config.data_dir),
            config.whitelist,
            config.hash_time_window_secs,
        );

        Self {
            config,
            core: Mutex::new(ServerCore {
                authority,
                directory,
                admission,
                started: false,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a permission key. Only valid before [`Server::start`];
    /// the registry closes when the server starts.
    pub async fn register_permission(
        &self,
        key: &str,
        description: &str,
        registrar: &str,
    ) -> Result<(), PermissionError> {
        let mut core = self.core.lock().await;
        core.authority.register_permission(key, description, registrar)
    }

    /// Load persisted state and open for logins. Idempotent calls are
    /// rejected.
    pub async fn start(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        if core.started {
            anyhow::bail!("server already started");
        }

        for (key, description) in BUILTIN_PERMISSIONS {
            core.authority.register_permission(key, description, "rozd")?;
        }

        core.authority.load(&self.config.default_group).await?;
        // The authority may have kept a persisted default under a
        // different name; synthesized records must reference it
        let default_group = core
            .authority
            .default_group_name()
            .unwrap_or(&self.config.default_group)
            .to_string();
        let ServerCore {
            authority,
            directory,
            ..
        } = &mut *core;
        directory
            .load(authority.registry(), &default_group)
            .await?;
        core.admission.bans_mut().load().await?;
        core.admission.whitelist_mut().load().await?;

        if core.directory.get("server").is_none() {
            let group = core
                .authority
                .default_group_name()
                .unwrap_or(&self.config.default_group)
                .to_string();
            core.directory.index(Account::server(&group));
        }

        core.authority.close_registry();
        core.started = true;
        info!(
            "rozd started: {} accounts, {} groups, whitelist {}",
            core.directory.count() - 1,
            core.authority.group_count(),
            if self.config.whitelist { "on" } else { "off" }
        );
        Ok(())
    }

    /// Admit a login attempt. `attach` registers the client with the
    /// transport once credentials pass.
    pub async fn login<F>(&self, req: &LoginRequest, attach: F) -> ResultCode
    where
        F: FnOnce() -> Result<Arc<dyn SessionClient>>,
    {
        let mut core = self.core.lock().await;
        if !core.started {
            return ResultCode::InternalError;
        }
        let ServerCore {
            directory,
            admission,
            ..
        } = &mut *core;
        admission.handle_login(req, directory, Utc::now(), attach).await
    }

    /// Admit a signup attempt.
    pub async fn signup(&self, req: &SignupRequest) -> ResultCode {
        let mut core = self.core.lock().await;
        if !core.started {
            return ResultCode::InternalError;
        }
        let default_group = core
            .authority
            .default_group_name()
            .unwrap_or(&self.config.default_group)
            .to_string();
        let ServerCore {
            directory,
            admission,
            ..
        } = &mut *core;
        admission.handle_signup(req, directory, &default_group).await
    }

    /// Drop a session after the client went away.
    pub async fn logout(&self, username: &str) -> bool {
        let mut core = self.core.lock().await;
        let ServerCore {
            directory,
            admission,
            ..
        } = &mut *core;
        admission.remove_session(username, directory)
    }

    /// Force-disconnect a session.
    pub async fn kick(&self, username: &str, reason: &str) -> bool {
        let mut core = self.core.lock().await;
        let ServerCore {
            directory,
            admission,
            ..
        } = &mut *core;
        admission.evict(username, directory, reason)
    }

    /// Occupy a username with a bot session.
    pub async fn register_bot(
        &self,
        username: &str,
        client: Arc<dyn SessionClient>,
    ) -> ResultCode {
        let mut core = self.core.lock().await;
        core.admission.register_bot(username, client)
    }

    pub async fn is_online(&self, username: &str) -> bool {
        let core = self.core.lock().await;
        core.admission.get_session(username).is_some()
    }

    pub async fn session_count(&self) -> usize {
        let core = self.core.lock().await;
        core.admission.session_count()
    }

    /// Resolve a permission for an account: overrides first, then the
    /// account's group, then the default group.
    pub async fn has_permission(&self, username: &str, key: &str) -> bool {
        let core = self.core.lock().await;
        match core.directory.get(username) {
            Some(account) => account.has_permission(key, &core.authority),
            None => false,
        }
    }

    /// Set or clear a per-account override for a registered key.
    pub async fn set_override(
        &self,
        username: &str,
        key: &str,
        state: PermissionState,
    ) -> Result<()> {
        let mut core = self.core.lock().await;
        if !core.authority.registry().is_registered(key) {
            return Err(PermissionError::Unregistered(key.to_string()).into());
        }
        let Some(account) = core.directory.get_mut(username) else {
            return Err(DirectoryError::NotFound(username.to_string()).into());
        };
        account.set_override(key, state);
        core.directory.save_account(username).await;
        Ok(())
    }

    /// Move an account into an existing group.
    pub async fn set_account_group(&self, username: &str, group: &str) -> Result<()> {
        let mut core = self.core.lock().await;
        if core.authority.get_group(group).is_none() {
            return Err(PermissionError::UnknownGroup(group.to_string()).into());
        }
        let Some(account) = core.directory.get_mut(username) else {
            return Err(DirectoryError::NotFound(username.to_string()).into());
        };
        account.set_group(&naming::fold(group));
        core.directory.save_account(username).await;
        Ok(())
    }

    pub async fn create_group(&self, name: &str) -> Result<(), PermissionError> {
        let mut core = self.core.lock().await;
        core.authority.create_group(name)?;
        if let Err(e) = core.authority.save_group(name).await {
            tracing::warn!("Failed to persist group '{}': {}", name, e);
        }
        Ok(())
    }

    pub async fn add_group_permission(
        &self,
        group: &str,
        pattern: &str,
    ) -> Result<(), PermissionError> {
        let mut core = self.core.lock().await;
        core.authority.add_group_permission(group, pattern)?;
        if let Err(e) = core.authority.save_group(group).await {
            tracing::warn!("Failed to persist group '{}': {}", group, e);
        }
        Ok(())
    }

    pub async fn set_default_group(&self, name: &str) -> Result<(), PermissionError> {
        let mut core = self.core.lock().await;
        core.authority.set_default_group(name)?;
        core.authority.save().await;
        Ok(())
    }

    /// Rename a group and repoint every member account at the new name.
    pub async fn rename_group(&self, old: &str, new: &str) -> Result<(), PermissionError> {
        let mut core = self.core.lock().await;
        core.authority.rename_group(old, new).await?;
        let retargeted = core
            .directory
            .retarget_group(&naming::fold(old), &naming::fold(new));
        if retargeted > 0 {
            info!("Moved {} account(s) from group '{}' to '{}'", retargeted, old, new);
            core.directory.save_all().await;
        }
        Ok(())
    }

    pub async fn set_display_name(&self, username: &str, new_name: &str) -> Result<()> {
        let mut core = self.core.lock().await;
        core.directory.set_display_name(username, new_name).await?;
        Ok(())
    }

    /// Rename an account. Refused while a session holds the name.
    pub async fn rename_account(&self, old: &str, new: &str) -> Result<()> {
        let mut core = self.core.lock().await;
        if core.admission.get_session(old).is_some() {
            anyhow::bail!("account '{}' has a live session", old);
        }
        core.directory.rename_account(old, new).await?;
        Ok(())
    }

    /// Delete an account. Refused while a session holds the name.
    pub async fn delete_account(&self, username: &str) -> Result<bool> {
        let mut core = self.core.lock().await;
        if core.admission.get_session(username).is_some() {
            anyhow::bail!("account '{}' has a live session", username);
        }
        Ok(core.directory.delete_account(username).await)
    }

    /// Ban a username and evict any live session it holds.
    pub async fn ban_user(&self, username: &str) -> bool {
        let mut core = self.core.lock().await;
        let added = core.admission.bans_mut().ban_user(username);
        let ServerCore {
            directory,
            admission,
            ..
        } = &mut *core;
        admission.evict(username, directory, "banned");
        core.admission.bans().save().await;
        added
    }

    pub async fn unban_user(&self, username: &str) -> bool {
        let mut core = self.core.lock().await;
        let removed = core.admission.bans_mut().unban_user(username);
        core.admission.bans().save().await;
        removed
    }

    pub async fn ban_ip(&self, ip: IpAddr) -> bool {
        let mut core = self.core.lock().await;
        let added = core.admission.bans_mut().ban_ip(ip);
        core.admission.bans().save().await;
        added
    }

    pub async fn unban_ip(&self, ip: &IpAddr) -> bool {
        let mut core = self.core.lock().await;
        let removed = core.admission.bans_mut().unban_ip(ip);
        core.admission.bans().save().await;
        removed
    }

    pub async fn whitelist_add(&self, username: &str) -> bool {
        let mut core = self.core.lock().await;
        let added = core.admission.whitelist_mut().add(username);
        core.admission.whitelist().save().await;
        added
    }

    pub async fn whitelist_remove(&self, username: &str) -> bool {
        let mut core = self.core.lock().await;
        let removed = core.admission.whitelist_mut().remove(username);
        core.admission.whitelist().save().await;
        removed
    }

    /// Persist everything. Failures are logged and skipped; the
    /// in-memory state stays authoritative.
    pub async fn save_all(&self) {
        let core = self.core.lock().await;
        core.authority.save().await;
        core.directory.save_all().await;
        core.admission.bans().save().await;
        core.admission.whitelist().save().await;
    }
}
