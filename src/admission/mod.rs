//! Session admission: the login/signup pipeline
//!
//! Checks run in a fixed order and the first failure terminates the
//! attempt with its result code:
//! 1. Ban sets (username, then source address)
//! 2. Whitelist, when enabled
//! 3. Challenge hash-time freshness (login only)
//! 4. Duplicate real session -> evicted, "replaced by new login"
//! 5. Bot occupancy -> `AccountNameTaken` (bots cannot be displaced)
//! 6. Credential check / account creation
//!
//! The caller serializes admission attempts; two attempts for the same
//! username must never interleave their check-then-act steps.

pub mod bans;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::accounts::directory::AccountDirectory;
use crate::naming;
use crate::ResultCode;

pub use bans::{BanList, Whitelist};

/// Transport-side handle for a connected client. The admission layer
/// only ever needs to force-disconnect it.
pub trait SessionClient: Send + Sync {
    fn disconnect(&self, reason: &str);
}

/// A live session occupying a username.
pub struct Session {
    pub username: String,
    pub display_name: String,
    /// Bot sessions hold a name without a real account behind it.
    pub bot: bool,
    pub client: Arc<dyn SessionClient>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("username", &self.username)
            .field("bot", &self.bot)
            .finish()
    }
}

/// Parsed login request, as delivered by the transport layer.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub submitted_hash: Vec<u8>,
    pub hash_time: i64,
    pub source: IpAddr,
}

/// Parsed signup request.
#[derive(Debug, Clone)]
pub struct SignupRequest {
    pub username: String,
    pub password_hash: [u8; 32],
    pub source: IpAddr,
}

/// Session table plus the admission gates in front of it
pub struct SessionAdmission {
    /// Folded username -> live session
    sessions: HashMap<String, Session>,
    /// Folded display name -> folded username
    by_display_name: HashMap<String, String>,
    bans: BanList,
    whitelist: Whitelist,
    whitelist_enabled: bool,
    hash_time_window_secs: i64,
}

impl SessionAdmission {
    pub fn new(
        bans: BanList,
        whitelist: Whitelist,
        whitelist_enabled: bool,
        hash_time_window_secs: i64,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            by_display_name: HashMap::new(),
            bans,
            whitelist,
            whitelist_enabled,
            hash_time_window_secs,
        }
    }

    pub fn bans(&self) -> &BanList {
        &self.bans
    }

    pub fn bans_mut(&mut self) -> &mut BanList {
        &mut self.bans
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn whitelist_mut(&mut self) -> &mut Whitelist {
        &mut self.whitelist
    }

    /// Run a login attempt through the pipeline. `attach` performs the
    /// transport-level client registration and only runs after the
    /// credential check passes; its failure yields `InternalError`.
    pub async fn handle_login<F>(
        &mut self,
        req: &LoginRequest,
        directory: &mut AccountDirectory,
        now: DateTime<Utc>,
        attach: F,
    ) -> ResultCode
    where
        F: FnOnce() -> anyhow::Result<Arc<dyn SessionClient>>,
    {
        let user = naming::fold(&req.username);

        if self.bans.is_banned(&user, &req.source) {
            return ResultCode::Banned;
        }
        if self.whitelist_enabled && !self.whitelist.contains(&user) {
            return ResultCode::NotOnWhitelist;
        }
        if !self.hash_time_fresh(req.hash_time, now) {
            return ResultCode::HashTimeInvalid;
        }

        match self.sessions.get(&user).map(|s| s.bot) {
            // Bots take precedence and cannot be displaced by a login
            Some(true) => return ResultCode::AccountNameTaken,
            // At most one session per account: the old one goes
            Some(false) => {
                info!("Evicting existing session for '{}'", req.username);
                self.evict(&user, directory, "replaced by new login");
            }
            None => {}
        }

        let Some(account) = directory.get_mut(&user) else {
            return ResultCode::IncorrectLogin;
        };
        // The server pseudo-account is never loggable-into
        if account.is_server() {
            return ResultCode::IncorrectLogin;
        }
        let code = account.log_in(&req.submitted_hash, req.hash_time);
        if code != ResultCode::NoError {
            return code;
        }

        let client = match attach() {
            Ok(client) => client,
            Err(e) => {
                // Credential success alone is not a completed login
                warn!("Client registration failed for '{}': {}", req.username, e);
                account.log_out();
                return ResultCode::InternalError;
            }
        };

        account.set_last_login_ip(req.source);
        let session = Session {
            username: account.username().to_string(),
            display_name: account.display_name().to_string(),
            bot: false,
            client,
        };
        info!("'{}' logged in from {}", session.username, req.source);

        self.by_display_name
            .insert(naming::fold(&session.display_name), user.clone());
        self.sessions.insert(user.clone(), session);
        directory.save_account(&user).await;

        ResultCode::NoError
    }

    /// Run a signup attempt through the pipeline.
    pub async fn handle_signup(
        &mut self,
        req: &SignupRequest,
        directory: &mut AccountDirectory,
        default_group: &str,
    ) -> ResultCode {
        let user = naming::fold(&req.username);

        if self.bans.is_banned(&user, &req.source) {
            return ResultCode::Banned;
        }
        if self.whitelist_enabled && !self.whitelist.contains(&user) {
            return ResultCode::NotOnWhitelist;
        }

        directory
            .create_account(&req.username, req.password_hash, req.source, default_group)
            .await
    }

    /// Occupy a username with a bot session. Bots and real sessions
    /// are mutually exclusive per username.
    pub fn register_bot(&mut self, username: &str, client: Arc<dyn SessionClient>) -> ResultCode {
        let user = naming::fold(username);
        if self.sessions.contains_key(&user) {
            return ResultCode::AccountNameTaken;
        }

        self.by_display_name.insert(user.clone(), user.clone());
        self.sessions.insert(
            user,
            Session {
                username: username.to_string(),
                display_name: username.to_string(),
                bot: true,
                client,
            },
        );
        ResultCode::NoError
    }

    /// Drop a session without disconnecting the transport (the client
    /// already went away). Returns whether one existed.
    pub fn remove_session(&mut self, username: &str, directory: &mut AccountDirectory) -> bool {
        let user = naming::fold(username);
        let Some(session) = self.sessions.remove(&user) else {
            return false;
        };
        self.by_display_name
            .remove(&naming::fold(&session.display_name));
        if !session.bot {
            if let Some(account) = directory.get_mut(&user) {
                account.log_out();
            }
        }
        info!("Session for '{}' ended", session.username);
        true
    }

    /// Force-disconnect and drop a session.
    pub fn evict(&mut self, username: &str, directory: &mut AccountDirectory, reason: &str) -> bool {
        let user = naming::fold(username);
        let Some(session) = self.sessions.get(&user) else {
            return false;
        };
        session.client.disconnect(reason);
        self.remove_session(&user, directory)
    }

    pub fn get_session(&self, username: &str) -> Option<&Session> {
        self.sessions.get(&naming::fold(username))
    }

    pub fn get_session_by_display_name(&self, display_name: &str) -> Option<&Session> {
        self.by_display_name
            .get(&naming::fold(display_name))
            .and_then(|user| self.sessions.get(user))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// `hash_time` is attacker-controlled; the difference must not be
    /// allowed to overflow.
    fn hash_time_fresh(&self, hash_time: i64, now: DateTime<Utc>) -> bool {
        let Some(delta) = now.timestamp().checked_sub(hash_time) else {
            return false;
        };
        delta.unsigned_abs() <= self.hash_time_window_secs.max(0) as u64
    }
}
