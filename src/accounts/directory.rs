//! Account directory
//!
//! Creates, loads, renames, and deletes accounts, and enforces the
//! case-insensitive uniqueness of usernames and display names. The
//! in-memory table is authoritative; record writes are best-effort and
//! logged on failure.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use super::{Account, AccountRecord, OverrideRecord};
use crate::naming;
use crate::permissions::PermissionRegistry;
use crate::ResultCode;

/// Directory errors
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("account not found: '{0}'")]
    NotFound(String),

    #[error("invalid account name: '{0}'")]
    InvalidName(String),

    #[error("name already in use: '{0}'")]
    NameInUse(String),
}

/// Account table and its on-disk filing
#[derive(Debug)]
pub struct AccountDirectory {
    /// Folded username -> account
    accounts: HashMap<String, Account>,
    /// Folded display name -> folded username
    display_names: HashMap<String, String>,
    accounts_dir: PathBuf,
    perm_dir: PathBuf,
    /// How many `_` suffixes to try on a display-name collision
    display_name_attempts: u32,
}

impl AccountDirectory {
    pub fn new(accounts_dir: PathBuf, perm_dir: PathBuf, display_name_attempts: u32) -> Self {
        Self {
            accounts: HashMap::new(),
            display_names: HashMap::new(),
            accounts_dir,
            perm_dir,
            display_name_attempts,
        }
    }

    /// Load all persisted accounts. Records that fail to parse are
    /// skipped with a warning; an account without an override record
    /// gets a default one referencing `default_group`.
    pub async fn load(&mut self, registry: &PermissionRegistry, default_group: &str) -> Result<()> {
        fs::create_dir_all(&self.accounts_dir).await?;
        fs::create_dir_all(&self.perm_dir).await?;

        let mut dir = fs::read_dir(&self.accounts_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }

            let record: AccountRecord = match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Failed to parse account file {:?}: {}", path, e);
                        continue;
                    }
                },
                Err(e) => {
                    warn!("Failed to read account file {:?}: {}", path, e);
                    continue;
                }
            };

            let folded = naming::fold(&record.username);
            let overrides = match self.read_override_record(&folded).await {
                Some(overrides) => overrides,
                None => {
                    // First sight of this account since its group file
                    // conventions changed; synthesize the default record.
                    let overrides = OverrideRecord {
                        name: record.username.clone(),
                        group: default_group.to_string(),
                        granted: Vec::new(),
                        denied: Vec::new(),
                        prefix: String::new(),
                        suffix: String::new(),
                        colour: String::new(),
                    };
                    if let Err(e) = self.write_override_record(&folded, &overrides).await {
                        warn!(
                            "Failed to create default permission record for '{}': {}",
                            record.username, e
                        );
                    }
                    overrides
                }
            };

            match Account::from_records(record, overrides, registry) {
                Ok(account) => self.index(account),
                Err(e) => warn!("Skipping account file {:?}: {}", path, e),
            }
        }

        info!("Loaded {} account(s)", self.accounts.len());
        Ok(())
    }

    /// Create and persist a new account, resolving display-name
    /// collisions by appending underscores up to the attempt budget.
    pub async fn create_account(
        &mut self,
        username: &str,
        password_hash: [u8; 32],
        creation_ip: IpAddr,
        default_group: &str,
    ) -> ResultCode {
        if !naming::valid_name(username) {
            return ResultCode::AccountNameInvalid;
        }
        if self.accounts.contains_key(&naming::fold(username)) {
            return ResultCode::AccountNameTaken;
        }

        let mut display_name = username.to_string();
        let mut attempt = 0;
        while self.display_name_taken(&display_name) {
            if attempt >= self.display_name_attempts {
                warn!(
                    "Gave up resolving a display name for '{}' after {} attempts",
                    username, attempt
                );
                return ResultCode::InternalError;
            }
            display_name.push('_');
            attempt += 1;
        }

        let account = Account::new(username, &display_name, password_hash, creation_ip, default_group);
        if let Err(e) = self.write_account(&account).await {
            warn!("Failed to persist new account '{}': {}", username, e);
        }
        info!("Created account '{}' (display '{}')", username, display_name);
        self.index(account);

        ResultCode::NoError
    }

    pub fn get(&self, username: &str) -> Option<&Account> {
        self.accounts.get(&naming::fold(username))
    }

    pub fn get_mut(&mut self, username: &str) -> Option<&mut Account> {
        self.accounts.get_mut(&naming::fold(username))
    }

    pub fn get_by_display_name(&self, display_name: &str) -> Option<&Account> {
        self.display_names
            .get(&naming::fold(display_name))
            .and_then(|username| self.accounts.get(username))
    }

    pub fn contains(&self, username: &str) -> bool {
        self.accounts.contains_key(&naming::fold(username))
    }

    pub fn display_name_taken(&self, display_name: &str) -> bool {
        self.display_names.contains_key(&naming::fold(display_name))
    }

    pub fn count(&self) -> usize {
        self.accounts.len()
    }

    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.accounts.keys().map(|k| k.as_str())
    }

    /// Change an account's display name. Triggers a storage rename;
    /// I/O failures are logged, the in-memory change stands.
    pub async fn set_display_name(
        &mut self,
        username: &str,
        new_name: &str,
    ) -> Result<(), DirectoryError> {
        if !naming::valid_name(new_name) {
            return Err(DirectoryError::InvalidName(new_name.to_string()));
        }

        let folded_user = naming::fold(username);
        let folded_new = naming::fold(new_name);

        if let Some(owner) = self.display_names.get(&folded_new) {
            if *owner != folded_user {
                return Err(DirectoryError::NameInUse(new_name.to_string()));
            }
        }
        let Some(account) = self.accounts.get_mut(&folded_user) else {
            return Err(DirectoryError::NotFound(username.to_string()));
        };

        let old_fqn = account.fqn();
        let old_display = naming::fold(account.display_name());
        account.set_display_name(new_name);
        self.display_names.remove(&old_display);
        self.display_names.insert(folded_new, folded_user.clone());

        let old_path = self.accounts_dir.join(format!("{}.json", old_fqn));
        if let Err(e) = fs::remove_file(&old_path).await {
            warn!("Failed to remove old account file {:?}: {}", old_path, e);
        }
        self.save_account(&folded_user).await;
        Ok(())
    }

    /// Rename an account's immutable key. Only permitted while no
    /// session is live for it; the server layer enforces that and this
    /// re-keys the table and the files.
    pub async fn rename_account(&mut self, old: &str, new: &str) -> Result<(), DirectoryError> {
        if !naming::valid_name(new) {
            return Err(DirectoryError::InvalidName(new.to_string()));
        }

        let old_key = naming::fold(old);
        let new_key = naming::fold(new);
        if old_key != new_key && self.accounts.contains_key(&new_key) {
            return Err(DirectoryError::NameInUse(new.to_string()));
        }
        let Some(mut account) = self.accounts.remove(&old_key) else {
            return Err(DirectoryError::NotFound(old.to_string()));
        };

        let old_fqn = account.fqn();
        account.set_username(new);
        let display = naming::fold(account.display_name());
        self.display_names.insert(display, new_key.clone());
        self.accounts.insert(new_key.clone(), account);

        self.remove_files(&old_key, &old_fqn).await;
        self.save_account(&new_key).await;
        Ok(())
    }

    /// Delete an account and its records. Returns whether it existed.
    pub async fn delete_account(&mut self, username: &str) -> bool {
        let folded = naming::fold(username);
        let Some(account) = self.accounts.remove(&folded) else {
            return false;
        };

        self.display_names
            .remove(&naming::fold(account.display_name()));
        self.remove_files(&folded, &account.fqn()).await;
        info!("Deleted account '{}'", account.username());
        true
    }

    /// Persist one account, best-effort.
    pub async fn save_account(&self, username: &str) {
        let folded = naming::fold(username);
        let Some(account) = self.accounts.get(&folded) else {
            return;
        };
        if let Err(e) = self.write_account(account).await {
            warn!("Unable to save account '{}': {}", account.username(), e);
        }
    }

    /// Persist every account, best-effort, skipping the server
    /// pseudo-account.
    pub async fn save_all(&self) {
        for account in self.accounts.values() {
            if account.is_server() {
                continue;
            }
            if let Err(e) = self.write_account(account).await {
                warn!("Unable to save account '{}': {}", account.username(), e);
            }
        }
    }

    /// Register an account built elsewhere (the server pseudo-account).
    pub(crate) fn index(&mut self, account: Account) {
        let folded = naming::fold(account.username());
        self.display_names
            .insert(naming::fold(account.display_name()), folded.clone());
        self.accounts.insert(folded, account);
    }

    /// Point accounts at a group's new folded name after a rename.
    /// Returns how many accounts moved.
    pub(crate) fn retarget_group(&mut self, old: &str, new: &str) -> usize {
        let mut moved = 0;
        for account in self.accounts.values_mut() {
            if account.group() == old {
                account.set_group(new);
                moved += 1;
            }
        }
        moved
    }

    async fn write_account(&self, account: &Account) -> Result<()> {
        if account.is_server() {
            return Ok(());
        }

        let bytes = serde_json::to_vec_pretty(&account.to_record())?;
        fs::write(
            self.accounts_dir.join(format!("{}.json", account.fqn())),
            bytes,
        )
        .await?;

        self.write_override_record(
            &naming::fold(account.username()),
            &account.to_override_record(),
        )
        .await
    }

    async fn write_override_record(&self, folded_user: &str, record: &OverrideRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        fs::write(self.override_path(folded_user), bytes).await?;
        Ok(())
    }

    async fn read_override_record(&self, folded_user: &str) -> Option<OverrideRecord> {
        let path = self.override_path(folded_user);
        let bytes = fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Failed to parse permission record {:?}: {}", path, e);
                None
            }
        }
    }

    fn override_path(&self, folded_user: &str) -> PathBuf {
        self.perm_dir.join(format!("player-{}.json", folded_user))
    }

    async fn remove_files(&self, folded_user: &str, fqn: &str) {
        let account_path = self.accounts_dir.join(format!("{}.json", fqn));
        if let Err(e) = fs::remove_file(&account_path).await {
            warn!("Failed to remove account file {:?}: {}", account_path, e);
        }
        let override_path = self.override_path(folded_user);
        if let Err(e) = fs::remove_file(&override_path).await {
            warn!("Failed to remove permission record {:?}: {}", override_path, e);
        }
    }
}
