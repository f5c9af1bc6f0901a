//! Ban and whitelist sets
//!
//! Flat newline-delimited files under the data directory: banned
//! usernames, banned IP literals, and whitelisted usernames. Loaded
//! once at start-up and consulted read-only during admission; mutations
//! rewrite the file best-effort.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use tokio::fs;
use tracing::{info, warn};

use crate::naming;

pub const BANNED_USERS_FILE: &str = "banned-users.txt";
pub const BANNED_IPS_FILE: &str = "banned-ips.txt";
pub const WHITELIST_FILE: &str = "whitelist.txt";

/// Banned usernames and source addresses
#[derive(Debug, Default)]
pub struct BanList {
    users: HashSet<String>,
    ips: HashSet<IpAddr>,
    users_path: PathBuf,
    ips_path: PathBuf,
}

impl BanList {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            users: HashSet::new(),
            ips: HashSet::new(),
            users_path: data_dir.join(BANNED_USERS_FILE),
            ips_path: data_dir.join(BANNED_IPS_FILE),
        }
    }

    /// Read both ban files. Missing files mean empty sets.
    pub async fn load(&mut self) -> Result<()> {
        self.users = read_name_file(&self.users_path).await;

        self.ips.clear();
        for line in read_lines(&self.ips_path).await {
            match line.parse::<IpAddr>() {
                Ok(ip) => {
                    self.ips.insert(ip);
                }
                Err(_) => warn!("Skipping malformed banned IP entry '{}'", line),
            }
        }

        info!(
            "Loaded {} banned user(s) and {} banned IP(s)",
            self.users.len(),
            self.ips.len()
        );
        Ok(())
    }

    /// Whether this username or source address is banned.
    pub fn is_banned(&self, username: &str, source: &IpAddr) -> bool {
        self.users.contains(&naming::fold(username)) || self.ips.contains(source)
    }

    pub fn ban_user(&mut self, username: &str) -> bool {
        self.users.insert(naming::fold(username))
    }

    pub fn unban_user(&mut self, username: &str) -> bool {
        self.users.remove(&naming::fold(username))
    }

    pub fn ban_ip(&mut self, ip: IpAddr) -> bool {
        self.ips.insert(ip)
    }

    pub fn unban_ip(&mut self, ip: &IpAddr) -> bool {
        self.ips.remove(ip)
    }

    /// Rewrite both ban files, best-effort.
    pub async fn save(&self) {
        write_name_file(&self.users_path, self.users.iter().cloned()).await;
        write_name_file(&self.ips_path, self.ips.iter().map(|ip| ip.to_string())).await;
    }
}

/// Whitelisted usernames
#[derive(Debug, Default)]
pub struct Whitelist {
    names: HashSet<String>,
    path: PathBuf,
}

impl Whitelist {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            names: HashSet::new(),
            path: data_dir.join(WHITELIST_FILE),
        }
    }

    pub async fn load(&mut self) -> Result<()> {
        self.names = read_name_file(&self.path).await;
        info!("Loaded {} whitelisted name(s)", self.names.len());
        Ok(())
    }

    pub fn contains(&self, username: &str) -> bool {
        self.names.contains(&naming::fold(username))
    }

    pub fn add(&mut self, username: &str) -> bool {
        self.names.insert(naming::fold(username))
    }

    pub fn remove(&mut self, username: &str) -> bool {
        self.names.remove(&naming::fold(username))
    }

    pub async fn save(&self) {
        write_name_file(&self.path, self.names.iter().cloned()).await;
    }
}

async fn read_lines(path: &std::path::Path) -> Vec<String> {
    match fs::read_to_string(path).await {
        Ok(text) => text
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect(),
        Err(_) => Vec::new(),
    }
}

async fn read_name_file(path: &std::path::Path) -> HashSet<String> {
    read_lines(path)
        .await
        .into_iter()
        .map(|line| naming::fold(&line))
        .collect()
}

async fn write_name_file(path: &std::path::Path, entries: impl Iterator<Item = String>) {
    let mut lines: Vec<String> = entries.collect();
    lines.sort();
    let mut text = lines.join("\n");
    text.push('\n');
    if let Err(e) = fs::write(path, text).await {
        warn!("Failed to write {:?}: {}", path, e);
    }
}
