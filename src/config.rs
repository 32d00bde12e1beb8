//! Proxy configuration
//!
//! Loaded from a TOML file: one `[server]` section plus one `[[accounts]]`
//! table per local user. Each account maps a local credential pair to an
//! upstream IMAP account and carries the folder visibility and writability
//! policy for that user.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:1143`.
    pub listen: String,
}

/// Per-account proxy policy.
///
/// `allowed_folders` and `blocked_folders` are mutually exclusive; at most
/// one of them may be non-empty. Every `writable_folders` entry must pass
/// the folder filter itself, which `Config::load` enforces.
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub local_user: String,
    pub local_password: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub remote_user: String,
    pub remote_password: String,
    #[serde(default)]
    pub remote_tls: bool,
    #[serde(default)]
    pub remote_starttls: bool,
    /// Skip upstream certificate verification (self-signed bridges).
    #[serde(default)]
    pub remote_tls_insecure: bool,
    #[serde(default)]
    pub allowed_folders: Vec<String>,
    #[serde(default)]
    pub blocked_folders: Vec<String>,
    #[serde(default)]
    pub writable_folders: Vec<String>,
}

impl Config {
    /// Load and validate a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file cannot be read, is not valid
    /// TOML, or fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse and validate config from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on parse or validation failure.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.local_user.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate local_user {:?}",
                    account.local_user
                )));
            }

            if account.remote_tls && account.remote_starttls {
                return Err(Error::Config(format!(
                    "account {:?}: remote_tls and remote_starttls cannot both be set",
                    account.local_user
                )));
            }

            if !account.allowed_folders.is_empty() && !account.blocked_folders.is_empty() {
                return Err(Error::Config(format!(
                    "account {:?}: allowed_folders and blocked_folders cannot both be set",
                    account.local_user
                )));
            }

            for writable in &account.writable_folders {
                if !account.folder_allowed(writable.as_bytes()) {
                    return Err(Error::Config(format!(
                        "account {:?}: writable folder {writable:?} is hidden by the folder filter",
                        account.local_user
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up an account by local username. Case-sensitive.
    #[must_use]
    pub fn lookup_user(&self, name: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.local_user == name)
    }
}

impl Account {
    /// Whether this account restricts folder visibility at all.
    #[must_use]
    pub fn has_folder_filter(&self) -> bool {
        !self.allowed_folders.is_empty() || !self.blocked_folders.is_empty()
    }

    /// Whether the named folder is visible to this account.
    #[must_use]
    pub fn folder_allowed(&self, name: &[u8]) -> bool {
        if !self.allowed_folders.is_empty() {
            return matches_any(name, &self.allowed_folders);
        }
        if !self.blocked_folders.is_empty() {
            return !matches_any(name, &self.blocked_folders);
        }
        true
    }

    /// Whether the named folder accepts writes for this account.
    #[must_use]
    pub fn folder_writable(&self, name: &[u8]) -> bool {
        matches_any(name, &self.writable_folders)
    }
}

fn matches_any(name: &[u8], entries: &[String]) -> bool {
    entries
        .iter()
        .any(|entry| folder_match(name, entry.as_bytes()))
}

/// A folder matches an entry when the normalized names are equal, or when
/// the folder sits below the entry in the hierarchy (`/` or `.` separator).
fn folder_match(name: &[u8], pattern: &[u8]) -> bool {
    let name = normalize_inbox(name);
    let pattern = normalize_inbox(pattern);
    if name == pattern {
        return true;
    }
    name.len() > pattern.len()
        && name.starts_with(&pattern[..])
        && (name[pattern.len()] == b'/' || name[pattern.len()] == b'.')
}

/// Case-fold a leading `INBOX` token. INBOX is case-insensitive in IMAP;
/// everything else compares byte-exact.
fn normalize_inbox(name: &[u8]) -> Vec<u8> {
    if name.len() >= 5
        && name[..5].eq_ignore_ascii_case(b"INBOX")
        && (name.len() == 5 || name[5] == b'/' || name[5] == b'.')
    {
        let mut out = Vec::with_capacity(name.len());
        out.extend_from_slice(b"INBOX");
        out.extend_from_slice(&name[5..]);
        return out;
    }
    name.to_vec()
}
