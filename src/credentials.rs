/*!
 * Shrinking pool of call credentials.
 *
 * Credentials are drawn at random for every call. A credential named by a
 * quota-exhaustion signal is removed for the remainder of the run; once the
 * pool is empty every draw fails with `RunError::CredentialsExhausted`.
 */

use log::{info, warn};
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::app_config::CredentialsConfig;
use crate::errors::RunError;

/// Marker that comments out a line in a credential list
const COMMENT_MARKER: char = '#';

/// A single call credential (API key)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    key: String,
}

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// The raw key, for the request header only
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Short form safe to print in logs
    pub fn redacted(&self) -> String {
        let visible: String = self.key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
        format!("...{}", visible)
    }
}

// Keys never end up in logs through Debug
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.redacted())
    }
}

#[derive(Debug, Default)]
struct PoolState {
    available: Vec<Credential>,
    removed: HashSet<Credential>,
}

/// Thread-safe credential pool shared by all workers of a run
#[derive(Debug, Default)]
pub struct CredentialPool {
    state: Mutex<PoolState>,
}

impl CredentialPool {
    /// Create a pool from explicit credentials, dropping duplicates
    pub fn new(credentials: Vec<Credential>) -> Self {
        let mut seen = HashSet::new();
        let available = credentials
            .into_iter()
            .filter(|c| seen.insert(c.clone()))
            .collect();

        Self {
            state: Mutex::new(PoolState {
                available,
                removed: HashSet::new(),
            }),
        }
    }

    /// Parse a credential list: one key per line, blank lines and
    /// lines starting with `#` are ignored
    pub fn parse_list(text: &str) -> Vec<Credential> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with(COMMENT_MARKER))
            .map(Credential::new)
            .collect()
    }

    /// Build the pool from the configured environment variable and file
    pub fn from_config(
        config: &CredentialsConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, RunError> {
        let mut credentials = Vec::new();

        if let Some(value) = lookup(&config.env_var) {
            credentials.extend(Self::parse_list(&value));
        }

        if let Some(path) = &config.file {
            credentials.extend(Self::read_file(path)?);
        }

        let pool = Self::new(credentials);
        if pool.is_empty() {
            return Err(RunError::Config(format!(
                "No credentials found in ${} or the credentials file",
                config.env_var
            )));
        }

        info!("Loaded {} credential(s)", pool.len());
        Ok(pool)
    }

    fn read_file(path: &Path) -> Result<Vec<Credential>, RunError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RunError::Config(format!("Failed to read credentials file {:?}: {}", path, e)))?;
        Ok(Self::parse_list(&text))
    }

    /// Draw one credential uniformly at random
    pub fn draw(&self) -> Result<Credential, RunError> {
        let state = self.state.lock();
        state
            .available
            .choose(&mut rand::rng())
            .cloned()
            .ok_or(RunError::CredentialsExhausted)
    }

    /// Permanently remove a credential; returns how many remain.
    ///
    /// Removing an already removed credential is a no-op, so concurrent
    /// workers reporting the same exhaustion do not interfere.
    pub fn remove(&self, credential: &Credential) -> usize {
        let mut state = self.state.lock();
        let before = state.available.len();
        state.available.retain(|c| c != credential);

        if state.available.len() < before {
            state.removed.insert(credential.clone());
            warn!(
                "Quota exhausted for credential {}, removed from pool ({} remaining)",
                credential.redacted(),
                state.available.len()
            );
        }

        state.available.len()
    }

    pub fn is_removed(&self, credential: &Credential) -> bool {
        self.state.lock().removed.contains(credential)
    }

    pub fn len(&self) -> usize {
        self.state.lock().available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
