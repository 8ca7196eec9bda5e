//! Protocol configuration and the on-disk layout derived from it.
//!
//! Every path and ref name the protocol touches comes from [`BrainConfig`]; nothing below
//! `core` hard-codes a location. The config is read from `.brain/config.toml` when present.

use crate::core::error::BrainError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_BRAIN_DIR: &str = ".brain";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrainConfig {
    /// Protocol state directory, relative to the repository root.
    pub brain_dir: String,
    pub remote: String,
    /// The ref whose tip counts as "the true current history" for claim staleness.
    pub sync_ref: String,
    pub participant_branch_prefix: String,
    /// Shared ref every participant fetches for announcements.
    pub announce_ref: String,
    /// Path of the announcement log inside the shared ref's tree.
    pub announce_file: String,
    pub receipt_max_age_hours: i64,
    pub claim_max_behind: u64,
    pub announce_max_attempts: usize,
    pub identity_max_draws: usize,
    pub gate: GateConfig,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            brain_dir: DEFAULT_BRAIN_DIR.to_string(),
            remote: "origin".to_string(),
            sync_ref: "origin/main".to_string(),
            participant_branch_prefix: "dev/".to_string(),
            announce_ref: "brain/events".to_string(),
            announce_file: ".brain/shared-events.jsonl".to_string(),
            receipt_max_age_hours: 24,
            claim_max_behind: 0,
            announce_max_attempts: 3,
            identity_max_draws: 16,
            gate: GateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    /// Globs for non-protocol content; a change set made only of these skips the gate.
    pub exempt_paths: Vec<String>,
    pub case_sensitive: bool,
    /// Environment variable that forces an (audited) allow when set to a non-empty value.
    pub bypass_env: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            exempt_paths: vec![
                "docs/**".to_string(),
                "*.md".to_string(),
                "**/*.md".to_string(),
            ],
            case_sensitive: true,
            bypass_env: "BRAIN_BYPASS_HOOK".to_string(),
        }
    }
}

impl BrainConfig {
    /// Load `<root>/<brain_dir>/config.toml`; a missing file yields the defaults.
    pub fn load(repo_root: &Path) -> Result<Self, BrainError> {
        let path = repo_root.join(DEFAULT_BRAIN_DIR).join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        let config: BrainConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), BrainError> {
        if self.announce_max_attempts == 0 {
            return Err(BrainError::ValidationError(
                "announce_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.identity_max_draws == 0 {
            return Err(BrainError::ValidationError(
                "identity_max_draws must be at least 1".to_string(),
            ));
        }
        if self.receipt_max_age_hours <= 0 {
            return Err(BrainError::ValidationError(
                "receipt_max_age_hours must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn receipt_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.receipt_max_age_hours)
    }
}

/// Absolute locations of protocol state inside one working copy.
#[derive(Debug, Clone)]
pub struct ProtocolPaths {
    pub repo_root: PathBuf,
    pub brain_dir: PathBuf,
    pub self_file: PathBuf,
    pub events_dir: PathBuf,
    pub private_keys_dir: PathBuf,
    pub public_keys_dir: PathBuf,
}

impl ProtocolPaths {
    pub fn new(repo_root: &Path, config: &BrainConfig) -> Self {
        let brain_dir = repo_root.join(&config.brain_dir);
        let keys_dir = brain_dir.join("keys");
        Self {
            repo_root: repo_root.to_path_buf(),
            self_file: brain_dir.join("self.json"),
            events_dir: brain_dir.join("events"),
            private_keys_dir: keys_dir.join("private"),
            public_keys_dir: keys_dir.join("public"),
            brain_dir,
        }
    }

    /// Repository-relative form of `path`, with `/` separators, for git pathspecs.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.repo_root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

/// Walk upward from `start_dir` to the first directory holding `.brain/` or `.git`.
pub fn find_repo_root(start_dir: &Path) -> Result<PathBuf, BrainError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(DEFAULT_BRAIN_DIR).is_dir() || current_dir.join(".git").exists() {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(BrainError::NotFound(
                "no '.brain' or '.git' directory in current or parent directories".to_string(),
            ));
        }
    }
}
