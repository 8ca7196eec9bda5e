use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrainError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(#[from] toml::de::Error),
    #[error("git {command} failed: {stderr}")]
    GitError { command: String, stderr: String },
    #[error("No identity found. Run: brain init --name YOUR_NAME")]
    MissingIdentity,
    #[error("Invalid name '{0}'. Use 2-24 chars, start with a letter, only a-z 0-9 - _")]
    InvalidName(String),
    #[error("Could not allocate a unique identity for '{short_name}' after {attempts} draws")]
    IdentityCollision { short_name: String, attempts: usize },
    #[error("Key generation failed: {0}")]
    KeyGenerationFailure(String),
    #[error("Invalid key material: {0}")]
    InvalidKey(String),
    #[error(
        "Stale sync: HEAD {head} is {behind} commit(s) behind {tip} (max {max_behind}). Run: brain sync && git merge {tip}"
    )]
    StaleSync {
        head: String,
        tip: String,
        behind: u64,
        max_behind: u64,
    },
    #[error("{caller} does not hold an active claim on {resource}{}", holder_suffix(.holder))]
    NotClaimHolder {
        resource: String,
        caller: String,
        holder: Option<String>,
    },
    #[error("{resource} is already claimed by {holder}")]
    ResourceHeld { resource: String, holder: String },
    #[error("No read receipts found. Run: brain receipt")]
    MissingReceipt,
    #[error("Read receipt is too old ({age_hours}h, max {max_age_hours}h). Run: brain receipt")]
    StaleReceipt { age_hours: i64, max_age_hours: i64 },
    #[error("Announcement push rejected {attempts} time(s); giving up")]
    AnnouncePushExhausted { attempts: usize },
    #[error("Unresolved merge conflicts in: {}", .0.join(", "))]
    MergeConflict(Vec<String>),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

fn holder_suffix(holder: &Option<String>) -> String {
    match holder {
        Some(h) => format!(" (held by {})", h),
        None => String::new(),
    }
}
