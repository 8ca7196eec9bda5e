//! Participant identities.
//!
//! An identity is a short name plus a randomly drawn `(color, emotion)` pair, e.g.
//! `alice-red-joy`. It is created once per working copy, stored in the git-ignored
//! `self.json`, and bound to the public keys published under its `full_id`.

use crate::core::error::BrainError;
use crate::core::workspace::Workspace;
use crate::plugins::keys;
use chrono::{DateTime, Utc};
use rand_core::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::sync::LazyLock;
use tracing::{info, warn};
use uuid::Uuid;

pub const SCHEMA_VERSION: u32 = 3;

pub const COLORS: [&str; 24] = [
    "red", "blue", "green", "gold", "purple", "orange", "cyan", "magenta", "coral", "teal",
    "indigo", "amber", "lime", "rose", "violet", "silver", "crimson", "azure", "emerald", "ruby",
    "sapphire", "jade", "onyx", "pearl",
];

pub const EMOTIONS: [&str; 24] = [
    "joy", "calm", "wonder", "spark", "glow", "peace", "bliss", "hope", "brave", "swift", "keen",
    "wise", "bold", "zen", "flow", "dream", "shine", "grace", "charm", "pride", "trust", "zeal",
    "muse", "awe",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub uuid: String,
    pub short_name: String,
    pub color: String,
    pub emotion: String,
    pub full_id: String,
    #[serde(default)]
    pub public_key_fingerprint: Option<String>,
    #[serde(default)]
    pub has_keys: bool,
    pub created_at: DateTime<Utc>,
    #[serde(alias = "version", default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys_rotated_at: Option<DateTime<Utc>>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Identity {
    /// A keyless identity with the given disambiguator.
    pub fn new(short_name: &str, color: &str, emotion: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            short_name: short_name.to_string(),
            color: color.to_string(),
            emotion: emotion.to_string(),
            full_id: full_id(short_name, color, emotion),
            public_key_fingerprint: None,
            has_keys: false,
            created_at,
            schema_version: SCHEMA_VERSION,
            keys_rotated_at: None,
        }
    }
}

pub fn full_id(short_name: &str, color: &str, emotion: &str) -> String {
    format!("{}-{}-{}", short_name, color, emotion)
}

static SHORT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]{1,23}$").unwrap());

/// Lower-case `raw` and check it is a usable short name.
pub fn validate_name(raw: &str) -> Result<String, BrainError> {
    let name = raw.trim().to_lowercase();
    if SHORT_NAME.is_match(&name) {
        Ok(name)
    } else {
        Err(BrainError::InvalidName(raw.to_string()))
    }
}

fn draw(rng: &mut dyn RngCore) -> (&'static str, &'static str) {
    let color = COLORS[(rng.next_u32() as usize) % COLORS.len()];
    let emotion = EMOTIONS[(rng.next_u32() as usize) % EMOTIONS.len()];
    (color, emotion)
}

/// `full_id`s already in use: published keys plus authors seen in the log.
fn taken_ids(ws: &Workspace) -> Result<HashSet<String>, BrainError> {
    let mut taken: HashSet<String> = ws.keys.known()?.into_iter().map(|(id, _)| id).collect();
    taken.extend(ws.log.backend().streams()?);
    Ok(taken)
}

/// Create this working copy's identity, generate and publish its keys, and persist it.
pub fn create(
    ws: &Workspace,
    short_name: &str,
    rng: &mut dyn RngCore,
) -> Result<Identity, BrainError> {
    let short_name = validate_name(short_name)?;
    if let Ok(existing) = current(ws) {
        return Err(BrainError::ValidationError(format!(
            "identity {} already exists",
            existing.full_id
        )));
    }

    let taken = taken_ids(ws)?;
    let attempts = ws.config.identity_max_draws;
    let mut identity = None;
    for _ in 0..attempts {
        let (color, emotion) = draw(rng);
        if !taken.contains(&full_id(&short_name, color, emotion)) {
            identity = Some(Identity::new(&short_name, color, emotion, ws.now()));
            break;
        }
    }
    let mut identity = identity.ok_or(BrainError::IdentityCollision {
        short_name: short_name.clone(),
        attempts,
    })?;

    match ws.keys.generate() {
        Ok(pair) => {
            let public_path = ws.keys.save(&identity.full_id, &pair)?;
            ws.stage(&[public_path])?;
            identity.public_key_fingerprint = Some(pair.fingerprint());
            identity.has_keys = true;
        }
        Err(BrainError::KeyGenerationFailure(reason)) => {
            warn!(full_id = %identity.full_id, %reason, "continuing without keys; signing disabled");
        }
        Err(e) => return Err(e),
    }

    save(ws, &identity)?;
    info!(full_id = %identity.full_id, has_keys = identity.has_keys, "identity created");
    Ok(identity)
}

fn save(ws: &Workspace, identity: &Identity) -> Result<(), BrainError> {
    fs::create_dir_all(&ws.paths.brain_dir)?;
    let json = serde_json::to_string_pretty(identity)?;
    keys::write_restricted(&ws.paths.self_file, &json)
}

/// This working copy's identity. Missing, corrupt or incomplete files are all `MissingIdentity`.
pub fn current(ws: &Workspace) -> Result<Identity, BrainError> {
    let content = match fs::read_to_string(&ws.paths.self_file) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BrainError::MissingIdentity);
        }
        Err(e) => return Err(e.into()),
    };
    let identity: Identity = match serde_json::from_str(&content) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, "identity file is unreadable");
            return Err(BrainError::MissingIdentity);
        }
    };
    if identity.short_name.is_empty() || identity.full_id.is_empty() {
        return Err(BrainError::MissingIdentity);
    }
    Ok(identity)
}

/// Newest published public key of `full_id`.
pub fn resolve(ws: &Workspace, full_id: &str) -> Result<String, BrainError> {
    ws.keys
        .public_keys(full_id)?
        .pop()
        .ok_or_else(|| BrainError::NotFound(format!("public key for {}", full_id)))
}

/// Replace the key pair, publish the new public key and record the rotation.
pub fn rotate_keys(ws: &Workspace, identity: &Identity) -> Result<Identity, BrainError> {
    let (pair, public_path) = ws.keys.rotate(&identity.full_id)?;
    ws.stage(&[public_path])?;
    let rotated = Identity {
        public_key_fingerprint: Some(pair.fingerprint()),
        has_keys: true,
        keys_rotated_at: Some(ws.now()),
        ..identity.clone()
    };
    save(ws, &rotated)?;
    Ok(rotated)
}
