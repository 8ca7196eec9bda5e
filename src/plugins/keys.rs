//! Ed25519 key material for participants.
//!
//! Generation walks an ordered chain of [`KeyBackend`]s; the first one that is available and
//! succeeds wins. Private keys stay in the git-ignored private dir; public keys are
//! published write-once, one file per rotation.

use crate::core::config::ProtocolPaths;
use crate::core::error::BrainError;
use anyhow::{Context, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::pkcs8::spki::{DecodePublicKey, EncodePublicKey};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

const PEM_EXT: &str = "pem";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_pem: String,
    pub public_pem: String,
}

impl KeyPair {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_pem)
    }
}

/// One way of producing a key pair.
pub trait KeyBackend {
    fn name(&self) -> &'static str;
    fn is_available(&self) -> bool;
    fn generate(&self) -> anyhow::Result<KeyPair>;
}

/// In-process generation with ed25519-dalek.
pub struct DalekBackend;

impl KeyBackend for DalekBackend {
    fn name(&self) -> &'static str {
        "ed25519-dalek"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn generate(&self) -> anyhow::Result<KeyPair> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let private_pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| anyhow::anyhow!("encode private key: {}", e))?
            .to_string();
        let public_pem = signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| anyhow::anyhow!("encode public key: {}", e))?;
        Ok(KeyPair {
            private_pem,
            public_pem,
        })
    }
}

/// Generation through the `openssl` binary.
pub struct OpensslCliBackend;

impl OpensslCliBackend {
    fn run(args: &[&str], stdin: Option<&str>) -> anyhow::Result<String> {
        debug!(args = ?args, "openssl");
        let mut child = Command::new("openssl")
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn openssl")?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .context("write openssl stdin")?;
        }
        let output = child.wait_with_output().context("wait for openssl")?;
        if !output.status.success() {
            bail!(
                "openssl {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8(output.stdout)?)
    }
}

impl KeyBackend for OpensslCliBackend {
    fn name(&self) -> &'static str {
        "openssl-cli"
    }

    fn is_available(&self) -> bool {
        Command::new("openssl")
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn generate(&self) -> anyhow::Result<KeyPair> {
        let private_pem = Self::run(&["genpkey", "-algorithm", "Ed25519"], None)?;
        let public_pem = Self::run(&["pkey", "-pubout"], Some(&private_pem))?;
        if !private_pem.contains("PRIVATE KEY") || !public_pem.contains("PUBLIC KEY") {
            bail!("openssl produced unexpected output");
        }
        Ok(KeyPair {
            private_pem,
            public_pem,
        })
    }
}

pub struct KeyStore {
    private_dir: PathBuf,
    public_dir: PathBuf,
    backends: Vec<Box<dyn KeyBackend>>,
}

impl KeyStore {
    pub fn new(paths: &ProtocolPaths) -> Self {
        Self::with_backends(
            paths,
            vec![Box::new(DalekBackend), Box::new(OpensslCliBackend)],
        )
    }

    pub fn with_backends(paths: &ProtocolPaths, backends: Vec<Box<dyn KeyBackend>>) -> Self {
        Self {
            private_dir: paths.private_keys_dir.clone(),
            public_dir: paths.public_keys_dir.clone(),
            backends,
        }
    }

    pub fn public_dir(&self) -> &Path {
        &self.public_dir
    }

    pub fn generate(&self) -> Result<KeyPair, BrainError> {
        let mut failures = Vec::new();
        for backend in &self.backends {
            if !backend.is_available() {
                failures.push(format!("{}: unavailable", backend.name()));
                continue;
            }
            match backend.generate() {
                Ok(pair) => {
                    debug!(backend = backend.name(), "generated key pair");
                    return Ok(pair);
                }
                Err(e) => failures.push(format!("{}: {:#}", backend.name(), e)),
            }
        }
        if failures.is_empty() {
            failures.push("no backends configured".to_string());
        }
        Err(BrainError::KeyGenerationFailure(failures.join("; ")))
    }

    pub fn private_path(&self, full_id: &str) -> PathBuf {
        self.private_dir.join(format!("{}.{}", full_id, PEM_EXT))
    }

    fn public_path(&self, full_id: &str, version: u32) -> PathBuf {
        if version <= 1 {
            self.public_dir.join(format!("{}.{}", full_id, PEM_EXT))
        } else {
            self.public_dir
                .join(format!("{}.{}.{}", full_id, version, PEM_EXT))
        }
    }

    /// Store the private key and publish the first public key. Returns the public key path.
    pub fn save(&self, full_id: &str, pair: &KeyPair) -> Result<PathBuf, BrainError> {
        self.write_private(full_id, &pair.private_pem)?;
        let path = self.public_path(full_id, 1);
        publish_once(&path, &pair.public_pem)?;
        Ok(path)
    }

    /// Replace the private key and publish the next public key version.
    pub fn rotate(&self, full_id: &str) -> Result<(KeyPair, PathBuf), BrainError> {
        let pair = self.generate()?;
        let next = self.versions(full_id)?.last().map(|(v, _)| v + 1).unwrap_or(1);
        let path = self.public_path(full_id, next);
        publish_once(&path, &pair.public_pem)?;
        self.write_private(full_id, &pair.private_pem)?;
        Ok((pair, path))
    }

    fn write_private(&self, full_id: &str, pem: &str) -> Result<(), BrainError> {
        fs::create_dir_all(&self.private_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.private_dir, fs::Permissions::from_mode(0o700))?;
        }
        write_restricted(&self.private_path(full_id), pem)
    }

    pub fn load_private(&self, full_id: &str) -> Result<Option<String>, BrainError> {
        let path = self.private_path(full_id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    fn versions(&self, full_id: &str) -> Result<Vec<(u32, PathBuf)>, BrainError> {
        if !self.public_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.public_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((id, version)) = parse_public_name(name)
                && id == full_id
            {
                versions.push((version, path));
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Every published public key of `full_id`, oldest first.
    pub fn public_keys(&self, full_id: &str) -> Result<Vec<String>, BrainError> {
        self.versions(full_id)?
            .into_iter()
            .map(|(_, path)| fs::read_to_string(path).map_err(BrainError::from))
            .collect()
    }

    /// `(full_id, fingerprint of newest key)` for every published identity.
    pub fn known(&self) -> Result<Vec<(String, String)>, BrainError> {
        if !self.public_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = Vec::new();
        for entry in fs::read_dir(&self.public_dir)? {
            let path = entry?.path();
            if let Some((id, _)) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_public_name)
                && !ids.contains(&id)
            {
                ids.push(id);
            }
        }
        ids.sort();
        let mut known = Vec::new();
        for id in ids {
            if let Some(pem) = self.public_keys(&id)?.last() {
                known.push((id.clone(), fingerprint(pem)));
            }
        }
        Ok(known)
    }
}

/// `alice-red-joy.pem` is version 1, `alice-red-joy.3.pem` version 3.
fn parse_public_name(name: &str) -> Option<(String, u32)> {
    let stem = name.strip_suffix(".pem")?;
    match stem.split_once('.') {
        None => Some((stem.to_string(), 1)),
        Some((id, version)) => version.parse::<u32>().ok().map(|v| (id.to_string(), v)),
    }
}

fn publish_once(path: &Path, pem: &str) -> Result<(), BrainError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if fs::read_to_string(path)? == pem {
                return Ok(());
            }
            return Err(BrainError::InvalidKey(format!(
                "public key {} is already published",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    file.write_all(pem.as_bytes())?;
    Ok(())
}

pub(crate) fn write_restricted(path: &Path, content: &str) -> Result<(), BrainError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// First 16 characters of base64(SHA-256(pem)).
pub fn fingerprint(public_pem: &str) -> String {
    let digest = Sha256::digest(public_pem.as_bytes());
    BASE64.encode(digest).chars().take(16).collect()
}

pub fn sign(private_pem: &str, message: &[u8]) -> Result<String, BrainError> {
    let key = SigningKey::from_pkcs8_pem(private_pem)
        .map_err(|e| BrainError::InvalidKey(format!("private key: {}", e)))?;
    Ok(BASE64.encode(key.sign(message).to_bytes()))
}

/// True iff `signature_b64` is a valid signature of `message` under `public_pem`.
pub fn verify(public_pem: &str, message: &[u8], signature_b64: &str) -> bool {
    let Ok(key) = VerifyingKey::from_public_key_pem(public_pem) else {
        return false;
    };
    let Ok(bytes) = BASE64.decode(signature_b64.trim()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&bytes) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}
