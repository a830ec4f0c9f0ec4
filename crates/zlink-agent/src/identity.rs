//! Local identity key file.
//!
//! The file holds the hex-encoded 32-byte Ed25519 secret on one line and is
//! created with owner-only permissions on first use.

use std::fs;
use std::io::Write;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use zeroize::Zeroizing;

use zlink_security::{Ed25519Signer, SecurityError, Signer};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("key file io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key file {path} is invalid: {source}")]
    InvalidKey {
        path: String,
        #[source]
        source: SecurityError,
    },
}

/// Load the signer stored at `path`, or create and store a new one.
/// Returns the signer and whether it was just created.
pub fn load_or_create(path: &Path) -> Result<(Ed25519Signer, bool), IdentityError> {
    if let Some(signer) = load(path)? {
        return Ok((signer, false));
    }
    let signer = Ed25519Signer::generate();
    store(path, &signer)?;
    info!(identity = %signer.identity(), path = %path.display(), "created identity");
    Ok((signer, true))
}

/// Load the signer stored at `path`, if the file exists.
pub fn load(path: &Path) -> Result<Option<Ed25519Signer>, IdentityError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = Zeroizing::new(fs::read_to_string(path)?);
    let signer = Ed25519Signer::from_secret_hex(content.trim()).map_err(|source| IdentityError::InvalidKey {
        path: path.display().to_string(),
        source,
    })?;
    Ok(Some(signer))
}

fn store(path: &Path, signer: &Ed25519Signer) -> Result<(), IdentityError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let secret = Zeroizing::new(hex::encode(signer.secret_bytes()));

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(secret.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    Ok(())
}
