//! Credential to identity resolution
//!
//! Pure lookup over the current configuration snapshot: no I/O, no
//! locking beyond the snapshot pointer read the caller already did.
//! Credentials of invalid format are rejected before any map lookup.

use std::sync::Arc;

use crate::config::{ConfigSnapshot, TierPolicy, credential_preview};

/// Why a credential failed to resolve. All variants map to the
/// invalid-credential policy (401, abuse counter increment); the code
/// distinguishes them for clients and security logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("Missing API key. Please provide the credential header.")]
    Missing,

    #[error("Empty API key provided.")]
    Empty,

    #[error("Malformed API key format.")]
    Malformed,

    #[error("Invalid API key provided.")]
    Unknown,
}

impl CredentialError {
    pub fn code(&self) -> &'static str {
        match self {
            CredentialError::Missing => "MISSING_API_KEY",
            CredentialError::Empty => "EMPTY_API_KEY",
            CredentialError::Malformed => "MALFORMED_API_KEY",
            CredentialError::Unknown => "INVALID_API_KEY",
        }
    }
}

/// A resolved caller: user id plus the tier policy to enforce.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: String,
    pub tier: Arc<TierPolicy>,
}

/// Credential format rule: non-empty, 8-128 characters, printable ASCII.
fn is_valid_format(credential: &str) -> bool {
    if credential.len() < 8 || credential.len() > 128 {
        return false;
    }
    credential.chars().all(|c| c.is_ascii_graphic())
}

/// Resolve a credential against the snapshot.
pub fn resolve(
    snapshot: &ConfigSnapshot,
    credential: Option<&str>,
) -> Result<Identity, CredentialError> {
    let Some(credential) = credential else {
        return Err(CredentialError::Missing);
    };

    let credential = credential.trim();
    if credential.is_empty() {
        return Err(CredentialError::Empty);
    }

    if !is_valid_format(credential) {
        tracing::debug!(
            credential = %credential_preview(credential),
            "Credential failed format validation"
        );
        return Err(CredentialError::Malformed);
    }

    let Some(user_id) = snapshot.credential_user(credential) else {
        tracing::debug!(
            credential = %credential_preview(credential),
            "Credential not found"
        );
        return Err(CredentialError::Unknown);
    };

    // Snapshot validation guarantees the user and its tier exist; a miss
    // here means the snapshot invariant was broken.
    let tier_name = snapshot.user_tier(user_id).ok_or(CredentialError::Unknown)?;
    let tier = snapshot.tier(tier_name).ok_or(CredentialError::Unknown)?;

    Ok(Identity {
        user_id: user_id.to_string(),
        tier,
    })
}
