//! Deterministic per-user credential key ids.
//!
//! The key id is a pure function of `(identity, year, salt)`, so every
//! gateway instance derives the same id for the same user without shared
//! state, and ids rotate naturally at the turn of the calendar year. The
//! salt keeps ids unguessable by anyone who knows a user's email.

use sha2::{Digest, Sha256};

/// Prefix marking derived ids as API-key shaped for the credential service.
const KEY_PREFIX: &str = "sk-";

/// Derive the credential key id for `identity` in `year`.
///
/// The identity is normalized first so that casing and stray whitespace in
/// upstream claims never split one user across multiple credentials.
#[must_use]
pub fn derive_key_id(identity: &str, year: i32, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_identity(identity).as_bytes());
    hasher.update(year.to_string().as_bytes());
    hasher.update(salt.as_bytes());
    format!("{KEY_PREFIX}{}", hex::encode(hasher.finalize()))
}

/// Canonical form of an identity string: trimmed, ASCII-lowercased.
///
/// Azure AD treats UPNs case-insensitively, and different claim sources
/// disagree on casing for the same account.
#[must_use]
pub fn normalize_identity(identity: &str) -> String {
    identity.trim().to_ascii_lowercase()
}
