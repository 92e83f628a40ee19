//! Bcrypt hashes for account login passwords.

use anyhow::{Context, Result};
use bcrypt::{hash, verify, DEFAULT_COST};

/// Bcrypt cost used when the store is not configured otherwise.
pub const BCRYPT_COST: u32 = DEFAULT_COST;

/// Hashes a password on the blocking pool. The returned string carries its own salt
/// and cost.
pub async fn hash_password(password: &str, cost: u32) -> Result<String> {
    let password = password.to_owned();
    tokio::task::spawn_blocking(move || hash(password, cost))
        .await
        .context("password hashing task failed")?
        .context("failed to hash password")
}

/// Checks a password against a stored bcrypt hash on the blocking pool. Malformed
/// hashes are an error rather than a mismatch.
pub async fn verify_password(password: &str, encoded: &str) -> Result<bool> {
    let password = password.to_owned();
    let encoded = encoded.to_owned();
    tokio::task::spawn_blocking(move || verify(password, &encoded))
        .await
        .context("password verification task failed")?
        .context("stored password hash is malformed")
}
