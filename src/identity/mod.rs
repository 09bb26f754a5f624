//! Identity store (C2, spec §4.2): registration, authentication, and
//! in-memory private-key unlock. Grounded in the teacher's account-creation
//! flow in `umbra-core`, generalized from Ed25519/X25519 dual keypairs to a
//! single P-256 signing keypair plus a P-256-derived chat keypair, stored
//! password-encrypted via `crypto::kdf` + `crypto::symmetric`.

use base64::Engine as _;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::crypto::{kdf, symmetric, KeyPair};
use crate::db::models::User;
use crate::error::NodeError;

pub struct RegisterInput {
    pub handle: String,
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
}

fn validate_handle(handle: &str) -> Result<(), NodeError> {
    let ok = (3..=20).contains(&handle.len())
        && handle
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(NodeError::Validation(
            "handle must be 3-20 chars of [a-z0-9_]".into(),
        ))
    }
}

/// `salt_b64.hash_b64`, PBKDF2-HMAC-SHA256/100k over the password (spec §4.1).
fn hash_password(password: &str) -> String {
    let salt = kdf::random_salt();
    let hash = kdf::derive_private_key_wrap_key(password, &salt);
    format!(
        "{}.{}",
        base64::engine::general_purpose::STANDARD.encode(salt),
        base64::engine::general_purpose::STANDARD.encode(*hash)
    )
}

fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_b64, hash_b64)) = stored.split_once('.') else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (
        base64::engine::general_purpose::STANDARD.decode(salt_b64),
        base64::engine::general_purpose::STANDARD.decode(hash_b64),
    ) else {
        return false;
    };
    let actual = kdf::derive_private_key_wrap_key(password, &salt);
    actual.as_slice() == expected.as_slice()
}

/// `salt_b64.ciphertext_b64` where ciphertext is `nonce || AES-GCM(pkcs8_der)`
/// under a key derived from the password and salt (spec §4.1, §4.2).
fn encrypt_private_key(password: &str, pkcs8_der: &[u8]) -> Result<String, NodeError> {
    let salt = kdf::random_salt();
    let key = kdf::derive_private_key_wrap_key(password, &salt);
    let ciphertext = symmetric::encrypt(&key, pkcs8_der)?;
    Ok(format!(
        "{}.{}",
        base64::engine::general_purpose::STANDARD.encode(salt),
        base64::engine::general_purpose::STANDARD.encode(ciphertext)
    ))
}

fn decrypt_private_key(password: &str, stored: &str) -> Result<Vec<u8>, NodeError> {
    let (salt_b64, ciphertext_b64) = stored
        .split_once('.')
        .ok_or_else(|| NodeError::Internal("malformed encrypted private key".into()))?;
    let salt = base64::engine::general_purpose::STANDARD
        .decode(salt_b64)
        .map_err(|e| NodeError::Internal(e.to_string()))?;
    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(ciphertext_b64)
        .map_err(|e| NodeError::Internal(e.to_string()))?;
    let key = kdf::derive_private_key_wrap_key(password, &salt);
    symmetric::decrypt(&key, &ciphertext)
}

pub async fn register(pool: &SqlitePool, input: RegisterInput) -> Result<User, NodeError> {
    validate_handle(&input.handle)?;

    let existing_handle: Option<(String,)> =
        sqlx::query_as("SELECT id FROM users WHERE handle = ?")
            .bind(&input.handle)
            .fetch_optional(pool)
            .await?;
    if existing_handle.is_some() {
        return Err(NodeError::Validation("handle-taken".into()));
    }
    let existing_email: Option<(String,)> =
        sqlx::query_as("SELECT id FROM users WHERE email = ?")
            .bind(&input.email)
            .fetch_optional(pool)
            .await?;
    if existing_email.is_some() {
        return Err(NodeError::Validation("email-taken".into()));
    }

    let signing_keypair = KeyPair::generate();
    let public_key = signing_keypair.public_key();
    let did = public_key.to_did_key();
    let pkcs8 = signing_keypair.to_pkcs8_der()?;
    let private_key_encrypted = encrypt_private_key(&input.password, &pkcs8)?;

    let chat_keypair = KeyPair::generate();
    let chat_public_key = chat_keypair.public_key();
    let chat_pkcs8 = chat_keypair.to_pkcs8_der()?;
    let chat_private_key_encrypted = encrypt_private_key(&input.password, &chat_pkcs8)?;

    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let password_hash = hash_password(&input.password);

    sqlx::query(
        r#"INSERT INTO users
           (id, did, handle, email, public_key, private_key_encrypted, password_hash,
            chat_public_key, chat_private_key_encrypted, display_name, dm_privacy,
            is_suspended, is_silenced, is_bot, is_remote, node_domain, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'everyone', 0, 0, 0, 0, NULL, ?)"#,
    )
    .bind(&id)
    .bind(&did)
    .bind(&input.handle)
    .bind(&input.email)
    .bind(public_key.to_base64())
    .bind(&private_key_encrypted)
    .bind(&password_hash)
    .bind(chat_public_key.to_base64())
    .bind(&chat_private_key_encrypted)
    .bind(&input.display_name)
    .bind(now)
    .execute(pool)
    .await?;

    sqlx::query(
        r#"INSERT INTO handle_registry (handle, node_domain, did, updated_at)
           VALUES (?, '', ?, ?)
           ON CONFLICT (handle, node_domain) DO UPDATE SET did = excluded.did, updated_at = excluded.updated_at"#,
    )
    .bind(&input.handle)
    .bind(&did)
    .bind(now)
    .execute(pool)
    .await?;

    fetch_user_by_id(pool, &id).await
}

pub async fn authenticate(
    pool: &SqlitePool,
    email: &str,
    password: &str,
) -> Result<User, NodeError> {
    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?;
    let user = user.ok_or_else(|| NodeError::Validation("bad-credentials".into()))?;
    let Some(hash) = &user.password_hash else {
        return Err(NodeError::Validation("bad-credentials".into()));
    };
    if !verify_password(password, hash) {
        return Err(NodeError::Validation("bad-credentials".into()));
    }
    Ok(user)
}

/// Returns the decrypted PKCS8 private key bytes for in-memory use only
/// (spec §4.2 `unlock`, §9 private-key custody note).
pub fn unlock(user: &User, password: &str) -> Result<Vec<u8>, NodeError> {
    let stored = user
        .private_key_encrypted
        .as_deref()
        .ok_or_else(|| NodeError::Internal("user has no stored private key".into()))?;
    decrypt_private_key(password, stored)
}

async fn fetch_user_by_id(pool: &SqlitePool, id: &str) -> Result<User, NodeError> {
    sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(NodeError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_handle_rejects_bad_chars() {
        assert!(validate_handle("alice").is_ok());
        assert!(validate_handle("al").is_err());
        assert!(validate_handle("Alice").is_err());
        assert!(validate_handle("alice-cooper").is_err());
    }

    #[test]
    fn password_hash_round_trips() {
        let hash = hash_password("correct horse");
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn private_key_encryption_round_trips() {
        let kp = KeyPair::generate();
        let der = kp.to_pkcs8_der().unwrap();
        let stored = encrypt_private_key("pw", &der).unwrap();
        let decrypted = decrypt_private_key("pw", &stored).unwrap();
        assert_eq!(decrypted, der);
        assert!(decrypt_private_key("wrong-pw", &stored).is_err());
    }
}
