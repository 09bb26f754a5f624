//! Password-based key derivation (spec §4.1).
//!
//! Two derivations exist, at two different costs, for two different threats:
//!
//! ```text
//! password ──PBKDF2-HMAC-SHA256, 100_000 rounds, random 32B salt──▶ private-key-wrap key
//!                                                                    (protects the PKCS8
//!                                                                     private key at rest)
//!
//! session secret ──PBKDF2-HMAC-SHA256, 10_000 rounds, fixed salt──▶ session-key-wrap key
//!                                                                    (protects an in-memory
//!                                                                     key only for client-side
//!                                                                     durable persistence;
//!                                                                     deliberately cheaper,
//!                                                                     never touches a password)
//! ```
//!
//! The fixed salt on the second derivation is intentional: it wraps an
//! already-random session key, so a per-call salt buys nothing and would
//! only complicate unwrapping on reload.

use pbkdf2::pbkdf2_hmac;
use rand_core::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

pub const PRIMARY_ITERATIONS: u32 = 100_000;
pub const PRIMARY_SALT_LEN: usize = 32;
pub const SESSION_ITERATIONS: u32 = 10_000;
const SESSION_FIXED_SALT: &[u8] = b"synapsis-node-session-key-wrap-v1";

pub fn random_salt() -> [u8; PRIMARY_SALT_LEN] {
    let mut salt = [0u8; PRIMARY_SALT_LEN];
    rand_core::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derives the 32-byte AES-256-GCM key used to wrap a user's private key,
/// from their account password and a per-user random salt.
pub fn derive_private_key_wrap_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut out = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PRIMARY_ITERATIONS, out.as_mut());
    out
}

/// Derives the 32-byte key used to wrap a session key for client-side
/// durable persistence across page reloads (spec §9 "authenticated
/// in-process access without round-tripping the password").
pub fn derive_session_wrap_key(session_secret: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut out = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(session_secret, SESSION_FIXED_SALT, SESSION_ITERATIONS, out.as_mut());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_password_and_salt_derive_same_key() {
        let salt = random_salt();
        let a = derive_private_key_wrap_key("hunter2", &salt);
        let b = derive_private_key_wrap_key("hunter2", &salt);
        assert_eq!(*a, *b);
    }

    #[test]
    fn different_salt_derives_different_key() {
        let a = derive_private_key_wrap_key("hunter2", &random_salt());
        let b = derive_private_key_wrap_key("hunter2", &random_salt());
        assert_ne!(*a, *b);
    }

    #[test]
    fn session_wrap_key_is_deterministic() {
        let a = derive_session_wrap_key(b"some-session-secret");
        let b = derive_session_wrap_key(b"some-session-secret");
        assert_eq!(*a, *b);
    }
}
