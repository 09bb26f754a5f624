//! ECDSA P-256 keypairs, DID derivation, and canonical-envelope signing.
//!
//! Structurally mirrors `umbra-core::crypto::keys::KeyPair` /
//! `SigningKeyPair` (a `ZeroizeOnDrop` wrapper with `generate`/`from_bytes`/
//! `public_bytes` methods and a hex-serializable `PublicKey`), substituting
//! ECDSA P-256 (spec §4.1) for that teacher's Ed25519.

use crate::error::{NodeError, SignatureFailure};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

/// A node or user's long-term signing keypair. Private key material never
/// leaves process memory except in password-encrypted PKCS8 form.
#[derive(ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)] // SigningKey zeroizes its own scalar on drop.
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut rand_core::OsRng);
        KeyPair { signing_key }
    }

    /// Loads a keypair from unencrypted PKCS8 DER bytes (the output of
    /// `unlock()` in the identity store, spec §4.2).
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, NodeError> {
        let signing_key = SigningKey::from_pkcs8_der(der)
            .map_err(|e| NodeError::Internal(format!("bad pkcs8 key: {e}")))?;
        Ok(KeyPair { signing_key })
    }

    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, NodeError> {
        let doc = self
            .signing_key
            .to_pkcs8_der()
            .map_err(|e| NodeError::Internal(format!("pkcs8 encode failed: {e}")))?;
        Ok(doc.as_bytes().to_vec())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_verifying_key(self.signing_key.verifying_key())
    }

    /// Signs the canonical bytes of an envelope (or node-envelope body) with
    /// ECDSA/SHA-256, returning base64url-encoded fixed-size signature bytes.
    pub fn sign(&self, canonical_bytes: &[u8]) -> String {
        let signature: Signature = self.signing_key.sign(canonical_bytes);
        base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            signature.to_bytes(),
        )
    }
}

/// An ECDSA P-256 public key, serialized as base64 SPKI DER (spec §3 `publicKey`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    #[serde(with = "base64_spki")]
    spki_der: Vec<u8>,
}

impl PublicKey {
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let doc = key
            .to_public_key_der()
            .expect("P-256 public key SPKI encoding cannot fail");
        PublicKey {
            spki_der: doc.as_bytes().to_vec(),
        }
    }

    pub fn from_spki_base64(s: &str) -> Result<Self, NodeError> {
        let spki_der = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s)
            .map_err(|e| NodeError::Validation(format!("bad public key encoding: {e}")))?;
        // Validate it actually parses as a P-256 SPKI key.
        VerifyingKey::from_public_key_der(&spki_der)
            .map_err(|e| NodeError::Validation(format!("bad public key: {e}")))?;
        Ok(PublicKey { spki_der })
    }

    pub fn to_base64(&self) -> String {
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &self.spki_der)
    }

    fn verifying_key(&self) -> Result<VerifyingKey, NodeError> {
        VerifyingKey::from_public_key_der(&self.spki_der)
            .map_err(|e| NodeError::Internal(format!("bad stored public key: {e}")))
    }

    /// Verifies a base64url ECDSA signature over `canonical_bytes`.
    pub fn verify(&self, canonical_bytes: &[u8], sig_b64url: &str) -> Result<(), NodeError> {
        let sig_bytes = base64::Engine::decode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            sig_b64url,
        )
        .map_err(|_| NodeError::InvalidSignature(SignatureFailure::BadSignature))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|_| NodeError::InvalidSignature(SignatureFailure::BadSignature))?;
        let verifying_key = self.verifying_key()?;
        verifying_key
            .verify(canonical_bytes, &signature)
            .map_err(|_| NodeError::InvalidSignature(SignatureFailure::BadSignature))
    }

    /// `did:key:<base58btc(SPKI DER)>` — spec §3/GLOSSARY.
    pub fn to_did_key(&self) -> String {
        format!("did:key:{}", bs58::encode(&self.spki_der).into_string())
    }
}

mod base64_spki {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes);
        s.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &s)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_distinct_keypairs() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.public_key().to_base64(), b.public_key().to_base64());
    }

    #[test]
    fn pkcs8_round_trips() {
        let kp = KeyPair::generate();
        let der = kp.to_pkcs8_der().unwrap();
        let kp2 = KeyPair::from_pkcs8_der(&der).unwrap();
        assert_eq!(kp.public_key().to_base64(), kp2.public_key().to_base64());
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let kp = KeyPair::generate();
        let msg = b"canonical bytes";
        let sig = kp.sign(msg);
        kp.public_key().verify(msg, &sig).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"original");
        let err = kp.public_key().verify(b"tampered", &sig).unwrap_err();
        assert!(matches!(
            err,
            NodeError::InvalidSignature(SignatureFailure::BadSignature)
        ));
    }

    #[test]
    fn did_key_is_deterministic_for_same_public_key() {
        let kp = KeyPair::generate();
        let pk = kp.public_key();
        assert_eq!(pk.to_did_key(), pk.to_did_key());
        assert!(pk.to_did_key().starts_with("did:key:"));
    }
}
