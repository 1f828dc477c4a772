//! Ed25519 verification over canonical job-spec bytes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use beacon_protocol::canonical::signed_payload;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Signature verification failures. All variants surface to the client as
/// the `signature` error kind.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("public key is not valid base64")]
    PublicKeyEncoding,

    #[error("public key is not a valid Ed25519 key")]
    PublicKeyInvalid,

    #[error("signature is not valid base64")]
    SignatureEncoding,

    #[error("signature has wrong length")]
    SignatureLength,

    #[error("signature verification failed")]
    VerificationFailed,

    #[error("payload cannot be canonicalized: {0}")]
    Canonical(#[from] beacon_protocol::CanonicalError),
}

/// Verify the spec's Ed25519 signature.
///
/// The verified bytes are the canonical JSON of `spec` with the top-level
/// `id`, `signature`, and `public_key` fields removed.
pub fn verify_spec_signature(
    spec: &Value,
    signature_b64: &str,
    public_key_b64: &str,
) -> Result<(), SignatureError> {
    let key_bytes = BASE64
        .decode(public_key_b64)
        .map_err(|_| SignatureError::PublicKeyEncoding)?;
    let key_bytes: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| SignatureError::PublicKeyInvalid)?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| SignatureError::PublicKeyInvalid)?;

    let sig_bytes = BASE64
        .decode(signature_b64)
        .map_err(|_| SignatureError::SignatureEncoding)?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| SignatureError::SignatureLength)?;
    let signature = Signature::from_bytes(&sig_bytes);

    let payload = signed_payload(spec)?;
    key.verify(&payload, &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Sign a spec the way submitting clients do. Used by client tooling
/// and tests.
pub fn sign_payload(spec: &Value, key: &SigningKey) -> Result<String, SignatureError> {
    let payload = signed_payload(spec)?;
    let signature = key.sign(&payload);
    Ok(BASE64.encode(signature.to_bytes()))
}

/// Stable key id: the first 16 hex chars of SHA-256 over the raw key bytes.
/// Falls back to hashing the base64 text when it does not decode, so rate
/// limiting still gets a usable bucket for garbage keys.
pub fn key_id(public_key_b64: &str) -> String {
    let bytes = BASE64
        .decode(public_key_b64)
        .unwrap_or_else(|_| public_key_b64.as_bytes().to_vec());
    let digest = Sha256::digest(&bytes);
    hex::encode(&digest[..8])
}
