//! Admission-control cryptography for the Beacon runner.
//!
//! Signature verification over canonical JSON, the trusted-key allowlist,
//! the bypass policy, and the signature-failure rate limiter. Replay nonces
//! live in the key-value repository; this crate only decides what counts as
//! a valid signature and who is allowed to present one.

pub mod keys;
pub mod ratelimit;
pub mod signing;

pub use keys::{KeyTrust, TrustedKeyEntry, TrustedKeys};
pub use ratelimit::{FailureRateLimiter, SlidingWindow};
pub use signing::{key_id, sign_payload, verify_spec_signature, SignatureError};
