//! Merkle-chained transparency log.
//!
//! Receipts append into a binary SHA-256 Merkle tree chained by
//! previous-root. Every append yields an inclusion proof; verification
//! recomputes the root from the leaf and its ordered siblings. Appends are
//! serialized behind one writer; ingestion is a bounded queue so callers
//! never block on the log.

pub mod log;
pub mod merkle;

pub use log::{
    spawn_writer, transparency_channel, Emitter, NoopEmitter, PendingEntry, TransparencyLog,
    TransparencySink,
};
pub use merkle::{leaf_hash, verify_proof, MerkleTree};
