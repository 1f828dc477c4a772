//! The chained log writer and its ingestion queue.

use crate::merkle::{leaf_hash, MerkleTree};
use beacon_db::{DbError, TransparencyRepo, TransparencyRow};
use beacon_protocol::http_types::{ProofResponse, ProofStep};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Event name published on every append.
pub const ENTRY_APPENDED: &str = "transparency.entry_appended";

/// Broadcast capability. The runner installs its WebSocket hub; the
/// default is a no-op so the log is usable standalone and in tests.
pub trait Emitter: Send + Sync {
    fn emit(&self, event: &str, data: serde_json::Value);
}

pub struct NoopEmitter;

impl Emitter for NoopEmitter {
    fn emit(&self, _event: &str, _data: serde_json::Value) {}
}

/// A receipt waiting to be appended.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub execution_id: i64,
    pub job_id: String,
    pub region: String,
    pub provider_id: String,
    pub status: String,
    pub output_hash: String,
    pub receipt_hash: String,
    pub ipfs_cid: String,
    /// Filled with the append time when absent.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("transparency chain corrupt at index {0}: {1}")]
    ChainCorrupt(u64, String),
}

/// The transparency log: in-memory tree plus persisted rows.
///
/// Appends take the exclusive write lock for the whole protocol (index
/// assignment, tree extension, row persistence, event publish); `root`
/// and proof reads take the shared lock.
pub struct TransparencyLog {
    tree: RwLock<MerkleTree>,
    repo: TransparencyRepo,
    emitter: Arc<dyn Emitter>,
}

impl TransparencyLog {
    /// Rebuild the tree from persisted rows, verifying the prev-hash
    /// chain along the way.
    pub async fn load(repo: TransparencyRepo, emitter: Arc<dyn Emitter>) -> Result<Self, LogError> {
        let rows = repo.list_all().await?;
        let mut tree = MerkleTree::new();

        for row in &rows {
            let expected_prev = tree.root();
            if row.prev_hash != expected_prev {
                return Err(LogError::ChainCorrupt(
                    row.log_index as u64,
                    "prev_hash does not match the preceding root".to_string(),
                ));
            }
            tree.push(row_leaf_hash(row));
        }

        if !rows.is_empty() {
            info!(entries = rows.len(), root = %tree.root(), "Transparency log rebuilt");
        }

        Ok(Self {
            tree: RwLock::new(tree),
            repo,
            emitter,
        })
    }

    /// Append one entry: assign the next index, chain `prev_hash`, extend
    /// the tree, persist, and broadcast. Returns the persisted row and
    /// the inclusion proof for the new leaf.
    pub async fn append(
        &self,
        entry: PendingEntry,
    ) -> Result<(TransparencyRow, Vec<ProofStep>), LogError> {
        let mut tree = self.tree.write().await;

        let log_index = tree.len() as u64;
        let prev_hash = tree.root();
        let logged_at = entry.timestamp.unwrap_or_else(Utc::now);
        let timestamp = logged_at.to_rfc3339_opts(SecondsFormat::Nanos, true);

        let leaf = leaf_hash(
            log_index,
            entry.execution_id,
            &entry.job_id,
            &entry.region,
            &entry.provider_id,
            &entry.status,
            &entry.output_hash,
            &entry.receipt_hash,
            &entry.ipfs_cid,
            &prev_hash,
            &timestamp,
        );
        tree.push(leaf);

        let root = tree.root();
        let proof = tree
            .proof(log_index as usize)
            .unwrap_or_default();

        let row = TransparencyRow {
            log_index: log_index as i64,
            execution_id: entry.execution_id,
            job_id: entry.job_id,
            region: entry.region,
            provider_id: entry.provider_id,
            status: entry.status,
            output_hash: entry.output_hash,
            receipt_hash: entry.receipt_hash,
            ipfs_cid: entry.ipfs_cid,
            prev_hash,
            merkle_tree_root: root.clone(),
            merkle_proof_json: serde_json::to_string(&proof).map_err(DbError::from)?,
            logged_at,
        };
        self.repo.append(&row).await?;

        self.emitter.emit(
            ENTRY_APPENDED,
            json!({
                "log_index": log_index,
                "job_id": row.job_id,
                "execution_id": row.execution_id,
                "region": row.region,
                "merkle_root": root,
            }),
        );

        Ok((row, proof))
    }

    /// Current root and tree size.
    pub async fn root_info(&self) -> (String, u64) {
        let tree = self.tree.read().await;
        (tree.root(), tree.len() as u64)
    }

    /// Inclusion proof for `index` against the current root.
    pub async fn proof_at(&self, index: u64) -> Option<ProofResponse> {
        let tree = self.tree.read().await;
        let leaf = tree.leaf(index as usize)?.to_string();
        let proof = tree.proof(index as usize)?;
        Some(ProofResponse {
            log_index: index,
            leaf_hash: leaf,
            proof,
            root: tree.root(),
        })
    }

    pub fn repo(&self) -> &TransparencyRepo {
        &self.repo
    }
}

fn row_leaf_hash(row: &TransparencyRow) -> String {
    leaf_hash(
        row.log_index as u64,
        row.execution_id,
        &row.job_id,
        &row.region,
        &row.provider_id,
        &row.status,
        &row.output_hash,
        &row.receipt_hash,
        &row.ipfs_cid,
        &row.prev_hash,
        &row.logged_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
    )
}

/// Non-blocking hand-off into the log. A full queue drops the entry and
/// counts it; the execution that produced the receipt is never reverted.
#[derive(Clone)]
pub struct TransparencySink {
    tx: mpsc::Sender<PendingEntry>,
    dropped: Arc<AtomicU64>,
}

impl TransparencySink {
    /// Returns `false` when the entry was dropped.
    pub fn try_enqueue(&self, entry: PendingEntry) -> bool {
        match self.tx.try_send(entry) {
            Ok(()) => true,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Transparency entry dropped");
                false
            }
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Bounded ingest channel for the writer task.
pub fn transparency_channel(capacity: usize) -> (TransparencySink, mpsc::Receiver<PendingEntry>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        TransparencySink {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Drain the ingest queue into the log until the channel closes. Failed
/// appends degrade with a log line; they never propagate.
pub fn spawn_writer(
    log: Arc<TransparencyLog>,
    mut rx: mpsc::Receiver<PendingEntry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            if let Err(e) = log.append(entry).await {
                error!(error = %e, "Transparency append failed");
            }
        }
    })
}
