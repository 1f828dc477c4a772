//! Persistence layer for the Beacon runner.
//!
//! Jobs, executions, the transactional outbox, the transparency log rows,
//! the nonce key-value store, and optional trace spans. Every multi-row
//! state change that crosses aggregates goes through one explicit
//! transaction; all queries are parameterized.

pub mod error;
pub mod executions;
pub mod jobs;
pub mod kv;
pub mod models;
pub mod outbox;
pub mod pool;
pub mod schema;
pub mod trace;
pub mod transparency;

pub use error::{DbError, Result};
pub use executions::ExecutionRepo;
pub use jobs::JobRepo;
pub use kv::KvStore;
pub use models::{ExecutionRow, JobRow, OutboxRow, OutboxStats, TransparencyRow};
pub use outbox::OutboxRepo;
pub use pool::{create_pool, DbConfig, DbPool};
pub use trace::{TraceSpan, TraceSpanRepo};
pub use transparency::TransparencyRepo;
