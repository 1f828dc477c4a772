//! Cross-region difference reports.
//!
//! Groups a job's completed executions into equality classes over their
//! output hashes. Regions in the same class produced byte-identical
//! canonical output; more than one class means the model's behavior
//! diverged by region.

use beacon_db::ExecutionRow;
use beacon_protocol::http_types::{DiffAnalysis, DiffClass};
use beacon_protocol::{canonical_json, ExecutionStatus};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Build the diff report for one job's executions.
pub fn analyze(job_id: &str, rows: &[ExecutionRow]) -> DiffAnalysis {
    // One combined hash per region, over its completed outputs in
    // execution order.
    let mut per_region: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in rows {
        if row.status() != Some(ExecutionStatus::Completed) {
            continue;
        }
        let Some(output) = row.output_json.as_deref() else {
            continue;
        };
        per_region
            .entry(row.region.clone())
            .or_default()
            .push(output_hash(output));
    }

    let mut classes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (region, hashes) in &per_region {
        let combined = combine_hashes(hashes);
        classes.entry(combined).or_default().push(region.clone());
    }

    let regions_compared: Vec<String> = per_region.keys().cloned().collect();
    let largest = classes.values().map(Vec::len).max().unwrap_or(0);
    let agreement_ratio = if regions_compared.is_empty() {
        1.0
    } else {
        largest as f64 / regions_compared.len() as f64
    };

    DiffAnalysis {
        job_id: job_id.to_string(),
        divergent: classes.len() > 1,
        agreement_ratio,
        regions_compared,
        classes: classes
            .into_iter()
            .map(|(output_hash, regions)| DiffClass {
                output_hash,
                regions,
            })
            .collect(),
    }
}

fn output_hash(raw: &str) -> String {
    // Canonicalize so key order in stored JSON cannot fake a divergence.
    let canonical = match serde_json::from_str::<Value>(raw) {
        Ok(value) => canonical_json(&value),
        Err(_) => raw.to_string(),
    };
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn combine_hashes(hashes: &[String]) -> String {
    let mut hasher = Sha256::new();
    for hash in hashes {
        hasher.update(hash.as_bytes());
    }
    hex::encode(hasher.finalize())
}
