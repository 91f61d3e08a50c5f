//! Hash-chain primitives: hashing and chain integrity verification.
//!
//! Hash input layout (bytes, in order):
//!   1. prev_hash as UTF-8 bytes (64 ASCII hex chars)
//!   2. canonical JSON of { timestamp, agent_id, action, data }
//!
//! The timestamp is rendered as RFC 3339 with nanosecond precision and a `Z`
//! suffix. `data` is serialized by serde_json, whose object maps keep keys in
//! sorted order, so equal values always produce equal bytes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use warden_contracts::error::{WardenError, WardenResult};

use crate::entry::LogEntry;

#[derive(Serialize)]
struct CanonicalEntry<'a> {
    timestamp: String,
    agent_id: &'a str,
    action: &'a str,
    data: &'a serde_json::Value,
}

/// Compute the chain hash for one entry.
///
/// Returns a lowercase 64-character hex string.
///
/// # Panics
///
/// Panics if the canonical entry cannot be serialized to JSON, which cannot
/// happen: every field is a string or an already-valid `serde_json::Value`.
pub fn hash_entry(
    prev_hash: &str,
    timestamp: &DateTime<Utc>,
    agent_id: &str,
    action: &str,
    data: &serde_json::Value,
) -> String {
    let canonical = CanonicalEntry {
        timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        agent_id,
        action,
        data,
    };
    let canonical_json =
        serde_json::to_vec(&canonical).expect("canonical log entry must serialize to JSON");

    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(&canonical_json);

    hex::encode(hasher.finalize())
}

/// Recompute `entry`'s hash from its own stored fields.
pub fn recompute(entry: &LogEntry) -> String {
    hash_entry(
        &entry.prev_hash,
        &entry.timestamp,
        &entry.agent_id,
        &entry.action,
        &entry.data,
    )
}

/// Outcome of recomputing a chain from genesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    pub valid: bool,
    /// One line per detected problem.
    pub errors: Vec<String>,
    /// Every index with at least one problem, ascending, without duplicates.
    pub divergent_indices: Vec<u64>,
}

impl ChainVerification {
    /// Turn a failed report into `ChainIntegrityViolation`.
    pub fn into_result(self) -> WardenResult<()> {
        if self.valid {
            Ok(())
        } else {
            Err(WardenError::ChainIntegrityViolation {
                indices: self.divergent_indices,
            })
        }
    }
}

/// Verify the integrity of a hash chain.
///
/// Every entry is checked against three rules and every failure is
/// reported, not just the first:
///
/// 1. **Position** — `sequence_number` equals its index.
/// 2. **Linkage** — `prev_hash` equals the stored `entry_hash` of the
///    preceding entry (or `GENESIS_HASH` for entry 0).
/// 3. **Content** — the stored `entry_hash` equals the recomputed one.
///
/// Linkage is judged against stored hashes, so editing the content of entry
/// `k` flags `k` alone rather than every entry after it. An empty chain is
/// valid.
pub fn verify_chain(entries: &[LogEntry]) -> ChainVerification {
    let mut errors = Vec::new();
    let mut divergent_indices = Vec::new();
    let mut expected_prev = LogEntry::GENESIS_HASH;

    for (index, entry) in entries.iter().enumerate() {
        let index = index as u64;
        let errors_before = errors.len();

        if entry.sequence_number != index {
            errors.push(format!(
                "entry {}: sequence number {} is out of place",
                index, entry.sequence_number
            ));
        }

        if entry.prev_hash != expected_prev {
            errors.push(format!(
                "entry {}: prev_hash {} does not link to {}",
                index, entry.prev_hash, expected_prev
            ));
        }

        let recomputed = recompute(entry);
        if entry.entry_hash != recomputed {
            errors.push(format!(
                "entry {}: stored hash {} does not match recomputed {}",
                index, entry.entry_hash, recomputed
            ));
        }

        if errors.len() > errors_before {
            divergent_indices.push(index);
        }

        expected_prev = entry.entry_hash.as_str();
    }

    ChainVerification {
        valid: errors.is_empty(),
        errors,
        divergent_indices,
    }
}
