//! Log entry and exported trail types.
//!
//! `LogEntry` is one link of the hash chain. `AuditTrail` is the sealed copy
//! of a whole chain handed to whoever needs to verify it elsewhere, such as
//! a centralized compliance auditor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single link in an agent's hash chain.
///
/// `entry_hash` commits to `prev_hash` and to the canonical form of
/// (`timestamp`, `agent_id`, `action`, `data`). Editing any of those fields
/// after the fact makes the stored hash disagree with the recomputed one,
/// which `verify_chain` reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the chain, starting at 0.
    pub sequence_number: u64,

    pub timestamp: DateTime<Utc>,

    /// The agent that performed `action`.
    pub agent_id: String,

    /// What happened, e.g. "lifecycle.started" or "verdict.issued".
    pub action: String,

    /// Arbitrary structured detail for the action.
    pub data: serde_json::Value,

    /// SHA-256 (hex) over `prev_hash` and the canonical entry content.
    pub entry_hash: String,

    /// `entry_hash` of the previous entry, or `GENESIS_HASH` for entry 0.
    pub prev_hash: String,
}

impl LogEntry {
    /// The `prev_hash` of the first entry in every chain: 64 hex zeros.
    pub const GENESIS_HASH: &'static str =
        "0000000000000000000000000000000000000000000000000000000000000000";
}

/// A sealed copy of a chain.
///
/// `terminal_hash` equals the last entry's `entry_hash` (or `GENESIS_HASH`
/// for an empty chain) and serves as a compact commitment to the whole trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditTrail {
    /// The agent (or compliance role) that owns the chain.
    pub owner: String,

    /// All entries in chain order.
    pub entries: Vec<LogEntry>,

    pub sealed_at: DateTime<Utc>,

    pub terminal_hash: String,
}
