//! # warden-audit
//!
//! Append-only, SHA-256 hash-chained tamper-evident log for WARDEN agents.
//!
//! ## Overview
//!
//! Every `log_audit` call an agent makes becomes a `LogEntry` linked to the
//! previous entry by its hash. Editing any stored entry breaks the link
//! between its stored and recomputed hash, and `verify` reports the index.
//! Each agent owns one log; an auditor-role collaborator may own a further
//! centralized chain that records actions from many agents through
//! `append_as`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use warden_audit::TamperEvidentLog;
//!
//! let log = TamperEvidentLog::new("watchdog-n1");
//! log.append("verdict.issued", serde_json::json!({ "model": "m-7" }))?;
//!
//! assert!(log.verify().valid);
//! let tip = log.last_hash();
//! ```

pub mod chain;
pub mod entry;
pub mod log;

pub use chain::{hash_entry, recompute, verify_chain, ChainVerification};
pub use entry::{AuditTrail, LogEntry};
pub use log::TamperEvidentLog;

// ── Tests ─────────────────────────────────────────────────────────────────────
