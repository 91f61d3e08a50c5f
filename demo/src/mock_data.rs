//! Simulated model inventory for the WARDEN demo network.
//!
//! All data in this module is hardcoded and fictional. Nothing external is
//! contacted; the scout agent reads this in place of a real model registry.

use serde_json::{json, Value};

/// Risk score at or above which the watchdog asks for enforcement.
pub const ENFORCEMENT_THRESHOLD: f64 = 0.7;

/// One deployed model as the scout sees it.
#[derive(Debug, Clone, Copy)]
pub struct ModelRecord {
    pub model_id: &'static str,
    pub owner: &'static str,
    /// Fraction of recent outputs outside the validated distribution.
    pub drift: f64,
    /// Demographic parity gap on the last evaluation run.
    pub bias_gap: f64,
    /// User-reported incidents in the last 30 days.
    pub incidents: u32,
}

const INVENTORY: [ModelRecord; 6] = [
    ModelRecord { model_id: "credit-scorer-v3", owner: "lending", drift: 0.12, bias_gap: 0.31, incidents: 4 },
    ModelRecord { model_id: "support-chat-v7", owner: "cx", drift: 0.05, bias_gap: 0.02, incidents: 1 },
    ModelRecord { model_id: "resume-ranker-v2", owner: "hr", drift: 0.41, bias_gap: 0.38, incidents: 9 },
    ModelRecord { model_id: "fraud-detector-v5", owner: "risk", drift: 0.08, bias_gap: 0.04, incidents: 0 },
    ModelRecord { model_id: "claims-triage-v1", owner: "insurance", drift: 0.33, bias_gap: 0.12, incidents: 6 },
    ModelRecord { model_id: "ad-targeting-v9", owner: "marketing", drift: 0.19, bias_gap: 0.22, incidents: 2 },
];

/// The first `n` models (cycling through the inventory when `n` is larger).
pub fn inventory(n: usize) -> Vec<ModelRecord> {
    INVENTORY.iter().copied().cycle().take(n).collect()
}

/// Look up a model by id.
pub fn find_model(model_id: &str) -> Option<ModelRecord> {
    INVENTORY.iter().copied().find(|m| m.model_id == model_id)
}

/// Weighted risk in `[0, 1]`: drift and bias dominate, incidents saturate at 10.
pub fn risk_score(model: &ModelRecord) -> f64 {
    let incidents = f64::from(model.incidents.min(10)) / 10.0;
    let score = 0.4 * model.drift / 0.5 + 0.4 * model.bias_gap / 0.4 + 0.2 * incidents;
    score.clamp(0.0, 1.0)
}

/// Scan report as published by the scout.
pub fn scan_report(model: &ModelRecord) -> Value {
    json!({
        "model_id": model.model_id,
        "owner": model.owner,
        "metrics": {
            "drift": model.drift,
            "bias_gap": model.bias_gap,
            "incidents_30d": model.incidents
        },
        "risk_score": risk_score(model)
    })
}
