//! Productivity estimators used to split fuzzing time between targets.
//!
//! All estimates are derived from counters a target already keeps; nothing here is
//! persisted as ground truth.

use serde::{Deserialize, Serialize};

/// Expected number of new behaviors from the next input.
///
/// Uses the inputs run since the last new behavior as the sample: a target that
/// found something one input ago is estimated at 1, one that has gone 1000 inputs
/// without is estimated at 1/1000.
pub fn behaviors_per_input(since_new_behavior: u64) -> f64 {
    if since_new_behavior == 0 {
        return 1.0;
    }
    1.0 / since_new_behavior as f64
}

/// Expected number of new behaviors per second of fuzzing.
pub fn behaviors_per_second(behaviors_per_input: f64, ninputs: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 || !elapsed_secs.is_finite() {
        return behaviors_per_input;
    }
    behaviors_per_input * (ninputs as f64 / elapsed_secs)
}

/// Numerically stable softmax. Non-finite inputs get zero weight; if nothing is
/// finite the result is uniform.
pub fn softmax(values: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let max = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return vec![1.0 / values.len() as f64; values.len()];
    }
    let exps: Vec<f64> = values
        .iter()
        .map(|v| if v.is_finite() { (v - max).exp() } else { 0.0 })
        .collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Point-in-time estimator values for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EstimatorSnapshot {
    pub target: String,
    pub ninputs: u64,
    pub elapsed_secs: f64,
    pub since_new_behavior: u64,
    pub behaviors_per_input: f64,
    pub behaviors_per_second: f64,
    pub corpus_size: usize,
    pub behaviors: usize,
    pub valid: bool,
}

impl EstimatorSnapshot {
    pub fn new(
        target: impl Into<String>,
        ninputs: u64,
        elapsed_secs: f64,
        since_new_behavior: u64,
    ) -> Self {
        let bpi = behaviors_per_input(since_new_behavior);
        Self {
            target: target.into(),
            ninputs,
            elapsed_secs,
            since_new_behavior,
            behaviors_per_input: bpi,
            behaviors_per_second: behaviors_per_second(bpi, ninputs, elapsed_secs),
            corpus_size: 0,
            behaviors: 0,
            valid: true,
        }
    }
}

/// How long a worker has been running, and how long it expects to keep running.
///
/// Estimates published by longer-lived workers have seen more inputs and are
/// preferred when the hub rebalances.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerLifetime {
    pub current_lifetime: f64,
    pub expected_lifetime: f64,
}

impl WorkerLifetime {
    pub fn new(expected_lifetime: f64) -> Self {
        Self {
            current_lifetime: 0.0,
            expected_lifetime,
        }
    }

    /// Seconds the worker still expects to run, never negative.
    pub fn remaining(&self) -> f64 {
        (self.expected_lifetime - self.current_lifetime).max(0.0)
    }
}
