use crate::driver::Phase;
use crate::executor::Status;
use crate::storage::{Database, StoreError, TargetKeys};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportKind {
    /// Emitted on new coverage or a phase change; kept.
    Progress,
    /// Emitted on the heartbeat interval; only the latest one is kept.
    Heartbeat,
}

/// Persisted progress record for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Report {
    pub target: String,
    pub kind: ReportKind,
    pub phase: Phase,
    pub timestamp: u64,
    pub elapsed_secs: f64,
    pub ninputs: u64,
    pub status_counts: BTreeMap<Status, u64>,
    pub behaviors: usize,
    pub fingerprints: usize,
    pub corpus_size: usize,
    pub since_new_behavior: u64,
}

impl Report {
    /// True if no counter in `self` is below the same counter in `earlier`.
    pub fn is_monotonic_after(&self, earlier: &Report) -> bool {
        self.ninputs >= earlier.ninputs
            && self.elapsed_secs >= earlier.elapsed_secs
            && self.behaviors >= earlier.behaviors
            && self.fingerprints >= earlier.fingerprints
            && Status::ALL.iter().all(|status| {
                self.status_counts.get(status).copied().unwrap_or(0)
                    >= earlier.status_counts.get(status).copied().unwrap_or(0)
            })
    }
}

/// Writes a target's reports under its reports key.
pub struct ReportWriter {
    store: Arc<dyn Database>,
    key: Vec<u8>,
    last_heartbeat: Option<Vec<u8>>,
    last: Option<Report>,
}

impl ReportWriter {
    pub fn new(store: Arc<dyn Database>, keys: &TargetKeys) -> Self {
        Self {
            store,
            key: keys.reports(),
            last_heartbeat: None,
            last: None,
        }
    }

    /// Saves `report`, replacing the previous heartbeat if there was one.
    pub fn save(&mut self, report: Report) -> Result<(), StoreError> {
        if let Some(last) = &self.last {
            if !report.is_monotonic_after(last) {
                debug!(name = %report.target, "dropping non-monotonic report");
                return Ok(());
            }
        }
        let encoded = serde_json::to_vec(&report)?;
        self.store.save(&self.key, &encoded)?;
        if let Some(previous) = self.last_heartbeat.take() {
            if previous != encoded {
                self.store.delete(&self.key, &previous)?;
            }
        }
        if report.kind == ReportKind::Heartbeat {
            self.last_heartbeat = Some(encoded);
        }
        self.last = Some(report);
        Ok(())
    }

    pub fn latest(&self) -> Option<&Report> {
        self.last.as_ref()
    }
}

/// Reads every decodable report stored for a target, oldest first.
pub fn load_reports(store: &dyn Database, keys: &TargetKeys) -> Result<Vec<Report>, StoreError> {
    let mut reports: Vec<Report> = store
        .fetch(&keys.reports())?
        .iter()
        .filter_map(|value| serde_json::from_slice(value).ok())
        .collect();
    reports.sort_by(|a, b| {
        a.ninputs
            .cmp(&b.ninputs)
            .then(a.elapsed_secs.total_cmp(&b.elapsed_secs))
    });
    Ok(reports)
}
