use crate::estimator::{EstimatorSnapshot, WorkerLifetime, softmax};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

pub type WorkerId = usize;

/// Estimate used for targets nobody has reported on yet: a fresh target is
/// assumed to find something on its next input.
const UNKNOWN_TARGET_RATE: f64 = 1.0;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HubError {
    #[error("No workers registered with the hub")]
    NoWorkers,
    #[error("No targets to schedule")]
    NoTargets,
}

/// A value tagged with the shared-state version at which it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// What a worker last published about itself and the targets it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub lifetime: WorkerLifetime,
    pub estimates: BTreeMap<String, EstimatorSnapshot>,
}

#[derive(Debug, Default)]
struct SharedInner {
    version: u64,
    targets: BTreeSet<String>,
    retired: BTreeSet<String>,
    workers: BTreeSet<WorkerId>,
    reports: BTreeMap<WorkerId, Versioned<WorkerReport>>,
    assignments: BTreeMap<WorkerId, Versioned<BTreeSet<String>>>,
}

impl SharedInner {
    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// Scheduling state shared by the hub and every worker.
///
/// Cloning the handle shares the same state. Every write bumps a global version
/// and tags the written entry with it, so a worker can tell whether its
/// assignment changed since it last looked, and always sees its own writes.
///
/// A target once published as invalid is retired for good, even after the worker
/// that ran it stops reporting on it.
#[derive(Debug, Clone, Default)]
pub struct SharedState(Arc<Mutex<SharedInner>>);

impl SharedState {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = Self::default();
        state.0.lock().targets = targets.into_iter().map(Into::into).collect();
        state
    }

    pub fn version(&self) -> u64 {
        self.0.lock().version
    }

    pub fn targets(&self) -> BTreeSet<String> {
        self.0.lock().targets.clone()
    }

    pub fn add_target(&self, name: impl Into<String>) -> u64 {
        let mut inner = self.0.lock();
        inner.targets.insert(name.into());
        inner.bump()
    }

    pub fn register_worker(&self, worker: WorkerId) -> u64 {
        let mut inner = self.0.lock();
        inner.workers.insert(worker);
        inner.bump()
    }

    pub fn workers(&self) -> BTreeSet<WorkerId> {
        self.0.lock().workers.clone()
    }

    pub fn publish(
        &self,
        worker: WorkerId,
        lifetime: WorkerLifetime,
        estimates: impl IntoIterator<Item = EstimatorSnapshot>,
    ) -> u64 {
        let estimates: BTreeMap<String, EstimatorSnapshot> = estimates
            .into_iter()
            .map(|snapshot| (snapshot.target.clone(), snapshot))
            .collect();
        let mut inner = self.0.lock();
        for snapshot in estimates.values() {
            if !snapshot.valid && inner.retired.insert(snapshot.target.clone()) {
                info!(worker, name = %snapshot.target, "target retired");
            }
        }
        let version = inner.bump();
        inner.reports.insert(
            worker,
            Versioned {
                version,
                value: WorkerReport {
                    lifetime,
                    estimates,
                },
            },
        );
        version
    }

    /// Targets that failed or turned out to be misconfigured.
    pub fn retired(&self) -> BTreeSet<String> {
        self.0.lock().retired.clone()
    }

    pub fn report(&self, worker: WorkerId) -> Option<Versioned<WorkerReport>> {
        self.0.lock().reports.get(&worker).cloned()
    }

    pub fn reports(&self) -> BTreeMap<WorkerId, Versioned<WorkerReport>> {
        self.0.lock().reports.clone()
    }

    pub fn assign(&self, worker: WorkerId, targets: BTreeSet<String>) -> u64 {
        let mut inner = self.0.lock();
        let version = inner.bump();
        inner.assignments.insert(
            worker,
            Versioned {
                version,
                value: targets,
            },
        );
        version
    }

    pub fn assignment(&self, worker: WorkerId) -> Option<Versioned<BTreeSet<String>>> {
        self.0.lock().assignments.get(&worker).cloned()
    }

    pub fn assignments(&self) -> BTreeMap<WorkerId, BTreeSet<String>> {
        self.0
            .lock()
            .assignments
            .iter()
            .map(|(worker, entry)| (*worker, entry.value.clone()))
            .collect()
    }
}

/// The hub's view of one target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetEstimate {
    pub behaviors_per_second: f64,
    pub valid: bool,
}

/// Picks, for every known target, the estimate published by the longest-lived
/// worker that runs it. Targets without any estimate get an optimistic default;
/// retired targets are always invalid.
pub fn merge_estimates(
    targets: &BTreeSet<String>,
    retired: &BTreeSet<String>,
    reports: &BTreeMap<WorkerId, Versioned<WorkerReport>>,
) -> BTreeMap<String, TargetEstimate> {
    let mut best: BTreeMap<String, (f64, TargetEstimate)> = BTreeMap::new();
    for report in reports.values() {
        let lifetime = report.value.lifetime.current_lifetime;
        for (name, snapshot) in &report.value.estimates {
            let estimate = TargetEstimate {
                behaviors_per_second: snapshot.behaviors_per_second,
                valid: snapshot.valid,
            };
            match best.get(name) {
                Some((seen, _)) if *seen >= lifetime => {}
                _ => {
                    best.insert(name.clone(), (lifetime, estimate));
                }
            }
        }
    }
    targets
        .iter()
        .map(|name| {
            let mut estimate = best.get(name).map(|(_, e)| *e).unwrap_or(TargetEstimate {
                behaviors_per_second: UNKNOWN_TARGET_RATE,
                valid: true,
            });
            if retired.contains(name) {
                estimate.valid = false;
            }
            (name.clone(), estimate)
        })
        .collect()
}

/// Expected discovery rate of an assignment: each worker splits its time between
/// its valid targets by softmax over their rates.
pub fn assignment_score(
    assignment: &BTreeMap<WorkerId, BTreeSet<String>>,
    estimates: &BTreeMap<String, TargetEstimate>,
) -> f64 {
    assignment
        .values()
        .map(|targets| {
            let rates: Vec<f64> = targets
                .iter()
                .filter_map(|name| estimates.get(name))
                .filter(|e| e.valid)
                .map(|e| e.behaviors_per_second)
                .collect();
            softmax(&rates)
                .iter()
                .zip(&rates)
                .map(|(p, rate)| p * rate)
                .sum::<f64>()
        })
        .sum()
}

/// Builds a candidate assignment: valid targets in decreasing order of rate, each
/// placed on the currently least-loaded worker. Workers left without a target
/// then share the most productive ones, so nobody idles while there is work.
pub fn plan_assignment(
    workers: &BTreeSet<WorkerId>,
    estimates: &BTreeMap<String, TargetEstimate>,
) -> BTreeMap<WorkerId, BTreeSet<String>> {
    let mut plan: BTreeMap<WorkerId, BTreeSet<String>> =
        workers.iter().map(|w| (*w, BTreeSet::new())).collect();
    let mut load: BTreeMap<WorkerId, f64> = workers.iter().map(|w| (*w, 0.0)).collect();

    let mut ranked: Vec<(&String, f64)> = estimates
        .iter()
        .filter(|(_, e)| e.valid)
        .map(|(name, e)| (name, e.behaviors_per_second))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    for (name, rate) in &ranked {
        let lightest = load
            .iter()
            .min_by(|a, b| {
                a.1.total_cmp(b.1)
                    .then_with(|| plan[a.0].len().cmp(&plan[b.0].len()))
                    .then_with(|| a.0.cmp(b.0))
            })
            .map(|(worker, _)| *worker);
        let Some(worker) = lightest else {
            break;
        };
        if let Some(targets) = plan.get_mut(&worker) {
            targets.insert((*name).clone());
        }
        if let Some(l) = load.get_mut(&worker) {
            *l += rate;
        }
    }

    if !ranked.is_empty() {
        let mut cycle = ranked.iter().cycle();
        for targets in plan.values_mut().filter(|t| t.is_empty()) {
            if let Some((name, _)) = cycle.next() {
                targets.insert((*name).clone());
            }
        }
    }
    plan
}

/// Periodically redistributes targets between workers.
pub struct Hub {
    state: SharedState,
    rebalance_interval: Duration,
    last_rebalance: Option<Instant>,
    rebalances: u64,
}

impl Hub {
    pub fn new(state: SharedState, rebalance_interval: Duration) -> Self {
        Self {
            state,
            rebalance_interval,
            last_rebalance: None,
            rebalances: 0,
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn rebalances(&self) -> u64 {
        self.rebalances
    }

    /// Recomputes the assignment from the latest published estimates and pushes
    /// it to every worker. Returns whether the candidate was adopted.
    ///
    /// The candidate replaces the current assignment only if its score is at least
    /// as good, unless the current assignment leaves some valid target without a
    /// worker.
    pub fn rebalance(&mut self) -> Result<bool, HubError> {
        self.last_rebalance = Some(Instant::now());
        let workers = self.state.workers();
        if workers.is_empty() {
            return Err(HubError::NoWorkers);
        }
        let targets = self.state.targets();
        if targets.is_empty() {
            return Err(HubError::NoTargets);
        }

        let retired = self.state.retired();
        let estimates = merge_estimates(&targets, &retired, &self.state.reports());
        let current: BTreeMap<WorkerId, BTreeSet<String>> = {
            let mut assigned = self.state.assignments();
            for worker in &workers {
                assigned.entry(*worker).or_default();
            }
            assigned.retain(|worker, _| workers.contains(worker));
            assigned
        };
        let candidate = plan_assignment(&workers, &estimates);

        let covered: BTreeSet<&String> = current.values().flatten().collect();
        let uncovered = estimates
            .iter()
            .any(|(name, e)| e.valid && !covered.contains(name));
        let current_score = assignment_score(&current, &estimates);
        let candidate_score = assignment_score(&candidate, &estimates);

        if !uncovered && candidate_score < current_score {
            debug!(current_score, candidate_score, "keeping current assignment");
            return Ok(false);
        }
        if candidate == current {
            return Ok(false);
        }
        for (worker, targets) in candidate {
            self.state.assign(worker, targets);
        }
        self.rebalances += 1;
        info!(
            workers = workers.len(),
            targets = estimates.len(),
            current_score,
            candidate_score,
            "rebalanced targets"
        );
        Ok(true)
    }

    /// Rebalances if the interval has elapsed (or nothing was ever assigned).
    pub fn tick(&mut self) -> Result<bool, HubError> {
        let due = match self.last_rebalance {
            None => true,
            Some(at) => at.elapsed() >= self.rebalance_interval,
        };
        if !due {
            return Ok(false);
        }
        self.rebalance()
    }

    /// Ticks until `stop` is set.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), HubError> {
        let poll = self.rebalance_interval.min(Duration::from_millis(100));
        while !stop.load(Ordering::Relaxed) {
            self.tick()?;
            std::thread::sleep(poll);
        }
        Ok(())
    }
}
