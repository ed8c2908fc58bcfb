use crate::config::FuzzerSettings;
use crate::driver::{DriverError, TargetDriver};
use crate::estimator::{WorkerLifetime, softmax};
use crate::hub::{SharedState, WorkerId};
use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Builds the driver for a target the first time a worker is assigned it. The
/// second argument is a seed for the driver's random source.
pub type TargetFactory = Box<dyn FnMut(&str, u64) -> Result<TargetDriver, DriverError> + Send>;

/// A single-threaded fuzzing loop over the targets the hub assigned to it.
///
/// Drivers live in an index-based registry. Assigned targets are *active*;
/// targets the hub took away are *dropped* but kept in memory, so a target that
/// comes back resumes where it stopped instead of starting over.
pub struct Worker {
    id: WorkerId,
    state: SharedState,
    factory: TargetFactory,
    drivers: Vec<TargetDriver>,
    by_name: HashMap<String, usize>,
    active: BTreeSet<usize>,
    dropped: BTreeSet<usize>,
    setup_errors: Vec<String>,
    seen_assignment: u64,
    rng: ChaCha8Rng,
    batch_size: u64,
    random_target_probability: f64,
    started: Instant,
    lifetime: WorkerLifetime,
    batches: u64,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        state: SharedState,
        factory: TargetFactory,
        settings: &FuzzerSettings,
        expected_lifetime: Duration,
        seed: u64,
    ) -> Self {
        state.register_worker(id);
        Self {
            id,
            state,
            factory,
            drivers: Vec::new(),
            by_name: HashMap::new(),
            active: BTreeSet::new(),
            dropped: BTreeSet::new(),
            setup_errors: Vec::new(),
            seen_assignment: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            batch_size: settings.batch_size,
            random_target_probability: settings.random_target_probability,
            started: Instant::now(),
            lifetime: WorkerLifetime::new(expected_lifetime.as_secs_f64()),
            batches: 0,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }

    pub fn drivers(&self) -> impl Iterator<Item = &TargetDriver> {
        self.drivers.iter()
    }

    pub fn driver(&self, name: &str) -> Option<&TargetDriver> {
        self.by_name.get(name).map(|&index| &self.drivers[index])
    }

    pub fn active_targets(&self) -> BTreeSet<&str> {
        self.active
            .iter()
            .map(|&index| self.drivers[index].name())
            .collect()
    }

    pub fn dropped_targets(&self) -> BTreeSet<&str> {
        self.dropped
            .iter()
            .map(|&index| self.drivers[index].name())
            .collect()
    }

    pub fn setup_errors(&self) -> &[String] {
        &self.setup_errors
    }

    /// Applies the latest assignment from the hub, if it changed since the last
    /// call. Returns whether anything was applied.
    pub fn reconcile(&mut self) -> Result<bool, DriverError> {
        let Some(assignment) = self.state.assignment(self.id) else {
            return Ok(false);
        };
        if assignment.version <= self.seen_assignment {
            return Ok(false);
        }
        self.seen_assignment = assignment.version;
        let wanted = assignment.value;

        let evicted: Vec<usize> = self
            .active
            .iter()
            .copied()
            .filter(|&index| !wanted.contains(self.drivers[index].name()))
            .collect();
        for index in evicted {
            self.active.remove(&index);
            self.dropped.insert(index);
            debug!(worker = self.id, name = %self.drivers[index].name(), "target dropped");
        }

        for name in &wanted {
            match self.by_name.get(name.as_str()) {
                Some(&index) => {
                    if self.dropped.remove(&index) {
                        debug!(worker = self.id, name = %name, "target resumed");
                    }
                    self.active.insert(index);
                }
                None => {
                    let seed = self.rng.random::<u64>();
                    let driver = (self.factory)(name.as_str(), seed)?;
                    let index = self.drivers.len();
                    self.drivers.push(driver);
                    self.by_name.insert(name.clone(), index);
                    self.active.insert(index);
                    debug!(worker = self.id, name = %name, "target started");
                }
            }
        }
        info!(
            worker = self.id,
            active = self.active.len(),
            dropped = self.dropped.len(),
            "assignment applied"
        );
        Ok(true)
    }

    /// Picks the next target to fuzz: usually by softmax over estimated
    /// behaviors per second, occasionally uniformly at random so that no valid
    /// target starves. `None` if no active target is valid.
    pub fn select_target(&mut self) -> Option<usize> {
        let valid: Vec<usize> = self
            .active
            .iter()
            .copied()
            .filter(|&index| self.drivers[index].is_valid())
            .collect();
        if valid.is_empty() {
            return None;
        }
        if self.rng.random_bool(self.random_target_probability) {
            return Some(valid[self.rng.random_range(0..valid.len())]);
        }
        let rates: Vec<f64> = valid
            .iter()
            .map(|&index| self.drivers[index].estimator_snapshot().behaviors_per_second)
            .collect();
        let weights = softmax(&rates);
        match WeightedIndex::new(&weights) {
            Ok(dist) => Some(valid[dist.sample(&mut self.rng)]),
            Err(_) => Some(valid[self.rng.random_range(0..valid.len())]),
        }
    }

    /// Reconciles, runs one batch on a selected target and publishes estimates.
    /// Returns the name of the target that ran, if any.
    pub fn step(&mut self) -> Result<Option<String>, DriverError> {
        self.reconcile()?;
        let Some(index) = self.select_target() else {
            self.publish();
            return Ok(None);
        };
        let driver = &mut self.drivers[index];
        let name = driver.name().to_string();
        match driver.run_batch(self.batch_size) {
            Ok(_) => {}
            Err(DriverError::SetupError { target, executions }) => {
                error!(
                    worker = self.id,
                    name = %target,
                    executions,
                    "target never produced a valid input; excluding it"
                );
                self.setup_errors.push(target);
            }
            Err(e) => return Err(e),
        }
        self.batches += 1;
        self.publish();
        Ok(Some(name))
    }

    /// Publishes this worker's lifetime and its active targets' estimates.
    pub fn publish(&mut self) {
        self.lifetime.current_lifetime = self.started.elapsed().as_secs_f64();
        let estimates: Vec<_> = self
            .active
            .iter()
            .map(|&index| self.drivers[index].estimator_snapshot())
            .collect();
        self.state.publish(self.id, self.lifetime, estimates);
    }

    /// Steps until `stop` is set.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), DriverError> {
        while !stop.load(Ordering::Relaxed) {
            if self.step()?.is_none() {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        info!(worker = self.id, batches = self.batches, "worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverSettings;
    use crate::executor::{InProcessExecutor, StopTest, TestCase};
    use crate::hub::Hub;
    use crate::storage::{Database, InMemoryStore};
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn reaches(tc: &mut TestCase<'_>) -> Result<(), StopTest> {
        let x = tc.draw_integer(0, 1000)?;
        tc.event_with("parity", x % 2);
        Ok(())
    }

    fn fails(tc: &mut TestCase<'_>) -> Result<(), StopTest> {
        let _ = tc.draw_integer(0, 10)?;
        panic!("always fails");
    }

    fn factory(store: Arc<dyn Database>, created: Arc<AtomicUsize>) -> TargetFactory {
        Box::new(move |name: &str, seed: u64| {
            created.fetch_add(1, Ordering::SeqCst);
            let test_fn: fn(&mut TestCase<'_>) -> Result<(), StopTest> =
                if name == "failing" { fails } else { reaches };
            let executor = Box::new(InProcessExecutor::new(name, test_fn));
            TargetDriver::new(
                name,
                executor,
                Some(store.clone()),
                DriverSettings::default(),
                seed,
            )
        })
    }

    fn settings() -> FuzzerSettings {
        FuzzerSettings {
            batch_size: 10,
            ..FuzzerSettings::default()
        }
    }

    fn names(targets: &[&str]) -> BTreeSet<String> {
        targets.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn dropped_targets_resume_without_restarting() {
        let state = SharedState::new(["a", "b"]);
        let created = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn Database> = Arc::new(InMemoryStore::new());
        let mut worker = Worker::new(
            0,
            state.clone(),
            factory(store, created.clone()),
            &settings(),
            Duration::from_secs(60),
            1,
        );

        state.assign(0, names(&["a", "b"]));
        assert!(worker.reconcile().unwrap());
        assert!(!worker.reconcile().unwrap(), "same version is applied once");
        for _ in 0..6 {
            worker.step().unwrap();
        }
        let ran_a = worker.driver("a").unwrap().ninputs();

        state.assign(0, names(&["b"]));
        worker.reconcile().unwrap();
        assert_eq!(worker.active_targets(), BTreeSet::from(["b"]));
        assert_eq!(worker.dropped_targets(), BTreeSet::from(["a"]));
        for _ in 0..3 {
            assert_eq!(worker.step().unwrap().as_deref(), Some("b"));
        }
        assert_eq!(worker.driver("a").unwrap().ninputs(), ran_a);

        state.assign(0, names(&["a", "b"]));
        worker.reconcile().unwrap();
        assert!(worker.dropped_targets().is_empty());
        assert_eq!(worker.driver("a").unwrap().ninputs(), ran_a);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_targets_are_never_selected() {
        let state = SharedState::new(["failing", "ok"]);
        let created = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn Database> = Arc::new(InMemoryStore::new());
        let mut worker = Worker::new(
            1,
            state.clone(),
            factory(store, created),
            &settings(),
            Duration::from_secs(60),
            2,
        );
        state.assign(1, names(&["failing"]));
        assert_eq!(worker.step().unwrap().as_deref(), Some("failing"));
        assert!(!worker.driver("failing").unwrap().is_valid());
        assert_eq!(worker.step().unwrap(), None, "only target has failed");

        state.assign(1, names(&["failing", "ok"]));
        for _ in 0..20 {
            assert_eq!(worker.step().unwrap().as_deref(), Some("ok"));
        }
    }

    #[test]
    fn failed_target_is_not_reassigned_on_later_rebalances() {
        let state = SharedState::new(["failing", "ok"]);
        let created = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn Database> = Arc::new(InMemoryStore::new());
        let uniform = FuzzerSettings {
            random_target_probability: 1.0,
            ..settings()
        };
        let mut worker = Worker::new(
            0,
            state.clone(),
            factory(store, created.clone()),
            &uniform,
            Duration::from_secs(60),
            4,
        );
        let mut hub = Hub::new(state.clone(), Duration::from_secs(60));

        assert!(hub.rebalance().unwrap());
        assert_eq!(state.assignment(0).unwrap().value, names(&["failing", "ok"]));
        for _ in 0..100 {
            if worker.driver("failing").is_some_and(|d| !d.is_valid()) {
                break;
            }
            worker.step().unwrap();
        }
        assert_eq!(worker.driver("failing").map(|d| d.is_valid()), Some(false));

        for round in 0..4 {
            hub.rebalance().unwrap();
            for _ in 0..5 {
                assert_eq!(worker.step().unwrap().as_deref(), Some("ok"));
            }
            assert_eq!(
                state.assignment(0).unwrap().value,
                names(&["ok"]),
                "round {round}"
            );
        }
        assert_eq!(hub.rebalances(), 2);
        assert_eq!(state.retired(), names(&["failing"]));
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn publishing_reports_lifetime_and_active_estimates() {
        let state = SharedState::new(["a"]);
        let store: Arc<dyn Database> = Arc::new(InMemoryStore::new());
        let mut worker = Worker::new(
            2,
            state.clone(),
            factory(store, Arc::new(AtomicUsize::new(0))),
            &settings(),
            Duration::from_secs(60),
            3,
        );
        state.assign(2, names(&["a"]));
        worker.step().unwrap();
        let report = state.report(2).unwrap();
        assert_eq!(report.value.lifetime.expected_lifetime, 60.0);
        let estimate = &report.value.estimates["a"];
        assert_eq!(estimate.ninputs, 10);
        assert!(estimate.valid);
        assert_eq!(worker.batches(), 1);
    }
}
