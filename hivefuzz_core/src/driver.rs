use crate::choices::ChoiceSequence;
use crate::config::FuzzerSettings;
use crate::corpus::{CoverageChange, Corpus, failure_signature};
use crate::estimator::EstimatorSnapshot;
use crate::executor::{Execution, Executor, Observation, Status, unix_now};
use crate::mutator::MutatorSet;
use crate::queue::{ExecutionQueue, Priority, QueueElement, QueueExtra};
use crate::report::{Report, ReportKind, ReportWriter};
use crate::shrinker::{GreedyShrinker, Shrinker};
use crate::storage::{Database, StoreError, StoreEvent, TargetKeys};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("Target {target} drew no valid input in its first {executions} executions")]
    SetupError { target: String, executions: u64 },
    #[error("Unknown target {0}")]
    UnknownTarget(String),
}

/// What a target is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Running fresh inputs from the mutators.
    Generate,
    /// Working through queued failures and corpus entries from other workers.
    Replay,
    /// Replaying this target's own persisted corpus after startup.
    Distill,
    /// Minimizing a failure.
    Shrink,
    /// A failure was found and shrunk; the target is no longer scheduled.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Generate => "generate",
            Phase::Replay => "replay",
            Phase::Distill => "distill",
            Phase::Shrink => "shrink",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub shrink_budget: Duration,
    pub heartbeat_interval: Duration,
    pub setup_error_threshold: u64,
    pub fixed_failure_grace_secs: u64,
}

impl Default for DriverSettings {
    fn default() -> Self {
        (&FuzzerSettings::default()).into()
    }
}

impl From<&FuzzerSettings> for DriverSettings {
    fn from(settings: &FuzzerSettings) -> Self {
        Self {
            shrink_budget: settings.shrink_budget(),
            heartbeat_interval: settings.heartbeat_interval(),
            setup_error_threshold: settings.setup_error_threshold,
            fixed_failure_grace_secs: settings.fixed_failure_grace_secs,
        }
    }
}

/// Where the input for one execution came from.
enum Work {
    Queued(QueueElement),
    Generated(ChoiceSequence),
}

/// Drives a single fuzz target: picks the next input, runs it, folds the result
/// into the corpus, and shrinks failures.
///
/// A driver is owned by exactly one worker at a time and is never restarted: a
/// worker that loses the target keeps the driver around and resumes it later.
pub struct TargetDriver {
    name: String,
    executor: Box<dyn Executor>,
    shrinker: Box<dyn Shrinker>,
    mutators: MutatorSet,
    store: Arc<dyn Database>,
    corpus: Corpus,
    queue: ExecutionQueue,
    reports: ReportWriter,
    listener: Option<Receiver<StoreEvent>>,
    remote_seen: HashSet<ChoiceSequence>,
    last_store_poll: Instant,
    rng: ChaCha8Rng,
    settings: DriverSettings,

    started: bool,
    phase: Phase,
    setup_error: bool,
    report_due: bool,
    last_heartbeat: Instant,

    ninputs: u64,
    shrink_executions: u64,
    elapsed: Duration,
    status_counts: BTreeMap<Status, u64>,
    since_new_behavior: u64,
    since_new_fingerprint: u64,
}

impl TargetDriver {
    /// Creates a driver for the target called `name`.
    ///
    /// Fails with [`StoreError::NotConfigured`] if `store` is `None`: coverage and
    /// failures that are not persisted would be lost, so fuzzing refuses to start.
    pub fn new(
        name: impl Into<String>,
        executor: Box<dyn Executor>,
        store: Option<Arc<dyn Database>>,
        settings: DriverSettings,
        seed: u64,
    ) -> Result<Self, DriverError> {
        let store = store.ok_or(StoreError::NotConfigured)?;
        let name = name.into();
        let keys = TargetKeys::new(name.as_bytes());
        Ok(Self {
            executor,
            shrinker: Box::new(GreedyShrinker::new()),
            mutators: MutatorSet::new(),
            corpus: Corpus::new(store.clone(), keys.clone()),
            queue: ExecutionQueue::new(),
            reports: ReportWriter::new(store.clone(), &keys),
            listener: None,
            remote_seen: HashSet::new(),
            last_store_poll: Instant::now(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            settings,
            store,
            name,
            started: false,
            phase: Phase::Generate,
            setup_error: false,
            report_due: false,
            last_heartbeat: Instant::now(),
            ninputs: 0,
            shrink_executions: 0,
            elapsed: Duration::ZERO,
            status_counts: BTreeMap::new(),
            since_new_behavior: 0,
            since_new_fingerprint: 0,
        })
    }

    pub fn with_shrinker(mut self, shrinker: Box<dyn Shrinker>) -> Self {
        self.shrinker = shrinker;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn ninputs(&self) -> u64 {
        self.ninputs
    }

    /// Executions spent shrinking; not counted in `ninputs`.
    pub fn shrink_executions(&self) -> u64 {
        self.shrink_executions
    }

    pub fn since_new_behavior(&self) -> u64 {
        self.since_new_behavior
    }

    pub fn since_new_fingerprint(&self) -> u64 {
        self.since_new_fingerprint
    }

    pub fn status_counts(&self) -> &BTreeMap<Status, u64> {
        &self.status_counts
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn latest_report(&self) -> Option<&Report> {
        self.reports.latest()
    }

    /// A target is schedulable until it fails or turns out to be misconfigured.
    pub fn is_valid(&self) -> bool {
        self.phase != Phase::Failed && !self.setup_error
    }

    pub fn estimator_snapshot(&self) -> EstimatorSnapshot {
        let mut snapshot = EstimatorSnapshot::new(
            self.name.clone(),
            self.ninputs,
            self.elapsed.as_secs_f64(),
            self.since_new_behavior,
        );
        snapshot.corpus_size = self.corpus.len();
        snapshot.behaviors = self.corpus.num_behaviors();
        snapshot.valid = self.is_valid();
        snapshot
    }

    /// Loads persisted state and queues it for replay. Called lazily by
    /// [`run_one`](Self::run_one); idempotent.
    pub fn startup(&mut self) -> Result<(), DriverError> {
        if self.started {
            return Ok(());
        }
        self.started = true;

        let (sender, receiver) = mpsc::channel();
        self.store.add_listener(&self.corpus.keys().corpus(), sender);
        self.listener = Some(receiver);
        self.last_store_poll = Instant::now();

        let seeds = self
            .corpus
            .load(unix_now(), self.settings.fixed_failure_grace_secs)?;
        for choices in seeds.shrunk_failures {
            self.queue.enqueue(Priority::FailureShrunk, choices, None);
        }
        for choices in seeds.unshrunk_failures {
            self.queue.enqueue(Priority::FailureUnshrunk, choices, None);
        }
        for record in seeds.fixed_failures {
            let choices = record.choices.clone();
            self.queue
                .enqueue(Priority::FailureFixed, choices, Some(QueueExtra::Fixed(record)));
        }
        let corpus_size = seeds.corpus.len();
        for choices in seeds.corpus {
            self.remote_seen.insert(choices.clone());
            self.queue.enqueue(Priority::Covering, choices, None);
        }
        info!(
            name = %self.name,
            stored_corpus = corpus_size,
            queued = self.queue.len(),
            "target started"
        );
        Ok(())
    }

    /// Queues corpus entries that other workers saved for this target since the
    /// last call.
    pub fn sync_from_store(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        let incoming: Vec<Vec<u8>> = listener
            .try_iter()
            .filter_map(|event| match event {
                StoreEvent::Save { value, .. } => Some(value),
                StoreEvent::Delete { .. } => None,
            })
            .collect();
        for value in incoming {
            self.queue_remote(&value);
        }
    }

    /// Re-reads this target's corpus key and queues entries that were not seen
    /// before. Store listeners only observe writes made through the same handle,
    /// so this is how entries saved by other processes arrive. Returns the
    /// number of entries queued.
    pub fn poll_store(&mut self) -> Result<usize, DriverError> {
        self.last_store_poll = Instant::now();
        let values = self.store.fetch(&self.corpus.keys().corpus())?;
        let mut queued = 0;
        for value in &values {
            if self.queue_remote(value) {
                queued += 1;
            }
        }
        Ok(queued)
    }

    fn queue_remote(&mut self, value: &[u8]) -> bool {
        match ChoiceSequence::decode(value) {
            Ok(choices) if !self.corpus.contains(&choices) => {
                if !self.remote_seen.insert(choices.clone()) {
                    return false;
                }
                self.queue
                    .enqueue(Priority::CoveringOtherWorker, choices, None);
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!(name = %self.name, error = %e, "ignoring undecodable corpus entry");
                false
            }
        }
    }

    /// Stops listening for store changes once the target will never run again.
    fn stop_listening(&mut self) {
        if self.listener.take().is_some() {
            self.remote_seen.clear();
            debug!(name = %self.name, "store listener released");
        }
    }

    /// Runs up to `count` executions, stopping early if the target fails.
    /// Returns the number of executions run.
    pub fn run_batch(&mut self, count: u64) -> Result<u64, DriverError> {
        let mut executed = 0;
        while executed < count && self.is_valid() {
            self.run_one()?;
            executed += 1;
        }
        Ok(executed)
    }

    /// Runs one input end to end.
    pub fn run_one(&mut self) -> Result<(), DriverError> {
        if !self.is_valid() {
            return Ok(());
        }
        let start = Instant::now();
        self.startup()?;
        self.sync_from_store();
        if self.last_store_poll.elapsed() >= self.settings.heartbeat_interval {
            self.poll_store()?;
        }

        let work = self.next_work();
        let (prefix, priority, extra) = match work {
            Work::Queued(element) => (element.choices, Some(element.priority), element.extra),
            Work::Generated(choices) => (choices, None, None),
        };
        let execution = self.executor.execute(&prefix, &mut self.rng);
        self.ninputs += 1;
        *self.status_counts.entry(execution.status).or_insert(0) += 1;

        let result = self.process(&prefix, priority, extra, execution);
        self.elapsed += start.elapsed();
        result?;

        self.check_setup()?;
        self.emit_report()?;
        Ok(())
    }

    fn next_work(&mut self) -> Work {
        while let Some(element) = self.queue.pop_next() {
            match element.priority {
                // Already part of the corpus: nothing to learn from a replay.
                Priority::Covering | Priority::CoveringOtherWorker
                    if self.corpus.contains(&element.choices) =>
                {
                    continue;
                }
                Priority::Covering => self.set_phase(Phase::Distill),
                Priority::Stability => {
                    let from_replay = matches!(
                        element.extra,
                        Some(QueueExtra::Stability {
                            from_replay: true,
                            ..
                        })
                    );
                    if from_replay && self.phase == Phase::Generate {
                        self.set_phase(Phase::Replay);
                    }
                }
                _ => self.set_phase(Phase::Replay),
            }
            return Work::Queued(element);
        }
        self.set_phase(Phase::Generate);
        let (kind, choices) = self
            .mutators
            .generate(self.ninputs, &self.corpus, &mut self.rng);
        debug!(name = %self.name, mutator = ?kind, len = choices.len(), "generated input");
        Work::Generated(choices)
    }

    fn process(
        &mut self,
        prefix: &ChoiceSequence,
        priority: Option<Priority>,
        extra: Option<QueueExtra>,
        execution: Execution,
    ) -> Result<(), DriverError> {
        let change = self.process_coverage(&execution, extra.as_ref())?;
        self.record_novelty(change);

        let reproduced = execution.status == Status::Interesting;
        match (priority, extra) {
            (Some(Priority::FailureShrunk), _) if reproduced => {
                self.corpus.record_shrunk_failure(&execution.observation)?;
                info!(
                    name = %self.name,
                    failure = %execution.observation.representation,
                    "stored failure still reproduces"
                );
                self.set_phase(Phase::Failed);
            }
            (Some(Priority::FailureShrunk | Priority::FailureUnshrunk), _) if !reproduced => {
                self.corpus.downgrade_failure(prefix, unix_now())?;
            }
            (Some(Priority::FailureFixed), Some(QueueExtra::Fixed(record))) if reproduced => {
                warn!(name = %self.name, choices = %record.choices, "fixed failure reproduces again");
                self.corpus.forget_fixed(&record)?;
                self.corpus.consider_failure(&execution.observation)?;
                self.shrink_failure(execution.observation)?;
            }
            (Some(Priority::FailureUnshrunk), _) => {
                self.corpus.consider_failure(&execution.observation)?;
                self.shrink_failure(execution.observation)?;
            }
            _ if reproduced => {
                if self.corpus.consider_failure(&execution.observation)? {
                    self.shrink_failure(execution.observation)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Stability gate: coverage claimed by an execution only enters the corpus
    /// after a re-execution of the same choices reproduces the same fingerprint.
    fn process_coverage(
        &mut self,
        execution: &Execution,
        extra: Option<&QueueExtra>,
    ) -> Result<CoverageChange, DriverError> {
        self.corpus.record_observed(&execution.fingerprint);
        if execution.status < Status::Valid {
            return Ok(CoverageChange::default());
        }
        if let Some(QueueExtra::Stability { fingerprint, .. }) = extra {
            if *fingerprint != execution.fingerprint {
                debug!(
                    name = %self.name,
                    choices = %execution.choices(),
                    "unstable fingerprint, discarding"
                );
                return Ok(CoverageChange::default());
            }
            let change =
                self.corpus
                    .consider_coverage(&execution.fingerprint, &execution.observation, true)?;
            if change.new_behavior || change.new_fingerprint {
                self.report_due = true;
            }
            return Ok(change);
        }
        if self
            .corpus
            .would_change_coverage(&execution.fingerprint, &execution.observation)
        {
            let from_replay = self.phase != Phase::Generate;
            self.queue.enqueue(
                Priority::Stability,
                execution.choices().clone(),
                Some(QueueExtra::Stability {
                    fingerprint: execution.fingerprint.clone(),
                    from_replay,
                }),
            );
        }
        Ok(CoverageChange::default())
    }

    fn record_novelty(&mut self, change: CoverageChange) {
        if change.new_behavior {
            self.since_new_behavior = 0;
        } else {
            self.since_new_behavior += 1;
        }
        if change.new_fingerprint {
            self.since_new_fingerprint = 0;
        } else {
            self.since_new_fingerprint += 1;
        }
    }

    /// Shrinks a failure under the wall-clock budget, persists the smallest example
    /// found and marks the target failed. Whatever the shrinker had when the budget
    /// ran out is what gets persisted.
    fn shrink_failure(&mut self, failure: Observation) -> Result<(), DriverError> {
        self.set_phase(Phase::Shrink);
        let signature = failure_signature(&failure);
        let deadline = Instant::now() + self.settings.shrink_budget;
        info!(name = %self.name, signature = %signature, "shrinking failure");

        let executor = &mut self.executor;
        let rng = &mut self.rng;
        let mut executions = 0u64;
        let mut best = failure.clone();
        let mut still_fails = |candidate: &ChoiceSequence| {
            executions += 1;
            let execution = executor.execute(candidate, &mut *rng);
            if execution.status != Status::Interesting
                || failure_signature(&execution.observation) != signature
            {
                return None;
            }
            let consumed = execution.observation.choices.clone();
            if consumed < best.choices {
                best = execution.observation;
            }
            Some(consumed)
        };
        let shrunk = self
            .shrinker
            .shrink(failure.choices.clone(), &mut still_fails, deadline);
        self.shrink_executions += executions;
        if shrunk != best.choices {
            debug!(name = %self.name, "shrinker result differs from best replay; keeping best replay");
        }

        self.corpus.record_shrunk_failure(&best)?;
        info!(
            name = %self.name,
            from = failure.choices.len(),
            to = best.choices.len(),
            executions,
            failure = %best.representation,
            "failure shrunk"
        );
        self.set_phase(Phase::Failed);
        Ok(())
    }

    fn check_setup(&mut self) -> Result<(), DriverError> {
        if self.setup_error || self.ninputs < self.settings.setup_error_threshold {
            return Ok(());
        }
        let count = |status: Status| self.status_counts.get(&status).copied().unwrap_or(0);
        if count(Status::Valid) + count(Status::Interesting) > 0 {
            return Ok(());
        }
        self.setup_error = true;
        self.stop_listening();
        Err(DriverError::SetupError {
            target: self.name.clone(),
            executions: self.ninputs,
        })
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(name = %self.name, from = %self.phase, to = %phase, "phase change");
            self.phase = phase;
            self.report_due = true;
        }
        if phase == Phase::Failed {
            self.stop_listening();
        }
    }

    fn emit_report(&mut self) -> Result<(), DriverError> {
        let kind = if self.report_due {
            ReportKind::Progress
        } else if self.last_heartbeat.elapsed() >= self.settings.heartbeat_interval {
            ReportKind::Heartbeat
        } else {
            return Ok(());
        };
        self.report_due = false;
        self.last_heartbeat = Instant::now();
        let report = self.report(kind);
        self.reports.save(report)?;
        Ok(())
    }

    pub fn report(&self, kind: ReportKind) -> Report {
        Report {
            target: self.name.clone(),
            kind,
            phase: self.phase,
            timestamp: unix_now(),
            elapsed_secs: self.elapsed.as_secs_f64(),
            ninputs: self.ninputs,
            status_counts: self.status_counts.clone(),
            behaviors: self.corpus.num_behaviors(),
            fingerprints: self.corpus.num_fingerprints(),
            corpus_size: self.corpus.len(),
            since_new_behavior: self.since_new_behavior,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::choices::Choice;
    use crate::corpus::{DEFAULT_FIXED_FAILURE_GRACE_SECS, FixedFailure};
    use crate::executor::{InProcessExecutor, StopTest, TestCase};
    use crate::report::load_reports;
    use crate::storage::{DirectoryStore, InMemoryStore};

    fn settings() -> DriverSettings {
        DriverSettings {
            shrink_budget: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(3600),
            setup_error_threshold: 20,
            fixed_failure_grace_secs: DEFAULT_FIXED_FAILURE_GRACE_SECS,
        }
    }

    fn single_branch(tc: &mut TestCase<'_>) -> Result<(), StopTest> {
        let _ = tc.draw_integer(0, 1_000_000)?;
        tc.event("reached");
        Ok(())
    }

    fn fails_above_fifty(tc: &mut TestCase<'_>) -> Result<(), StopTest> {
        let x = tc.draw_integer(0, 100)?;
        assert!(x < 50, "x too large: {x}");
        Ok(())
    }

    fn driver_for(
        name: &str,
        test_fn: fn(&mut TestCase<'_>) -> Result<(), StopTest>,
        store: Arc<InMemoryStore>,
        seed: u64,
    ) -> TargetDriver {
        let executor = Box::new(InProcessExecutor::new(name, test_fn));
        TargetDriver::new(name, executor, Some(store), settings(), seed).unwrap()
    }

    #[test]
    fn refuses_to_start_without_a_store() {
        let executor = Box::new(InProcessExecutor::new("nostore", single_branch));
        let result = TargetDriver::new("nostore", executor, None, settings(), 0);
        assert!(matches!(
            result,
            Err(DriverError::Store(StoreError::NotConfigured))
        ));
    }

    #[test]
    fn single_branch_is_discovered_once_after_a_stability_check() {
        let store = Arc::new(InMemoryStore::new());
        let mut driver = driver_for("single", single_branch, store.clone(), 1);

        driver.run_one().unwrap();
        assert_eq!(driver.corpus().num_behaviors(), 0, "unverified coverage is not kept");
        assert_eq!(driver.queue_len(), 1);

        driver.run_one().unwrap();
        assert_eq!(driver.corpus().num_behaviors(), 1);
        assert_eq!(driver.since_new_behavior(), 0);
        assert_eq!(driver.corpus().len(), 1);

        let (choices, _) = driver.corpus().entries().next().unwrap();
        let choices = choices.clone();
        let mut replay_executor = InProcessExecutor::new("single", single_branch);
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let replay = replay_executor.execute(&choices, &mut rng);
        assert!(
            !driver
                .corpus()
                .would_change_coverage(&replay.fingerprint, &replay.observation)
        );

        driver.run_batch(20).unwrap();
        assert_eq!(driver.corpus().num_behaviors(), 1);
        assert_eq!(driver.ninputs(), 22);
        assert_eq!(driver.status_counts().get(&Status::Valid), Some(&22));
        assert!(driver.since_new_behavior() > 0);
        assert!(!load_reports(store.as_ref(), driver.corpus().keys()).unwrap().is_empty());
    }

    #[test]
    fn failures_are_shrunk_persisted_and_stop_the_target() {
        let store = Arc::new(InMemoryStore::new());
        let mut driver = driver_for("fails", fails_above_fifty, store.clone(), 7);
        for _ in 0..500 {
            if !driver.is_valid() {
                break;
            }
            driver.run_one().unwrap();
        }
        assert_eq!(driver.phase(), Phase::Failed);
        assert!(!driver.is_valid());

        let keys = driver.corpus().keys().clone();
        let shrunk = store.fetch(&keys.failures_shrunk()).unwrap();
        assert_eq!(shrunk.len(), 1);
        let choices = ChoiceSequence::decode(&shrunk[0]).unwrap();
        match choices.as_slice() {
            [Choice::Integer(v)] => assert!((50..100).contains(v), "got {v}"),
            other => panic!("unexpected shrunk failure {other:?}"),
        }
        assert!(store.fetch(&keys.failures_unshrunk()).unwrap().is_empty());
        assert_eq!(store.fetch(&keys.failure_observations()).unwrap().len(), 1);

        let ninputs = driver.ninputs();
        driver.run_batch(10).unwrap();
        assert_eq!(driver.ninputs(), ninputs, "failed targets do not run");
    }

    #[test]
    fn stored_failure_that_no_longer_fails_is_moved_to_fixed() {
        let store = Arc::new(InMemoryStore::new());
        let keys = TargetKeys::new(b"healed");
        let stale = ChoiceSequence::new(vec![Choice::Integer(5)]);
        store
            .save(&keys.failures_shrunk(), &stale.encode().unwrap())
            .unwrap();

        let mut driver = driver_for("healed", single_branch, store.clone(), 3);
        driver.run_one().unwrap();
        assert_eq!(driver.phase(), Phase::Replay);
        assert!(store.fetch(&keys.failures_shrunk()).unwrap().is_empty());
        let fixed = store.fetch(&keys.failures_fixed()).unwrap();
        assert_eq!(fixed.len(), 1);
        assert_eq!(FixedFailure::decode(&fixed[0]).unwrap().choices, stale);
        assert!(driver.is_valid());
    }

    #[test]
    fn fixed_failure_that_reproduces_is_shrunk_again() {
        let store = Arc::new(InMemoryStore::new());
        let keys = TargetKeys::new(b"regressed");
        let record = FixedFailure {
            fixed_at: unix_now(),
            choices: ChoiceSequence::new(vec![Choice::Integer(90)]),
        };
        store
            .save(&keys.failures_fixed(), &record.encode().unwrap())
            .unwrap();

        let mut driver = driver_for("regressed", fails_above_fifty, store.clone(), 4);
        driver.run_one().unwrap();
        assert_eq!(driver.phase(), Phase::Failed);
        assert!(store.fetch(&keys.failures_fixed()).unwrap().is_empty());
        assert_eq!(store.fetch(&keys.failures_shrunk()).unwrap().len(), 1);
    }

    #[test]
    fn persisted_corpus_is_distilled_on_startup() {
        let store = Arc::new(InMemoryStore::new());
        let mut first = driver_for("distill", single_branch, store.clone(), 10);
        first.run_batch(2).unwrap();
        assert_eq!(first.corpus().len(), 1);

        let mut second = driver_for("distill", single_branch, store.clone(), 11);
        second.run_one().unwrap();
        assert_eq!(second.phase(), Phase::Distill);
        second.run_one().unwrap();
        assert_eq!(second.corpus().len(), 1);
    }

    #[test]
    fn coverage_from_other_workers_is_queued() {
        let store = Arc::new(InMemoryStore::new());
        let mut local = driver_for("shared", single_branch, store.clone(), 20);
        local.startup().unwrap();
        assert_eq!(local.queue_len(), 0);

        let mut remote = driver_for("shared", single_branch, store.clone(), 21);
        remote.run_batch(2).unwrap();
        assert_eq!(remote.corpus().len(), 1);

        local.sync_from_store();
        assert_eq!(local.queue_len(), 1);
        assert_eq!(local.poll_store().unwrap(), 0, "already queued");
    }

    #[test]
    fn listeners_only_buffer_this_targets_corpus_and_end_on_failure() {
        let store = Arc::new(InMemoryStore::new());
        let mut failing = driver_for("fails", fails_above_fifty, store.clone(), 30);
        let mut idle = driver_for("idle", single_branch, store.clone(), 31);
        idle.startup().unwrap();
        for _ in 0..500 {
            if !failing.is_valid() {
                break;
            }
            failing.run_one().unwrap();
        }
        assert!(!failing.is_valid());
        assert!(failing.listener.is_none());

        let mut busy = driver_for("busy", single_branch, store.clone(), 32);
        busy.run_batch(300).unwrap();
        let pending = idle
            .listener
            .as_ref()
            .map(|listener| listener.try_iter().count());
        assert_eq!(pending, Some(0));
    }

    #[test]
    fn entries_saved_by_other_processes_are_polled() {
        let dir = tempfile::tempdir().unwrap();
        let ours: Arc<dyn Database> =
            Arc::new(DirectoryStore::new(dir.path().to_path_buf()).unwrap());
        let theirs = DirectoryStore::new(dir.path().to_path_buf()).unwrap();
        let executor = Box::new(InProcessExecutor::new("polled", single_branch));
        let mut driver =
            TargetDriver::new("polled", executor, Some(ours), settings(), 40).unwrap();
        driver.startup().unwrap();

        let keys = TargetKeys::new(b"polled");
        let entry = ChoiceSequence::new(vec![Choice::Integer(12)]);
        theirs.save(&keys.corpus(), &entry.encode().unwrap()).unwrap();

        driver.sync_from_store();
        assert_eq!(driver.queue_len(), 0, "other handles are not observed");
        assert_eq!(driver.poll_store().unwrap(), 1);
        assert_eq!(driver.queue_len(), 1);
        assert_eq!(driver.poll_store().unwrap(), 0);
    }

    #[test]
    fn targets_that_never_draw_a_valid_input_are_setup_errors() {
        fn always_rejects(tc: &mut TestCase<'_>) -> Result<(), StopTest> {
            tc.assume(false)
        }
        let store = Arc::new(InMemoryStore::new());
        let mut driver = driver_for("broken", always_rejects, store, 5);
        let err = driver.run_batch(100).unwrap_err();
        assert!(matches!(err, DriverError::SetupError { executions: 20, .. }));
        assert!(!driver.is_valid());
        assert_eq!(driver.status_counts().get(&Status::Invalid), Some(&20));
    }

    #[test]
    fn estimator_snapshot_reflects_progress() {
        let store = Arc::new(InMemoryStore::new());
        let mut driver = driver_for("snapshot", single_branch, store, 8);
        driver.run_batch(10).unwrap();
        let snapshot = driver.estimator_snapshot();
        assert_eq!(snapshot.target, "snapshot");
        assert_eq!(snapshot.ninputs, 10);
        assert_eq!(snapshot.behaviors, 1);
        assert!(snapshot.valid);
        assert!(snapshot.behaviors_per_input < 1.0);
    }
}
