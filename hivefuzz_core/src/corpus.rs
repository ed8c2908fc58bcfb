use crate::behavior::{Behavior, Fingerprint};
use crate::choices::{Choice, ChoiceSequence};
use crate::executor::Observation;
use crate::storage::{Database, StoreError, TargetKeys};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Failures that stopped reproducing are purged after this long.
pub const DEFAULT_FIXED_FAILURE_GRACE_SECS: u64 = 8 * 24 * 60 * 60;

/// What a call to [`Corpus::consider_coverage`] discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoverageChange {
    /// At least one behavior in the fingerprint had never been covered before.
    pub new_behavior: bool,
    /// This exact fingerprint had never been considered before.
    pub new_fingerprint: bool,
}

/// A failure that stopped reproducing, kept until its grace period expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedFailure {
    /// Unix time (seconds) at which the failure was first seen not to reproduce.
    pub fixed_at: u64,
    pub choices: ChoiceSequence,
}

impl FixedFailure {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::encode_to_vec(
            (self.fixed_at, self.choices.as_slice()),
            ChoiceSequence::wire_config(),
        )?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let ((fixed_at, choices), _len): ((u64, Vec<Choice>), usize) =
            bincode::decode_from_slice(bytes, ChoiceSequence::wire_config())?;
        Ok(Self {
            fixed_at,
            choices: ChoiceSequence::new(choices),
        })
    }
}

/// Everything a target needs to replay after loading its corpus from the store.
#[derive(Debug, Default)]
pub struct StoredSeeds {
    pub corpus: Vec<ChoiceSequence>,
    pub shrunk_failures: Vec<ChoiceSequence>,
    pub unshrunk_failures: Vec<ChoiceSequence>,
    pub fixed_failures: Vec<FixedFailure>,
}

/// The set of minimal covering inputs for one fuzz target.
///
/// Every behavior ever covered maps to exactly one choice sequence: the
/// shortlex-smallest stable input seen so far that exhibits it. Only sequences that
/// are the minimal cover of at least one behavior are retained, so the corpus is
/// bounded by the number of distinct behaviors rather than the number of inputs run.
///
/// Changes to the covering set are written through to the store as they happen.
pub struct Corpus {
    store: Arc<dyn Database>,
    keys: TargetKeys,
    behavior_counts: HashMap<Behavior, u64>,
    fingerprints: BTreeMap<ChoiceSequence, Fingerprint>,
    covering: HashMap<Behavior, ChoiceSequence>,
    /// How many behaviors each retained sequence is currently the cover of.
    cover_counts: HashMap<ChoiceSequence, usize>,
    seen_fingerprints: HashSet<Fingerprint>,
    observed_behaviors: HashSet<Behavior>,
    failures: BTreeMap<String, Observation>,
    unshrunk: HashMap<String, BTreeSet<ChoiceSequence>>,
}

impl Corpus {
    pub fn new(store: Arc<dyn Database>, keys: TargetKeys) -> Self {
        Self {
            store,
            keys,
            behavior_counts: HashMap::new(),
            fingerprints: BTreeMap::new(),
            covering: HashMap::new(),
            cover_counts: HashMap::new(),
            seen_fingerprints: HashSet::new(),
            observed_behaviors: HashSet::new(),
            failures: BTreeMap::new(),
            unshrunk: HashMap::new(),
        }
    }

    pub fn keys(&self) -> &TargetKeys {
        &self.keys
    }

    /// Number of retained (covering) sequences.
    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    pub fn contains(&self, choices: &ChoiceSequence) -> bool {
        self.fingerprints.contains_key(choices)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ChoiceSequence, &Fingerprint)> {
        self.fingerprints.iter()
    }

    pub fn fingerprint_of(&self, choices: &ChoiceSequence) -> Option<&Fingerprint> {
        self.fingerprints.get(choices)
    }

    pub fn behavior_counts(&self) -> &HashMap<Behavior, u64> {
        &self.behavior_counts
    }

    pub fn behavior_count(&self, behavior: &Behavior) -> u64 {
        self.behavior_counts.get(behavior).copied().unwrap_or(0)
    }

    pub fn covering(&self, behavior: &Behavior) -> Option<&ChoiceSequence> {
        self.covering.get(behavior)
    }

    /// Number of distinct behaviors with a stable minimal cover.
    pub fn num_behaviors(&self) -> usize {
        self.covering.len()
    }

    pub fn num_fingerprints(&self) -> usize {
        self.seen_fingerprints.len()
    }

    /// Number of distinct behaviors seen at all, including ones from executions that
    /// failed the stability recheck.
    pub fn num_observed_behaviors(&self) -> usize {
        self.observed_behaviors.len()
    }

    /// The count of the rarest behavior in `fingerprint`, or `None` for an empty
    /// fingerprint.
    pub fn rarest_count(&self, fingerprint: &Fingerprint) -> Option<u64> {
        fingerprint.iter().map(|b| self.behavior_count(b)).min()
    }

    pub fn failures(&self) -> &BTreeMap<String, Observation> {
        &self.failures
    }

    /// Tallies behaviors from any execution, stable or not. Never touches the
    /// covering set.
    pub fn record_observed(&mut self, fingerprint: &Fingerprint) {
        for behavior in fingerprint {
            if !self.observed_behaviors.contains(behavior) {
                self.observed_behaviors.insert(behavior.clone());
            }
        }
    }

    /// Would considering this execution change the covering set?
    ///
    /// True iff some behavior in `fingerprint` is uncovered, or is covered by a
    /// sequence strictly larger (shortlex) than `observation.choices`.
    pub fn would_change_coverage(
        &self,
        fingerprint: &Fingerprint,
        observation: &Observation,
    ) -> bool {
        let choices = &observation.choices;
        fingerprint
            .iter()
            .any(|behavior| match self.covering.get(behavior) {
                None => true,
                Some(existing) => choices < existing,
            })
    }

    /// Updates the covering set with a (stable) execution.
    ///
    /// Each behavior that is uncovered, or covered by a larger sequence, becomes
    /// covered by `observation.choices`. If that happened at all, the sequence is
    /// retained and persisted, every behavior in its fingerprint has its count
    /// incremented, and sequences left covering nothing are dropped from memory and
    /// from the store.
    pub fn consider_coverage(
        &mut self,
        fingerprint: &Fingerprint,
        observation: &Observation,
        save_observation: bool,
    ) -> Result<CoverageChange, StoreError> {
        let choices = &observation.choices;
        let mut change = CoverageChange {
            new_behavior: false,
            new_fingerprint: !self.seen_fingerprints.contains(fingerprint),
        };
        if change.new_fingerprint {
            self.seen_fingerprints.insert(fingerprint.clone());
        }

        let mut displaced: BTreeSet<ChoiceSequence> = BTreeSet::new();
        let mut covers = 0usize;
        for behavior in fingerprint {
            let previous = match self.covering.get(behavior) {
                None => None,
                Some(existing) if choices < existing => Some(existing.clone()),
                Some(_) => continue,
            };
            match previous {
                None => change.new_behavior = true,
                Some(previous) => {
                    if let Some(count) = self.cover_counts.get_mut(&previous) {
                        *count = count.saturating_sub(1);
                    }
                    displaced.insert(previous);
                }
            }
            self.covering.insert(behavior.clone(), choices.clone());
            covers += 1;
        }

        if covers == 0 {
            return Ok(change);
        }

        *self.cover_counts.entry(choices.clone()).or_insert(0) += covers;
        let encoded = choices.encode()?;
        match self.fingerprints.get_mut(choices) {
            Some(existing) if existing != fingerprint => {
                // Same recipe, different behaviors: keep the union so every covered
                // behavior stays attributed to a tracked fingerprint.
                *existing = existing.iter().chain(fingerprint.iter()).cloned().collect();
            }
            Some(_) => {}
            None => {
                self.fingerprints
                    .insert(choices.clone(), fingerprint.clone());
                self.store.save(&self.keys.corpus(), &encoded)?;
            }
        }
        for behavior in fingerprint {
            *self.behavior_counts.entry(behavior.clone()).or_insert(0) += 1;
        }
        if save_observation {
            let json = serde_json::to_vec(observation)?;
            self.store.save(&self.keys.observations(&encoded), &json)?;
        }

        for old in displaced {
            if self.cover_counts.get(&old).copied().unwrap_or(0) == 0 {
                self.drop_entry(&old)?;
            }
        }

        debug!(
            choices = choices.len(),
            new_behavior = change.new_behavior,
            corpus_size = self.fingerprints.len(),
            "corpus updated"
        );
        Ok(change)
    }

    fn drop_entry(&mut self, choices: &ChoiceSequence) -> Result<(), StoreError> {
        self.cover_counts.remove(choices);
        self.fingerprints.remove(choices);
        let encoded = choices.encode()?;
        self.store.delete(&self.keys.corpus(), &encoded)?;
        let observation_key = self.keys.observations(&encoded);
        for value in self.store.fetch(&observation_key)? {
            self.store.delete(&observation_key, &value)?;
        }
        Ok(())
    }

    /// Tracks a failing execution. Called for every interesting result, stable or
    /// not. Keeps the shortlex-minimal sequence per failure signature and persists it
    /// as an unshrunk failure. Returns true if this is a new or smaller example.
    pub fn consider_failure(&mut self, observation: &Observation) -> Result<bool, StoreError> {
        let signature = failure_signature(observation);
        let improved = match self.failures.get(&signature) {
            None => true,
            Some(existing) => observation.choices < existing.choices,
        };
        if !improved {
            return Ok(false);
        }
        let encoded = observation.choices.encode()?;
        self.store.save(&self.keys.failures_unshrunk(), &encoded)?;
        self.unshrunk
            .entry(signature.clone())
            .or_default()
            .insert(observation.choices.clone());
        self.failures.insert(signature, observation.clone());
        Ok(true)
    }

    /// Records the final (shrunk) example for a failure signature: persists it with
    /// its observation and removes every unshrunk example stored for the signature.
    pub fn record_shrunk_failure(&mut self, observation: &Observation) -> Result<(), StoreError> {
        let signature = failure_signature(observation);
        let encoded = observation.choices.encode()?;
        self.store.save(&self.keys.failures_shrunk(), &encoded)?;
        self.store.save(
            &self.keys.failure_observations(),
            &serde_json::to_vec(observation)?,
        )?;
        if let Some(unshrunk) = self.unshrunk.remove(&signature) {
            for choices in unshrunk {
                if choices != observation.choices {
                    self.store
                        .delete(&self.keys.failures_unshrunk(), &choices.encode()?)?;
                }
            }
        }
        self.store
            .delete(&self.keys.failures_unshrunk(), &encoded)?;
        self.failures.insert(signature, observation.clone());
        Ok(())
    }

    /// Moves a stored failure that no longer reproduces into the fixed bucket.
    pub fn downgrade_failure(&mut self, choices: &ChoiceSequence, now: u64) -> Result<(), StoreError> {
        let encoded = choices.encode()?;
        let record = FixedFailure {
            fixed_at: now,
            choices: choices.clone(),
        };
        self.store
            .save(&self.keys.failures_fixed(), &record.encode()?)?;
        self.store.delete(&self.keys.failures_shrunk(), &encoded)?;
        self.store.delete(&self.keys.failures_unshrunk(), &encoded)?;
        warn!(choices = %choices, "stored failure no longer reproduces; moved to fixed");
        Ok(())
    }

    /// Removes a fixed-failure record, e.g. because it reproduces again.
    pub fn forget_fixed(&mut self, record: &FixedFailure) -> Result<(), StoreError> {
        self.store
            .delete(&self.keys.failures_fixed(), &record.encode()?)
    }

    /// Reads everything this target has persisted. Values that cannot be decoded
    /// are deleted; fixed failures older than `grace_secs` are purged.
    pub fn load(&mut self, now: u64, grace_secs: u64) -> Result<StoredSeeds, StoreError> {
        let mut seeds = StoredSeeds {
            corpus: self.load_sequences(&self.keys.corpus())?,
            shrunk_failures: self.load_sequences(&self.keys.failures_shrunk())?,
            unshrunk_failures: self.load_sequences(&self.keys.failures_unshrunk())?,
            fixed_failures: Vec::new(),
        };
        let fixed_key = self.keys.failures_fixed();
        for value in self.store.fetch(&fixed_key)? {
            match FixedFailure::decode(&value) {
                Ok(record) if now.saturating_sub(record.fixed_at) > grace_secs => {
                    debug!(choices = %record.choices, "purging expired fixed failure");
                    self.store.delete(&fixed_key, &value)?;
                }
                Ok(record) => seeds.fixed_failures.push(record),
                Err(e) => {
                    warn!(error = %e, "deleting undecodable fixed failure");
                    self.store.delete(&fixed_key, &value)?;
                }
            }
        }
        seeds.corpus.sort();
        seeds.shrunk_failures.sort();
        seeds.unshrunk_failures.sort();
        Ok(seeds)
    }

    fn load_sequences(&self, key: &[u8]) -> Result<Vec<ChoiceSequence>, StoreError> {
        let mut out = Vec::new();
        for value in self.store.fetch(key)? {
            match ChoiceSequence::decode(&value) {
                Ok(choices) => out.push(choices),
                Err(e) => {
                    warn!(error = %e, "deleting undecodable stored choice sequence");
                    self.store.delete(key, &value)?;
                }
            }
        }
        Ok(out)
    }
}

/// Failures without a signature all deduplicate together.
pub fn failure_signature(observation: &Observation) -> String {
    observation
        .signature
        .clone()
        .unwrap_or_else(|| "<unknown>".to_string())
}
