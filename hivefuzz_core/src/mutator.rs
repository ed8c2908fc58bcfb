use crate::choices::{Choice, ChoiceSequence};
use crate::corpus::Corpus;
use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand_core::RngCore;

/// Probability that a structural mutation is a crossover rather than a point
/// mutation.
const DEFAULT_CROSSOVER_SHARE: f64 = 0.8;

/// A `Mutator` produces the next choice sequence to try, usually from the corpus.
///
/// The produced sequence is a *prefix*: the executor replays it and draws fresh
/// values once it runs out, so any sequence (including the empty one) is valid.
pub trait Mutator: Send {
    fn name(&self) -> &'static str;

    fn generate(&mut self, corpus: &Corpus, rng: &mut dyn RngCore) -> ChoiceSequence;
}

/// Always returns the empty sequence, i.e. "draw everything at random".
#[derive(Debug, Default, Clone, Copy)]
pub struct BlackBoxMutator;

impl Mutator for BlackBoxMutator {
    fn name(&self) -> &'static str {
        "blackbox"
    }

    fn generate(&mut self, _corpus: &Corpus, _rng: &mut dyn RngCore) -> ChoiceSequence {
        ChoiceSequence::empty()
    }
}

/// Selection weights for every corpus entry: `1 / count` of the rarest behavior in
/// its fingerprint, normalized to sum to one. Entries covering rare behaviors are
/// favored.
pub fn crossover_weights(corpus: &Corpus) -> Vec<(&ChoiceSequence, f64)> {
    let raw: Vec<(&ChoiceSequence, f64)> = corpus
        .entries()
        .map(|(choices, fingerprint)| {
            let rarest = corpus.rarest_count(fingerprint).unwrap_or(1).max(1);
            (choices, 1.0 / rarest as f64)
        })
        .collect();
    let total: f64 = raw.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return raw;
    }
    raw.into_iter().map(|(c, w)| (c, w / total)).collect()
}

fn pick_weighted<'a>(
    weighted: &[(&'a ChoiceSequence, f64)],
    index: &WeightedIndex<f64>,
    rng: &mut dyn RngCore,
) -> &'a ChoiceSequence {
    weighted[index.sample(rng)].0
}

/// Splices a random-length prefix of one rarity-weighted corpus entry onto a
/// random-length prefix of another. Crude (no alignment of structure), but a large
/// improvement over pure random generation once the easy behaviors are found.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrossOverMutator;

impl Mutator for CrossOverMutator {
    fn name(&self) -> &'static str {
        "crossover"
    }

    fn generate(&mut self, corpus: &Corpus, rng: &mut dyn RngCore) -> ChoiceSequence {
        let weighted = crossover_weights(corpus);
        let Ok(index) = WeightedIndex::new(weighted.iter().map(|(_, w)| *w)) else {
            return ChoiceSequence::empty();
        };
        let first = pick_weighted(&weighted, &index, rng);
        let second = pick_weighted(&weighted, &index, rng);
        let first_len = rng.random_range(0..=first.len());
        let second_len = rng.random_range(0..=second.len());
        first.prefix(first_len).concat(&second.prefix(second_len))
    }
}

/// Takes one corpus entry and nudges a single choice by a small amount.
#[derive(Debug, Default, Clone, Copy)]
pub struct PointMutator;

impl PointMutator {
    fn nudge(choice: &Choice, rng: &mut dyn RngCore) -> Choice {
        match choice {
            Choice::Boolean(b) => Choice::Boolean(!b),
            Choice::Integer(v) => {
                let delta = rng.random_range(1i64..=15);
                if rng.random_bool(0.5) {
                    Choice::Integer(v.wrapping_add(delta))
                } else {
                    Choice::Integer(v.wrapping_sub(delta))
                }
            }
            Choice::Float(bits) => Choice::Float(bits ^ (1u64 << rng.random_range(0..52u32))),
            Choice::Bytes(bytes) => {
                let mut bytes = bytes.clone();
                if bytes.is_empty() {
                    bytes.push(0);
                }
                let index = rng.random_range(0..bytes.len());
                bytes[index] = bytes[index].wrapping_add(rng.random_range(1u8..=15u8));
                Choice::Bytes(bytes)
            }
        }
    }
}

impl Mutator for PointMutator {
    fn name(&self) -> &'static str {
        "point"
    }

    fn generate(&mut self, corpus: &Corpus, rng: &mut dyn RngCore) -> ChoiceSequence {
        if corpus.is_empty() {
            return ChoiceSequence::empty();
        }
        let pick = rng.random_range(0..corpus.len());
        let Some((base, _)) = corpus.entries().nth(pick) else {
            return ChoiceSequence::empty();
        };
        if base.is_empty() {
            return base.clone();
        }
        let index = rng.random_range(0..base.len());
        let nudged = Self::nudge(&base.as_slice()[index], rng);
        base.with_replaced(index, nudged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutatorKind {
    BlackBox,
    CrossOver,
    Point,
}

/// Probability of choosing a structural (corpus-based) mutator: the fraction of all
/// inputs run so far that did *not* end up in the corpus.
pub fn structural_probability(total_inputs: u64, corpus_size: usize) -> f64 {
    if total_inputs == 0 {
        return 0.0;
    }
    let unproductive = total_inputs.saturating_sub(corpus_size as u64);
    unproductive as f64 / total_inputs as f64
}

/// Picks the mutator for the next input from corpus statistics alone.
pub fn select_mutator(total_inputs: u64, corpus_size: usize, rng: &mut dyn RngCore) -> MutatorKind {
    let p_structural = structural_probability(total_inputs, corpus_size);
    if corpus_size == 0 || !rng.random_bool(p_structural) {
        return MutatorKind::BlackBox;
    }
    if rng.random_bool(DEFAULT_CROSSOVER_SHARE) {
        MutatorKind::CrossOver
    } else {
        MutatorKind::Point
    }
}

/// One instance of every mutator, dispatched by [`select_mutator`].
pub struct MutatorSet {
    blackbox: Box<dyn Mutator>,
    crossover: Box<dyn Mutator>,
    point: Box<dyn Mutator>,
}

impl Default for MutatorSet {
    fn default() -> Self {
        Self {
            blackbox: Box::new(BlackBoxMutator),
            crossover: Box::new(CrossOverMutator),
            point: Box::new(PointMutator),
        }
    }
}

impl MutatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(
        &mut self,
        total_inputs: u64,
        corpus: &Corpus,
        rng: &mut dyn RngCore,
    ) -> (MutatorKind, ChoiceSequence) {
        let kind = select_mutator(total_inputs, corpus.len(), rng);
        let mutator = match kind {
            MutatorKind::BlackBox => &mut self.blackbox,
            MutatorKind::CrossOver => &mut self.crossover,
            MutatorKind::Point => &mut self.point,
        };
        (kind, mutator.generate(corpus, rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::test_utils::{behaviors, observation};
    use crate::executor::Status;
    use crate::storage::{InMemoryStore, TargetKeys};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::sync::Arc;

    fn empty_corpus() -> Corpus {
        Corpus::new(Arc::new(InMemoryStore::new()), TargetKeys::new(b"mutator-test"))
    }

    /// Two entries whose rarest behavior has count 1 and one whose rarest has count 5.
    fn skewed_corpus() -> Corpus {
        let mut corpus = empty_corpus();
        for len in (1..=5usize).rev() {
            let bytes = vec![9u8; len];
            corpus
                .consider_coverage(&behaviors(&["common"]), &observation(&bytes, Status::Valid), false)
                .unwrap();
        }
        corpus
            .consider_coverage(&behaviors(&["rare-1"]), &observation(b"\x01\x02", Status::Valid), false)
            .unwrap();
        corpus
            .consider_coverage(&behaviors(&["rare-2"]), &observation(b"\x03\x04", Status::Valid), false)
            .unwrap();
        corpus
    }

    #[test]
    fn crossover_weights_favor_rare_behaviors() {
        let corpus = skewed_corpus();
        assert_eq!(corpus.len(), 3);
        let weights = crossover_weights(&corpus);
        let weight_of = |bytes: &[u8]| {
            weights
                .iter()
                .find(|(c, _)| **c == ChoiceSequence::from(bytes))
                .map(|(_, w)| *w)
                .unwrap()
        };
        let common = weight_of(&b"\x09"[..]);
        let rare_1 = weight_of(&b"\x01\x02"[..]);
        let rare_2 = weight_of(&b"\x03\x04"[..]);
        assert!(rare_1 > common);
        assert!(rare_2 > common);
        assert!((rare_1 - rare_2).abs() < 1e-12);
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn crossover_output_is_built_from_corpus_prefixes() {
        let corpus = skewed_corpus();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut mutator = CrossOverMutator;
        for _ in 0..50 {
            let out = mutator.generate(&corpus, &mut rng);
            assert!(out.len() <= 4);
        }
        assert!(mutator.generate(&empty_corpus(), &mut rng).is_empty());
    }

    #[test]
    fn blackbox_and_point_mutators() {
        let corpus = skewed_corpus();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        assert!(BlackBoxMutator.generate(&corpus, &mut rng).is_empty());

        let mut point = PointMutator;
        for _ in 0..20 {
            let out = point.generate(&corpus, &mut rng);
            assert!(!out.is_empty());
            assert!(corpus.entries().any(|(base, _)| {
                base.len() == out.len()
                    && base.iter().zip(out.iter()).filter(|(a, b)| a != b).count() == 1
            }));
        }
    }

    #[test]
    fn structural_probability_tracks_unproductive_inputs() {
        assert_eq!(structural_probability(0, 0), 0.0);
        assert_eq!(structural_probability(10, 10), 0.0);
        assert!((structural_probability(100, 25) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn selection_falls_back_to_blackbox() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..100 {
            assert_eq!(select_mutator(0, 0, &mut rng), MutatorKind::BlackBox);
            assert_eq!(select_mutator(1_000, 0, &mut rng), MutatorKind::BlackBox);
        }
        let structural = (0..1_000)
            .filter(|_| select_mutator(1_000, 10, &mut rng) != MutatorKind::BlackBox)
            .count();
        assert!(structural > 900, "expected mostly structural, got {structural}");
    }
}
