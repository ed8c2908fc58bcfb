use crate::choices::{Choice, ChoiceSequence};
use std::time::Instant;
use tracing::debug;

/// Replays a candidate and reports the choices it actually consumed when the result
/// is still the failure being shrunk, or `None` otherwise.
pub type ShrinkPredicate<'a> = dyn FnMut(&ChoiceSequence) -> Option<ChoiceSequence> + 'a;

/// Reduces a failing choice sequence to a shortlex-smaller one that fails the same
/// way.
///
/// Implementations must stop once `deadline` has passed and return the best
/// sequence known so far; the returned value is always one the predicate accepted
/// (or the original input).
pub trait Shrinker: Send {
    fn shrink(
        &mut self,
        failing: ChoiceSequence,
        is_interesting: &mut ShrinkPredicate<'_>,
        deadline: Instant,
    ) -> ChoiceSequence;
}

/// Chunk deletion with halving chunk sizes, followed by per-choice simplification,
/// repeated until a full round makes no progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct GreedyShrinker {
    attempts: u64,
}

impl GreedyShrinker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of candidate replays made across all shrinks.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    fn try_candidate(
        &mut self,
        best: &mut ChoiceSequence,
        candidate: ChoiceSequence,
        is_interesting: &mut ShrinkPredicate<'_>,
    ) -> bool {
        if candidate >= *best {
            return false;
        }
        self.attempts += 1;
        match is_interesting(&candidate) {
            Some(consumed) if consumed < *best => {
                *best = consumed;
                true
            }
            _ => false,
        }
    }

    fn delete_chunks(
        &mut self,
        best: &mut ChoiceSequence,
        is_interesting: &mut ShrinkPredicate<'_>,
        deadline: Instant,
    ) -> bool {
        let mut improved_any = false;
        let mut chunk = best.len().max(1).div_ceil(2);
        while chunk > 0 && !best.is_empty() {
            let mut improved = false;
            let mut i = 0usize;
            while i < best.len() {
                if Instant::now() >= deadline {
                    return improved_any;
                }
                let end = (i + chunk).min(best.len());
                let trial = best.without_range(i, end);
                if self.try_candidate(best, trial, is_interesting) {
                    improved = true;
                    improved_any = true;
                    continue;
                }
                i += chunk;
            }
            if !improved {
                if chunk == 1 {
                    break;
                }
                chunk = chunk.div_ceil(2);
            }
        }
        improved_any
    }

    /// Binary-searches the magnitude of the integer at `index` down toward zero,
    /// keeping its sign. Assumes failures are monotone in the magnitude; when they
    /// are not, the result is still a value the predicate accepted.
    fn minimize_integer(
        &mut self,
        best: &mut ChoiceSequence,
        index: usize,
        is_interesting: &mut ShrinkPredicate<'_>,
        deadline: Instant,
    ) -> bool {
        let Some(&Choice::Integer(value)) = best.get(index) else {
            return false;
        };
        if value == 0 {
            return false;
        }
        let zero = best.with_replaced(index, Choice::Integer(0));
        if self.try_candidate(best, zero, is_interesting) {
            return true;
        }
        let mut improved = false;
        if value < 0 && value != i64::MIN {
            let flipped = best.with_replaced(index, Choice::Integer(-value));
            if self.try_candidate(best, flipped, is_interesting) {
                improved = true;
            }
        }
        let Some(&Choice::Integer(value)) = best.get(index) else {
            return improved;
        };
        let negative = value < 0;
        let (mut lo, mut hi) = (0u64, value.unsigned_abs());
        while hi - lo > 1 {
            if Instant::now() >= deadline {
                break;
            }
            let mid = lo + (hi - lo) / 2;
            let magnitude = mid as i64;
            let candidate = if negative { -magnitude } else { magnitude };
            let trial = best.with_replaced(index, Choice::Integer(candidate));
            if !self.try_candidate(best, trial, is_interesting) {
                lo = mid;
                continue;
            }
            improved = true;
            // The replay may consume fewer choices; only keep searching while the
            // position still holds the value we just tried.
            match best.get(index) {
                Some(&Choice::Integer(now)) if now == candidate => hi = mid,
                _ => break,
            }
        }
        improved
    }

    fn simplify_choices(
        &mut self,
        best: &mut ChoiceSequence,
        is_interesting: &mut ShrinkPredicate<'_>,
        deadline: Instant,
    ) -> bool {
        let mut improved_any = false;
        let mut i = 0usize;
        while i < best.len() {
            if Instant::now() >= deadline {
                return improved_any;
            }
            if matches!(best.get(i), Some(Choice::Integer(_))) {
                if self.minimize_integer(best, i, is_interesting, deadline) {
                    improved_any = true;
                }
                i += 1;
                continue;
            }
            let simpler = best.get(i).and_then(|choice| choice.simplified());
            match simpler {
                Some(choice) => {
                    let trial = best.with_replaced(i, choice);
                    if self.try_candidate(best, trial, is_interesting) {
                        improved_any = true;
                        // Retry the same position until it stops simplifying.
                        continue;
                    }
                    i += 1;
                }
                None => i += 1,
            }
        }
        improved_any
    }
}

impl Shrinker for GreedyShrinker {
    fn shrink(
        &mut self,
        failing: ChoiceSequence,
        is_interesting: &mut ShrinkPredicate<'_>,
        deadline: Instant,
    ) -> ChoiceSequence {
        let mut best = failing;
        let start_len = best.len();
        loop {
            let deleted = self.delete_chunks(&mut best, is_interesting, deadline);
            let simplified = self.simplify_choices(&mut best, is_interesting, deadline);
            if !(deleted || simplified) || Instant::now() >= deadline {
                break;
            }
        }
        debug!(
            from = start_len,
            to = best.len(),
            attempts = self.attempts,
            "shrink finished"
        );
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn shrinks_to_the_single_relevant_choice() {
        let failing = ChoiceSequence::new(vec![
            Choice::Integer(7),
            Choice::Boolean(true),
            Choice::Integer(900),
            Choice::Bytes(vec![1, 2, 3]),
        ]);
        // Fails whenever some integer is at least 100.
        let mut predicate = |candidate: &ChoiceSequence| {
            candidate
                .iter()
                .any(|c| matches!(c, Choice::Integer(v) if *v >= 100))
                .then(|| candidate.clone())
        };
        let mut shrinker = GreedyShrinker::new();
        let shrunk = shrinker.shrink(failing, &mut predicate, far_deadline());
        assert_eq!(shrunk.len(), 1);
        match shrunk.get(0) {
            Some(Choice::Integer(v)) => assert_eq!(*v, 100),
            other => panic!("unexpected {other:?}"),
        }
        assert!(shrinker.attempts() > 0);
    }

    #[test]
    fn expired_deadline_returns_the_input() {
        let failing = ChoiceSequence::from(&b"\x05\x06\x07"[..]);
        let mut calls = 0;
        let mut predicate = |candidate: &ChoiceSequence| {
            calls += 1;
            Some(candidate.clone())
        };
        let shrunk = GreedyShrinker::new().shrink(failing.clone(), &mut predicate, Instant::now());
        assert_eq!(shrunk, failing);
        assert_eq!(calls, 0);
    }

    #[test]
    fn never_returns_a_rejected_candidate() {
        let failing = ChoiceSequence::from(&b"\x03\x03"[..]);
        let mut predicate = |candidate: &ChoiceSequence| (*candidate == failing).then(|| candidate.clone());
        let shrunk = GreedyShrinker::new().shrink(failing.clone(), &mut predicate, far_deadline());
        assert_eq!(shrunk, failing);
    }

    fn single_integer(predicate: impl Fn(i64) -> bool, start: i64) -> ChoiceSequence {
        let failing = ChoiceSequence::new(vec![Choice::Integer(start)]);
        let mut is_interesting = |candidate: &ChoiceSequence| match candidate.get(0) {
            Some(&Choice::Integer(v)) if predicate(v) => Some(candidate.clone()),
            _ => None,
        };
        GreedyShrinker::new().shrink(failing, &mut is_interesting, far_deadline())
    }

    #[test]
    fn integers_reach_the_exact_boundary() {
        let shrunk = single_integer(|v| v >= 50, 99);
        assert_eq!(shrunk, ChoiceSequence::new(vec![Choice::Integer(50)]));
    }

    #[test]
    fn negative_integers_shrink_toward_zero() {
        let shrunk = single_integer(|v| v <= -3, -5000);
        assert_eq!(shrunk, ChoiceSequence::new(vec![Choice::Integer(-3)]));

        let shrunk = single_integer(|v| v.abs() >= 7, -900);
        assert_eq!(shrunk, ChoiceSequence::new(vec![Choice::Integer(7)]));
    }
}
