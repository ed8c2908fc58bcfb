use crate::behavior::Fingerprint;
use crate::choices::ChoiceSequence;
use crate::corpus::FixedFailure;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

/// Kinds of pending work, from most to least urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Replay of a stored, already-shrunk failure.
    FailureShrunk,
    /// Replay of a stored failure whose shrink never completed.
    FailureUnshrunk,
    /// Replay of a failure that previously stopped reproducing.
    FailureFixed,
    /// Re-execution of an input that claimed new coverage.
    Stability,
    /// Replay of this target's own persisted corpus.
    Covering,
    /// Replay of corpus entries saved by other workers.
    CoveringOtherWorker,
}

impl Priority {
    pub fn is_failure_replay(self) -> bool {
        matches!(
            self,
            Priority::FailureShrunk | Priority::FailureUnshrunk | Priority::FailureFixed
        )
    }
}

/// Data carried alongside a queued sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueExtra {
    /// The fingerprint a stability recheck must reproduce, and whether the original
    /// execution came from the replay phase.
    Stability {
        fingerprint: Fingerprint,
        from_replay: bool,
    },
    /// The fixed-failure record being replayed.
    Fixed(FixedFailure),
}

#[derive(Debug, Clone)]
pub struct QueueElement {
    pub priority: Priority,
    pub choices: ChoiceSequence,
    pub extra: Option<QueueExtra>,
}

impl QueueElement {
    fn sort_key(&self) -> (Priority, &ChoiceSequence) {
        (self.priority, &self.choices)
    }
}

impl PartialEq for QueueElement {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for QueueElement {}

impl Ord for QueueElement {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for QueueElement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending replay and recheck work for one target, served ahead of fresh mutation.
///
/// A min-priority queue: more urgent priorities pop first and, within a priority,
/// shortlex-smaller sequences pop first. Enqueueing a sequence that is already
/// pending at an equal or more urgent priority is a no-op.
#[derive(Debug, Default)]
pub struct ExecutionQueue {
    heap: BinaryHeap<Reverse<QueueElement>>,
    /// Most urgent pending priority per sequence.
    pending: HashMap<ChoiceSequence, Priority>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the element was added.
    pub fn enqueue(
        &mut self,
        priority: Priority,
        choices: ChoiceSequence,
        extra: Option<QueueExtra>,
    ) -> bool {
        if let Some(existing) = self.pending.get(&choices) {
            if *existing <= priority {
                return false;
            }
        }
        self.pending.insert(choices.clone(), priority);
        self.heap.push(Reverse(QueueElement {
            priority,
            choices,
            extra,
        }));
        true
    }

    pub fn pop_next(&mut self) -> Option<QueueElement> {
        while let Some(Reverse(element)) = self.heap.pop() {
            // A sequence re-enqueued at a more urgent priority leaves a superseded
            // copy behind; skip it.
            match self.pending.get(&element.choices) {
                Some(priority) if *priority == element.priority => {
                    self.pending.remove(&element.choices);
                    return Some(element);
                }
                _ => continue,
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True if anything other than stability rechecks is pending.
    pub fn has_replay_work(&self) -> bool {
        self.pending.values().any(|p| *p != Priority::Stability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(bytes: &[u8]) -> ChoiceSequence {
        ChoiceSequence::from(bytes)
    }

    #[test]
    fn pops_by_priority_then_shortlex() {
        let mut queue = ExecutionQueue::new();
        queue.enqueue(Priority::Stability, seq(b"02"), None);
        queue.enqueue(Priority::FailureShrunk, seq(b"99"), None);
        queue.enqueue(Priority::Covering, seq(b"01"), None);

        let order: Vec<Priority> = std::iter::from_fn(|| queue.pop_next())
            .map(|e| e.priority)
            .collect();
        assert_eq!(
            order,
            vec![
                Priority::FailureShrunk,
                Priority::Stability,
                Priority::Covering
            ]
        );
        assert!(queue.pop_next().is_none());
    }

    #[test]
    fn ties_break_by_shortlex_order() {
        let mut queue = ExecutionQueue::new();
        queue.enqueue(Priority::Covering, seq(b"123"), None);
        queue.enqueue(Priority::Covering, seq(b"9"), None);
        queue.enqueue(Priority::Covering, seq(b"12"), None);
        let order: Vec<ChoiceSequence> = std::iter::from_fn(|| queue.pop_next())
            .map(|e| e.choices)
            .collect();
        assert_eq!(order, vec![seq(b"9"), seq(b"12"), seq(b"123")]);
    }

    #[test]
    fn enqueue_is_idempotent_and_upgrades_priority() {
        let mut queue = ExecutionQueue::new();
        assert!(queue.enqueue(Priority::Covering, seq(b"a"), None));
        assert!(!queue.enqueue(Priority::Covering, seq(b"a"), None));
        assert!(!queue.enqueue(Priority::CoveringOtherWorker, seq(b"a"), None));
        assert_eq!(queue.len(), 1);

        assert!(queue.enqueue(Priority::FailureShrunk, seq(b"a"), None));
        assert_eq!(queue.len(), 1);
        let element = queue.pop_next().unwrap();
        assert_eq!(element.priority, Priority::FailureShrunk);
        assert!(queue.pop_next().is_none(), "superseded copy must be skipped");
        assert!(queue.is_empty());
    }

    #[test]
    fn stability_only_queue_has_no_replay_work() {
        let mut queue = ExecutionQueue::new();
        queue.enqueue(Priority::Stability, seq(b"s"), None);
        assert!(!queue.has_replay_work());
        queue.enqueue(Priority::CoveringOtherWorker, seq(b"o"), None);
        assert!(queue.has_replay_work());
    }
}
