use crate::behavior::{Behavior, Fingerprint, Location};
use crate::choices::{Choice, ChoiceSequence};
use rand::Rng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Once;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Default cap on the number of choices a single execution may draw.
pub const DEFAULT_MAX_CHOICES: usize = 8 * 1024;

/// Outcome of one execution, ordered from least to most significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// The test tried to draw more choices than allowed.
    Overrun,
    /// The test rejected the input (a failed `assume`).
    Invalid,
    Valid,
    /// The test failed.
    Interesting,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Overrun,
        Status::Invalid,
        Status::Valid,
        Status::Interesting,
    ];
}

/// Early exit from a test body, propagated with `?` from draws and `assume`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopTest {
    Invalid,
    Overrun,
}

/// The externally visible record of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub status: Status,
    pub choices: ChoiceSequence,
    pub representation: String,
    pub timing_us: u64,
    pub features: BTreeMap<String, String>,
    /// Deduplication key for failures; `None` unless `status` is `Interesting`.
    pub signature: Option<String>,
    pub timestamp: u64,
}

impl Observation {
    pub fn is_failure(&self) -> bool {
        self.status == Status::Interesting
    }
}

/// Everything the engine learns from running one input.
#[derive(Debug, Clone)]
pub struct Execution {
    pub status: Status,
    pub fingerprint: Fingerprint,
    pub observation: Observation,
}

impl Execution {
    pub fn choices(&self) -> &ChoiceSequence {
        &self.observation.choices
    }
}

/// Runs one test input end-to-end.
///
/// Given a prefix of choices to replay (empty means "draw everything fresh"), an
/// executor runs the test once and reports what happened. Executing the same prefix
/// twice against a deterministic test must produce the same fingerprint.
pub trait Executor: Send {
    fn execute(&mut self, prefix: &ChoiceSequence, rng: &mut dyn RngCore) -> Execution;
}

/// The handle a test body draws its inputs from and reports behaviors to.
///
/// Draws replay `prefix` position by position; once the prefix is exhausted, or when
/// a prefix choice has the wrong kind, fresh values come from the random source.
pub struct TestCase<'a> {
    prefix: &'a ChoiceSequence,
    rng: &'a mut dyn RngCore,
    choices: Vec<Choice>,
    max_choices: usize,
    behaviors: BTreeSet<Behavior>,
    last_location: Location,
    features: BTreeMap<String, String>,
}

impl<'a> TestCase<'a> {
    pub fn new(prefix: &'a ChoiceSequence, rng: &'a mut dyn RngCore, max_choices: usize) -> Self {
        Self {
            prefix,
            rng,
            choices: Vec::new(),
            max_choices,
            behaviors: BTreeSet::new(),
            last_location: Location::entry(),
            features: BTreeMap::new(),
        }
    }

    fn replayed(&self) -> Option<&'a Choice> {
        self.prefix.get(self.choices.len())
    }

    fn record(&mut self, choice: Choice) -> Result<(), StopTest> {
        if self.choices.len() >= self.max_choices {
            return Err(StopTest::Overrun);
        }
        self.choices.push(choice);
        Ok(())
    }

    /// Draws an integer in the inclusive range `[min, max]`.
    pub fn draw_integer(&mut self, min: i64, max: i64) -> Result<i64, StopTest> {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        let value = match self.replayed() {
            Some(Choice::Integer(v)) if (min..=max).contains(v) => *v,
            Some(Choice::Integer(v)) => {
                // Fold out-of-range replays back into range deterministically.
                let span = (max as i128) - (min as i128) + 1;
                let offset = ((*v as i128) - (min as i128)).rem_euclid(span);
                (min as i128 + offset) as i64
            }
            _ => self.rng.random_range(min..=max),
        };
        self.record(Choice::Integer(value))?;
        Ok(value)
    }

    pub fn draw_bool(&mut self, p_true: f64) -> Result<bool, StopTest> {
        let value = match self.replayed() {
            Some(Choice::Boolean(b)) => *b,
            _ => self.rng.random_bool(p_true.clamp(0.0, 1.0)),
        };
        self.record(Choice::Boolean(value))?;
        Ok(value)
    }

    /// Draws a finite float in `[min, max]`.
    pub fn draw_float(&mut self, min: f64, max: f64) -> Result<f64, StopTest> {
        if !(min.is_finite() && max.is_finite()) || min > max {
            return Err(StopTest::Invalid);
        }
        let value = match self.replayed() {
            Some(Choice::Float(bits))
                if f64::from_bits(*bits).is_finite()
                    && (min..=max).contains(&f64::from_bits(*bits)) =>
            {
                f64::from_bits(*bits)
            }
            _ => self.rng.random_range(min..=max),
        };
        self.record(Choice::Float(value.to_bits()))?;
        Ok(value)
    }

    /// Draws a byte string whose length lies in `[min_len, max_len]`.
    pub fn draw_bytes(&mut self, min_len: usize, max_len: usize) -> Result<Vec<u8>, StopTest> {
        let max_len = max_len.max(min_len);
        let value = match self.replayed() {
            Some(Choice::Bytes(bytes)) => {
                let mut bytes = bytes.clone();
                bytes.truncate(max_len);
                bytes.resize(bytes.len().max(min_len), 0);
                bytes
            }
            _ => {
                let len = self.rng.random_range(min_len..=max_len);
                let mut bytes = vec![0u8; len];
                self.rng.fill_bytes(&mut bytes);
                bytes
            }
        };
        self.record(Choice::Bytes(value.clone()))?;
        Ok(value)
    }

    /// Rejects the current input unless `condition` holds.
    pub fn assume(&mut self, condition: bool) -> Result<(), StopTest> {
        if condition {
            Ok(())
        } else {
            Err(StopTest::Invalid)
        }
    }

    /// Records a control-flow edge from the previously recorded location to the
    /// caller's location.
    #[track_caller]
    pub fn branch(&mut self) {
        let here = Location::caller();
        self.behaviors.insert(Behavior::edge(self.last_location, here));
        self.last_location = here;
    }

    pub fn event(&mut self, label: &str) {
        self.behaviors.insert(Behavior::event(label, None));
    }

    pub fn event_with(&mut self, label: &str, payload: impl ToString) {
        let payload = payload.to_string();
        self.features.insert(label.to_string(), payload.clone());
        self.behaviors.insert(Behavior::event(label, Some(payload)));
    }

    /// Reports a numeric quantity the fuzzer should try to grow.
    pub fn target(&mut self, label: &str, value: f64) {
        self.features.insert(format!("target:{label}"), value.to_string());
        self.behaviors.insert(Behavior::target(label, value));
    }

    /// Attaches a feature to the observation without creating a behavior.
    pub fn note(&mut self, key: &str, value: impl ToString) {
        self.features.insert(key.to_string(), value.to_string());
    }

    pub fn drawn(&self) -> usize {
        self.choices.len()
    }

    fn finish(self) -> (ChoiceSequence, Fingerprint, BTreeMap<String, String>) {
        (
            ChoiceSequence::new(self.choices),
            Fingerprint::new(self.behaviors),
            self.features,
        )
    }
}

thread_local! {
    static CAPTURING_PANICS: Cell<bool> = const { Cell::new(false) };
    static LAST_PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Installs (once per process) a panic hook that records where the panic happened
/// and stays silent for panics raised inside an executor.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if CAPTURING_PANICS.with(Cell::get) {
                let location = info
                    .location()
                    .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
                LAST_PANIC_LOCATION.with(|slot| *slot.borrow_mut() = location);
            } else {
                previous(info);
            }
        }));
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Runs a test function in the current process, turning panics into
/// `Status::Interesting` results.
///
/// Failure signatures are the source location of the panic, so the same assertion
/// failing with different values deduplicates to one failure.
pub struct InProcessExecutor<F>
where
    F: Fn(&mut TestCase<'_>) -> Result<(), StopTest>,
{
    name: String,
    test_fn: F,
    max_choices: usize,
}

impl<F> InProcessExecutor<F>
where
    F: Fn(&mut TestCase<'_>) -> Result<(), StopTest>,
{
    pub fn new(name: impl Into<String>, test_fn: F) -> Self {
        install_panic_hook();
        Self {
            name: name.into(),
            test_fn,
            max_choices: DEFAULT_MAX_CHOICES,
        }
    }

    pub fn with_max_choices(mut self, max_choices: usize) -> Self {
        self.max_choices = max_choices;
        self
    }
}

impl<F> Executor for InProcessExecutor<F>
where
    F: Fn(&mut TestCase<'_>) -> Result<(), StopTest> + Send,
{
    fn execute(&mut self, prefix: &ChoiceSequence, rng: &mut dyn RngCore) -> Execution {
        let mut test_case = TestCase::new(prefix, rng, self.max_choices);
        let start = Instant::now();

        CAPTURING_PANICS.with(|flag| flag.set(true));
        LAST_PANIC_LOCATION.with(|slot| slot.borrow_mut().take());
        let result = catch_unwind(AssertUnwindSafe(|| (self.test_fn)(&mut test_case)));
        CAPTURING_PANICS.with(|flag| flag.set(false));

        let timing_us = start.elapsed().as_micros() as u64;
        let (status, signature, message) = match result {
            Ok(Ok(())) => (Status::Valid, None, None),
            Ok(Err(StopTest::Invalid)) => (Status::Invalid, None, None),
            Ok(Err(StopTest::Overrun)) => (Status::Overrun, None, None),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let location = LAST_PANIC_LOCATION.with(|slot| slot.borrow_mut().take());
                let signature = location.unwrap_or_else(|| message.clone());
                (Status::Interesting, Some(signature), Some(message))
            }
        };

        let (choices, fingerprint, mut features) = test_case.finish();
        if let Some(message) = &message {
            features.insert("panic".to_string(), message.clone());
        }
        let representation = match &message {
            Some(message) => format!("{}{} -> {}", self.name, choices, message),
            None => format!("{}{}", self.name, choices),
        };

        Execution {
            status,
            fingerprint,
            observation: Observation {
                status,
                choices,
                representation,
                timing_us,
                features,
                signature,
                timestamp: unix_now(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn run<F>(executor: &mut InProcessExecutor<F>, prefix: &ChoiceSequence) -> Execution
    where
        F: Fn(&mut TestCase<'_>) -> Result<(), StopTest> + Send,
    {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        executor.execute(prefix, &mut rng)
    }

    #[test]
    fn replaying_recorded_choices_reproduces_the_execution() {
        let mut executor = InProcessExecutor::new("replay", |tc: &mut TestCase<'_>| {
            let x = tc.draw_integer(0, 1000)?;
            let flag = tc.draw_bool(0.5)?;
            let bytes = tc.draw_bytes(0, 8)?;
            tc.event_with("x-parity", x % 2);
            if flag {
                tc.branch();
            }
            tc.note("len", bytes.len());
            Ok(())
        });
        let mut fresh_rng = ChaCha8Rng::seed_from_u64(99);
        let first = executor.execute(&ChoiceSequence::empty(), &mut fresh_rng);
        assert_eq!(first.status, Status::Valid);
        assert_eq!(first.choices().len(), 3);

        let replay = run(&mut executor, first.choices());
        assert_eq!(replay.choices(), first.choices());
        assert_eq!(replay.fingerprint, first.fingerprint);
    }

    #[test]
    fn out_of_range_replays_fold_into_range() {
        let mut executor = InProcessExecutor::new("fold", |tc: &mut TestCase<'_>| {
            let x = tc.draw_integer(10, 12)?;
            assert!((10..=12).contains(&x));
            Ok(())
        });
        let prefix = ChoiceSequence::new(vec![Choice::Integer(-5)]);
        let execution = run(&mut executor, &prefix);
        assert_eq!(execution.status, Status::Valid);
        assert_eq!(execution.choices().as_slice(), &[Choice::Integer(10)]);
    }

    #[test]
    fn assume_and_overrun_map_to_statuses() {
        let mut rejecting = InProcessExecutor::new("reject", |tc: &mut TestCase<'_>| {
            tc.assume(false)
        });
        assert_eq!(
            run(&mut rejecting, &ChoiceSequence::empty()).status,
            Status::Invalid
        );

        let mut greedy = InProcessExecutor::new("greedy", |tc: &mut TestCase<'_>| {
            loop {
                tc.draw_bool(0.5)?;
            }
        })
        .with_max_choices(16);
        let execution = run(&mut greedy, &ChoiceSequence::empty());
        assert_eq!(execution.status, Status::Overrun);
        assert_eq!(execution.choices().len(), 16);
    }

    #[test]
    fn panics_become_interesting_with_a_location_signature() {
        let mut executor = InProcessExecutor::new("boom", |tc: &mut TestCase<'_>| {
            let x = tc.draw_integer(0, 100)?;
            if x >= 0 {
                panic!("x was {x}");
            }
            Ok(())
        });
        let a = run(&mut executor, &ChoiceSequence::new(vec![Choice::Integer(3)]));
        let b = run(&mut executor, &ChoiceSequence::new(vec![Choice::Integer(4)]));
        assert_eq!(a.status, Status::Interesting);
        assert!(a.observation.is_failure());
        assert_eq!(a.observation.features.get("panic").unwrap(), "x was 3");
        assert!(a.observation.signature.as_deref().unwrap().contains("executor.rs"));
        assert_eq!(a.observation.signature, b.observation.signature);
    }
}
