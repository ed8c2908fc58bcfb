use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock};

/// Process-wide intern table. Behaviors are never removed: the set of distinct
/// behaviors a process can observe is bounded by its code.
static INTERNER: LazyLock<Mutex<HashSet<Arc<BehaviorKind>>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// A source position inside a test body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl Location {
    /// The location of the caller of the function this is invoked from.
    #[track_caller]
    pub fn caller() -> Self {
        let location = std::panic::Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
            column: location.column(),
        }
    }

    /// A synthetic location used for the start of every execution.
    pub const fn entry() -> Self {
        Self {
            file: "<entry>",
            line: 0,
            column: 0,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// What a single behavior describes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BehaviorKind {
    /// A control-flow edge between two recorded locations.
    Edge { from: Location, to: Location },
    /// A user-labelled event, optionally with a stringified payload.
    Event {
        label: String,
        payload: Option<String>,
    },
    /// A numeric observation, bucketed by magnitude.
    Target { label: String, bucket: u32 },
}

/// An interned, immutable unit of observed program activity.
///
/// Two behaviors built from equal [`BehaviorKind`]s share one allocation, so clones
/// and comparisons stay cheap no matter how often a behavior is seen.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Behavior(Arc<BehaviorKind>);

impl Behavior {
    pub fn intern(kind: BehaviorKind) -> Self {
        let mut table = INTERNER.lock();
        if let Some(existing) = table.get(&kind) {
            return Self(Arc::clone(existing));
        }
        let shared = Arc::new(kind);
        table.insert(Arc::clone(&shared));
        Self(shared)
    }

    pub fn edge(from: Location, to: Location) -> Self {
        Self::intern(BehaviorKind::Edge { from, to })
    }

    pub fn event(label: impl Into<String>, payload: Option<String>) -> Self {
        Self::intern(BehaviorKind::Event {
            label: label.into(),
            payload,
        })
    }

    /// A target observation. `value` is bucketed by its base-2 magnitude so that
    /// behaviors stay finite while still rewarding growth.
    pub fn target(label: impl Into<String>, value: f64) -> Self {
        Self::intern(BehaviorKind::Target {
            label: label.into(),
            bucket: magnitude_bucket(value),
        })
    }

    pub fn kind(&self) -> &BehaviorKind {
        &self.0
    }

    /// True when both handles point at the same interned allocation.
    pub fn shares_storage(&self, other: &Behavior) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

fn magnitude_bucket(value: f64) -> u32 {
    if !value.is_finite() || value < 1.0 {
        return 0;
    }
    // `value >= 1.0` here, so log2 is non-negative.
    (value.log2().floor() as u32).saturating_add(1)
}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Behavior({self})")
    }
}

impl fmt::Display for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            BehaviorKind::Edge { from, to } => write!(f, "edge {from} -> {to}"),
            BehaviorKind::Event {
                label,
                payload: None,
            } => write!(f, "event {label}"),
            BehaviorKind::Event {
                label,
                payload: Some(payload),
            } => write!(f, "event {label}={payload}"),
            BehaviorKind::Target { label, bucket } => write!(f, "target {label}[{bucket}]"),
        }
    }
}

/// The complete set of behaviors observed in one execution.
///
/// Backed by an ordered set, so two executions that saw the same behaviors in a
/// different order have equal (and equally hashed) fingerprints.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Fingerprint(Arc<BTreeSet<Behavior>>);

impl Fingerprint {
    pub fn new(behaviors: BTreeSet<Behavior>) -> Self {
        Self(Arc::new(behaviors))
    }

    pub fn contains(&self, behavior: &Behavior) -> bool {
        self.0.contains(behavior)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Behavior> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Behavior> for Fingerprint {
    fn from_iter<T: IntoIterator<Item = Behavior>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Fingerprint {
    type Item = &'a Behavior;
    type IntoIter = std::collections::btree_set::Iter<'a, Behavior>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}
