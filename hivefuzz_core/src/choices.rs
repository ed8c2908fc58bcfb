use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    error::{DecodeError, EncodeError},
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// One primitive generation decision.
///
/// Floats are stored by their bit pattern so that every choice has a total order
/// and can be hashed. Integers order by magnitude first, so moving toward zero is
/// always a simplification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub enum Choice {
    Boolean(bool),
    Integer(i64),
    Float(u64),
    Bytes(Vec<u8>),
}

impl Choice {
    /// Returns a choice of the same kind that is "simpler" (closer to zero), or `None`
    /// if this choice is already the simplest of its kind.
    pub fn simplified(&self) -> Option<Choice> {
        match self {
            Choice::Boolean(true) => Some(Choice::Boolean(false)),
            Choice::Boolean(false) => None,
            Choice::Integer(0) => None,
            Choice::Integer(v) => Some(Choice::Integer(v / 2)),
            Choice::Float(0) => None,
            Choice::Float(_) => Some(Choice::Float(0)),
            Choice::Bytes(b) if b.is_empty() => None,
            Choice::Bytes(b) => Some(Choice::Bytes(b[..b.len() / 2].to_vec())),
        }
    }
}

impl Choice {
    fn rank(&self) -> u8 {
        match self {
            Choice::Boolean(_) => 0,
            Choice::Integer(_) => 1,
            Choice::Float(_) => 2,
            Choice::Bytes(_) => 3,
        }
    }
}

impl Ord for Choice {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Choice::Boolean(a), Choice::Boolean(b)) => a.cmp(b),
            (Choice::Integer(a), Choice::Integer(b)) => {
                (a.unsigned_abs(), *a < 0).cmp(&(b.unsigned_abs(), *b < 0))
            }
            (Choice::Float(a), Choice::Float(b)) => a.cmp(b),
            (Choice::Bytes(a), Choice::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Choice {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choice::Boolean(b) => write!(f, "{b}"),
            Choice::Integer(i) => write!(f, "{i}"),
            Choice::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            Choice::Bytes(b) => write!(f, "{b:?}"),
        }
    }
}

/// An immutable, replayable recipe of generation decisions.
///
/// Cloning is cheap (the choices are shared). `Ord` is shortlex: shorter sequences
/// sort first, equal-length sequences compare element-wise. "Minimal" always means
/// minimal in this order.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChoiceSequence(Arc<[Choice]>);

impl ChoiceSequence {
    pub fn new(choices: Vec<Choice>) -> Self {
        Self(choices.into())
    }

    /// The empty recipe: replaying it draws every value fresh.
    pub fn empty() -> Self {
        Self(Vec::<Choice>::new().into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Choice] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Choice> {
        self.0.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Choice> {
        self.0.get(index)
    }

    /// The first `len` choices (or the whole sequence when `len` exceeds it).
    pub fn prefix(&self, len: usize) -> ChoiceSequence {
        let len = len.min(self.len());
        Self::new(self.0[..len].to_vec())
    }

    /// Builds `self ++ other` as a new sequence.
    pub fn concat(&self, other: &ChoiceSequence) -> ChoiceSequence {
        let mut out = Vec::with_capacity(self.len() + other.len());
        out.extend_from_slice(&self.0);
        out.extend_from_slice(&other.0);
        Self::new(out)
    }

    /// A copy of this sequence with the choice at `index` replaced.
    pub fn with_replaced(&self, index: usize, choice: Choice) -> ChoiceSequence {
        let mut out = self.0.to_vec();
        if let Some(slot) = out.get_mut(index) {
            *slot = choice;
        }
        Self::new(out)
    }

    /// A copy of this sequence with `range` removed.
    pub fn without_range(&self, start: usize, end: usize) -> ChoiceSequence {
        let end = end.min(self.len());
        let start = start.min(end);
        let mut out = Vec::with_capacity(self.len() - (end - start));
        out.extend_from_slice(&self.0[..start]);
        out.extend_from_slice(&self.0[end..]);
        Self::new(out)
    }

    pub(crate) fn wire_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
        bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding()
    }

    /// Encodes the sequence for the persistent store.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        bincode::encode_to_vec(self.0.as_ref(), Self::wire_config())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (choices, _len): (Vec<Choice>, usize) =
            bincode::decode_from_slice(bytes, Self::wire_config())?;
        Ok(Self::new(choices))
    }
}

impl Default for ChoiceSequence {
    fn default() -> Self {
        Self::empty()
    }
}

impl Ord for ChoiceSequence {
    fn cmp(&self, other: &Self) -> Ordering {
        self.len()
            .cmp(&other.len())
            .then_with(|| self.0.as_ref().cmp(other.0.as_ref()))
    }
}

impl PartialOrd for ChoiceSequence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for ChoiceSequence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

impl<'de> Deserialize<'de> for ChoiceSequence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<Choice>::deserialize(deserializer).map(Self::new)
    }
}

impl From<Vec<Choice>> for ChoiceSequence {
    fn from(choices: Vec<Choice>) -> Self {
        Self::new(choices)
    }
}

/// Each byte becomes one integer choice. Mostly useful for hand-written fixtures.
impl From<&[u8]> for ChoiceSequence {
    fn from(bytes: &[u8]) -> Self {
        bytes.iter().map(|b| Choice::Integer(*b as i64)).collect()
    }
}

impl FromIterator<Choice> for ChoiceSequence {
    fn from_iter<T: IntoIterator<Item = Choice>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl fmt::Debug for ChoiceSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChoiceSequence(")?;
        f.debug_list().entries(self.0.iter()).finish()?;
        write!(f, ")")
    }
}

impl fmt::Display for ChoiceSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, choice) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{choice}")?;
        }
        write!(f, "]")
    }
}
