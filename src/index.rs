//! Candidate references and the metadata vocabulary shared by filters,
//! sorters and renderers.
use crate::{CandidateArray, Score};
use serde_json::Value;
use smallvec::SmallVec;
use std::{borrow::Cow, collections::BTreeMap, ops::Range};

/// Score attached by the order-preserving subsequence predicate
pub const FUZZY_SCORE: &str = "fuzzy.score";
/// Matched character offsets attached by the order-preserving subsequence predicate
pub const FUZZY_OFFSETS: &str = "fuzzy.offsets";
/// Matched character ranges attached by the literal/regex predicates
pub const MATCH_RANGES: &str = "match.ranges";

/// Metadata key, namespaced per concern (`<owner>.<name>`)
pub type MetaKey = Cow<'static, str>;

/// Matched character offsets
pub type Offsets = SmallVec<[usize; 16]>;

/// Metadata value attached to a reference
#[derive(Debug, Clone, PartialEq)]
pub enum Meta {
    Score(Score),
    Offsets(Offsets),
    Ranges(Vec<Range<usize>>),
    Value(Value),
}

impl Meta {
    pub fn as_score(&self) -> Option<Score> {
        match self {
            Meta::Score(score) => Some(*score),
            _ => None,
        }
    }

    pub fn as_offsets(&self) -> Option<&[usize]> {
        match self {
            Meta::Offsets(offsets) => Some(offsets.as_slice()),
            _ => None,
        }
    }

    pub fn as_ranges(&self) -> Option<&[Range<usize>]> {
        match self {
            Meta::Ranges(ranges) => Some(ranges.as_slice()),
            _ => None,
        }
    }
}

/// Function used to fold new metadata value into the previous one
pub type Combine = fn(Option<Meta>, Meta) -> Meta;

/// Replace previous value
pub fn replace(_prev: Option<Meta>, value: Meta) -> Meta {
    value
}

/// Accumulate: scores are added, offsets and ranges are concatenated,
/// anything else is replaced
pub fn accumulate(prev: Option<Meta>, value: Meta) -> Meta {
    match (prev, value) {
        (Some(Meta::Score(prev)), Meta::Score(value)) => Meta::Score(prev + value),
        (Some(Meta::Offsets(mut prev)), Meta::Offsets(value)) => {
            prev.extend(value);
            Meta::Offsets(prev)
        }
        (Some(Meta::Ranges(mut prev)), Meta::Ranges(value)) => {
            prev.extend(value);
            Meta::Ranges(prev)
        }
        (_, value) => value,
    }
}

/// Reference to a candidate inside of its [CandidateArray] plus the metadata
/// accumulated by the filters it passed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reference {
    position: usize,
    metadata: BTreeMap<MetaKey, Meta>,
}

impl Reference {
    pub fn new(position: usize) -> Self {
        Self {
            position,
            metadata: BTreeMap::new(),
        }
    }

    /// Position inside the candidate array
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn get(&self, key: &str) -> Option<&Meta> {
        self.metadata.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.metadata.contains_key(key)
    }

    /// Iterator over all metadata entries ordered by key
    pub fn metadata(&self) -> impl Iterator<Item = (&str, &Meta)> + '_ {
        self.metadata.iter().map(|(key, meta)| (key.as_ref(), meta))
    }

    pub fn score(&self) -> Option<Score> {
        self.get(FUZZY_SCORE)?.as_score()
    }

    /// Fold each `(key, value, combine)` into the metadata
    ///
    /// This is the only way metadata is produced, position is never changed.
    pub fn update<K, I>(mut self, updates: I) -> Self
    where
        K: Into<MetaKey>,
        I: IntoIterator<Item = (K, Meta, Combine)>,
    {
        for (key, value, combine) in updates {
            let key = key.into();
            let prev = self.metadata.remove(&key);
            self.metadata.insert(key, combine(prev, value));
        }
        self
    }

    /// Update with a single value replacing the previous one
    pub fn with(self, key: impl Into<MetaKey>, value: Meta) -> Self {
        self.update([(key.into(), value, replace as Combine)])
    }
}

impl From<usize> for Reference {
    fn from(position: usize) -> Self {
        Reference::new(position)
    }
}

/// References to every logical slot of the array, in ascending order
pub fn make_indices(candidates: &CandidateArray) -> Vec<Reference> {
    (0..candidates.len()).map(Reference::new).collect()
}

/// Primary matchable value of the referenced candidate
pub fn resolve<'a>(candidates: &'a CandidateArray, reference: &Reference) -> Option<&'a str> {
    candidates
        .get(reference.position)
        .map(|candidate| candidate.primary())
}
