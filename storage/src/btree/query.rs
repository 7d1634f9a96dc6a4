use std::ops::RangeInclusive;

/// A predicate on keys. Keys are compared as unsigned byte strings, and both bounds of
///  `Between` are inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexQuery {
    Equals(Vec<u8>),
    NotEquals(Vec<u8>),
    LessThan(Vec<u8>),
    LessOrEqual(Vec<u8>),
    GreaterThan(Vec<u8>),
    GreaterOrEqual(Vec<u8>),
    Between(Vec<u8>, Vec<u8>),
    NotBetween(Vec<u8>, Vec<u8>),
    BeginsWith(Vec<u8>),
    NotBeginsWith(Vec<u8>),
    In(Vec<Vec<u8>>),
    NotIn(Vec<Vec<u8>>),
}

impl IndexQuery {
    pub fn matches(&self, key: &[u8]) -> bool {
        use IndexQuery::*;

        match self {
            Equals(v) => key == v.as_slice(),
            NotEquals(v) => key != v.as_slice(),
            LessThan(v) => key < v.as_slice(),
            LessOrEqual(v) => key <= v.as_slice(),
            GreaterThan(v) => key > v.as_slice(),
            GreaterOrEqual(v) => key >= v.as_slice(),
            Between(lo, hi) => lo.as_slice() <= key && key <= hi.as_slice(),
            NotBetween(lo, hi) => key < lo.as_slice() || hi.as_slice() < key,
            BeginsWith(prefix) => key.starts_with(prefix),
            NotBeginsWith(prefix) => !key.starts_with(prefix),
            In(values) => values.iter().any(|v| v.as_slice() == key),
            NotIn(values) => values.iter().all(|v| v.as_slice() != key),
        }
    }

    /// The contiguous range of children of a branch node with the given separator keys that can
    ///  contain matching keys. Negated predicates can match anywhere, so they cover all children.
    pub fn child_range(&self, separators: &[Vec<u8>]) -> RangeInclusive<usize> {
        use IndexQuery::*;

        let child_of = |key: &[u8]| separators.partition_point(|s| s.as_slice() <= key);
        let all = 0..=separators.len();

        match self {
            Equals(v) => child_of(v.as_slice())..=child_of(v.as_slice()),
            LessThan(v) | LessOrEqual(v) => 0..=child_of(v.as_slice()),
            GreaterThan(v) | GreaterOrEqual(v) => child_of(v.as_slice())..=separators.len(),
            Between(lo, hi) => child_of(lo.as_slice())..=child_of(hi.as_slice()),
            BeginsWith(prefix) => {
                let last = separators.partition_point(|s| s.as_slice() < prefix.as_slice() || s.starts_with(prefix));
                child_of(prefix.as_slice())..=last
            }
            In(values) => {
                match (values.iter().min(), values.iter().max()) {
                    (Some(min), Some(max)) => child_of(min.as_slice())..=child_of(max.as_slice()),
                    // empty range
                    _ => 1..=0,
                }
            }
            NotEquals(_) | NotBetween(_, _) | NotBeginsWith(_) | NotIn(_) => all,
        }
    }
}
