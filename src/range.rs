use std::fmt;

use serde::{Deserialize, Serialize};

/// A half-open byte-key range `[begin, end)`.
///
/// Ordering of keys is plain lexicographic byte order, matching the engine's
/// bytewise comparator. An empty range has `begin >= end` and contains no key.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(begin: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// True iff the range contains no key.
    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    /// True iff `key` falls inside the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.begin.as_slice() <= key && key < self.end.as_slice()
    }

    /// True iff `other` lies entirely inside this range.
    pub fn contains_range(&self, other: &KeyRange) -> bool {
        other.is_empty() || (self.begin <= other.begin && other.end <= self.end)
    }

    /// True iff the two ranges share at least one key.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.begin < other.end
            && other.begin < self.end
    }

    /// The overlapping span of the two ranges, if any.
    pub fn intersection(&self, other: &KeyRange) -> Option<KeyRange> {
        if !self.intersects(other) {
            return None;
        }
        Some(KeyRange {
            begin: self.begin.clone().max(other.begin.clone()),
            end: self.end.clone().min(other.end.clone()),
        })
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.begin.escape_ascii(),
            self.end.escape_ascii()
        )
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Computes the spans of `requested` not yet covered by `covered`.
///
/// The covered ranges may arrive in any order but must be pairwise disjoint;
/// the result lists the leftover sub-ranges in ascending key order. This is
/// the interval arithmetic the fetcher uses to resume a partially completed
/// range fetch: already-materialized files cover their recorded ranges and
/// only the gaps are requested again.
pub fn uncovered_ranges(requested: &[KeyRange], covered: &[KeyRange]) -> Vec<KeyRange> {
    let mut covered: Vec<&KeyRange> = covered.iter().filter(|r| !r.is_empty()).collect();
    covered.sort_by(|a, b| a.begin.cmp(&b.begin));

    let mut out = Vec::new();
    for req in requested.iter().filter(|r| !r.is_empty()) {
        let mut cursor = req.begin.clone();
        for cov in &covered {
            if cov.end.as_slice() <= cursor.as_slice() {
                continue;
            }
            if cov.begin >= req.end {
                break;
            }
            if cov.begin.as_slice() > cursor.as_slice() {
                out.push(KeyRange {
                    begin: cursor.clone(),
                    end: cov.begin.clone().min(req.end.clone()),
                });
            }
            if cov.end.as_slice() > cursor.as_slice() {
                cursor = cov.end.clone();
            }
            if cursor >= req.end {
                break;
            }
        }
        if cursor < req.end {
            out.push(KeyRange {
                begin: cursor,
                end: req.end.clone(),
            });
        }
    }
    out
}
