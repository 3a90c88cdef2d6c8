//! Tag scoping: the security boundary between memories, observations,
//! mental models, and directives.
//!
//! Tags are unordered sets of strings. A row with an empty tag set is
//! "global" and visible under the lenient modes. Every read in the engine
//! goes through [`TagMatchMode::matches`] rather than ad-hoc set
//! comparisons, so the isolation rule lives in exactly one place.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Canonical, order-independent representation of a tag set: a sorted,
/// deduplicated list. Used both for storage (serialized as a JSON array)
/// and as the consolidation batching key (§4.5.1: "exact tag-set, sorted
/// canonical form").
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<String>);

impl TagSet {
    pub fn new(tags: impl IntoIterator<Item = String>) -> Self {
        Self(tags.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn union(&self, other: &TagSet) -> TagSet {
        TagSet(self.0.union(&other.0).cloned().collect())
    }

    /// Stable key for grouping rows by exact tag set (consolidation
    /// batching, §4.5.1 step 2). Two tag sets with the same members but
    /// different insertion order produce the same key because `TagSet`
    /// stores members in a `BTreeSet`.
    pub fn canonical_key(&self) -> String {
        self.0.iter().cloned().collect::<Vec<_>>().join("\u{1}")
    }

    pub fn is_subset_of(&self, other: &TagSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn intersects(&self, other: &TagSet) -> bool {
        !self.0.is_disjoint(&other.0)
    }

    pub fn as_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl From<Vec<String>> for TagSet {
    fn from(v: Vec<String>) -> Self {
        Self::new(v)
    }
}

impl FromIterator<String> for TagSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Tag filter mode applied on every read. See SPEC_FULL.md §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMatchMode {
    /// row ∩ query ≠ ∅ OR row = ∅ (global) OR query = ∅.
    Any,
    /// query ⊆ row OR row = ∅.
    All,
    /// row ∩ query ≠ ∅ only (globals excluded).
    AnyStrict,
    /// query ⊆ row only (globals excluded).
    AllStrict,
}

impl Default for TagMatchMode {
    fn default() -> Self {
        TagMatchMode::Any
    }
}

impl TagMatchMode {
    /// Does `row_tags` satisfy this mode's filter against `query_tags`?
    ///
    /// The empty-query base case is the literal Open Question resolution
    /// from SPEC_FULL.md §4.4 [FULL]: under `Any`/`All` an empty query
    /// matches every row; under `AnyStrict`/`AllStrict` an empty query
    /// matches only rows whose own tags are also empty.
    pub fn matches(&self, row_tags: &TagSet, query_tags: &TagSet) -> bool {
        match self {
            TagMatchMode::Any => {
                query_tags.is_empty() || row_tags.is_empty() || row_tags.intersects(query_tags)
            }
            TagMatchMode::All => {
                row_tags.is_empty() || query_tags.is_subset_of(row_tags)
            }
            TagMatchMode::AnyStrict => {
                if query_tags.is_empty() {
                    row_tags.is_empty()
                } else {
                    row_tags.intersects(query_tags)
                }
            }
            TagMatchMode::AllStrict => query_tags.is_subset_of(row_tags),
        }
    }
}
