// CONSTRAINT SETS & FINGERPRINTS
//
// A constraint is an opaque identifier. A ConstraintSet is immutable once
// built and remembers insertion order, because the diagnosis recursion and
// the speculative scheduler bisect sets by that order.
//
// INVARIANTS:
// 1. No identifier appears twice in a set
// 2. Equality ignores order (two sets are equal iff their members are equal)
// 3. The fingerprint is computed once, from the sorted members

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::errors::DiagnosisError;

/// Opaque identifier of a single constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConstraintId(pub u32);

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Hash-based identity of a constraint set (first 8 bytes of SHA-256)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    fn compute(sorted: &[ConstraintId]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((sorted.len() as u64).to_le_bytes());
        for id in sorted {
            hasher.update(id.0.to_le_bytes());
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        Fingerprint(u64::from_le_bytes(head))
    }

    pub fn as_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_hex())
    }
}

/// Immutable, unordered collection of constraints that keeps insertion order
/// for splitting.
#[derive(Clone)]
pub struct ConstraintSet {
    ordered: Arc<[ConstraintId]>,
    sorted: Arc<[ConstraintId]>,
    fingerprint: Fingerprint,
}

impl ConstraintSet {
    /// The empty set
    pub fn empty() -> Self {
        Self::from_ordered(Vec::new())
    }

    /// Build a set from identifiers; later duplicates are dropped.
    pub fn from_ids<I: IntoIterator<Item = ConstraintId>>(ids: I) -> Self {
        let mut seen = HashSet::new();
        let ordered: Vec<ConstraintId> = ids.into_iter().filter(|id| seen.insert(*id)).collect();
        Self::from_ordered(ordered)
    }

    fn from_ordered(ordered: Vec<ConstraintId>) -> Self {
        let mut sorted = ordered.clone();
        sorted.sort_unstable();
        let fingerprint = Fingerprint::compute(&sorted);
        ConstraintSet {
            ordered: ordered.into(),
            sorted: sorted.into(),
            fingerprint,
        }
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Members in insertion order
    pub fn iter(&self) -> impl Iterator<Item = ConstraintId> + '_ {
        self.ordered.iter().copied()
    }

    /// First member in insertion order, if any
    pub fn first(&self) -> Option<ConstraintId> {
        self.ordered.first().copied()
    }

    pub fn contains(&self, id: ConstraintId) -> bool {
        self.sorted.binary_search(&id).is_ok()
    }

    /// `self ⊆ other`
    pub fn is_subset_of(&self, other: &ConstraintSet) -> bool {
        if self.len() > other.len() {
            return false;
        }
        let mut theirs = other.sorted.iter();
        'outer: for mine in self.sorted.iter() {
            for candidate in theirs.by_ref() {
                if candidate == mine {
                    continue 'outer;
                }
                if candidate > mine {
                    return false;
                }
            }
            return false;
        }
        true
    }

    /// `self ⊇ other`
    pub fn is_superset_of(&self, other: &ConstraintSet) -> bool {
        other.is_subset_of(self)
    }

    /// Members of `self` followed by the members of `other` not already present.
    pub fn union(&self, other: &ConstraintSet) -> ConstraintSet {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut ordered = self.ordered.to_vec();
        ordered.extend(other.iter().filter(|id| !self.contains(*id)));
        Self::from_ordered(ordered)
    }

    /// Members of `self` that are not in `other`, in `self`'s order.
    pub fn difference(&self, other: &ConstraintSet) -> ConstraintSet {
        if other.is_empty() {
            return self.clone();
        }
        Self::from_ordered(self.iter().filter(|id| !other.contains(*id)).collect())
    }

    /// Bisect by insertion order into two non-empty, disjoint halves whose
    /// union is `self`. The left half holds the first `len / 2` members.
    /// Returns `None` for sets with fewer than two members.
    pub fn split(&self) -> Option<(ConstraintSet, ConstraintSet)> {
        if self.len() < 2 {
            return None;
        }
        let k = self.len() / 2;
        let left = Self::from_ordered(self.ordered[..k].to_vec());
        let right = Self::from_ordered(self.ordered[k..].to_vec());
        Some((left, right))
    }
}

impl PartialEq for ConstraintSet {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint && self.sorted == other.sorted
    }
}

impl Eq for ConstraintSet {}

impl Hash for ConstraintSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fingerprint.0);
    }
}

impl fmt::Debug for ConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for ConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, id) in self.ordered.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", id)?;
        }
        f.write_str("}")
    }
}

impl FromIterator<ConstraintId> for ConstraintSet {
    fn from_iter<I: IntoIterator<Item = ConstraintId>>(iter: I) -> Self {
        ConstraintSet::from_ids(iter)
    }
}

/// Interns constraint names so that sets can be written and printed by name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    names: Vec<String>,
    index: HashMap<String, ConstraintId>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the identifier for `name`, allocating one on first use.
    pub fn intern(&mut self, name: &str) -> ConstraintId {
        if let Some(id) = self.index.get(name) {
            return *id;
        }
        let id = ConstraintId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        id
    }

    pub fn id(&self, name: &str) -> Option<ConstraintId> {
        self.index.get(name).copied()
    }

    pub fn name(&self, id: ConstraintId) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Builds a set from names, interning unknown ones.
    pub fn set<'a, I>(&mut self, names: I) -> ConstraintSet
    where
        I: IntoIterator<Item = &'a str>,
    {
        let ids: Vec<ConstraintId> = names.into_iter().map(|n| self.intern(n)).collect();
        ConstraintSet::from_ids(ids)
    }

    /// Builds a set from names that must already be interned.
    pub fn lookup_set<'a, I>(&self, names: I) -> Result<ConstraintSet, DiagnosisError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut ids = Vec::new();
        for name in names {
            let id = self
                .id(name)
                .ok_or_else(|| DiagnosisError::UnknownConstraint(name.to_string()))?;
            ids.push(id);
        }
        Ok(ConstraintSet::from_ids(ids))
    }

    /// Names of the members of `set`, in insertion order
    pub fn names_of(&self, set: &ConstraintSet) -> Vec<String> {
        set.iter()
            .map(|id| self.name(id).map(str::to_string).unwrap_or_else(|| id.to_string()))
            .collect()
    }

    pub fn render(&self, set: &ConstraintSet) -> String {
        format!("{{{}}}", self.names_of(set).join(", "))
    }
}
