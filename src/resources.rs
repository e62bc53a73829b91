//! Resource algebra: named resource scalars, addition, filtering, and the
//! componentwise partial order used to rank preemption candidates.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A kind of schedulable resource.
///
/// `RevocableCpu` is the revocable-tagged variant of CPU: it is compressible
/// and cannot back a non-revocable claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Cpu,
    RevocableCpu,
    RamMb,
    DiskMb,
    Ports,
}

impl ResourceKind {
    /// Whether this kind is a revocable resource.
    pub fn is_revocable(&self) -> bool {
        matches!(self, ResourceKind::RevocableCpu)
    }
}

/// A mapping from resource kind to a numeric amount.
///
/// Missing keys are treated as zero everywhere a value is read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceBag(BTreeMap<ResourceKind, f64>);

impl ResourceBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I: IntoIterator<Item = (ResourceKind, f64)>>(pairs: I) -> Self {
        let mut bag = Self::new();
        for (kind, amount) in pairs {
            bag.0.insert(kind, amount);
        }
        bag
    }

    /// The amount of `kind` held in this bag, or zero if absent.
    pub fn value_of(&self, kind: ResourceKind) -> f64 {
        self.0.get(&kind).copied().unwrap_or(0.0)
    }

    /// Iterate over (kind, value) pairs actually present in the bag.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, f64)> + '_ {
        self.0.iter().map(|(&k, &v)| (k, v))
    }

    /// The set of resource kinds present in this bag.
    pub fn keys(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.0.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|&v| v == 0.0)
    }

    /// Componentwise addition over the union of both bags' keys.
    pub fn add(&self, other: &ResourceBag) -> ResourceBag {
        let mut result = self.0.clone();
        for (&kind, &amount) in other.0.iter() {
            *result.entry(kind).or_insert(0.0) += amount;
        }
        ResourceBag(result)
    }

    /// Keep only entries for which `predicate` returns true.
    pub fn filter(&self, predicate: impl Fn(ResourceKind) -> bool) -> ResourceBag {
        ResourceBag(
            self.0
                .iter()
                .filter(|(&kind, _)| predicate(kind))
                .map(|(&kind, &amount)| (kind, amount))
                .collect(),
        )
    }

    /// Strip revocable resource kinds, zeroing their amount rather than
    /// removing the key, so downstream accounting can still see that the
    /// kind was present pre-strip.
    pub fn strip_revocable(&self) -> ResourceBag {
        let mut result = self.0.clone();
        for (&kind, amount) in result.iter_mut() {
            if kind.is_revocable() {
                *amount = 0.0;
            }
        }
        ResourceBag(result)
    }
}

/// Result of comparing two resource bags under the componentwise partial
/// order. Mixed-sign deltas collapse to `Equal` by design: this
/// keeps the order a total preorder suitable for stable sorting while
/// preserving the dominance property the preemption ranker depends on.
///
/// The comparator is intentionally a free function rather than an
/// `Ord`/`PartialOrd` impl on `ResourceBag`: per the open question in the
/// design notes, the ordering must stay pluggable (e.g. to later support
/// dominant-resource fairness) rather than being baked into the language's
/// default comparison machinery.
pub fn compare(left: &ResourceBag, right: &ResourceBag) -> Ordering {
    let mut keys: Vec<ResourceKind> = left.keys().chain(right.keys()).collect();
    keys.sort_unstable();
    keys.dedup();

    let mut saw_positive = false;
    let mut saw_negative = false;

    for kind in keys {
        let delta = left.value_of(kind) - right.value_of(kind);
        if delta > 0.0 {
            saw_positive = true;
        } else if delta < 0.0 {
            saw_negative = true;
        }
    }

    match (saw_positive, saw_negative) {
        (false, false) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (true, true) => Ordering::Equal, // mixed signs: incomparable, reported as a tie.
    }
}
