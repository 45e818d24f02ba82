//! Prioritised corpus of interesting requests and the global coverage union.
//!
//! A request earns its place by raising the union (the highest bucket ever
//! observed per label) or by being a significantly cheaper stand-in for the
//! current contributor of some label. Each corpus member carries a ref-count:
//! one per union label for which it is the sole contributor. When a member's
//! last label is taken over by a cheaper request, it is evicted.
//!
//! Priorities change as the fuzzer runs (`picked_score` cooling, label
//! transfers), so the backing store is a hash-keyed map and `next()` selects
//! the current minimum of the priority ordering.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::instrument::{Bucket, Cfg, CfgPair, InstrumentMeta, Label, Policy};
use crate::request::Request;

/// A union slot: the highest bucket seen for a label, and the identity hash
/// of the corpus member that contributed it.
#[derive(Debug, Clone, Copy)]
struct UnionSlot {
    bucket: Bucket,
    owner: u64,
}

/// A corpus member and the number of union labels it solely contributes.
#[derive(Debug)]
struct CorpusEntry {
    request: Request,
    ref_count: usize,
}

/// The corpus of admitted requests plus the global coverage union.
pub struct Corpus {
    meta: InstrumentMeta,
    union: HashMap<Label, UnionSlot>,
    entries: HashMap<u64, CorpusEntry>,
}

impl Corpus {
    /// Create an empty corpus for the given instrumentation.
    pub fn new(meta: InstrumentMeta) -> Self {
        Self {
            meta,
            union: HashMap::new(),
            entries: HashMap::new(),
        }
    }

    /// Number of requests currently in the corpus.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the corpus holds no requests.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of labels the union covers.
    pub fn union_len(&self) -> usize {
        self.union.len()
    }

    /// The union's bucket for a label, if any request ever hit it.
    pub fn union_bucket(&self, label: Label) -> Option<Bucket> {
        self.union.get(&label).map(|slot| slot.bucket)
    }

    /// Overall coverage percentage across everything admitted so far.
    pub fn total_cover_score(&self) -> f64 {
        100.0 * self.union.len() as f64 / self.meta.score_denominator() as f64
    }

    /// Iterate the backing list of admitted requests.
    pub fn requests(&self) -> impl Iterator<Item = &Request> {
        self.entries.values().map(|entry| &entry.request)
    }

    /// Decide admission for a dispatched request and its parsed feedback.
    ///
    /// Returns false, leaving union and membership untouched, when the
    /// request neither raises the union anywhere nor can take over a label
    /// from a heavier contributor. Otherwise the union is updated, label
    /// ownership is (re)assigned, displaced contributors lose refs (and are
    /// evicted at zero), and the request joins the corpus.
    pub fn add(&mut self, request: Request, cfg: &CfgPair) -> bool {
        let hash = request.identity();
        let map = self.relevant_map(cfg);

        let mut raised: Vec<(Label, Bucket)> = Vec::new();
        let mut transfers: Vec<Label> = Vec::new();

        for (&label, &bucket) in map {
            match self.union.get(&label) {
                None => raised.push((label, bucket)),
                Some(slot) if bucket > slot.bucket => raised.push((label, bucket)),
                Some(slot) if bucket == slot.bucket && slot.owner != hash => {
                    if let Some(owner) = self.entries.get(&slot.owner) {
                        if request.is_lighter_than(&owner.request) {
                            transfers.push(label);
                        }
                    }
                }
                Some(_) => {}
            }
        }

        if raised.is_empty() && transfers.is_empty() {
            return false;
        }

        let gained = raised.len() + transfers.len();
        let mut displaced: Vec<u64> = Vec::new();

        for (label, bucket) in raised {
            if let Some(prev) = self.union.insert(label, UnionSlot { bucket, owner: hash }) {
                displaced.push(prev.owner);
            }
        }
        for label in transfers {
            if let Some(slot) = self.union.get_mut(&label) {
                displaced.push(slot.owner);
                slot.owner = hash;
            }
        }

        self.entries
            .entry(hash)
            .or_insert(CorpusEntry {
                request,
                ref_count: 0,
            })
            .ref_count += gained;

        for owner in displaced {
            self.release_label(owner);
        }

        tracing::debug!(
            labels = gained,
            corpus = self.entries.len(),
            union = self.union.len(),
            "Request admitted"
        );
        true
    }

    /// Pop the highest-priority request for mutation.
    ///
    /// Returns a snapshot of the minimum entry under the priority ordering
    /// and bumps its `picked_score`, so repeatedly picking the same request
    /// cools it down in favour of the rest of the corpus.
    pub fn next(&mut self) -> Option<Request> {
        let policy = self.meta.policy;
        let hash = self
            .entries
            .values()
            .min_by(|a, b| {
                a.request
                    .priority_cmp(&b.request, policy)
                    .partial_cmp(&0.0)
                    .unwrap_or(Ordering::Equal)
            })
            .map(|entry| entry.request.identity())?;

        let entry = self.entries.get_mut(&hash)?;
        entry.request.picked_score += 1;
        Some(entry.request.clone())
    }

    /// The feedback map admission looks at under the active policy.
    fn relevant_map<'a>(&self, cfg: &'a CfgPair) -> &'a Cfg {
        match self.meta.policy {
            Policy::Node => &cfg.single,
            Policy::Edge | Policy::NodeEdge => &cfg.xor,
        }
    }

    /// Drop one label contribution from a member, evicting it at zero.
    fn release_label(&mut self, owner: u64) {
        if let Some(entry) = self.entries.get_mut(&owner) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 {
                self.entries.remove(&owner);
                tracing::debug!(corpus = self.entries.len(), "Corpus member evicted");
            }
        }
    }

    /// Sum of all member ref-counts; equals the union size at all times.
    #[cfg(test)]
    fn ref_count_sum(&self) -> usize {
        self.entries.values().map(|entry| entry.ref_count).sum()
    }
}
