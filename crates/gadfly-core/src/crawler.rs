//! Deduplicating source of never-visited requests.
//!
//! The crawler absorbs candidate links harvested from responses and yields
//! each admissible request at most once per process. Two gates apply on the
//! way out: the user-supplied blocklist, and a per-base-URL cap that stops
//! nonce or CSRF parameters from generating endless variants of one page.

use std::collections::{HashMap, HashSet};

use crate::config::BlockRule;
use crate::request::{HttpMethod, ParamMap, Request};

/// How many times a (method, base-URL) pair may be yielded in total.
pub const CRAWLER_PER_BASE_LIMIT: u32 = 200;

/// Yield counter for one (method, base-URL) pair.
#[derive(Debug, Default)]
struct BaseCount {
    count: u32,
    warned: bool,
}

/// Restartable queue of unvisited requests.
pub struct Crawler {
    unseen: HashSet<Request>,
    seen_hashes: HashSet<u64>,
    base_counts: HashMap<(HttpMethod, String), BaseCount>,
    blocklist: Vec<BlockRule>,
}

impl Crawler {
    /// Create a crawler seeded with the given requests.
    pub fn new(seed: impl IntoIterator<Item = Request>, blocklist: Vec<BlockRule>) -> Self {
        Self {
            unseen: seed.into_iter().collect(),
            seen_hashes: HashSet::new(),
            base_counts: HashMap::new(),
            blocklist,
        }
    }

    /// Number of requests waiting to be yielded.
    pub fn pending(&self) -> usize {
        self.unseen.len()
    }

    /// Absorb newly harvested links, ignoring any request whose identity has
    /// ever been enqueued before. Insertion order is not preserved; the
    /// unseen pool has set semantics.
    pub fn add(&mut self, links: HashSet<Request>) {
        if links.is_empty() {
            return;
        }

        let before = self.unseen.len();
        for link in links {
            if !self.seen_hashes.contains(&link.identity()) {
                self.unseen.insert(link);
            }
        }

        let fresh = self.unseen.len() - before;
        if fresh > 0 {
            tracing::trace!(fresh, pending = self.unseen.len(), "New links found");
        }
    }

    /// Yield the next unvisited request, or `None` when the pool is dry.
    ///
    /// Every popped request is recorded as seen before the blocklist and
    /// per-base gates run, so a denied request never comes back.
    pub fn next(&mut self) -> Option<Request> {
        loop {
            let candidate = self.unseen.iter().next().cloned()?;
            let request = self.unseen.take(&candidate)?;

            self.seen_hashes.insert(request.identity());

            if !self.blocklist_allows(&request) {
                tracing::info!(request = %request, "Blocked");
                continue;
            }

            if !self.base_url_allows(&request) {
                continue;
            }

            return Some(request);
        }
    }

    /// Whether no blocklist rule matches the request.
    ///
    /// A rule blocks when its URL pattern matches and either it names no key
    /// pattern, or some parameter key matching the key pattern carries a
    /// matching value (any value, when the rule has no value pattern).
    fn blocklist_allows(&self, request: &Request) -> bool {
        for rule in &self.blocklist {
            if !rule.url.is_match(request.url().as_str()) {
                continue;
            }

            let Some(key_re) = &rule.key else {
                return false;
            };

            let hit = |params: &ParamMap| -> bool {
                params.iter().any(|(key, values)| {
                    key_re.is_match(key)
                        && match &rule.val {
                            Some(val_re) => values.iter().any(|v| val_re.is_match(v)),
                            None => true,
                        }
                })
            };

            if hit(&request.params().get) || hit(&request.params().post) {
                return false;
            }
        }

        true
    }

    /// Whether the (method, base-URL) pair is still under its yield cap.
    fn base_url_allows(&mut self, request: &Request) -> bool {
        let key = (request.method(), request.url().to_string());
        let entry = self.base_counts.entry(key).or_default();
        entry.count += 1;

        if entry.count > CRAWLER_PER_BASE_LIMIT {
            if !entry.warned {
                entry.warned = true;
                tracing::warn!(url = %request.url(), "Base URL reached per-base limit, discarding further variants");
            }
            return false;
        }

        true
    }
}
