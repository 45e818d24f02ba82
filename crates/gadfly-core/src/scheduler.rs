//! Interleaves the three request sources a worker draws from.
//!
//! The crawler has priority whenever it holds unvisited work; the corpus
//! backfills with mutation candidates when the crawler runs dry (the crawler
//! is not terminal then, harvested links may refill it); and when a catch
//! phrase is configured, a session probe fires on a fixed cadence no matter
//! what the other sources are doing. Every yield is tagged with its source so
//! the worker knows whether to mutate, probe or send as-is.

use crate::corpus::Corpus;
use crate::crawler::Crawler;
use crate::request::Request;

/// Every how many scheduler turns the session probe fires.
pub const LOGGED_IN_CHECK_INTERVAL: u64 = 50;

/// Where a scheduled request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A never-visited request; send as-is.
    Crawler,
    /// A corpus pick; mutate before sending.
    Corpus,
    /// The session liveness probe.
    Probe,
}

/// Per-worker source interleaver.
///
/// Holds only a turn counter and the pre-built probe request; the shared
/// crawler and corpus are borrowed at each call so their locks stay with the
/// caller.
pub struct RequestMix {
    counter: u64,
    probe: Option<Request>,
}

impl RequestMix {
    /// Create a mix; `probe` is `Some` only when a catch phrase is
    /// configured.
    pub fn new(probe: Option<Request>) -> Self {
        Self { counter: 0, probe }
    }

    /// Draw the next tagged request, or `None` when the crawler is exhausted
    /// and the corpus has nothing to offer.
    pub fn next(&mut self, crawler: &mut Crawler, corpus: &mut Corpus) -> Option<(Source, Request)> {
        self.counter += 1;

        if let Some(probe) = &self.probe {
            if self.counter % LOGGED_IN_CHECK_INTERVAL == 0 {
                return Some((Source::Probe, probe.clone()));
            }
        }

        if let Some(request) = crawler.next() {
            return Some((Source::Crawler, request));
        }

        if let Some(request) = corpus.next() {
            return Some((Source::Corpus, request));
        }

        None
    }
}
