//! A request descriptor and its accumulated feedback metrics.
//!
//! A [`Request`] is one point in the fuzzing search space: a method, a
//! canonical URL and a parameter multimap. That triple is the request's
//! identity and never changes after construction; everything else on the
//! struct (timing, coverage counts, sink hits) is feedback filled in as the
//! request travels through the worker cycle.

use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};

use serde::Serialize;
use url::Url;

use crate::error::RequestError;
use crate::instrument::{CfgPair, InstrumentMeta, Policy};

/// Parameter values get cropped to this many characters. POST bodies can be
/// huge (file uploads), and some parameters get re-escaped on every
/// request/response cycle and would otherwise grow without bound.
pub const MAX_PARAM_SIZE: usize = 1000;

// Priority-ordering weights.
const COVER_SCORE_RWEIGHT: f64 = 0.40;
const MUTATED_SCORE_RWEIGHT: f64 = 0.10;
const SINK_SCORE_RWEIGHT: f64 = 0.30;
const EXEC_TIME_RWEIGHT: f64 = -0.30;
const SIZE_RWEIGHT: f64 = -0.10;
const PICKED_SCORE_RWEIGHT: f64 = -0.40;

// Lightness weights.
const EXEC_TIME_LWEIGHT: f64 = -0.60;
const SIZE_LWEIGHT: f64 = -0.30;

/// Guard band around a lightness tie. Response times vary run to run, and
/// replacing corpus entries is expensive, so a request must be significantly
/// lighter before it displaces another.
pub const UNCERTAINTY_THRESH: f64 = 0.1;

/// The HTTP methods the fuzzer speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// Parameters travel in the query string.
    Get,
    /// Parameters travel in the request body.
    Post,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
        }
    }
}

/// Ordered key-to-values mapping for one parameter location.
pub type ParamMap = BTreeMap<String, Vec<String>>;

/// GET and POST parameters of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Params {
    /// Query-string parameters.
    #[serde(rename = "GET")]
    pub get: ParamMap,
    /// Body parameters.
    #[serde(rename = "POST")]
    pub post: ParamMap,
}

impl Params {
    /// Whether neither location holds any parameter.
    pub fn is_empty(&self) -> bool {
        self.get.is_empty() && self.post.is_empty()
    }

    /// Crop every value to [`MAX_PARAM_SIZE`] characters.
    fn clamp(&mut self) {
        for map in [&mut self.get, &mut self.post] {
            for values in map.values_mut() {
                for value in values.iter_mut() {
                    if value.chars().count() > MAX_PARAM_SIZE {
                        *value = value.chars().take(MAX_PARAM_SIZE).collect();
                    }
                }
            }
        }
    }

    /// Total character length of all values (post-clamp).
    fn total_size(&self) -> usize {
        [&self.get, &self.post]
            .into_iter()
            .flat_map(BTreeMap::values)
            .flatten()
            .map(|v| v.chars().count())
            .sum()
    }

    /// Feed the identity-relevant view of the parameters into a hasher:
    /// locations in fixed order, keys sorted (`BTreeMap` order), values
    /// sorted per key so value order does not affect identity.
    fn hash_identity<H: Hasher>(&self, state: &mut H) {
        for map in [&self.get, &self.post] {
            map.len().hash(state);
            for (key, values) in map {
                key.hash(state);
                let mut sorted: Vec<&String> = values.iter().collect();
                sorted.sort();
                sorted.hash(state);
            }
        }
    }
}

/// Back-reference from a mutated request to the corpus entry it came from.
///
/// Holds the parent's identity hash and its raw coverage at mutation time;
/// never an owning reference, so parent eviction cannot dangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLink {
    /// Identity hash of the parent request.
    pub hash: u64,
    /// The parent's `cover_score_raw` under the active policy.
    pub cover_raw: u64,
}

/// Confidence that a reflected-XSS sink is exploitable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum XssConfidence {
    /// No reflection observed.
    #[default]
    None,
    /// Marker reflected in a text node.
    Low,
    /// Marker reflected inside an attribute value.
    Medium,
    /// Marker reflected in script text or an event handler.
    High,
}

/// One HTTP request plus the feedback collected from dispatching it.
#[derive(Debug, Clone)]
pub struct Request {
    method: HttpMethod,
    url: Url,
    params: Params,
    parent: Option<ParentLink>,
    hash: u64,
    size: usize,

    /// Wall time of the last dispatch, in seconds.
    pub exec_time: f64,
    /// Size of the edge-style coverage map from the last dispatch.
    pub cover_xor: u64,
    /// Size of the node-style coverage map from the last dispatch.
    pub cover_single: u64,
    /// How many times the corpus has picked this request for mutation.
    pub picked_score: u64,
    /// Opaque sink identifiers observed in this request's responses.
    pub sinks: HashSet<String>,
    /// Strongest XSS verdict observed so far.
    pub xss_confidence: XssConfidence,
}

impl Request {
    /// Build a request, canonicalising the URL and clamping parameters.
    ///
    /// The fragment is stripped unless `unique_anchors` is set. Fails when a
    /// GET request carries POST parameters.
    pub fn new(
        method: HttpMethod,
        mut url: Url,
        mut params: Params,
        parent: Option<ParentLink>,
        unique_anchors: bool,
    ) -> Result<Self, RequestError> {
        if method == HttpMethod::Get && !params.post.is_empty() {
            return Err(RequestError::PostParamsOnGet {
                url: url.to_string(),
            });
        }

        if !unique_anchors {
            url.set_fragment(None);
        }

        params.clamp();
        let size = params.total_size();
        let hash = identity_hash(method, &url, &params);

        Ok(Self {
            method,
            url,
            params,
            parent,
            hash,
            size,
            exec_time: 0.0,
            cover_xor: 0,
            cover_single: 0,
            picked_score: 0,
            sinks: HashSet::new(),
            xss_confidence: XssConfidence::None,
        })
    }

    /// Build the seed request for a start URL, folding any query string into
    /// GET parameters so mutated descendants share its identity scheme.
    pub fn seed(mut url: Url, unique_anchors: bool) -> Result<Self, RequestError> {
        let mut get = ParamMap::new();
        for (key, value) in url.query_pairs() {
            get.entry(key.into_owned())
                .or_insert_with(Vec::new)
                .push(value.into_owned());
        }
        url.set_query(None);

        Self::new(
            HttpMethod::Get,
            url,
            Params {
                get,
                post: ParamMap::new(),
            },
            None,
            unique_anchors,
        )
    }

    /// The request's HTTP method.
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// The canonical URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The clamped parameter multimap.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The parent link, if this request was mutated from a corpus entry.
    pub fn parent(&self) -> Option<ParentLink> {
        self.parent
    }

    /// The memoised identity hash.
    pub fn identity(&self) -> u64 {
        self.hash
    }

    /// Total character length of all parameter values.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this request was produced by the mutator.
    pub fn is_mutated(&self) -> bool {
        self.parent.is_some()
    }

    /// Number of distinct sinks observed.
    pub fn sink_score(&self) -> usize {
        self.sinks.len()
    }

    /// Record the sizes of a freshly parsed coverage pair.
    pub fn record_coverage(&mut self, cfg: &CfgPair) {
        self.cover_xor = cfg.xor.len() as u64;
        self.cover_single = cfg.single.len() as u64;
    }

    /// The coverage count relevant under the given policy: node-style counts
    /// for `node`, edge-style otherwise.
    pub fn cover_score_raw(&self, policy: Policy) -> u64 {
        match policy {
            Policy::Node => self.cover_single,
            Policy::Edge | Policy::NodeEdge => self.cover_xor,
        }
    }

    /// Coverage as a percentage of the instrumented target.
    pub fn cover_score(&self, meta: &InstrumentMeta) -> f64 {
        let (score, denominator) = match meta.policy {
            Policy::Edge => (self.cover_xor, meta.score_denominator()),
            Policy::Node | Policy::NodeEdge => (self.cover_single, meta.basic_blocks.max(1)),
        };
        100.0 * score as f64 / denominator as f64
    }

    /// Coverage gained relative to the parent; 0 for crawled requests.
    pub fn mutated_score(&self, policy: Policy) -> f64 {
        match self.parent {
            Some(parent) => self.cover_score_raw(policy) as f64 - parent.cover_raw as f64,
            None => 0.0,
        }
    }

    /// Total order for corpus priority; smaller means preferred.
    ///
    /// Sums weighted relative differences over the scoring signals. Coverage,
    /// coverage-gain and sink hits pull a request forward; cost (response
    /// time, parameter size) and how often it has already been picked push it
    /// back.
    pub fn priority_cmp(&self, other: &Self, policy: Policy) -> f64 {
        weighted_difference(
            other.cover_score_raw(policy) as f64,
            self.cover_score_raw(policy) as f64,
            COVER_SCORE_RWEIGHT,
        ) + weighted_difference(other.exec_time, self.exec_time, EXEC_TIME_RWEIGHT)
            + weighted_difference(other.size as f64, self.size as f64, SIZE_RWEIGHT)
            + weighted_difference(
                other.picked_score as f64,
                self.picked_score as f64,
                PICKED_SCORE_RWEIGHT,
            )
            + weighted_difference(
                other.mutated_score(policy),
                self.mutated_score(policy),
                MUTATED_SCORE_RWEIGHT,
            )
            + weighted_difference(
                other.sink_score() as f64,
                self.sink_score() as f64,
                SINK_SCORE_RWEIGHT,
            )
    }

    /// Whether this request is significantly cheaper than `other`.
    ///
    /// Weighs response time and parameter size. A result inside
    /// [`UNCERTAINTY_THRESH`] of a tie counts as not lighter.
    pub fn is_lighter_than(&self, other: &Self) -> bool {
        let weighted_diff = weighted_difference(other.exec_time, self.exec_time, EXEC_TIME_LWEIGHT)
            + weighted_difference(other.size as f64, self.size as f64, SIZE_LWEIGHT);

        weighted_diff < 0.0 && weighted_diff.abs() >= UNCERTAINTY_THRESH
    }

    /// The JSON-serialisable view used by stats output and logs. Internal
    /// scoring fields stay internal.
    pub fn to_record(&self, meta: &InstrumentMeta) -> RequestRecord {
        RequestRecord {
            method: self.method,
            url: self.url.to_string(),
            params: self.params.clone(),
            exec_time: self.exec_time,
            size: self.size,
            cover_score: self.cover_score(meta),
            mutated_score: self.mutated_score(meta.policy),
            xss_confidence: self.xss_confidence,
            hash: self.hash,
        }
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Request {}

impl Hash for Request {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ({} params)",
            self.method,
            self.url,
            self.params.get.len() + self.params.post.len()
        )
    }
}

/// The serialised form of a request for stats and logs.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    /// HTTP method name.
    pub method: HttpMethod,
    /// Canonical URL.
    pub url: String,
    /// GET and POST parameters.
    pub params: Params,
    /// Wall time of the last dispatch, seconds.
    pub exec_time: f64,
    /// Total parameter size in characters.
    pub size: usize,
    /// Coverage percentage.
    pub cover_score: f64,
    /// Coverage gained over the parent.
    pub mutated_score: f64,
    /// Strongest XSS verdict.
    pub xss_confidence: XssConfidence,
    /// Identity hash.
    pub hash: u64,
}

/// Weighted relative difference between two values.
///
/// `weight * (a - b) / (|a + b| / 2)`, or 0 when the pair sums to 0.
pub fn weighted_difference(a: f64, b: f64, weight: f64) -> f64 {
    let half_sum = (a + b).abs() / 2.0;
    if half_sum > 0.0 {
        weight * (a - b) / half_sum
    } else {
        0.0
    }
}

/// Identity hash over the (method, canonical URL, parameters) tuple.
fn identity_hash(method: HttpMethod, url: &Url, params: &Params) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    method.hash(&mut hasher);
    url.as_str().hash(&mut hasher);
    params.hash_identity(&mut hasher);
    hasher.finish()
}
