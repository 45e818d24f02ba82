//! Derives new candidate requests from corpus entries.
//!
//! A mutation keeps the parent's method and URL and perturbs its parameters:
//! splicing in a value seen elsewhere in the corpus, tweaking characters of
//! an existing value, or planting an XSS payload. The child records a
//! [`ParentLink`] so its coverage gain can be attributed.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::corpus::Corpus;
use crate::detector;
use crate::instrument::Policy;
use crate::request::{HttpMethod, ParamMap, Params, ParentLink, Request};

/// Keys tried when a parameter-less request needs something to perturb.
const FALLBACK_KEYS: [&str; 4] = ["q", "id", "page", "search"];

/// Characters drawn for byte-level tweaks.
const TWEAK_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789<>\"'&;/=";

/// The perturbation strategies a mutation chooses between.
#[derive(Debug, Clone, Copy)]
enum MutationKind {
    /// Replace the value with one spliced from another corpus entry.
    Splice,
    /// Tweak characters of the existing value.
    Tweak,
    /// Append an XSS payload, bounded by `max_xss` per parameter.
    Inject,
}

/// Produces mutated children of corpus requests.
pub struct Mutator {
    policy: Policy,
    max_xss: u32,
    unique_anchors: bool,
}

impl Mutator {
    /// Create a mutator for the active instrumentation policy.
    pub fn new(policy: Policy, max_xss: u32, unique_anchors: bool) -> Self {
        Self {
            policy,
            max_xss,
            unique_anchors,
        }
    }

    /// Derive a fresh request from `parent`, consulting the corpus for
    /// splice material.
    pub fn mutate(&self, parent: &Request, corpus: &Corpus) -> Request {
        self.mutate_with_rng(parent, corpus, &mut rand::thread_rng())
    }

    /// [`mutate`](Self::mutate) with a caller-supplied RNG for deterministic
    /// testing.
    pub fn mutate_with_rng<R: Rng>(&self, parent: &Request, corpus: &Corpus, rng: &mut R) -> Request {
        let mut params = parent.params().clone();

        // A handful of tries; a perturbed value almost always changes the
        // identity on the first attempt.
        for _ in 0..8 {
            self.perturb(&mut params, parent.method(), corpus, rng);
            let child = self.build(parent, params.clone());
            if child.identity() != parent.identity() {
                return child;
            }
        }

        // Still colliding: force a divergent value.
        let key = FALLBACK_KEYS.choose(rng).unwrap_or(&FALLBACK_KEYS[0]);
        let target = target_map(&mut params, parent.method());
        target
            .entry((*key).to_string())
            .or_insert_with(Vec::new)
            .push(format!("{:x}", rng.gen::<u64>()));
        self.build(parent, params)
    }

    /// Apply one random perturbation in place.
    fn perturb<R: Rng>(
        &self,
        params: &mut Params,
        method: HttpMethod,
        corpus: &Corpus,
        rng: &mut R,
    ) {
        let keys: Vec<(bool, String)> = params
            .get
            .keys()
            .map(|k| (false, k.clone()))
            .chain(params.post.keys().map(|k| (true, k.clone())))
            .collect();

        let Some((in_post, key)) = keys.choose(rng).cloned() else {
            // Nothing to perturb yet; invent a parameter.
            let key = FALLBACK_KEYS.choose(rng).unwrap_or(&FALLBACK_KEYS[0]);
            let value = detector::payloads(rng.gen_range(1000..10_000))
                .choose(rng)
                .cloned()
                .unwrap_or_default();
            target_map(params, method).insert((*key).to_string(), vec![value]);
            return;
        };

        let map = if in_post { &mut params.post } else { &mut params.get };
        let Some(values) = map.get_mut(&key) else {
            return;
        };
        if values.is_empty() {
            values.push(String::new());
        }
        let slot = rng.gen_range(0..values.len());

        let kind = match rng.gen_range(0..3) {
            0 => MutationKind::Splice,
            1 => MutationKind::Tweak,
            _ => MutationKind::Inject,
        };

        match kind {
            MutationKind::Splice => {
                if let Some(spliced) = splice_value(&key, corpus, rng) {
                    values[slot] = spliced;
                } else {
                    values[slot] = tweak_value(&values[slot], rng);
                }
            }
            MutationKind::Tweak => {
                values[slot] = tweak_value(&values[slot], rng);
            }
            MutationKind::Inject => {
                if detector::payload_count(&values[slot]) < self.max_xss as usize {
                    let payload = detector::payloads(rng.gen_range(1000..10_000))
                        .choose(rng)
                        .cloned()
                        .unwrap_or_default();
                    values[slot].push_str(&payload);
                } else {
                    values[slot] = tweak_value(&values[slot], rng);
                }
            }
        }
    }

    /// Assemble the child request.
    ///
    /// Mutation never moves parameters between locations, so the GET/POST
    /// construction invariant holds by construction.
    fn build(&self, parent: &Request, params: Params) -> Request {
        Request::new(
            parent.method(),
            parent.url().clone(),
            params,
            Some(ParentLink {
                hash: parent.identity(),
                cover_raw: parent.cover_score_raw(self.policy),
            }),
            self.unique_anchors,
        )
        .expect("mutation preserves the parameter-location invariant")
    }
}

/// The map a brand-new parameter belongs in for the given method.
fn target_map(params: &mut Params, method: HttpMethod) -> &mut ParamMap {
    match method {
        HttpMethod::Get => &mut params.get,
        HttpMethod::Post => &mut params.post,
    }
}

/// Pull a value for `key` from somewhere else in the corpus, falling back to
/// any value any entry holds.
fn splice_value<R: Rng>(key: &str, corpus: &Corpus, rng: &mut R) -> Option<String> {
    let same_key: Vec<&String> = corpus
        .requests()
        .flat_map(|req| {
            req.params()
                .get
                .get(key)
                .into_iter()
                .chain(req.params().post.get(key))
                .flatten()
        })
        .collect();
    if let Some(value) = same_key.choose(rng) {
        return Some((*value).clone());
    }

    let any: Vec<&String> = corpus
        .requests()
        .flat_map(|req| {
            req.params()
                .get
                .values()
                .chain(req.params().post.values())
                .flatten()
        })
        .collect();
    any.choose(rng).map(|v| (*v).clone())
}

/// Randomly flip, insert, duplicate or drop characters of a value.
fn tweak_value<R: Rng>(value: &str, rng: &mut R) -> String {
    let mut chars: Vec<char> = value.chars().collect();
    let pick = |rng: &mut R| char::from(*TWEAK_CHARS.choose(rng).unwrap_or(&b'a'));

    if chars.is_empty() {
        return (0..rng.gen_range(1..8)).map(|_| pick(rng)).collect();
    }

    match rng.gen_range(0..4) {
        0 => {
            let i = rng.gen_range(0..chars.len());
            chars[i] = pick(rng);
        }
        1 => {
            let i = rng.gen_range(0..=chars.len());
            chars.insert(i, pick(rng));
        }
        2 => {
            let start = rng.gen_range(0..chars.len());
            let end = rng.gen_range(start..chars.len());
            let slice: Vec<char> = chars[start..=end.min(chars.len() - 1)].to_vec();
            chars.extend(slice);
        }
        _ => {
            let i = rng.gen_range(0..chars.len());
            chars.remove(i);
            if chars.is_empty() {
                chars.push(pick(rng));
            }
        }
    }

    chars.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::InstrumentMeta;
    use crate::request::MAX_PARAM_SIZE;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use url::Url;

    fn node_meta() -> InstrumentMeta {
        serde_json::from_str(
            r#"{"basic-block-count": 100, "output-method": "http",
                "instrument-policy": "node"}"#,
        )
        .unwrap()
    }

    fn parent(values: &[(&str, &str)]) -> Request {
        let mut params = Params::default();
        for (key, value) in values {
            params
                .get
                .insert((*key).to_string(), vec![(*value).to_string()]);
        }
        let mut req = Request::new(
            HttpMethod::Get,
            Url::parse("http://t/page").unwrap(),
            params,
            None,
            false,
        )
        .unwrap();
        req.cover_single = 12;
        req
    }

    #[test]
    fn child_identity_differs_from_parent() {
        let mutator = Mutator::new(Policy::Node, 3, false);
        let corpus = Corpus::new(node_meta());
        let parent = parent(&[("q", "hello")]);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let child = mutator.mutate_with_rng(&parent, &corpus, &mut rng);
            assert_ne!(child.identity(), parent.identity());
        }
    }

    #[test]
    fn child_preserves_method_and_url() {
        let mutator = Mutator::new(Policy::Node, 3, false);
        let corpus = Corpus::new(node_meta());
        let parent = parent(&[("q", "hello")]);
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..50 {
            let child = mutator.mutate_with_rng(&parent, &corpus, &mut rng);
            assert_eq!(child.method(), parent.method());
            assert_eq!(child.url(), parent.url());
        }
    }

    #[test]
    fn child_records_parent_link() {
        let mutator = Mutator::new(Policy::Node, 3, false);
        let corpus = Corpus::new(node_meta());
        let parent = parent(&[("q", "hello")]);
        let mut rng = StdRng::seed_from_u64(13);

        let child = mutator.mutate_with_rng(&parent, &corpus, &mut rng);
        let link = child.parent().unwrap();
        assert_eq!(link.hash, parent.identity());
        assert_eq!(link.cover_raw, 12);
    }

    #[test]
    fn child_values_stay_clamped() {
        let mutator = Mutator::new(Policy::Node, 3, false);
        let corpus = Corpus::new(node_meta());
        let long = "y".repeat(MAX_PARAM_SIZE);
        let parent = parent(&[("q", long.as_str())]);
        let mut rng = StdRng::seed_from_u64(17);

        for _ in 0..50 {
            let child = mutator.mutate_with_rng(&parent, &corpus, &mut rng);
            for values in child.params().get.values() {
                for value in values {
                    assert!(value.chars().count() <= MAX_PARAM_SIZE);
                }
            }
        }
    }

    #[test]
    fn parameterless_parent_gains_a_parameter() {
        let mutator = Mutator::new(Policy::Node, 3, false);
        let corpus = Corpus::new(node_meta());
        let parent = parent(&[]);
        let mut rng = StdRng::seed_from_u64(19);

        let child = mutator.mutate_with_rng(&parent, &corpus, &mut rng);
        assert!(!child.params().is_empty());
        assert_ne!(child.identity(), parent.identity());
    }

    #[test]
    fn post_parent_mutates_into_post_params() {
        let mutator = Mutator::new(Policy::Node, 3, false);
        let corpus = Corpus::new(node_meta());
        let mut params = Params::default();
        params
            .post
            .insert("field".to_string(), vec!["value".to_string()]);
        let parent = Request::new(
            HttpMethod::Post,
            Url::parse("http://t/form").unwrap(),
            params,
            None,
            false,
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(23);

        for _ in 0..50 {
            let child = mutator.mutate_with_rng(&parent, &corpus, &mut rng);
            assert_eq!(child.method(), HttpMethod::Post);
            assert_ne!(child.identity(), parent.identity());
        }
    }

    #[test]
    fn inject_respects_max_xss_cap() {
        let full: String = detector::payloads(1).remove(0).repeat(2);
        assert!(detector::payload_count(&full) >= 2);

        // Cap of 2 already reached: no mutation may add another marker.
        let mutator = Mutator::new(Policy::Node, 2, false);
        let corpus = Corpus::new(node_meta());
        let parent = parent(&[("q", full.as_str())]);
        let mut rng = StdRng::seed_from_u64(29);

        for _ in 0..100 {
            let child = mutator.mutate_with_rng(&parent, &corpus, &mut rng);
            for values in child.params().get.values() {
                for value in values {
                    // Tweaks may duplicate an existing marker slice, but the
                    // injector itself must never stack beyond the cap + what
                    // a duplication can double.
                    assert!(detector::payload_count(value) <= 2 * detector::payload_count(&full));
                }
            }
        }
    }

    #[test]
    fn splice_prefers_same_key_values() {
        let mut corpus = Corpus::new(node_meta());
        let donor = parent(&[("q", "donor-value")]);
        let cfg = {
            let mut pair = crate::instrument::CfgPair::default();
            pair.single.insert(1, 2);
            pair
        };
        let mut donor = donor;
        donor.record_coverage(&cfg);
        assert!(corpus.add(donor, &cfg));

        let mut rng = StdRng::seed_from_u64(31);
        let value = splice_value("q", &corpus, &mut rng);
        assert_eq!(value.as_deref(), Some("donor-value"));
    }

    #[test]
    fn splice_on_empty_corpus_is_none() {
        let corpus = Corpus::new(node_meta());
        let mut rng = StdRng::seed_from_u64(37);
        assert!(splice_value("q", &corpus, &mut rng).is_none());
    }

    #[test]
    fn tweak_always_changes_or_keeps_nonempty() {
        let mut rng = StdRng::seed_from_u64(41);
        for _ in 0..100 {
            let out = tweak_value("abc", &mut rng);
            assert!(!out.is_empty());
        }
        let out = tweak_value("", &mut rng);
        assert!(!out.is_empty());
    }
}
