//! Harvests candidate requests from response documents.
//!
//! Anchors become GET requests; forms become GET or POST requests with their
//! input fields as parameters. Relative links are resolved against the page
//! they came from, and links leaving the target's host are dropped.

use std::collections::HashSet;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::request::{HttpMethod, ParamMap, Params, Request};

/// Extracts follow-up requests from parsed documents.
pub struct LinkExtractor {
    unique_anchors: bool,
}

impl LinkExtractor {
    /// Create an extractor; `unique_anchors` mirrors the request
    /// canonicalisation flag.
    pub fn new(unique_anchors: bool) -> Self {
        Self { unique_anchors }
    }

    /// Collect every candidate request the document links to.
    pub fn extract(&self, from: &Request, document: &Html) -> HashSet<Request> {
        let mut links = self.anchors(from, document);
        links.extend(self.forms(from, document));
        tracing::debug!(from = %from.url(), links = links.len(), "Harvested links");
        links
    }

    /// Anchor hrefs as GET requests.
    fn anchors(&self, from: &Request, document: &Html) -> HashSet<Request> {
        let selector = Selector::parse("a").expect("static selector");
        let mut links = HashSet::new();

        for anchor in document.select(&selector) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };

            let Some((url, get)) = self.resolve(from, href) else {
                continue;
            };

            if let Ok(request) = Request::new(
                HttpMethod::Get,
                url,
                Params {
                    get,
                    post: ParamMap::new(),
                },
                None,
                self.unique_anchors,
            ) {
                links.insert(request);
            }
        }

        links
    }

    /// Form actions as GET or POST requests with their fields attached.
    fn forms(&self, from: &Request, document: &Html) -> HashSet<Request> {
        let form_selector = Selector::parse("form").expect("static selector");
        let mut links = HashSet::new();

        for form in document.select(&form_selector) {
            let action = form.value().attr("action").unwrap_or_default();
            let Some((url, mut get)) = self.resolve(from, action) else {
                continue;
            };

            // Later field categories override earlier ones on a name clash.
            let mut fields = ParamMap::new();
            for category in ["select", "input", "textarea"] {
                fields.extend(collect_fields(&form, category));
            }

            let method = match form.value().attr("method") {
                Some(m) if !m.eq_ignore_ascii_case("get") => HttpMethod::Post,
                _ => HttpMethod::Get,
            };

            let post = if method == HttpMethod::Get {
                get.extend(fields);
                ParamMap::new()
            } else {
                fields
            };

            if let Ok(request) =
                Request::new(method, url, Params { get, post }, None, self.unique_anchors)
            {
                links.insert(request);
            }
        }

        links
    }

    /// Resolve a raw href/action against the originating request.
    ///
    /// Returns the target URL with its query string folded out into GET
    /// parameters, or `None` when the link is unusable or leaves the host.
    /// An empty or fragment-only link points back at the originating request
    /// and inherits its GET parameters.
    fn resolve(&self, from: &Request, raw: &str) -> Option<(Url, ParamMap)> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Some((from.url().clone(), from.params().get.clone()));
        }

        let mut url = from.url().join(trimmed).ok()?;

        if url.host_str() != from.url().host_str() {
            return None;
        }

        let mut get = ParamMap::new();
        for (key, value) in url.query_pairs() {
            get.entry(key.into_owned())
                .or_insert_with(Vec::new)
                .push(value.into_owned());
        }
        url.set_query(None);

        Some((url, get))
    }
}

/// Gather `name -> values` pairs from one field category of a form.
///
/// Fields without a `name` are skipped. An empty `value` falls back to the
/// first child `<option>`'s value, and repeated names accumulate.
fn collect_fields(form: &ElementRef<'_>, category: &str) -> ParamMap {
    let selector = Selector::parse(category).expect("static selector");
    let option = Selector::parse("option").expect("static selector");
    let mut fields = ParamMap::new();

    for element in form.select(&selector) {
        let Some(name) = element.value().attr("name") else {
            continue;
        };

        let mut value = element.value().attr("value").unwrap_or_default().to_string();
        if value.is_empty() {
            if let Some(opt) = element.select(&option).next() {
                value = opt.value().attr("value").unwrap_or_default().to_string();
            }
        }

        fields.entry(name.to_string()).or_default().push(value);
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(u: &str) -> Request {
        Request::new(
            HttpMethod::Get,
            Url::parse(u).unwrap(),
            Params::default(),
            None,
            false,
        )
        .unwrap()
    }

    fn extract(from: &Request, html: &str) -> HashSet<Request> {
        LinkExtractor::new(false).extract(from, &Html::parse_document(html))
    }

    #[test]
    fn absolute_anchor_same_host() {
        let links = extract(
            &page("http://t/index.php"),
            r#"<a href="http://t/other.php">x</a>"#,
        );
        assert_eq!(links.len(), 1);
        let link = links.iter().next().unwrap();
        assert_eq!(link.url().as_str(), "http://t/other.php");
        assert_eq!(link.method(), HttpMethod::Get);
    }

    #[test]
    fn relative_anchor_resolves_against_page_directory() {
        let links = extract(
            &page("http://t/api/login.php"),
            r#"<a href="action.php">x</a>"#,
        );
        let link = links.iter().next().unwrap();
        assert_eq!(link.url().as_str(), "http://t/api/action.php");
    }

    #[test]
    fn rooted_anchor_resolves_against_host() {
        let links = extract(
            &page("http://t/api/login.php"),
            r#"<a href="/top.php">x</a>"#,
        );
        let link = links.iter().next().unwrap();
        assert_eq!(link.url().as_str(), "http://t/top.php");
    }

    #[test]
    fn cross_domain_anchor_is_skipped() {
        let links = extract(
            &page("http://t/index.php"),
            r#"<a href="http://elsewhere/x.php">x</a>"#,
        );
        assert!(links.is_empty());
    }

    #[test]
    fn query_string_becomes_get_params_with_blanks_kept() {
        let links = extract(
            &page("http://t/index.php"),
            r#"<a href="/view.php?id=3&empty=&id=4">x</a>"#,
        );
        let link = links.iter().next().unwrap();
        assert!(link.url().query().is_none());
        assert_eq!(link.params().get["id"], vec!["3", "4"]);
        assert_eq!(link.params().get["empty"], vec![""]);
    }

    #[test]
    fn fragment_only_anchor_points_back_with_own_params() {
        let mut params = Params::default();
        params.get.insert("tab".to_string(), vec!["2".to_string()]);
        let from = Request::new(
            HttpMethod::Get,
            Url::parse("http://t/panel.php").unwrap(),
            params,
            None,
            false,
        )
        .unwrap();

        let links = extract(&from, r##"<a href="#section">x</a>"##);
        let link = links.iter().next().unwrap();
        assert_eq!(link.url().as_str(), "http://t/panel.php");
        assert_eq!(link.params().get["tab"], vec!["2"]);
    }

    #[test]
    fn anchor_without_href_is_skipped() {
        let links = extract(&page("http://t/"), "<a>x</a>");
        // The bare page itself is not re-emitted for a missing href.
        assert!(links.is_empty());
    }

    #[test]
    fn post_form_splits_action_query_and_fields() {
        let links = extract(
            &page("http://t/index.php"),
            r#"<form action="/submit.php?src=index" method="post">
                 <input name="user" value="guest">
                 <input name="token">
               </form>"#,
        );
        let link = links.iter().next().unwrap();
        assert_eq!(link.method(), HttpMethod::Post);
        assert_eq!(link.url().as_str(), "http://t/submit.php");
        assert_eq!(link.params().get["src"], vec!["index"]);
        assert_eq!(link.params().post["user"], vec!["guest"]);
        assert_eq!(link.params().post["token"], vec![""]);
    }

    #[test]
    fn get_form_merges_fields_into_query_params() {
        let links = extract(
            &page("http://t/index.php"),
            r#"<form action="/search.php">
                 <input name="q" value="seed">
               </form>"#,
        );
        let link = links.iter().next().unwrap();
        assert_eq!(link.method(), HttpMethod::Get);
        assert_eq!(link.params().get["q"], vec!["seed"]);
        assert!(link.params().post.is_empty());
    }

    #[test]
    fn missing_action_targets_the_originating_page() {
        let links = extract(
            &page("http://t/login.php"),
            r#"<form method="post"><input name="pw" value=""></form>"#,
        );
        let link = links.iter().next().unwrap();
        assert_eq!(link.url().as_str(), "http://t/login.php");
        assert_eq!(link.method(), HttpMethod::Post);
    }

    #[test]
    fn select_falls_back_to_first_option_value() {
        let links = extract(
            &page("http://t/index.php"),
            r#"<form action="/pick.php" method="post">
                 <select name="colour">
                   <option value="red">Red</option>
                   <option value="blue">Blue</option>
                 </select>
               </form>"#,
        );
        let link = links.iter().next().unwrap();
        assert_eq!(link.params().post["colour"], vec!["red"]);
    }

    #[test]
    fn nameless_inputs_are_skipped() {
        let links = extract(
            &page("http://t/index.php"),
            r#"<form action="/f.php" method="post"><input value="x"></form>"#,
        );
        let link = links.iter().next().unwrap();
        assert!(link.params().post.is_empty());
    }

    #[test]
    fn repeated_field_names_accumulate() {
        let links = extract(
            &page("http://t/index.php"),
            r#"<form action="/f.php" method="post">
                 <input name="box" value="a">
                 <input name="box" value="b">
               </form>"#,
        );
        let link = links.iter().next().unwrap();
        assert_eq!(link.params().post["box"], vec!["a", "b"]);
    }
}
