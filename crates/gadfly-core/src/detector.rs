//! Reflected-XSS detection.
//!
//! The mutator plants payloads carrying a distinctive marker; the detector
//! then looks for that marker in responses. `precheck` is a cheap substring
//! scan on the raw body so the expensive DOM walk only runs when a marker
//! actually came back. `scan` classifies where each marker landed: script
//! text or an event-handler attribute means the payload reached an executable
//! sink, other attributes and text nodes are weaker reflections.

use std::sync::atomic::{AtomicU64, Ordering};

use scraper::{Html, Selector};

use crate::request::{Request, XssConfidence};

/// Marker planted by every payload and searched for in responses.
pub const MARKER: &str = "gdfl";

/// Attributes that execute script when the browser fires the event.
const EVENT_ATTRS: [&str; 6] = [
    "onerror", "onload", "onclick", "onmouseover", "onfocus", "ontoggle",
];

/// Build the payload variants for one injection id.
///
/// Each tries a different escape context; all carry `MARKER(id)` so a
/// reflection can be traced back to the request that planted it.
pub fn payloads(id: u32) -> Vec<String> {
    let call = format!("{MARKER}({id})");
    vec![
        format!("<script>{call}</script>"),
        format!("\"><img src=x onerror={call}>"),
        format!("'><svg onload={call}>"),
        call,
    ]
}

/// How many payload markers a parameter value already carries.
pub fn payload_count(value: &str) -> usize {
    value.matches(MARKER).count()
}

/// Shared reflected-XSS scanner.
pub struct Detector {
    xss_count: AtomicU64,
}

impl Detector {
    /// Create a detector with a zeroed finding counter.
    pub fn new() -> Self {
        Self {
            xss_count: AtomicU64::new(0),
        }
    }

    /// Total sink hits recorded across the whole run.
    pub fn xss_count(&self) -> u64 {
        self.xss_count.load(Ordering::Relaxed)
    }

    /// Cheap test for whether a full scan is worth running.
    pub fn precheck(&self, raw_html: &str) -> bool {
        raw_html.contains(MARKER)
    }

    /// Walk the parsed document, record every marker sink on the request and
    /// raise its confidence to the strongest reflection found.
    pub fn scan(&self, request: &mut Request, document: &Html) {
        let mut found = 0u64;

        let script = Selector::parse("script").expect("static selector");
        for element in document.select(&script) {
            let text: String = element.text().collect();
            if text.contains(MARKER) {
                request.sinks.insert(format!("script:{}", request.identity()));
                request.xss_confidence = request.xss_confidence.max(XssConfidence::High);
                found += 1;
            }
        }

        let any = Selector::parse("*").expect("static selector");
        for element in document.select(&any) {
            for (name, value) in element.value().attrs() {
                if !value.contains(MARKER) {
                    continue;
                }
                let confidence = if EVENT_ATTRS.contains(&name) {
                    XssConfidence::High
                } else {
                    XssConfidence::Medium
                };
                request
                    .sinks
                    .insert(format!("attr:{name}:{}", request.identity()));
                request.xss_confidence = request.xss_confidence.max(confidence);
                found += 1;
            }

            // Text nodes directly under this element.
            if element.value().name() != "script" {
                for text in element.text() {
                    if text.contains(MARKER) {
                        request
                            .sinks
                            .insert(format!("text:{}", request.identity()));
                        request.xss_confidence = request.xss_confidence.max(XssConfidence::Low);
                        found += 1;
                        break;
                    }
                }
            }
        }

        if found > 0 {
            self.xss_count.fetch_add(found, Ordering::Relaxed);
            tracing::warn!(
                request = %request,
                confidence = ?request.xss_confidence,
                sinks = request.sink_score(),
                "Possible XSS reflection"
            );
        }
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}
