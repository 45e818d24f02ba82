//! A worker closes the request, response, feedback cycle.
//!
//! Each worker pulls a tagged request from its source mix, mutates corpus
//! picks, dispatches over the shared transport, interprets the response
//! (status gates, XSS scan, instrumentation feedback), offers the request to
//! the corpus and feeds harvested links back to the crawler. The shared
//! shutdown signal is consulted after every cycle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use scraper::Html;

use crate::config::Config;
use crate::corpus::Corpus;
use crate::crawler::Crawler;
use crate::detector::Detector;
use crate::html::LinkExtractor;
use crate::instrument::InstrumentMeta;
use crate::mutator::Mutator;
use crate::request::{HttpMethod, Request};
use crate::scheduler::{RequestMix, Source};
use crate::signal::{ExitCode, ShutdownSignal};
use crate::stats::{CurrentRequest, Statistics};

/// Outcome of one request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// The response raised coverage; links were harvested.
    SuccessInteresting,
    /// A clean response that taught us nothing new.
    SuccessNotInteresting,
    /// A session probe that still carries the catch phrase.
    SuccessFoundPhrase,
    /// Transport-level failure (connect, timeout, body decode).
    UnsuccessfulRequest,
    /// Discarded by a status or content-type gate; no corpus effect.
    InvalidResponse,
    /// Reserved for request methods beyond GET and POST.
    UnimplementedMethod,
}

/// Everything the workers share.
pub struct FuzzContext {
    /// The immutable run configuration.
    pub config: Config,
    /// Instrumentation metadata.
    pub meta: InstrumentMeta,
    /// Shared transport client.
    pub client: reqwest::Client,
    /// Unvisited-request queue.
    pub crawler: Mutex<Crawler>,
    /// Interesting-request corpus.
    pub corpus: Mutex<Corpus>,
    /// Mutation engine.
    pub mutator: Mutator,
    /// Reflected-XSS scanner.
    pub detector: Detector,
    /// Link harvester.
    pub extractor: LinkExtractor,
    /// Shared counters for the stats display.
    pub stats: Arc<Statistics>,
    /// Run-wide shutdown signal.
    pub signal: ShutdownSignal,
    /// Pre-built session probe; present when a catch phrase is configured.
    pub probe: Option<Request>,
}

/// One concurrent fuzzing worker.
pub struct Worker {
    id: String,
    ctx: Arc<FuzzContext>,
}

/// Lock a shared structure, riding over poisoning from a panicked peer.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Worker {
    /// Create a worker with the id it sends as `REQ-ID`.
    pub fn new(id: String, ctx: Arc<FuzzContext>) -> Self {
        Self { id, ctx }
    }

    /// Run the fuzz loop until a shutdown signal or source exhaustion.
    pub async fn run(self) -> ExitCode {
        tracing::info!(worker = %self.id, "Worker reporting active");

        let mut mix = RequestMix::new(self.ctx.probe.clone());

        loop {
            // Holds the worker here while an interrupt prompt is open.
            self.ctx.signal.checkpoint().await;

            let next = {
                let mut crawler = lock(&self.ctx.crawler);
                let mut corpus = lock(&self.ctx.corpus);
                mix.next(&mut crawler, &mut corpus)
            };

            let Some((source, mut request)) = next else {
                tracing::error!(worker = %self.id, "Aborting due to lack of paths");
                return ExitCode::EmptyQueue;
            };

            match source {
                Source::Crawler => {
                    tracing::debug!(worker = %self.id, request = %request, "Chosen an unvisited node");
                }
                Source::Corpus => {
                    let corpus = lock(&self.ctx.corpus);
                    request = self.ctx.mutator.mutate(&request, &corpus);
                    drop(corpus);
                    tracing::debug!(worker = %self.id, request = %request, "Chosen a mutated node");
                }
                Source::Probe => {
                    tracing::debug!(worker = %self.id, "Sending session probe");
                }
            }

            let status = self.handle_request(&mut request, source).await;
            let record = serde_json::to_string(&request.to_record(&self.ctx.meta))
                .unwrap_or_else(|_| request.to_string());
            tracing::debug!(worker = %self.id, ?status, record = %record, "Request completed");

            if source == Source::Probe && status != RequestStatus::SuccessFoundPhrase {
                tracing::warn!(worker = %self.id, "Fuzzer has been logged out");
                return ExitCode::LoggedOut;
            }

            if self.ctx.signal.is_triggered() {
                return self.ctx.signal.get();
            }
        }
    }

    /// Dispatch one request and digest its response.
    pub async fn handle_request(&self, request: &mut Request, source: Source) -> RequestStatus {
        let pairs = |map: &crate::request::ParamMap| -> Vec<(String, String)> {
            map.iter()
                .flat_map(|(k, vs)| vs.iter().map(move |v| (k.clone(), v.clone())))
                .collect()
        };

        let builder = match request.method() {
            HttpMethod::Get => self
                .ctx
                .client
                .get(request.url().clone())
                .query(&pairs(&request.params().get)),
            HttpMethod::Post => self
                .ctx
                .client
                .post(request.url().clone())
                .query(&pairs(&request.params().get))
                .form(&pairs(&request.params().post)),
        };

        tracing::debug!(worker = %self.id, url = %request.url(), "Sending request");
        let started = Instant::now();
        let sent = builder.header("REQ-ID", &self.id).send().await;
        self.ctx.stats.record_request();

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(worker = %self.id, url = %request.url(), error = %e, "Request failed");
                return RequestStatus::UnsuccessfulRequest;
            }
        };

        let status = response.status();
        let mut exit_early = false;

        if status.as_u16() >= 400 {
            tracing::warn!(worker = %self.id, code = status.as_u16(), url = %response.url(), "Got error status");
            if self.ctx.config.ignore_404 && status.as_u16() == 404 {
                exit_early = true;
            }
            if self.ctx.config.ignore_4xx {
                exit_early = true;
            }
        }

        if let Some(essence) = content_type_essence(response.headers()) {
            if essence != "text/html" {
                tracing::debug!(worker = %self.id, content_type = %essence, "Got non-html payload");
                exit_early = true;
            }
        }

        if exit_early {
            tracing::debug!(worker = %self.id, "Discarding response");
            return RequestStatus::InvalidResponse;
        }

        let headers = response.headers().clone();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(worker = %self.id, error = %e, "Failed to read response body");
                return RequestStatus::UnsuccessfulRequest;
            }
        };
        request.exec_time = started.elapsed().as_secs_f64();

        let Ok(raw_html) = String::from_utf8(body.to_vec()) else {
            tracing::warn!(worker = %self.id, "Response body is not valid UTF-8");
            return RequestStatus::UnsuccessfulRequest;
        };

        if source == Source::Probe {
            return self.check_probe(&raw_html);
        }

        let mut document = None;
        if self.ctx.detector.precheck(&raw_html) {
            let parsed = Html::parse_document(&raw_html);
            self.ctx.detector.scan(request, &parsed);
            document = Some(parsed);
        }

        let cfg = self.ctx.meta.collect(&headers, &self.id);
        request.record_coverage(&cfg);

        let admitted = lock(&self.ctx.corpus).add(request.clone(), &cfg);
        if !admitted {
            tracing::debug!(worker = %self.id, "Not interesting");
            self.update_stats(request);
            return RequestStatus::SuccessNotInteresting;
        }

        let document = document.unwrap_or_else(|| Html::parse_document(&raw_html));
        let links = self.ctx.extractor.extract(request, &document);
        drop(document);
        lock(&self.ctx.crawler).add(links);

        self.update_stats(request);
        RequestStatus::SuccessInteresting
    }

    /// Decide whether a probe response still proves a live session.
    fn check_probe(&self, raw_html: &str) -> RequestStatus {
        match self.ctx.config.catch_phrase.as_deref() {
            Some(phrase) if !raw_html.contains(phrase) => RequestStatus::SuccessNotInteresting,
            _ => {
                tracing::debug!(worker = %self.id, "Still logged in");
                RequestStatus::SuccessFoundPhrase
            }
        }
    }

    /// Push the cycle's results into the shared stats.
    fn update_stats(&self, request: &Request) {
        let (total_cover, pending) = {
            let corpus = lock(&self.ctx.corpus);
            let crawler = lock(&self.ctx.crawler);
            (corpus.total_cover_score(), crawler.pending())
        };

        self.ctx.stats.update_cycle(
            CurrentRequest {
                url: request.url().to_string(),
                exec_time: request.exec_time,
                cover_score: request.cover_score(&self.ctx.meta),
                is_mutated: request.is_mutated(),
            },
            total_cover,
            pending,
            self.ctx.detector.xss_count(),
        );
    }
}

/// The media type of a response without its parameters.
fn content_type_essence(headers: &reqwest::header::HeaderMap) -> Option<String> {
    let raw = headers.get(reqwest::header::CONTENT_TYPE)?.to_str().ok()?;
    Some(
        raw.split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase(),
    )
}
