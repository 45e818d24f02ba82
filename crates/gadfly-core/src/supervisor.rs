//! Spawns and shepherds the worker fleet.
//!
//! The supervisor assembles the shared context (transport client, crawler
//! seeded with the start URL, corpus, mutator, detector), arms the session
//! timeout, and spawns the configured number of workers. The first worker
//! gets a head start so the crawler holds harvested links before the rest
//! race it; workers that find an empty queue exit.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use crate::config::Config;
use crate::corpus::Corpus;
use crate::crawler::Crawler;
use crate::detector::Detector;
use crate::error::ConfigError;
use crate::html::LinkExtractor;
use crate::instrument::{InstrumentMeta, OutputMethod};
use crate::mutator::Mutator;
use crate::request::Request;
use crate::session::{self, Cookie};
use crate::signal::{ExitCode, ShutdownSignal};
use crate::stats::Statistics;
use crate::worker::{FuzzContext, Worker};

/// Grace period after spawning the first worker, giving it time to complete
/// a request/response cycle and refill the crawler.
const WORKER_WARMUP: Duration = Duration::from_secs(8);

/// Floor for the response-header cap when feedback arrives over HTTP.
const MIN_HEADER_CAP: usize = 10_000;

/// Builds the shared context and runs the fuzzing session.
pub struct Supervisor {
    ctx: Arc<FuzzContext>,
    warmup: Duration,
}

impl Supervisor {
    /// Assemble a supervisor from validated configuration, instrumentation
    /// metadata and any pre-captured session cookies.
    pub fn build(
        config: Config,
        meta: InstrumentMeta,
        cookies: Vec<Cookie>,
    ) -> Result<Self, ConfigError> {
        let mut headers = session::default_headers();
        if !cookies.is_empty() {
            let value = session::cookie_header(&cookies);
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&value) {
                headers.insert(reqwest::header::COOKIE, value);
            }
        }

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(config.workers)
            .cookie_store(true)
            .default_headers(headers);

        if meta.output_method == OutputMethod::Http {
            // Instrumentation feedback arrives as one header per label.
            let cap = usize::try_from(meta.basic_blocks).unwrap_or(usize::MAX);
            builder = builder.http1_max_headers(cap.max(MIN_HEADER_CAP));
        }

        let client = builder
            .build()
            .map_err(|source| ConfigError::ClientBuild { source })?;

        let seed =
            Request::seed(config.url.clone(), config.unique_anchors).map_err(|e| {
                ConfigError::InvalidValue {
                    field: "URL".to_string(),
                    message: e.to_string(),
                }
            })?;
        let probe = config.catch_phrase.as_ref().map(|_| seed.clone());

        let ctx = Arc::new(FuzzContext {
            mutator: Mutator::new(meta.policy, config.max_xss, config.unique_anchors),
            extractor: LinkExtractor::new(config.unique_anchors),
            crawler: Mutex::new(Crawler::new([seed], config.blocklist.clone())),
            corpus: Mutex::new(Corpus::new(meta.clone())),
            detector: Detector::new(),
            stats: Arc::new(Statistics::new()),
            signal: ShutdownSignal::new(),
            client,
            probe,
            config,
            meta,
        });

        Ok(Self {
            ctx,
            warmup: WORKER_WARMUP,
        })
    }

    /// The shared context, for wiring the stats reporter and interrupt
    /// handling.
    pub fn context(&self) -> Arc<FuzzContext> {
        self.ctx.clone()
    }

    /// The run-wide shutdown signal.
    pub fn signal(&self) -> ShutdownSignal {
        self.ctx.signal.clone()
    }

    /// Shared statistics counters.
    pub fn stats(&self) -> Arc<Statistics> {
        self.ctx.stats.clone()
    }

    /// Run the session to completion and return its exit code.
    pub async fn run(&self) -> ExitCode {
        self.arm_timeout();

        let worker_count = self.ctx.config.workers.max(1);
        tracing::info!(workers = worker_count, "Spawning workers");

        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let id = rand::thread_rng().gen_range(10_000..1_000_000).to_string();
            let worker = Worker::new(id, self.ctx.clone());
            handles.push(tokio::spawn(worker.run()));

            if index == 0 {
                // Let the first worker complete at least one cycle before
                // the rest race a near-empty crawler.
                tokio::select! {
                    () = self.ctx.signal.cancelled() => {}
                    () = tokio::time::sleep(self.warmup) => {}
                }
            }

            if self.ctx.signal.is_triggered() {
                break;
            }
        }

        let mut exit = ExitCode::None;
        for handle in handles {
            match handle.await {
                Ok(code) if code != ExitCode::None => exit = code,
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Worker task failed"),
            }
        }

        self.ctx.signal.trigger(exit);
        let finale = match self.ctx.signal.get() {
            ExitCode::None => exit,
            code => code,
        };

        tracing::warn!(code = %finale, "Shutting down initiated");
        finale
    }

    /// Arm the wall-clock session timeout, when one is configured.
    fn arm_timeout(&self) {
        if self.ctx.config.timeout_secs == 0 {
            return;
        }

        let signal = self.ctx.signal.clone();
        let timeout = Duration::from_secs(self.ctx.config.timeout_secs);
        tokio::spawn(async move {
            tokio::select! {
                () = signal.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    tracing::warn!("Reached timeout, stopping fuzzing process");
                    signal.trigger(ExitCode::Timeout);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn node_meta() -> InstrumentMeta {
        serde_json::from_str(
            r#"{"basic-block-count": 100, "output-method": "http",
                "instrument-policy": "node"}"#,
        )
        .unwrap()
    }

    fn config_for(server: &MockServer, workers: usize, timeout_secs: u64) -> Config {
        let mut config = Config::for_url(url::Url::parse(&format!("{}/", server.uri())).unwrap());
        config.workers = workers;
        config.timeout_secs = timeout_secs;
        config
    }

    #[tokio::test]
    async fn empty_target_drains_the_queue() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html><body>dead end</body></html>"),
            )
            .mount(&server)
            .await;

        let mut supervisor =
            Supervisor::build(config_for(&server, 2, 0), node_meta(), Vec::new()).unwrap();
        supervisor.warmup = Duration::ZERO;

        let exit = supervisor.run().await;
        assert_eq!(exit, ExitCode::EmptyQueue);
        assert_eq!(supervisor.signal().get(), ExitCode::EmptyQueue);
    }

    #[tokio::test]
    async fn session_timeout_stops_a_busy_run() {
        let server = MockServer::start().await;
        // Interesting seed: the corpus never drains, workers mutate forever.
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .insert_header("I-1", "3")
                    .set_body_string("<html><body>busy</body></html>"),
            )
            .mount(&server)
            .await;

        let mut supervisor =
            Supervisor::build(config_for(&server, 1, 1), node_meta(), Vec::new()).unwrap();
        supervisor.warmup = Duration::ZERO;

        let exit = supervisor.run().await;
        assert_eq!(exit, ExitCode::Timeout);
    }

    #[tokio::test]
    async fn prior_signal_wins_over_worker_codes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html><body>x</body></html>"),
            )
            .mount(&server)
            .await;

        let mut supervisor =
            Supervisor::build(config_for(&server, 1, 0), node_meta(), Vec::new()).unwrap();
        supervisor.warmup = Duration::ZERO;
        supervisor.signal().trigger(ExitCode::User);

        let exit = supervisor.run().await;
        assert_eq!(exit, ExitCode::User);
    }

    #[tokio::test]
    async fn cookies_ride_along_on_requests() {
        let server = MockServer::start().await;
        // Coverage is only reported to a request carrying the session
        // cookie, so an admitted corpus entry proves the header went out.
        Mock::given(method("GET"))
            .and(wiremock::matchers::header("cookie", "sid=abc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .insert_header("I-1", "3")
                    .set_body_string("<html><body>hello</body></html>"),
            )
            .mount(&server)
            .await;

        let cookies = vec![Cookie {
            name: "sid".to_string(),
            value: "abc".to_string(),
        }];
        let mut supervisor =
            Supervisor::build(config_for(&server, 1, 1), node_meta(), cookies).unwrap();
        supervisor.warmup = Duration::ZERO;

        let exit = supervisor.run().await;
        assert_eq!(exit, ExitCode::Timeout);

        let ctx = supervisor.context();
        let corpus = ctx.corpus.lock().unwrap();
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn probe_is_built_only_with_a_catch_phrase() {
        let config = Config::for_url(url::Url::parse("http://t/").unwrap());
        let supervisor = Supervisor::build(config, node_meta(), Vec::new()).unwrap();
        assert!(supervisor.context().probe.is_none());

        let mut config = Config::for_url(url::Url::parse("http://t/").unwrap());
        config.catch_phrase = Some("hello".to_string());
        let supervisor = Supervisor::build(config, node_meta(), Vec::new()).unwrap();
        assert!(supervisor.context().probe.is_some());
    }
}
