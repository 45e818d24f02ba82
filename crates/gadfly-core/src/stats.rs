//! Shared run statistics and the periodic stats display.
//!
//! Workers update [`Statistics`] after every cycle; a single reporter task
//! renders it every 200 ms, either repainting the terminal (`simple` mode) or
//! truncating and rewriting `/tmp/fuzzer_stats` (`file` mode). Throughput is
//! computed over a sliding two-second window.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::signal::ShutdownSignal;

/// Where the `file` run mode renders to.
pub const STATS_FILE: &str = "/tmp/fuzzer_stats";

/// How often the display refreshes.
const REFRESH_INTERVAL: Duration = Duration::from_millis(200);

/// How often throughput is re-sampled.
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(2);

/// Snapshot of the request a worker most recently completed.
#[derive(Debug, Clone, Default)]
pub struct CurrentRequest {
    /// The request URL.
    pub url: String,
    /// Response time of the last dispatch, seconds.
    pub exec_time: f64,
    /// Coverage percentage of this single request.
    pub cover_score: f64,
    /// Whether the request came out of the mutator.
    pub is_mutated: bool,
}

/// Counters shared between all workers and the reporter.
pub struct Statistics {
    start: Instant,
    total_requests: AtomicU64,
    total_xss: AtomicU64,
    crawler_pending: AtomicU64,
    /// `f64` bit pattern; coverage percentages update atomically.
    total_cover_bits: AtomicU64,
    current: Mutex<CurrentRequest>,
}

impl Statistics {
    /// Fresh counters, clock started now.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            total_requests: AtomicU64::new(0),
            total_xss: AtomicU64::new(0),
            crawler_pending: AtomicU64::new(0),
            total_cover_bits: AtomicU64::new(0f64.to_bits()),
            current: Mutex::new(CurrentRequest::default()),
        }
    }

    /// Count one dispatched request.
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Total requests dispatched so far.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Refresh the cycle-derived gauges after a completed request.
    pub fn update_cycle(
        &self,
        current: CurrentRequest,
        total_cover_score: f64,
        crawler_pending: usize,
        total_xss: u64,
    ) {
        self.total_cover_bits
            .store(total_cover_score.to_bits(), Ordering::Relaxed);
        self.crawler_pending
            .store(crawler_pending as u64, Ordering::Relaxed);
        self.total_xss.store(total_xss, Ordering::Relaxed);
        if let Ok(mut slot) = self.current.lock() {
            *slot = current;
        }
    }

    /// Overall coverage percentage.
    pub fn total_cover_score(&self) -> f64 {
        f64::from_bits(self.total_cover_bits.load(Ordering::Relaxed))
    }

    /// Crawler backlog size.
    pub fn crawler_pending(&self) -> u64 {
        self.crawler_pending.load(Ordering::Relaxed)
    }

    /// Total XSS sink hits.
    pub fn total_xss(&self) -> u64 {
        self.total_xss.load(Ordering::Relaxed)
    }

    /// Seconds since the session started.
    pub fn runtime(&self) -> Duration {
        self.start.elapsed()
    }

    /// The most recently completed request.
    pub fn current(&self) -> CurrentRequest {
        self.current
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or_default()
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the reporter writes its frames.
pub enum StatsSink {
    /// Repaint the terminal.
    Stdout,
    /// Truncate and rewrite a file each refresh.
    File(PathBuf),
}

/// Periodic stats renderer.
pub struct StatsReporter {
    stats: Arc<Statistics>,
    signal: ShutdownSignal,
    sink: StatsSink,
}

impl StatsReporter {
    /// Create a reporter over the shared statistics.
    pub fn new(stats: Arc<Statistics>, signal: ShutdownSignal, sink: StatsSink) -> Self {
        Self {
            stats,
            signal,
            sink,
        }
    }

    /// Render until the shutdown signal fires.
    pub async fn run(self) {
        let mut past_count = 0u64;
        let mut past_time = Instant::now();
        let mut throughput = 0.0f64;

        loop {
            tokio::select! {
                () = self.signal.cancelled() => {
                    println!("Exit Initiated. Please wait, this may take a few seconds...");
                    return;
                }
                () = tokio::time::sleep(REFRESH_INTERVAL) => {}
            }

            let now = Instant::now();
            if now.duration_since(past_time) > THROUGHPUT_WINDOW {
                let total = self.stats.total_requests();
                throughput = (total.saturating_sub(past_count)) as f64
                    / now.duration_since(past_time).as_secs_f64();
                past_count = total;
                past_time = now;

                tracing::info!(
                    total_cover = self.stats.total_cover_score(),
                    throughput,
                    "Session stats"
                );
            }

            let frame = self.render(throughput);
            match &self.sink {
                StatsSink::Stdout => {
                    // Clear screen and home the cursor before repainting.
                    print!("\x1b[2J\x1b[H{frame}");
                    let _ = std::io::stdout().flush();
                }
                StatsSink::File(path) => {
                    if let Ok(mut file) = std::fs::File::create(path) {
                        let _ = file.write_all(frame.as_bytes());
                        let _ = file.flush();
                    }
                }
            }
        }
    }

    /// Compose one stats frame.
    fn render(&self, throughput: f64) -> String {
        let current = self.stats.current();
        let state = if current.is_mutated {
            "Fuzzing"
        } else {
            "Crawling"
        };
        let link: String = current.url.chars().take(105).collect();

        format!(
            "gadfly\n-----\n\n\
             Stats\n\n\
             Runtime: {:.2} min\n\
             Total Requests: {}\n\
             Throughput: {:.2} requests/s\n\
             Crawler Pending URLs: {}\n\
             Current Coverage Score: {:.4}%\n\
             Total Coverage Score: {:.4}%\n\
             Possible XSS: {}\n\
             Executing link: {}\n\
             Response time: {:.2} sec\n\
             State: {}\n",
            self.stats.runtime().as_secs_f64() / 60.0,
            self.stats.total_requests(),
            throughput,
            self.stats.crawler_pending(),
            current.cover_score,
            self.stats.total_cover_score(),
            self.stats.total_xss(),
            link,
            current.exec_time,
            state,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::ExitCode;

    #[test]
    fn counters_accumulate() {
        let stats = Statistics::new();
        stats.record_request();
        stats.record_request();
        assert_eq!(stats.total_requests(), 2);
    }

    #[test]
    fn update_cycle_refreshes_gauges() {
        let stats = Statistics::new();
        stats.update_cycle(
            CurrentRequest {
                url: "http://t/a".to_string(),
                exec_time: 0.4,
                cover_score: 2.5,
                is_mutated: true,
            },
            7.5,
            12,
            3,
        );

        assert!((stats.total_cover_score() - 7.5).abs() < f64::EPSILON);
        assert_eq!(stats.crawler_pending(), 12);
        assert_eq!(stats.total_xss(), 3);
        assert_eq!(stats.current().url, "http://t/a");
        assert!(stats.current().is_mutated);
    }

    #[test]
    fn render_mentions_state_and_counts() {
        let stats = Arc::new(Statistics::new());
        stats.record_request();
        stats.update_cycle(
            CurrentRequest {
                url: "http://t/long".to_string(),
                exec_time: 0.2,
                cover_score: 1.0,
                is_mutated: false,
            },
            4.0,
            9,
            1,
        );

        let reporter = StatsReporter::new(stats, ShutdownSignal::new(), StatsSink::Stdout);
        let frame = reporter.render(3.5);
        assert!(frame.contains("Total Requests: 1"));
        assert!(frame.contains("State: Crawling"));
        assert!(frame.contains("Throughput: 3.50 requests/s"));
        assert!(frame.contains("Possible XSS: 1"));
    }

    #[tokio::test]
    async fn file_sink_writes_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats");

        let stats = Arc::new(Statistics::new());
        let signal = ShutdownSignal::new();
        let reporter = StatsReporter::new(
            stats.clone(),
            signal.clone(),
            StatsSink::File(path.clone()),
        );

        let handle = tokio::spawn(reporter.run());
        tokio::time::sleep(Duration::from_millis(600)).await;
        signal.trigger(ExitCode::User);
        handle.await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("gadfly"));
        assert!(contents.contains("Total Requests: 0"));
    }
}
