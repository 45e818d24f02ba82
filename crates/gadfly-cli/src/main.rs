//! gadfly CLI - grey-box web application fuzzer.
//!
//! Entry point for the `gadfly` binary. Parses CLI arguments, initializes
//! file logging, loads the instrumentation metadata, optionally captures
//! session cookies through a browser driver, and hands control to the
//! supervisor. The process exit code reports why the session ended.
mod interrupt;
mod logging;

use clap::Parser;
use gadfly_core::config::{BlockRule, Config, RunMode, DEFAULT_REQUEST_TIMEOUT_SECS};
use gadfly_core::instrument::InstrumentMeta;
use gadfly_core::session;
use gadfly_core::stats::{StatsReporter, StatsSink, STATS_FILE};
use gadfly_core::supervisor::Supervisor;

/// Grey-box fuzzer for web applications
#[derive(Parser)]
#[command(name = "gadfly")]
#[command(version)]
#[command(about = "Grey-box coverage-guided fuzzer for web applications")]
#[command(override_usage = "gadfly [options] -r/--runMode <mode> <URL>")]
struct Cli {
    /// Increase verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Login through the browser and get cookies
    #[arg(short, long)]
    session: bool,

    /// Do not fuzz links that return 404 code
    #[arg(long = "ignore-404")]
    ignore_404: bool,

    /// Do not fuzz links that return 4xx code
    #[arg(long = "ignore-4xx")]
    ignore_4xx: bool,

    /// Location of the instrumentation meta file (instr.meta)
    #[arg(short = 'm', long = "metaFile", default_value = "./instr.meta")]
    meta_file: String,

    /// Block a link from being fuzzed, form = 'url|key|val' (repeatable)
    #[arg(short = 'b', long = "block")]
    block: Vec<String>,

    /// Number of workers that concurrently send requests
    #[arg(short = 'w', long = "worker", default_value_t = 1)]
    worker: usize,

    /// Treat urls with different anchors as different urls
    #[arg(long = "unique-anchors")]
    unique_anchors: bool,

    /// Location of the web driver (used with -s)
    #[arg(long = "driverFile", default_value = "./drivers/chromedriver")]
    driver_file: String,

    /// Fuzzing session timeout in seconds (0 means no timeout)
    #[arg(short = 't', long = "timeout", default_value_t = 0)]
    timeout: u64,

    /// Per-request timeout in seconds
    #[arg(long = "request-timeout", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    request_timeout: u64,

    /// Maximum XSS payloads to inject in a single parameter
    #[arg(long = "maxXss", default_value_t = 3)]
    max_xss: u32,

    /// Substring that proves the session is still logged in
    #[arg(short = 'p', long = "catchPhrase")]
    catch_phrase: Option<String>,

    /// Run mode: simple, file, auto or manual
    #[arg(short = 'r', long = "runMode", default_value = "simple")]
    run_mode: RunMode,

    /// Initial URL to start fuzzing from
    url: String,
}

impl Cli {
    /// Assemble the immutable run configuration, failing on any
    /// unparseable input.
    fn into_config(self) -> anyhow::Result<Config> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| anyhow::anyhow!("invalid start URL '{}': {e}", self.url))?;

        let blocklist = self
            .block
            .iter()
            .map(|rule| BlockRule::parse(rule))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Config {
            url,
            run_mode: self.run_mode,
            workers: self.worker.max(1),
            timeout_secs: self.timeout,
            request_timeout_secs: self.request_timeout,
            meta_file: self.meta_file,
            session: self.session,
            driver_file: self.driver_file,
            blocklist,
            ignore_404: self.ignore_404,
            ignore_4xx: self.ignore_4xx,
            unique_anchors: self.unique_anchors,
            max_xss: self.max_xss,
            catch_phrase: self.catch_phrase,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level_handle = logging::init(cli.verbose)?;

    if matches!(cli.run_mode, RunMode::Auto | RunMode::Manual) {
        eprintln!("Run mode not implemented yet; available modes: simple, file");
        return Ok(());
    }

    let config = cli.into_config()?;
    tracing::debug!(?config, "Configuration assembled");

    // Configuration problems are fatal before any worker spawns.
    let meta = InstrumentMeta::load(&config.meta_file)
        .map_err(|e| anyhow::anyhow!("bad instrumentation meta: {e}"))?;

    let cookies = if config.session {
        session::capture_cookies(&config.driver_file, &config.url)
            .await
            .map_err(|e| anyhow::anyhow!("session cookie capture failed: {e}"))?
    } else {
        Vec::new()
    };

    let sink = match config.run_mode {
        RunMode::File => StatsSink::File(STATS_FILE.into()),
        _ => StatsSink::Stdout,
    };

    let supervisor = Supervisor::build(config, meta, cookies)?;

    interrupt::spawn(supervisor.signal(), level_handle);

    let reporter = StatsReporter::new(supervisor.stats(), supervisor.signal(), sink);
    let stats_task = tokio::spawn(reporter.run());

    let exit = supervisor.run().await;
    let _ = stats_task.await;

    tracing::info!(code = %exit, "Session finished");
    std::process::exit(exit.code());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn minimal_invocation_uses_defaults() {
        let cli = parse(&["gadfly", "http://target/"]);
        assert_eq!(cli.url, "http://target/");
        assert_eq!(cli.worker, 1);
        assert_eq!(cli.timeout, 0);
        assert_eq!(cli.request_timeout, DEFAULT_REQUEST_TIMEOUT_SECS);
        assert_eq!(cli.max_xss, 3);
        assert_eq!(cli.meta_file, "./instr.meta");
        assert_eq!(cli.run_mode, RunMode::Simple);
        assert!(!cli.session);
    }

    #[test]
    fn verbose_occurrences_accumulate() {
        let cli = parse(&["gadfly", "-vvv", "http://target/"]);
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn camel_case_long_options_are_accepted() {
        let cli = parse(&[
            "gadfly",
            "--runMode",
            "file",
            "--metaFile",
            "/tmp/instr.meta",
            "--maxXss",
            "5",
            "--driverFile",
            "/opt/chromedriver",
            "http://target/",
        ]);
        assert_eq!(cli.run_mode, RunMode::File);
        assert_eq!(cli.meta_file, "/tmp/instr.meta");
        assert_eq!(cli.max_xss, 5);
        assert_eq!(cli.driver_file, "/opt/chromedriver");
    }

    #[test]
    fn block_rules_repeat() {
        let cli = parse(&[
            "gadfly",
            "-b",
            "logout||",
            "-b",
            "admin|token|[0-9]+",
            "http://target/",
        ]);
        assert_eq!(cli.block.len(), 2);

        let config = cli.into_config().unwrap();
        assert_eq!(config.blocklist.len(), 2);
    }

    #[test]
    fn bad_block_rule_fails_config_assembly() {
        let cli = parse(&["gadfly", "-b", "only-a-url", "http://target/"]);
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn bad_url_fails_config_assembly() {
        let cli = parse(&["gadfly", "not a url"]);
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn unknown_run_mode_is_rejected_at_parse_time() {
        assert!(Cli::try_parse_from(["gadfly", "-r", "curses", "http://t/"]).is_err());
    }

    #[test]
    fn url_is_required() {
        assert!(Cli::try_parse_from(["gadfly"]).is_err());
    }

    #[test]
    fn flags_map_into_config() {
        let cli = parse(&[
            "gadfly",
            "--ignore-404",
            "--ignore-4xx",
            "--unique-anchors",
            "-w",
            "4",
            "-t",
            "600",
            "-p",
            "logged in as",
            "http://target/app?x=1",
        ]);
        let config = cli.into_config().unwrap();
        assert!(config.ignore_404);
        assert!(config.ignore_4xx);
        assert!(config.unique_anchors);
        assert_eq!(config.workers, 4);
        assert_eq!(config.timeout_secs, 600);
        assert_eq!(config.catch_phrase.as_deref(), Some("logged in as"));
    }
}
