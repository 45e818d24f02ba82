//! Run configuration for a fuzzing session.
//!
//! The configuration is an immutable record assembled once by the caller
//! (normally the CLI) and passed by reference to every component that needs
//! it. There is no global mutable state; the only run-wide mutable is the
//! [`crate::signal::ShutdownSignal`].

use regex::{Regex, RegexBuilder};

use crate::error::ConfigError;

/// Default per-request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 35;

/// How the fuzzer presents itself while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Plain terminal stats repaint.
    Simple,
    /// Stats written to `/tmp/fuzzer_stats`, truncated each refresh.
    File,
    /// Reserved; returns cleanly without fuzzing.
    Auto,
    /// Reserved; returns cleanly without fuzzing.
    Manual,
}

impl std::str::FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Self::Simple),
            "file" => Ok(Self::File),
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            other => Err(ConfigError::InvalidValue {
                field: "runMode".to_string(),
                message: format!("unknown mode '{other}', expected simple, file, auto or manual"),
            }),
        }
    }
}

/// A single blocklist rule, given on the command line as `'url|key|val'`.
///
/// A request is blocked when `url` matches its URL and either no key pattern
/// was given, or some parameter key matching `key` carries a value matching
/// `val`. All matching is case-insensitive substring search.
#[derive(Debug, Clone)]
pub struct BlockRule {
    /// Pattern matched against the request URL. Always present.
    pub url: Regex,
    /// Pattern matched against parameter keys, if given.
    pub key: Option<Regex>,
    /// Pattern matched against values of matching keys, if given.
    pub val: Option<Regex>,
}

impl BlockRule {
    /// Parse a `'url|key|val'` rule. `key` and `val` may be empty.
    pub fn parse(rule: &str) -> Result<Self, ConfigError> {
        let mut parts = rule.splitn(3, '|');
        let (Some(url), Some(key), Some(val)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ConfigError::InvalidBlockRule {
                rule: rule.to_string(),
                message: "expected 'url|key|val' with two '|' separators".to_string(),
            });
        };

        if url.is_empty() {
            return Err(ConfigError::InvalidBlockRule {
                rule: rule.to_string(),
                message: "the url pattern must not be empty".to_string(),
            });
        }

        let compile = |pattern: &str| -> Result<Option<Regex>, ConfigError> {
            if pattern.is_empty() {
                return Ok(None);
            }
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map(Some)
                .map_err(|e| ConfigError::InvalidBlockRule {
                    rule: rule.to_string(),
                    message: e.to_string(),
                })
        };

        Ok(Self {
            url: compile(url)?.expect("non-empty url pattern"),
            key: compile(key)?,
            val: compile(val)?,
        })
    }
}

/// Immutable configuration for one fuzzing session.
#[derive(Debug, Clone)]
pub struct Config {
    /// The initial URL to start fuzzing from.
    pub url: url::Url,
    /// Presentation mode.
    pub run_mode: RunMode,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Session timeout in seconds; 0 means no timeout.
    pub timeout_secs: u64,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Location of the `instr.meta` file.
    pub meta_file: String,
    /// Acquire session cookies through the browser driver before fuzzing.
    pub session: bool,
    /// Location of the web driver binary (used with `session`).
    pub driver_file: String,
    /// Links the fuzzer must not request.
    pub blocklist: Vec<BlockRule>,
    /// Discard responses with a 404 status.
    pub ignore_404: bool,
    /// Discard responses with any 4xx status.
    pub ignore_4xx: bool,
    /// Treat URLs differing only in fragment as distinct.
    pub unique_anchors: bool,
    /// Maximum XSS payloads injected into a single parameter.
    pub max_xss: u32,
    /// Substring whose absence from a probe response means the session died.
    pub catch_phrase: Option<String>,
}

impl Config {
    /// Minimal configuration for the given start URL; used by tests.
    pub fn for_url(url: url::Url) -> Self {
        Self {
            url,
            run_mode: RunMode::Simple,
            workers: 1,
            timeout_secs: 0,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            meta_file: "./instr.meta".to_string(),
            session: false,
            driver_file: "./drivers/chromedriver".to_string(),
            blocklist: Vec::new(),
            ignore_404: false,
            ignore_4xx: false,
            unique_anchors: false,
            max_xss: 3,
            catch_phrase: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_mode_parses_all_variants() {
        assert_eq!("simple".parse::<RunMode>().unwrap(), RunMode::Simple);
        assert_eq!("file".parse::<RunMode>().unwrap(), RunMode::File);
        assert_eq!("auto".parse::<RunMode>().unwrap(), RunMode::Auto);
        assert_eq!("manual".parse::<RunMode>().unwrap(), RunMode::Manual);
    }

    #[test]
    fn run_mode_rejects_unknown() {
        let err = "curses".parse::<RunMode>().unwrap_err();
        assert!(err.to_string().contains("unknown mode 'curses'"));
    }

    #[test]
    fn block_rule_full_triple() {
        let rule = BlockRule::parse("logout|token|[0-9a-f]+").unwrap();
        assert!(rule.url.is_match("http://t/logout.php"));
        assert!(rule.key.unwrap().is_match("csrf_TOKEN"));
        assert!(rule.val.unwrap().is_match("deadbeef"));
    }

    #[test]
    fn block_rule_empty_key_and_val() {
        let rule = BlockRule::parse("admin/delete||").unwrap();
        assert!(rule.key.is_none());
        assert!(rule.val.is_none());
    }

    #[test]
    fn block_rule_is_case_insensitive() {
        let rule = BlockRule::parse("LogOut||").unwrap();
        assert!(rule.url.is_match("http://t/logout"));
    }

    #[test]
    fn block_rule_missing_separators() {
        assert!(BlockRule::parse("logout").is_err());
        assert!(BlockRule::parse("logout|key").is_err());
    }

    #[test]
    fn block_rule_empty_url_rejected() {
        assert!(BlockRule::parse("|key|val").is_err());
    }
}
