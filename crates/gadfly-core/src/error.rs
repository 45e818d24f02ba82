//! Error types for the gadfly core library.
//!
//! Each module has its own error enum to provide clear error boundaries.
//! The library uses `thiserror` for structured, typed errors. Per-request
//! outcomes inside the fuzz loop are *not* errors; they are reported through
//! [`crate::worker::RequestStatus`].

/// Errors related to run configuration and instrumentation metadata.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The instrumentation meta file does not exist at the specified path.
    #[error("instrumentation meta file not found: {path}")]
    MetaFileNotFound {
        /// The path that was searched.
        path: String,
    },

    /// JSON deserialization of the instrumentation meta file failed.
    #[error("failed to parse instrumentation meta file: {source}")]
    MetaParseError {
        /// The underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A required instrumentation meta key is absent.
    #[error("missing required instrumentation meta key: {key}")]
    MetaMissingKey {
        /// The name of the missing key.
        key: String,
    },

    /// A configuration value has an unacceptable form.
    #[error("invalid value for '{field}': {message}")]
    InvalidValue {
        /// The name of the invalid field.
        field: String,
        /// A description of why the value is invalid.
        message: String,
    },

    /// A blocklist rule could not be parsed.
    #[error("invalid block rule '{rule}': {message}")]
    InvalidBlockRule {
        /// The rule as given on the command line.
        rule: String,
        /// A description of the problem.
        message: String,
    },

    /// The shared transport client could not be constructed.
    #[error("failed to build the HTTP client: {source}")]
    ClientBuild {
        /// The underlying client builder error.
        #[source]
        source: reqwest::Error,
    },
}

/// Errors from constructing a fuzzing request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// A GET request was given POST body parameters.
    #[error("a GET request cannot carry POST parameters: {url}")]
    PostParamsOnGet {
        /// The offending request URL.
        url: String,
    },

    /// The URL is not absolute or otherwise unusable.
    #[error("invalid request URL '{url}': {source}")]
    InvalidUrl {
        /// The URL as given.
        url: String,
        /// The underlying URL parse error.
        #[source]
        source: url::ParseError,
    },
}

/// Errors from capturing session cookies through a browser driver.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The web driver binary could not be started.
    #[error("failed to launch web driver '{path}': {source}")]
    DriverLaunch {
        /// The driver binary path.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A WebDriver protocol request failed.
    #[error("web driver request failed: {source}")]
    Protocol {
        /// The underlying HTTP client error.
        #[source]
        source: reqwest::Error,
    },

    /// The driver returned a response we could not interpret.
    #[error("unexpected web driver response: {message}")]
    UnexpectedResponse {
        /// Details about the malformed response.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_meta_not_found_message() {
        let err = ConfigError::MetaFileNotFound {
            path: "./instr.meta".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "instrumentation meta file not found: ./instr.meta"
        );
    }

    #[test]
    fn config_error_missing_key_message() {
        let err = ConfigError::MetaMissingKey {
            key: "edge-count".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "missing required instrumentation meta key: edge-count"
        );
    }

    #[test]
    fn config_error_invalid_block_rule_message() {
        let err = ConfigError::InvalidBlockRule {
            rule: "logout".to_string(),
            message: "expected 'url|key|val'".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid block rule 'logout': expected 'url|key|val'"
        );
    }

    #[test]
    fn request_error_post_params_on_get_message() {
        let err = RequestError::PostParamsOnGet {
            url: "http://target/login".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "a GET request cannot carry POST parameters: http://target/login"
        );
    }

    #[test]
    fn session_error_unexpected_response_message() {
        let err = SessionError::UnexpectedResponse {
            message: "missing sessionId".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unexpected web driver response: missing sessionId"
        );
    }
}
