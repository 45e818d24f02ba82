//! Session bootstrap: default headers and browser-driven cookie capture.
//!
//! With `-s/--session` the fuzzer launches a local WebDriver binary
//! (chromedriver or compatible), opens the target in a real browser and polls
//! its cookie jar while the operator logs in. When the operator closes the
//! browser window, the last cookies seen become the fuzzer's session cookies.

use std::time::Duration;

use serde_json::{json, Value};
use url::Url;

use crate::error::SessionError;

/// Port the spawned driver listens on (chromedriver's default).
const DRIVER_PORT: u16 = 9515;

/// How long to wait for the driver process to start answering.
const DRIVER_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Cookie poll cadence while the operator logs in.
const COOKIE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A captured session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
}

/// Browser-like headers sent with every fuzzing request.
pub fn default_headers() -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::USER_AGENT,
        reqwest::header::HeaderValue::from_static(
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/83.0.4103.97 Safari/537.36",
        ),
    );
    headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        reqwest::header::HeaderValue::from_static("en-GB,en;q=0.9,en-US;q=0.8,el;q=0.7"),
    );
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static("text/html,application/xhtml+xml"),
    );
    headers
}

/// Render cookies into a `Cookie` request header value.
pub fn cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Minimal WebDriver-protocol client.
///
/// Speaks just enough of the wire protocol to open a page and read cookies.
pub struct DriverClient {
    http: reqwest::Client,
    base_url: String,
}

impl DriverClient {
    /// Client for a driver on the default local port.
    pub fn new() -> Self {
        Self::with_base_url(format!("http://127.0.0.1:{DRIVER_PORT}"))
    }

    /// Client with a custom endpoint (for testing with wiremock).
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    /// Whether the driver answers its status endpoint.
    pub async fn is_ready(&self) -> bool {
        let url = format!("{}/status", self.base_url);
        matches!(self.http.get(&url).send().await, Ok(resp) if resp.status().is_success())
    }

    /// Create a browser session and return its id.
    pub async fn new_session(&self) -> Result<String, SessionError> {
        let url = format!("{}/session", self.base_url);
        let body = json!({"capabilities": {"alwaysMatch": {}}});

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|source| SessionError::Protocol { source })?;
        let value: Value = resp
            .json()
            .await
            .map_err(|source| SessionError::Protocol { source })?;

        value["value"]["sessionId"]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| SessionError::UnexpectedResponse {
                message: "missing sessionId".to_string(),
            })
    }

    /// Point the browser at a URL.
    pub async fn navigate(&self, session_id: &str, url: &Url) -> Result<(), SessionError> {
        let endpoint = format!("{}/session/{session_id}/url", self.base_url);
        self.http
            .post(&endpoint)
            .json(&json!({"url": url.as_str()}))
            .send()
            .await
            .map_err(|source| SessionError::Protocol { source })?;
        Ok(())
    }

    /// Read the browser's cookie jar. Errors once the window is closed.
    pub async fn cookies(&self, session_id: &str) -> Result<Vec<Cookie>, SessionError> {
        let endpoint = format!("{}/session/{session_id}/cookie", self.base_url);
        let resp = self
            .http
            .get(&endpoint)
            .send()
            .await
            .map_err(|source| SessionError::Protocol { source })?;
        let value: Value = resp
            .json()
            .await
            .map_err(|source| SessionError::Protocol { source })?;

        parse_cookie_list(&value).ok_or_else(|| SessionError::UnexpectedResponse {
            message: "cookie list missing or malformed".to_string(),
        })
    }
}

impl Default for DriverClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract `[{name, value}]` pairs from a WebDriver cookie response.
fn parse_cookie_list(value: &Value) -> Option<Vec<Cookie>> {
    let list = value.get("value")?.as_array()?;
    Some(
        list.iter()
            .filter_map(|entry| {
                Some(Cookie {
                    name: entry.get("name")?.as_str()?.to_string(),
                    value: entry.get("value")?.as_str()?.to_string(),
                })
            })
            .collect(),
    )
}

/// Launch the driver, let the operator log in, and capture the cookies that
/// are live when the browser window closes.
pub async fn capture_cookies(driver_file: &str, url: &Url) -> Result<Vec<Cookie>, SessionError> {
    let mut child = tokio::process::Command::new(driver_file)
        .arg(format!("--port={DRIVER_PORT}"))
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SessionError::DriverLaunch {
            path: driver_file.to_string(),
            source,
        })?;

    let client = DriverClient::new();

    let deadline = tokio::time::Instant::now() + DRIVER_STARTUP_TIMEOUT;
    while !client.is_ready().await {
        if tokio::time::Instant::now() >= deadline {
            let _ = child.kill().await;
            return Err(SessionError::UnexpectedResponse {
                message: "driver did not become ready".to_string(),
            });
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let session_id = client.new_session().await?;
    client.navigate(&session_id, url).await?;

    tracing::info!("Browser open; log in, then close the window to continue");

    // Poll until the window closes; the last successful read wins.
    let mut cookies: Vec<Cookie> = Vec::new();
    loop {
        match client.cookies(&session_id).await {
            Ok(jar) => cookies = jar,
            Err(_) => break,
        }
        tokio::time::sleep(COOKIE_POLL_INTERVAL).await;
    }

    let _ = child.kill().await;

    tracing::info!(count = cookies.len(), "Captured session cookies");
    Ok(cookies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn default_headers_look_like_a_browser() {
        let headers = default_headers();
        assert!(headers[reqwest::header::USER_AGENT]
            .to_str()
            .unwrap()
            .starts_with("Mozilla/5.0"));
        assert_eq!(
            headers[reqwest::header::ACCEPT].to_str().unwrap(),
            "text/html,application/xhtml+xml"
        );
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let cookies = vec![
            Cookie {
                name: "sid".to_string(),
                value: "abc".to_string(),
            },
            Cookie {
                name: "lang".to_string(),
                value: "en".to_string(),
            },
        ];
        assert_eq!(cookie_header(&cookies), "sid=abc; lang=en");
    }

    #[test]
    fn parse_cookie_list_reads_pairs() {
        let value = serde_json::json!({"value": [
            {"name": "sid", "value": "abc", "domain": "t"},
            {"name": "lang", "value": "en"}
        ]});
        let cookies = parse_cookie_list(&value).unwrap();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "sid");
    }

    #[test]
    fn parse_cookie_list_rejects_non_array() {
        assert!(parse_cookie_list(&serde_json::json!({"value": "nope"})).is_none());
        assert!(parse_cookie_list(&serde_json::json!({})).is_none());
    }

    #[tokio::test]
    async fn new_session_reads_session_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"value": {"sessionId": "s-123", "capabilities": {}}}),
            ))
            .mount(&server)
            .await;

        let client = DriverClient::with_base_url(server.uri());
        assert_eq!(client.new_session().await.unwrap(), "s-123");
    }

    #[tokio::test]
    async fn new_session_without_id_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"value": {}})),
            )
            .mount(&server)
            .await;

        let client = DriverClient::with_base_url(server.uri());
        let err = client.new_session().await.unwrap_err();
        assert!(err.to_string().contains("sessionId"));
    }

    #[tokio::test]
    async fn cookies_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session/s-123/cookie"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"value": [{"name": "sid", "value": "abc"}]}),
            ))
            .mount(&server)
            .await;

        let client = DriverClient::with_base_url(server.uri());
        let cookies = client.cookies("s-123").await.unwrap();
        assert_eq!(cookies[0].value, "abc");
    }
}
