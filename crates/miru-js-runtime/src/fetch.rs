//! HTTP for script `fetch` and `jsRequest`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::header::USER_AGENT;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::error::{BridgeError, RuntimeError};

/// Script-side request options (`fetch(url, options)`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    pub method: Option<String>,
    pub headers: HashMap<String, serde_json::Value>,
    /// A string is sent as-is; any other JSON value is serialized.
    pub body: Option<serde_json::Value>,
    /// Milliseconds.
    pub timeout: Option<u64>,
}

/// What a script sees as the fetch response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    #[serde(rename = "statusText")]
    pub status_text: String,
    pub ok: bool,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// HTTP client shared by every run loop. Cookies live in the jar handed in,
/// which is also what the cookie store reads and writes.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    user_agent: String,
    default_timeout: Duration,
}

impl HttpClient {
    pub fn new(jar: Arc<Jar>, config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let client = reqwest::Client::builder()
            .cookie_provider(jar)
            .build()
            .map_err(|e| RuntimeError::Init(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
            default_timeout: config.fetch_timeout(),
        })
    }

    /// Turn script options into a request without sending it.
    pub fn build(&self, url: &str, options: &FetchOptions) -> Result<reqwest::Request, BridgeError> {
        let method_name = options
            .method
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let method = Method::from_bytes(method_name.as_bytes()).map_err(|e| BridgeError::InvalidArguments {
            call: "fetch".to_string(),
            message: format!("invalid method {}: {}", method_name, e),
        })?;
        let parsed = reqwest::Url::parse(url).map_err(|e| BridgeError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let timeout = options
            .timeout
            .filter(|t| *t > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let mut builder = self.client.request(method.clone(), parsed).timeout(timeout);

        let mut has_user_agent = false;
        for (name, value) in &options.headers {
            has_user_agent |= name.eq_ignore_ascii_case("user-agent");
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            builder = builder.header(name.as_str(), value);
        }
        if !has_user_agent {
            builder = builder.header(USER_AGENT, self.user_agent.as_str());
        }

        let sends_body = matches!(method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE);
        if let (true, Some(body)) = (sends_body, &options.body) {
            let body = match body {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            if !body.is_empty() {
                builder = builder.body(body);
            }
        }

        builder.build().map_err(|e| BridgeError::InvalidArguments {
            call: "fetch".to_string(),
            message: e.to_string(),
        })
    }

    /// Perform a request and read the whole body as text.
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResponse, BridgeError> {
        let request = self.build(url, options)?;
        tracing::debug!(method = %request.method(), url = %request.url(), "fetch");

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| BridgeError::Http(e.to_string()))?;

        let status = response.status();
        let final_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| BridgeError::Http(e.to_string()))?;

        Ok(FetchResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            ok: status.is_success(),
            url: final_url,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn client() -> HttpClient {
        HttpClient::new(Arc::new(Jar::default()), &RuntimeConfig::default()).unwrap()
    }

    fn options(value: serde_json::Value) -> FetchOptions {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn defaults_to_get_with_user_agent() {
        let request = client().build("https://example.com/a", &FetchOptions::default()).unwrap();
        assert_eq!(request.method(), Method::GET);
        assert!(request.headers()[USER_AGENT].to_str().unwrap().starts_with("Mozilla/5.0"));
        assert_eq!(request.timeout(), Some(&Duration::from_secs(30)));
    }

    #[test]
    fn custom_user_agent_and_timeout_win() {
        let request = client()
            .build(
                "https://example.com/",
                &options(json!({ "headers": { "user-agent": "miru-test" }, "timeout": 1500 })),
            )
            .unwrap();
        assert_eq!(request.headers()[USER_AGENT], "miru-test");
        assert_eq!(request.timeout(), Some(&Duration::from_millis(1500)));
    }

    #[test]
    fn body_only_sent_for_mutating_methods() {
        let get = client()
            .build("https://example.com/", &options(json!({ "method": "get", "body": "x=1" })))
            .unwrap();
        assert!(get.body().is_none());

        let post = client()
            .build(
                "https://example.com/",
                &options(json!({ "method": "post", "body": { "q": "naruto" } })),
            )
            .unwrap();
        assert_eq!(post.method(), Method::POST);
        assert_eq!(post.body().and_then(|b| b.as_bytes()), Some(br#"{"q":"naruto"}"#.as_slice()));
    }

    #[test]
    fn rejects_relative_urls() {
        let err = client().build("/relative", &FetchOptions::default()).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn fetch_reads_status_headers_and_body() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\nX-Test: yes\r\nConnection: close\r\n\r\nnope")
                .await
                .unwrap();
        });

        let response = client()
            .fetch(&format!("http://{}/missing", addr), &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.status_text, "Not Found");
        assert!(!response.ok);
        assert_eq!(response.headers["x-test"], "yes");
        assert_eq!(response.body, "nope");
    }
}
