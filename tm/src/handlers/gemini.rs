//! Gemini generateContent backend

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use tracing::debug;

use crate::rotation::RotationConfig;

use super::completion::{BackendError, CompletionBackend};

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GenerateResponse {
    /// Text of the first candidate, parts joined
    fn first_text(self) -> Option<String> {
        let content = self.candidates.into_iter().next()?.content?;
        let text: String = content.parts.into_iter().filter_map(|p| p.text).collect();
        if text.is_empty() { None } else { Some(text) }
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-success status to a backend error
fn status_error(status: u16, headers: &HeaderMap, body: &str) -> BackendError {
    let message: String = body.chars().take(500).collect();
    match status {
        429 => BackendError::RateLimited {
            retry_after: retry_after(headers),
        },
        401 | 403 => BackendError::Rejected(format!("HTTP {}: {}", status, message)),
        408 | 500..=599 => BackendError::Transient(format!("HTTP {}: {}", status, message)),
        _ => BackendError::Invalid(format!("HTTP {}: {}", status, message)),
    }
}

/// HTTP client for `models/{model}:generateContent`
#[derive(Debug, Clone)]
pub struct GeminiBackend {
    http: Client,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(config: &RotationConfig) -> Result<Self, BackendError> {
        debug!(base_url = %config.base_url, timeout_ms = config.timeout_ms, "GeminiBackend::new: called");
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| BackendError::Invalid(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }
}

#[async_trait]
impl CompletionBackend for GeminiBackend {
    async fn complete(&self, api_key: &str, model: &str, prompt: &str) -> Result<String, BackendError> {
        debug!(%model, prompt_len = prompt.len(), "GeminiBackend::complete: called");
        let body = serde_json::json!({
            "contents": [{"parts": [{"text": prompt}]}],
        });

        // The key goes in the query string; never log the full URL
        let response = self
            .http
            .post(self.url(model))
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transient(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "GeminiBackend::complete: API error");
            return Err(status_error(status.as_u16(), &headers, &text));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transient(e.without_url().to_string()))?;
        parsed
            .first_text()
            .ok_or_else(|| BackendError::Invalid("response had no candidate text".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the request line
    async fn serve_once(status: &'static str, headers: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n{}connection: close\r\n\r\n{}",
                status,
                body.len(),
                headers,
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).lines().next().unwrap_or_default().to_string()
        });
        (base, handle)
    }

    fn backend(base_url: String) -> GeminiBackend {
        GeminiBackend::new(&RotationConfig {
            base_url,
            timeout_ms: 5_000,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_status_mapping() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(
            status_error(429, &headers, ""),
            BackendError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
        let empty = HeaderMap::new();
        assert!(matches!(status_error(403, &empty, "denied"), BackendError::Rejected(_)));
        assert!(matches!(status_error(503, &empty, ""), BackendError::Transient(_)));
        assert!(matches!(status_error(400, &empty, "bad"), BackendError::Invalid(_)));
    }

    #[test]
    fn test_first_text_joins_parts() {
        let response: GenerateResponse = serde_json::from_str(
            r#"{"candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}]}}, {"content": {"parts": [{"text": "z"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(response.first_text().as_deref(), Some("ab"));

        let empty: GenerateResponse = serde_json::from_str(r#"{"candidates": []}"#).unwrap();
        assert!(empty.first_text().is_none());
    }

    #[tokio::test]
    async fn test_complete_success() {
        let (base, server) = serve_once(
            "200 OK",
            "",
            r#"{"candidates": [{"content": {"parts": [{"text": "hello"}]}}]}"#,
        )
        .await;

        let text = backend(base).complete("k123", "gemini-test", "hi").await.unwrap();
        assert_eq!(text, "hello");

        let request_line = server.await.unwrap();
        assert!(request_line.starts_with("POST /v1beta/models/gemini-test:generateContent?key=k123"));
    }

    #[tokio::test]
    async fn test_complete_rate_limited() {
        let (base, _server) = serve_once("429 Too Many Requests", "retry-after: 12\r\n", "{}").await;

        let err = backend(base).complete("k", "m", "hi").await.unwrap_err();
        assert_eq!(
            err,
            BackendError::RateLimited {
                retry_after: Some(Duration::from_secs(12))
            }
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = backend(base).complete("k", "m", "hi").await.unwrap_err();
        assert!(matches!(err, BackendError::Transient(_)));
        assert!(!err.to_string().contains("key=k"));
    }
}
