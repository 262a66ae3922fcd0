//! LLM client module for Mentor — streaming chat completions
//!
//! Provides a `ChatBackend` trait with an OpenAI-compatible implementation:
//! - **OpenAiChatClient** — `/chat/completions` with `stream: true`, parsing
//!   server-sent `data:` frames into incremental text fragments
//! - **RetryPolicy** — bounded exponential backoff applied to stream
//!   establishment only; once fragments flow, a failure ends the turn
//!
//! The returned stream is finite, not restartable, and cancellable: dropping
//! it closes the underlying response body and returns the pooled connection.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

// ============================================================================
// ChatBackend trait
// ============================================================================

/// One parsed event from a completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    /// Incremental text fragment, in delivery order.
    Delta(String),
    /// Provider signalled normal completion.
    Done,
}

/// Lazy, cancellable sequence of completion events.
pub type CompletionStream = BoxStream<'static, Result<CompletionEvent, LlmError>>;

/// Abstraction over streaming completion providers.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Open a completion stream for the given message window. The call
    /// itself retries per policy; the returned stream never retries.
    async fn stream_completion(&self, request: ChatRequest) -> Result<CompletionStream, LlmError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

/// Completion call errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Stream protocol error: {0}")]
    Stream(String),

    #[error("Missing API key")]
    MissingApiKey,

    #[error("All {attempts} retry attempts failed")]
    RetryExhausted { attempts: usize },
}

impl LlmError {
    /// Transient conditions worth another establishment attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Http(_) | LlmError::RateLimited { .. } => true,
            LlmError::Api { code, .. } => *code >= 500,
            _ => false,
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl From<crate::models::Role> for PromptRole {
    fn from(role: crate::models::Role) -> Self {
        match role {
            crate::models::Role::User => PromptRole::User,
            crate::models::Role::Assistant => PromptRole::Assistant,
        }
    }
}

/// One entry of the window sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

/// One completion call: the trimmed window plus mode-specific sampling.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<PromptMessage>,
    pub temperature: f32,
}

// ============================================================================
// Config & retry policy
// ============================================================================

/// Chat client configuration
#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_idle_connections: usize,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl ChatClientConfig {
    /// Derive the client config from service settings. The API key is taken
    /// from `api_key` if given, falling back to `OPENAI_API_KEY`.
    pub fn from_settings(llm: &crate::config::LlmConfig, api_key: Option<String>) -> Self {
        let api_key = api_key
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();

        Self {
            api_key,
            base_url: llm.base_url.clone(),
            model: llm.model.clone(),
            request_timeout_secs: llm.request_timeout_secs,
            connect_timeout_secs: llm.connect_timeout_secs,
            max_idle_connections: llm.max_idle_connections as usize,
            max_retries: llm.max_retries as usize,
            retry_delay_ms: llm.retry_delay_ms,
        }
    }
}

/// Backoff schedule for stream establishment. Invoked only on transient
/// conditions; a rate limit that survives every attempt is surfaced as
/// `RateLimited` so callers keep the provider's retry hint.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub async fn run<A>(&self, action: A) -> Result<A::Item, LlmError>
    where
        A: tokio_retry::Action<Error = LlmError>,
    {
        let retry_strategy = ExponentialBackoff::from_millis(self.delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries);

        let result = RetryIf::spawn(retry_strategy, action, |e: &LlmError| e.is_retryable()).await;

        match result {
            Ok(value) => Ok(value),
            Err(e @ LlmError::RateLimited { .. }) => {
                tracing::warn!(error = %e, "Provider still rate limited after retries");
                Err(e)
            }
            Err(e) if e.is_retryable() => {
                tracing::error!(
                    attempts = self.max_retries,
                    error = %e,
                    "All completion retry attempts failed"
                );
                Err(LlmError::RetryExhausted {
                    attempts: self.max_retries,
                })
            }
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// OpenAI-compatible API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<PromptMessage>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ============================================================================
// OpenAiChatClient
// ============================================================================

/// OpenAI-compatible streaming chat client. One instance per process; the
/// inner `reqwest::Client` pools and caps keepalive connections itself.
#[derive(Debug, Clone)]
pub struct OpenAiChatClient {
    client: Client,
    config: ChatClientConfig,
    policy: RetryPolicy,
}

impl OpenAiChatClient {
    pub fn new(config: ChatClientConfig) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(config.max_idle_connections)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        let policy = RetryPolicy {
            max_retries: config.max_retries,
            delay_ms: config.retry_delay_ms,
        };

        Ok(Self {
            client,
            config,
            policy,
        })
    }

    /// Create a client with a custom base URL (for testing / integration)
    pub fn with_base_url(mut config: ChatClientConfig, base_url: String) -> Result<Self, LlmError> {
        config.base_url = base_url;
        Self::new(config)
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<CompletionStream, LlmError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let body = CompletionRequest {
            model: self.config.model.clone(),
            messages: request.messages.clone(),
            temperature: request.temperature,
            stream: true,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);

            tracing::warn!(retry_after_secs, "Provider rate limited");

            return Err(LlmError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let error_detail = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error);

            let message = error_detail.map(|e| e.message).unwrap_or(error_body);

            tracing::error!(code = status.as_u16(), message = %message, "Provider API error");

            return Err(LlmError::Api {
                code: status.as_u16(),
                message,
            });
        }

        Ok(sse_stream(response))
    }
}

#[async_trait]
impl ChatBackend for OpenAiChatClient {
    async fn stream_completion(&self, request: ChatRequest) -> Result<CompletionStream, LlmError> {
        self.policy.run(|| self.open_stream(&request)).await
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ============================================================================
// SSE parsing
// ============================================================================

enum SseLine {
    Delta(String),
    Done,
    Ignore,
}

/// Classify one complete `data:` line. Comments, keep-alives, role-only
/// chunks and unparseable frames are ignored rather than failing the turn.
fn parse_sse_line(raw: &[u8]) -> SseLine {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();

    let data = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None => return SseLine::Ignore,
    };

    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<CompletionChunk>(data) {
        Ok(chunk) => {
            let delta = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content);
            match delta {
                Some(content) if !content.is_empty() => SseLine::Delta(content),
                _ => SseLine::Ignore,
            }
        }
        Err(_) => SseLine::Ignore,
    }
}

/// Adapt a streaming response body into completion events. Frames may split
/// across network chunks, so bytes are buffered until a full line is seen.
/// A body that ends without `[DONE]` is reported as a stream error, never
/// passed off as a completed answer.
fn sse_stream(response: reqwest::Response) -> CompletionStream {
    let state = (response.bytes_stream().boxed(), Vec::<u8>::new(), false);

    stream::unfold(state, |(mut body, mut buf, mut done)| async move {
        loop {
            if done {
                return None;
            }

            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                match parse_sse_line(&line) {
                    SseLine::Delta(delta) => {
                        return Some((Ok(CompletionEvent::Delta(delta)), (body, buf, done)));
                    }
                    SseLine::Done => {
                        done = true;
                        return Some((Ok(CompletionEvent::Done), (body, buf, done)));
                    }
                    SseLine::Ignore => {}
                }
            }

            match body.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    done = true;
                    return Some((Err(LlmError::Http(e)), (body, buf, done)));
                }
                None => {
                    done = true;
                    return Some((
                        Err(LlmError::Stream(
                            "response body ended before completion marker".to_string(),
                        )),
                        (body, buf, done),
                    ));
                }
            }
        }
    })
    .boxed()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(api_key: &str) -> ChatClientConfig {
        ChatClientConfig {
            api_key: api_key.to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            request_timeout_secs: 5,
            connect_timeout_secs: 2,
            max_idle_connections: 4,
            max_retries: 3,
            retry_delay_ms: 50,
        }
    }

    fn sse_body(deltas: &[&str], with_done: bool) -> String {
        let mut body = String::new();
        for delta in deltas {
            let chunk = serde_json::json!({
                "choices": [{ "delta": { "content": delta } }]
            });
            body.push_str(&format!("data: {}\n\n", chunk));
        }
        if with_done {
            body.push_str("data: [DONE]\n\n");
        }
        body
    }

    fn sse_response(deltas: &[&str]) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .set_body_raw(sse_body(deltas, true), "text/event-stream")
    }

    async fn collect_deltas(
        mut stream: CompletionStream,
    ) -> (Vec<String>, bool, Option<LlmError>) {
        let mut deltas = Vec::new();
        let mut completed = false;
        let mut error = None;
        while let Some(event) = stream.next().await {
            match event {
                Ok(CompletionEvent::Delta(d)) => deltas.push(d),
                Ok(CompletionEvent::Done) => completed = true,
                Err(e) => error = Some(e),
            }
        }
        (deltas, completed, error)
    }

    #[tokio::test]
    async fn test_stream_completion_yields_fragments_in_order() {
        let mock_server = MockServer::start().await;
        let config = test_config("test-api-key");
        let client = OpenAiChatClient::with_base_url(config, mock_server.uri())
            .expect("Failed to create client");

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-api-key"))
            .and(header("content-type", "application/json"))
            .and(body_json(serde_json::json!({
                "model": "gpt-4",
                "messages": [
                    { "role": "system", "content": "be brief" },
                    { "role": "user", "content": "what is rehearsal?" }
                ],
                "temperature": 0.2,
                "stream": true
            })))
            .respond_with(sse_response(&["Reh", "ears", "al."]))
            .mount(&mock_server)
            .await;

        let request = ChatRequest {
            messages: vec![
                PromptMessage {
                    role: PromptRole::System,
                    content: "be brief".to_string(),
                },
                PromptMessage {
                    role: PromptRole::User,
                    content: "what is rehearsal?".to_string(),
                },
            ],
            temperature: 0.2,
        };

        let stream = client.stream_completion(request).await.expect("stream");
        let (deltas, completed, error) = collect_deltas(stream).await;

        assert_eq!(deltas, vec!["Reh", "ears", "al."]);
        assert!(completed, "Expected a completion marker");
        assert!(error.is_none(), "Unexpected error: {:?}", error);
    }

    #[tokio::test]
    async fn test_rate_limit_surfaces_provider_retry_hint() {
        let mock_server = MockServer::start().await;
        let mut config = test_config("test-api-key");
        config.max_retries = 1;
        config.retry_delay_ms = 10;
        let client = OpenAiChatClient::with_base_url(config, mock_server.uri())
            .expect("Failed to create client");

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "7")
                    .set_body_json(serde_json::json!({
                        "error": { "message": "Rate limit exceeded" }
                    })),
            )
            .mount(&mock_server)
            .await;

        let request = ChatRequest {
            messages: vec![],
            temperature: 0.2,
        };

        let result = client.stream_completion(request).await;

        match result {
            Err(LlmError::RateLimited { retry_after_secs }) => {
                assert_eq!(retry_after_secs, 7);
            }
            other => panic!("Expected RateLimited, got {:?}", other.map(|_| "stream")),
        }
    }

    #[tokio::test]
    async fn test_retries_on_500_then_succeeds() {
        let mock_server = MockServer::start().await;
        let config = test_config("test-api-key");
        let client = OpenAiChatClient::with_base_url(config, mock_server.uri())
            .expect("Failed to create client");

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": { "message": "Internal server error" }
            })))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .respond_with(sse_response(&["Hello", " world"]))
            .mount(&mock_server)
            .await;

        let request = ChatRequest {
            messages: vec![],
            temperature: 0.7,
        };

        let stream = client.stream_completion(request).await.expect("stream");
        let (deltas, completed, error) = collect_deltas(stream).await;

        assert_eq!(deltas.concat(), "Hello world");
        assert!(completed);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_exhausts_retries_on_persistent_500() {
        let mock_server = MockServer::start().await;
        let config = test_config("test-api-key");
        let client = OpenAiChatClient::with_base_url(config, mock_server.uri())
            .expect("Failed to create client");

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": { "message": "Internal server error" }
            })))
            .mount(&mock_server)
            .await;

        let request = ChatRequest {
            messages: vec![],
            temperature: 0.7,
        };

        let result = client.stream_completion(request).await;

        match result {
            Err(LlmError::RetryExhausted { attempts }) => {
                assert_eq!(attempts, 3, "Expected 3 retry attempts");
            }
            other => panic!(
                "Expected RetryExhausted, got {:?}",
                other.map(|_| "stream")
            ),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_api_error_is_not_retried() {
        let mock_server = MockServer::start().await;
        let config = test_config("test-api-key");
        let client = OpenAiChatClient::with_base_url(config, mock_server.uri())
            .expect("Failed to create client");

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "message": "invalid request" }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let request = ChatRequest {
            messages: vec![],
            temperature: 0.7,
        };

        let result = client.stream_completion(request).await;

        match result {
            Err(LlmError::Api { code, message }) => {
                assert_eq!(code, 400);
                assert_eq!(message, "invalid request");
            }
            other => panic!("Expected Api error, got {:?}", other.map(|_| "stream")),
        }
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_construction() {
        let config = test_config("");
        let result = OpenAiChatClient::new(config);

        match result {
            Err(LlmError::MissingApiKey) => {}
            _ => panic!("Expected MissingApiKey error"),
        }
    }

    #[tokio::test]
    async fn test_dropping_stream_mid_flight_leaves_client_usable() {
        let mock_server = MockServer::start().await;
        let config = test_config("test-api-key");
        let client = OpenAiChatClient::with_base_url(config, mock_server.uri())
            .expect("Failed to create client");

        Mock::given(method("POST"))
            .respond_with(sse_response(&["first", " second", " third"]))
            .mount(&mock_server)
            .await;

        let request = ChatRequest {
            messages: vec![],
            temperature: 0.7,
        };

        let mut stream = client
            .stream_completion(request.clone())
            .await
            .expect("stream");
        let first = stream.next().await;
        assert!(matches!(first, Some(Ok(CompletionEvent::Delta(_)))));
        drop(stream);

        let stream = client.stream_completion(request).await.expect("stream");
        let (deltas, completed, error) = collect_deltas(stream).await;
        assert_eq!(deltas.concat(), "first second third");
        assert!(completed);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_retry_policy_attempt_counts() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let policy = RetryPolicy {
            max_retries: 2,
            delay_ms: 1,
        };

        let attempts = AtomicUsize::new(0);
        let result = policy
            .run(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(LlmError::Stream("bad frame".to_string()))
                }
            })
            .await;
        assert!(matches!(result, Err(LlmError::Stream(_))));
        assert_eq!(
            attempts.load(Ordering::SeqCst),
            1,
            "Non-retryable errors take a single attempt"
        );

        let attempts = AtomicUsize::new(0);
        let result = policy
            .run(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(LlmError::Api {
                        code: 503,
                        message: "overloaded".to_string(),
                    })
                }
            })
            .await;
        assert!(matches!(
            result,
            Err(LlmError::RetryExhausted { attempts: 2 })
        ));
        assert_eq!(
            attempts.load(Ordering::SeqCst),
            3,
            "Initial attempt plus two retries"
        );
    }

    #[tokio::test]
    async fn test_truncated_body_is_a_stream_error_not_a_completion() {
        let mock_server = MockServer::start().await;
        let config = test_config("test-api-key");
        let client = OpenAiChatClient::with_base_url(config, mock_server.uri())
            .expect("Failed to create client");

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse_body(&["partial answer"], false), "text/event-stream"),
            )
            .mount(&mock_server)
            .await;

        let request = ChatRequest {
            messages: vec![],
            temperature: 0.2,
        };

        let stream = client.stream_completion(request).await.expect("stream");
        let (deltas, completed, error) = collect_deltas(stream).await;

        assert_eq!(deltas, vec!["partial answer"]);
        assert!(!completed, "Truncated body must not count as completed");
        match error {
            Some(LlmError::Stream(_)) => {}
            other => panic!("Expected Stream error, got {:?}", other),
        }
    }

    // --- SSE line parser ---

    #[test]
    fn parse_delta_line() {
        let line = br#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#;
        match parse_sse_line(line) {
            SseLine::Delta(d) => assert_eq!(d, "Hi"),
            _ => panic!("Expected delta"),
        }
    }

    #[test]
    fn parse_done_marker() {
        assert!(matches!(parse_sse_line(b"data: [DONE]"), SseLine::Done));
    }

    #[test]
    fn parse_ignores_comments_and_blank_lines() {
        assert!(matches!(parse_sse_line(b": keep-alive"), SseLine::Ignore));
        assert!(matches!(parse_sse_line(b""), SseLine::Ignore));
    }

    #[test]
    fn parse_ignores_role_only_and_empty_deltas() {
        let role_only = br#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(matches!(parse_sse_line(role_only), SseLine::Ignore));

        let empty = br#"data: {"choices":[{"delta":{"content":""}}]}"#;
        assert!(matches!(parse_sse_line(empty), SseLine::Ignore));
    }

    #[test]
    fn parse_ignores_malformed_json() {
        assert!(matches!(
            parse_sse_line(b"data: {not json"),
            SseLine::Ignore
        ));
    }
}
