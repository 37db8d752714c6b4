//! OpenRouter chat-completions client, one-shot and streaming.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

const REFERER: &str = "https://github.com/summer-bot/summerbot";
const TITLE: &str = "Summer Bot";

/// End-of-stream sentinel in the `data:` payload position.
const DONE_MARKER: &str = "[DONE]";

#[derive(Debug)]
pub enum ProviderError {
    Http(String),
    Timeout,
    Api { status: u16, body: String },
    Parse(String),
    Empty,
}

impl ProviderError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(e.to_string())
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "provider request failed: {e}"),
            Self::Timeout => write!(f, "provider request timed out"),
            Self::Api { status, body } => write!(f, "provider returned {status}: {body}"),
            Self::Parse(e) => write!(f, "provider response did not parse: {e}"),
            Self::Empty => write!(f, "provider returned no completion content"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// One chat-completion request, already resolved to concrete parameters.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub question: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Pull-based feed of token deltas. `next_delta` returns `Ok(None)` once
/// the stream has terminated normally.
#[async_trait]
pub trait TokenFeed: Send {
    async fn next_delta(&mut self) -> Result<Option<String>, ProviderError>;
}

/// A model provider: one-shot completion or incremental token feed.
#[async_trait]
pub trait Gateway: Send + Sync {
    type Feed: TokenFeed + Send;

    async fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError>;
    async fn stream(&self, request: &ChatRequest) -> Result<Self::Feed, ProviderError>;
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamFrame {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

pub struct Client {
    http: reqwest::Client,
    base_url: String,
    /// Pre-computed `"Bearer <key>"` header value.
    auth_header: String,
    timeout: Duration,
}

impl Client {
    pub fn new(base_url: impl Into<String>, api_key: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_header: format!("Bearer {api_key}"),
            timeout,
        }
    }

    fn request(&self, body: &ApiRequest<'_>) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", &self.auth_header)
            .header("HTTP-Referer", REFERER)
            .header("X-Title", TITLE)
            .json(body)
    }
}

fn api_request<'a>(request: &'a ChatRequest, stream: bool) -> ApiRequest<'a> {
    ApiRequest {
        model: &request.model,
        messages: vec![
            ApiMessage { role: "system", content: &request.system },
            ApiMessage { role: "user", content: &request.question },
        ],
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        stream,
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let preview: String = body.chars().take(256).collect();
    Err(ProviderError::Api { status: status.as_u16(), body: preview })
}

#[async_trait]
impl Gateway for Client {
    type Feed = SseTokenFeed;

    /// One-shot completion. Carries the client-side deadline so a fallback
    /// message can still reach the platform in time.
    async fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        let response = self
            .request(&api_request(request, false))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        let response = check_status(response).await?;

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or(ProviderError::Empty)
    }

    /// Opens the streaming call. No overall deadline here: the feed must be
    /// allowed to outlive the one-shot timeout.
    async fn stream(&self, request: &ChatRequest) -> Result<SseTokenFeed, ProviderError> {
        let response = self
            .request(&api_request(request, true))
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        let response = check_status(response).await?;
        Ok(SseTokenFeed::new(response))
    }
}

/// Parses `data: <json>` frames out of the provider's byte stream. A frame
/// may span several network reads; bytes are buffered until a full line is
/// available.
pub struct SseTokenFeed {
    bytes: Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>,
    lines: LineBuffer,
    done: bool,
}

impl std::fmt::Debug for SseTokenFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTokenFeed")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl SseTokenFeed {
    fn new(response: reqwest::Response) -> Self {
        Self {
            bytes: Box::pin(response.bytes_stream().map(|r| r.map(|b| b.to_vec()))),
            lines: LineBuffer::default(),
            done: false,
        }
    }
}

#[async_trait]
impl TokenFeed for SseTokenFeed {
    async fn next_delta(&mut self) -> Result<Option<String>, ProviderError> {
        loop {
            while let Some(line) = self.lines.next_line() {
                match parse_frame(&line) {
                    Frame::Delta(delta) => return Ok(Some(delta)),
                    Frame::Done => {
                        self.done = true;
                        return Ok(None);
                    }
                    Frame::Skip => {}
                }
            }
            if self.done {
                // a last line may arrive without its newline
                if let Some(line) = self.lines.take_rest()
                    && let Frame::Delta(delta) = parse_frame(&line)
                {
                    return Ok(Some(delta));
                }
                return Ok(None);
            }
            match self.bytes.next().await {
                Some(Ok(chunk)) => self.lines.push_chunk(&chunk),
                Some(Err(e)) => return Err(ProviderError::from_reqwest(e)),
                // Connection closed without the end marker: finish normally,
                // whatever accumulated so far is the answer.
                None => self.done = true,
            }
        }
    }
}

#[derive(Default)]
struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    fn push_chunk(&mut self, chunk: &[u8]) {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
    }

    fn next_line(&mut self) -> Option<String> {
        let idx = self.buf.find('\n')?;
        let rest = self.buf.split_off(idx + 1);
        let mut line = std::mem::replace(&mut self.buf, rest);
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    fn take_rest(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

enum Frame {
    Delta(String),
    Done,
    Skip,
}

fn parse_frame(line: &str) -> Frame {
    let Some(data) = line.strip_prefix("data: ") else {
        return Frame::Skip;
    };
    if data == DONE_MARKER {
        return Frame::Done;
    }
    match serde_json::from_str::<StreamFrame>(data) {
        Ok(frame) => frame
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty())
            .map(Frame::Delta)
            .unwrap_or(Frame::Skip),
        Err(e) => {
            debug!("skipping unparseable stream frame: {e}");
            Frame::Skip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChatRequest {
        ChatRequest {
            model: "google/gemini-2.0-flash-exp:free".to_string(),
            system: "system text".to_string(),
            question: "Hello".to_string(),
            max_tokens: 1000,
            temperature: 0.7,
        }
    }

    fn client_for(server: &MockServer) -> Client {
        Client::new(server.uri(), "test-key", Duration::from_millis(200))
    }

    #[test]
    fn test_line_buffer_handles_split_frames() {
        let mut lines = LineBuffer::default();
        lines.push_chunk(b"data: first\npar");
        assert_eq!(lines.next_line().as_deref(), Some("data: first"));
        assert_eq!(lines.next_line(), None);
        lines.push_chunk(b"tial\r\n");
        assert_eq!(lines.next_line().as_deref(), Some("partial"));
    }

    #[test]
    fn test_parse_frame_variants() {
        assert!(matches!(
            parse_frame(r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#),
            Frame::Delta(d) if d == "hi"
        ));
        assert!(matches!(parse_frame("data: [DONE]"), Frame::Done));
        assert!(matches!(parse_frame("data: {broken"), Frame::Skip));
        assert!(matches!(parse_frame(": keep-alive comment"), Frame::Skip));
        assert!(matches!(
            parse_frame(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            Frame::Skip
        ));
    }

    #[tokio::test]
    async fn test_complete_returns_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "stream": false,
                "messages": [{"role": "system"}, {"role": "user", "content": "Hello"}],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "こんにちは！"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let answer = client_for(&server).complete(&request()).await.unwrap();
        assert_eq!(answer, "こんにちは！");
    }

    #[tokio::test]
    async fn test_complete_non_2xx_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let err = client_for(&server).complete(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 429, .. }));
    }

    #[tokio::test]
    async fn test_complete_without_choices_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": []
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).complete(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Empty));
    }

    #[tokio::test]
    async fn test_complete_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(2))
                    .set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let err = client_for(&server).complete(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout));
    }

    #[tokio::test]
    async fn test_stream_concatenates_deltas_and_skips_garbage() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"サマー\"}}]}\n\n",
            "not an event line\n",
            "data: {broken json\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"さんです\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"after done\"}}]}\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let mut feed = client_for(&server).stream(&request()).await.unwrap();
        let mut text = String::new();
        while let Some(delta) = feed.next_delta().await.unwrap() {
            text.push_str(&delta);
        }
        assert_eq!(text, "サマーさんです");
        // terminated feed stays terminated
        assert!(feed.next_delta().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_non_2xx_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = client_for(&server).stream(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_stream_end_without_done_marker_finishes() {
        // no [DONE] and the last line is missing its newline
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"半分\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"末尾\"}}]}",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let mut feed = client_for(&server).stream(&request()).await.unwrap();
        assert_eq!(feed.next_delta().await.unwrap().as_deref(), Some("半分"));
        assert_eq!(feed.next_delta().await.unwrap().as_deref(), Some("末尾"));
        assert!(feed.next_delta().await.unwrap().is_none());
    }
}
