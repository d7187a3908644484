use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use serde_json::{json, Value};
use tracing::debug;

use super::sse::{SseDecoder, SseFrame};
use super::{ChatTransport, ChunkStream};
use crate::config::{ProviderConfig, API_KEY_VAR};
use crate::error::InferenceError;
use crate::types::{ChatChunk, ChatCompletion, ChatRequest};

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// OpenAI-compatible transport. Works with OpenRouter, vLLM, LM Studio,
/// or any server that implements `{base_url}/chat/completions`.
pub struct OpenAiTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiTransport {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let defaults = ProviderConfig::default();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: defaults.timeout,
        }
    }

    /// Build a transport from pipeline configuration. Fails when the API key
    /// is missing or the endpoint is malformed.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, InferenceError> {
        config
            .validate()
            .map_err(|e| InferenceError::Config(e.to_string()))?;
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| InferenceError::Config(format!("{API_KEY_VAR} is not set")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| InferenceError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key,
            timeout: config.timeout,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_body(request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": request.stream,
        });
        if request.stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    async fn send(&self, request: &ChatRequest) -> Result<reqwest::Response, InferenceError> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            stream = request.stream,
            "chat completion request"
        );

        let mut req = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&Self::build_body(request));
        if !request.stream {
            req = req.timeout(self.timeout);
        }

        let resp = req.send().await.map_err(InferenceError::from_reqwest)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        if status.as_u16() == 429 {
            Err(InferenceError::RateLimited { body })
        } else {
            Err(InferenceError::Api {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl ChatTransport for OpenAiTransport {
    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream, InferenceError> {
        let resp = self.send(request).await?;
        Ok(Box::pin(chunk_stream(
            Box::pin(resp.bytes_stream()),
            self.timeout,
        )))
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, InferenceError> {
        let resp = self.send(request).await?;
        let text = resp.text().await.map_err(InferenceError::from_body_read)?;
        serde_json::from_str(&text).map_err(|e| InferenceError::Parse(e.to_string()))
    }
}

/// Decode an SSE body into chat chunks, stopping at `[DONE]` or end of body.
/// A body that stays silent for `idle` fails with a connection error.
fn chunk_stream(
    body: ByteStream,
    idle: Duration,
) -> impl Stream<Item = Result<ChatChunk, InferenceError>> + Send {
    struct State {
        body: ByteStream,
        idle: Duration,
        decoder: SseDecoder,
        pending: VecDeque<ChatChunk>,
        done: bool,
    }

    impl State {
        fn accept(&mut self, frame: SseFrame) -> Result<(), InferenceError> {
            if self.done {
                return Ok(());
            }
            if frame.is_done() {
                self.done = true;
                return Ok(());
            }
            if let Some(chunk) = parse_chunk(&frame)? {
                self.pending.push_back(chunk);
            }
            Ok(())
        }
    }

    stream::try_unfold(
        State {
            body,
            idle,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Ok(Some((chunk, state)));
                }
                if state.done {
                    return Ok(None);
                }
                let next = tokio::time::timeout(state.idle, state.body.next())
                    .await
                    .map_err(|_| {
                        InferenceError::Connection(format!(
                            "stream stalled: no data received for {:?}",
                            state.idle
                        ))
                    })?;
                match next {
                    Some(Ok(bytes)) => {
                        for frame in state.decoder.push_chunk(&bytes) {
                            state.accept(frame)?;
                        }
                    }
                    Some(Err(e)) => return Err(InferenceError::from_reqwest(e)),
                    None => {
                        if let Some(frame) = state.decoder.finish() {
                            state.accept(frame)?;
                        }
                        state.done = true;
                    }
                }
            }
        },
    )
}

/// Parse one `data:` payload. Providers such as OpenRouter report failures
/// mid-stream as `{"error": {...}}` frames.
fn parse_chunk(frame: &SseFrame) -> Result<Option<ChatChunk>, InferenceError> {
    let data = frame.data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(data)
        .map_err(|e| InferenceError::Parse(format!("invalid SSE JSON frame: {e}")))?;

    if let Some(error) = value.get("error") {
        let message = error["message"]
            .as_str()
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| error.to_string());
        let code = &error["code"];
        let status = code
            .as_u64()
            .and_then(|c| u16::try_from(c).ok())
            .or_else(|| code.as_str().and_then(|c| c.parse().ok()))
            .unwrap_or(500);
        let rate_limited = status == 429 || code.as_str() == Some("rate_limit_exceeded");
        return Err(if rate_limited {
            InferenceError::RateLimited { body: message }
        } else {
            InferenceError::Api {
                status,
                body: message,
            }
        });
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| InferenceError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StreamEvent;
    use crate::provider::LlmProvider;
    use crate::types::Message;
    use futures::TryStreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn request(stream: bool) -> ChatRequest {
        ChatRequest {
            model: "test-model".into(),
            messages: vec![Message::user("What is the capital of France?")],
            stream,
        }
    }

    /// Read one full HTTP request (headers plus content-length body).
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if raw.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&raw).to_string()
    }

    /// Serve exactly one HTTP exchange on a loopback port and hand back the
    /// raw request text.
    async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let raw = read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            raw
        });
        (format!("http://{addr}/v1"), handle)
    }

    /// Send `prefix` and then keep the connection open without writing.
    async fn serve_then_stall(prefix: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            socket.write_all(prefix.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });
        format!("http://{addr}/v1")
    }

    fn sse_response(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n{body}"
        )
    }

    #[test]
    fn streaming_body_requests_usage() {
        let body = OpenAiTransport::build_body(&request(true));
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["messages"][0]["role"], "user");

        let body = OpenAiTransport::build_body(&request(false));
        assert_eq!(body["stream"], false);
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn url_joins_without_double_slash() {
        let t = OpenAiTransport::new("https://openrouter.ai/api/v1/", "k");
        assert_eq!(t.completions_url(), "https://openrouter.ai/api/v1/chat/completions");
    }

    #[test]
    fn from_config_requires_api_key() {
        let err = OpenAiTransport::from_config(&ProviderConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, InferenceError::Config(_)));
        assert!(err.to_string().contains("API_KEY"));

        let ok = OpenAiTransport::from_config(&ProviderConfig::default().with_api_key("sk"));
        assert!(ok.is_ok());
    }

    #[test]
    fn error_frames_are_classified() {
        let frame = SseFrame {
            event: None,
            data: r#"{"error": {"message": "Rate limit exceeded", "code": 429}}"#.into(),
        };
        assert!(parse_chunk(&frame).unwrap_err().is_rate_limited());

        let frame = SseFrame {
            event: None,
            data: r#"{"error": {"message": "upstream died", "code": 502}}"#.into(),
        };
        assert!(matches!(
            parse_chunk(&frame),
            Err(InferenceError::Api { status: 502, .. })
        ));

        let frame = SseFrame {
            event: None,
            data: r#"{"error": {"message": "slow down", "code": "rate_limit_exceeded"}}"#.into(),
        };
        assert!(parse_chunk(&frame).unwrap_err().is_rate_limited());

        let frame = SseFrame {
            event: None,
            data: r#"{"error": {"message": "busy", "code": "503"}}"#.into(),
        };
        assert!(matches!(
            parse_chunk(&frame),
            Err(InferenceError::Api { status: 503, .. })
        ));

        let frame = SseFrame {
            event: None,
            data: r#"{"error": {"message": "odd", "code": 70000}}"#.into(),
        };
        assert!(matches!(
            parse_chunk(&frame),
            Err(InferenceError::Api { status: 500, .. })
        ));

        let frame = SseFrame {
            event: None,
            data: "not json".into(),
        };
        assert!(matches!(parse_chunk(&frame), Err(InferenceError::Parse(_))));
    }

    #[tokio::test]
    async fn streams_chunks_over_http() {
        let body = concat!(
            ": OPENROUTER PROCESSING\n\n",
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"Paris\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" is\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2,\"total_tokens\":11}}\n\n",
            "data: [DONE]\n\n",
        );
        let (base_url, server) = serve_once(sse_response(body)).await;

        let transport = OpenAiTransport::new(base_url, "sk-test");
        let chunks: Vec<ChatChunk> = transport
            .stream(&request(true))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("Paris"));
        assert_eq!(chunks[2].choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(chunks[3].usage.as_ref().map(|u| u.total_tokens), Some(11));

        let raw_request = server.await.unwrap();
        assert!(raw_request.starts_with("POST /v1/chat/completions"));
        assert!(raw_request.to_ascii_lowercase().contains("authorization: bearer sk-test"));
        assert!(raw_request.contains("\"stream\":true"));
    }

    #[tokio::test]
    async fn status_429_is_rate_limited() {
        let body = r#"{"error":{"message":"slow down"}}"#;
        let response = format!(
            "HTTP/1.1 429 Too Many Requests\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let (base_url, _server) = serve_once(response).await;

        let transport = OpenAiTransport::new(base_url, "sk-test");
        let err = transport.stream(&request(true)).await.err().unwrap();
        assert!(err.is_rate_limited());
        assert!(err.to_string().contains("slow down"));
    }

    #[tokio::test]
    async fn single_shot_completion_parses_response() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"Paris."},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7,"prompt_tokens_details":{"cached_tokens":1}}}"#;
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let (base_url, server) = serve_once(response).await;

        let transport = OpenAiTransport::new(base_url, "sk-test");
        let completion = transport.complete(&request(false)).await.unwrap();
        assert_eq!(
            completion.choices[0].message.content.as_deref(),
            Some("Paris.")
        );
        assert_eq!(completion.choices[0].finish_reason.as_deref(), Some("stop"));
        let raw_request = server.await.unwrap();
        assert!(raw_request.contains("\"stream\":false"));
    }

    #[tokio::test]
    async fn refused_connection_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = OpenAiTransport::new(format!("http://{addr}/v1"), "sk-test");
        let err = transport.stream(&request(true)).await.err().unwrap();
        assert!(err.is_connection(), "unexpected error: {err:?}");
    }

    #[tokio::test]
    async fn stalled_stream_ends_with_one_error() {
        let prefix = sse_response(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Par\"}}]}\n\n",
        );
        let base_url = serve_then_stall(prefix).await;
        let config = ProviderConfig::default()
            .with_base_url(base_url)
            .with_api_key("sk-test")
            .with_timeout(Duration::from_millis(200));
        let provider = LlmProvider::new(config);

        let events: Vec<StreamEvent> = tokio::time::timeout(
            Duration::from_secs(5),
            provider
                .send_message(vec![Message::user("hi")], true)
                .collect::<Vec<_>>(),
        )
        .await
        .expect("stream should end on its own");

        assert_eq!(events.len(), 2, "{events:?}");
        assert!(matches!(&events[0], StreamEvent::TextDelta { content, .. } if content == "Par"));
        match &events[1] {
            StreamEvent::Error { message } => {
                assert!(message.starts_with("API connection error: stream stalled"))
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_completion_body_is_a_parse_error() {
        let response = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 100\r\nconnection: close\r\n\r\n{\"choices\"".to_string();
        let (base_url, _server) = serve_once(response).await;

        let transport = OpenAiTransport::new(base_url, "sk-test");
        let err = transport.complete(&request(false)).await.err().unwrap();
        assert!(matches!(err, InferenceError::Parse(_)), "unexpected error: {err:?}");
    }
}
