use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::agent_api::{Message, StreamChunk};
use shared::error::ChatError;
use shared::settings::ApiSettings;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use crate::sse::{SseEvent, SseParser};
use crate::{ChatBackend, ChatRequest};

static SHARED_HTTP: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(600))
        .pool_max_idle_per_host(2)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("HTTP client builder failed ({}), using defaults", e);
            Client::new()
        })
});

// ── Request types ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    options: RequestOptions,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct RequestOptions {
    temperature: f32,
    top_k: u32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<usize>,
}

impl<'a> CompletionRequest<'a> {
    fn from_request(req: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &req.model,
            messages: &req.messages,
            options: RequestOptions {
                temperature: req.options.temperature,
                top_k: req.options.top_k,
                top_p: req.options.top_p,
                num_ctx: req.num_ctx,
            },
            stream,
        }
    }
}

// ── Non-streaming response types ─────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

// ── Streaming response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamToolCallFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Turns parsed stream events into `StreamChunk`s.
///
/// Tool call fragments are accumulated by index and emitted whole once the
/// stream finishes. Events that fail to parse are logged and skipped.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    active_tools: Vec<(String, String, String)>, // (id, name, arguments)
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn decode(&mut self, event: &SseEvent) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        if event.is_done() {
            self.finish_into(None, &mut out);
            return out;
        }

        let resp = match serde_json::from_str::<StreamResponse>(&event.data) {
            Ok(resp) => resp,
            Err(e) => {
                let err = ChatError::StreamParse(e.to_string());
                tracing::warn!("{} (event skipped: {:.120})", err, event.data);
                return out;
            }
        };

        let Some(choice) = resp.choices.into_iter().next() else {
            return out;
        };

        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content {
                if !content.is_empty() {
                    out.push(StreamChunk::Text(content));
                }
            }
            for tc in delta.tool_calls.unwrap_or_default() {
                while self.active_tools.len() <= tc.index {
                    self.active_tools
                        .push((String::new(), String::new(), String::new()));
                }
                let slot = &mut self.active_tools[tc.index];
                if let Some(id) = tc.id {
                    slot.0 = id;
                }
                if let Some(func) = tc.function {
                    if let Some(name) = func.name {
                        slot.1 = name;
                    }
                    if let Some(args) = func.arguments {
                        slot.2.push_str(&args);
                    }
                }
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.finish_into(Some(reason), &mut out);
        }
        out
    }

    /// Close the stream if the body ended without a terminal event
    pub fn finish(&mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if !self.finished {
            self.finish_into(None, &mut out);
        }
        out
    }

    fn finish_into(&mut self, stop_reason: Option<String>, out: &mut Vec<StreamChunk>) {
        for (id, name, arguments) in self.active_tools.drain(..) {
            if name.is_empty() {
                continue;
            }
            out.push(StreamChunk::ToolCall {
                id,
                name,
                arguments,
            });
        }
        out.push(StreamChunk::Done { stop_reason });
        self.finished = true;
    }
}

// ── Client ───────────────────────────────────────────────────────────

/// Client for a local server speaking the OpenAI chat-completions protocol
pub struct LocalChatClient {
    http: Client,
    endpoint: String,
    models_endpoint: String,
}

impl LocalChatClient {
    pub fn new(api: &ApiSettings) -> Self {
        Self {
            http: SHARED_HTTP.clone(),
            endpoint: api.endpoint.clone(),
            models_endpoint: api.models_endpoint.clone(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, body: &CompletionRequest<'_>) -> Result<reqwest::Response, ChatError> {
        tracing::debug!(
            "POST {} model={} messages={} stream={}",
            self.endpoint,
            body.model,
            body.messages.len(),
            body.stream
        );
        let resp = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| ChatError::network(e.to_string()))?;
        check_status(resp).await
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let detail: String = body.chars().take(800).collect();
    Err(ChatError::http_status(status, detail))
}

#[async_trait]
impl ChatBackend for LocalChatClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ChatError> {
        let body = CompletionRequest::from_request(request, false);
        let resp = self.post(&body).await?;
        let parsed: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| ChatError::network(format!("invalid response body: {}", e)))?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        tx: UnboundedSender<StreamChunk>,
    ) -> Result<(), ChatError> {
        let body = CompletionRequest::from_request(request, true);
        let resp = self.post(&body).await?;

        let mut parser = SseParser::new();
        let mut decoder = StreamDecoder::new();
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| ChatError::network(format!("stream read error: {}", e)))?;
            for event in parser.feed(&bytes) {
                for out in decoder.decode(&event) {
                    let _ = tx.send(out);
                }
                if decoder.is_finished() {
                    return Ok(());
                }
            }
        }

        if let Some(event) = parser.finish() {
            for out in decoder.decode(&event) {
                let _ = tx.send(out);
            }
        }
        for out in decoder.finish() {
            let _ = tx.send(out);
        }
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<String>, ChatError> {
        let resp = self
            .http
            .get(&self.models_endpoint)
            .send()
            .await
            .map_err(|e| ChatError::network(e.to_string()))?;
        let resp = check_status(resp).await?;
        let list: ModelList = resp
            .json()
            .await
            .map_err(|e| ChatError::network(format!("invalid model list: {}", e)))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::agent_api::ChatOptions;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_request_body_shape() {
        let req = ChatRequest {
            model: "deepseek-r1:7b".into(),
            messages: vec![Message::user("hi")],
            options: ChatOptions::default(),
            num_ctx: None,
        };
        let json = serde_json::to_value(CompletionRequest::from_request(&req, true)).unwrap();
        assert_eq!(json["model"], "deepseek-r1:7b");
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["options"]["top_k"], 40);
        assert!(json["options"].get("num_ctx").is_none());
    }

    #[test]
    fn test_decode_text_deltas_and_done() {
        let mut decoder = StreamDecoder::new();
        let chunks = decoder.decode(&event(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#));
        assert_eq!(chunks, vec![StreamChunk::Text("Hel".into())]);
        let chunks = decoder.decode(&event("[DONE]"));
        assert_eq!(chunks, vec![StreamChunk::Done { stop_reason: None }]);
        assert!(decoder.is_finished());
        assert!(decoder.decode(&event(r#"{"choices":[{"delta":{"content":"x"}}]}"#)).is_empty());
    }

    #[test]
    fn test_malformed_event_is_skipped() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.decode(&event("{not json")).is_empty());
        assert!(!decoder.is_finished());
        let chunks = decoder.decode(&event(r#"{"choices":[{"delta":{"content":"ok"}}]}"#));
        assert_eq!(chunks, vec![StreamChunk::Text("ok".into())]);
    }

    #[test]
    fn test_tool_call_fragments_assembled() {
        let mut decoder = StreamDecoder::new();
        decoder.decode(&event(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"run","arguments":"{\"cmd\":"}}]}}]}"#,
        ));
        decoder.decode(&event(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"ls\"}"}}]}}]}"#,
        ));
        let chunks = decoder.decode(&event(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#));
        assert_eq!(
            chunks,
            vec![
                StreamChunk::ToolCall {
                    id: "call_1".into(),
                    name: "run".into(),
                    arguments: r#"{"cmd":"ls"}"#.into(),
                },
                StreamChunk::Done {
                    stop_reason: Some("tool_calls".into())
                },
            ]
        );
    }

    #[test]
    fn test_finish_without_terminal_event() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.finish(), vec![StreamChunk::Done { stop_reason: None }]);
        assert!(decoder.finish().is_empty());
    }
    fn client_for(server: &wiremock::MockServer) -> LocalChatClient {
        LocalChatClient::new(&ApiSettings {
            endpoint: format!("{}/v1/chat/completions", server.uri()),
            models_endpoint: format!("{}/v1/models", server.uri()),
        })
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "deepseek-r1:7b".into(),
            messages: vec![Message::user("hi")],
            options: ChatOptions::default(),
            num_ctx: Some(8192),
        }
    }

    #[tokio::test]
    async fn test_stream_against_server() {
        use wiremock::matchers::{body_partial_json, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"<think>hm\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"</think>Hi!\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "stream": true,
                "options": {"num_ctx": 8192}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client.stream(&request(), tx).await.unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        assert_eq!(
            chunks,
            vec![
                StreamChunk::Text("<think>hm".into()),
                StreamChunk::Text("</think>Hi!".into()),
                StreamChunk::Done { stop_reason: None },
            ]
        );
    }

    #[tokio::test]
    async fn test_complete_and_models() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "Hello there"}}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "deepseek-r1:7b"}, {"id": "llama"}]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(client.complete(&request()).await.unwrap(), "Hello there");
        assert_eq!(
            client.list_models().await.unwrap(),
            vec!["deepseek-r1:7b".to_string(), "llama".to_string()]
        );
    }

    #[tokio::test]
    async fn test_http_error_status() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let err = client.stream(&request(), tx).await.unwrap_err();
        assert_eq!(err, ChatError::http_status(404, "model not found"));
    }
}
