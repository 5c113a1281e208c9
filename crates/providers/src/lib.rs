pub mod demux;
pub mod openai;
pub mod sse;

use async_trait::async_trait;
use shared::agent_api::{ChatOptions, Message, StreamChunk};
use shared::error::ChatError;
use tokio::sync::mpsc::UnboundedSender;

/// Everything needed to issue one chat-completions call
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    /// Already truncated to fit the context window
    pub messages: Vec<Message>,
    pub options: ChatOptions,
    /// Forwarded as `options.num_ctx` when set
    pub num_ctx: Option<usize>,
}

/// Transport to a chat-completions server.
///
/// `stream` pushes decoded chunks into `tx` and always finishes with either
/// `StreamChunk::Done` or an `Err`.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ChatError>;

    async fn stream(
        &self,
        request: &ChatRequest,
        tx: UnboundedSender<StreamChunk>,
    ) -> Result<(), ChatError>;

    async fn list_models(&self) -> Result<Vec<String>, ChatError>;
}
