//! Agent Host - chat request lifecycle for a local model server
//!
//! This crate provides the pieces between the front-end and the model:
//! - Fitting conversation history into the model's context window
//! - Streaming responses through the reasoning/answer demultiplexer
//! - Spotting shell commands in answers and routing them through approval
//! - Running approved commands locally or through an HTTP bridge

pub mod command_bridge;
pub mod command_detector;
pub mod command_registry;
pub mod context_token_manager;
pub mod executor;
pub mod importance;
pub mod token_estimator;

pub use command_bridge::HttpCommandService;
pub use command_detector::{normalize_command, CommandDetector};
pub use command_registry::CommandRegistry;
pub use executor::{execute_command, CommandService, LocalCommandService};

use futures::future::{AbortHandle, Abortable};
use parking_lot::{Mutex, RwLock};
use providers::demux::{StreamDemultiplexer, StreamObserver};
use providers::{ChatBackend, ChatRequest};
use services::ConversationStore;
use shared::agent_api::{ChatOptions, Message, Role};
use shared::commands::PendingCommand;
use shared::error::ChatError;
use shared::settings::ChatSettings;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Recorded as the assistant turn when a request fails
pub const FAILURE_MESSAGE: &str = "Sorry, I encountered an error. Please try again.";

/// Result of one completed request
#[derive(Debug, Clone)]
pub struct ChatTurn {
    /// Stored assistant message, reasoning span included
    pub message: String,
    /// Command found in the answer and queued for approval
    pub command: Option<PendingCommand>,
    /// History messages left out to fit the context window
    pub dropped_messages: usize,
}

/// Clears the in-flight flag when the request ends, however it ends
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns everything one chat window needs: settings, model transport,
/// conversation store and the command approval flow
pub struct ChatController {
    settings: RwLock<ChatSettings>,
    backend: Arc<dyn ChatBackend>,
    store: Arc<dyn ConversationStore>,
    registry: Arc<CommandRegistry>,
    detector: CommandDetector,
    in_flight: AtomicBool,
    abort: Mutex<Option<AbortHandle>>,
}

impl ChatController {
    pub fn new(
        settings: ChatSettings,
        backend: Arc<dyn ChatBackend>,
        store: Arc<dyn ConversationStore>,
        registry: Arc<CommandRegistry>,
    ) -> Self {
        Self {
            settings: RwLock::new(settings),
            backend,
            store,
            registry,
            detector: CommandDetector::new(),
            in_flight: AtomicBool::new(false),
            abort: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> ChatSettings {
        self.settings.read().clone()
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Switch the active model profile. Returns false for an unknown name.
    pub fn select_model(&self, name: &str) -> bool {
        let selected = self.settings.write().select_model(name);
        if selected {
            tracing::info!("Active model is now {}", name);
        }
        selected
    }

    pub async fn list_models(&self) -> Result<Vec<String>, ChatError> {
        self.backend.list_models().await
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Abort the request in flight. Returns false when there is none.
    pub fn cancel(&self) -> bool {
        match self.abort.lock().take() {
            Some(handle) => {
                tracing::info!("Cancelling chat request");
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Send a user message with the active profile's sampling options
    pub async fn send(
        &self,
        text: &str,
        observer: &mut dyn StreamObserver,
    ) -> Result<ChatTurn, ChatError> {
        let _guard = self.begin()?;
        let options = self.profile_options();
        let history = self.store.current().messages;
        self.run_turn(history, Message::user(text), options, false, observer)
            .await
    }

    /// Drop everything after the user message at `user_index` and ask again
    /// with new sampling options
    pub async fn regenerate(
        &self,
        user_index: usize,
        options: ChatOptions,
        observer: &mut dyn StreamObserver,
    ) -> Result<ChatTurn, ChatError> {
        let _guard = self.begin()?;
        let mut history = self.store.current().messages;
        let is_user = history
            .get(user_index)
            .is_some_and(|m| m.role == Role::User);
        if !is_user {
            return Err(ChatError::NoSuchMessage(user_index));
        }
        history.truncate(user_index + 1);
        let Some(user) = history.pop() else {
            return Err(ChatError::NoSuchMessage(user_index));
        };
        tracing::info!(
            "Regenerating from message {} (temperature {}, top_k {}, top_p {})",
            user_index,
            options.temperature,
            options.top_k,
            options.top_p
        );
        self.run_turn(history, user, options, true, observer).await
    }

    fn begin(&self) -> Result<InFlightGuard<'_>, ChatError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ChatError::RequestInFlight)?;
        Ok(InFlightGuard(&self.in_flight))
    }

    fn profile_options(&self) -> ChatOptions {
        self.settings
            .read()
            .active_profile()
            .map(ChatOptions::from)
            .unwrap_or_default()
    }

    fn build_request(&self, history: &[Message], user: &Message, options: ChatOptions) -> (ChatRequest, usize) {
        let settings = self.settings.read();
        let profile = settings.active_profile();

        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(system) = profile.and_then(|p| p.system_message.as_ref()) {
            messages.push(Message::system(system.clone()));
        }
        messages.extend(history.iter().cloned());
        messages.push(user.clone());

        let (model, num_ctx) = match profile {
            Some(p) => (p.name.clone(), Some(p.num_ctx)),
            None => (settings.active_model.clone(), None),
        };
        let (messages, dropped) = match num_ctx {
            Some(budget) => {
                let outcome = context_token_manager::truncate_with_report(&messages, budget);
                if outcome.exhausted {
                    tracing::warn!(
                        "History does not fit {} tokens even after shortening, sending best effort",
                        budget
                    );
                }
                let dropped = outcome.dropped(messages.len());
                (outcome.messages, dropped)
            }
            None => (messages.iter().map(Message::without_reasoning).collect(), 0),
        };
        if dropped > 0 {
            tracing::debug!("Left {} messages out of the request", dropped);
        }

        (
            ChatRequest {
                model,
                messages,
                options,
                num_ctx,
            },
            dropped,
        )
    }

    async fn run_turn(
        &self,
        history: Vec<Message>,
        user: Message,
        options: ChatOptions,
        replace_history: bool,
        observer: &mut dyn StreamObserver,
    ) -> Result<ChatTurn, ChatError> {
        let (request, dropped_messages) = self.build_request(&history, &user, options);
        let stream = self.settings.read().stream;

        let (handle, registration) = AbortHandle::new_pair();
        *self.abort.lock() = Some(handle);

        let mut demux = StreamDemultiplexer::new(observer);
        let outcome = Abortable::new(
            self.exchange(&request, stream, &mut demux),
            registration,
        )
        .await;
        self.abort.lock().take();

        let message = match outcome {
            Err(_aborted) => {
                demux.abort();
                return Err(ChatError::Cancelled);
            }
            Ok(Err(e)) => {
                tracing::error!("Chat request failed: {}", e);
                demux.fail(&e);
                self.record(history, user, Message::assistant(FAILURE_MESSAGE), replace_history)?;
                return Err(e);
            }
            Ok(Ok(message)) => message,
        };

        self.record(
            history,
            user,
            Message::assistant(message.clone()),
            replace_history,
        )?;

        let command = if self.settings.read().commands.detection_enabled {
            self.queue_detected(&message).await
        } else {
            None
        };

        Ok(ChatTurn {
            message,
            command,
            dropped_messages,
        })
    }

    /// Drive one request through the demultiplexer and return the composed message
    async fn exchange(
        &self,
        request: &ChatRequest,
        stream: bool,
        demux: &mut StreamDemultiplexer<'_>,
    ) -> Result<String, ChatError> {
        if !stream {
            let text = self.backend.complete(request).await?;
            demux.push_delta(&text);
            return Ok(demux.finish().unwrap_or_default());
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let producer = self.backend.stream(request, tx);
        let consumer = async {
            let mut message = None;
            while let Some(chunk) = rx.recv().await {
                if let Some(done) = demux.push_chunk(chunk) {
                    message = Some(done);
                }
            }
            message
        };
        let (produced, consumed) = tokio::join!(producer, consumer);
        produced?;
        match consumed {
            Some(message) => Ok(message),
            // backend closed the channel without a Done chunk
            None => Ok(demux.finish().unwrap_or_default()),
        }
    }

    fn record(
        &self,
        history: Vec<Message>,
        user: Message,
        reply: Message,
        replace_history: bool,
    ) -> Result<(), ChatError> {
        let stored = if replace_history {
            let mut messages = history;
            messages.push(user);
            messages.push(reply);
            self.store.replace(messages)
        } else {
            self.store
                .append(user)
                .and_then(|_| self.store.append(reply))
        };
        stored.map_err(|e| ChatError::Persistence(e.to_string()))?;

        if let Err(e) = self.store.persist() {
            tracing::error!("Failed to save conversation: {}", e);
        }
        Ok(())
    }

    async fn queue_detected(&self, message: &str) -> Option<PendingCommand> {
        let candidate = self.detector.detect(message)?;
        match self.registry.register(&candidate).await {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Could not queue detected command {}: {}", candidate.command, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use services::{DeniedIds, JsonConversationStore};
    use shared::agent_api::StreamChunk;
    use shared::settings::ModelProfile;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;

    #[derive(Default)]
    struct FakeBackend {
        chunks: Vec<StreamChunk>,
        completion: String,
        failure: Option<ChatError>,
        delay_ms: u64,
        requests: parking_lot::Mutex<Vec<ChatRequest>>,
    }

    impl FakeBackend {
        fn streaming(deltas: &[&str]) -> Self {
            let mut chunks: Vec<StreamChunk> =
                deltas.iter().map(|d| StreamChunk::Text(d.to_string())).collect();
            chunks.push(StreamChunk::Done { stop_reason: None });
            Self {
                chunks,
                ..Default::default()
            }
        }

        fn last_request(&self) -> ChatRequest {
            self.requests.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl ChatBackend for FakeBackend {
        async fn complete(&self, request: &ChatRequest) -> Result<String, ChatError> {
            self.requests.lock().push(request.clone());
            match &self.failure {
                Some(e) => Err(e.clone()),
                None => Ok(self.completion.clone()),
            }
        }

        async fn stream(
            &self,
            request: &ChatRequest,
            tx: UnboundedSender<StreamChunk>,
        ) -> Result<(), ChatError> {
            self.requests.lock().push(request.clone());
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if let Some(e) = &self.failure {
                return Err(e.clone());
            }
            for chunk in &self.chunks {
                let _ = tx.send(chunk.clone());
            }
            Ok(())
        }

        async fn list_models(&self) -> Result<Vec<String>, ChatError> {
            Ok(vec!["deepseek-r1:7b".into(), "llama".into()])
        }
    }

    #[derive(Default)]
    struct Recorder {
        reasoning: String,
        response: String,
        complete: Option<String>,
        errors: usize,
    }

    impl StreamObserver for Recorder {
        fn on_reasoning(&mut self, reasoning: &str) {
            self.reasoning = reasoning.to_string();
        }
        fn on_response(&mut self, response: &str) {
            self.response = response.to_string();
        }
        fn on_complete(&mut self, message: &str) {
            self.complete = Some(message.to_string());
        }
        fn on_error(&mut self, _error: &ChatError) {
            self.errors += 1;
        }
    }

    fn test_settings() -> ChatSettings {
        let mut profile = ModelProfile::new("test-model", 4096);
        profile.system_message = Some("You are a helpful local assistant.".into());
        ChatSettings {
            models: vec![profile],
            active_model: "test-model".into(),
            ..ChatSettings::default()
        }
    }

    fn controller(backend: Arc<FakeBackend>) -> (ChatController, Arc<JsonConversationStore>) {
        controller_with(backend, test_settings())
    }

    fn controller_with(
        backend: Arc<FakeBackend>,
        settings: ChatSettings,
    ) -> (ChatController, Arc<JsonConversationStore>) {
        let store = Arc::new(JsonConversationStore::in_memory("Hello! How can I help you today?"));
        let registry = Arc::new(CommandRegistry::new(
            Arc::new(LocalCommandService::default()),
            DeniedIds::in_memory(),
        ));
        let controller = ChatController::new(settings, backend, store.clone(), registry);
        (controller, store)
    }

    #[tokio::test]
    async fn test_streamed_reply_is_split_and_stored() {
        let backend = Arc::new(FakeBackend::streaming(&["<thi", "nk>hello</thi", "nk>world"]));
        let (ctrl, store) = controller(backend.clone());
        let mut rec = Recorder::default();

        let turn = ctrl.send("hi there", &mut rec).await.unwrap();
        assert_eq!(rec.reasoning, "hello");
        assert_eq!(rec.response, "world");
        assert_eq!(turn.message, "<think>hello</think>world");
        assert!(turn.command.is_none());

        let messages = store.current().messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1], Message::user("hi there"));
        assert_eq!(messages[2], Message::assistant("<think>hello</think>world"));
        assert!(!ctrl.is_busy());
    }

    #[tokio::test]
    async fn test_request_carries_profile() {
        let backend = Arc::new(FakeBackend::streaming(&["ok"]));
        let (ctrl, store) = controller(backend.clone());
        store
            .append(Message::assistant("<think>old thoughts</think>Earlier answer"))
            .unwrap();
        ctrl.send("next", &mut Recorder::default()).await.unwrap();

        let request = backend.last_request();
        assert_eq!(request.model, "test-model");
        assert_eq!(request.num_ctx, Some(4096));
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages.last().unwrap(), &Message::user("next"));
        // reasoning never goes back to the model
        assert!(request
            .messages
            .iter()
            .all(|m| !m.content.contains("old thoughts")));
    }

    #[tokio::test]
    async fn test_non_streaming_goes_through_demux() {
        let backend = Arc::new(FakeBackend {
            completion: "<think>plan</think>Answer".into(),
            ..Default::default()
        });
        let mut settings = test_settings();
        settings.stream = false;
        let (ctrl, _store) = controller_with(backend, settings);
        let mut rec = Recorder::default();

        let turn = ctrl.send("question", &mut rec).await.unwrap();
        assert_eq!(rec.reasoning, "plan");
        assert_eq!(rec.response, "Answer");
        assert_eq!(turn.message, "<think>plan</think>Answer");
    }

    #[tokio::test]
    async fn test_network_failure_records_generic_turn() {
        let backend = Arc::new(FakeBackend {
            failure: Some(ChatError::http_status(500, "boom")),
            ..Default::default()
        });
        let (ctrl, store) = controller(backend);
        let mut rec = Recorder::default();

        let err = ctrl.send("hello?", &mut rec).await.unwrap_err();
        assert!(matches!(err, ChatError::Network { status: Some(500), .. }));
        assert_eq!(rec.errors, 1);
        assert!(rec.complete.is_none());
        let messages = store.current().messages;
        assert_eq!(messages.last().unwrap(), &Message::assistant(FAILURE_MESSAGE));
    }

    #[tokio::test]
    async fn test_second_send_is_rejected_while_streaming() {
        let backend = Arc::new(FakeBackend {
            delay_ms: 50,
            ..FakeBackend::streaming(&["done"])
        });
        let (ctrl, _store) = controller(backend);
        let mut first = Recorder::default();
        let mut second = Recorder::default();

        let (a, b) = tokio::join!(ctrl.send("one", &mut first), ctrl.send("two", &mut second));
        assert!(a.is_ok());
        assert_eq!(b.unwrap_err(), ChatError::RequestInFlight);
        assert!(ctrl.send("three", &mut second).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_discards_and_persists_nothing() {
        let backend = Arc::new(FakeBackend {
            delay_ms: 200,
            ..FakeBackend::streaming(&["never shown"])
        });
        let (ctrl, store) = controller(backend);
        let mut rec = Recorder::default();

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctrl.cancel()
        };
        let (result, cancelled) = tokio::join!(ctrl.send("slow", &mut rec), cancel);
        assert!(cancelled);
        assert_eq!(result.unwrap_err(), ChatError::Cancelled);
        assert!(rec.complete.is_none());
        assert_eq!(store.current().messages.len(), 1);
        assert!(!ctrl.cancel());
    }

    #[tokio::test]
    async fn test_detected_command_is_queued() {
        let backend = Arc::new(FakeBackend::streaming(&[
            "Sure. I'll execute this command: `ls -la`",
        ]));
        let (ctrl, _store) = controller(backend);

        let turn = ctrl.send("show my files", &mut Recorder::default()).await.unwrap();
        let command = turn.command.unwrap();
        assert_eq!(command.command, "ls -la");
        assert_eq!(ctrl.registry().pending_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_dangerous_command_is_not_queued() {
        let backend = Arc::new(FakeBackend::streaming(&[
            "I'll execute this command: `rm -rf /`",
        ]));
        let (ctrl, _store) = controller(backend);
        let turn = ctrl.send("clean up", &mut Recorder::default()).await.unwrap();
        assert!(turn.command.is_none());
        assert!(ctrl.registry().pending_commands().is_empty());
    }

    #[tokio::test]
    async fn test_regenerate_replaces_tail() {
        let backend = Arc::new(FakeBackend::streaming(&["fresh answer"]));
        let (ctrl, store) = controller(backend.clone());
        store.append(Message::user("first")).unwrap();
        store.append(Message::assistant("first answer")).unwrap();
        store.append(Message::user("second")).unwrap();
        store.append(Message::assistant("stale answer")).unwrap();

        let options = ChatOptions {
            temperature: 1.2,
            top_k: 10,
            top_p: 0.5,
        };
        ctrl.regenerate(3, options, &mut Recorder::default())
            .await
            .unwrap();

        assert_eq!(backend.last_request().options, options);
        let messages = store.current().messages;
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[3], Message::user("second"));
        assert_eq!(messages[4], Message::assistant("fresh answer"));

        assert_eq!(
            ctrl.regenerate(4, options, &mut Recorder::default())
                .await
                .unwrap_err(),
            ChatError::NoSuchMessage(4)
        );
    }

    #[tokio::test]
    async fn test_select_and_list_models() {
        let backend = Arc::new(FakeBackend::default());
        let (ctrl, _store) = controller_with(backend, ChatSettings::default());
        assert!(ctrl.select_model("llama"));
        assert!(!ctrl.select_model("missing"));
        assert_eq!(ctrl.settings().active_model, "llama");
        assert_eq!(ctrl.list_models().await.unwrap().len(), 2);
    }
}
