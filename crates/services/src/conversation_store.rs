//! Conversation persistence.
//!
//! The chat core only sees the `ConversationStore` trait. `JsonConversationStore`
//! keeps every conversation in one JSON file (or only in memory) and also provides
//! listing, switching and transcript export for the front-end.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shared::agent_api::{Conversation, Message, Role};
use std::path::{Path, PathBuf};

const TITLE_CHARS: usize = 30;
const FILENAME_CHARS: usize = 20;

/// Access the chat core needs to the active conversation
pub trait ConversationStore: Send + Sync {
    /// Snapshot of the active conversation
    fn current(&self) -> Conversation;

    fn append(&self, message: Message) -> Result<()>;

    /// Replace the active conversation's messages
    fn replace(&self, messages: Vec<Message>) -> Result<()>;

    fn persist(&self) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    /// Newest first
    conversations: Vec<Conversation>,
    current_id: Option<String>,
}

pub struct JsonConversationStore {
    path: Option<PathBuf>,
    welcome_message: String,
    state: RwLock<StoreFile>,
}

impl JsonConversationStore {
    /// Store that is never written to disk
    pub fn in_memory(welcome_message: &str) -> Self {
        let store = Self {
            path: None,
            welcome_message: welcome_message.to_string(),
            state: RwLock::new(StoreFile::default()),
        };
        store.new_conversation();
        store
    }

    /// Load conversations from `path`, starting a fresh one if there are none
    pub fn open(path: &Path, welcome_message: &str) -> Result<Self> {
        let file = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading conversations from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parsing conversations in {}", path.display()))?
        } else {
            StoreFile::default()
        };

        let store = Self {
            path: Some(path.to_path_buf()),
            welcome_message: welcome_message.to_string(),
            state: RwLock::new(file),
        };

        let needs_fresh = {
            let mut state = store.state.write();
            let valid = state
                .current_id
                .as_ref()
                .is_some_and(|id| state.conversations.iter().any(|c| &c.id == id));
            if !valid {
                state.current_id = state.conversations.first().map(|c| c.id.clone());
            }
            state.conversations.is_empty()
        };
        if needs_fresh {
            store.new_conversation();
        }
        tracing::debug!(
            "Loaded {} conversations from {}",
            store.state.read().conversations.len(),
            path.display()
        );
        Ok(store)
    }

    /// `<config dir>/localchat/conversations.json`
    pub fn default_path() -> Option<PathBuf> {
        shared::settings::config_dir().map(|p| p.join("conversations.json"))
    }

    /// Start a conversation seeded with the welcome message and make it current
    pub fn new_conversation(&self) -> Conversation {
        let mut state = self.state.write();
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            title: format!("Chat {}", state.conversations.len() + 1),
            messages: vec![Message::assistant(self.welcome_message.clone())],
            created_at: Utc::now(),
        };
        state.conversations.insert(0, conversation.clone());
        state.current_id = Some(conversation.id.clone());
        conversation
    }

    /// All conversations, newest first
    pub fn list(&self) -> Vec<Conversation> {
        self.state.read().conversations.clone()
    }

    /// Make `id` the active conversation. Returns false when it does not exist.
    pub fn load(&self, id: &str) -> bool {
        let mut state = self.state.write();
        if state.conversations.iter().any(|c| c.id == id) {
            state.current_id = Some(id.to_string());
            true
        } else {
            false
        }
    }

    pub fn current_id(&self) -> Option<String> {
        self.state.read().current_id.clone()
    }

    fn with_current<T>(&self, f: impl FnOnce(&mut Conversation) -> T) -> Result<T> {
        let mut state = self.state.write();
        let id = state
            .current_id
            .clone()
            .context("no active conversation")?;
        let conversation = state
            .conversations
            .iter_mut()
            .find(|c| c.id == id)
            .context("active conversation is missing")?;
        Ok(f(conversation))
    }
}

impl ConversationStore for JsonConversationStore {
    fn current(&self) -> Conversation {
        let state = self.state.read();
        state
            .current_id
            .as_ref()
            .and_then(|id| state.conversations.iter().find(|c| &c.id == id))
            .cloned()
            .unwrap_or_else(|| Conversation {
                id: String::new(),
                title: String::new(),
                messages: Vec::new(),
                created_at: Utc::now(),
            })
    }

    fn append(&self, message: Message) -> Result<()> {
        self.with_current(|c| {
            c.messages.push(message);
            if let Some(title) = title_from_messages(&c.messages) {
                c.title = title;
            }
        })
    }

    fn replace(&self, messages: Vec<Message>) -> Result<()> {
        self.with_current(|c| {
            c.messages = messages;
            if let Some(title) = title_from_messages(&c.messages) {
                c.title = title;
            }
        })
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&*self.state.read())?;
        std::fs::write(path, json)
            .with_context(|| format!("writing conversations to {}", path.display()))?;
        Ok(())
    }
}

/// First user message, cut to 30 characters
pub fn title_from_messages(messages: &[Message]) -> Option<String> {
    let first = messages.iter().find(|m| m.role == Role::User)?;
    let mut title: String = first.content.chars().take(TITLE_CHARS).collect();
    if first.content.chars().count() > TITLE_CHARS {
        title.push_str("...");
    }
    Some(title)
}

/// Plain-text transcript with `User: ` / `Assistant: ` prefixes
pub fn export_transcript(conversation: &Conversation) -> String {
    let mut content = String::new();
    for msg in &conversation.messages {
        let prefix = match msg.role {
            Role::User => "User: ",
            _ => "Assistant: ",
        };
        content.push_str(prefix);
        content.push_str(&msg.content);
        content.push_str("\n\n");
    }
    content
}

/// `chat-<first 20 chars of the first user message>.txt`, or `chat-<date>.txt`
pub fn export_filename(conversation: &Conversation) -> String {
    match conversation.messages.iter().find(|m| m.role == Role::User) {
        Some(first) => {
            let stem: String = first
                .content
                .chars()
                .take(FILENAME_CHARS)
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            format!("chat-{}.txt", stem)
        }
        None => format!("chat-{}.txt", Utc::now().format("%Y-%m-%d")),
    }
}
