mod repl;
mod terminal;

use agent_host::{
    ChatController, CommandRegistry, CommandService, HttpCommandService, LocalCommandService,
};
use anyhow::{Context, Result};
use chrono::Utc;
use providers::openai::LocalChatClient;
use repl::{Action, HELP};
use services::conversation_store::{export_filename, export_transcript};
use services::{ConversationStore, DeniedIds, JsonConversationStore};
use shared::agent_api::{ChatOptions, Role};
use shared::settings::{config_path, load_settings_or_default, save_settings, ChatSettings};
use std::sync::Arc;
use std::time::Duration;
use terminal::{describe_pending, describe_resolved, TerminalObserver};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

fn hide_reasoning() -> bool {
    match std::env::var("LOCALCHAT_HIDE_REASONING") {
        Ok(val) => {
            let v = val.trim().to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes"
        }
        Err(_) => false,
    }
}

fn open_store(welcome: &str) -> Arc<JsonConversationStore> {
    let opened = JsonConversationStore::default_path()
        .map(|path| JsonConversationStore::open(&path, welcome));
    match opened {
        Some(Ok(store)) => Arc::new(store),
        Some(Err(e)) => {
            tracing::warn!("Conversation history unavailable ({:#}), keeping it in memory", e);
            Arc::new(JsonConversationStore::in_memory(welcome))
        }
        None => Arc::new(JsonConversationStore::in_memory(welcome)),
    }
}

fn open_denied_ids() -> DeniedIds {
    match DeniedIds::default_path().map(|path| DeniedIds::open(&path)) {
        Some(Ok(ids)) => ids,
        Some(Err(e)) => {
            tracing::warn!("Denied command list unavailable ({:#}), starting empty", e);
            DeniedIds::in_memory()
        }
        None => DeniedIds::in_memory(),
    }
}

async fn command_service(settings: &ChatSettings) -> Arc<dyn CommandService> {
    match &settings.commands.bridge_url {
        Some(url) => {
            let bridge = HttpCommandService::new(url);
            if bridge.health().await {
                tracing::info!("Using command bridge at {}", url);
            } else {
                tracing::warn!("Command bridge at {} is not answering yet", url);
            }
            Arc::new(bridge)
        }
        None => Arc::new(LocalCommandService::new(Duration::from_secs(
            settings.commands.exec_timeout_secs,
        ))),
    }
}

/// Surface commands waiting for approval, one per tick
fn spawn_poller(registry: Arc<CommandRegistry>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match registry.poll().await {
                Ok(Some(cmd)) => println!("\n{}", describe_pending(&cmd)),
                Ok(None) => {}
                Err(e) => tracing::debug!("Polling pending commands failed: {}", e),
            }
        }
    });
}

/// Ctrl-C cancels the response in progress instead of killing the app
fn spawn_cancel_on_interrupt(controller: Arc<ChatController>) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !controller.cancel() {
                println!("\n(nothing to cancel, type /quit to exit)");
            }
        }
    });
}

struct App {
    controller: Arc<ChatController>,
    store: Arc<JsonConversationStore>,
    registry: Arc<CommandRegistry>,
    show_reasoning: bool,
}

impl App {
    /// Returns false when the user asked to quit
    async fn handle(&self, action: Action) -> Result<bool> {
        match action {
            Action::Empty => {}
            Action::Quit => return Ok(false),
            Action::Help => println!("{}", HELP),
            Action::Invalid(hint) => println!("{}", hint),
            Action::Chat(text) => {
                let mut observer = TerminalObserver::new(std::io::stdout(), self.show_reasoning);
                match self.controller.send(&text, &mut observer).await {
                    Ok(turn) => {
                        if turn.dropped_messages > 0 {
                            tracing::info!(
                                "{} earlier messages did not fit the context window",
                                turn.dropped_messages
                            );
                        }
                    }
                    Err(e) => println!("({})", e),
                }
            }
            action @ Action::Regenerate { index, .. } => {
                let base = self
                    .controller
                    .settings()
                    .active_profile()
                    .map(ChatOptions::from)
                    .unwrap_or_default();
                let options = action.regenerate_options(base).unwrap_or(base);
                let mut observer = TerminalObserver::new(std::io::stdout(), self.show_reasoning);
                if let Err(e) = self.controller.regenerate(index, options, &mut observer).await {
                    println!("({})", e);
                }
            }
            Action::New => {
                let conversation = self.store.new_conversation();
                self.store.persist()?;
                println!("{}", conversation.title);
                if let Some(welcome) = conversation.messages.first() {
                    println!("\n{}", welcome.content);
                }
            }
            Action::List => {
                let current = self.store.current_id();
                for (n, c) in self.store.list().iter().enumerate() {
                    let marker = if current.as_deref() == Some(c.id.as_str()) { "*" } else { " " };
                    println!(
                        "{} {:>2}. {}  ({}, {} messages)",
                        marker,
                        n + 1,
                        c.title,
                        c.created_at.format("%Y-%m-%d %H:%M"),
                        c.messages.len()
                    );
                }
            }
            Action::Load(target) => {
                let id = match target.parse::<usize>() {
                    Ok(n) if n >= 1 => self.store.list().get(n - 1).map(|c| c.id.clone()),
                    _ => Some(target.clone()),
                };
                match id {
                    Some(id) if self.store.load(&id) => {
                        self.store.persist()?;
                        println!("Switched to {}", self.store.current().title);
                    }
                    _ => println!("No conversation {}", target),
                }
            }
            Action::History => {
                for (n, msg) in self.store.current().messages.iter().enumerate() {
                    let who = match msg.role {
                        Role::User => "User",
                        Role::Assistant => "Assistant",
                        Role::System => "System",
                    };
                    println!("[{}] {}: {}\n", n, who, msg.content);
                }
            }
            Action::Export(path) => {
                let conversation = self.store.current();
                let path = path.unwrap_or_else(|| export_filename(&conversation));
                std::fs::write(&path, export_transcript(&conversation))
                    .with_context(|| format!("writing transcript to {}", path))?;
                println!("Saved {}", path);
            }
            Action::Models => match self.controller.list_models().await {
                Ok(models) => {
                    let active = self.controller.settings().active_model;
                    for model in models {
                        let marker = if model == active { "*" } else { " " };
                        println!("{} {}", marker, model);
                    }
                }
                Err(e) => println!("Could not list models: {}", e),
            },
            Action::Model(name) => {
                if self.controller.select_model(&name) {
                    if let Some(path) = config_path() {
                        save_settings(&self.controller.settings(), &path)?;
                    }
                    println!("Using {}", name);
                } else {
                    let known: Vec<String> = self
                        .controller
                        .settings()
                        .models
                        .iter()
                        .map(|m| m.name.clone())
                        .collect();
                    println!("No profile named {}. Configured: {}", name, known.join(", "));
                }
            }
            Action::Pending => {
                let pending = self.registry.pending_commands();
                if pending.is_empty() {
                    println!("No commands waiting");
                }
                for cmd in pending {
                    println!("{}", describe_pending(&cmd));
                }
            }
            Action::Approve(id) => match self.registry.approve(&id).await {
                Ok(cmd) => println!("{}", describe_resolved(&cmd)),
                Err(e) => println!("{}", e),
            },
            Action::Deny(id) => match self.registry.deny(&id).await {
                Ok(cmd) => println!("{}", describe_resolved(&cmd)),
                Err(e) => println!("{}", e),
            },
            Action::Denied { clear } => {
                let denied = self.registry.denied_ids();
                if clear {
                    let count = denied.len();
                    denied.clear()?;
                    println!("Forgot {} denied command ids", count);
                } else {
                    println!("{} denied command ids", denied.len());
                    for entry in denied.list() {
                        println!("  {}  denied {}", entry.id, entry.denied_at.format("%Y-%m-%d %H:%M"));
                    }
                }
            }
        }
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let settings_path = config_path();
    let (settings, from_disk) = load_settings_or_default(settings_path.as_deref());
    if !from_disk {
        if let Some(path) = &settings_path {
            if let Err(e) = save_settings(&settings, path) {
                tracing::warn!("Could not write default settings: {:#}", e);
            }
        }
    }

    let store = open_store(&settings.welcome_message);
    let registry = Arc::new(
        CommandRegistry::new(command_service(&settings).await, open_denied_ids())
            .with_denied_ttl(chrono::Duration::hours(settings.commands.denied_ttl_hours)),
    );

    // Nothing queued by an earlier session should survive
    if let Err(e) = registry.clear_all().await {
        tracing::warn!("Could not clear pending commands: {}", e);
    }
    let pruned = registry.prune_denied(Utc::now());
    if pruned > 0 {
        tracing::info!("Forgot {} expired denied command ids", pruned);
    }

    let backend = Arc::new(LocalChatClient::new(&settings.api));
    tracing::info!("Chat endpoint: {}", backend.endpoint());
    let poll_every = Duration::from_secs(settings.commands.poll_interval_secs.max(1));
    let controller = Arc::new(ChatController::new(
        settings,
        backend,
        store.clone(),
        registry.clone(),
    ));

    spawn_poller(registry.clone(), poll_every);
    spawn_cancel_on_interrupt(controller.clone());

    let app = App {
        controller,
        store,
        registry,
        show_reasoning: !hide_reasoning(),
    };

    let current = app.store.current();
    println!("{}  (type /help for commands)\n", current.title);
    if let Some(last) = current.messages.last() {
        println!("{}", last.content);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match app.handle(repl::parse(&line)).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("Error: {:#}", e),
        }
    }

    if let Err(e) = app.store.persist() {
        tracing::error!("Failed to save conversations on exit: {:#}", e);
    }
    Ok(())
}
