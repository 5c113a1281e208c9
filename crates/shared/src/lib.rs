pub mod commands;
pub mod error;

pub mod settings {
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;

    fn default_true() -> bool {
        true
    }

    /// Sampling parameters and context size for one model served by the backend
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelProfile {
        pub name: String, // e.g., "deepseek-r1:7b"
        /// Context window handed to the truncation engine as the token budget
        pub num_ctx: usize,
        pub temperature: f32,
        pub top_k: u32,
        pub top_p: f32,
        /// Prepended as a system message on every request when set
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub system_message: Option<String>,
    }

    impl ModelProfile {
        pub fn new(name: impl Into<String>, num_ctx: usize) -> Self {
            Self {
                name: name.into(),
                num_ctx,
                temperature: 0.7,
                top_k: 40,
                top_p: 0.9,
                system_message: None,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ApiSettings {
        /// OpenAI-compatible chat completions endpoint
        pub endpoint: String,
        /// Model listing endpoint
        pub models_endpoint: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CommandSettings {
        /// Base URL of the command bridge; `None` runs commands in-process
        #[serde(default)]
        pub bridge_url: Option<String>,
        pub poll_interval_secs: u64,
        pub exec_timeout_secs: u64,
        pub denied_ttl_hours: i64,
        #[serde(default = "default_true")]
        pub detection_enabled: bool,
    }

    impl Default for CommandSettings {
        fn default() -> Self {
            Self {
                bridge_url: None,
                poll_interval_secs: 2,
                exec_timeout_secs: 30,
                denied_ttl_hours: 24,
                detection_enabled: true,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ChatSettings {
        pub models: Vec<ModelProfile>,
        /// Name of the active entry in `models`
        pub active_model: String,
        pub api: ApiSettings,
        pub welcome_message: String,
        #[serde(default = "default_true")]
        pub stream: bool,
        #[serde(default)]
        pub commands: CommandSettings,
    }

    impl Default for ChatSettings {
        fn default() -> Self {
            let mut yla = ModelProfile::new("Yla:latest", 65536);
            yla.system_message = Some(
                "You are Yla, a local chatbot running on the user's own computer.".to_string(),
            );
            Self {
                models: vec![
                    yla,
                    ModelProfile::new("deepseek-r1:7b", 65536),
                    ModelProfile::new("llama", 65536),
                ],
                active_model: "deepseek-r1:7b".into(),
                api: ApiSettings {
                    endpoint: "http://localhost:11434/v1/chat/completions".into(),
                    models_endpoint: "http://localhost:11434/v1/models".into(),
                },
                welcome_message: "Hello! How can I help you today?".into(),
                stream: true,
                commands: CommandSettings::default(),
            }
        }
    }

    impl ChatSettings {
        /// Active model profile, falling back to the first configured one
        pub fn active_profile(&self) -> Option<&ModelProfile> {
            self.models
                .iter()
                .find(|m| m.name == self.active_model)
                .or_else(|| self.models.first())
        }

        /// Switch the active model. Returns false when no profile has that name.
        pub fn select_model(&mut self, name: &str) -> bool {
            if self.models.iter().any(|m| m.name == name) {
                self.active_model = name.to_string();
                true
            } else {
                false
            }
        }

        /// Apply environment overrides (`LOCALCHAT_ENDPOINT`)
        pub fn with_env_overrides(mut self) -> Self {
            if let Ok(endpoint) = std::env::var("LOCALCHAT_ENDPOINT") {
                if !endpoint.trim().is_empty() {
                    self.api.endpoint = endpoint.trim().to_string();
                }
            }
            self
        }
    }

    /// Get the config directory for the app
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("localchat"))
    }

    /// Get the settings file path
    pub fn config_path() -> Option<PathBuf> {
        config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings from `path` or return defaults. The bool reports whether a file was read.
    pub fn load_settings_or_default(path: Option<&std::path::Path>) -> (ChatSettings, bool) {
        if let Some(path) = path {
            if let Ok(contents) = std::fs::read_to_string(path) {
                match serde_json::from_str::<ChatSettings>(&contents) {
                    Ok(settings) => return (settings.with_env_overrides(), true),
                    Err(e) => tracing::warn!("Ignoring unreadable settings at {:?}: {}", path, e),
                }
            }
        }
        (ChatSettings::default().with_env_overrides(), false)
    }

    /// Save settings to disk
    pub fn save_settings(settings: &ChatSettings, path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use tempfile::TempDir;

        #[test]
        fn test_defaults_match_local_server() {
            let settings = ChatSettings::default();
            assert!(settings.api.endpoint.ends_with("/v1/chat/completions"));
            assert_eq!(settings.commands.exec_timeout_secs, 30);
            assert_eq!(settings.commands.poll_interval_secs, 2);
            let active = settings.active_profile().unwrap();
            assert_eq!(active.name, "deepseek-r1:7b");
            assert_eq!(active.top_k, 40);
        }

        #[test]
        fn test_select_unknown_model() {
            let mut settings = ChatSettings::default();
            assert!(!settings.select_model("gpt-9"));
            assert!(settings.select_model("llama"));
            assert_eq!(settings.active_profile().unwrap().name, "llama");
        }

        #[test]
        fn test_save_and_reload() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("nested").join("settings.json");
            let mut settings = ChatSettings::default();
            settings.welcome_message = "Hi there".into();
            settings.stream = false;
            save_settings(&settings, &path).unwrap();

            let (loaded, from_disk) = load_settings_or_default(Some(&path));
            assert!(from_disk);
            assert_eq!(loaded.welcome_message, "Hi there");
            assert!(!loaded.stream);
        }

        #[test]
        fn test_missing_file_falls_back() {
            let dir = TempDir::new().unwrap();
            let (settings, from_disk) =
                load_settings_or_default(Some(&dir.path().join("absent.json")));
            assert!(!from_disk);
            assert_eq!(settings.models.len(), 3);
        }
    }
}

pub mod agent_api {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    pub const THINK_START: &str = "<think>";
    pub const THINK_END: &str = "</think>";

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Role {
        System,
        User,
        Assistant,
    }

    impl Role {
        pub fn as_str(&self) -> &'static str {
            match self {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Message {
        pub role: Role,
        pub content: String,
    }

    impl Message {
        pub fn new(role: Role, content: impl Into<String>) -> Self {
            Self {
                role,
                content: content.into(),
            }
        }

        pub fn system(content: impl Into<String>) -> Self {
            Self::new(Role::System, content)
        }

        pub fn user(content: impl Into<String>) -> Self {
            Self::new(Role::User, content)
        }

        pub fn assistant(content: impl Into<String>) -> Self {
            Self::new(Role::Assistant, content)
        }

        /// Copy of this message with any reasoning span removed
        pub fn without_reasoning(&self) -> Self {
            match self.role {
                Role::Assistant => Self::new(self.role, strip_reasoning(&self.content)),
                _ => self.clone(),
            }
        }
    }

    /// Split `content` into (reasoning, answer). Reasoning is `None` without a complete span.
    pub fn split_reasoning(content: &str) -> (Option<String>, String) {
        if let Some(start) = content.find(THINK_START) {
            let after = start + THINK_START.len();
            if let Some(end_rel) = content[after..].find(THINK_END) {
                let reasoning = content[after..after + end_rel].trim().to_string();
                let mut answer = String::with_capacity(content.len());
                answer.push_str(&content[..start]);
                answer.push_str(&content[after + end_rel + THINK_END.len()..]);
                return (Some(reasoning), answer.trim().to_string());
            }
        }
        (None, content.to_string())
    }

    /// Remove the reasoning span, leaving only the final answer
    pub fn strip_reasoning(content: &str) -> String {
        split_reasoning(content).1
    }

    /// Compose a stored assistant message from its two channels
    pub fn compose_with_reasoning(reasoning: &str, response: &str) -> String {
        if reasoning.is_empty() {
            response.to_string()
        } else {
            format!("{}{}{}{}", THINK_START, reasoning, THINK_END, response)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Conversation {
        pub id: String,
        pub title: String,
        pub messages: Vec<Message>,
        pub created_at: DateTime<Utc>,
    }

    /// Sampling options sent as `options` in the request body
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct ChatOptions {
        pub temperature: f32,
        pub top_k: u32,
        pub top_p: f32,
    }

    impl Default for ChatOptions {
        fn default() -> Self {
            Self {
                temperature: 0.7,
                top_k: 40,
                top_p: 0.9,
            }
        }
    }

    impl From<&crate::settings::ModelProfile> for ChatOptions {
        fn from(profile: &crate::settings::ModelProfile) -> Self {
            Self {
                temperature: profile.temperature,
                top_k: profile.top_k,
                top_p: profile.top_p,
            }
        }
    }

    /// One decoded event from a streaming response
    #[derive(Debug, Clone, PartialEq)]
    pub enum StreamChunk {
        /// Raw text delta from `choices[0].delta.content`
        Text(String),
        /// A completed structured tool call
        ToolCall {
            id: String,
            name: String,
            arguments: String,
        },
        Done {
            stop_reason: Option<String>,
        },
    }

}
