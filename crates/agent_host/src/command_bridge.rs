//! Client for an external command bridge reachable over HTTP.
//!
//! The bridge owns its own pending queue and runs approved commands itself; this
//! side only forwards decisions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::commands::{CommandStatus, ExecutionReport, PendingCommand};
use shared::error::CommandError;
use std::sync::LazyLock;
use std::time::Duration;

use crate::executor::CommandService;

static BRIDGE_HTTP: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(3))
        // approval waits for the command itself (30 s) plus transport
        .timeout(Duration::from_secs(45))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("HTTP client builder failed ({}), using defaults", e);
            Client::new()
        })
});

#[derive(Debug, Serialize)]
struct QueueRequest<'a> {
    command: &'a str,
    description: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IdRequest<'a> {
    command_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BridgeReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    command_id: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl BridgeReply {
    fn text(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.error.clone())
            .unwrap_or_default()
    }

    fn is_not_found(&self) -> bool {
        self.text().contains("not found")
    }
}

#[derive(Debug, Deserialize)]
struct PendingReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    commands: Vec<BridgeCommand>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BridgeCommand {
    id: serde_json::Value,
    command: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    timestamp: Option<String>,
}

impl From<BridgeCommand> for PendingCommand {
    fn from(c: BridgeCommand) -> Self {
        let created_at = c
            .timestamp
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        PendingCommand {
            id: id_string(&c.id),
            command: c.command,
            description: c.description,
            created_at,
            status: CommandStatus::Pending,
            output: None,
        }
    }
}

/// Ids arrive as either JSON strings or numbers
fn id_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct HealthReply {
    status: String,
}

pub struct HttpCommandService {
    http: Client,
    base_url: String,
}

impl HttpCommandService {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: BRIDGE_HTTP.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Whether the bridge answers its health check
    pub async fn health(&self) -> bool {
        match self.get::<HealthReply>("/health").await {
            Ok(reply) => reply.status == "ok",
            Err(e) => {
                tracing::debug!("Command bridge health check failed: {}", e);
                false
            }
        }
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<BridgeReply, CommandError> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| CommandError::Service(e.to_string()))?;
        decode(resp).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CommandError> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| CommandError::Service(e.to_string()))?;
        decode(resp).await
    }
}

/// The bridge reports failures as JSON bodies on 4xx/5xx, so decode regardless of status
async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, CommandError> {
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| CommandError::Service(e.to_string()))?;
    serde_json::from_str(&body).map_err(|e| {
        CommandError::Service(format!("unexpected reply (HTTP {}): {}", status.as_u16(), e))
    })
}

#[async_trait]
impl CommandService for HttpCommandService {
    async fn queue(&self, command: &str, description: &str) -> Result<String, CommandError> {
        let reply = self
            .post("/execute-command", &QueueRequest { command, description })
            .await?;
        if !reply.success {
            return Err(CommandError::Service(reply.text()));
        }
        reply
            .command_id
            .as_ref()
            .map(id_string)
            .ok_or_else(|| CommandError::Service("bridge did not return a command id".into()))
    }

    async fn approve(&self, id: &str) -> Result<ExecutionReport, CommandError> {
        let reply = self
            .post("/approve-command", &IdRequest { command_id: id })
            .await?;
        if !reply.success && reply.is_not_found() {
            return Err(CommandError::NotFound(id.to_string()));
        }
        Ok(ExecutionReport {
            success: reply.success,
            message: reply.text(),
        })
    }

    async fn deny(&self, id: &str) -> Result<(), CommandError> {
        let reply = self
            .post("/deny-command", &IdRequest { command_id: id })
            .await?;
        match (reply.success, reply.is_not_found()) {
            (true, _) => Ok(()),
            (false, true) => Err(CommandError::NotFound(id.to_string())),
            (false, false) => Err(CommandError::Service(reply.text())),
        }
    }

    async fn pending(&self) -> Result<Vec<PendingCommand>, CommandError> {
        let reply: PendingReply = self.get("/pending-commands").await?;
        if !reply.success {
            return Err(CommandError::Service(reply.error.unwrap_or_default()));
        }
        Ok(reply.commands.into_iter().map(PendingCommand::from).collect())
    }

    async fn clear_all(&self) -> Result<usize, CommandError> {
        let reply = self.post("/clear-all-pending-commands", &serde_json::json!({})).await?;
        if !reply.success {
            return Err(CommandError::Service(reply.text()));
        }
        // "Cleared N pending commands."
        Ok(reply
            .text()
            .split_whitespace()
            .find_map(|w| w.parse::<usize>().ok())
            .unwrap_or(0))
    }
}
