//! Approval state machine for detected commands.
//!
//! `Pending -> Approved -> Executed | Failed`, or `Pending -> Denied`.
//! Entries are keyed by the id the execution service hands out. The same command
//! text may be pending several times under different ids.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use services::DeniedIds;
use shared::commands::{CommandCandidate, CommandStatus, PendingCommand};
use shared::error::CommandError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::executor::CommandService;

pub const DEFAULT_DENIED_TTL_HOURS: i64 = 24;

#[derive(Default)]
struct RegistryState {
    pending: HashMap<String, PendingCommand>,
    resolved: HashMap<String, PendingCommand>,
    /// Ids already surfaced by `poll`
    shown: HashSet<String>,
}

pub struct CommandRegistry {
    service: Arc<dyn CommandService>,
    denied: DeniedIds,
    denied_ttl: Duration,
    state: Mutex<RegistryState>,
}

impl CommandRegistry {
    pub fn new(service: Arc<dyn CommandService>, denied: DeniedIds) -> Self {
        Self {
            service,
            denied,
            denied_ttl: Duration::hours(DEFAULT_DENIED_TTL_HOURS),
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn with_denied_ttl(mut self, ttl: Duration) -> Self {
        self.denied_ttl = ttl;
        self
    }

    /// Queue a detected command with the execution service
    pub async fn register(&self, candidate: &CommandCandidate) -> Result<PendingCommand, CommandError> {
        let id = self
            .service
            .queue(&candidate.command, &candidate.description)
            .await?;
        let entry = PendingCommand::new(id.clone(), &candidate.command, &candidate.description);
        tracing::info!(
            "Registered command {} ({}): {}",
            id,
            candidate.rule,
            candidate.command
        );
        self.state.lock().pending.insert(id, entry.clone());
        Ok(entry)
    }

    /// Run a pending command. Approving an id that is already running or
    /// resolved returns its current state without running it again.
    pub async fn approve(&self, id: &str) -> Result<PendingCommand, CommandError> {
        let command = {
            let mut state = self.state.lock();
            if let Some(done) = state.resolved.get(id) {
                return Ok(done.clone());
            }
            let entry = state
                .pending
                .get_mut(id)
                .ok_or_else(|| CommandError::NotFound(id.to_string()))?;
            if entry.status == CommandStatus::Approved {
                return Ok(entry.clone());
            }
            entry.status = CommandStatus::Approved;
            entry.command.clone()
        };

        tracing::info!("Approved command {}: {}", id, command);
        let (status, output) = match self.service.approve(id).await {
            Ok(report) if report.success => (CommandStatus::Executed, report.message),
            Ok(report) => (CommandStatus::Failed, report.message),
            Err(e) => (CommandStatus::Failed, e.to_string()),
        };
        if status == CommandStatus::Failed {
            tracing::warn!("Command {} failed", id);
        }

        let mut state = self.state.lock();
        let mut entry = state
            .pending
            .remove(id)
            .unwrap_or_else(|| PendingCommand::new(id, command, ""));
        entry.status = status;
        entry.output = Some(output);
        state.resolved.insert(id.to_string(), entry.clone());
        Ok(entry)
    }

    /// Deny a pending command and remember its id so the backend cannot resurface it
    pub async fn deny(&self, id: &str) -> Result<PendingCommand, CommandError> {
        let entry = {
            let mut state = self.state.lock();
            if let Some(done) = state.resolved.get(id) {
                return Ok(done.clone());
            }
            let mut entry = state
                .pending
                .remove(id)
                .ok_or_else(|| CommandError::NotFound(id.to_string()))?;
            if entry.status == CommandStatus::Approved {
                // already running; put it back untouched
                state.pending.insert(id.to_string(), entry.clone());
                return Ok(entry);
            }
            entry.status = CommandStatus::Denied;
            state.resolved.insert(id.to_string(), entry.clone());
            entry
        };

        if let Err(e) = self.denied.insert(id, Utc::now()) {
            tracing::error!("Failed to persist denied command id {}: {}", id, e);
        }
        match self.service.deny(id).await {
            Ok(()) | Err(CommandError::NotFound(_)) => {}
            Err(e) => tracing::warn!("Execution service did not drop command {}: {}", id, e),
        }
        tracing::info!("Denied command {}: {}", id, entry.command);
        Ok(entry)
    }

    /// Forget every pending command here and in the execution service
    pub async fn clear_all(&self) -> Result<usize, CommandError> {
        {
            let mut state = self.state.lock();
            state.pending.clear();
            state.shown.clear();
        }
        let cleared = self.service.clear_all().await?;
        tracing::info!("Cleared {} pending commands", cleared);
        Ok(cleared)
    }

    /// Check the execution service for commands and return the next one the
    /// user has not been shown yet. Denied ids the service still reports are
    /// dropped from it instead.
    pub async fn poll(&self) -> Result<Option<PendingCommand>, CommandError> {
        let backend = self.service.pending().await?;
        if backend.is_empty() {
            self.state.lock().shown.clear();
            return Ok(None);
        }

        let mut purge = Vec::new();
        let mut next = None;
        {
            let mut state = self.state.lock();
            for cmd in backend {
                let denied_here = state
                    .resolved
                    .get(&cmd.id)
                    .is_some_and(|c| c.status == CommandStatus::Denied);
                if denied_here || self.denied.contains(&cmd.id) {
                    purge.push(cmd.id);
                    continue;
                }
                // finished entries the service still lists are not offered again
                if cmd.status.is_resolved() || state.resolved.contains_key(&cmd.id) {
                    continue;
                }
                let entry = state
                    .pending
                    .entry(cmd.id.clone())
                    .or_insert(cmd)
                    .clone();
                if next.is_none() && !state.shown.contains(&entry.id) {
                    next = Some(entry);
                }
            }
            if let Some(entry) = &next {
                state.shown.insert(entry.id.clone());
            }
        }

        for id in purge {
            tracing::debug!("Dropping previously denied command {} from the service", id);
            if let Err(e) = self.service.deny(&id).await {
                tracing::debug!("Could not drop denied command {}: {}", id, e);
            }
        }
        Ok(next)
    }

    /// Entries still awaiting a decision or running, oldest first
    pub fn pending_commands(&self) -> Vec<PendingCommand> {
        let mut list: Vec<PendingCommand> = self.state.lock().pending.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn get(&self, id: &str) -> Option<PendingCommand> {
        let state = self.state.lock();
        state
            .pending
            .get(id)
            .or_else(|| state.resolved.get(id))
            .cloned()
    }

    /// Evict denied ids older than the TTL
    pub fn prune_denied(&self, now: DateTime<Utc>) -> usize {
        match self.denied.prune(now, self.denied_ttl) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Failed to prune denied command ids: {}", e);
                0
            }
        }
    }

    pub fn denied_ids(&self) -> &DeniedIds {
        &self.denied
    }
}
