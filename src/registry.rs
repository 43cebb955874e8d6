//! Session registry and reaper
//!
//! The registry exclusively owns every live [`SshSession`] and is the single
//! dispatch point for operations on them. Policy screening happens here, once
//! per command, so both the exec and shell paths are covered and neither can
//! bypass it. Blocking SSH work runs on the spawn_blocking pool; the
//! per-session transport lock serializes concurrent requests against one
//! session while distinct sessions proceed in parallel.
//!
//! A background reaper scans on a fixed interval and closes sessions idle
//! past their threshold. Its loop logs failures and keeps going; it never
//! takes the process down.

use crate::audit::{AuditAction, SecurityAudit};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::policy;
use crate::session::{
    CommandKind, ExecResult, HistoryEntry, HistoryResult, SessionSnapshot, ShellOutput, SshSession,
};
use anyhow::anyhow;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

/// Indexed collection of live SSH sessions.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SshSession>>,
    config: BrokerConfig,
    audit: Arc<SecurityAudit>,
}

fn join_error(e: JoinError) -> BrokerError {
    BrokerError::Internal(anyhow!("blocking ssh task failed: {e}"))
}

impl SessionRegistry {
    pub fn new(config: BrokerConfig, audit: Arc<SecurityAudit>) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            audit,
        }
    }

    pub fn audit(&self) -> &SecurityAudit {
        &self.audit
    }

    fn get(&self, session_id: &str) -> Result<Arc<SshSession>, BrokerError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or(BrokerError::SessionNotFound)
    }

    /// Screen one command at the dispatch point. A refusal is recorded in the
    /// session history and the audit log before the error is returned.
    fn screen(
        &self,
        session: &SshSession,
        command: &str,
        kind: CommandKind,
    ) -> Result<(), BrokerError> {
        let decision = policy::classify(command);
        if decision.safe {
            return Ok(());
        }

        self.audit
            .record(&session.id, command, &decision.reason, AuditAction::Blocked);
        session.push_history(HistoryEntry {
            command: command.to_string(),
            timestamp: Utc::now(),
            command_kind: kind,
            result: HistoryResult::Blocked {
                reason: decision.reason.clone(),
            },
        });
        session.touch();

        Err(BrokerError::SecurityBlocked {
            reason: decision.reason,
            command: command.to_string(),
        })
    }

    /// Open a new authenticated session and return its identifier.
    ///
    /// `idle_timeout_secs` overrides the configured reaping threshold for
    /// this session only.
    pub async fn open(
        &self,
        host: String,
        port: u16,
        username: String,
        connect_timeout_secs: u64,
        use_master_key: bool,
        idle_timeout_secs: Option<u64>,
    ) -> Result<String, BrokerError> {
        let key_path = self.config.key_path_if_present(use_master_key);
        let idle_timeout = idle_timeout_secs.unwrap_or(self.config.session_idle_timeout_secs);

        let session = tokio::task::spawn_blocking(move || {
            SshSession::connect(
                &host,
                port,
                &username,
                key_path.as_deref(),
                connect_timeout_secs,
                idle_timeout,
            )
        })
        .await
        .map_err(join_error)??;

        let session_id = session.id.clone();
        self.sessions.insert(session_id.clone(), Arc::new(session));
        info!(session_id = %session_id, active = self.sessions.len(), "session registered");
        Ok(session_id)
    }

    /// Close and forget a session. Idempotent; false only for unknown ids.
    pub async fn close(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, session)) => {
                if let Err(e) =
                    tokio::task::spawn_blocking(move || session.cleanup_blocking()).await
                {
                    warn!(session_id, "session cleanup task failed: {e}");
                }
                true
            }
            None => false,
        }
    }

    /// Run a discrete command in a session, after policy screening.
    pub async fn exec(
        &self,
        session_id: &str,
        command: String,
        timeout_secs: u64,
    ) -> Result<ExecResult, BrokerError> {
        let session = self.get(session_id)?;
        self.screen(&session, &command, CommandKind::Exec)?;

        tokio::task::spawn_blocking(move || session.exec_blocking(&command, timeout_secs))
            .await
            .map_err(join_error)?
    }

    /// Attach an interactive PTY to a session.
    pub async fn shell_start(&self, session_id: &str) -> Result<ShellOutput, BrokerError> {
        let session = self.get(session_id)?;
        tokio::task::spawn_blocking(move || session.shell_attach_blocking())
            .await
            .map_err(join_error)?
    }

    /// Send one command into a session's PTY, after policy screening.
    pub async fn shell_send(
        &self,
        session_id: &str,
        command: String,
    ) -> Result<ShellOutput, BrokerError> {
        let session = self.get(session_id)?;
        self.screen(&session, &command, CommandKind::Shell)?;

        tokio::task::spawn_blocking(move || session.shell_send_blocking(&command))
            .await
            .map_err(join_error)?
    }

    /// Detach a session's PTY; the transport stays connected.
    pub async fn shell_stop(&self, session_id: &str) -> Result<bool, BrokerError> {
        let session = self.get(session_id)?;
        tokio::task::spawn_blocking(move || session.shell_stop_blocking())
            .await
            .map_err(join_error)
    }

    /// Snapshot of every session, without history.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| entry.value().snapshot(false))
            .collect()
    }

    /// Full snapshot of one session, including history.
    pub fn info(&self, session_id: &str) -> Result<SessionSnapshot, BrokerError> {
        Ok(self.get(session_id)?.snapshot(true))
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Close one reaper-eligible batch of idle sessions. Returns the count.
    pub async fn reap_expired(&self) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired() && !entry.value().is_busy())
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for session_id in expired {
            info!(session_id = %session_id, "reaping idle session");
            if self.close(&session_id).await {
                reaped += 1;
            }
        }
        reaped
    }

    /// Close every session; used at shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        info!(count = ids.len(), "closing all sessions");
        for session_id in ids {
            self.close(&session_id).await;
        }
    }

    /// Spawn the long-lived reaper task.
    pub fn spawn_reaper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.config.reap_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let reaped = self.reap_expired().await;
                if reaped > 0 {
                    info!(reaped, active = self.active_count(), "reaper pass complete");
                } else {
                    debug!(active = self.active_count(), "reaper pass complete");
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn insert_for_tests(&self, session: SshSession) -> String {
        let id = session.id.clone();
        self.sessions.insert(id.clone(), Arc::new(session));
        id
    }
}
