//! One SSH connection: an authenticated transport plus zero-or-one PTY channel
//!
//! A session authenticates with the broker's master key (or the ambient SSH
//! agent when the key file is absent), runs discrete commands on fresh
//! channels, and optionally attaches an interactive `xterm-256color` PTY.
//! All libssh2 calls block, so the registry drives every method here from
//! `tokio::task::spawn_blocking`.
//!
//! The state machine is monotonic toward `Closed`:
//! `Disconnected → Connected → ShellAttached ⇄ Connected → Closed`.
//! The PTY channel is present exactly when the state is `ShellAttached`.

use crate::ansi;
use crate::error::BrokerError;
use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use ssh2::Session as Ssh2Session;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const PTY_TERM: &str = "xterm-256color";
const PTY_COLS: u32 = 120;
const PTY_ROWS: u32 = 40;

/// Read timeout while a PTY is attached; this is the shell poll tick.
const SHELL_READ_TIMEOUT_MS: u32 = 100;

/// Hard upper bound on PTY attach.
const SHELL_ATTACH_TIMEOUT_MS: u32 = 60_000;

/// Wait budget for the initial output after attach (seconds).
const SHELL_INITIAL_WAIT: f64 = 1.5;

/// Soft wait budget for each shell command's output (seconds).
const SHELL_COMMAND_WAIT: f64 = 2.0;

/// Settle delay between writing a command and the first read.
const SHELL_SETTLE: Duration = Duration::from_millis(300);

/// Most recent commands kept per session, FIFO eviction.
const HISTORY_CAP: usize = 100;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    ShellAttached,
    Closed,
}

/// How a history entry was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Exec,
    Shell,
}

/// Result payload of a history entry.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryResult {
    Exec {
        success: bool,
        stdout: Option<String>,
        stderr: Option<String>,
        exit_code: i32,
    },
    Shell {
        output: String,
        prompt: String,
        security_blocked: bool,
    },
    Blocked {
        reason: String,
    },
}

/// One remembered command. Advisory only; lost on restart.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub command: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub command_kind: CommandKind,
    pub result: HistoryResult,
}

/// Outcome of a discrete exec.
#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub success: bool,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: i32,
    pub error: Option<String>,
    pub security_blocked: bool,
}

impl ExecResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: None,
            stderr: None,
            exit_code: -1,
            error: Some(message.into()),
            security_blocked: false,
        }
    }
}

/// Normalized output of one shell interaction.
#[derive(Debug, Clone, Serialize)]
pub struct ShellOutput {
    pub output: String,
    pub prompt: String,
    pub has_colors: bool,
}

/// Read-only view of a session for `list`/`info`. Never exposes the PTY.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: ConnectionState,
    pub is_connected: bool,
    pub shell_active: bool,
    pub command_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_history: Option<Vec<HistoryEntry>>,
}

struct Transport {
    ssh: Option<Ssh2Session>,
    shell: Option<ssh2::Channel>,
    current_prompt: String,
}

/// One live SSH connection owned by the registry.
///
/// The transport mutex is held for the full duration of every blocking
/// operation, which is what serializes concurrent requests on one session.
/// `last_activity` and the state mirror are readable without that lock so
/// the reaper and snapshot paths never queue behind a slow command.
pub struct SshSession {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub idle_timeout_secs: u64,
    last_activity: AtomicI64,
    state: Mutex<ConnectionState>,
    history: Mutex<VecDeque<HistoryEntry>>,
    transport: Mutex<Transport>,
}

impl SshSession {
    /// Establish an authenticated transport to `host:port`.
    ///
    /// With `key_path` set, authenticates with that private key; otherwise
    /// falls back to the ambient SSH agent.
    pub fn connect(
        host: &str,
        port: u16,
        username: &str,
        key_path: Option<&Path>,
        connect_timeout_secs: u64,
        idle_timeout_secs: u64,
    ) -> Result<Self, BrokerError> {
        let addr = format!("{host}:{port}")
            .to_socket_addrs()
            .map_err(|e| BrokerError::NetworkUnreachable(format!("{host}:{port}: {e}")))?
            .next()
            .ok_or_else(|| {
                BrokerError::NetworkUnreachable(format!("{host}:{port}: no address resolved"))
            })?;

        let tcp = TcpStream::connect_timeout(&addr, Duration::from_secs(connect_timeout_secs))
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                    BrokerError::Timeout(connect_timeout_secs)
                }
                _ => BrokerError::NetworkUnreachable(format!("{host}:{port}: {e}")),
            })?;

        let mut ssh = Ssh2Session::new().context("libssh2 session init failed")?;
        ssh.set_tcp_stream(tcp);
        ssh.set_timeout((connect_timeout_secs * 1000) as u32);
        ssh.handshake().map_err(|e| {
            BrokerError::NetworkUnreachable(format!("ssh handshake failed: {}", e.message()))
        })?;

        match key_path {
            Some(path) => {
                debug!(key = %path.display(), "authenticating with master key");
                ssh.userauth_pubkey_file(username, None, path, None)
                    .map_err(BrokerError::from_auth)?;
            }
            None => {
                debug!("master key absent, trying ssh agent");
                Self::agent_auth(&ssh, username)?;
            }
        }

        if !ssh.authenticated() {
            return Err(BrokerError::AuthFailure("authentication incomplete".into()));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        info!(session_id = %id, host, port, username, "ssh session connected");

        Ok(Self {
            id,
            host: host.to_string(),
            port,
            username: username.to_string(),
            created_at: now,
            idle_timeout_secs,
            last_activity: AtomicI64::new(now.timestamp()),
            state: Mutex::new(ConnectionState::Connected),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
            transport: Mutex::new(Transport {
                ssh: Some(ssh),
                shell: None,
                current_prompt: String::new(),
            }),
        })
    }

    fn agent_auth(ssh: &Ssh2Session, username: &str) -> Result<(), BrokerError> {
        let mut agent = ssh
            .agent()
            .map_err(|e| BrokerError::KeyUnavailable(e.message().to_string()))?;
        agent
            .connect()
            .map_err(|e| BrokerError::KeyUnavailable(format!("ssh agent unavailable: {}", e.message())))?;
        agent
            .list_identities()
            .map_err(|e| BrokerError::KeyUnavailable(e.message().to_string()))?;

        let identities = agent
            .identities()
            .map_err(|e| BrokerError::KeyUnavailable(e.message().to_string()))?;
        if identities.is_empty() {
            return Err(BrokerError::KeyUnavailable("ssh agent holds no identities".into()));
        }

        for identity in &identities {
            if agent.userauth(username, identity).is_ok() {
                return Ok(());
            }
        }

        Err(BrokerError::AuthFailure(
            "no agent identity accepted by the remote host".into(),
        ))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Bump the activity clock.
    pub fn touch(&self) {
        self.last_activity.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let secs = self.last_activity.load(Ordering::Relaxed);
        Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
    }

    /// Has this session been idle past its threshold?
    pub fn is_expired(&self) -> bool {
        let idle = Utc::now().timestamp() - self.last_activity.load(Ordering::Relaxed);
        idle > self.idle_timeout_secs as i64
    }

    /// Record a command in the bounded history.
    pub fn push_history(&self, entry: HistoryEntry) {
        let mut history = self.history.lock();
        history.push_back(entry);
        while history.len() > HISTORY_CAP {
            history.pop_front();
        }
    }

    /// Run one discrete command on a fresh channel. Blocking.
    ///
    /// Remote non-zero exit is not an error: the result carries the code.
    pub fn exec_blocking(&self, command: &str, timeout_secs: u64) -> Result<ExecResult, BrokerError> {
        if self.state() == ConnectionState::Closed {
            return Err(BrokerError::SessionClosed);
        }

        let transport = self.transport.lock();
        let ssh = match transport.ssh.as_ref() {
            Some(ssh) => ssh,
            None => return Err(BrokerError::SessionClosed),
        };

        self.touch();
        ssh.set_timeout((timeout_secs * 1000) as u32);

        let result = match Self::run_channel_exec(ssh, command) {
            Ok(result) => result,
            Err(e) => {
                warn!(session_id = %self.id, command, "exec failed: {e:#}");
                ExecResult::failure(format!("command execution failed: {e:#}"))
            }
        };
        drop(transport);

        debug!(
            session_id = %self.id,
            command,
            exit_code = result.exit_code,
            "exec finished"
        );

        self.push_history(HistoryEntry {
            command: command.to_string(),
            timestamp: Utc::now(),
            command_kind: CommandKind::Exec,
            result: HistoryResult::Exec {
                success: result.success,
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
                exit_code: result.exit_code,
            },
        });

        Ok(result)
    }

    fn run_channel_exec(ssh: &Ssh2Session, command: &str) -> anyhow::Result<ExecResult> {
        let mut channel = ssh.channel_session().context("channel open failed")?;
        channel.exec(command).context("exec request failed")?;

        let mut stdout_buf = Vec::new();
        channel
            .read_to_end(&mut stdout_buf)
            .context("stdout read failed")?;

        let mut stderr_buf = Vec::new();
        channel
            .stderr()
            .read_to_end(&mut stderr_buf)
            .context("stderr read failed")?;

        let _ = channel.wait_close();
        let exit_code = channel.exit_status().unwrap_or(-1);

        Ok(ExecResult {
            success: exit_code == 0,
            stdout: Some(String::from_utf8_lossy(&stdout_buf).into_owned()),
            stderr: Some(String::from_utf8_lossy(&stderr_buf).into_owned()),
            exit_code,
            error: None,
            security_blocked: false,
        })
    }

    /// Attach an interactive PTY and read the greeting/prompt. Blocking.
    ///
    /// An already-attached PTY is closed first. On attach failure the partial
    /// channel is released and the transport stays usable.
    pub fn shell_attach_blocking(&self) -> Result<ShellOutput, BrokerError> {
        if self.state() == ConnectionState::Closed {
            return Err(BrokerError::SessionClosed);
        }

        let mut transport = self.transport.lock();

        if let Some(mut old) = transport.shell.take() {
            debug!(session_id = %self.id, "closing previous pty before re-attach");
            let _ = old.close();
            let _ = old.wait_close();
            self.set_state(ConnectionState::Connected);
        }

        let ssh = match transport.ssh.as_ref() {
            Some(ssh) => ssh,
            None => return Err(BrokerError::SessionClosed),
        };

        ssh.set_timeout(SHELL_ATTACH_TIMEOUT_MS);

        let mut channel = ssh
            .channel_session()
            .map_err(|e| BrokerError::Shell(format!("channel open failed: {}", e.message())))?;

        if let Err(e) = channel.request_pty(PTY_TERM, None, Some((PTY_COLS, PTY_ROWS, 0, 0))) {
            let _ = channel.close();
            return Err(BrokerError::Shell(format!("pty request failed: {}", e.message())));
        }

        if let Err(e) = channel.shell() {
            let _ = channel.close();
            return Err(BrokerError::Shell(format!("shell open failed: {}", e.message())));
        }

        // From here on the channel is polled at the shell tick.
        ssh.set_timeout(SHELL_READ_TIMEOUT_MS);

        std::thread::sleep(SHELL_SETTLE);
        let raw = read_shell_output(&mut channel, SHELL_INITIAL_WAIT);

        let prompt = ansi::extract_prompt(&raw).unwrap_or_default();
        transport.current_prompt = prompt.clone();
        transport.shell = Some(channel);
        drop(transport);

        self.set_state(ConnectionState::ShellAttached);
        self.touch();
        info!(session_id = %self.id, prompt, "interactive shell attached");

        let output = ansi::clean_output(&raw, true);
        Ok(ShellOutput {
            has_colors: output.contains("<span"),
            output,
            prompt,
        })
    }

    /// Write one command into the PTY and collect its output. Blocking.
    pub fn shell_send_blocking(&self, command: &str) -> Result<ShellOutput, BrokerError> {
        match self.state() {
            ConnectionState::Closed => return Err(BrokerError::SessionClosed),
            ConnectionState::ShellAttached => {}
            _ => return Err(BrokerError::ShellNotStarted),
        }

        let mut transport = self.transport.lock();
        let channel = transport.shell.as_mut().ok_or(BrokerError::ShellNotStarted)?;

        self.touch();
        channel
            .write_all(format!("{command}\n").as_bytes())
            .map_err(|e| BrokerError::Shell(format!("pty write failed: {e}")))?;

        std::thread::sleep(SHELL_SETTLE);
        let raw = read_shell_output(channel, SHELL_COMMAND_WAIT);

        if let Some(prompt) = ansi::extract_prompt(&raw) {
            transport.current_prompt = prompt;
        }
        let prompt = transport.current_prompt.clone();
        drop(transport);

        let output = ansi::clean_output(&raw, true);
        let shell_output = ShellOutput {
            has_colors: output.contains("<span"),
            output,
            prompt,
        };

        self.push_history(HistoryEntry {
            command: command.to_string(),
            timestamp: Utc::now(),
            command_kind: CommandKind::Shell,
            result: HistoryResult::Shell {
                output: shell_output.output.clone(),
                prompt: shell_output.prompt.clone(),
                security_blocked: false,
            },
        });

        debug!(session_id = %self.id, command, "shell command finished");
        Ok(shell_output)
    }

    /// Detach the PTY, leaving the transport connected. Blocking.
    pub fn shell_stop_blocking(&self) -> bool {
        let mut transport = self.transport.lock();
        if let Some(mut channel) = transport.shell.take() {
            let _ = channel.close();
            let _ = channel.wait_close();
        }
        transport.current_prompt.clear();
        drop(transport);

        if self.state() == ConnectionState::ShellAttached {
            self.set_state(ConnectionState::Connected);
        }
        self.touch();
        info!(session_id = %self.id, "interactive shell stopped");
        true
    }

    /// Release the PTY and transport. Idempotent; state ends at `Closed`.
    pub fn cleanup_blocking(&self) {
        let mut transport = self.transport.lock();
        if let Some(mut channel) = transport.shell.take() {
            let _ = channel.close();
            let _ = channel.wait_close();
        }
        if let Some(ssh) = transport.ssh.take() {
            let _ = ssh.disconnect(None, "session closed", None);
        }
        transport.current_prompt.clear();
        drop(transport);

        self.set_state(ConnectionState::Closed);
        info!(session_id = %self.id, host = %self.host, "ssh session closed");
    }

    /// Is an operation currently holding the transport?
    ///
    /// The reaper uses this to skip sessions mid-operation: an in-flight
    /// command is activity, whatever the activity clock says.
    pub fn is_busy(&self) -> bool {
        match self.transport.try_lock() {
            Some(_) => false,
            None => true,
        }
    }

    /// Read-only view; the PTY handle is never exposed.
    pub fn snapshot(&self, include_history: bool) -> SessionSnapshot {
        let state = self.state();
        let history = self.history.lock();

        SessionSnapshot {
            session_id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            state,
            is_connected: matches!(
                state,
                ConnectionState::Connected | ConnectionState::ShellAttached
            ),
            shell_active: state == ConnectionState::ShellAttached,
            command_count: history.len(),
            command_history: include_history.then(|| history.iter().cloned().collect()),
        }
    }

    /// Test-only constructor: a session with no transport, as if reaped.
    #[cfg(test)]
    pub(crate) fn detached_for_tests(idle_timeout_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            host: "test.invalid".to_string(),
            port: 22,
            username: "tester".to_string(),
            created_at: now,
            idle_timeout_secs,
            last_activity: AtomicI64::new(now.timestamp()),
            state: Mutex::new(ConnectionState::Connected),
            history: Mutex::new(VecDeque::new()),
            transport: Mutex::new(Transport {
                ssh: None,
                shell: None,
                current_prompt: String::new(),
            }),
        }
    }
}

/// Poll the PTY for output until the prompt heuristic fires or the wait
/// budget runs out.
///
/// The channel's 100 ms read timeout is the poll tick: a timed-out read
/// counts as a no-data tick, and the no-data counter caps at ten ticks per
/// budgeted second.
fn read_shell_output(channel: &mut ssh2::Channel, max_wait: f64) -> String {
    let mut output = String::new();
    let start = Instant::now();
    let mut no_data = 0usize;
    let max_no_data = (max_wait * 10.0).ceil() as usize;
    let mut buf = [0u8; 4096];

    while start.elapsed().as_secs_f64() < max_wait && no_data < max_no_data {
        match channel.read(&mut buf) {
            // EOF: the remote shell went away, nothing more will arrive.
            Ok(0) => break,
            Ok(n) => {
                output.push_str(&String::from_utf8_lossy(&buf[..n]));
                no_data = 0;
                if n == buf.len() {
                    // Full buffer, likely more queued.
                    continue;
                }
            }
            Err(_) => no_data += 1,
        }

        let clean = ansi::strip_ansi(&output);
        if let Some(last) = clean.lines().rev().find(|l| !l.trim().is_empty()) {
            if ansi::is_prompt_line(last) {
                debug!(line = last, "prompt detected, ending read");
                break;
            }
        }
    }

    output
}
