//! One-shot key installation on a remote host
//!
//! Upgrades a password-authenticated host to key authentication: connects
//! with the supplied password, makes sure `~/.ssh` and `authorized_keys`
//! exist with sane modes, appends the broker's public key if it is not
//! already present, and confirms the append by re-reading the last line.
//!
//! The password is used for the one transport and nowhere else: it is never
//! stored, logged, or echoed back in the outcome.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use ssh2::Session as Ssh2Session;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Result of a key-install attempt.
#[derive(Debug, Clone, Serialize)]
pub struct KeySetupOutcome {
    pub success: bool,
    pub key_installed: bool,
    pub message: String,
}

impl KeySetupOutcome {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            key_installed: false,
            message: message.into(),
        }
    }

    fn installed(message: impl Into<String>) -> Self {
        Self {
            success: true,
            key_installed: true,
            message: message.into(),
        }
    }
}

/// Is this exact key line already present in the authorized_keys contents?
fn key_already_present(existing: &str, public_key: &str) -> bool {
    let wanted = public_key.trim();
    !wanted.is_empty() && existing.lines().any(|line| line.trim() == wanted)
}

/// Compare two key lines by their first two fields (type and key data);
/// the comment field may legitimately differ.
fn keys_match(expected: &str, actual: &str) -> bool {
    let expected_fields: Vec<&str> = expected.split_whitespace().take(2).collect();
    let actual_fields: Vec<&str> = actual.split_whitespace().take(2).collect();
    expected_fields.len() == 2 && expected_fields == actual_fields
}

fn run_command(ssh: &Ssh2Session, command: &str) -> Result<(i32, String)> {
    let mut channel = ssh.channel_session().context("channel open failed")?;
    channel.exec(command).context("exec request failed")?;

    let mut output = String::new();
    channel
        .read_to_string(&mut output)
        .context("output read failed")?;

    let _ = channel.wait_close();
    let exit_code = channel.exit_status().unwrap_or(-1);
    Ok((exit_code, output))
}

fn connect_with_password(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    timeout: Duration,
) -> Result<Ssh2Session> {
    let addr = format!("{host}:{port}")
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve {host}:{port}"))?
        .next()
        .ok_or_else(|| anyhow!("no address resolved for {host}:{port}"))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout)
        .with_context(|| format!("cannot connect to {host}:{port}"))?;

    let mut ssh = Ssh2Session::new().context("libssh2 session init failed")?;
    ssh.set_tcp_stream(tcp);
    ssh.set_timeout(timeout.as_millis() as u32);
    ssh.handshake().context("ssh handshake failed")?;

    ssh.userauth_password(username, password)
        .map_err(|_| anyhow!("authentication failed: check username or password"))?;

    Ok(ssh)
}

/// Install the public key at `public_key_path` on `username@host:port`.
/// Blocking; callers drive this from `spawn_blocking`.
pub fn install_key_blocking(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    public_key_path: &Path,
    connect_timeout_secs: u64,
) -> KeySetupOutcome {
    let public_key = match std::fs::read_to_string(public_key_path) {
        Ok(contents) => contents.trim().to_string(),
        Err(_) => {
            return KeySetupOutcome::failure(format!(
                "public key file not found: {}",
                public_key_path.display()
            ));
        }
    };
    if public_key.is_empty() {
        return KeySetupOutcome::failure(format!(
            "public key file is empty: {}",
            public_key_path.display()
        ));
    }

    info!(host, port, username, "installing ssh key");

    let ssh = match connect_with_password(
        host,
        port,
        username,
        password,
        Duration::from_secs(connect_timeout_secs),
    ) {
        Ok(ssh) => ssh,
        Err(e) => return KeySetupOutcome::failure(format!("{e:#}")),
    };

    // Make sure the target files exist with the modes sshd insists on.
    let prep_commands = [
        "mkdir -p ~/.ssh",
        "chmod 700 ~/.ssh",
        "touch ~/.ssh/authorized_keys",
        "chmod 600 ~/.ssh/authorized_keys",
    ];
    for command in prep_commands {
        match run_command(&ssh, command) {
            Ok((0, _)) => {}
            Ok((code, _)) => warn!(command, code, "key setup prep command returned non-zero"),
            Err(e) => return KeySetupOutcome::failure(format!("prep command failed: {e:#}")),
        }
    }

    let existing = match run_command(&ssh, "cat ~/.ssh/authorized_keys 2>/dev/null || echo ''") {
        Ok((_, output)) => output,
        Err(e) => return KeySetupOutcome::failure(format!("could not read authorized_keys: {e:#}")),
    };

    if key_already_present(&existing, &public_key) {
        info!(host, username, "ssh key already installed");
        return KeySetupOutcome::installed("ssh key is already installed");
    }

    let append = format!("echo '{public_key}' >> ~/.ssh/authorized_keys");
    match run_command(&ssh, &append) {
        Ok((0, _)) => {}
        Ok((code, _)) => {
            return KeySetupOutcome::failure(format!("key append returned exit code {code}"))
        }
        Err(e) => return KeySetupOutcome::failure(format!("key append failed: {e:#}")),
    }

    // Confirm the append actually landed.
    let last_line = match run_command(&ssh, "tail -1 ~/.ssh/authorized_keys") {
        Ok((_, output)) => output.trim().to_string(),
        Err(e) => return KeySetupOutcome::failure(format!("key verification failed: {e:#}")),
    };

    let _ = ssh.disconnect(None, "key setup complete", None);

    if keys_match(&public_key, &last_line) {
        info!(host, username, "ssh key installed");
        KeySetupOutcome::installed("ssh key installed")
    } else {
        KeySetupOutcome::failure("ssh key verification failed after append")
    }
}
