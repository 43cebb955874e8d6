//! sshbroker - multi-tenant SSH broker
//!
//! Pools authenticated SSH connections, multiplexes one-shot execs and
//! interactive PTY shells over them, screens every command through a policy
//! engine, and normalizes terminal output for web rendering.

pub mod ansi;
pub mod audit;
pub mod config;
pub mod error;
pub mod keysetup;
pub mod policy;
pub mod registry;
pub mod server;
pub mod session;

pub use audit::{AuditAction, AuditStats, SecurityAudit};
pub use config::BrokerConfig;
pub use error::BrokerError;
pub use keysetup::KeySetupOutcome;
pub use policy::{classify, PolicyDecision};
pub use registry::SessionRegistry;
pub use server::{build_router, run_server, ServerState};
pub use session::{ConnectionState, ExecResult, SessionSnapshot, ShellOutput, SshSession};
