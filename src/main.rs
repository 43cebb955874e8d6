//! sshbroker CLI - SSH broker command line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use sshbroker::config::BrokerConfig;
use sshbroker::policy;
use sshbroker::server::run_server;

#[derive(Parser)]
#[command(name = "sshbroker")]
#[command(about = "Multi-tenant SSH broker with PTY shells and command safety screening")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker server
    Run {
        /// Port to listen on
        #[arg(short, long, default_value = "8001")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Path to the master private key
        #[arg(long)]
        key: Option<PathBuf>,

        /// Path of the security audit log
        #[arg(long)]
        audit_log: Option<PathBuf>,

        /// Config file (defaults to ~/.config/sshbroker/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Session idle timeout in seconds
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Directory for the broker's operational log file
        #[arg(long, default_value = ".")]
        log_dir: PathBuf,
    },

    /// Classify commands against the safety policy without running them
    PolicyCheck {
        /// Commands to classify
        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Show version info
    Version,
}

fn init_logging(log_dir: &PathBuf) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::never(log_dir, "sshbroker.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(file_writer.and(std::io::stdout))
        .init();

    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run {
            port,
            host,
            key,
            audit_log,
            config,
            idle_timeout,
            log_dir,
        }) => {
            let _log_guard = init_logging(&log_dir);

            let config_path = config.unwrap_or_else(BrokerConfig::default_path);
            let mut config = BrokerConfig::load_or_default(&config_path);

            // CLI flags override the config file.
            config.host = host;
            config.port = port;
            if let Some(key) = key {
                config.ssh_key_path = key;
            }
            if let Some(audit_log) = audit_log {
                config.audit_log_path = audit_log;
            }
            if let Some(idle_timeout) = idle_timeout {
                config.session_idle_timeout_secs = idle_timeout;
            }

            run_server(config).await
        }

        Some(Commands::PolicyCheck { commands }) => {
            for command in commands {
                let decision = policy::classify(&command);
                if decision.safe {
                    println!("ALLOWED  {command}");
                } else {
                    println!(
                        "BLOCKED  {command}  ({}, rule {})",
                        decision.reason,
                        decision.matched_rule_id.unwrap_or("-")
                    );
                }
            }
            Ok(())
        }

        Some(Commands::Version) => {
            println!("sshbroker {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }

        None => {
            // Default to running with stock settings.
            let _log_guard = init_logging(&PathBuf::from("."));
            let config = BrokerConfig::load_or_default(&BrokerConfig::default_path());
            run_server(config).await
        }
    }
}
