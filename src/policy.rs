//! Command safety policy engine
//!
//! A deterministic, side-effect-free classifier that screens every command
//! before it leaves the local host. Rules are evaluated in order and the
//! first match wins:
//!
//! 1. Regex rules against the normalized (lowercased, whitespace-collapsed)
//!    full command
//! 2. Exact base-command match against system-control verbs
//! 3. Exact base-command match against partition tools
//!
//! The engine is intentionally coarse: it is not a shell parser. Aliases,
//! environment expansion, and encoded payloads are out of scope, and false
//! positives are preferred over false negatives.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Outcome of screening one command.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecision {
    /// Whether the command may be transmitted to the remote host.
    pub safe: bool,
    /// Human-readable reason for a refusal; empty when safe.
    pub reason: String,
    /// Stable identifier of the rule that matched, if any.
    pub matched_rule_id: Option<&'static str>,
}

impl PolicyDecision {
    fn safe() -> Self {
        Self {
            safe: true,
            reason: String::new(),
            matched_rule_id: None,
        }
    }

    fn blocked(rule_id: &'static str, reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: reason.into(),
            matched_rule_id: Some(rule_id),
        }
    }
}

struct Rule {
    id: &'static str,
    pattern: Regex,
    reason: &'static str,
}

impl Rule {
    fn new(id: &'static str, pattern: &str, reason: &'static str) -> Self {
        Self {
            id,
            // Rule patterns are static and known-good.
            pattern: Regex::new(pattern).expect("invalid policy rule pattern"),
            reason,
        }
    }
}

/// Ordered rule table. Patterns run against the normalized command, which is
/// already lowercase, so the table is effectively case-insensitive.
static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        // Destructive removal
        Rule::new("rm-root", r"rm\s+.*-rf\s*/\s*$", "root directory removal risk"),
        Rule::new("rm-root-glob", r"rm\s+.*-rf\s*/\*", "full system removal risk"),
        Rule::new("rm-home", r"rm\s+.*-rf\s*/home", "home directory removal risk"),
        Rule::new("rm-etc", r"rm\s+.*-rf\s*/etc", "system configuration removal risk"),
        Rule::new("rm-var", r"rm\s+.*-rf\s*/var", "system data removal risk"),
        Rule::new("rm-usr", r"rm\s+.*-rf\s*/usr", "system program removal risk"),
        Rule::new("rm-boot", r"rm\s+.*-rf\s*/boot", "boot file removal risk"),
        Rule::new("rm-recursive", r"rm\s+.*-r.*f.*/", "system directory removal risk"),
        // Block-device overwrite
        Rule::new(
            "dd-zero",
            r"dd\s+.*if=/dev/zero.*of=/dev/",
            "full disk wipe risk",
        ),
        Rule::new(
            "dd-urandom",
            r"dd\s+.*if=/dev/urandom.*of=/dev/",
            "full disk wipe risk",
        ),
        // Filesystem format
        Rule::new("mkfs", r"mkfs\.", "filesystem format risk"),
        Rule::new("format", r"format\s+", "disk format risk"),
        // Dangerous permission changes
        Rule::new(
            "chmod-recursive-777",
            r"chmod\s+.*-r.*777.*/",
            "recursive permission change risk",
        ),
        Rule::new("chmod-777", r"chmod\s+.*777.*/", "world-writable permission risk"),
        Rule::new("chown-root", r"chown\s+.*root.*/", "root ownership change risk"),
        // Piped remote execution
        Rule::new("curl-pipe-bash", r"curl\s+.*\|\s*bash", "remote script execution risk"),
        Rule::new("curl-pipe-sh", r"curl\s+.*\|\s*sh", "remote script execution risk"),
        Rule::new("wget-pipe-bash", r"wget\s+.*\|\s*bash", "remote script execution risk"),
        Rule::new("wget-pipe-sh", r"wget\s+.*\|\s*sh", "remote script execution risk"),
        // Core package removal
        Rule::new(
            "apt-purge-kernel",
            r"apt\s+remove.*--purge.*linux",
            "kernel removal risk",
        ),
        Rule::new("apt-glibc", r"apt\s+remove.*glibc", "core library removal risk"),
        Rule::new("yum-glibc", r"yum\s+remove.*glibc", "core library removal risk"),
        Rule::new("apt-systemd", r"apt\s+remove.*systemd", "system manager removal risk"),
        // Killing pid 1
        Rule::new("kill-init", r"kill\s+-9\s+1\b", "init process kill risk"),
        Rule::new("killall-systemd", r"killall\s+-9\s+systemd", "systemd kill risk"),
        Rule::new("killall-init", r"killall\s+-9\s+init", "init process kill risk"),
        // Firewall teardown
        Rule::new("iptables-flush", r"iptables\s+.*-f", "firewall rule flush risk"),
        Rule::new("iptables-delete-chain", r"iptables\s+.*-x", "firewall chain removal risk"),
    ]
});

/// System-control verbs refused as base commands.
const SYSTEM_CONTROL_COMMANDS: &[&str] = &["shutdown", "reboot", "halt", "poweroff", "init"];

/// Partition tools refused as base commands.
const PARTITION_TOOLS: &[&str] = &["fdisk", "parted", "gdisk", "cfdisk"];

/// Lowercase and collapse runs of whitespace to single spaces.
fn normalize(command: &str) -> String {
    command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Classify a command string. Deterministic and side-effect free.
pub fn classify(command: &str) -> PolicyDecision {
    let normalized = normalize(command);
    if normalized.is_empty() {
        return PolicyDecision::safe();
    }

    for rule in RULES.iter() {
        if rule.pattern.is_match(&normalized) {
            return PolicyDecision::blocked(rule.id, rule.reason);
        }
    }

    // split_whitespace above guarantees a first token on non-empty input
    let base = normalized.split(' ').next().unwrap_or_default();

    if SYSTEM_CONTROL_COMMANDS.contains(&base) {
        return PolicyDecision::blocked(
            "system-control",
            format!("system control command '{base}' is not allowed"),
        );
    }

    if PARTITION_TOOLS.contains(&base) {
        return PolicyDecision::blocked(
            "partition-tool",
            format!("disk partition tool '{base}' is not allowed"),
        );
    }

    PolicyDecision::safe()
}
