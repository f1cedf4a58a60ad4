// src/config/model.rs

use serde::{Deserialize, Serialize};

/// Application configuration as read from a JSON file.
///
/// All keys are optional and fall back to defaults, so a minimal config of
/// `{}` is valid:
///
/// ```json
/// {
///   "concurrency_default": 10,
///   "retry_max": 2,
///   "retry_backoff_ms": 1000,
///   "ssh_timeout_ms": 10000,
///   "cmd_timeout_ms": 30000,
///   "dns_dry_run_default": false,
///   "log_masking": true,
///   "dkim_selector": "s1",
///   "spf_template": "v=spf1 ip4:{server_ip} mx -all",
///   "dmarc_template": "v=DMARC1; p=none; rua=mailto:dmarc@{domain}"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Worker count used when a START_RUN does not specify one.
    #[serde(default = "default_concurrency")]
    pub concurrency_default: usize,

    /// Maximum completed failed attempts before a retryable error becomes
    /// terminal.
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,

    /// Base backoff for the exponential retry delay.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Connection-level timeout for SSH session establishment.
    #[serde(default = "default_ssh_timeout_ms")]
    pub ssh_timeout_ms: u64,

    /// Default per-command timeout for remote execution.
    #[serde(default = "default_cmd_timeout_ms")]
    pub cmd_timeout_ms: u64,

    /// Whether runs default to logging DNS changes instead of issuing them.
    #[serde(default)]
    pub dns_dry_run_default: bool,

    /// Master switch for secret masking of outbound text.
    #[serde(default = "default_true")]
    pub log_masking: bool,

    /// DKIM selector label; `<selector>._domainkey.<zone>` holds the key.
    #[serde(default = "default_dkim_selector")]
    pub dkim_selector: String,

    /// SPF record template. Supports `{server_ip}`, `{domain}`, `{host}`.
    #[serde(default)]
    pub spf_template: String,

    /// DMARC record template. Supports `{server_ip}`, `{domain}`, `{host}`.
    #[serde(default)]
    pub dmarc_template: String,
}

fn default_concurrency() -> usize {
    10
}

fn default_retry_max() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_ssh_timeout_ms() -> u64 {
    10_000
}

fn default_cmd_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_dkim_selector() -> String {
    "s1".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            concurrency_default: default_concurrency(),
            retry_max: default_retry_max(),
            retry_backoff_ms: default_retry_backoff_ms(),
            ssh_timeout_ms: default_ssh_timeout_ms(),
            cmd_timeout_ms: default_cmd_timeout_ms(),
            dns_dry_run_default: false,
            log_masking: true,
            dkim_selector: default_dkim_selector(),
            spf_template: String::new(),
            dmarc_template: String::new(),
        }
    }
}

/// One target server, parsed from a fleet CSV row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRow {
    pub row_id: i64,
    pub cf_api_token: String,
    pub cf_zone: String,
    pub server_ip: String,
    pub server_port: u16,
    pub server_user: String,
    pub server_password: String,
    pub server_key_path: String,
    pub host: String,
    pub domain: String,
    pub deploy_profile: String,
    pub email_use: String,
    pub solution: String,
}

/// The known deployment profiles.
///
/// Kept separate from [`ServerRow::deploy_profile`] (a free string): an
/// unknown tag must fail the `deploy_mailstack` step, not CSV parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployProfile {
    PostfixDovecot,
    DockerMailserver,
}

impl DeployProfile {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "postfix_dovecot" => Some(DeployProfile::PostfixDovecot),
            "docker_mailserver" => Some(DeployProfile::DockerMailserver),
            _ => None,
        }
    }

    /// Services the health check inspects for this profile.
    pub fn services(self) -> &'static [&'static str] {
        match self {
            DeployProfile::PostfixDovecot => &["postfix", "dovecot"],
            DeployProfile::DockerMailserver => &["docker"],
        }
    }
}
