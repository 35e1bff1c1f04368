// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server configuration: clap flags with environment fallbacks, layered
//! over an optional TOML file. Precedence is file < env < flag.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug, Clone)]
#[command(name = "agentbridge-server", version, about = "Mediates remote clients and local agent subprocesses.")]
pub struct ServerConfig {
    /// Optional TOML file providing defaults; CLI flags and env vars override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0", env = "AGENTBRIDGE_HOST")]
    pub host: String,

    #[arg(long, default_value_t = 7420, env = "AGENTBRIDGE_PORT")]
    pub port: u16,

    /// HTTP path the WebSocket upgrade is served on.
    #[arg(long, default_value = "/ws", env = "AGENTBRIDGE_WS_PATH")]
    pub ws_path: String,

    #[arg(long, env = "AGENTBRIDGE_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "AGENTBRIDGE_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    #[arg(long, default_value = "1.2", env = "AGENTBRIDGE_TLS_MIN_VERSION")]
    pub tls_min_version: String,

    /// Comma-separated rustls cipher suite names; empty means the default
    /// provider suite set.
    #[arg(long, env = "AGENTBRIDGE_TLS_CIPHER_SUITES")]
    pub tls_cipher_suites: Option<String>,

    #[arg(long, default_value = "./data", env = "AGENTBRIDGE_DATA_DIR")]
    pub data_dir: PathBuf,

    #[arg(long, default_value_t = 1024, env = "AGENTBRIDGE_MAX_CONNECTIONS")]
    pub max_connections: usize,

    /// Max new connections accepted from a single source address per
    /// rolling minute; zero disables the check.
    #[arg(long, default_value_t = 120, env = "AGENTBRIDGE_CONNECTION_RATE_PER_MINUTE")]
    pub connection_rate_per_minute: u32,

    #[arg(long, default_value_t = 256, env = "AGENTBRIDGE_MAX_PROJECTS")]
    pub max_projects: usize,

    #[arg(long, default_value_t = 1_048_576, env = "AGENTBRIDGE_MESSAGE_SIZE_LIMIT")]
    pub message_size_limit: usize,

    #[arg(long, default_value_t = 600, env = "AGENTBRIDGE_EXECUTION_TIMEOUT_SECS")]
    pub execution_timeout_secs: u64,

    #[arg(long, default_value_t = 1_800, env = "AGENTBRIDGE_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: u64,

    #[arg(long, default_value_t = 30, env = "AGENTBRIDGE_PING_INTERVAL_SECS")]
    pub ping_interval_secs: u64,

    #[arg(long, default_value_t = 10, env = "AGENTBRIDGE_PONG_TIMEOUT_SECS")]
    pub pong_timeout_secs: u64,

    #[arg(long, default_value_t = 8_388_608, env = "AGENTBRIDGE_LOG_ROTATION_SIZE")]
    pub log_rotation_size: u64,

    #[arg(long, default_value_t = 10_000, env = "AGENTBRIDGE_LOG_ROTATION_COUNT")]
    pub log_rotation_count: u64,

    #[arg(long, default_value_t = false, env = "AGENTBRIDGE_LOG_ROTATION_COMPRESS")]
    pub log_rotation_compress: bool,

    #[arg(long, default_value = "claude", env = "AGENTBRIDGE_CLAUDE_BINARY")]
    pub claude_binary: PathBuf,

    #[arg(long, env = "AGENTBRIDGE_CLAUDE_DEFAULT_MODEL")]
    pub claude_default_model: Option<String>,

    #[arg(long, env = "AGENTBRIDGE_CLAUDE_ALLOWED_TOOLS")]
    pub claude_allowed_tools: Option<String>,

    #[arg(long, default_value = "default", env = "AGENTBRIDGE_CLAUDE_PERMISSION_MODE")]
    pub claude_permission_mode: String,

    /// Colon-separated path prefixes; projects outside all of them are rejected.
    #[arg(long, env = "AGENTBRIDGE_ALLOWED_PROJECT_PATHS")]
    pub allowed_project_paths: Option<String>,

    /// `json` or `text`.
    #[arg(long, default_value = "text", env = "AGENTBRIDGE_LOG_FORMAT")]
    pub log_format: String,

    /// Graceful-shutdown drain deadline before force-killing executions.
    #[arg(long, default_value_t = 10, env = "AGENTBRIDGE_SHUTDOWN_DRAIN_SECS")]
    pub shutdown_drain_secs: u64,
}

/// The subset of fields a TOML config file may supply as defaults.
#[derive(Debug, Default, Deserialize)]
struct FileDefaults {
    host: Option<String>,
    port: Option<u16>,
    ws_path: Option<String>,
    tls_cert: Option<PathBuf>,
    tls_key: Option<PathBuf>,
    tls_min_version: Option<String>,
    tls_cipher_suites: Option<String>,
    data_dir: Option<PathBuf>,
    max_connections: Option<usize>,
    connection_rate_per_minute: Option<u32>,
    max_projects: Option<usize>,
    message_size_limit: Option<usize>,
    execution_timeout_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
    ping_interval_secs: Option<u64>,
    pong_timeout_secs: Option<u64>,
    log_rotation_size: Option<u64>,
    log_rotation_count: Option<u64>,
    log_rotation_compress: Option<bool>,
    claude_binary: Option<PathBuf>,
    claude_default_model: Option<String>,
    claude_allowed_tools: Option<String>,
    claude_permission_mode: Option<String>,
    allowed_project_paths: Option<String>,
    log_format: Option<String>,
    shutdown_drain_secs: Option<u64>,
}

impl ServerConfig {
    /// Applies a TOML file's values for any field still at its clap
    /// default — flags and env vars (already resolved by clap) always win.
    pub fn apply_file_defaults(mut self) -> anyhow::Result<Self> {
        let Some(path) = self.config.clone() else { return Ok(self) };
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
        let file: FileDefaults = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

        let default = ServerConfig::parse_from(["agentbridge-server"]);

        macro_rules! layer {
            ($field:ident) => {
                if self.$field == default.$field {
                    if let Some(v) = file.$field.clone() {
                        self.$field = v;
                    }
                }
            };
        }
        layer!(host);
        layer!(port);
        layer!(ws_path);
        layer!(tls_min_version);
        layer!(data_dir);
        layer!(max_connections);
        layer!(connection_rate_per_minute);
        layer!(max_projects);
        layer!(message_size_limit);
        layer!(execution_timeout_secs);
        layer!(idle_timeout_secs);
        layer!(ping_interval_secs);
        layer!(pong_timeout_secs);
        layer!(log_rotation_size);
        layer!(log_rotation_count);
        layer!(log_rotation_compress);
        layer!(claude_binary);
        layer!(claude_permission_mode);
        layer!(log_format);
        layer!(shutdown_drain_secs);

        if self.tls_cert.is_none() {
            self.tls_cert = file.tls_cert;
        }
        if self.tls_key.is_none() {
            self.tls_key = file.tls_key;
        }
        if self.tls_cipher_suites.is_none() {
            self.tls_cipher_suites = file.tls_cipher_suites;
        }
        if self.claude_default_model.is_none() {
            self.claude_default_model = file.claude_default_model;
        }
        if self.claude_allowed_tools.is_none() {
            self.claude_allowed_tools = file.claude_allowed_tools;
        }
        if self.allowed_project_paths.is_none() {
            self.allowed_project_paths = file.allowed_project_paths;
        }

        Ok(self)
    }

    /// Cross-field validation beyond what clap's per-field parsing covers.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            anyhow::bail!("tls_cert and tls_key must both be set, or both omitted");
        }
        if !matches!(self.tls_min_version.as_str(), "1.2" | "1.3") {
            anyhow::bail!("tls_min_version must be \"1.2\" or \"1.3\"");
        }
        if self.message_size_limit == 0 {
            anyhow::bail!("message_size_limit must be greater than zero");
        }
        Ok(())
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_secs)
    }

    pub fn allowed_project_path_list(&self) -> Vec<PathBuf> {
        self.allowed_project_paths
            .as_deref()
            .map(|s| s.split(':').filter(|p| !p.is_empty()).map(PathBuf::from).collect())
            .unwrap_or_default()
    }

    pub fn tls_cipher_suite_names(&self) -> Vec<String> {
        self.tls_cipher_suites
            .as_deref()
            .map(|s| s.split(',').filter(|c| !c.is_empty()).map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn claude_allowed_tool_list(&self) -> Option<Vec<String>> {
        self.claude_allowed_tools
            .as_deref()
            .map(|s| s.split(',').filter(|t| !t.is_empty()).map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_mismatched_tls_pair() {
        let mut cfg = ServerConfig::parse_from(["agentbridge-server"]);
        cfg.tls_cert = Some(PathBuf::from("cert.pem"));
        cfg.tls_key = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_tls_version() {
        let mut cfg = ServerConfig::parse_from(["agentbridge-server"]);
        cfg.tls_min_version = "1.1".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn allowed_project_path_list_splits_on_colon() {
        let mut cfg = ServerConfig::parse_from(["agentbridge-server"]);
        cfg.allowed_project_paths = Some("/home/a:/home/b".to_string());
        assert_eq!(cfg.allowed_project_path_list(), vec![PathBuf::from("/home/a"), PathBuf::from("/home/b")]);
    }
}
