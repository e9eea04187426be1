use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "GUESTLINK_AGENT_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/guestlink/agent.toml";

/// Top-level configuration for the guest agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Fallback log filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub transport: TransportConfig,
    pub security: SecurityConfig,
    pub telemetry: TelemetryConfig,
    pub exec: ExecConfig,
    pub files: FilesConfig,
    pub quiesce: QuiesceConfig,
    pub update: UpdateConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing config: {}", path.display()))
    }

    /// Load from `$GUESTLINK_AGENT_CONFIG` or the default path, falling back
    /// to built-in defaults when no file exists.
    pub fn load_default() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        if path.exists() {
            Self::load(&path)
        } else {
            Self::from_toml("")
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: AgentConfig = toml::from_str(content)?;
        if config.log_level.is_empty() {
            config.log_level = "info".into();
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.transport.reconnect_initial_ms >= 1,
            "transport.reconnect_initial_ms must be >= 1"
        );
        anyhow::ensure!(
            self.transport.reconnect_max_ms >= self.transport.reconnect_initial_ms,
            "transport.reconnect_max_ms must be >= transport.reconnect_initial_ms"
        );
        anyhow::ensure!(
            self.telemetry.interval_secs >= 1,
            "telemetry.interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.exec.max_timeout_secs >= 1,
            "exec.max_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.files.max_chunk_size >= 1024
                && self.files.max_chunk_size <= (guestlink_protocol::MAX_MESSAGE_SIZE / 2) as usize,
            "files.max_chunk_size must be between 1 KiB and half the frame limit"
        );
        anyhow::ensure!(
            self.files.max_dir_entries >= 1,
            "files.max_dir_entries must be >= 1"
        );
        anyhow::ensure!(
            self.update.max_chunk_size >= 1024
                && self.update.max_chunk_size <= (guestlink_protocol::MAX_MESSAGE_SIZE / 2) as usize,
            "update.max_chunk_size must be between 1 KiB and half the frame limit"
        );
        anyhow::ensure!(
            self.quiesce.max_timeout_secs >= 1 && self.quiesce.script_timeout_secs >= 1,
            "quiesce timeouts must be >= 1"
        );
        anyhow::ensure!(
            self.update.install_path.is_absolute(),
            "update.install_path must be absolute"
        );
        for (i, p) in self.security.allow_write_paths.iter().enumerate() {
            anyhow::ensure!(
                Path::new(p).is_absolute(),
                "security.allow_write_paths[{}] must be absolute: {}",
                i,
                p
            );
        }
        for (i, p) in self.security.deny_read_paths.iter().enumerate() {
            anyhow::ensure!(
                Path::new(p).is_absolute(),
                "security.deny_read_paths[{}] must be absolute: {}",
                i,
                p
            );
        }
        Ok(())
    }
}

/// Channel selection and reconnect pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Character device path, or "auto" to probe the well-known locations.
    pub device_path: String,
    /// Listen on AF_VSOCK instead of a character device.
    pub vsock_port: Option<u32>,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// Upper bound of the random delay added to each reconnect attempt.
    pub reconnect_jitter_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            device_path: "auto".into(),
            vsock_port: None,
            reconnect_initial_ms: 100,
            reconnect_max_ms: 5_000,
            reconnect_jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Programs or command prefixes that may run. Empty allows everything
    /// not on the deny list.
    pub command_allowlist: Vec<String>,
    /// Always wins over the allow list.
    pub command_denylist: Vec<String>,
    /// Writes are confined to these prefixes when non-empty.
    pub allow_write_paths: Vec<String>,
    pub deny_read_paths: Vec<String>,
    /// Shared by exec and privileged actions. 0 disables the limit.
    pub max_commands_per_minute: u32,
    /// 0 disables the limit.
    pub max_file_ops_per_second: u32,
    pub audit_logging: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            command_allowlist: Vec::new(),
            command_denylist: vec![
                "rm -rf /".into(),
                "mkfs".into(),
                "dd if=/dev/zero of=/dev/".into(),
            ],
            allow_write_paths: Vec::new(),
            deny_read_paths: vec!["/etc/shadow".into(), "/etc/gshadow".into()],
            max_commands_per_minute: 120,
            max_file_ops_per_second: 200,
            audit_logging: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Poll the clipboard and emit ClipboardChanged events.
    pub clipboard_watch: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
            clipboard_watch: false,
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Hard cap applied to every request's timeout.
    pub max_timeout_secs: u64,
    /// Per-stream output cap in bytes.
    pub max_output_bytes: u64,
    pub shell: String,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_timeout_secs: 300,
            max_output_bytes: 4 * 1024 * 1024,
            shell: "/bin/sh".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub max_chunk_size: usize,
    pub max_dir_entries: u32,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1024 * 1024,
            max_dir_entries: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuiesceConfig {
    /// Executables run (sorted by name) before freezing.
    pub pre_freeze_dir: PathBuf,
    /// Executables run (sorted by name) after thawing.
    pub post_thaw_dir: PathBuf,
    pub script_timeout_secs: u64,
    /// Upper bound for a request's auto-thaw timeout.
    pub max_timeout_secs: u64,
}

impl QuiesceConfig {
    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }
}

impl Default for QuiesceConfig {
    fn default() -> Self {
        Self {
            pre_freeze_dir: PathBuf::from("/etc/guestlink/pre-freeze.d"),
            post_thaw_dir: PathBuf::from("/etc/guestlink/post-thaw.d"),
            script_timeout_secs: 30,
            max_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Path of the installed agent binary.
    pub install_path: PathBuf,
    /// Where chunks are staged. Must share a filesystem with `install_path`
    /// so the final rename is atomic; defaults to its parent directory.
    pub staging_dir: Option<PathBuf>,
    pub max_chunk_size: usize,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            install_path: PathBuf::from("/usr/local/bin/guestlink-agent"),
            staging_dir: None,
            max_chunk_size: 1024 * 1024,
        }
    }
}

impl UpdateConfig {
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(|| {
            self.install_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.transport.device_path, "auto");
        assert_eq!(config.transport.reconnect_initial_ms, 100);
        assert_eq!(config.transport.reconnect_max_ms, 5_000);
        assert_eq!(config.telemetry.interval_secs, 5);
        assert_eq!(config.exec.max_timeout_secs, 300);
        assert_eq!(config.security.max_commands_per_minute, 120);
        assert!(config.security.command_allowlist.is_empty());
        assert!(config.security.audit_logging);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml_partial() {
        let toml = r#"
log_level = "debug"

[transport]
device_path = "/dev/vport2p1"
reconnect_max_ms = 10000

[security]
command_allowlist = ["ls", "cat"]
max_commands_per_minute = 0

[telemetry]
interval_secs = 30
"#;
        let config = AgentConfig::from_toml(toml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.transport.device_path, "/dev/vport2p1");
        assert_eq!(config.transport.reconnect_max_ms, 10_000);
        // Unset fields use defaults
        assert_eq!(config.transport.reconnect_initial_ms, 100);
        assert_eq!(config.security.command_allowlist, vec!["ls", "cat"]);
        assert_eq!(config.security.max_commands_per_minute, 0);
        assert_eq!(config.security.max_file_ops_per_second, 200);
        assert_eq!(config.telemetry.interval_secs, 30);
        assert!(config.telemetry.enabled);
    }

    #[test]
    fn test_empty_toml_is_defaults() {
        let config = AgentConfig::from_toml("").unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.files.max_dir_entries, 5000);
    }

    #[test]
    fn test_config_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[exec]\nmax_timeout_secs = 42").unwrap();
        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.exec.max_timeout_secs, 42);
    }

    #[test]
    fn test_config_load_missing_file_errors() {
        let err = AgentConfig::load(Path::new("/nonexistent/guestlink.toml")).unwrap_err();
        assert!(err.to_string().contains("reading config"));
    }

    #[test]
    fn test_validation_rejects_inverted_backoff() {
        let mut config = AgentConfig::default();
        config.transport.reconnect_initial_ms = 1000;
        config.transport.reconnect_max_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_telemetry_interval() {
        let mut config = AgentConfig::default();
        config.telemetry.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_relative_policy_paths() {
        let mut config = AgentConfig::default();
        config.security.allow_write_paths = vec!["tmp".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_tiny_chunks() {
        let mut config = AgentConfig::default();
        config.files.max_chunk_size = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_staging_dir_defaults_to_install_parent() {
        let update = UpdateConfig::default();
        assert_eq!(update.staging_dir(), PathBuf::from("/usr/local/bin"));
        let custom = UpdateConfig {
            staging_dir: Some("/var/tmp".into()),
            ..UpdateConfig::default()
        };
        assert_eq!(custom.staging_dir(), PathBuf::from("/var/tmp"));
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = AgentConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back = AgentConfig::from_toml(&text).unwrap();
        assert_eq!(back.transport.device_path, config.transport.device_path);
        assert_eq!(back.security.command_denylist, config.security.command_denylist);
        assert_eq!(back.update.install_path, config.update.install_path);
    }
}
