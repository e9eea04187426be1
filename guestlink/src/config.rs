use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Host-side client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Upper bound on waiting for one response.
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Bytes per FileRead/FileWrite request.
    pub file_chunk_size: usize,
    /// Bytes per UpdateChunk request, before base64.
    pub update_chunk_size: usize,
    /// Events buffered per subscriber before new ones are dropped.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            file_chunk_size: 1024 * 1024,
            update_chunk_size: 512 * 1024,
            event_buffer: 256,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: ClientConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.request_timeout_secs >= 1, "request_timeout_secs must be >= 1");
        anyhow::ensure!(self.connect_timeout_secs >= 1, "connect_timeout_secs must be >= 1");
        // Base64 inflates by 4/3; keep a chunk well inside one frame.
        let max_chunk = (guestlink_protocol::MAX_MESSAGE_SIZE / 2) as usize;
        anyhow::ensure!(
            (1..=max_chunk).contains(&self.file_chunk_size),
            "file_chunk_size must be between 1 and {max_chunk}"
        );
        anyhow::ensure!(
            (1..=max_chunk).contains(&self.update_chunk_size),
            "update_chunk_size must be between 1 and {max_chunk}"
        );
        anyhow::ensure!(self.event_buffer >= 1, "event_buffer must be >= 1");
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_partial_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "request_timeout_secs = 5\nfile_chunk_size = 4096").unwrap();
        let config = ClientConfig::load(f.path()).unwrap();
        assert_eq!(config.request_timeout_secs, 5);
        assert_eq!(config.file_chunk_size, 4096);
        assert_eq!(config.event_buffer, 256);
    }

    #[test]
    fn test_rejects_chunk_larger_than_frame() {
        let config = ClientConfig {
            update_chunk_size: guestlink_protocol::MAX_MESSAGE_SIZE as usize,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
