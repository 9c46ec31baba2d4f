use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Machine-control (QMP) endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub socket_path: PathBuf,
    /// `host:port`; when set it is used instead of `socket_path`
    pub tcp_address: Option<String>,
    pub handshake_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    /// Asynchronous events kept for `take_events`; older ones are dropped
    pub event_backlog: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("vm/qmp.sock"),
            tcp_address: None,
            handshake_timeout_ms: 5_000,
            reply_timeout_ms: 30_000, // loadvm of a large image is slow
            event_backlog: 256,
        }
    }
}

impl ControlConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Debug-stub (GDB remote protocol) endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Transfer ceiling for a single memory read packet
    pub chunk_size: usize,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1234,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 10_000,
            chunk_size: 4096,
        }
    }
}

impl DebugConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Default pacing and output locations for capture sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub captures_dir: PathBuf,
    pub golden_dir: PathBuf,
    pub settle_ms: u64,
    pub key_delay_ms: u64,
    /// Pause after the last key before halting
    pub wait_ms: u64,
    pub key_hold_ms: u32,
    pub stop_timeout_ms: u64,
    pub breakpoint_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            captures_dir: PathBuf::from("captures"),
            golden_dir: PathBuf::from("golden"),
            settle_ms: 1_000,
            key_delay_ms: 150,
            wait_ms: 2_000,
            key_hold_ms: 100,
            stop_timeout_ms: 5_000,
            breakpoint_timeout_ms: 60_000,
        }
    }
}

impl CaptureConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn key_delay(&self) -> Duration {
        Duration::from_millis(self.key_delay_ms)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn key_hold(&self) -> Duration {
        Duration::from_millis(self.key_hold_ms as u64)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn breakpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.breakpoint_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub control: ControlConfig,
    pub debug: DebugConfig,
    pub capture: CaptureConfig,
}

impl HarnessConfig {
    /// Load from a JSON file. A missing file yields the defaults; a file that
    /// exists but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.control.socket_path, PathBuf::from("vm/qmp.sock"));
        assert_eq!(config.debug.address(), "localhost:1234");
        assert_eq!(config.debug.chunk_size, 4096);
        assert_eq!(config.debug.read_timeout(), Duration::from_secs(10));
        assert_eq!(config.capture.breakpoint_timeout(), Duration::from_secs(60));
        assert_eq!(config.capture.key_delay(), Duration::from_millis(150));
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let config: HarnessConfig =
            serde_json::from_str(r#"{"debug": {"port": 5555}, "capture": {"settle_ms": 250}}"#)
                .unwrap();
        assert_eq!(config.debug.port, 5555);
        assert_eq!(config.debug.host, "localhost");
        assert_eq!(config.capture.settle(), Duration::from_millis(250));
        assert_eq!(config.control, ControlConfig::default());
    }

    #[test]
    fn test_save_load_and_missing_file() {
        let dir = std::env::temp_dir().join(format!("probe_config_{}", std::process::id()));
        let path = dir.join("dosprobe.json");

        assert_eq!(HarnessConfig::load(&path).unwrap(), HarnessConfig::default());

        let mut config = HarnessConfig::default();
        config.control.tcp_address = Some("127.0.0.1:4444".to_string());
        config.debug.chunk_size = 1024;
        config.save(&path).unwrap();

        let loaded = HarnessConfig::load(&path).unwrap();
        assert_eq!(loaded, config);

        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            HarnessConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));

        fs::remove_dir_all(&dir).unwrap();
    }
}
