//! Configuration file for the demo pool server.
//!
//! ```json
//! {
//!   "server": { "host": "127.0.0.1", "port": 5000 },
//!   "processes": 2,
//!   "worker_ids": ["a", "b"],
//!   "request_timeout_ms": 10000
//! }
//! ```
//!
//! `server.port` is required. Workers beyond `worker_ids` are named by pid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::bridge::protocol::WorkerId;
use crate::master::MasterConfig;
use crate::transport::ServerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DemoConfig {
    pub server: ServerSection,
    #[serde(default = "default_processes")]
    pub processes: usize,
    #[serde(default)]
    pub worker_ids: Vec<String>,
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

fn default_processes() -> usize {
    1
}

fn default_host() -> String {
    ServerConfig::default().host
}

impl DemoConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
        }
    }

    pub fn master_config(&self) -> MasterConfig {
        let config = MasterConfig::default();
        match self.request_timeout_ms {
            Some(ms) => config.with_request_timeout(Duration::from_millis(ms)),
            None => config,
        }
    }

    /// One entry per process; `None` where no id was configured.
    pub fn worker_ids(&self) -> Vec<Option<WorkerId>> {
        (0..self.processes)
            .map(|i| self.worker_ids.get(i).map(|id| WorkerId::from(id.as_str())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = DemoConfig::from_json(r#"{"server": {"port": 8080}}"#).unwrap();

        assert_eq!(config.processes, 1);
        let server = config.server_config();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8080);
        assert_eq!(
            config.master_config().request_timeout,
            Duration::from_secs(10)
        );
        assert_eq!(config.worker_ids(), vec![None]);
    }

    #[test]
    fn missing_port_is_rejected() {
        let err = DemoConfig::from_json(r#"{"server": {}, "processes": 2}"#).unwrap_err();
        assert!(err.to_string().contains("port"), "{}", err);
    }

    #[test]
    fn missing_server_is_rejected() {
        assert!(DemoConfig::from_json(r#"{"processes": 2}"#).is_err());
    }

    #[test]
    fn worker_ids_pad_with_none() {
        let config = DemoConfig::from_json(
            r#"{"server": {"port": 1}, "processes": 3, "worker_ids": ["a", "b"]}"#,
        )
        .unwrap();

        assert_eq!(
            config.worker_ids(),
            vec![Some(WorkerId::from("a")), Some(WorkerId::from("b")), None]
        );
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"server": {{"host": "127.0.0.1", "port": 5001}}, "processes": 2, "request_timeout_ms": 250}}"#
        )
        .unwrap();

        let config = DemoConfig::load(file.path()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.processes, 2);
        assert_eq!(
            config.master_config().request_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn load_missing_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");

        let err = DemoConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("absent.json"));
    }
}
