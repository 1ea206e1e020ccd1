use crate::queue::ConflictAction;
use anyhow::{bail, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub transfers: TransferConfig,
    #[serde(default)]
    pub bookmarks: Vec<Bookmark>,
}

/// Connection pool tuning, shared by every endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Handshakes allowed in flight at once, across all endpoints.
    #[serde(default = "default_max_startups")]
    pub max_startups: usize,
    /// How long a released pooled connection stays open waiting for reuse.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Pooled connections per endpoint; `None` is unbounded.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

fn default_max_startups() -> usize {
    7
}

fn default_idle_timeout_ms() -> u64 {
    2000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_startups: default_max_startups(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_connections: None,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Explicit cap on items in flight per queue, on top of the pool limit.
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    /// Answer applied to every conflict without asking.
    #[serde(default)]
    pub on_conflict: Option<ConflictAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub max_connections: Option<usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Protocol {
    Local,
    Sftp,
    Ftp,
    S3,
}

impl Protocol {
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Local => "file",
            Protocol::Sftp => "sftp",
            Protocol::Ftp => "ftp",
            Protocol::S3 => "s3",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Local => 0,
            Protocol::Sftp => 22,
            Protocol::Ftp => 21,
            Protocol::S3 => 443,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "local" => Ok(Protocol::Local),
            "sftp" | "ssh" => Ok(Protocol::Sftp),
            "ftp" => Ok(Protocol::Ftp),
            "s3" => Ok(Protocol::S3),
            other => bail!("unsupported scheme '{}'", other),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        if let Some(config_path) = Self::config_path() {
            if config_path.exists() {
                let content = fs::read_to_string(config_path)?;
                let config: Config = serde_json::from_str(&content)?;
                return Ok(config);
            }
        }
        Ok(Self::default())
    }

    pub fn save(&self) -> Result<()> {
        if let Some(config_path) = Self::config_path() {
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let content = serde_json::to_string_pretty(self)?;
            fs::write(config_path, content)?;
        }
        Ok(())
    }

    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "ferryfs", "ferryfs")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    pub fn bookmark(&self, name: &str) -> Option<&Bookmark> {
        self.bookmarks.iter().find(|b| b.name == name)
    }

    /// Expands `@name/rest` into the bookmark's URI followed by `rest`.
    pub fn resolve_uri(&self, target: &str) -> String {
        let Some(reference) = target.strip_prefix('@') else {
            return target.to_string();
        };
        let (name, rest) = reference.split_once('/').unwrap_or((reference, ""));
        match self.bookmark(name) {
            Some(bookmark) if rest.is_empty() => bookmark.uri.clone(),
            Some(bookmark) => format!("{}/{}", bookmark.uri.trim_end_matches('/'), rest),
            None => target.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool.max_startups, 7);
        assert_eq!(config.pool.idle_timeout(), Duration::from_millis(2000));
        assert_eq!(config.pool.max_connections, None);
        assert_eq!(config.transfers.max_concurrent, None);
        assert!(config.bookmarks.is_empty());
    }

    #[test]
    fn test_protocol_serialization() {
        let ftp_json = serde_json::to_string(&Protocol::Ftp).unwrap();
        let sftp_json = serde_json::to_string(&Protocol::Sftp).unwrap();

        assert_eq!(ftp_json, "\"Ftp\"");
        assert_eq!(sftp_json, "\"Sftp\"");

        let decoded: Protocol = serde_json::from_str(&sftp_json).unwrap();
        assert_eq!(decoded, Protocol::Sftp);
    }

    #[test]
    fn test_protocol_from_scheme() {
        assert_eq!("sftp".parse::<Protocol>().unwrap(), Protocol::Sftp);
        assert_eq!("FTP".parse::<Protocol>().unwrap(), Protocol::Ftp);
        assert_eq!("file".parse::<Protocol>().unwrap(), Protocol::Local);
        assert!("smb".parse::<Protocol>().is_err());
        assert_eq!(Protocol::S3.default_port(), 443);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "pool": { "max_connections": 4 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.pool.max_connections, Some(4));
        assert_eq!(config.pool.max_startups, 7);
        assert_eq!(config.pool.idle_timeout_ms, 2000);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config {
            transfers: TransferConfig {
                max_concurrent: Some(3),
                on_conflict: Some(ConflictAction::Skip),
            },
            bookmarks: vec![Bookmark {
                name: "nas".to_string(),
                uri: "sftp://alice@10.0.0.1:22/srv".to_string(),
                max_connections: Some(2),
            }],
            ..Config::default()
        };

        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("10.0.0.1"));
        assert!(json.contains("skip"));

        let decoded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.transfers.on_conflict, Some(ConflictAction::Skip));
        assert_eq!(decoded.bookmarks, config.bookmarks);
    }

    #[test]
    fn test_resolve_uri() {
        let mut config = Config::default();
        config.bookmarks.push(Bookmark {
            name: "nas".to_string(),
            uri: "sftp://alice@nas:22/srv/".to_string(),
            max_connections: None,
        });

        assert_eq!(config.resolve_uri("@nas"), "sftp://alice@nas:22/srv/");
        assert_eq!(
            config.resolve_uri("@nas/photos"),
            "sftp://alice@nas:22/srv/photos"
        );
        assert_eq!(config.resolve_uri("@other/x"), "@other/x");
        assert_eq!(config.resolve_uri("/tmp"), "/tmp");
    }
}
