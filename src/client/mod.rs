pub mod ftp;
pub mod local;
pub mod s3;
pub mod sftp;

use crate::config::Protocol;
use crate::error::ConnectionError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Identity of an endpoint. Every registry in the crate is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionId {
    Local,
    Remote(Endpoint),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl ConnectionId {
    pub fn remote(protocol: Protocol, user: &str, host: &str, port: u16) -> Self {
        ConnectionId::Remote(Endpoint {
            protocol,
            user: user.to_string(),
            host: host.to_string(),
            port,
        })
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ConnectionId::Local)
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            ConnectionId::Local => Protocol::Local,
            ConnectionId::Remote(endpoint) => endpoint.protocol,
        }
    }

    /// Full URI of `path` on this endpoint.
    pub fn uri(&self, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        match self {
            ConnectionId::Local => format!("file://{}", path),
            ConnectionId::Remote(_) => format!("{}{}", self, path),
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionId::Local => f.write_str("local"),
            ConnectionId::Remote(endpoint) => write!(
                f,
                "{}://{}@{}:{}",
                endpoint.protocol.scheme(),
                endpoint.user,
                endpoint.host,
                endpoint.port
            ),
        }
    }
}

/// Splits `sftp://alice@host:2222/srv/data` into its connection id and path.
/// Anything without a scheme is a local path.
pub fn parse_uri(uri: &str) -> std::result::Result<(ConnectionId, String), ConnectionError> {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return Ok((ConnectionId::Local, uri.to_string()));
    };
    let protocol: Protocol = scheme
        .parse()
        .map_err(|_| ConnectionError::UnsupportedScheme(scheme.to_string()))?;
    if protocol == Protocol::Local {
        return Ok((ConnectionId::Local, rest.to_string()));
    }

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (user, host_port) = match authority.rsplit_once('@') {
        Some((user, host_port)) => (user, host_port),
        None => ("", authority),
    };
    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ConnectionError::InvalidUri(uri.to_string()))?;
            (host, port)
        }
        None => (host_port, protocol.default_port()),
    };
    if host.is_empty() {
        return Err(ConnectionError::InvalidUri(uri.to_string()));
    }
    Ok((ConnectionId::remote(protocol, user, host, port), path))
}

/// One directory entry as reported by `ls`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileItem {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    /// Unix mode bits, where the protocol reports them.
    pub permissions: Option<u32>,
    pub symlink_target: Option<String>,
    /// Filled in by the connection manager when listing.
    pub uri: Option<String>,
}

impl FileItem {
    pub fn file(path: &str, size: u64) -> Self {
        Self {
            name: crate::utils::basename(path).to_string(),
            path: path.to_string(),
            is_dir: false,
            size,
            modified: None,
            owner: None,
            permissions: None,
            symlink_target: None,
            uri: None,
        }
    }

    pub fn dir(path: &str) -> Self {
        Self {
            is_dir: true,
            ..Self::file(path, 0)
        }
    }
}

/// What an adapter supports natively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub server_side_copy: bool,
    pub rename: bool,
    pub permissions: bool,
}

#[derive(Debug, Clone, Default)]
pub enum Credential {
    #[default]
    None,
    Password(SecretString),
    KeyFile {
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
}

impl Credential {
    pub fn password(password: impl Into<String>) -> Self {
        Credential::Password(SecretString::from(password.into()))
    }
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn opened(&self) -> bool;
    fn capabilities(&self) -> Capabilities;
    async fn pwd(&self) -> Result<String>;
    async fn ls(&self, dir: &str) -> Result<Vec<FileItem>>;
    async fn get(&self, remote_path: &str, local_path: &Path) -> Result<()>;
    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<()>;
    async fn rm(&self, path: &str, recursive: bool) -> Result<()>;
    async fn mkdir(&self, path: &str) -> Result<()>;
    async fn mv(&self, from: &str, to: &str) -> Result<()>;
    async fn cp(&self, from: &str, to: &str, recursive: bool) -> Result<()>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
}

/// Builds the adapter for a connection id from its protocol tag.
pub trait ClientFactory: Send + Sync {
    fn create(
        &self,
        id: &ConnectionId,
        credential: &Credential,
    ) -> std::result::Result<Arc<dyn FileSystem>, ConnectionError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClientFactory;

impl ClientFactory for DefaultClientFactory {
    fn create(
        &self,
        id: &ConnectionId,
        credential: &Credential,
    ) -> std::result::Result<Arc<dyn FileSystem>, ConnectionError> {
        let endpoint = match id {
            ConnectionId::Local => return Ok(Arc::new(local::LocalClient::new())),
            ConnectionId::Remote(endpoint) => endpoint.clone(),
        };
        match endpoint.protocol {
            Protocol::Sftp => Ok(Arc::new(sftp::SftpClient::new(endpoint, credential.clone()))),
            Protocol::Ftp => Ok(Arc::new(ftp::FtpClient::new(endpoint, credential.clone()))),
            Protocol::S3 => Ok(Arc::new(s3::S3Client::new(endpoint, credential.clone()))),
            Protocol::Local => Err(ConnectionError::UnsupportedScheme(format!(
                "{} cannot be served by a remote endpoint",
                id
            ))),
        }
    }
}
