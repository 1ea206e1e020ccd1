//! SFTP adapter on top of libssh2.
//!
//! libssh2 is blocking, so every call runs on the blocking pool with the
//! session behind a mutex, the same way the FTP adapter drives suppaftp.

use super::{Capabilities, Credential, Endpoint, FileItem, FileSystem};
use crate::utils::join;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use ssh2::{FileStat, Session, Sftp};
use std::io::{self, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct SftpSession {
    session: Session,
    sftp: Sftp,
}

pub struct SftpClient {
    endpoint: Endpoint,
    credential: Credential,
    conn: Arc<Mutex<Option<SftpSession>>>,
}

impl SftpClient {
    pub fn new(endpoint: Endpoint, credential: Credential) -> Self {
        Self {
            endpoint,
            credential,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    fn connect(endpoint: &Endpoint, credential: &Credential) -> Result<SftpSession> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .with_context(|| format!("connecting to {}:{}", endpoint.host, endpoint.port))?;

        let mut session = Session::new()?;
        session.set_tcp_stream(stream);
        session.handshake().context("SSH handshake failed")?;

        let auth = match credential {
            Credential::Password(password) => {
                session.userauth_password(&endpoint.user, password.expose_secret())
            }
            Credential::KeyFile { path, passphrase } => session.userauth_pubkey_file(
                &endpoint.user,
                None,
                path,
                passphrase.as_ref().map(|p| p.expose_secret()),
            ),
            Credential::None => session.userauth_agent(&endpoint.user),
        };
        auth.with_context(|| format!("authentication failed for user '{}'", endpoint.user))?;

        if !session.authenticated() {
            bail!("authentication failed for user '{}'", endpoint.user);
        }

        let sftp = session.sftp().context("failed to start SFTP subsystem")?;
        Ok(SftpSession { session, sftp })
    }

    async fn with_sftp<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let session = guard
                .as_ref()
                .ok_or_else(|| anyhow!("SFTP session is not open"))?;
            op(&session.sftp)
        })
        .await?
    }

    fn to_item(sftp: &Sftp, path: &str, stat: &FileStat) -> FileItem {
        let mut item = if stat.is_dir() {
            FileItem::dir(path)
        } else {
            FileItem::file(path, stat.size.unwrap_or(0))
        };
        item.modified = stat
            .mtime
            .and_then(|mtime| Utc.timestamp_opt(mtime as i64, 0).single());
        item.permissions = stat.perm.map(|perm| perm & 0o7777);
        item.owner = stat.uid.map(|uid| uid.to_string());
        if stat.file_type().is_symlink() {
            item.symlink_target = sftp
                .readlink(Path::new(path))
                .ok()
                .map(|target| target.to_string_lossy().into_owned());
        }
        item
    }

    fn list_dir(sftp: &Sftp, dir: &str) -> Result<Vec<FileItem>> {
        let entries = sftp
            .readdir(Path::new(dir))
            .with_context(|| format!("listing {}", dir))?;
        let mut items: Vec<FileItem> = entries
            .iter()
            .filter_map(|(entry_path, stat)| {
                let name = entry_path.file_name()?.to_string_lossy().into_owned();
                if name == "." || name == ".." {
                    return None;
                }
                Some(Self::to_item(sftp, &join(dir, &name), stat))
            })
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    fn remove_tree(sftp: &Sftp, dir: &str) -> Result<()> {
        for item in Self::list_dir(sftp, dir)? {
            if item.is_dir && item.symlink_target.is_none() {
                Self::remove_tree(sftp, &item.path)?;
            } else {
                sftp.unlink(Path::new(&item.path))
                    .with_context(|| format!("removing {}", item.path))?;
            }
        }
        sftp.rmdir(Path::new(dir))
            .with_context(|| format!("removing {}", dir))?;
        Ok(())
    }

    fn copy_file(sftp: &Sftp, from: &str, to: &str) -> Result<()> {
        let mut src = sftp
            .open(Path::new(from))
            .with_context(|| format!("opening {}", from))?;
        let mut dst = sftp
            .create(Path::new(to))
            .with_context(|| format!("creating {}", to))?;
        io::copy(&mut src, &mut dst)?;
        Ok(())
    }

    fn copy_tree(sftp: &Sftp, from: &str, to: &str) -> Result<()> {
        sftp.mkdir(Path::new(to), 0o755)
            .with_context(|| format!("creating {}", to))?;
        for item in Self::list_dir(sftp, from)? {
            let target = join(to, &item.name);
            if item.is_dir {
                Self::copy_tree(sftp, &item.path, &target)?;
            } else {
                Self::copy_file(sftp, &item.path, &target)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FileSystem for SftpClient {
    async fn open(&self) -> Result<()> {
        let endpoint = self.endpoint.clone();
        let credential = self.credential.clone();
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let session = Self::connect(&endpoint, &credential)?;
            *conn.lock() = Some(session);
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let taken = conn.lock().take();
            if let Some(SftpSession { session, sftp }) = taken {
                drop(sftp);
                session.disconnect(None, "closing", None)?;
            }
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(())
    }

    fn opened(&self) -> bool {
        self.conn.lock().is_some()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            server_side_copy: false,
            rename: true,
            permissions: true,
        }
    }

    async fn pwd(&self) -> Result<String> {
        self.with_sftp(|sftp| {
            let cwd = sftp.realpath(Path::new("."))?;
            Ok(cwd.to_string_lossy().into_owned())
        })
        .await
    }

    async fn ls(&self, dir: &str) -> Result<Vec<FileItem>> {
        let dir = dir.to_string();
        self.with_sftp(move |sftp| Self::list_dir(sftp, &dir)).await
    }

    async fn get(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let remote_path = remote_path.to_string();
        let local_path: PathBuf = local_path.to_path_buf();
        self.with_sftp(move |sftp| {
            let mut src = sftp
                .open(Path::new(&remote_path))
                .with_context(|| format!("opening {}", remote_path))?;
            let mut dst = std::fs::File::create(&local_path)
                .with_context(|| format!("creating {}", local_path.display()))?;
            io::copy(&mut src, &mut dst)?;
            Ok(())
        })
        .await
    }

    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let remote_path = remote_path.to_string();
        let local_path: PathBuf = local_path.to_path_buf();
        self.with_sftp(move |sftp| {
            let mut src = std::fs::File::open(&local_path)
                .with_context(|| format!("opening {}", local_path.display()))?;
            let mut dst = sftp
                .create(Path::new(&remote_path))
                .with_context(|| format!("creating {}", remote_path))?;
            io::copy(&mut src, &mut dst)?;
            Ok(())
        })
        .await
    }

    async fn rm(&self, path: &str, recursive: bool) -> Result<()> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            let stat = sftp
                .lstat(Path::new(&path))
                .with_context(|| format!("stat {}", path))?;
            if !stat.is_dir() {
                sftp.unlink(Path::new(&path))
                    .with_context(|| format!("removing {}", path))?;
            } else if recursive {
                Self::remove_tree(sftp, &path)?;
            } else {
                sftp.rmdir(Path::new(&path))
                    .with_context(|| format!("removing {}", path))?;
            }
            Ok(())
        })
        .await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            sftp.mkdir(Path::new(&path), 0o755)
                .with_context(|| format!("creating {}", path))?;
            Ok(())
        })
        .await
    }

    async fn mv(&self, from: &str, to: &str) -> Result<()> {
        let from = from.to_string();
        let to = to.to_string();
        self.with_sftp(move |sftp| {
            sftp.rename(Path::new(&from), Path::new(&to), None)
                .with_context(|| format!("moving {} to {}", from, to))?;
            Ok(())
        })
        .await
    }

    async fn cp(&self, from: &str, to: &str, recursive: bool) -> Result<()> {
        let from = from.to_string();
        let to = to.to_string();
        self.with_sftp(move |sftp| {
            let stat = sftp
                .stat(Path::new(&from))
                .with_context(|| format!("stat {}", from))?;
            match (stat.is_dir(), recursive) {
                (false, _) => Self::copy_file(sftp, &from, &to),
                (true, true) => Self::copy_tree(sftp, &from, &to),
                (true, false) => bail!("{} is a directory", from),
            }
        })
        .await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = path.to_string();
        let content = content.to_vec();
        self.with_sftp(move |sftp| {
            let mut file = sftp
                .create(Path::new(&path))
                .with_context(|| format!("creating {}", path))?;
            file.write_all(&content)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    fn endpoint() -> Endpoint {
        Endpoint {
            protocol: Protocol::Sftp,
            user: "alice".to_string(),
            host: "localhost".to_string(),
            port: 22,
        }
    }

    #[test]
    fn test_sftp_client_starts_closed() {
        let client = SftpClient::new(endpoint(), Credential::password("secret"));
        assert!(!client.opened());
        assert!(client.capabilities().permissions);
    }

    #[tokio::test]
    async fn test_operations_fail_before_open() {
        let client = SftpClient::new(endpoint(), Credential::None);
        let err = client.mkdir("/tmp/x").await.unwrap_err();
        assert!(err.to_string().contains("not open"));
    }

    #[tokio::test]
    async fn test_close_without_open_is_noop() {
        let client = SftpClient::new(endpoint(), Credential::None);
        assert!(client.close().await.is_ok());
    }
}
