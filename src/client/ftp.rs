use super::{Capabilities, Credential, Endpoint, FileItem, FileSystem};
use crate::utils::join;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;
use suppaftp::types::FileType;
use suppaftp::FtpStream;

/// One authenticated FTP control connection.
pub struct FtpClient {
    endpoint: Endpoint,
    credential: Credential,
    stream: Arc<Mutex<Option<FtpStream>>>,
}

impl FtpClient {
    pub fn new(endpoint: Endpoint, credential: Credential) -> Self {
        Self {
            endpoint,
            credential,
            stream: Arc::new(Mutex::new(None)),
        }
    }

    fn connect_ftp(endpoint: &Endpoint, credential: &Credential) -> Result<FtpStream> {
        let (user, password) = match credential {
            Credential::Password(password) => {
                (endpoint.user.clone(), password.expose_secret().to_string())
            }
            Credential::None if endpoint.user.is_empty() => {
                ("anonymous".to_string(), "anonymous".to_string())
            }
            Credential::None => (endpoint.user.clone(), String::new()),
            Credential::KeyFile { .. } => bail!("FTP does not support key file authentication"),
        };

        let mut ftp = FtpStream::connect(format!("{}:{}", endpoint.host, endpoint.port))?;
        ftp.login(user.as_str(), password.as_str())?;
        ftp.transfer_type(FileType::Binary)?;
        Ok(ftp)
    }

    async fn with_stream<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T> + Send + 'static,
    {
        let stream = self.stream.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = stream.lock();
            let ftp = guard
                .as_mut()
                .ok_or_else(|| anyhow!("FTP session is not open"))?;
            op(ftp)
        })
        .await?
    }

    fn list_dir(ftp: &mut FtpStream, dir: &str) -> Result<Vec<FileItem>> {
        let lines = ftp
            .list(Some(dir))
            .with_context(|| format!("listing {}", dir))?;
        Ok(lines
            .iter()
            .filter_map(|line| FtpClient::parse_list_line(line))
            .filter(|item| item.name != "." && item.name != "..")
            .map(|mut item| {
                item.path = join(dir, &item.name);
                item
            })
            .collect())
    }

    fn remove_tree(ftp: &mut FtpStream, dir: &str) -> Result<()> {
        for item in Self::list_dir(ftp, dir)? {
            if item.is_dir {
                Self::remove_tree(ftp, &item.path)?;
            } else {
                ftp.rm(&item.path)
                    .with_context(|| format!("removing {}", item.path))?;
            }
        }
        ftp.rmdir(dir).with_context(|| format!("removing {}", dir))?;
        Ok(())
    }

    fn copy_file(ftp: &mut FtpStream, from: &str, to: &str) -> Result<()> {
        let mut reader = ftp
            .retr_as_buffer(from)
            .with_context(|| format!("reading {}", from))?;
        ftp.put_file(to, &mut reader)
            .with_context(|| format!("writing {}", to))?;
        Ok(())
    }

    fn copy_tree(ftp: &mut FtpStream, from: &str, to: &str) -> Result<()> {
        ftp.mkdir(to).with_context(|| format!("creating {}", to))?;
        for item in Self::list_dir(ftp, from)? {
            let target = join(to, &item.name);
            if item.is_dir {
                Self::copy_tree(ftp, &item.path, &target)?;
            } else {
                Self::copy_file(ftp, &item.path, &target)?;
            }
        }
        Ok(())
    }

    /// Parses one line of a unix-style `LIST` response:
    /// `drwxr-xr-x 2 owner group 4096 Nov 15 10:30 name`.
    fn parse_list_line(line: &str) -> Option<FileItem> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 9 {
            return None;
        }

        let mode = parts[0];
        let is_dir = mode.starts_with('d');
        let is_link = mode.starts_with('l');
        let size = parts[4].parse::<u64>().unwrap_or(0);
        let mut name = parts[8..].join(" ");
        let mut symlink_target = None;
        if is_link {
            if let Some((link, target)) = name.split_once(" -> ") {
                symlink_target = Some(target.to_string());
                name = link.to_string();
            }
        }

        let mut item = if is_dir {
            FileItem::dir(&name)
        } else {
            FileItem::file(&name, size)
        };
        item.name = name;
        item.owner = Some(parts[2].to_string());
        item.permissions = parse_mode(mode);
        item.modified = parse_list_date(parts[5], parts[6], parts[7]);
        item.symlink_target = symlink_target;
        Some(item)
    }
}

/// `rwxr-xr-x` (after the type character) to mode bits.
fn parse_mode(mode: &str) -> Option<u32> {
    let perms = mode.get(1..10)?;
    let bits = perms
        .chars()
        .fold(0u32, |acc, c| (acc << 1) | u32::from(c != '-'));
    Some(bits)
}

/// `Nov 15 10:30` (this year) or `Nov 15 2023`.
fn parse_list_date(month: &str, day: &str, time_or_year: &str) -> Option<chrono::DateTime<Utc>> {
    if let Some((hour, minute)) = time_or_year.split_once(':') {
        let year = Utc::now().year();
        let date = NaiveDate::parse_from_str(&format!("{} {} {}", month, day, year), "%b %d %Y").ok()?;
        let naive = date.and_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0)?;
        Some(Utc.from_utc_datetime(&naive))
    } else {
        let date =
            NaiveDate::parse_from_str(&format!("{} {} {}", month, day, time_or_year), "%b %d %Y")
                .ok()?;
        Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
    }
}

#[async_trait]
impl FileSystem for FtpClient {
    async fn open(&self) -> Result<()> {
        let endpoint = self.endpoint.clone();
        let credential = self.credential.clone();
        let stream = self.stream.clone();

        tokio::task::spawn_blocking(move || {
            let ftp = Self::connect_ftp(&endpoint, &credential)?;
            *stream.lock() = Some(ftp);
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let stream = self.stream.clone();
        tokio::task::spawn_blocking(move || {
            let taken = stream.lock().take();
            if let Some(mut ftp) = taken {
                ftp.quit()?;
            }
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(())
    }

    fn opened(&self) -> bool {
        self.stream.lock().is_some()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            server_side_copy: false,
            rename: true,
            permissions: false,
        }
    }

    async fn pwd(&self) -> Result<String> {
        self.with_stream(|ftp| Ok(ftp.pwd()?)).await
    }

    async fn ls(&self, dir: &str) -> Result<Vec<FileItem>> {
        let dir = dir.to_string();
        self.with_stream(move |ftp| Self::list_dir(ftp, &dir)).await
    }

    async fn get(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let remote_path = remote_path.to_string();
        let local_path = local_path.to_path_buf();

        let data = self
            .with_stream(move |ftp| {
                let mut reader = ftp
                    .retr_as_buffer(&remote_path)
                    .with_context(|| format!("downloading {}", remote_path))?;
                let mut data = Vec::new();
                reader.read_to_end(&mut data)?;
                Ok(data)
            })
            .await?;

        tokio::task::spawn_blocking(move || {
            let mut file = File::create(local_path)?;
            file.write_all(&data)?;
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(())
    }

    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let remote_path = remote_path.to_string();
        let data = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("reading {}", local_path.display()))?;

        self.with_stream(move |ftp| {
            ftp.put_file(&remote_path, &mut Cursor::new(data))
                .with_context(|| format!("uploading {}", remote_path))?;
            Ok(())
        })
        .await
    }

    async fn rm(&self, path: &str, recursive: bool) -> Result<()> {
        let path = path.to_string();
        self.with_stream(move |ftp| {
            if ftp.rm(&path).is_ok() {
                return Ok(());
            }
            // DELE refused: treat it as a directory.
            if recursive {
                Self::remove_tree(ftp, &path)
            } else {
                ftp.rmdir(&path).with_context(|| format!("removing {}", path))?;
                Ok(())
            }
        })
        .await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.with_stream(move |ftp| {
            ftp.mkdir(&path).with_context(|| format!("creating {}", path))?;
            Ok(())
        })
        .await
    }

    async fn mv(&self, from: &str, to: &str) -> Result<()> {
        let from = from.to_string();
        let to = to.to_string();
        self.with_stream(move |ftp| {
            ftp.rename(&from, &to)
                .with_context(|| format!("moving {} to {}", from, to))?;
            Ok(())
        })
        .await
    }

    async fn cp(&self, from: &str, to: &str, recursive: bool) -> Result<()> {
        let from = from.to_string();
        let to = to.to_string();
        self.with_stream(move |ftp| {
            match Self::copy_file(ftp, &from, &to) {
                Ok(()) => Ok(()),
                Err(_) if recursive => Self::copy_tree(ftp, &from, &to),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = path.to_string();
        let content = content.to_vec();
        self.with_stream(move |ftp| {
            ftp.put_file(&path, &mut Cursor::new(content))
                .with_context(|| format!("writing {}", path))?;
            Ok(())
        })
        .await
    }
}
