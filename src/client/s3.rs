//! S3-compatible object storage through OpenDAL.
//!
//! Paths are `/bucket/key`. There are no real directories: a "directory" is a
//! key prefix, created explicitly as a zero-byte `prefix/` marker by `mkdir`.

use super::{Capabilities, Credential, Endpoint, FileItem, FileSystem};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use opendal::Operator;
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

const DEFAULT_REGION: &str = "us-east-1";

pub struct S3Client {
    endpoint: Endpoint,
    credential: Credential,
    operators: Mutex<HashMap<String, Operator>>,
    opened: AtomicBool,
}

/// `/bucket/a/b` -> (`bucket`, `a/b`)
fn split_bucket(path: &str) -> (String, String) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((bucket, key)) => (bucket.to_string(), key.to_string()),
        None => (trimmed.to_string(), String::new()),
    }
}

fn dir_key(key: &str) -> String {
    if key.is_empty() || key.ends_with('/') {
        key.to_string()
    } else {
        format!("{}/", key)
    }
}

impl S3Client {
    pub fn new(endpoint: Endpoint, credential: Credential) -> Self {
        Self {
            endpoint,
            credential,
            operators: Mutex::new(HashMap::new()),
            opened: AtomicBool::new(false),
        }
    }

    fn endpoint_url(&self) -> String {
        if self.endpoint.port == 443 {
            format!("https://{}", self.endpoint.host)
        } else {
            format!("http://{}:{}", self.endpoint.host, self.endpoint.port)
        }
    }

    fn secret_key(&self) -> Result<String> {
        match &self.credential {
            Credential::Password(secret) => Ok(secret.expose_secret().to_string()),
            _ => bail!("S3 requires a secret access key"),
        }
    }

    fn build_operator(&self, bucket: &str) -> Result<Operator> {
        if self.endpoint_url().starts_with("http://") {
            tracing::warn!(
                endpoint = %self.endpoint_url(),
                "S3 endpoint uses plaintext HTTP"
            );
        }
        let region = std::env::var("AWS_REGION").unwrap_or_else(|_| DEFAULT_REGION.to_string());
        let builder = opendal::services::S3::default()
            .endpoint(&self.endpoint_url())
            .region(&region)
            .bucket(bucket)
            .access_key_id(&self.endpoint.user)
            .secret_access_key(&self.secret_key()?);

        let op = Operator::new(builder)
            .context("creating OpenDAL S3 operator")?
            .layer(opendal::layers::LoggingLayer::default())
            .finish();
        Ok(op)
    }

    /// Operator for the bucket `path` lives in, plus the object key.
    fn locate(&self, path: &str) -> Result<(Operator, String, String)> {
        if !self.opened.load(Ordering::SeqCst) {
            bail!("S3 session is not open");
        }
        let (bucket, key) = split_bucket(path);
        if bucket.is_empty() {
            bail!("path '{}' does not name a bucket", path);
        }
        let mut operators = self.operators.lock();
        let op = match operators.get(&bucket) {
            Some(op) => op.clone(),
            None => {
                let op = self.build_operator(&bucket)?;
                operators.insert(bucket.clone(), op.clone());
                op
            }
        };
        Ok((op, bucket, key))
    }

    async fn is_dir(op: &Operator, key: &str) -> bool {
        if key.is_empty() || key.ends_with('/') {
            return true;
        }
        match op.stat(key).await {
            Ok(meta) => meta.is_dir(),
            Err(_) => op.stat(&dir_key(key)).await.is_ok(),
        }
    }

    async fn copy_object(
        &self,
        from: (&Operator, &str, &str),
        to: (&Operator, &str, &str),
    ) -> Result<()> {
        let (from_op, from_bucket, from_key) = from;
        let (to_op, to_bucket, to_key) = to;
        if from_bucket == to_bucket {
            from_op
                .copy(from_key, to_key)
                .await
                .with_context(|| format!("copying {} to {}", from_key, to_key))?;
        } else {
            let data = from_op.read(from_key).await?.to_vec();
            to_op.write(to_key, data).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileSystem for S3Client {
    async fn open(&self) -> Result<()> {
        // Nothing to hand-shake over HTTP; validate what we can up front.
        self.secret_key()?;
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.opened.store(false, Ordering::SeqCst);
        self.operators.lock().clear();
        Ok(())
    }

    fn opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            server_side_copy: true,
            rename: false,
            permissions: false,
        }
    }

    async fn pwd(&self) -> Result<String> {
        Ok("/".to_string())
    }

    async fn ls(&self, dir: &str) -> Result<Vec<FileItem>> {
        let (op, bucket, key) = self.locate(dir)?;
        let prefix = dir_key(&key);
        let entries = op
            .list(&prefix)
            .await
            .with_context(|| format!("listing {}", dir))?;

        let mut items: Vec<FileItem> = entries
            .iter()
            .filter(|entry| entry.path() != prefix)
            .map(|entry| {
                let meta = entry.metadata();
                let path = format!("/{}/{}", bucket, entry.path().trim_end_matches('/'));
                if meta.is_dir() {
                    FileItem::dir(&path)
                } else {
                    FileItem::file(&path, meta.content_length())
                }
            })
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn get(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let (op, _, key) = self.locate(remote_path)?;
        let data = op
            .read(&key)
            .await
            .with_context(|| format!("downloading {}", remote_path))?;
        tokio::fs::write(local_path, data.to_vec())
            .await
            .with_context(|| format!("writing {}", local_path.display()))?;
        Ok(())
    }

    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let (op, _, key) = self.locate(remote_path)?;
        let data = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("reading {}", local_path.display()))?;
        op.write(&key, data)
            .await
            .with_context(|| format!("uploading {}", remote_path))?;
        Ok(())
    }

    async fn rm(&self, path: &str, recursive: bool) -> Result<()> {
        let (op, _, key) = self.locate(path)?;
        if !Self::is_dir(&op, &key).await {
            op.delete(&key)
                .await
                .with_context(|| format!("removing {}", path))?;
            return Ok(());
        }

        let prefix = dir_key(&key);
        let children = op.list_with(&prefix).recursive(true).await?;
        let children: Vec<_> = children
            .into_iter()
            .filter(|entry| entry.path() != prefix)
            .collect();
        if !children.is_empty() && !recursive {
            bail!("directory {} is not empty", path);
        }
        for entry in children {
            op.delete(entry.path())
                .await
                .with_context(|| format!("removing {}", entry.path()))?;
        }
        op.delete(&prefix)
            .await
            .with_context(|| format!("removing {}", path))?;
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let (op, _, key) = self.locate(path)?;
        op.create_dir(&dir_key(&key))
            .await
            .with_context(|| format!("creating {}", path))?;
        Ok(())
    }

    async fn mv(&self, from: &str, to: &str) -> Result<()> {
        self.cp(from, to, true).await?;
        self.rm(from, true).await
    }

    async fn cp(&self, from: &str, to: &str, recursive: bool) -> Result<()> {
        let (from_op, from_bucket, from_key) = self.locate(from)?;
        let (to_op, to_bucket, to_key) = self.locate(to)?;

        if !Self::is_dir(&from_op, &from_key).await {
            return self
                .copy_object(
                    (&from_op, &from_bucket, &from_key),
                    (&to_op, &to_bucket, &to_key),
                )
                .await;
        }
        if !recursive {
            bail!("{} is a directory", from);
        }

        let from_prefix = dir_key(&from_key);
        let to_prefix = dir_key(&to_key);
        to_op.create_dir(&to_prefix).await?;
        let entries = from_op.list_with(&from_prefix).recursive(true).await?;
        for entry in entries {
            let Some(relative) = entry.path().strip_prefix(&from_prefix) else {
                continue;
            };
            if relative.is_empty() {
                continue;
            }
            let target = format!("{}{}", to_prefix, relative);
            if entry.metadata().is_dir() {
                to_op.create_dir(&target).await?;
            } else {
                self.copy_object(
                    (&from_op, &from_bucket, entry.path()),
                    (&to_op, &to_bucket, &target),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let (op, _, key) = self.locate(path)?;
        op.write(&key, content.to_vec())
            .await
            .with_context(|| format!("writing {}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    fn client(port: u16, credential: Credential) -> S3Client {
        S3Client::new(
            Endpoint {
                protocol: Protocol::S3,
                user: "AKIDEXAMPLE".to_string(),
                host: "minio.local".to_string(),
                port,
            },
            credential,
        )
    }

    #[test]
    fn test_split_bucket() {
        assert_eq!(
            split_bucket("/photos/2024/a.jpg"),
            ("photos".to_string(), "2024/a.jpg".to_string())
        );
        assert_eq!(split_bucket("/photos"), ("photos".to_string(), String::new()));
        assert_eq!(dir_key("2024"), "2024/");
        assert_eq!(dir_key(""), "");
    }

    #[test]
    fn test_endpoint_url_by_port() {
        assert_eq!(client(443, Credential::None).endpoint_url(), "https://minio.local");
        assert_eq!(client(9000, Credential::None).endpoint_url(), "http://minio.local:9000");
    }

    #[tokio::test]
    async fn test_open_requires_secret_key() {
        assert!(client(443, Credential::None).open().await.is_err());

        let s3 = client(9000, Credential::password("secret"));
        s3.open().await.unwrap();
        assert!(s3.opened());
        s3.close().await.unwrap();
        assert!(!s3.opened());
    }

    #[tokio::test]
    async fn test_paths_must_name_a_bucket() {
        let s3 = client(9000, Credential::password("secret"));
        s3.open().await.unwrap();
        let err = s3.ls("/").await.unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }
}
