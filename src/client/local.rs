use super::{Capabilities, FileItem, FileSystem};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Local disk adapter. Stateless, so a fresh instance is as good as a pooled one.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClient;

impl LocalClient {
    pub fn new() -> Self {
        Self
    }

    /// Builds the item for `path` without following a trailing symlink for the
    /// link target, but reporting the size and kind of what it points to.
    pub async fn stat(path: &Path) -> Result<FileItem> {
        let link_meta = fs::symlink_metadata(path)
            .await
            .with_context(|| format!("stat {}", path.display()))?;
        let symlink_target = if link_meta.file_type().is_symlink() {
            fs::read_link(path)
                .await
                .ok()
                .map(|target| target.to_string_lossy().into_owned())
        } else {
            None
        };
        // A dangling link still gets listed, with the link's own metadata.
        let meta = fs::metadata(path).await.unwrap_or(link_meta);

        let path_str = path.to_string_lossy().into_owned();
        let mut item = if meta.is_dir() {
            FileItem::dir(&path_str)
        } else {
            FileItem::file(&path_str, meta.len())
        };
        item.modified = meta.modified().ok().map(DateTime::<Utc>::from);
        item.permissions = mode_bits(&meta);
        item.symlink_target = symlink_target;
        Ok(item)
    }

    async fn copy_tree(from: PathBuf, to: PathBuf) -> Result<()> {
        let mut stack = vec![(from, to)];
        while let Some((src, dst)) = stack.pop() {
            fs::create_dir_all(&dst)
                .await
                .with_context(|| format!("creating {}", dst.display()))?;
            let mut entries = fs::read_dir(&src).await?;
            while let Some(entry) = entries.next_entry().await? {
                let target = dst.join(entry.file_name());
                if entry.file_type().await?.is_dir() {
                    stack.push((entry.path(), target));
                } else {
                    fs::copy(entry.path(), &target).await.with_context(|| {
                        format!("copying {} to {}", entry.path().display(), target.display())
                    })?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn mode_bits(meta: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_bits(_meta: &std::fs::Metadata) -> Option<u32> {
    None
}

#[async_trait]
impl FileSystem for LocalClient {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn opened(&self) -> bool {
        true
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            server_side_copy: true,
            rename: true,
            permissions: cfg!(unix),
        }
    }

    async fn pwd(&self) -> Result<String> {
        let cwd = std::env::current_dir()?;
        Ok(cwd.to_string_lossy().into_owned())
    }

    async fn ls(&self, dir: &str) -> Result<Vec<FileItem>> {
        let mut entries = fs::read_dir(dir)
            .await
            .with_context(|| format!("listing {}", dir))?;
        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            match Self::stat(&entry.path()).await {
                Ok(item) => items.push(item),
                // Entry vanished between readdir and stat.
                Err(e) => tracing::debug!(path = %entry.path().display(), error = %e, "skipping entry"),
            }
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn get(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        fs::copy(remote_path, local_path)
            .await
            .with_context(|| format!("copying {} to {}", remote_path, local_path.display()))?;
        Ok(())
    }

    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        fs::copy(local_path, remote_path)
            .await
            .with_context(|| format!("copying {} to {}", local_path.display(), remote_path))?;
        Ok(())
    }

    async fn rm(&self, path: &str, recursive: bool) -> Result<()> {
        let meta = fs::symlink_metadata(path)
            .await
            .with_context(|| format!("stat {}", path))?;
        let result = if meta.is_dir() && recursive {
            fs::remove_dir_all(path).await
        } else if meta.is_dir() {
            fs::remove_dir(path).await
        } else {
            fs::remove_file(path).await
        };
        result.with_context(|| format!("removing {}", path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir(path)
            .await
            .with_context(|| format!("creating {}", path))
    }

    async fn mv(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(from, to)
            .await
            .with_context(|| format!("moving {} to {}", from, to))
    }

    async fn cp(&self, from: &str, to: &str, recursive: bool) -> Result<()> {
        let meta = fs::metadata(from)
            .await
            .with_context(|| format!("stat {}", from))?;
        if meta.is_dir() {
            if !recursive {
                anyhow::bail!("{} is a directory", from);
            }
            return Self::copy_tree(PathBuf::from(from), PathBuf::from(to)).await;
        }
        fs::copy(from, to)
            .await
            .with_context(|| format!("copying {} to {}", from, to))?;
        Ok(())
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        fs::write(path, content)
            .await
            .with_context(|| format!("writing {}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_str(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_ls_reports_files_and_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(temp_dir.path().join("sub")).unwrap();

        let items = LocalClient::new().ls(&path_str(temp_dir.path())).await.unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "a.txt");
        assert_eq!(items[0].size, 5);
        assert!(!items[0].is_dir);
        assert!(items[0].modified.is_some());
        assert_eq!(items[1].name, "sub");
        assert!(items[1].is_dir);
    }

    #[tokio::test]
    async fn test_rm_respects_recursive_flag() {
        let temp_dir = tempfile::tempdir().unwrap();
        let sub = temp_dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("inner"), b"x").unwrap();
        let client = LocalClient::new();

        assert!(client.rm(&path_str(&sub), false).await.is_err());
        client.rm(&path_str(&sub), true).await.unwrap();
        assert!(!sub.exists());
    }

    #[tokio::test]
    async fn test_cp_recursive_copies_tree() {
        let temp_dir = tempfile::tempdir().unwrap();
        let src = temp_dir.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("nested/file"), b"data").unwrap();
        let dst = temp_dir.path().join("dst");
        let client = LocalClient::new();

        assert!(client.cp(&path_str(&src), &path_str(&dst), false).await.is_err());
        client.cp(&path_str(&src), &path_str(&dst), true).await.unwrap();

        assert_eq!(std::fs::read(dst.join("nested/file")).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_write_then_mv() {
        let temp_dir = tempfile::tempdir().unwrap();
        let from = temp_dir.path().join("from.txt");
        let to = temp_dir.path().join("to.txt");
        let client = LocalClient::new();

        client.write(&path_str(&from), b"content").await.unwrap();
        client.mv(&path_str(&from), &path_str(&to)).await.unwrap();

        assert!(!from.exists());
        assert_eq!(std::fs::read_to_string(&to).unwrap(), "content");
    }
}
