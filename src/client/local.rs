//! Local filesystem client
//!
//! Provides async access to the local filesystem using Tokio's async I/O.
//! Writes go to a sibling temp file that is synced and renamed into place,
//! so a completed `put` is durable before it returns.

use super::error::{ClientError, ClientResult};
use super::types::{
    ByteStream, Content, ContentKind, ContentStream, GetOptions, ListOptions, PutOptions,
    PutOutcome, RemoveOptions, StatOptions,
};
use super::url;
use super::StorageClient;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const CHUNK_SIZE: usize = 64 * 1024;
const PART_SUFFIX: &str = ".ferry-part";

/// Local filesystem client
///
/// Without a root, client paths are ordinary filesystem paths. With a root,
/// they are resolved relative to it, which lets a directory stand in for a
/// bucket namespace behind an alias.
#[derive(Debug, Clone, Default)]
pub struct LocalClient {
    root: Option<PathBuf>,
}

impl LocalClient {
    /// Client with no root constraint
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Client whose paths are resolved relative to `root`
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path.trim_start_matches(url::SEPARATOR)),
            None if path.is_empty() => PathBuf::from("."),
            None => PathBuf::from(path),
        }
    }

    /// Stat `resolved` following symlinks, reporting dangling links as such
    async fn describe(&self, path: &str, resolved: &Path) -> ClientResult<Content> {
        let link_meta = fs::symlink_metadata(resolved)
            .await
            .map_err(|e| ClientError::from_io(path, e))?;

        let meta = if link_meta.file_type().is_symlink() {
            fs::metadata(resolved).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ClientError::BrokenSymlink {
                        path: path.to_string(),
                    }
                } else {
                    ClientError::from_io(path, e)
                }
            })?
        } else {
            link_meta
        };

        let time = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let mut content = if meta.is_dir() {
            Content::directory(path, time)
        } else {
            Content::object(path, meta.len(), time)
        };
        if !meta.is_dir() && !meta.is_file() {
            content.kind = ContentKind::Symlink;
        }
        Ok(content)
    }

    /// Child paths of a directory, sorted lexically
    async fn read_children(&self, path: &str) -> ClientResult<Vec<String>> {
        let resolved = self.resolve_path(path);
        let mut read_dir = fs::read_dir(&resolved)
            .await
            .map_err(|e| ClientError::from_io(path, e))?;

        let mut names = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| ClientError::from_io(path, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(PART_SUFFIX) {
                continue;
            }
            names.push(name);
        }
        names.sort();

        Ok(names.into_iter().map(|name| url::join(path, &name)).collect())
    }

    async fn write_part(
        part: &Path,
        path: &str,
        mut reader: ByteStream,
    ) -> ClientResult<u64> {
        let mut file = fs::File::create(part)
            .await
            .map_err(|e| ClientError::from_io(path, e))?;

        let mut written = 0u64;
        while let Some(chunk) = reader.next().await {
            let chunk = chunk.map_err(|e| ClientError::from_io(path, e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ClientError::from_io(path, e))?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(|e| ClientError::from_io(path, e))?;
        file.sync_all()
            .await
            .map_err(|e| ClientError::from_io(path, e))?;
        Ok(written)
    }

    async fn prepare_target(&self, path: &str) -> ClientResult<(PathBuf, PathBuf)> {
        if url::has_dir_suffix(path) {
            return Err(ClientError::IsDirectory {
                path: path.to_string(),
            });
        }

        let resolved = self.resolve_path(path);
        if let Ok(meta) = fs::metadata(&resolved).await {
            if meta.is_dir() {
                return Err(ClientError::ObjectAlreadyExistsAsDirectory {
                    path: path.to_string(),
                });
            }
        }

        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ClientError::from_io(path, e))?;
        }

        let file_name = resolved
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let part = resolved.with_file_name(format!(".{}{}", file_name, PART_SUFFIX));
        Ok((resolved, part))
    }
}

struct Walk {
    client: LocalClient,
    options: ListOptions,
    root: Option<String>,
    stack: Vec<std::vec::IntoIter<String>>,
}

impl Walk {
    fn visible(&self, content: &Content) -> bool {
        match self.options.time_ref {
            Some(time_ref) => content.is_dir() || content.time <= time_ref,
            None => true,
        }
    }

    async fn next_entry(&mut self) -> Option<ClientResult<Content>> {
        loop {
            if let Some(root) = self.root.take() {
                let resolved = self.client.resolve_path(&root);
                let content = match self.client.describe(&root, &resolved).await {
                    Ok(content) => content,
                    Err(e) => return Some(Err(e)),
                };
                if !content.is_dir() {
                    if self.visible(&content) {
                        return Some(Ok(content));
                    }
                    return None;
                }
                match self.client.read_children(&root).await {
                    Ok(children) => self.stack.push(children.into_iter()),
                    Err(e) => return Some(Err(e)),
                }
                continue;
            }

            let frame = self.stack.last_mut()?;
            let Some(child) = frame.next() else {
                self.stack.pop();
                continue;
            };

            let resolved = self.client.resolve_path(&child);
            let content = match self.client.describe(&child, &resolved).await {
                Ok(content) => content,
                Err(e) => return Some(Err(e)),
            };

            if content.is_dir() && self.options.recursive {
                match self.client.read_children(&child).await {
                    Ok(children) => self.stack.push(children.into_iter()),
                    Err(e) => return Some(Err(e)),
                }
            }

            if self.visible(&content) {
                return Some(Ok(content));
            }
        }
    }
}

#[async_trait]
impl StorageClient for LocalClient {
    fn name(&self) -> &str {
        "local"
    }

    async fn stat(&self, path: &str, options: &StatOptions) -> ClientResult<Content> {
        if options.version_id.is_some() {
            return Err(ClientError::Unsupported {
                client: self.name().to_string(),
                operation: "versioned stat".to_string(),
            });
        }

        let resolved = self.resolve_path(path);
        let content = self.describe(path, &resolved).await?;
        if let Some(time_ref) = options.time_ref {
            if !content.is_dir() && content.time > time_ref {
                return Err(ClientError::PathNotFound {
                    path: path.to_string(),
                });
            }
        }
        Ok(content)
    }

    fn list(&self, path: &str, options: ListOptions) -> ContentStream {
        let trimmed = path.trim_end_matches(url::SEPARATOR);
        let root = if trimmed.is_empty() { path } else { trimmed };
        let walk = Walk {
            client: self.clone(),
            options,
            root: Some(root.to_string()),
            stack: Vec::new(),
        };

        stream::unfold(walk, |mut walk| async move {
            walk.next_entry().await.map(|item| (item, walk))
        })
        .boxed()
    }

    async fn get(&self, path: &str, options: &GetOptions) -> ClientResult<ByteStream> {
        if options.version_id.is_some() {
            return Err(ClientError::Unsupported {
                client: self.name().to_string(),
                operation: "versioned get".to_string(),
            });
        }

        let resolved = self.resolve_path(path);
        let meta = fs::metadata(&resolved)
            .await
            .map_err(|e| ClientError::from_io(path, e))?;
        if meta.is_dir() {
            return Err(ClientError::IsDirectory {
                path: path.to_string(),
            });
        }

        let file = fs::File::open(&resolved)
            .await
            .map_err(|e| ClientError::from_io(path, e))?;

        let stream = stream::unfold(
            Some((file, vec![0u8; CHUNK_SIZE])),
            |state| async move {
                let (mut file, mut buffer) = state?;
                match file.read(&mut buffer).await {
                    Ok(0) => None,
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buffer[..n]);
                        Some((Ok(data), Some((file, buffer))))
                    }
                    // Stop after reporting the error
                    Err(e) => Some((Err(e), None)),
                }
            },
        );

        Ok(Box::pin(stream))
    }

    async fn put(
        &self,
        path: &str,
        reader: ByteStream,
        _size: u64,
        _options: &PutOptions,
    ) -> ClientResult<PutOutcome> {
        let (resolved, part) = self.prepare_target(path).await?;

        let written = match Self::write_part(&part, path, reader).await {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&part).await;
                return Err(e);
            }
        };

        fs::rename(&part, &resolved)
            .await
            .map_err(|e| ClientError::from_io(path, e))?;

        Ok(PutOutcome {
            size: written,
            etag: None,
            version_id: None,
        })
    }

    async fn copy(
        &self,
        source: &str,
        target: &str,
        _size: u64,
        _options: &PutOptions,
    ) -> ClientResult<PutOutcome> {
        let source_resolved = self.resolve_path(source);
        let meta = fs::metadata(&source_resolved)
            .await
            .map_err(|e| ClientError::from_io(source, e))?;
        if meta.is_dir() {
            return Err(ClientError::IsDirectory {
                path: source.to_string(),
            });
        }

        let (resolved, part) = self.prepare_target(target).await?;
        let copied = match fs::copy(&source_resolved, &part).await {
            Ok(copied) => copied,
            Err(e) => {
                let _ = fs::remove_file(&part).await;
                return Err(ClientError::from_io(target, e));
            }
        };
        fs::rename(&part, &resolved)
            .await
            .map_err(|e| ClientError::from_io(target, e))?;

        Ok(PutOutcome {
            size: copied,
            etag: None,
            version_id: None,
        })
    }

    async fn remove(&self, path: &str, _options: &RemoveOptions) -> ClientResult<()> {
        let resolved = self.resolve_path(path);
        fs::remove_file(&resolved)
            .await
            .map_err(|e| ClientError::from_io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::tempdir;

    fn bytes_stream(data: &'static [u8]) -> ByteStream {
        Box::pin(stream::iter(vec![Ok(Bytes::from_static(data))]))
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let client = LocalClient::with_root(dir.path());

        let outcome = client
            .put("a/b/file.txt", bytes_stream(b"hello"), 5, &PutOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.size, 5);

        let chunks: Vec<Bytes> = client
            .get("a/b/file.txt", &GetOptions::default())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"hello");

        // No part files left behind
        let names: Vec<_> = std::fs::read_dir(dir.path().join("a/b"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_put_leaves_no_object() {
        let dir = tempdir().unwrap();
        let client = LocalClient::with_root(dir.path());

        let broken: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]));
        let err = client
            .put("out.bin", broken, 100, &PutOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!dir.path().join("out.bin").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_stat_directory_and_missing() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let client = LocalClient::with_root(dir.path());

        let content = client.stat("sub", &StatOptions::default()).await.unwrap();
        assert!(content.is_dir());

        let err = client
            .stat("missing", &StatOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::PathNotFound { .. }));
    }

    #[tokio::test]
    async fn test_recursive_listing_is_lexical_and_complete() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/b")).unwrap();
        std::fs::write(root.join("src/c.txt"), b"c").unwrap();
        std::fs::write(root.join("src/a.txt"), b"a").unwrap();
        std::fs::write(root.join("src/b/d.txt"), b"dd").unwrap();
        let client = LocalClient::with_root(root);

        let entries: Vec<Content> = client
            .list("src", ListOptions::recursive())
            .try_collect()
            .await
            .unwrap();
        let paths: Vec<&str> = entries.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["src/a.txt", "src/b", "src/b/d.txt", "src/c.txt"]);
        assert!(entries[1].is_dir());
        assert_eq!(entries[2].size, 2);
    }

    #[tokio::test]
    async fn test_flat_listing_does_not_descend() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        std::fs::write(dir.path().join("src/nested/deep.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("src/top.txt"), b"x").unwrap();
        let client = LocalClient::with_root(dir.path());

        let entries: Vec<Content> = client
            .list("src", ListOptions::default())
            .try_collect()
            .await
            .unwrap();
        let paths: Vec<&str> = entries.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["src/nested", "src/top.txt"]);
    }

    #[tokio::test]
    async fn test_listing_a_file_yields_the_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("one.txt"), b"1").unwrap();
        let client = LocalClient::with_root(dir.path());

        let entries: Vec<Content> = client
            .list("one.txt", ListOptions::recursive())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "one.txt");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_broken_symlink_reported() {
        let dir = tempdir().unwrap();
        std::os::unix::fs::symlink(dir.path().join("nowhere"), dir.path().join("dangling"))
            .unwrap();
        let client = LocalClient::with_root(dir.path());

        let err = client
            .stat("dangling", &StatOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::BrokenSymlink { .. }));
    }

    #[tokio::test]
    async fn test_put_onto_directory_rejected() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("taken")).unwrap();
        let client = LocalClient::with_root(dir.path());

        let err = client
            .put("taken", bytes_stream(b"x"), 1, &PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::ObjectAlreadyExistsAsDirectory { .. }
        ));
    }

    #[tokio::test]
    async fn test_copy_and_remove() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("src.bin"), b"payload").unwrap();
        let client = LocalClient::with_root(dir.path());

        let outcome = client
            .copy("src.bin", "copies/dst.bin", 7, &PutOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.size, 7);
        assert_eq!(
            std::fs::read(dir.path().join("copies/dst.bin")).unwrap(),
            b"payload"
        );

        client
            .remove("src.bin", &RemoveOptions::default())
            .await
            .unwrap();
        assert!(!dir.path().join("src.bin").exists());
    }
}
