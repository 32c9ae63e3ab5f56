//! In-memory storage client
//!
//! Stores versioned objects in named buckets so the transfer engine can be
//! exercised without a network or a filesystem. Besides the
//! [`StorageClient`] operations it offers hooks for tests: per-operation fault
//! injection, interrupted reads, artificial latency, and counters for
//! concurrent and repeated uploads.

use super::error::{ClientError, ClientResult};
use super::types::{
    ByteStream, Content, ContentStream, GetOptions, ListOptions, PutOptions, PutOutcome,
    RemoveOptions, StatOptions,
};
use super::url;
use super::StorageClient;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

const CHUNK_SIZE: usize = 16 * 1024;
const STORAGE_CLASS_HEADER: &str = "X-Amz-Storage-Class";
const ARCHIVAL_CLASSES: &[&str] = &["GLACIER", "DEEP_ARCHIVE"];

/// Operation selector for fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Stat,
    Get,
    Put,
    Copy,
    Remove,
}

#[derive(Debug, Clone)]
enum Fault {
    Fail(ClientError),
    InterruptRead { after: usize },
}

#[derive(Debug, Clone)]
struct StoredVersion {
    version_id: String,
    data: Bytes,
    time: DateTime<Utc>,
    etag: String,
    delete_marker: bool,
    storage_class: Option<String>,
    metadata: BTreeMap<String, String>,
    user_metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Bucket {
    object_lock: bool,
    objects: BTreeMap<String, Vec<StoredVersion>>,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, Bucket>,
    faults: HashMap<(Operation, String), VecDeque<Fault>>,
    put_counts: HashMap<String, usize>,
    write_delays: HashMap<String, Duration>,
    next_version: u64,
}

#[derive(Debug)]
struct Inner {
    name: String,
    state: RwLock<State>,
    latency_nanos: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// In-memory, versioned bucket store
///
/// Cloning is cheap and clones share the same buckets.
///
/// ```
/// use ferry::client::MemoryClient;
///
/// let store = MemoryClient::new("mem");
/// store.make_bucket("photos");
/// store.put_object("photos/2024/a.jpg", b"jpeg".to_vec());
///
/// assert_eq!(store.object_data("photos/2024/a.jpg").unwrap(), &b"jpeg"[..]);
/// assert_eq!(store.object_count(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct MemoryClient {
    inner: Arc<Inner>,
}

struct InFlightGuard<'a>(&'a Inner);

impl<'a> InFlightGuard<'a> {
    fn enter(inner: &'a Inner) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn split_path(path: &str) -> ClientResult<(&str, &str)> {
    let path = path.trim_start_matches(url::SEPARATOR);
    let (bucket, key) = path.split_once(url::SEPARATOR).unwrap_or((path, ""));
    if bucket.is_empty() {
        return Err(ClientError::BucketNameEmpty);
    }
    Ok((bucket, key))
}

/// Pick the version visible for the given selectors
fn select<'a>(
    versions: &'a [StoredVersion],
    version_id: Option<&str>,
    time_ref: Option<DateTime<Utc>>,
) -> Option<&'a StoredVersion> {
    match version_id {
        Some(id) => versions.iter().find(|v| v.version_id == id),
        None => versions
            .iter()
            .rev()
            .find(|v| time_ref.is_none_or(|t| v.time <= t)),
    }
}

fn describe(bucket: &str, key: &str, versions: &[StoredVersion], version: &StoredVersion) -> Content {
    let is_latest = versions
        .last()
        .is_some_and(|last| last.version_id == version.version_id);
    Content {
        path: format!("{}/{}", bucket, key),
        size: version.data.len() as u64,
        time: version.time,
        etag: Some(version.etag.clone()),
        version_id: Some(version.version_id.clone()),
        is_delete_marker: version.delete_marker,
        is_latest,
        storage_class: version.storage_class.clone(),
        kind: Default::default(),
        metadata: version.metadata.clone(),
        user_metadata: version.user_metadata.clone(),
    }
}

fn etag_of(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..16])
}

impl MemoryClient {
    /// Create an empty store
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: RwLock::new(State::default()),
                latency_nanos: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Delay every data operation (get, put, copy) by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        self.inner
            .latency_nanos
            .store(latency.as_nanos() as u64, Ordering::Relaxed);
        self
    }

    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self) {
        let nanos = self.inner.latency_nanos.load(Ordering::Relaxed);
        if nanos > 0 {
            tokio::time::sleep(Duration::from_nanos(nanos)).await;
        }
    }

    async fn simulate_write_delay(&self, path: &str) {
        let delay = self.read_state().write_delays.get(path).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn take_fault(&self, operation: Operation, path: &str) -> Option<Fault> {
        let mut state = self.write_state();
        let key = (operation, path.to_string());
        let queue = state.faults.get_mut(&key)?;
        let fault = queue.pop_front();
        if queue.is_empty() {
            state.faults.remove(&key);
        }
        fault
    }

    fn check_fault(&self, operation: Operation, path: &str) -> ClientResult<()> {
        match self.take_fault(operation, path) {
            Some(Fault::Fail(err)) => Err(err),
            _ => Ok(()),
        }
    }

    /// Create an empty bucket
    pub fn make_bucket(&self, bucket: &str) {
        self.write_state()
            .buckets
            .entry(bucket.to_string())
            .or_default();
    }

    /// Create an empty bucket with object locking enabled
    pub fn make_locked_bucket(&self, bucket: &str) {
        self.write_state()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .object_lock = true;
    }

    /// Store an object version stamped with the current time
    pub fn put_object(&self, path: &str, data: impl Into<Bytes>) -> String {
        self.put_object_at(path, data, Utc::now())
    }

    /// Store an object version with an explicit modification time.
    ///
    /// The bucket is created on demand.
    pub fn put_object_at(&self, path: &str, data: impl Into<Bytes>, time: DateTime<Utc>) -> String {
        let data = data.into();
        let mut state = self.write_state();
        let (bucket, key) = path.split_once(url::SEPARATOR).unwrap_or((path, ""));
        let version = Self::new_version(&mut state, data, time);
        let version_id = version.version_id.clone();
        Self::insert_version(&mut state, bucket, key, version);
        version_id
    }

    /// Record a delete marker at `time`
    pub fn put_delete_marker_at(&self, path: &str, time: DateTime<Utc>) {
        let mut state = self.write_state();
        let (bucket, key) = path.split_once(url::SEPARATOR).unwrap_or((path, ""));
        let mut marker = Self::new_version(&mut state, Bytes::new(), time);
        marker.delete_marker = true;
        Self::insert_version(&mut state, bucket, key, marker);
    }

    /// Move the latest version of an object into another storage class
    pub fn set_storage_class(&self, path: &str, class: &str) {
        let mut state = self.write_state();
        let (bucket, key) = path.split_once(url::SEPARATOR).unwrap_or((path, ""));
        if let Some(latest) = state
            .buckets
            .get_mut(bucket)
            .and_then(|b| b.objects.get_mut(key))
            .and_then(|versions| versions.last_mut())
        {
            latest.storage_class = Some(class.to_string());
        }
    }

    fn new_version(state: &mut State, data: Bytes, time: DateTime<Utc>) -> StoredVersion {
        state.next_version += 1;
        StoredVersion {
            version_id: format!("v{:08}", state.next_version),
            etag: etag_of(&data),
            data,
            time,
            delete_marker: false,
            storage_class: None,
            metadata: BTreeMap::new(),
            user_metadata: BTreeMap::new(),
        }
    }

    fn insert_version(state: &mut State, bucket: &str, key: &str, version: StoredVersion) {
        let versions = state
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .objects
            .entry(key.to_string())
            .or_default();
        let position = versions.partition_point(|v| v.time <= version.time);
        versions.insert(position, version);
    }

    /// Content of the latest live version
    pub fn object_data(&self, path: &str) -> Option<Bytes> {
        self.object_content_and_data(path).map(|(_, data)| data)
    }

    /// Descriptor (including metadata) of the latest live version
    pub fn object_content(&self, path: &str) -> Option<Content> {
        self.object_content_and_data(path).map(|(content, _)| content)
    }

    fn object_content_and_data(&self, path: &str) -> Option<(Content, Bytes)> {
        let state = self.read_state();
        let (bucket, key) = path.split_once(url::SEPARATOR)?;
        let versions = state.buckets.get(bucket)?.objects.get(key)?;
        let latest = versions.last()?;
        if latest.delete_marker {
            return None;
        }
        Some((describe(bucket, key, versions, latest), latest.data.clone()))
    }

    /// Number of keys whose latest version is live
    pub fn object_count(&self) -> usize {
        self.read_state()
            .buckets
            .values()
            .flat_map(|b| b.objects.values())
            .filter(|versions| versions.last().is_some_and(|v| !v.delete_marker))
            .count()
    }

    /// How many times `path` has been written through `put` or `copy`
    pub fn put_count(&self, path: &str) -> usize {
        self.read_state().put_counts.get(path).copied().unwrap_or(0)
    }

    /// Highest number of data operations observed running at once
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Fail the next `operation` on `path` with `err`
    pub fn inject_fault(&self, operation: Operation, path: &str, err: ClientError) {
        self.inject_faults(operation, path, err, 1);
    }

    /// Fail the next `times` calls of `operation` on `path` with `err`
    pub fn inject_faults(&self, operation: Operation, path: &str, err: ClientError, times: usize) {
        let mut state = self.write_state();
        let queue = state
            .faults
            .entry((operation, path.to_string()))
            .or_default();
        queue.extend(std::iter::repeat_n(Fault::Fail(err), times));
    }

    /// Cut the next read of `path` with a connection reset after `after` bytes
    pub fn interrupt_read_once(&self, path: &str, after: usize) {
        self.write_state()
            .faults
            .entry((Operation::Get, path.to_string()))
            .or_default()
            .push_back(Fault::InterruptRead { after });
    }

    /// Hold every write of `path` for an extra `delay`
    pub fn delay_writes(&self, path: &str, delay: Duration) {
        self.write_state()
            .write_delays
            .insert(path.to_string(), delay);
    }

    /// Remove all pending faults
    pub fn clear_faults(&self) {
        self.write_state().faults.clear();
    }

    fn store(
        &self,
        path: &str,
        data: Bytes,
        options: &PutOptions,
    ) -> ClientResult<PutOutcome> {
        let (bucket, key) = split_path(path)?;
        if key.is_empty() || url::has_dir_suffix(key) {
            return Err(ClientError::IsDirectory {
                path: path.to_string(),
            });
        }

        let mut state = self.write_state();
        if !state.buckets.contains_key(bucket) {
            return Err(ClientError::BucketDoesNotExist {
                bucket: bucket.to_string(),
            });
        }

        let size = data.len() as u64;
        let mut version = Self::new_version(&mut state, data, Utc::now());
        version.storage_class = options.metadata.get(STORAGE_CLASS_HEADER).cloned();
        version.metadata = options.metadata.clone();
        version.user_metadata = options.user_metadata.clone();
        let outcome = PutOutcome {
            size,
            etag: Some(version.etag.clone()),
            version_id: Some(version.version_id.clone()),
        };

        Self::insert_version(&mut state, bucket, key, version);
        *state.put_counts.entry(path.to_string()).or_default() += 1;
        Ok(outcome)
    }

    fn read_version(&self, path: &str, version_id: Option<&str>) -> ClientResult<Bytes> {
        let (bucket, key) = split_path(path)?;
        let state = self.read_state();
        let versions = state
            .buckets
            .get(bucket)
            .ok_or_else(|| ClientError::BucketDoesNotExist {
                bucket: bucket.to_string(),
            })?
            .objects
            .get(key)
            .ok_or_else(|| ClientError::PathNotFound {
                path: path.to_string(),
            })?;

        let version = select(versions, version_id, None)
            .filter(|v| !v.delete_marker)
            .ok_or_else(|| ClientError::PathNotFound {
                path: path.to_string(),
            })?;

        if version
            .storage_class
            .as_deref()
            .is_some_and(|class| ARCHIVAL_CLASSES.contains(&class))
        {
            return Err(ClientError::ObjectOnGlacier {
                path: path.to_string(),
            });
        }
        Ok(version.data.clone())
    }

    fn snapshot_listing(&self, path: &str, options: &ListOptions) -> Vec<ClientResult<Content>> {
        let (bucket_name, key) = match split_path(path) {
            Ok(parts) => parts,
            Err(e) => return vec![Err(e)],
        };

        let state = self.read_state();
        let Some(bucket) = state.buckets.get(bucket_name) else {
            return vec![Err(ClientError::BucketDoesNotExist {
                bucket: bucket_name.to_string(),
            })];
        };

        let visible = |versions: &[StoredVersion]| {
            select(versions, None, options.time_ref)
                .filter(|v| options.with_delete_markers || !v.delete_marker)
                .cloned()
        };

        if !key.is_empty() && !url::has_dir_suffix(key) {
            if let Some(versions) = bucket.objects.get(key) {
                if let Some(version) = visible(versions) {
                    return vec![Ok(describe(bucket_name, key, versions, &version))];
                }
            }
        }

        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key.trim_end_matches(url::SEPARATOR))
        };

        let mut entries = Vec::new();
        let mut last_dir: Option<String> = None;
        for (object_key, versions) in bucket.objects.range(prefix.clone()..) {
            if !object_key.starts_with(&prefix) {
                break;
            }
            let Some(version) = visible(versions) else {
                continue;
            };

            let relative = &object_key[prefix.len()..];
            if !options.recursive {
                if let Some((dir, _)) = relative.split_once(url::SEPARATOR) {
                    let dir_key = format!("{}{}", prefix, dir);
                    if last_dir.as_deref() != Some(dir_key.as_str()) {
                        entries.push(Ok(Content::directory(
                            format!("{}/{}", bucket_name, dir_key),
                            version.time,
                        )));
                        last_dir = Some(dir_key);
                    }
                    continue;
                }
            }
            entries.push(Ok(describe(bucket_name, object_key, versions, &version)));
        }
        entries
    }
}

#[async_trait]
impl StorageClient for MemoryClient {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn stat(&self, path: &str, options: &StatOptions) -> ClientResult<Content> {
        self.check_fault(Operation::Stat, path)?;
        let (bucket_name, key) = split_path(path)?;

        let state = self.read_state();
        let bucket = state
            .buckets
            .get(bucket_name)
            .ok_or_else(|| ClientError::BucketDoesNotExist {
                bucket: bucket_name.to_string(),
            })?;

        let trimmed = key.trim_end_matches(url::SEPARATOR);
        if trimmed.is_empty() {
            return Ok(Content::directory(bucket_name, Utc::now()));
        }

        if !url::has_dir_suffix(key) {
            if let Some(versions) = bucket.objects.get(trimmed) {
                if let Some(version) =
                    select(versions, options.version_id.as_deref(), options.time_ref)
                {
                    if version.delete_marker {
                        return Err(ClientError::PathNotFound {
                            path: path.to_string(),
                        });
                    }
                    return Ok(describe(bucket_name, trimmed, versions, version));
                }
            }
            if options.version_id.is_some() {
                return Err(ClientError::PathNotFound {
                    path: path.to_string(),
                });
            }
        }

        let prefix = format!("{}/", trimmed);
        let newest_child = bucket
            .objects
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(_, versions)| select(versions, None, options.time_ref))
            .filter(|v| !v.delete_marker)
            .map(|v| v.time)
            .max();

        match newest_child {
            Some(time) => Ok(Content::directory(path.trim_end_matches(url::SEPARATOR), time)),
            None => Err(ClientError::PathNotFound {
                path: path.to_string(),
            }),
        }
    }

    fn list(&self, path: &str, options: ListOptions) -> ContentStream {
        stream::iter(self.snapshot_listing(path, &options)).boxed()
    }

    async fn get(&self, path: &str, options: &GetOptions) -> ClientResult<ByteStream> {
        let interrupt = match self.take_fault(Operation::Get, path) {
            Some(Fault::Fail(err)) => return Err(err),
            Some(Fault::InterruptRead { after }) => Some(after),
            None => None,
        };
        let data = self.read_version(path, options.version_id.as_deref())?;

        let limit = interrupt.unwrap_or(data.len()).min(data.len());
        let mut chunks: Vec<io::Result<Bytes>> = Vec::new();
        let mut offset = 0;
        while offset < limit {
            let end = (offset + CHUNK_SIZE).min(limit);
            chunks.push(Ok(data.slice(offset..end)));
            offset = end;
        }
        if interrupt.is_some() {
            chunks.push(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }

        Ok(stream::iter(chunks).boxed())
    }

    async fn put(
        &self,
        path: &str,
        mut reader: ByteStream,
        size: u64,
        options: &PutOptions,
    ) -> ClientResult<PutOutcome> {
        let _guard = InFlightGuard::enter(&self.inner);
        self.simulate_latency().await;
        self.simulate_write_delay(path).await;

        let mut buffer = BytesMut::with_capacity(size as usize);
        while let Some(chunk) = reader.next().await {
            let chunk = chunk.map_err(|e| ClientError::from_io(path, e))?;
            buffer.extend_from_slice(&chunk);
        }

        self.check_fault(Operation::Put, path)?;
        self.store(path, buffer.freeze(), options)
    }

    async fn copy(
        &self,
        source: &str,
        target: &str,
        _size: u64,
        options: &PutOptions,
    ) -> ClientResult<PutOutcome> {
        let _guard = InFlightGuard::enter(&self.inner);
        self.simulate_latency().await;
        self.simulate_write_delay(target).await;

        self.check_fault(Operation::Copy, target)?;
        let data = self.read_version(source, None)?;
        self.store(target, data, options)
    }

    async fn remove(&self, path: &str, _options: &RemoveOptions) -> ClientResult<()> {
        self.check_fault(Operation::Remove, path)?;
        let (bucket, key) = split_path(path)?;

        let mut state = self.write_state();
        let live = state
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .and_then(|versions| versions.last())
            .is_some_and(|v| !v.delete_marker);
        if !live {
            return Err(ClientError::PathNotFound {
                path: path.to_string(),
            });
        }

        let mut marker = Self::new_version(&mut state, Bytes::new(), Utc::now());
        marker.delete_marker = true;
        Self::insert_version(&mut state, bucket, key, marker);
        Ok(())
    }

    async fn object_lock_enabled(&self, path: &str) -> ClientResult<bool> {
        let (bucket, _) = split_path(path)?;
        self.read_state()
            .buckets
            .get(bucket)
            .map(|b| b.object_lock)
            .ok_or_else(|| ClientError::BucketDoesNotExist {
                bucket: bucket.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use futures::TryStreamExt;

    fn body(data: &'static [u8]) -> ByteStream {
        stream::iter(vec![Ok(Bytes::from_static(data))]).boxed()
    }

    async fn read_all(client: &MemoryClient, path: &str) -> ClientResult<Vec<u8>> {
        let stream = client.get(path, &GetOptions::default()).await?;
        let chunks: Vec<Bytes> = stream
            .try_collect()
            .await
            .map_err(|e| ClientError::from_io(path, e))?;
        Ok(chunks.concat())
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let client = MemoryClient::new("mem");
        client.make_bucket("b");

        let outcome = client
            .put("b/k", body(b"hello"), 5, &PutOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.size, 5);
        assert!(outcome.version_id.is_some());
        assert_eq!(read_all(&client, "b/k").await.unwrap(), b"hello");
        assert_eq!(client.put_count("b/k"), 1);
    }

    #[tokio::test]
    async fn test_put_into_missing_bucket() {
        let client = MemoryClient::new("mem");
        let err = client
            .put("nope/k", body(b"x"), 1, &PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::BucketDoesNotExist { .. }));
    }

    #[tokio::test]
    async fn test_stat_prefix_is_directory() {
        let client = MemoryClient::new("mem");
        client.put_object("b/dir/a", b"1".to_vec());

        let content = client.stat("b/dir", &StatOptions::default()).await.unwrap();
        assert!(content.is_dir());
        let bucket = client.stat("b", &StatOptions::default()).await.unwrap();
        assert!(bucket.is_dir());
        let err = client.stat("b/none", &StatOptions::default()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_listing_flat_and_recursive() {
        let client = MemoryClient::new("mem");
        client.put_object("b/p/a", b"1".to_vec());
        client.put_object("b/p/sub/b", b"22".to_vec());
        client.put_object("b/p/sub/c", b"333".to_vec());
        client.put_object("b/q", b"x".to_vec());

        let flat: Vec<Content> = client
            .list("b/p", ListOptions::default())
            .try_collect()
            .await
            .unwrap();
        let flat_paths: Vec<&str> = flat.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(flat_paths, vec!["b/p/a", "b/p/sub"]);
        assert!(flat[1].is_dir());

        let deep: Vec<Content> = client
            .list("b/p/", ListOptions::recursive())
            .try_collect()
            .await
            .unwrap();
        let deep_paths: Vec<&str> = deep.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(deep_paths, vec!["b/p/a", "b/p/sub/b", "b/p/sub/c"]);
    }

    #[tokio::test]
    async fn test_listing_at_time_ref_selects_older_versions() {
        let client = MemoryClient::new("mem");
        let t0 = Utc::now() - ChronoDuration::days(10);
        client.put_object_at("b/k", b"old".to_vec(), t0);
        client.put_object_at("b/k", b"new".to_vec(), t0 + ChronoDuration::days(5));
        client.put_object_at("b/late", b"x".to_vec(), t0 + ChronoDuration::days(6));
        client.put_object_at("b/gone", b"x".to_vec(), t0);
        client.put_delete_marker_at("b/gone", t0 + ChronoDuration::days(1));

        let at = t0 + ChronoDuration::days(2);
        let entries: Vec<Content> = client
            .list("b", ListOptions::recursive().at_time(Some(at)))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "b/k");
        assert_eq!(entries[0].size, 3);
        assert!(!entries[0].is_latest);
    }

    #[tokio::test]
    async fn test_archival_object_cannot_be_read() {
        let client = MemoryClient::new("mem");
        client.put_object("b/cold", b"zzz".to_vec());
        client.set_storage_class("b/cold", "GLACIER");

        let err = read_all(&client, "b/cold").await.unwrap_err();
        assert!(matches!(err, ClientError::ObjectOnGlacier { .. }));
    }

    #[tokio::test]
    async fn test_fault_injection_is_consumed() {
        let client = MemoryClient::new("mem");
        client.make_bucket("b");
        client.inject_faults(
            Operation::Put,
            "b/k",
            ClientError::Network {
                message: "reset".into(),
            },
            2,
        );

        for _ in 0..2 {
            assert!(client
                .put("b/k", body(b"x"), 1, &PutOptions::default())
                .await
                .is_err());
        }
        assert!(client
            .put("b/k", body(b"x"), 1, &PutOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_delay_is_per_path() {
        let client = MemoryClient::new("mem");
        client.make_bucket("b");
        client.delay_writes("b/slow", Duration::from_secs(5));

        let start = tokio::time::Instant::now();
        client
            .put("b/fast", body(b"x"), 1, &PutOptions::default())
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        client
            .put("b/slow", body(b"x"), 1, &PutOptions::default())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(client.put_count("b/slow"), 1);
    }

    #[tokio::test]
    async fn test_interrupted_read() {
        let client = MemoryClient::new("mem");
        client.put_object("b/big", vec![7u8; 40_000]);
        client.interrupt_read_once("b/big", 20_000);

        let stream = client.get("b/big", &GetOptions::default()).await.unwrap();
        let results: Vec<io::Result<Bytes>> = stream.collect().await;
        let read: usize = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|b| b.len())
            .sum();
        assert_eq!(read, 20_000);
        assert!(results.last().unwrap().is_err());

        // Second read is clean
        assert_eq!(read_all(&client, "b/big").await.unwrap().len(), 40_000);
    }

    #[tokio::test]
    async fn test_remove_leaves_delete_marker() {
        let client = MemoryClient::new("mem");
        client.put_object("b/k", b"x".to_vec());
        client.remove("b/k", &RemoveOptions::default()).await.unwrap();

        assert!(client.object_data("b/k").is_none());
        assert_eq!(client.object_count(), 0);
        let err = client
            .remove("b/k", &RemoveOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_put_keeps_metadata() {
        let client = MemoryClient::new("mem");
        client.make_bucket("b");
        let mut options = PutOptions::default();
        options
            .metadata
            .insert(STORAGE_CLASS_HEADER.to_string(), "REDUCED_REDUNDANCY".to_string());
        options
            .user_metadata
            .insert("K1".to_string(), "v1".to_string());

        client.put("b/k", body(b"x"), 1, &options).await.unwrap();
        let content = client.object_content("b/k").unwrap();
        assert_eq!(content.storage_class.as_deref(), Some("REDUCED_REDUNDANCY"));
        assert_eq!(content.user_metadata.get("K1").map(String::as_str), Some("v1"));
    }

    #[tokio::test]
    async fn test_object_lock_flag() {
        let client = MemoryClient::new("mem");
        client.make_bucket("open");
        client.make_locked_bucket("locked");
        assert!(!client.object_lock_enabled("open/k").await.unwrap());
        assert!(client.object_lock_enabled("locked/k").await.unwrap());
    }
}
