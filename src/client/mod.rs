//! Storage client abstraction
//!
//! The transfer engine talks to every store through the [`StorageClient`]
//! trait. Two implementations ship with the crate:
//!
//! - [`LocalClient`]: the local filesystem, optionally rooted at a directory
//! - [`MemoryClient`]: versioned in-memory buckets, used by tests and as an
//!   embedded store
//!
//! URLs are resolved through an [`AliasRegistry`]: the first path segment of a
//! URL selects a registered client, anything else is a local path.
//!
//! # Example
//!
//! ```no_run
//! use ferry::client::{AliasRegistry, MemoryClient, StatOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemoryClient::new("play");
//!     store.make_bucket("photos");
//!     store.put_object("photos/a.jpg", b"jpeg bytes".to_vec());
//!
//!     let mut registry = AliasRegistry::new();
//!     registry.register("play", Arc::new(store));
//!
//!     let resolved = registry.resolve("play/photos/a.jpg");
//!     let content = resolved.client.stat(&resolved.path, &StatOptions::default()).await?;
//!     println!("{} is {} bytes", resolved.url(), content.size);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod local;
pub mod memory;
pub mod types;
pub mod url;

pub use error::{ClientError, ClientResult};
pub use local::LocalClient;
pub use memory::MemoryClient;
pub use types::{
    ByteStream, Content, ContentKind, ContentStream, GetOptions, ListOptions, PutOptions,
    PutOutcome, RemoveOptions, StatOptions,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Uniform access to one storage namespace
///
/// Paths are client-relative and `/` separated. For bucket stores the first
/// segment is the bucket name.
///
/// Implementors must be `Send + Sync`; one client is shared by every worker.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Short name used in logs and errors
    fn name(&self) -> &str;

    /// Describe a single object, directory or prefix
    ///
    /// # Errors
    ///
    /// Returns `ClientError::PathNotFound` if nothing exists at `path`.
    async fn stat(&self, path: &str, options: &StatOptions) -> ClientResult<Content>;

    /// Lazily list the entries under `path`
    ///
    /// If `path` names a single object the stream yields that object. Errors
    /// are reported in-band so one unreadable entry does not end the listing.
    fn list(&self, path: &str, options: ListOptions) -> ContentStream;

    /// Open an object for reading
    ///
    /// # Errors
    ///
    /// Returns `ClientError::PathNotFound` if the object is gone and
    /// `ClientError::IsDirectory` if `path` is a directory.
    async fn get(&self, path: &str, options: &GetOptions) -> ClientResult<ByteStream>;

    /// Write an object from a byte stream
    ///
    /// # Arguments
    ///
    /// * `path` - Destination path
    /// * `reader` - Object content
    /// * `size` - Expected length, used as a hint
    /// * `options` - Metadata and upload strategy
    async fn put(
        &self,
        path: &str,
        reader: ByteStream,
        size: u64,
        options: &PutOptions,
    ) -> ClientResult<PutOutcome>;

    /// Copy an object within this client without streaming it through ferry
    async fn copy(
        &self,
        source: &str,
        target: &str,
        size: u64,
        options: &PutOptions,
    ) -> ClientResult<PutOutcome>;

    /// Remove an object
    async fn remove(&self, path: &str, options: &RemoveOptions) -> ClientResult<()>;

    /// Whether the bucket holding `path` enforces object locking
    async fn object_lock_enabled(&self, _path: &str) -> ClientResult<bool> {
        Ok(false)
    }
}

/// A URL split into the client that serves it and the client-relative path
#[derive(Clone)]
pub struct ResolvedUrl {
    /// Alias name, empty for local paths
    pub alias: String,

    /// Client-relative path
    pub path: String,

    pub client: Arc<dyn StorageClient>,
}

impl ResolvedUrl {
    /// Full URL for this location
    pub fn url(&self) -> String {
        self.url_for(&self.path)
    }

    /// Full URL for another path served by the same client
    pub fn url_for(&self, path: &str) -> String {
        if self.alias.is_empty() {
            path.to_string()
        } else {
            url::join(&self.alias, path)
        }
    }

    /// Whether both locations are served by the same aliased client
    pub fn same_alias(&self, other: &ResolvedUrl) -> bool {
        !self.alias.is_empty() && self.alias == other.alias
    }
}

impl fmt::Debug for ResolvedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedUrl")
            .field("alias", &self.alias)
            .field("path", &self.path)
            .field("client", &self.client.name())
            .finish()
    }
}

/// Maps alias names to clients
///
/// ```
/// use ferry::client::{AliasRegistry, MemoryClient};
/// use std::sync::Arc;
///
/// let mut registry = AliasRegistry::new();
/// registry.register("play", Arc::new(MemoryClient::new("play")));
///
/// let remote = registry.resolve("play/bucket/key");
/// assert_eq!(remote.alias, "play");
/// assert_eq!(remote.path, "bucket/key");
///
/// let local = registry.resolve("/tmp/file.txt");
/// assert_eq!(local.alias, "");
/// assert_eq!(local.path, "/tmp/file.txt");
/// ```
pub struct AliasRegistry {
    aliases: HashMap<String, Arc<dyn StorageClient>>,
    local: Arc<dyn StorageClient>,
}

impl AliasRegistry {
    /// Registry with no aliases; every URL is a local path
    pub fn new() -> Self {
        Self {
            aliases: HashMap::new(),
            local: Arc::new(LocalClient::new()),
        }
    }

    /// Register (or replace) an alias
    pub fn register(&mut self, alias: impl Into<String>, client: Arc<dyn StorageClient>) {
        self.aliases.insert(alias.into(), client);
    }

    /// Registered alias names, sorted
    pub fn aliases(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.aliases.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Split `url` into alias, path and client
    pub fn resolve(&self, url: &str) -> ResolvedUrl {
        let normalized = url::normalize(url);
        let (head, rest) = match normalized.split_once(url::SEPARATOR) {
            Some((head, rest)) => (head, rest),
            None => (normalized.as_str(), ""),
        };

        match self.aliases.get(head) {
            Some(client) => ResolvedUrl {
                alias: head.to_string(),
                path: rest.to_string(),
                client: Arc::clone(client),
            },
            None => ResolvedUrl {
                alias: String::new(),
                path: normalized.clone(),
                client: Arc::clone(&self.local),
            },
        }
    }
}

impl Default for AliasRegistry {
    fn default() -> Self {
        Self::new()
    }
}
