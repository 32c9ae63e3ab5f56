//! Descriptors and option bundles shared by every storage client

use super::error::ClientResult;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;

/// Stream of object bytes
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Lazy listing result
pub type ContentStream = Pin<Box<dyn Stream<Item = ClientResult<Content>> + Send>>;

/// What a listed entry is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Object,
    Directory,
    Symlink,
}

/// One entry reported by `list` or `stat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    /// Client-relative path, `/` separated
    pub path: String,

    /// Size in bytes (0 for directories and delete markers)
    pub size: u64,

    /// Last modification time
    pub time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,

    #[serde(default)]
    pub is_delete_marker: bool,

    #[serde(default = "default_true")]
    pub is_latest: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    #[serde(default)]
    pub kind: ContentKind,

    /// System metadata (canonical header names)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    /// User-defined metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_metadata: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl Content {
    /// Describe a regular object
    pub fn object(path: impl Into<String>, size: u64, time: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            size,
            time,
            etag: None,
            version_id: None,
            is_delete_marker: false,
            is_latest: true,
            storage_class: None,
            kind: ContentKind::Object,
            metadata: BTreeMap::new(),
            user_metadata: BTreeMap::new(),
        }
    }

    /// Describe a directory or common prefix
    pub fn directory(path: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            kind: ContentKind::Directory,
            ..Self::object(path, 0, time)
        }
    }

    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == ContentKind::Directory
    }

    /// Regular objects are the only transferable entries
    pub fn is_regular(&self) -> bool {
        self.kind == ContentKind::Object && !self.is_delete_marker
    }
}

/// Options for listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    /// Descend into sub-prefixes
    pub recursive: bool,

    /// Report the namespace as it was at this instant
    pub time_ref: Option<DateTime<Utc>>,

    /// Report keys whose selected version is a delete marker
    pub with_delete_markers: bool,
}

impl ListOptions {
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            ..Default::default()
        }
    }

    pub fn at_time(mut self, time_ref: Option<DateTime<Utc>>) -> Self {
        self.time_ref = time_ref;
        self
    }
}

/// Options for stat
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatOptions {
    pub version_id: Option<String>,
    pub time_ref: Option<DateTime<Utc>>,
}

/// Options for get
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetOptions {
    pub version_id: Option<String>,
}

/// Metadata and strategy bundle for put and server-side copy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutOptions {
    /// System metadata (storage class, retention, legal hold, encryption)
    pub metadata: BTreeMap<String, String>,

    /// User-defined metadata
    pub user_metadata: BTreeMap<String, String>,

    /// Upload in a single request
    pub disable_multipart: bool,

    /// Send a content checksum with the upload
    pub md5: bool,
}

/// Final state of a written object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOutcome {
    pub size: u64,
    pub etag: Option<String>,
    pub version_id: Option<String>,
}

/// Options for remove
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoveOptions {
    pub version_id: Option<String>,
}
