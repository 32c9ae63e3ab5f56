/*!
 * URL enumeration: turning sources and a target into transfer tasks
 *
 * Copy shapes:
 *
 * - A: one object to a target that is not a folder, copied to the target as is
 * - B: one object to a folder, copied to `target/<basename>`
 * - C: one folder with `--recursive`, every object below it copied to
 *   `target/<path relative to the folder's parent>`
 * - D: several sources into a folder, each handled like B or C
 *
 * Tasks are produced lazily on a background task. Failures are reported
 * in-band as tasks carrying an [`EnumerationError`] and never stop the
 * remaining sources.
 */

use crate::client::url::{self, has_dir_suffix};
use crate::client::{AliasRegistry, Content, ListOptions, ResolvedUrl, StatOptions};
use crate::error::EnumerationError;
use crate::task::TransferTask;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Tasks buffered ahead of the consumer
const ENUMERATION_BUFFER: usize = 256;

pub type TaskStream = Pin<Box<dyn Stream<Item = TransferTask> + Send>>;

#[derive(Debug, Clone)]
pub struct EnumerateOptions {
    pub recursive: bool,
    /// Skip objects younger than this
    pub older_than: Option<Duration>,
    /// Skip objects this old or older
    pub newer_than: Option<Duration>,
    /// List the namespace as it was at this instant
    pub time_ref: Option<DateTime<Utc>>,
    /// Pin a single-object source to this version
    pub version_id: Option<String>,
    /// Instant object ages are measured from
    pub reference_time: DateTime<Utc>,
}

impl Default for EnumerateOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            older_than: None,
            newer_than: None,
            time_ref: None,
            version_id: None,
            reference_time: Utc::now(),
        }
    }
}

impl EnumerateOptions {
    /// Whether an object passes the age filters
    pub fn accepts_age(&self, time: DateTime<Utc>) -> bool {
        let age = (self.reference_time - time).to_std().unwrap_or(Duration::ZERO);
        if self.older_than.is_some_and(|min| age < min) {
            return false;
        }
        if self.newer_than.is_some_and(|max| age >= max) {
            return false;
        }
        true
    }

    fn stat_options(&self) -> StatOptions {
        StatOptions {
            version_id: self.version_id.clone(),
            time_ref: self.time_ref,
        }
    }

    /// Tasks carry a version only when a specific point in history was asked for
    fn pins_versions(&self) -> bool {
        self.version_id.is_some() || self.time_ref.is_some()
    }
}

/// Produce the transfer tasks for `sources` copied to `target`.
///
/// Must be called inside a Tokio runtime. Dropping the stream stops the
/// enumeration.
pub fn prepare_tasks(
    registry: Arc<AliasRegistry>,
    sources: Vec<String>,
    target: String,
    options: EnumerateOptions,
) -> TaskStream {
    let (tx, rx) = mpsc::channel(ENUMERATION_BUFFER);
    tokio::spawn(async move {
        let mut emitter = Emitter {
            tx,
            count: 0,
            size: 0,
        };
        let enumerator = Enumerator {
            registry,
            options,
        };
        enumerator.run(&sources, &target, &mut emitter).await;
        debug!(
            "Enumeration finished: {} objects, {} bytes",
            emitter.count, emitter.size
        );
    });

    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|task| (task, rx))
    })
    .boxed()
}

/// Stamps running totals and forwards tasks to the consumer
struct Emitter {
    tx: mpsc::Sender<TransferTask>,
    count: u64,
    size: u64,
}

impl Emitter {
    /// Returns `false` once the consumer is gone
    async fn emit(&mut self, mut task: TransferTask) -> bool {
        if !task.is_failed() {
            self.count += 1;
            self.size += task.source_size;
            task.total_count = self.count;
            task.total_size = self.size;
        }
        self.tx.send(task).await.is_ok()
    }

    async fn fail(&mut self, url: String, error: EnumerationError) -> bool {
        debug!("Enumeration error: {}", error);
        self.emit(TransferTask::failed(url, error)).await
    }
}

struct Enumerator {
    registry: Arc<AliasRegistry>,
    options: EnumerateOptions,
}

impl Enumerator {
    async fn run(&self, sources: &[String], target: &str, emitter: &mut Emitter) {
        let target = self.registry.resolve(target);
        let target_is_dir = self.is_dir(&target).await;

        if let [source] = sources {
            let source = self.registry.resolve(source);
            self.single_source(&source, &target, target_is_dir, emitter)
                .await;
            return;
        }

        if !target_is_dir {
            let url = target.url();
            emitter
                .fail(url.clone(), EnumerationError::TargetNotFolder { url })
                .await;
            return;
        }

        for source in sources {
            let source = self.registry.resolve(source);
            let Some(content) = self.stat_source(&source, emitter).await else {
                continue;
            };
            if content.is_dir() && !self.options.recursive {
                if !emitter
                    .fail(source.url(), EnumerationError::SourceIsFolder { url: source.url() })
                    .await
                {
                    return;
                }
                continue;
            }
            if !self.walk(&source, &target, emitter).await {
                return;
            }
        }
    }

    async fn single_source(
        &self,
        source: &ResolvedUrl,
        target: &ResolvedUrl,
        target_is_dir: bool,
        emitter: &mut Emitter,
    ) {
        let Some(content) = self.stat_source(source, emitter).await else {
            return;
        };

        if content.is_dir() {
            if self.options.recursive {
                self.walk(source, target, emitter).await;
            } else {
                emitter
                    .fail(source.url(), EnumerationError::SourceIsFolder { url: source.url() })
                    .await;
            }
            return;
        }

        if !content.is_regular() {
            emitter
                .fail(source.url(), EnumerationError::InvalidSource { url: source.url() })
                .await;
            return;
        }
        if !self.options.accepts_age(content.time) {
            return;
        }

        let target_path = if target_is_dir || self.options.recursive {
            url::join(&target.path, url::basename(&content.path))
        } else {
            target.path.clone()
        };
        if let Some(task) = self.make_task(source, &content, target, &target_path, emitter).await {
            emitter.emit(task).await;
        }
    }

    /// List everything below `source` into tasks; `false` once the consumer is gone
    async fn walk(&self, source: &ResolvedUrl, target: &ResolvedUrl, emitter: &mut Emitter) -> bool {
        let options = ListOptions {
            recursive: self.options.recursive,
            time_ref: self.options.time_ref,
            with_delete_markers: false,
        };
        let mut listing = source.client.list(&source.path, options);

        while let Some(entry) = listing.next().await {
            let content = match entry {
                Ok(content) => content,
                Err(e) => {
                    let url = source.url();
                    if !emitter
                        .fail(url.clone(), EnumerationError::Client { url, source: e })
                        .await
                    {
                        return false;
                    }
                    continue;
                }
            };

            if !content.is_regular() || !self.options.accepts_age(content.time) {
                continue;
            }

            let suffix = url::relative_suffix(&source.path, &content.path);
            let target_path = url::join(&target.path, suffix);
            if let Some(task) = self
                .make_task(source, &content, target, &target_path, emitter)
                .await
            {
                if !emitter.emit(task).await {
                    return false;
                }
            }
        }
        true
    }

    /// Stat a source, reporting failures in-band
    async fn stat_source(&self, source: &ResolvedUrl, emitter: &mut Emitter) -> Option<Content> {
        match source
            .client
            .stat(&source.path, &self.options.stat_options())
            .await
        {
            Ok(content) => Some(content),
            Err(e) => {
                let url = source.url();
                emitter
                    .fail(url.clone(), EnumerationError::Client { url, source: e })
                    .await;
                None
            }
        }
    }

    async fn is_dir(&self, target: &ResolvedUrl) -> bool {
        if has_dir_suffix(&target.path) {
            return true;
        }
        target
            .client
            .stat(&target.path, &StatOptions::default())
            .await
            .is_ok_and(|content| content.is_dir())
    }

    /// Build a task, or report it in-band when source and target coincide
    async fn make_task(
        &self,
        source: &ResolvedUrl,
        content: &Content,
        target: &ResolvedUrl,
        target_path: &str,
        emitter: &mut Emitter,
    ) -> Option<TransferTask> {
        let source_url = source.url_for(&content.path);
        let target_url = target.url_for(target_path);

        if source_url == target_url {
            emitter
                .fail(
                    source_url.clone(),
                    EnumerationError::SameSourceTarget { url: source_url },
                )
                .await;
            return None;
        }

        Some(TransferTask {
            source_alias: source.alias.clone(),
            source_url,
            source_size: content.size,
            source_version_id: if self.options.pins_versions() {
                content.version_id.clone()
            } else {
                None
            },
            source_mod_time: content.time,
            target_alias: target.alias.clone(),
            target_url,
            total_count: 0,
            total_size: 0,
            target_metadata: BTreeMap::new(),
            target_user_metadata: BTreeMap::new(),
            disable_multipart: false,
            force_checksum: false,
            error: None,
        })
    }
}
