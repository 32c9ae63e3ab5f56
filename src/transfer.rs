/*!
 * Transfer executor: the storage work behind one task
 *
 * A task is copied server-side when source and target live behind the same
 * alias, otherwise the source is streamed into the target. Transient
 * failures are retried with exponential backoff; bytes re-read by a retry
 * are not credited twice.
 */

use crate::accounting::{Progress, TaskProgress};
use crate::client::{
    url, AliasRegistry, GetOptions, PutOptions, PutOutcome, RemoveOptions, ResolvedUrl,
    StatOptions,
};
use crate::error::{FerryError, Result};
use crate::manager::{TaskExecutor, TransferSuccess};
use crate::options::{CommandType, LegalHold, RetentionMode};
use crate::task::{
    TransferTask, ENCRYPTION_HEADER, LEGAL_HOLD_HEADER, LOCK_MODE_HEADER,
    LOCK_RETAIN_UNTIL_HEADER, PRESERVED_ATTRS_KEY, STORAGE_CLASS_HEADER,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use ferry_core_resilience::retry_timer::{BackoffConfig, RetryTimer};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Attempts per task unless configured otherwise
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Server-side encryption algorithm applied under `--encrypt` prefixes
const ENCRYPTION_ALGORITHM: &str = "AES256";

/// Run-wide metadata merged into every task before it executes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoration {
    pub storage_class: Option<String>,
    /// Mode and the retain-until instant
    pub retention: Option<(RetentionMode, DateTime<Utc>)>,
    pub legal_hold: Option<LegalHold>,
    /// Target URL prefixes that get server-side encryption
    pub encrypt_prefixes: Vec<String>,
    pub user_metadata: BTreeMap<String, String>,
    /// Record the source modification time in user metadata
    pub preserve: bool,
    pub disable_multipart: bool,
    pub force_checksum: bool,
}

impl Decoration {
    pub fn apply(&self, task: &mut TransferTask) {
        let metadata = &mut task.target_metadata;
        if let Some(class) = &self.storage_class {
            metadata.insert(STORAGE_CLASS_HEADER.to_string(), class.clone());
        }
        if let Some((mode, until)) = &self.retention {
            metadata.insert(LOCK_MODE_HEADER.to_string(), mode.as_header().to_string());
            metadata.insert(
                LOCK_RETAIN_UNTIL_HEADER.to_string(),
                until.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }
        if let Some(hold) = &self.legal_hold {
            metadata.insert(LEGAL_HOLD_HEADER.to_string(), hold.as_header().to_string());
        }
        if self.encrypts(&task.target_url) {
            metadata.insert(
                ENCRYPTION_HEADER.to_string(),
                ENCRYPTION_ALGORITHM.to_string(),
            );
        }

        task.target_user_metadata.extend(
            self.user_metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        if self.preserve {
            task.target_user_metadata.insert(
                PRESERVED_ATTRS_KEY.to_string(),
                format!("mtime:{}", task.source_mod_time.timestamp()),
            );
        }

        task.disable_multipart |= self.disable_multipart;
        task.force_checksum |= self.force_checksum;
    }

    fn encrypts(&self, target_url: &str) -> bool {
        let target = url::normalize(target_url);
        self.encrypt_prefixes
            .iter()
            .map(|prefix| url::normalize(prefix))
            .any(|prefix| !prefix.is_empty() && target.starts_with(&prefix))
    }
}

/// Executes tasks against the clients of an [`AliasRegistry`]
pub struct Transfer {
    registry: Arc<AliasRegistry>,
    progress: Arc<dyn Progress>,
    decoration: Decoration,
    backoff: BackoffConfig,
    max_attempts: u32,
    cancel: CancellationToken,
    command: CommandType,
    verify_resumed: bool,
}

impl Transfer {
    pub fn new(
        registry: Arc<AliasRegistry>,
        progress: Arc<dyn Progress>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            progress,
            decoration: Decoration::default(),
            backoff: BackoffConfig::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cancel,
            command: CommandType::Cp,
            verify_resumed: false,
        }
    }

    pub fn with_decoration(mut self, decoration: Decoration) -> Self {
        self.decoration = decoration;
        self
    }

    pub fn with_retry(mut self, backoff: BackoffConfig, max_attempts: u32) -> Self {
        self.backoff = backoff;
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_command(mut self, command: CommandType) -> Self {
        self.command = command;
        self
    }

    /// Stat targets of resumed tasks and copy them again when missing
    pub fn verify_resumed(mut self, verify: bool) -> Self {
        self.verify_resumed = verify;
        self
    }

    async fn attempt(
        &self,
        source: &ResolvedUrl,
        target: &ResolvedUrl,
        task: &TransferTask,
        options: &PutOptions,
        tracker: &Arc<TaskProgress>,
    ) -> Result<PutOutcome> {
        if source.same_alias(target) && task.source_version_id.is_none() {
            return target
                .client
                .copy(&source.path, &target.path, task.source_size, options)
                .await
                .map_err(|e| FerryError::client(&task.target_url, e));
        }

        let get_options = GetOptions {
            version_id: task.source_version_id.clone(),
        };
        let reader = source
            .client
            .get(&source.path, &get_options)
            .await
            .map_err(|e| FerryError::client(&task.source_url, e))?;

        target
            .client
            .put(&target.path, tracker.track(reader), task.source_size, options)
            .await
            .map_err(|e| FerryError::client(&task.target_url, e))
    }

    async fn remove_source(&self, source: &ResolvedUrl, task: &TransferTask) -> Result<()> {
        let options = RemoveOptions {
            version_id: task.source_version_id.clone(),
        };
        source
            .client
            .remove(&source.path, &options)
            .await
            .map_err(|e| FerryError::client(&task.source_url, e))?;
        debug!("Removed source {}", task.source_url);
        Ok(())
    }
}

#[async_trait]
impl TaskExecutor for Transfer {
    fn decorate(&self, task: &mut TransferTask) {
        self.decoration.apply(task);
    }

    async fn execute(&self, task: &TransferTask) -> Result<TransferSuccess> {
        if self.cancel.is_cancelled() {
            return Err(FerryError::Cancelled);
        }

        let source = self.registry.resolve(&task.source_url);
        let target = self.registry.resolve(&task.target_url);
        let options = PutOptions {
            metadata: task.target_metadata.clone(),
            user_metadata: task.target_user_metadata.clone(),
            disable_multipart: task.disable_multipart,
            md5: task.force_checksum,
        };
        let tracker = TaskProgress::new(Arc::clone(&self.progress));
        let mut timer =
            RetryTimer::new(self.backoff, self.cancel.clone()).with_max_attempts(self.max_attempts);

        let mut last_error = None;
        while let Some(attempt) = timer.next().await {
            match self
                .attempt(&source, &target, task, &options, &tracker)
                .await
            {
                Ok(outcome) => {
                    tracker.observe(outcome.size);
                    if self.command.removes_source() {
                        self.remove_source(&source, task).await?;
                    }
                    debug!(
                        "Transferred {} -> {} ({} bytes, attempt {})",
                        task.source_url,
                        task.target_url,
                        outcome.size,
                        attempt + 1
                    );
                    return Ok(TransferSuccess {
                        bytes: outcome.size,
                        etag: outcome.etag,
                        version_id: outcome.version_id,
                        faked: false,
                    });
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Attempt {} of {} for {} failed: {}",
                        attempt + 1,
                        self.max_attempts,
                        task.source_url,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(FerryError::Cancelled))
    }

    async fn fake(&self, task: &TransferTask) -> Result<TransferSuccess> {
        if self.verify_resumed {
            let target = self.registry.resolve(&task.target_url);
            if let Err(e) = target
                .client
                .stat(&target.path, &StatOptions::default())
                .await
            {
                if !e.is_not_found() {
                    return Err(FerryError::client(&task.target_url, e));
                }
                debug!(
                    "Resumed target {} is missing, transferring again",
                    task.target_url
                );
                let mut task = task.clone();
                self.decorate(&mut task);
                return self.execute(&task).await;
            }
        }

        self.progress.add(task.source_size);
        Ok(TransferSuccess {
            faked: true,
            ..Default::default()
        })
    }
}
