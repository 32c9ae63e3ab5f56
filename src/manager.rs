/*!
 * Parallel transfer manager
 *
 * One producer feeds a bounded queue that is drained by a fixed pool of
 * workers. Results flow into an elastic queue, so a slow consumer never
 * stalls the workers, and are delivered in completion order.
 *
 * ```text
 *  tasks ──► producer ──► [bounded queue, depth N] ──► N workers ──► elastic results ──► collector
 *               ▲                                          │
 *               └──── halt / cancel stop the producer      └── fake | decorate + execute
 * ```
 *
 * Stopping (either the cancellation token or [`HaltHandle::halt`]) only stops
 * the producer: the queue is closed, workers finish what was already queued
 * and every result is still delivered.
 */

use crate::error::{classify, ErrorClass, FerryError, Result};
use crate::task::TransferTask;
use async_trait::async_trait;
use ferry_core_resilience::elastic::{elastic_channel, ElasticReceiver};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Lower bound for the default worker count
pub const MIN_DEFAULT_CONCURRENCY: usize = 4;
/// Upper bound for the default worker count
pub const MAX_DEFAULT_CONCURRENCY: usize = 128;

/// Worker count used when none is configured
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_DEFAULT_CONCURRENCY)
        .clamp(MIN_DEFAULT_CONCURRENCY, MAX_DEFAULT_CONCURRENCY)
}

/// Per-task storage work performed by a worker
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Merge run-wide metadata into a task before it executes
    fn decorate(&self, _task: &mut TransferTask) {}

    /// Perform the transfer
    async fn execute(&self, task: &TransferTask) -> Result<TransferSuccess>;

    /// Account for a task completed by an earlier run without touching storage
    async fn fake(&self, task: &TransferTask) -> Result<TransferSuccess>;
}

/// A task with its position in the batch
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub seq: u64,
    pub task: TransferTask,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSuccess {
    /// Bytes moved by this run (0 when faked)
    pub bytes: u64,
    pub etag: Option<String>,
    pub version_id: Option<String>,
    /// Completed by an earlier run
    pub faked: bool,
}

#[derive(Debug)]
pub struct TransferResult {
    pub seq: u64,
    pub task: TransferTask,
    pub outcome: std::result::Result<TransferSuccess, FerryError>,
}

impl TransferResult {
    /// Failure class, `None` on success
    pub fn error_class(&self) -> Option<ErrorClass> {
        self.outcome.as_ref().err().map(classify)
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub type ResultStream = ElasticReceiver<TransferResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Workers and queue depth; 0 selects [`default_concurrency`]
    pub concurrency: usize,
    /// Tasks with `seq <= resume_through` are faked
    pub resume_through: Option<u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            resume_through: None,
        }
    }
}

/// Stops a running manager from taking new tasks
#[derive(Debug, Clone)]
pub struct HaltHandle {
    token: CancellationToken,
}

impl HaltHandle {
    pub fn halt(&self) {
        self.token.cancel();
    }

    pub fn is_halted(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct ParallelManager {
    concurrency: usize,
    resume_through: Option<u64>,
    executor: Arc<dyn TaskExecutor>,
    halt: CancellationToken,
}

impl ParallelManager {
    pub fn new(
        config: ManagerConfig,
        executor: Arc<dyn TaskExecutor>,
        cancel: &CancellationToken,
    ) -> Self {
        let concurrency = if config.concurrency == 0 {
            default_concurrency()
        } else {
            config.concurrency
        };
        Self {
            concurrency,
            resume_through: config.resume_through,
            executor,
            halt: cancel.child_token(),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn halt_handle(&self) -> HaltHandle {
        HaltHandle {
            token: self.halt.clone(),
        }
    }

    /// Start the producer and workers; must be called inside a Tokio runtime
    pub fn run<S>(self, tasks: S) -> ResultStream
    where
        S: Stream<Item = QueuedTask> + Send + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::channel::<QueuedTask>(self.concurrency);
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let (result_tx, result_rx) = elastic_channel(self.concurrency);

        let halt = self.halt.clone();
        tokio::spawn(async move {
            let mut tasks = Box::pin(tasks);
            let mut queued = 0u64;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = halt.cancelled() => break,
                    next = tasks.next() => next,
                };
                let Some(item) = next else {
                    break;
                };
                tokio::select! {
                    biased;
                    _ = halt.cancelled() => break,
                    sent = queue_tx.send(item) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
                queued += 1;
            }
            debug!("Producer finished after queueing {} tasks", queued);
        });

        for worker in 0..self.concurrency {
            let queue_rx = Arc::clone(&queue_rx);
            let result_tx = result_tx.clone();
            let executor = Arc::clone(&self.executor);
            let resume_through = self.resume_through;

            tokio::spawn(async move {
                loop {
                    let item = queue_rx.lock().await.recv().await;
                    let Some(QueuedTask { seq, mut task }) = item else {
                        break;
                    };
                    trace!(worker, seq, "Processing {}", task.source_url);
                    let outcome = process(executor.as_ref(), seq, &mut task, resume_through).await;
                    if result_tx
                        .send(TransferResult { seq, task, outcome })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        result_rx
    }
}

async fn process(
    executor: &dyn TaskExecutor,
    seq: u64,
    task: &mut TransferTask,
    resume_through: Option<u64>,
) -> std::result::Result<TransferSuccess, FerryError> {
    if let Some(error) = &task.error {
        return Err(FerryError::Enumeration(error.clone()));
    }
    if resume_through.is_some_and(|through| seq <= through) {
        return executor.fake(task).await;
    }
    executor.decorate(task);
    executor.execute(task).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use crate::error::EnumerationError;
    use chrono::Utc;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn task(name: &str, size: u64) -> TransferTask {
        TransferTask {
            source_alias: String::new(),
            source_url: format!("/src/{}", name),
            source_size: size,
            source_version_id: None,
            source_mod_time: Utc::now(),
            target_alias: String::new(),
            target_url: format!("/dst/{}", name),
            total_count: 0,
            total_size: 0,
            target_metadata: BTreeMap::new(),
            target_user_metadata: BTreeMap::new(),
            disable_multipart: false,
            force_checksum: false,
            error: None,
        }
    }

    fn queued(count: u64) -> Vec<QueuedTask> {
        (0..count)
            .map(|seq| QueuedTask {
                seq,
                task: task(&format!("f{}", seq), seq + 1),
            })
            .collect()
    }

    #[derive(Default)]
    struct Recorder {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        executed: AtomicUsize,
        faked: AtomicUsize,
        delay: Duration,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl TaskExecutor for Recorder {
        fn decorate(&self, task: &mut TransferTask) {
            task.target_metadata
                .insert("X-Amz-Storage-Class".into(), "STANDARD".into());
        }

        async fn execute(&self, task: &TransferTask) -> Result<TransferSuccess> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.executed.fetch_add(1, Ordering::SeqCst);

            if self.fail_on.as_deref() == Some(task.source_url.as_str()) {
                return Err(FerryError::client(
                    &task.source_url,
                    ClientError::PermissionDenied {
                        path: task.source_url.clone(),
                    },
                ));
            }
            Ok(TransferSuccess {
                bytes: task.source_size,
                ..Default::default()
            })
        }

        async fn fake(&self, _task: &TransferTask) -> Result<TransferSuccess> {
            self.faked.fetch_add(1, Ordering::SeqCst);
            Ok(TransferSuccess {
                faked: true,
                ..Default::default()
            })
        }
    }

    async fn run_all(
        executor: Arc<Recorder>,
        config: ManagerConfig,
        tasks: Vec<QueuedTask>,
    ) -> Vec<TransferResult> {
        let cancel = CancellationToken::new();
        let manager = ParallelManager::new(config, executor, &cancel);
        manager.run(futures::stream::iter(tasks)).collect().await
    }

    #[tokio::test]
    async fn test_every_task_yields_one_result() {
        let executor = Arc::new(Recorder::default());
        let config = ManagerConfig {
            concurrency: 4,
            resume_through: None,
        };
        let results = run_all(Arc::clone(&executor), config, queued(50)).await;

        assert_eq!(results.len(), 50);
        let seqs: HashSet<u64> = results.iter().map(|r| r.seq).collect();
        assert_eq!(seqs.len(), 50);
        assert!(results.iter().all(|r| r.is_success()));
        assert!(results
            .iter()
            .all(|r| r.task.target_metadata.contains_key("X-Amz-Storage-Class")));
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_concurrency() {
        let executor = Arc::new(Recorder {
            delay: Duration::from_millis(5),
            ..Default::default()
        });
        let config = ManagerConfig {
            concurrency: 3,
            resume_through: None,
        };
        let results = run_all(Arc::clone(&executor), config, queued(30)).await;

        assert_eq!(results.len(), 30);
        let peak = executor.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak in flight was {}", peak);
        assert!(peak >= 2, "workers did not run in parallel");
    }

    #[tokio::test]
    async fn test_resume_fakes_completed_prefix() {
        let executor = Arc::new(Recorder::default());
        let config = ManagerConfig {
            concurrency: 2,
            resume_through: Some(2),
        };
        let results = run_all(Arc::clone(&executor), config, queued(5)).await;

        assert_eq!(executor.faked.load(Ordering::SeqCst), 3);
        assert_eq!(executor.executed.load(Ordering::SeqCst), 2);
        for result in &results {
            let success = result.outcome.as_ref().unwrap();
            assert_eq!(success.faked, result.seq <= 2);
        }
    }

    #[tokio::test]
    async fn test_enumeration_errors_skip_executor() {
        let executor = Arc::new(Recorder::default());
        let mut tasks = queued(2);
        tasks.push(QueuedTask {
            seq: 2,
            task: TransferTask::failed(
                "/src/dir",
                EnumerationError::SourceIsFolder {
                    url: "/src/dir".into(),
                },
            ),
        });

        let results = run_all(Arc::clone(&executor), ManagerConfig::default(), tasks).await;
        assert_eq!(results.len(), 3);
        assert_eq!(executor.executed.load(Ordering::SeqCst), 2);
        let failed: Vec<_> = results.iter().filter(|r| !r.is_success()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_class(), Some(ErrorClass::Ignorable));
    }

    #[tokio::test]
    async fn test_halt_stops_intake_and_drains() {
        let executor = Arc::new(Recorder {
            delay: Duration::from_millis(2),
            fail_on: Some("/src/f0".into()),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let manager = ParallelManager::new(
            ManagerConfig {
                concurrency: 1,
                resume_through: None,
            },
            Arc::clone(&executor) as Arc<dyn TaskExecutor>,
            &cancel,
        );
        let halt = manager.halt_handle();
        let mut results = manager.run(futures::stream::iter(queued(100)));

        let mut received = 0;
        while let Some(result) = results.next().await {
            if result.error_class() == Some(ErrorClass::BatchFatal) {
                halt.halt();
            }
            received += 1;
        }

        assert!(halt.is_halted());
        assert!(received < 100, "halt did not stop intake");
        assert_eq!(received, executor.executed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_halts_manager() {
        let executor = Arc::new(Recorder {
            delay: Duration::from_millis(2),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let manager = ParallelManager::new(
            ManagerConfig {
                concurrency: 2,
                resume_through: None,
            },
            Arc::clone(&executor) as Arc<dyn TaskExecutor>,
            &cancel,
        );
        let halt = manager.halt_handle();
        let mut results = manager.run(futures::stream::iter(queued(200)));

        let first = results.next().await;
        assert!(first.is_some());
        cancel.cancel();
        assert!(halt.is_halted());

        let rest: Vec<_> = results.collect().await;
        assert!(rest.len() + 1 < 200);
    }

    #[test]
    fn test_default_concurrency_bounds() {
        let n = default_concurrency();
        assert!((MIN_DEFAULT_CONCURRENCY..=MAX_DEFAULT_CONCURRENCY).contains(&n));
    }
}
