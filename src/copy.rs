/*!
 * Copy and move orchestration
 *
 * [`run_direct`] pipes enumeration straight into the parallel manager.
 * [`run_session`] first persists every task to a session log and then
 * replays the log, so an interrupted batch can be resumed without
 * enumerating the sources again.
 *
 * In both modes a single collector consumes the results. It is the only
 * writer of the resume marker, which advances over the contiguous prefix
 * of completed tasks and freezes after a batch-fatal failure.
 */

use crate::accounting::{Accounter, Progress};
use crate::client::AliasRegistry;
use crate::enumerate::prepare_tasks;
use crate::error::{
    classify, ErrorClass, FerryError, Result, EXIT_FATAL, EXIT_INTERRUPTED, EXIT_PARTIAL,
    EXIT_SUCCESS,
};
use crate::manager::{HaltHandle, ManagerConfig, ParallelManager, QueuedTask, TransferResult};
use crate::options::{CommandType, TransferOptions};
use crate::output::{OutputWriter, Summary};
use crate::session::{session_identity, Session, SessionError, SessionStore};
use crate::transfer::{Transfer, DEFAULT_MAX_ATTEMPTS};
use chrono::Utc;
use ferry_core_resilience::retry_timer::BackoffConfig;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One `cp` or `mv` invocation
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub command: CommandType,
    pub sources: Vec<String>,
    pub target: String,
    pub options: TransferOptions,
    /// Record the batch in a resumable session
    pub session: bool,
}

impl TransferRequest {
    pub fn new(command: CommandType, sources: Vec<String>, target: impl Into<String>) -> Self {
        Self {
            command,
            sources,
            target: target.into(),
            options: TransferOptions::default(),
            session: false,
        }
    }

    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_session(mut self, session: bool) -> Self {
        self.session = session;
        self
    }

    /// Sources followed by the target, as recorded in a session
    fn command_args(&self) -> Vec<String> {
        let mut args = self.sources.clone();
        args.push(self.target.clone());
        args
    }

    /// Identity of the session this request runs under
    pub fn identity(&self) -> String {
        session_identity(
            self.command,
            &self.command_args(),
            &self.options.bool_flags(),
            &self.options.string_flags(),
        )
    }

    /// Rebuild the request a session was created for
    pub fn from_session(session: &Session) -> Result<Self> {
        let header = session.header();
        let Some((target, sources)) = header.command_args.split_last() else {
            return Err(FerryError::Session(SessionError::Corrupt {
                path: session.identity().into(),
                line: 0,
                reason: "session has no target".into(),
            }));
        };
        Ok(Self {
            command: header.command_type,
            sources: sources.to_vec(),
            target: target.clone(),
            options: TransferOptions::from_session_flags(&header.bool_flags, &header.string_flags),
            session: true,
        })
    }
}

/// Everything a run needs besides the request itself
pub struct TransferContext {
    pub registry: Arc<AliasRegistry>,
    pub store: SessionStore,
    pub progress: Arc<dyn Progress>,
    pub output: OutputWriter,
    pub cancel: CancellationToken,
    /// Workers; 0 selects the default
    pub concurrency: usize,
    pub backoff: BackoffConfig,
    pub max_attempts: u32,
    pub verify_resumed: bool,
}

impl TransferContext {
    /// Silent context; must be created inside a Tokio runtime
    pub fn new(registry: Arc<AliasRegistry>, store: SessionStore) -> Self {
        Self {
            registry,
            store,
            progress: Arc::new(Accounter::new(0)),
            output: OutputWriter::default(),
            cancel: CancellationToken::new(),
            concurrency: 0,
            backoff: BackoffConfig::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            verify_resumed: false,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_output(mut self, output: OutputWriter) -> Self {
        self.output = output;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry(mut self, backoff: BackoffConfig, max_attempts: u32) -> Self {
        self.backoff = backoff;
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_verify_resumed(mut self, verify: bool) -> Self {
        self.verify_resumed = verify;
        self
    }

    /// Build the executor for `request`, checking the target's object lock once
    async fn executor(&self, request: &TransferRequest) -> Result<Arc<Transfer>> {
        let target = self.registry.resolve(&request.target);
        let locked = match target.client.object_lock_enabled(&target.path).await {
            Ok(locked) => locked,
            Err(e) => {
                debug!("Object lock state of {} unknown: {}", request.target, e);
                false
            }
        };
        let decoration = request.options.decoration(Utc::now(), locked)?;

        Ok(Arc::new(
            Transfer::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.progress),
                self.cancel.clone(),
            )
            .with_decoration(decoration)
            .with_retry(self.backoff, self.max_attempts)
            .with_command(request.command)
            .verify_resumed(self.verify_resumed),
        ))
    }

    async fn manager(
        &self,
        request: &TransferRequest,
        resume_through: Option<u64>,
    ) -> Result<ParallelManager> {
        let config = ManagerConfig {
            concurrency: self.concurrency,
            resume_through,
        };
        let executor = self.executor(request).await?;
        Ok(ParallelManager::new(config, executor, &self.cancel))
    }
}

/// Run a request in the mode it asks for and map the outcome to an exit code
pub async fn run(ctx: &TransferContext, request: TransferRequest) -> i32 {
    let outcome = if request.session {
        run_session(ctx, request).await
    } else {
        run_direct(ctx, request).await
    };
    report(ctx, outcome)
}

/// Print the outcome of a run and map it to an exit code
pub fn report(ctx: &TransferContext, outcome: Result<Summary>) -> i32 {
    match outcome {
        Ok(summary) => {
            ctx.output.summary(&summary);
            summary.exit_code
        }
        Err(e) => {
            error!("{}", e);
            ctx.output.error(&e.to_string());
            e.exit_code()
        }
    }
}

/// Enumerate and transfer without persisting anything
pub async fn run_direct(ctx: &TransferContext, request: TransferRequest) -> Result<Summary> {
    request.options.validate(request.sources.len())?;
    let enumerate_options = request.options.enumerate_options(Utc::now())?;
    let manager = ctx.manager(&request, None).await?;
    info!(
        "Starting {} of {} source(s) to {} with {} workers",
        request.command,
        request.sources.len(),
        request.target,
        manager.concurrency()
    );

    let progress = Arc::clone(&ctx.progress);
    let tasks = prepare_tasks(
        Arc::clone(&ctx.registry),
        request.sources.clone(),
        request.target.clone(),
        enumerate_options,
    )
    .enumerate()
    .map(move |(seq, task)| {
        if !task.is_failed() {
            progress.set_total(task.total_size);
        }
        QueuedTask {
            seq: seq as u64,
            task,
        }
    });

    let halt = manager.halt_handle();
    let mut results = manager.run(tasks);
    let mut collector = Collector::new(ctx, halt, None, None);
    while let Some(result) = results.recv().await {
        collector.collect(result).await?;
    }
    Ok(collector.finish(None))
}

/// Transfer through a resumable session, creating or resuming it as needed
pub async fn run_session(ctx: &TransferContext, request: TransferRequest) -> Result<Summary> {
    request.options.validate(request.sources.len())?;
    let identity = request.identity();

    let session = match open_existing(ctx, &identity)? {
        Some(session) => {
            info!(
                "Resuming session {} ({} objects, completed through {:?})",
                identity,
                session.header().total_objects,
                session.header().completed_through
            );
            session
        }
        None => match record_tasks(ctx, &request, &identity).await? {
            Recorded::Complete(session, failed) => {
                return replay(ctx, &request, session, failed).await;
            }
            Recorded::Interrupted(failed) => {
                return Ok(Summary {
                    failed,
                    interrupted: true,
                    exit_code: EXIT_INTERRUPTED,
                    ..Default::default()
                });
            }
        },
    };

    ctx.progress.set_total(session.header().total_bytes);
    replay(ctx, &request, session, 0).await
}

/// Resume a session by identity with the request it was created for
pub async fn resume_session(ctx: &TransferContext, identity: &str) -> Result<Summary> {
    let session = ctx.store.load(identity)?;
    let request = TransferRequest::from_session(&session)?;
    if request.identity() != identity {
        warn!(
            "Session {} was recorded under a different identity ({})",
            identity,
            request.identity()
        );
    }
    drop(session);
    run_session(ctx, request).await
}

/// Load a resumable session; sessions whose totals were never written are discarded
fn open_existing(ctx: &TransferContext, identity: &str) -> Result<Option<Session>> {
    if !ctx.store.exists(identity) {
        return Ok(None);
    }
    let session = ctx.store.load(identity)?;
    if session.header().totals_written {
        return Ok(Some(session));
    }
    warn!(
        "Session {} was interrupted during enumeration, enumerating again",
        identity
    );
    session.delete()?;
    Ok(None)
}

enum Recorded {
    /// Session with totals written, and the number of errored tasks reported
    Complete(Session, u64),
    Interrupted(u64),
}

/// Enumerate into a fresh session log
async fn record_tasks(
    ctx: &TransferContext,
    request: &TransferRequest,
    identity: &str,
) -> Result<Recorded> {
    let enumerate_options = request.options.enumerate_options(Utc::now())?;
    let mut session = ctx.store.create(
        identity,
        request.command,
        request.command_args(),
        request.options.bool_flags(),
        request.options.string_flags(),
    )?;

    let mut tasks = prepare_tasks(
        Arc::clone(&ctx.registry),
        request.sources.clone(),
        request.target.clone(),
        enumerate_options,
    );
    let mut total_bytes = 0u64;
    let mut failed = 0u64;
    let interrupted = loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break true,
            next = tasks.next() => next,
        };
        let Some(task) = next else {
            break false;
        };

        if let Some(err) = &task.error {
            warn!("{}", err);
            ctx.output.error(&err.to_string());
            failed += 1;
            continue;
        }
        total_bytes += task.source_size;
        session.append_task(&task)?;
    };
    drop(tasks);

    if interrupted {
        info!("Interrupted during enumeration, discarding session {}", identity);
        session.delete()?;
        return Ok(Recorded::Interrupted(failed));
    }

    let total_objects = session.logged_tasks();
    session.set_totals(total_bytes, total_objects)?;
    session.save_async().await?;
    ctx.progress.set_total(total_bytes);
    info!(
        "Recorded {} objects ({} bytes) in session {}",
        total_objects, total_bytes, identity
    );
    Ok(Recorded::Complete(session, failed))
}

/// Replay a session log through the manager
async fn replay(
    ctx: &TransferContext,
    request: &TransferRequest,
    mut session: Session,
    enumeration_failures: u64,
) -> Result<Summary> {
    let total_objects = session.header().total_objects;
    let total_bytes = session.header().total_bytes;
    let resume_through = session.header().completed_through;

    let cursor_error: Arc<Mutex<Option<SessionError>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&cursor_error);
    let tasks = session
        .cursor()?
        .into_stream()
        .scan((), move |_, entry| {
            futures::future::ready(match entry {
                Ok((seq, mut task)) => {
                    task.total_count = total_objects;
                    task.total_size = total_bytes;
                    Some(QueuedTask { seq, task })
                }
                Err(e) => {
                    error!("Unable to read session log: {}", e);
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
                    None
                }
            })
        });

    let manager = ctx.manager(request, resume_through).await?;
    info!(
        "Running session {} with {} workers",
        session.identity(),
        manager.concurrency()
    );
    let halt = manager.halt_handle();
    let mut results = manager.run(tasks);

    let identity = session.identity().to_string();
    let mut collector = Collector::new(ctx, halt, Some(&mut session), resume_through);
    collector.summary.failed = enumeration_failures;
    while let Some(result) = results.recv().await {
        collector.collect(result).await?;
    }
    let next_seq = collector.tracker.next;
    let mut summary = collector.finish(Some(identity));

    let log_error = cursor_error
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(e) = log_error {
        return Err(FerryError::Session(e));
    }

    let finished =
        !summary.interrupted && summary.fatal == 0 && next_seq >= total_objects;
    if finished {
        session.delete()?;
        info!("Session {} finished", summary.session.as_deref().unwrap_or_default());
    } else {
        session.save_async().await?;
        summary.session_preserved = true;
        info!(
            "Session {} preserved, resume with `ferry session resume {}`",
            session.identity(),
            session.identity()
        );
    }
    Ok(summary)
}

/// Resume marker bookkeeping over out-of-order completions
#[derive(Debug)]
struct ResumeTracker {
    /// First sequence number not yet known to be completed
    next: u64,
    /// Completed beyond `next`, with the target of successful ones
    pending: BTreeMap<u64, Option<String>>,
    frozen: bool,
}

impl ResumeTracker {
    fn new(completed_through: Option<u64>) -> Self {
        Self {
            next: completed_through.map_or(0, |through| through + 1),
            pending: BTreeMap::new(),
            frozen: false,
        }
    }

    /// Record a completed task. Returns the latest successful target within
    /// the newly completed prefix and the prefix's last sequence number when
    /// the marker moves.
    fn complete(&mut self, seq: u64, target: Option<String>) -> Option<(Option<String>, u64)> {
        if self.frozen || seq < self.next {
            return None;
        }
        self.pending.insert(seq, target);

        let mut latest = None;
        let mut advanced = false;
        while let Some(target) = self.pending.remove(&self.next) {
            if target.is_some() {
                latest = target;
            }
            self.next += 1;
            advanced = true;
        }
        advanced.then(|| (latest, self.next - 1))
    }

    fn freeze(&mut self) {
        self.frozen = true;
    }
}

/// The single consumer of transfer results
struct Collector<'a> {
    ctx: &'a TransferContext,
    halt: HaltHandle,
    session: Option<&'a mut Session>,
    tracker: ResumeTracker,
    summary: Summary,
}

impl<'a> Collector<'a> {
    fn new(
        ctx: &'a TransferContext,
        halt: HaltHandle,
        session: Option<&'a mut Session>,
        resume_through: Option<u64>,
    ) -> Self {
        let last_completed = session
            .as_ref()
            .and_then(|s| s.header().last_completed.clone());
        Self {
            ctx,
            halt,
            session,
            tracker: ResumeTracker::new(resume_through),
            summary: Summary {
                last_completed,
                ..Default::default()
            },
        }
    }

    async fn collect(&mut self, result: TransferResult) -> Result<()> {
        let advanced = match &result.outcome {
            Ok(success) => {
                if success.faked {
                    self.summary.skipped += 1;
                } else {
                    self.summary.succeeded += 1;
                    self.summary.bytes += success.bytes;
                }
                self.ctx.output.task_result(&result);
                self.tracker
                    .complete(result.seq, Some(result.task.target_url.clone()))
            }
            Err(FerryError::Cancelled) if self.ctx.cancel.is_cancelled() => {
                debug!("Skipped {} after interrupt", result.task.source_url);
                self.summary.cancelled += 1;
                None
            }
            Err(e) => match classify(e) {
                ErrorClass::Ignorable => {
                    warn!("{}", e);
                    self.summary.failed += 1;
                    self.ctx.output.task_result(&result);
                    self.tracker.complete(result.seq, None)
                }
                ErrorClass::BatchFatal | ErrorClass::Checkpoint => {
                    error!("{}", e);
                    self.summary.fatal += 1;
                    self.ctx.output.task_result(&result);
                    self.tracker.freeze();
                    self.halt.halt();
                    None
                }
            },
        };

        if let Some((target, through)) = advanced {
            if target.is_some() {
                self.summary.last_completed.clone_from(&target);
            }
            if let Some(session) = self.session.as_deref_mut() {
                session.set_last_completed(target, through);
                if let Err(e) = session.save_async().await {
                    error!("Unable to save session {}: {}", session.identity(), e);
                    self.halt.halt();
                    return Err(FerryError::Session(e));
                }
            }
        }
        Ok(())
    }

    fn finish(self, session: Option<String>) -> Summary {
        let mut summary = self.summary;
        summary.session = session;
        summary.stat = Some(self.ctx.progress.finish());
        summary.interrupted = self.ctx.cancel.is_cancelled();
        summary.exit_code = if summary.interrupted {
            EXIT_INTERRUPTED
        } else if summary.fatal > 0 {
            EXIT_FATAL
        } else if summary.failed > 0 {
            EXIT_PARTIAL
        } else {
            EXIT_SUCCESS
        };
        summary
    }
}
