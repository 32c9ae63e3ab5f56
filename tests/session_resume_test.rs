use ferry::accounting::{Accounter, AccountStat, Progress};
use ferry::client::memory::Operation;
use ferry::client::{AliasRegistry, ClientError, MemoryClient, StorageClient};
use ferry::copy::{resume_session, run_session, TransferContext, TransferRequest};
use ferry::enumerate::{prepare_tasks, EnumerateOptions};
use ferry::error::{EXIT_FATAL, EXIT_INTERRUPTED, EXIT_SUCCESS};
use ferry::options::{CommandType, TransferOptions};
use ferry::session::SessionStore;
use ferry::task::TransferTask;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const MB: usize = 1024 * 1024;

/// Pulls the plug once `limit` bytes have been read
struct CancelAfter {
    inner: Accounter,
    limit: u64,
    cancel: CancellationToken,
}

impl Progress for CancelAfter {
    fn set_total(&self, total: u64) {
        self.inner.set_total(total);
    }

    fn add(&self, n: u64) -> u64 {
        let value = self.inner.add(n);
        if value >= self.limit {
            self.cancel.cancel();
        }
        value
    }

    fn get(&self) -> u64 {
        self.inner.get()
    }

    fn total(&self) -> u64 {
        self.inner.total()
    }

    fn stat(&self) -> AccountStat {
        self.inner.stat()
    }

    fn finish(&self) -> AccountStat {
        self.inner.finish()
    }
}

struct Fixture {
    src: MemoryClient,
    dst: MemoryClient,
    sessions: TempDir,
}

impl Fixture {
    fn new(dst: MemoryClient) -> Self {
        dst.make_bucket("out");
        Self {
            src: MemoryClient::new("src"),
            dst,
            sessions: TempDir::new().unwrap(),
        }
    }

    fn registry(&self) -> Arc<AliasRegistry> {
        let mut registry = AliasRegistry::new();
        registry.register("src", Arc::new(self.src.clone()));
        registry.register("dst", Arc::new(self.dst.clone()));
        Arc::new(registry)
    }

    fn store(&self) -> SessionStore {
        SessionStore::new(self.sessions.path())
    }

    fn context(&self) -> TransferContext {
        TransferContext::new(self.registry(), self.store())
    }
}

fn recursive_copy() -> TransferRequest {
    TransferRequest::new(CommandType::Cp, vec!["src/in/".into()], "dst/out/")
        .with_options(TransferOptions {
            recursive: true,
            ..Default::default()
        })
        .with_session(true)
}

#[tokio::test]
async fn test_completed_session_is_deleted() {
    let fx = Fixture::new(MemoryClient::new("dst"));
    for i in 0..10 {
        fx.src.put_object(&format!("in/{:02}", i), vec![0u8; 10]);
    }

    let request = recursive_copy();
    let identity = request.identity();
    let summary = run_session(&fx.context(), request).await.unwrap();

    assert_eq!(summary.exit_code, EXIT_SUCCESS);
    assert_eq!(summary.succeeded, 10);
    assert_eq!(summary.session.as_deref(), Some(identity.as_str()));
    assert!(!summary.session_preserved);
    assert!(!fx.store().exists(&identity));
}

#[tokio::test]
async fn test_interrupted_run_resumes_without_repeating_work() {
    let fx = Fixture::new(MemoryClient::new("dst"));
    const N: usize = 12;
    const K: usize = 5;
    for i in 0..N {
        fx.src.put_object(&format!("in/{:02}", i), vec![i as u8; 100]);
    }

    let cancel = CancellationToken::new();
    let progress = Arc::new(CancelAfter {
        inner: Accounter::new(0),
        limit: (K * 100) as u64,
        cancel: cancel.clone(),
    });
    let ctx = fx
        .context()
        .with_concurrency(1)
        .with_progress(progress)
        .with_cancel(cancel);
    let request = recursive_copy();
    let identity = request.identity();

    let first = run_session(&ctx, request.clone()).await.unwrap();
    assert_eq!(first.exit_code, EXIT_INTERRUPTED);
    assert_eq!(first.succeeded, K as u64);
    assert!(first.session_preserved);
    let header = fx.store().load(&identity).unwrap().header().clone();
    assert_eq!(header.completed_through, Some(K as u64 - 1));
    assert_eq!(header.last_completed.as_deref(), Some("dst/out/04"));

    let second = run_session(&fx.context(), request).await.unwrap();
    assert_eq!(second.exit_code, EXIT_SUCCESS);
    assert_eq!(second.skipped, K as u64);
    assert_eq!(second.succeeded, (N - K) as u64);

    assert_eq!(fx.dst.object_count(), N);
    for i in 0..N {
        assert_eq!(fx.dst.put_count(&format!("out/{:02}", i)), 1, "object {}", i);
    }
    assert!(!fx.store().exists(&identity));
}

#[tokio::test]
async fn test_resume_by_identity() {
    let fx = Fixture::new(MemoryClient::new("dst"));
    for i in 0..4 {
        fx.src.put_object(&format!("in/{}", i), vec![1u8; 50]);
    }

    let cancel = CancellationToken::new();
    let progress = Arc::new(CancelAfter {
        inner: Accounter::new(0),
        limit: 50,
        cancel: cancel.clone(),
    });
    let ctx = fx
        .context()
        .with_concurrency(1)
        .with_progress(progress)
        .with_cancel(cancel);
    let request = recursive_copy();
    let identity = request.identity();
    run_session(&ctx, request).await.unwrap();

    let sessions = fx.store().list().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].identity, identity);

    let summary = resume_session(&fx.context(), &identity).await.unwrap();
    assert_eq!(summary.exit_code, EXIT_SUCCESS);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(fx.dst.object_count(), 4);
}

#[tokio::test]
async fn test_five_task_session_fakes_the_completed_prefix() {
    let fx = Fixture::new(MemoryClient::new("dst"));
    let sizes = [10usize, 20, 30, 40, 50];
    for (i, size) in sizes.iter().enumerate() {
        fx.src.put_object(&format!("in/{}", i + 1), vec![7u8; *size]);
    }

    let request = recursive_copy();
    let tasks: Vec<TransferTask> = prepare_tasks(
        fx.registry(),
        request.sources.clone(),
        request.target.clone(),
        EnumerateOptions {
            recursive: true,
            ..Default::default()
        },
    )
    .collect()
    .await;
    assert_eq!(tasks.len(), 5);

    let identity = request.identity();
    let mut session = fx
        .store()
        .create(
            &identity,
            request.command,
            vec!["src/in/".into(), "dst/out/".into()],
            request.options.bool_flags(),
            request.options.string_flags(),
        )
        .unwrap();
    for task in &tasks {
        session.append_task(task).unwrap();
    }
    session.set_totals(150, 5).unwrap();
    session.set_last_completed(Some(tasks[2].target_url.clone()), 2);
    session.save().unwrap();
    drop(session);

    let progress = Arc::new(Accounter::new(0));
    let ctx = fx.context().with_progress(progress.clone());
    let summary = run_session(&ctx, request).await.unwrap();

    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.bytes, 90);
    assert_eq!(progress.get(), 150);
    assert_eq!(progress.total(), 150);
    for i in 1..=3 {
        assert_eq!(fx.dst.put_count(&format!("out/{}", i)), 0);
    }
    for i in 4..=5 {
        assert_eq!(fx.dst.put_count(&format!("out/{}", i)), 1);
    }
}

#[tokio::test]
async fn test_fatal_failure_freezes_the_marker() {
    let fx = Fixture::new(MemoryClient::new("dst"));
    fx.src.put_object("in/a", vec![1u8; MB]);
    fx.src.put_object("in/b", vec![2u8; 2 * MB]);
    fx.src.put_object("in/c", vec![3u8; 4 * MB]);
    // b is still uploading when c fails
    fx.dst.delay_writes("out/b", Duration::from_millis(400));
    fx.dst.inject_fault(
        Operation::Put,
        "out/c",
        ClientError::PermissionDenied {
            path: "out/c".into(),
        },
    );

    let request = recursive_copy();
    let identity = request.identity();
    let summary = run_session(&fx.context().with_concurrency(2), request.clone())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.fatal, 1);
    assert_eq!(summary.exit_code, EXIT_FATAL);
    assert!(summary.session_preserved);
    assert_eq!(fx.dst.put_count("out/b"), 1);

    let session = fx.store().load(&identity).unwrap();
    let header = session.header();
    assert!(header.totals_written);
    assert_eq!(header.total_objects, 3);
    assert_eq!(header.total_bytes, 7 * MB as u64);
    assert_eq!(header.last_completed.as_deref(), Some("dst/out/a"));
    assert_eq!(header.completed_through, Some(0));
    drop(session);

    // Only the prefix before the failure is trusted on resume
    let resumed = run_session(&fx.context().with_concurrency(2), request)
        .await
        .unwrap();
    assert_eq!(resumed.exit_code, EXIT_SUCCESS);
    assert_eq!(resumed.skipped, 1);
    assert_eq!(resumed.succeeded, 2);
    assert_eq!(fx.dst.put_count("out/a"), 1);
    assert_eq!(fx.dst.put_count("out/b"), 2);
    assert_eq!(fx.dst.put_count("out/c"), 1);
    assert!(!fx.store().exists(&identity));
}

#[tokio::test]
async fn test_verified_resume_recopies_missing_targets() {
    let fx = Fixture::new(MemoryClient::new("dst"));
    for i in 0..4 {
        fx.src.put_object(&format!("in/{}", i), vec![1u8; 100]);
    }

    let cancel = CancellationToken::new();
    let progress = Arc::new(CancelAfter {
        inner: Accounter::new(0),
        limit: 200,
        cancel: cancel.clone(),
    });
    let ctx = fx
        .context()
        .with_concurrency(1)
        .with_progress(progress)
        .with_cancel(cancel);
    let request = recursive_copy();
    run_session(&ctx, request.clone()).await.unwrap();
    assert_eq!(fx.dst.object_count(), 2);

    fx.dst
        .remove("out/0", &Default::default())
        .await
        .unwrap();

    let summary = run_session(&fx.context().with_verify_resumed(true), request)
        .await
        .unwrap();
    assert_eq!(summary.exit_code, EXIT_SUCCESS);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(fx.dst.object_count(), 4);
    assert_eq!(fx.dst.put_count("out/0"), 2);
    assert_eq!(fx.dst.put_count("out/1"), 1);
}

#[tokio::test]
async fn test_interrupt_during_enumeration_discards_session() {
    let fx = Fixture::new(MemoryClient::new("dst"));
    fx.src.put_object("in/a", b"a".to_vec());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let request = recursive_copy();
    let identity = request.identity();
    let summary = run_session(&fx.context().with_cancel(cancel), request)
        .await
        .unwrap();

    assert_eq!(summary.exit_code, EXIT_INTERRUPTED);
    assert!(!fx.store().exists(&identity));
    assert_eq!(fx.dst.object_count(), 0);
}

#[tokio::test]
async fn test_session_without_totals_is_enumerated_again() {
    let fx = Fixture::new(MemoryClient::new("dst"));
    fx.src.put_object("in/a", b"a".to_vec());
    fx.src.put_object("in/b", b"b".to_vec());

    let request = recursive_copy();
    let identity = request.identity();
    let stale = fx
        .store()
        .create(
            &identity,
            request.command,
            vec!["src/in/".into(), "dst/out/".into()],
            request.options.bool_flags(),
            request.options.string_flags(),
        )
        .unwrap();
    drop(stale);

    let summary = run_session(&fx.context(), request).await.unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.exit_code, EXIT_SUCCESS);
    assert!(!fx.store().exists(&identity));
}

#[tokio::test]
async fn test_enumeration_errors_are_reported_not_logged() {
    let fx = Fixture::new(MemoryClient::new("dst"));
    fx.src.put_object("in/a", b"a".to_vec());

    let request = TransferRequest::new(
        CommandType::Cp,
        vec!["src/in/a".into(), "src/in/missing".into()],
        "dst/out/",
    )
    .with_session(true);
    let summary = run_session(&fx.context(), request).await.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.exit_code, ferry::error::EXIT_PARTIAL);
    assert_eq!(fx.dst.object_data("out/a").unwrap(), &b"a"[..]);
}
