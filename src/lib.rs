/*!
 * Ferry - resumable, concurrent object transfer
 *
 * The engine behind bulk `cp` and `mv` between storage locations:
 * - Lazy enumeration of sources into transfer tasks
 * - Sessions that persist the task list and a resume marker
 * - A bounded worker pool with completion-order results
 * - Byte accounting that never double counts retried reads
 * - Exponential backoff for transient storage errors
 *
 * # Example
 *
 * ```no_run
 * use ferry::client::{AliasRegistry, MemoryClient};
 * use ferry::copy::{run, TransferContext, TransferRequest};
 * use ferry::options::CommandType;
 * use ferry::session::SessionStore;
 * use std::sync::Arc;
 *
 * #[tokio::main]
 * async fn main() {
 *     let store = MemoryClient::new("play");
 *     store.put_object("photos/a.jpg", b"jpeg bytes".to_vec());
 *
 *     let mut registry = AliasRegistry::new();
 *     registry.register("play", Arc::new(store));
 *
 *     let ctx = TransferContext::new(Arc::new(registry), SessionStore::new("/tmp/ferry-sessions"));
 *     let request = TransferRequest::new(CommandType::Cp, vec!["play/photos/".into()], "/tmp/photos/")
 *         .with_session(true);
 *     std::process::exit(run(&ctx, request).await);
 * }
 * ```
 */

pub mod accounting;
pub mod client;
pub mod config;
pub mod copy;
pub mod duration;
pub mod enumerate;
pub mod error;
pub mod logging;
pub mod manager;
pub mod options;
pub mod output;
pub mod session;
pub mod task;
pub mod transfer;

// Re-export commonly used types
pub use accounting::{Accounter, Progress, ProgressBar};
pub use client::{AliasRegistry, LocalClient, MemoryClient, StorageClient};
pub use config::FerryConfig;
pub use copy::{resume_session, run, run_direct, run_session, TransferContext, TransferRequest};
pub use error::{FerryError, Result};
pub use options::{CommandType, TransferOptions};
pub use session::{Session, SessionStore};
pub use task::TransferTask;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
