/*!
 * Ferry CLI - Command Line Interface
 *
 * `ferry cp` and `ferry mv` copy or move objects between local paths and
 * aliases configured in `config.toml`. With `--continue` the batch is
 * recorded in a session that `ferry session resume <id>` can pick up after
 * an interruption.
 */

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use ferry::{
    accounting::{Accounter, Progress, ProgressBar},
    client::{AliasRegistry, LocalClient},
    config::{FerryConfig, LogLevel},
    copy::{self, TransferContext, TransferRequest},
    error::{EXIT_FATAL, EXIT_SUCCESS},
    logging,
    options::{CommandType, TransferOptions},
    output::{OutputMode, OutputWriter},
    session::SessionStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ferry")]
#[command(version, about = "Resumable, concurrent copy and move for files and objects", long_about = None)]
struct Cli {
    /// Configuration file (default: <config dir>/ferry/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Print results and the summary as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Print only errors and the summary
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Number of parallel transfers (0 = auto)
    #[arg(long, value_name = "N", global = true)]
    concurrency: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Write logs as JSON to this file
    #[arg(long, value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Directory holding session files
    #[arg(long, value_name = "DIR", global = true)]
    session_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy objects
    Cp(TransferArgs),

    /// Move objects (the source is removed after each successful copy)
    Mv(TransferArgs),

    /// Manage resumable sessions
    #[command(subcommand)]
    Session(SessionCommand),
}

#[derive(Args)]
struct TransferArgs {
    /// One or more sources followed by the target
    #[arg(required = true, num_args = 2.., value_name = "SOURCE... TARGET")]
    paths: Vec<String>,

    /// Copy folders and prefixes recursively
    #[arg(short, long)]
    recursive: bool,

    /// Only objects older than this age (e.g. 7d10h)
    #[arg(long, value_name = "AGE")]
    older_than: Option<String>,

    /// Only objects newer than this age
    #[arg(long, value_name = "AGE")]
    newer_than: Option<String>,

    /// Copy objects as they were at this time (RFC 3339) or this long ago
    #[arg(long, value_name = "TIME")]
    rewind: Option<String>,

    /// Copy one specific version of the source
    #[arg(long, visible_alias = "vid", value_name = "ID")]
    version_id: Option<String>,

    /// Storage class for the new objects
    #[arg(long, visible_alias = "sc", value_name = "CLASS")]
    storage_class: Option<String>,

    /// Object lock mode: governance or compliance
    #[arg(long, value_name = "MODE")]
    retention_mode: Option<String>,

    /// Object lock retention period (e.g. 30d)
    #[arg(long, value_name = "DURATION")]
    retention_duration: Option<String>,

    /// Legal hold: on or off
    #[arg(long, value_name = "STATE")]
    legal_hold: Option<String>,

    /// User metadata, "key1=value1;key2=value2"
    #[arg(long, value_name = "PAIRS")]
    attr: Option<String>,

    /// Record the batch in a resumable session
    #[arg(short = 'c', long = "continue")]
    continue_session: bool,

    /// Record the source modification time on the target
    #[arg(short = 'a', long)]
    preserve: bool,

    /// Upload every object in a single request
    #[arg(long)]
    disable_multipart: bool,

    /// Send a content checksum with every upload
    #[arg(long)]
    md5: bool,

    /// Encrypt objects under these target prefixes server-side
    #[arg(long, value_name = "PREFIX", value_delimiter = ',')]
    encrypt: Vec<String>,
}

impl TransferArgs {
    fn into_request(mut self, command: CommandType) -> TransferRequest {
        let target = self.paths.pop().unwrap_or_default();
        let options = TransferOptions {
            recursive: self.recursive,
            older_than: self.older_than,
            newer_than: self.newer_than,
            rewind: self.rewind,
            version_id: self.version_id,
            storage_class: self.storage_class,
            retention_mode: self.retention_mode,
            retention_duration: self.retention_duration,
            legal_hold: self.legal_hold,
            attr: self.attr,
            preserve: self.preserve,
            disable_multipart: self.disable_multipart,
            md5: self.md5,
            encrypt: self.encrypt,
        };
        TransferRequest::new(command, self.paths, target)
            .with_options(options)
            .with_session(self.continue_session)
    }
}

#[derive(Subcommand)]
enum SessionCommand {
    /// List saved sessions
    List,

    /// Resume a saved session
    Resume {
        /// Session identity as shown by `ferry session list`
        identity: String,
    },

    /// Delete saved sessions
    Clear {
        /// Session identity
        #[arg(required_unless_present = "all")]
        identity: Option<String>,

        /// Delete every session
        #[arg(long, conflicts_with = "identity")]
        all: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = FerryConfig::load(cli.config.as_deref())?;

    // Command-line flags override the file
    if let Some(level) = &cli.log_level {
        config.log_level = level.parse::<LogLevel>()?;
    }
    if cli.log.is_some() {
        config.log_file = cli.log.clone();
    }
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }
    if cli.session_dir.is_some() {
        config.session_dir = cli.session_dir.clone();
    }
    config.json |= cli.json;
    config.quiet |= cli.quiet;

    if let Err(e) = logging::init_logging(&config) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    runtime.block_on(execute(cli.command, config))
}

async fn execute(command: Commands, config: FerryConfig) -> anyhow::Result<i32> {
    let store = SessionStore::new(config.session_dir());
    let output = OutputWriter::new(config.json, config.quiet);

    match command {
        Commands::Cp(args) => {
            let ctx = context(&config, store, output);
            Ok(copy::run(&ctx, args.into_request(CommandType::Cp)).await)
        }
        Commands::Mv(args) => {
            let ctx = context(&config, store, output);
            Ok(copy::run(&ctx, args.into_request(CommandType::Mv)).await)
        }
        Commands::Session(SessionCommand::Resume { identity }) => {
            let ctx = context(&config, store, output);
            let outcome = copy::resume_session(&ctx, &identity).await;
            Ok(copy::report(&ctx, outcome))
        }
        Commands::Session(SessionCommand::List) => {
            list_sessions(&store, &output)?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Session(SessionCommand::Clear { identity, all }) => {
            if all {
                let removed = store.clear_all()?;
                output.info(&format!("Removed {} session(s)", removed));
            } else if let Some(identity) = identity {
                store
                    .clear(&identity)
                    .with_context(|| format!("cannot clear session {}", identity))?;
                output.info(&format!("Removed session {}", identity));
            }
            Ok(EXIT_SUCCESS)
        }
    }
}

/// Transfer context for a run: aliases, progress display and Ctrl-C handling
fn context(config: &FerryConfig, store: SessionStore, output: OutputWriter) -> TransferContext {
    let mut registry = AliasRegistry::new();
    for (alias, root) in &config.aliases {
        registry.register(alias.clone(), Arc::new(LocalClient::with_root(root.clone())));
    }

    let progress: Arc<dyn Progress> = if output.mode == OutputMode::Human {
        Arc::new(ProgressBar::new(0))
    } else {
        Arc::new(Accounter::new(0))
    };

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight transfers");
            signal.cancel();
        }
    });

    info!(
        "Using {} alias(es), sessions in {}",
        config.aliases.len(),
        store.dir().display()
    );
    TransferContext::new(Arc::new(registry), store)
        .with_progress(progress)
        .with_output(output)
        .with_cancel(cancel)
        .with_concurrency(config.concurrency)
        .with_retry(config.retry.backoff(), config.retry.max_attempts)
        .with_verify_resumed(config.verify_resumed)
}

fn list_sessions(store: &SessionStore, output: &OutputWriter) -> anyhow::Result<()> {
    let headers = store.list()?;
    if output.is_json() {
        for header in &headers {
            println!("{}", serde_json::to_string(header)?);
        }
        return Ok(());
    }

    if headers.is_empty() {
        println!("No saved sessions in {}", store.dir().display());
        return Ok(());
    }
    for header in &headers {
        let progress = match header.completed_through {
            Some(through) => format!("{}/{}", through + 1, header.total_objects),
            None => format!("0/{}", header.total_objects),
        };
        println!(
            "{}  {}  {} {}  [{}]",
            header.identity,
            header.created.format("%Y-%m-%d %H:%M:%S"),
            header.command_type,
            header.command_args.join(" "),
            progress
        );
    }
    Ok(())
}
