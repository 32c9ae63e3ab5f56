/*!
 * Progress accounting for transfers
 *
 * Every byte read from a source is credited to one shared [`Progress`]
 * object. Two implementations share the same atomic counters:
 *
 * - [`Accounter`]: silent, used for `--quiet`, `--json` and tests
 * - [`ProgressBar`]: an indicatif bar for interactive terminals
 *
 * Retried reads go through a per-task [`TaskProgress`] so bytes that were
 * already credited are never counted twice.
 */

use crate::client::ByteStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

/// How often transfer speed is recomputed
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(200);

/// Snapshot of the counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountStat {
    pub total: u64,
    pub transferred: u64,
    /// Bytes per second
    pub speed: f64,
    pub duration_secs: f64,
}

impl fmt::Display for AccountStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transferred: {} / {}, Speed: {}/s, Duration: {:.1}s",
            format_bytes(self.transferred),
            format_bytes(self.total),
            format_bytes(self.speed as u64),
            self.duration_secs
        )
    }
}

/// Shared transfer counter
///
/// The transferred count never decreases and never exceeds a non-zero total.
pub trait Progress: Send + Sync {
    /// Set the expected number of bytes
    fn set_total(&self, total: u64);

    /// Credit `n` bytes, returning the new transferred count
    fn add(&self, n: u64) -> u64;

    /// Bytes transferred so far
    fn get(&self) -> u64;

    fn total(&self) -> u64;

    fn stat(&self) -> AccountStat;

    /// Stop refreshing and return the final statistics.
    ///
    /// Calling it again returns the same statistics.
    fn finish(&self) -> AccountStat;
}

#[derive(Debug)]
struct Counters {
    total: AtomicU64,
    current: AtomicU64,
    /// f64 bits
    speed: AtomicU64,
    started: Instant,
    finished: OnceLock<AccountStat>,
}

impl Counters {
    fn new(total: u64) -> Arc<Self> {
        Arc::new(Self {
            total: AtomicU64::new(total),
            current: AtomicU64::new(0),
            speed: AtomicU64::new(0f64.to_bits()),
            started: Instant::now(),
            finished: OnceLock::new(),
        })
    }

    fn add(&self, n: u64) -> u64 {
        let total = self.total.load(Ordering::Acquire);
        let advance = |current: u64| {
            let next = current.saturating_add(n);
            if total > 0 {
                next.min(total).max(current)
            } else {
                next
            }
        };
        match self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(advance(c)))
        {
            Ok(previous) | Err(previous) => advance(previous),
        }
    }

    fn stat(&self) -> AccountStat {
        if let Some(stat) = self.finished.get() {
            return stat.clone();
        }
        AccountStat {
            total: self.total.load(Ordering::Acquire),
            transferred: self.current.load(Ordering::Acquire),
            speed: f64::from_bits(self.speed.load(Ordering::Relaxed)),
            duration_secs: self.started.elapsed().as_secs_f64(),
        }
    }

    fn finish(&self) -> AccountStat {
        self.finished
            .get_or_init(|| {
                let speed = self.average_speed();
                AccountStat {
                    total: self.total.load(Ordering::Acquire),
                    transferred: self.current.load(Ordering::Acquire),
                    speed,
                    duration_secs: self.started.elapsed().as_secs_f64(),
                }
            })
            .clone()
    }

    /// Average rate since the counters were created
    fn average_speed(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.current.load(Ordering::Acquire) as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Recompute speed every [`REFRESH_INTERVAL`] until finished or dropped
    fn spawn_refresher(counters: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(counters);
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(counters) = weak.upgrade() else {
                    break;
                };
                if counters.finished.get().is_some() {
                    break;
                }
                let speed = counters.average_speed();
                counters.speed.store(speed.to_bits(), Ordering::Relaxed);
            }
        });
    }
}

/// Silent accounting
#[derive(Debug)]
pub struct Accounter {
    counters: Arc<Counters>,
}

impl Accounter {
    /// Must be created inside a Tokio runtime for speed to be refreshed
    pub fn new(total: u64) -> Self {
        let counters = Counters::new(total);
        Counters::spawn_refresher(&counters);
        Self { counters }
    }
}

impl Progress for Accounter {
    fn set_total(&self, total: u64) {
        self.counters.total.store(total, Ordering::Release);
    }

    fn add(&self, n: u64) -> u64 {
        self.counters.add(n)
    }

    fn get(&self) -> u64 {
        self.counters.current.load(Ordering::Acquire)
    }

    fn total(&self) -> u64 {
        self.counters.total.load(Ordering::Acquire)
    }

    fn stat(&self) -> AccountStat {
        self.counters.stat()
    }

    fn finish(&self) -> AccountStat {
        self.counters.finish()
    }
}

/// Terminal progress bar
pub struct ProgressBar {
    counters: Arc<Counters>,
    bar: indicatif::ProgressBar,
}

impl ProgressBar {
    pub fn new(total: u64) -> Self {
        let bar = indicatif::ProgressBar::new(total);
        if let Ok(style) = indicatif::ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        ) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.enable_steady_tick(REFRESH_INTERVAL);

        let counters = Counters::new(total);
        Counters::spawn_refresher(&counters);
        Self { counters, bar }
    }
}

impl Progress for ProgressBar {
    fn set_total(&self, total: u64) {
        self.counters.total.store(total, Ordering::Release);
        self.bar.set_length(total);
    }

    fn add(&self, n: u64) -> u64 {
        let current = self.counters.add(n);
        self.bar.set_position(current);
        current
    }

    fn get(&self) -> u64 {
        self.counters.current.load(Ordering::Acquire)
    }

    fn total(&self) -> u64 {
        self.counters.total.load(Ordering::Acquire)
    }

    fn stat(&self) -> AccountStat {
        self.counters.stat()
    }

    fn finish(&self) -> AccountStat {
        let stat = self.counters.finish();
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
        stat
    }
}

/// Per-task credit tracker
///
/// Keeps the highest byte offset credited for one object. A retried read
/// restarts from offset zero, and only bytes past the high-water mark are
/// credited again.
pub struct TaskProgress {
    progress: Arc<dyn Progress>,
    credited: AtomicU64,
}

impl TaskProgress {
    pub fn new(progress: Arc<dyn Progress>) -> Arc<Self> {
        Arc::new(Self {
            progress,
            credited: AtomicU64::new(0),
        })
    }

    /// Report that the current attempt has read `offset` bytes
    pub fn observe(&self, offset: u64) {
        let previous = self.credited.fetch_max(offset, Ordering::AcqRel);
        if offset > previous {
            self.progress.add(offset - previous);
        }
    }

    /// Bytes credited for this task
    pub fn credited(&self) -> u64 {
        self.credited.load(Ordering::Acquire)
    }

    /// Wrap a source stream so every chunk read is credited
    pub fn track(self: &Arc<Self>, stream: ByteStream) -> ByteStream {
        let tracker = Arc::clone(self);
        let mut offset = 0u64;
        stream
            .inspect(move |chunk| {
                if let Ok(bytes) = chunk {
                    offset += bytes.len() as u64;
                    tracker.observe(offset);
                }
            })
            .boxed()
    }
}

/// Format bytes into human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let base = 1024.0_f64;
    let exp = (bytes_f.ln() / base.ln()).floor() as usize;
    let exp = exp.min(UNITS.len() - 1);

    let value = bytes_f / base.powi(exp as i32);

    if exp == 0 {
        format!("{} {}", bytes, UNITS[exp])
    } else {
        format!("{:.2} {}", value, UNITS[exp])
    }
}
