//! Elastic queue: a bounded channel that stretches under load
//!
//! Producers and consumers see the shape of a bounded `tokio::sync::mpsc`
//! channel, but a pump task sits in between and parks overflow in an
//! intermediate buffer. When the buffer fills it is swapped for one twice the
//! size; when it drains below a quarter of its capacity it is swapped for one
//! half the size, never dropping below the configured capacity. Senders
//! therefore only wait while the pump is switching buffers.
//!
//! # Example
//!
//! ```
//! use ferry_core_resilience::elastic::elastic_channel;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (tx, mut rx) = elastic_channel::<u32>(2);
//! for i in 0..100 {
//!     tx.send(i).await.unwrap();
//! }
//! drop(tx);
//!
//! let mut received = 0;
//! while let Some(_) = rx.recv().await {
//!     received += 1;
//! }
//! assert_eq!(received, 100);
//! # }
//! ```

use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::trace;

pub use tokio::sync::mpsc::error::SendError;

/// Observed sizing of an elastic queue
#[derive(Debug, Default)]
pub struct ElasticStats {
    buffered: AtomicUsize,
    capacity: AtomicUsize,
    peak_capacity: AtomicUsize,
}

impl ElasticStats {
    /// Items parked in the intermediate buffer
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Current capacity of the intermediate buffer
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Largest capacity the buffer has reached
    pub fn peak_capacity(&self) -> usize {
        self.peak_capacity.load(Ordering::Relaxed)
    }

    fn record(&self, buffered: usize, capacity: usize) {
        self.buffered.store(buffered, Ordering::Relaxed);
        self.capacity.store(capacity, Ordering::Relaxed);
        self.peak_capacity.fetch_max(capacity, Ordering::Relaxed);
    }
}

/// Sending half of an elastic queue
#[derive(Debug)]
pub struct ElasticSender<T> {
    inner: mpsc::Sender<T>,
}

impl<T> Clone for ElasticSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> ElasticSender<T> {
    /// Send a value, waiting only while the pump is busy.
    ///
    /// # Errors
    ///
    /// Returns the value back if the receiving half has been dropped.
    pub async fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.inner.send(value).await
    }

    /// Whether the receiving half is gone
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Receiving half of an elastic queue; also a [`Stream`]
#[derive(Debug)]
pub struct ElasticReceiver<T> {
    inner: mpsc::Receiver<T>,
    stats: Arc<ElasticStats>,
}

impl<T> ElasticReceiver<T> {
    /// Receive the next value, `None` once every sender is dropped and the
    /// buffer is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.inner.recv().await
    }

    /// Sizing information shared with the pump
    pub fn stats(&self) -> Arc<ElasticStats> {
        Arc::clone(&self.stats)
    }
}

impl<T> Stream for ElasticReceiver<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.inner.poll_recv(cx)
    }
}

/// Create an elastic queue whose edges hold `capacity` items each.
///
/// Must be called inside a tokio runtime; the pump runs as a spawned task and
/// exits when both halves are done.
pub fn elastic_channel<T: Send + 'static>(capacity: usize) -> (ElasticSender<T>, ElasticReceiver<T>) {
    let capacity = capacity.max(1);
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let stats = Arc::new(ElasticStats::default());
    stats.record(0, capacity);

    tokio::spawn(pump(in_rx, out_tx, Arc::clone(&stats), capacity));

    (
        ElasticSender { inner: in_tx },
        ElasticReceiver {
            inner: out_rx,
            stats,
        },
    )
}

async fn pump<T>(
    mut input: mpsc::Receiver<T>,
    output: mpsc::Sender<T>,
    stats: Arc<ElasticStats>,
    min_capacity: usize,
) {
    let mut capacity = min_capacity;
    let mut buffer: VecDeque<T> = VecDeque::with_capacity(capacity);
    let mut input_open = true;

    loop {
        if !input_open && buffer.is_empty() {
            break;
        }

        tokio::select! {
            item = input.recv(), if input_open => match item {
                Some(item) => {
                    if buffer.len() >= capacity {
                        capacity *= 2;
                        buffer = resize(buffer, capacity);
                        trace!(capacity, "Elastic buffer grown");
                    }
                    buffer.push_back(item);
                }
                None => input_open = false,
            },
            permit = output.reserve(), if !buffer.is_empty() => match permit {
                Ok(permit) => {
                    if let Some(item) = buffer.pop_front() {
                        permit.send(item);
                    }
                    if capacity > min_capacity && buffer.len() < capacity / 4 {
                        capacity = (capacity / 2).max(min_capacity);
                        buffer = resize(buffer, capacity);
                        trace!(capacity, "Elastic buffer shrunk");
                    }
                }
                Err(_) => break,
            },
            _ = output.closed(), if buffer.is_empty() => break,
        }

        stats.record(buffer.len(), capacity);
    }

    stats.record(0, capacity);
}

fn resize<T>(mut old: VecDeque<T>, capacity: usize) -> VecDeque<T> {
    let mut swapped = VecDeque::with_capacity(capacity);
    swapped.extend(old.drain(..));
    swapped
}
