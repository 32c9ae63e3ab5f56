//! Ferry Core Resilience: Pure-logic retry and queueing primitives
//!
//! # Overview
//!
//! - **Retry Timer**: exponential backoff with jitter, cancellable waits
//! - **Elastic Queue**: a bounded-channel lookalike that grows its
//!   intermediate buffer under load and shrinks it again when drained
//!
//! # Key Principles
//!
//! This crate has no knowledge of storage clients, sessions or transfer
//! tasks. Callers decide what to retry and what to queue.
//!
//! ```text
//!  producer ──► [bounded in] ──► pump (elastic buffer) ──► [bounded out] ──► consumer
//!
//!  caller ──► RetryTimer::next() ──► attempt 0 now, then unit·2^k (capped, jittered)
//!                    ▲
//!                    └── CancellationToken wakes the wait early
//! ```

pub mod elastic;
pub mod retry_timer;

pub use elastic::{elastic_channel, ElasticReceiver, ElasticSender, ElasticStats};
pub use retry_timer::{backoff, BackoffConfig, BackoffDelays, RetryTimer};
