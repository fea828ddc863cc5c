//! Crawl and probe job queue with its workers.
//!
//! - **JobQueue**: priority job queue with delayed delivery over the coordination store
//! - **QueueThrottle**: producer-side backpressure on queue depth
//! - **JobRunner**: executes crawl and probe jobs
//! - **WorkerPool**: pool of workers that process jobs concurrently
//!
//! # Architecture
//!
//! ```text
//!   ┌───────────────┐      ┌────────────────┐
//!   │ SweepScheduler│      │ SignalBackfill │
//!   └──────┬────────┘      └───────┬────────┘
//!          │ enqueue               │ enqueue_in
//!          ▼                       ▼
//!   ┌──────────────────────────────────────┐
//!   │ {q}  {q}\x06\x163  ...   {q}:scheduled│
//!   └──────────────────┬───────────────────┘
//!                      │ dequeue
//!         ┌────────────┼────────────┐
//!         ▼            ▼            ▼
//!    ┌─────────┐  ┌─────────┐  ┌─────────┐
//!    │ Worker 1│  │ Worker 2│  │ Worker N│
//!    └─────────┘  └─────────┘  └─────────┘
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic dequeue**: jobs move to the processing list with RPOPLPUSH
//! - **Crash recovery**: jobs left in the processing list are requeued when a pool starts
//! - **Dead letter queue**: jobs out of attempts are kept for inspection
//! - **Graceful shutdown**: workers finish their current job before stopping

pub mod job;
pub mod queue;
pub mod runner;
pub mod throttle;
pub mod worker_pool;

pub use job::{Job, JobKind, Priority};
pub use queue::{JobQueue, QueueError, QueueStats};
pub use runner::{JobError, JobHandler, JobOutcome, JobRunner, CRAWL_TASK_NAME};
pub use throttle::{QueueDepth, QueueThrottle};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
