//! Concurrency and backpressure primitives
//!
//! - **limiter**: bounded concurrent requests with a queueing timeout
//! - **waitgroup**: tracks in-flight storage operations for shutdown
//! - **pool**: bounded task queue with a fixed set of workers

pub mod limiter;
pub mod pool;
pub mod waitgroup;

pub use limiter::{ConcurrencyLimiter, LimitError, LimiterPermit};
pub use pool::WorkerPool;
pub use waitgroup::{WaitGroup, WaitGuard};
