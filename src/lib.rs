//! A minimal, single-threaded cooperative async runtime.
//!
//! `lockstep` provides three pieces that fit together:
//! - [`Task`], an owned handle to a lazily started computation that stores its
//!   result or error until someone asks for it
//! - [`Scheduler`], which drains a FIFO queue of ready tasks and a heap of
//!   timers until no work is left
//! - [`join_all`], which runs several awaitables concurrently under one task
//!   and hands back their values in input order, failing with the first error
//!
//! Everything runs on the calling thread. "Concurrent" means interleaved at
//! suspension points: awaiting a task, a timer, or a join.
//!
//! # Example
//! ```
//! use lockstep::{Task, block_on, join_all, sleep_for};
//! use std::time::Duration;
//!
//! fn delayed(value: u32, ms: u64) -> Task<u32> {
//!     Task::new(async move {
//!         sleep_for(Duration::from_millis(ms)).await;
//!         Ok(value)
//!     })
//! }
//!
//! let main = Task::new(async {
//!     let (a, b) = join_all((delayed(1, 5), delayed(2, 3))).await?;
//!     Ok(a + b)
//! });
//! assert_eq!(block_on(main).unwrap(), 3);
//! ```

pub mod awaitable;
pub mod join;
pub mod scheduler;
pub mod task;
pub mod time;
mod waker;

pub use join::{join_all, join_iter};
pub use scheduler::{Builder, Scheduler, TaskId};
pub use task::{Task, TaskExt};
pub use time::{Sleep, sleep_for, sleep_until};

/// Result type produced by tasks.
pub type Result<T> = anyhow::Result<T>;

/// Runs `task` to completion on [`Scheduler::current`] and returns its result.
///
/// # Errors
///
/// Returns the error captured by the task.
///
/// # Panics
///
/// Panics if the scheduler runs out of work before `task` completes.
pub fn block_on<T: 'static>(task: Task<T>) -> Result<T> {
    Scheduler::current().block_on(task)
}
