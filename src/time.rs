//! Timer suspension points.
//!
//! A [`Sleep`] never completes on its first poll: it registers its deadline
//! with a scheduler's timer heap and suspends. The scheduler wakes it once the
//! deadline has passed, and only then does it complete.

use std::{
    pin::Pin,
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use crate::scheduler::Scheduler;

/// A future that completes once its deadline has passed.
///
/// Created by [`sleep_for`], [`sleep_until`], or the scheduler-bound
/// [`Scheduler::sleep_for`] and [`Scheduler::sleep_until`]. The unbound forms
/// register with [`Scheduler::current`] when first polled.
#[must_use = "futures do nothing unless polled or .awaited"]
#[derive(Debug)]
pub struct Sleep {
    // Resolved on first poll when the sleep was created from a duration.
    deadline: Option<Instant>,
    duration: Duration,
    scheduler: Option<Scheduler>,
    registered: Option<Waker>,
}

impl Sleep {
    pub(crate) fn at(deadline: Instant, scheduler: Option<Scheduler>) -> Self {
        Self {
            deadline: Some(deadline),
            duration: Duration::ZERO,
            scheduler,
            registered: None,
        }
    }

    pub(crate) fn after(duration: Duration, scheduler: Option<Scheduler>) -> Self {
        Self {
            deadline: None,
            duration,
            scheduler,
            registered: None,
        }
    }

    /// The instant this sleep completes at, known once it has been polled or
    /// if it was created from an instant.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let duration = this.duration;
        let deadline = *this.deadline.get_or_insert_with(|| {
            let now = Instant::now();
            now.checked_add(duration).unwrap_or_else(|| far_future(now))
        });

        if this.registered.is_some() && Instant::now() >= deadline {
            return Poll::Ready(());
        }

        // Re-register only when polled on behalf of a different waiter; the
        // entry already in the heap still targets the current one otherwise.
        let stale = this
            .registered
            .as_ref()
            .is_none_or(|waker| !waker.will_wake(cx.waker()));
        if stale {
            let scheduler = this.scheduler.get_or_insert_with(Scheduler::current);
            scheduler.submit_timer(deadline, cx.waker().clone());
            this.registered = Some(cx.waker().clone());
        }
        Poll::Pending
    }
}

// Stand-in deadline for durations that do not fit in an `Instant`.
fn far_future(now: Instant) -> Instant {
    now + Duration::from_secs(86400 * 365 * 30)
}

/// Suspends the caller until `deadline`.
///
/// # Example
/// ```
/// use lockstep::{Task, block_on, sleep_until};
/// use std::time::{Duration, Instant};
///
/// let deadline = Instant::now() + Duration::from_millis(5);
/// let task = Task::new(async move {
///     sleep_until(deadline).await;
///     Ok(Instant::now())
/// });
/// assert!(block_on(task).unwrap() >= deadline);
/// ```
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep::at(deadline, None)
}

/// Suspends the caller for `duration`, counted from the first poll.
pub fn sleep_for(duration: Duration) -> Sleep {
    Sleep::after(duration, None)
}
