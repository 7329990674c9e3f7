//! Defines the `Task` struct and related functionality.
//!
//! A `Task` owns one suspendable computation. Creating it does not run
//! anything; the computation starts when the task is awaited, submitted to a
//! [`Scheduler`], or stepped by hand. Whatever the computation returns, value
//! or error, is stored in the task and handed out once, either as the result
//! of `.await` or through [`Task::take_result`].
//!
//! Awaiting a task from another task chains the two: the awaiting party is
//! recorded as the continuation, the awaited computation runs right away, and
//! when it later finishes on the scheduler it wakes that continuation.
use std::{
    cell::{Cell, OnceCell, RefCell},
    fmt, mem,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
};

use futures::{FutureExt, future::LocalBoxFuture};
use tracing::{debug, trace};

use crate::{
    awaitable::{Outcome, ValueOf},
    scheduler::{Registration, Scheduler, TaskId},
};

// Object-safe view of a task used by the scheduler's registry.
pub(crate) trait Resume {
    // Resumes a task taken off the ready queue. On completion the task wakes
    // its continuation, if one was registered.
    fn resume_queued(self: Rc<Self>) -> Poll<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Suspended,
    Running,
    Completed,
    Consumed,
}

pub(crate) struct TaskCore<T> {
    state: Cell<State>,
    future: RefCell<Option<LocalBoxFuture<'static, anyhow::Result<T>>>>,
    output: RefCell<Option<anyhow::Result<T>>>,
    continuation: RefCell<Option<Waker>>,
    registration: OnceCell<Registration>,
}

impl<T: 'static> TaskCore<T> {
    fn new(future: LocalBoxFuture<'static, anyhow::Result<T>>) -> Rc<Self> {
        Rc::new(Self {
            state: Cell::new(State::Idle),
            future: RefCell::new(Some(future)),
            output: RefCell::new(None),
            continuation: RefCell::new(None),
            registration: OnceCell::new(),
        })
    }

    pub(crate) fn is_finished(&self) -> bool {
        matches!(self.state.get(), State::Completed | State::Consumed)
    }

    pub(crate) fn bind(self: &Rc<Self>, scheduler: &Scheduler) -> &Registration {
        let registration = self
            .registration
            .get_or_init(|| scheduler.register(Rc::downgrade(self) as Weak<dyn Resume>));
        assert!(
            registration.belongs_to(scheduler),
            "task {} is already bound to another scheduler",
            registration.id
        );
        registration
    }

    fn registration(self: &Rc<Self>) -> &Registration {
        self.registration.get_or_init(|| {
            Scheduler::current().register(Rc::downgrade(self) as Weak<dyn Resume>)
        })
    }

    fn set_continuation(&self, waker: &Waker) {
        let mut continuation = self.continuation.borrow_mut();
        match continuation.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *continuation = Some(waker.clone()),
        }
    }

    // Polls the computation once with the task's own waker.
    fn poll_once(self: &Rc<Self>) -> Poll<()> {
        match self.state.get() {
            State::Running => panic!("task resumed while it is already running"),
            State::Completed | State::Consumed => return Poll::Ready(()),
            State::Idle | State::Suspended => {}
        }

        let registration = self.registration();
        registration.notifier.clear();
        self.state.set(State::Running);
        trace!(task.id = %registration.id, "task resumed");

        let mut cx = Context::from_waker(&registration.waker);
        let mut future = self.future.borrow_mut();
        let poll = future
            .as_mut()
            .expect("unfinished task owns its computation")
            .as_mut()
            .poll(&mut cx);

        match poll {
            Poll::Ready(output) => {
                // The computation is released as soon as it finishes.
                *future = None;
                drop(future);
                if let Err(error) = &output {
                    debug!(task.id = %registration.id, %error, "task failed");
                } else {
                    trace!(task.id = %registration.id, "task completed");
                }
                *self.output.borrow_mut() = Some(output);
                self.state.set(State::Completed);
                Poll::Ready(())
            }
            Poll::Pending => {
                self.state.set(State::Suspended);
                Poll::Pending
            }
        }
    }
}

impl<T: 'static> Resume for TaskCore<T> {
    fn resume_queued(self: Rc<Self>) -> Poll<()> {
        if self.is_finished() {
            trace!("spurious wake-up of a finished task");
            return Poll::Ready(());
        }
        let poll = self.poll_once();
        if poll.is_ready() {
            let continuation = self.continuation.borrow_mut().take();
            if let Some(continuation) = continuation {
                continuation.wake();
            }
        }
        poll
    }
}

/// An owned handle to one suspendable computation and its eventual result.
///
/// The computation is a future producing `anyhow::Result<T>`; it does not run
/// until the task is awaited, submitted to a [`Scheduler`], or
/// [stepped](Task::step). Errors returned by it are kept in the task and only
/// surface when the result is retrieved.
///
/// Dropping a task releases its computation whatever state it is in. A task
/// left behind by [`Task::take`] or created with [`Task::default`] is empty
/// and inert.
///
/// # Example
/// ```
/// use lockstep::{Task, block_on};
///
/// let double = |x: u32| Task::new(async move { Ok(x * 2) });
/// let task = Task::new(async move {
///     let a = double(2).await?;
///     let b = double(a).await?;
///     Ok(b)
/// });
/// assert_eq!(block_on(task).unwrap(), 8);
/// ```
#[must_use = "tasks do nothing unless awaited or run"]
pub struct Task<T> {
    core: Option<Rc<TaskCore<T>>>,
}

impl<T: 'static> Task<T> {
    /// Creates a task owning `future`, suspended before its first statement.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + 'static,
    {
        Self {
            core: Some(TaskCore::new(future.boxed_local())),
        }
    }

    /// Moves the computation out, leaving `self` empty.
    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    /// Returns `true` if the task owns no computation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.is_none()
    }

    /// Returns `true` once the computation has produced its result.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.core.as_ref().is_some_and(|core| core.is_finished())
    }

    /// Id assigned by the scheduler the task is bound to, if any.
    #[must_use]
    pub fn id(&self) -> Option<TaskId> {
        self.core
            .as_ref()
            .and_then(|core| core.registration.get())
            .map(|registration| registration.id)
    }

    /// Resumes the computation once and returns `true` if it finished.
    ///
    /// The task is bound to [`Scheduler::current`] if it is not bound yet.
    ///
    /// # Panics
    ///
    /// Panics if the task is empty or has already finished.
    pub fn step(&self) -> bool {
        let core = self.core.as_ref().expect("stepped an empty task");
        assert!(!core.is_finished(), "stepped a task that already finished");
        Rc::clone(core).resume_queued().is_ready()
    }

    /// Takes the stored result, re-raising the captured error if there is one.
    ///
    /// # Errors
    ///
    /// Returns the error the computation finished with.
    ///
    /// # Panics
    ///
    /// Panics if the task is empty, has not finished yet, or its result was
    /// already taken.
    pub fn take_result(&mut self) -> anyhow::Result<T> {
        let core = self.core.as_ref().expect("took the result of an empty task");
        match core.state.get() {
            State::Completed => {
                core.state.set(State::Consumed);
                core.output
                    .borrow_mut()
                    .take()
                    .expect("completed task holds its result")
            }
            State::Consumed => panic!("task result was already taken"),
            State::Idle | State::Suspended | State::Running => {
                panic!("task result retrieved before the task completed")
            }
        }
    }

    pub(crate) fn registration_in(&self, scheduler: &Scheduler) -> &Registration {
        self.core
            .as_ref()
            .expect("submitted an empty task")
            .bind(scheduler)
    }

    pub(crate) fn scheduler(&self) -> Option<Scheduler> {
        self.core
            .as_ref()
            .and_then(|core| core.registration.get())
            .and_then(Registration::scheduler)
    }

    // Runs the computation inline until its first suspension. Finished tasks
    // are left alone.
    pub(crate) fn start(&self) {
        if let Some(core) = &self.core {
            if !core.is_finished() {
                let _ = Rc::clone(core).resume_queued();
            }
        }
    }

    pub(crate) fn into_core(self) -> Option<Rc<TaskCore<T>>> {
        self.core
    }
}

impl<T> Default for Task<T> {
    fn default() -> Self {
        Self { core: None }
    }
}

impl<T: 'static> Future for Task<T> {
    type Output = anyhow::Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let core = Rc::clone(this.core.as_ref().expect("awaited an empty task"));

        match core.state.get() {
            State::Completed => return Poll::Ready(this.take_result()),
            State::Consumed => panic!("task polled after its result was taken"),
            State::Running => panic!("task awaited from inside its own computation"),
            State::Idle => {
                core.set_continuation(cx.waker());
                // Control moves straight into the awaited computation. If it
                // finishes here, there is nobody left to wake.
                if core.poll_once().is_ready() {
                    core.continuation.borrow_mut().take();
                    return Poll::Ready(this.take_result());
                }
            }
            State::Suspended => core.set_continuation(cx.waker()),
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Task");
        match &self.core {
            Some(core) => debug
                .field("id", &core.registration.get().map(|r| r.id))
                .field("state", &core.state.get()),
            None => debug.field("state", &"empty"),
        };
        debug.finish()
    }
}

/// Extends awaitables with conversion into a [`Task`].
pub trait TaskExt: IntoFuture {
    /// Wraps the awaitable in a task, mapping its output through [`Outcome`].
    ///
    /// # Example
    /// ```
    /// use lockstep::{block_on, sleep_for, task::TaskExt};
    /// use std::time::Duration;
    ///
    /// let task = sleep_for(Duration::from_millis(1)).into_task();
    /// assert!(block_on(task).is_ok());
    /// ```
    fn into_task(self) -> Task<ValueOf<Self>>
    where
        Self: Sized,
        Self::IntoFuture: 'static,
        Self::Output: Outcome + 'static,
        ValueOf<Self>: 'static,
    {
        Task::new(self.into_future().map(Outcome::into_result))
    }
}

impl<F: IntoFuture> TaskExt for F {}
