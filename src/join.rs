//! Structured concurrency: run several awaitables under one governing task.
//!
//! [`join_all`] takes a tuple of awaitables, wraps each in a branch task that
//! shares one control block, and returns a [`Task`] resolving to a tuple of
//! their values in input order. Branches are started one after another when
//! the governing task is first polled and then interleave on the scheduler.
//!
//! The governing task is resumed exactly once: by the branch that brings the
//! remaining count to zero, or by the first branch that fails. In the latter
//! case its error is the join's error, and errors from later branches are
//! dropped. Branches still suspended at that point are handed to their
//! scheduler and run to completion on their own; there is no cancellation.

use std::{
    cell::{Cell, RefCell},
    mem,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker, ready},
};

use pin_project_lite::pin_project;
use tracing::{debug, trace};

use crate::{
    awaitable::{Outcome, ValueOf},
    task::Task,
};

// State shared by the branches of one join. Only ever touched from the
// scheduler's thread; `Rc` keeps it there.
struct JoinControl {
    remaining: Cell<usize>,
    continuation: RefCell<Option<Waker>>,
    error: RefCell<Option<anyhow::Error>>,
    finished: Cell<bool>,
}

impl JoinControl {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            remaining: Cell::new(0),
            continuation: RefCell::new(None),
            error: RefCell::new(None),
            finished: Cell::new(false),
        })
    }

    fn set_continuation(&self, waker: &Waker) {
        let mut continuation = self.continuation.borrow_mut();
        match continuation.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *continuation = Some(waker.clone()),
        }
    }

    fn complete(&self) {
        let remaining = self
            .remaining
            .get()
            .checked_sub(1)
            .expect("join branch completed more than once");
        self.remaining.set(remaining);
        if remaining == 0 {
            self.finish();
        }
    }

    fn fail(&self, error: anyhow::Error) {
        if self.finished.get() {
            debug!(%error, "join branch error discarded");
            return;
        }
        *self.error.borrow_mut() = Some(error);
        self.finish();
    }

    // Resumes the joining party. Runs at most once per join.
    fn finish(&self) {
        if self.finished.replace(true) {
            return;
        }
        let continuation = self.continuation.borrow_mut().take();
        if let Some(continuation) = continuation {
            continuation.wake();
        }
    }
}

// Output slot of one branch, filled by the branch and emptied by the join.
struct Slot<V>(Rc<Cell<Option<V>>>);

impl<V> Slot<V> {
    fn new() -> Self {
        Self(Rc::new(Cell::new(None)))
    }

    fn share(&self) -> Self {
        Self(Rc::clone(&self.0))
    }

    fn put(&self, value: V) {
        self.0.set(Some(value));
    }

    fn take(&self) -> V {
        self.0.take().expect("join slot is filled exactly once")
    }
}

pin_project! {
    // Awaits one joined awaitable and reports its outcome to the control
    // block.
    struct Branch<F, V> {
        #[pin]
        future: F,
        slot: Slot<V>,
        control: Rc<JoinControl>,
    }
}

impl<F, V> Future for Branch<F, V>
where
    F: Future,
    F::Output: Outcome<Value = V>,
{
    type Output = anyhow::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let outcome = ready!(this.future.poll(cx));
        match outcome.into_result() {
            Ok(value) => {
                this.slot.put(value);
                this.control.complete();
            }
            Err(error) => this.control.fail(error),
        }
        Poll::Ready(Ok(()))
    }
}

/// Collects branches for a [`Join`].
struct JoinBuilder {
    control: Rc<JoinControl>,
    branches: Vec<Task<()>>,
}

impl JoinBuilder {
    fn new() -> Self {
        Self {
            control: JoinControl::new(),
            branches: Vec::new(),
        }
    }

    fn branch<A>(&mut self, awaitable: A) -> Slot<ValueOf<A>>
    where
        A: IntoFuture,
        A::IntoFuture: 'static,
        A::Output: Outcome,
        ValueOf<A>: 'static,
    {
        let slot = Slot::new();
        self.branches.push(Task::new(Branch {
            future: awaitable.into_future(),
            slot: slot.share(),
            control: Rc::clone(&self.control),
        }));
        slot
    }

    fn finish<R>(self, assemble: impl FnOnce() -> R + 'static) -> Join<R> {
        let count = self.branches.len();
        self.control.remaining.set(count);
        self.control.finished.set(count == 0);
        Join {
            control: self.control,
            branches: self.branches,
            assemble: Some(Box::new(assemble)),
            dispatched: false,
        }
    }
}

/// The future behind the task returned by [`join_all`] and [`join_iter`].
#[must_use = "futures do nothing unless polled or .awaited"]
pub struct Join<R> {
    control: Rc<JoinControl>,
    branches: Vec<Task<()>>,
    assemble: Option<Box<dyn FnOnce() -> R>>,
    dispatched: bool,
}

impl<R> Join<R> {
    fn dispatch(&self) {
        trace!(branches = self.branches.len(), "dispatching join");
        let Some((last, rest)) = self.branches.split_last() else {
            return;
        };
        for branch in rest {
            branch.start();
        }
        // The last branch runs before this poll returns instead of taking a
        // trip through the ready queue.
        last.start();
    }

    fn resolve(&mut self) -> anyhow::Result<R> {
        let error = self.control.error.borrow_mut().take();
        if let Some(error) = error {
            self.detach_unfinished();
            return Err(error);
        }
        let assemble = self.assemble.take().expect("join resolved more than once");
        self.branches.clear();
        Ok(assemble())
    }

    fn detach_unfinished(&mut self) {
        for branch in mem::take(&mut self.branches) {
            if branch.is_finished() {
                continue;
            }
            if let Some(scheduler) = branch.scheduler() {
                scheduler.detach(branch);
            }
        }
    }
}

impl<R> Future for Join<R> {
    type Output = anyhow::Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.dispatched {
            this.dispatched = true;
            this.dispatch();
        }
        if !this.control.finished.get() {
            this.control.set_continuation(cx.waker());
            return Poll::Pending;
        }
        Poll::Ready(this.resolve())
    }
}

/// A fixed-size, possibly heterogeneous group of awaitables.
///
/// Implemented for tuples of up to twelve elements whose outputs implement
/// [`Outcome`].
pub trait Joinable {
    /// Tuple of the awaitables' values, in input order.
    type Output;

    /// Wraps every element in a branch sharing one control block.
    fn into_join(self) -> Join<Self::Output>;
}

macro_rules! impl_joinable {
    ($($name:ident),*) => {
        impl<$($name),*> Joinable for ($($name,)*)
        where
            $(
                $name: IntoFuture,
                <$name as IntoFuture>::IntoFuture: 'static,
                <$name as IntoFuture>::Output: Outcome,
                ValueOf<$name>: 'static,
            )*
        {
            type Output = ($(ValueOf<$name>,)*);

            #[allow(non_snake_case, unused_mut)]
            fn into_join(self) -> Join<Self::Output> {
                let ($($name,)*) = self;
                let mut builder = JoinBuilder::new();
                $(let $name = builder.branch($name);)*
                builder.finish(move || ($($name.take(),)*))
            }
        }
    };
}

impl_joinable!();
impl_joinable!(A);
impl_joinable!(A, B);
impl_joinable!(A, B, C);
impl_joinable!(A, B, C, D);
impl_joinable!(A, B, C, D, E);
impl_joinable!(A, B, C, D, E, F);
impl_joinable!(A, B, C, D, E, F, G);
impl_joinable!(A, B, C, D, E, F, G, H);
impl_joinable!(A, B, C, D, E, F, G, H, I);
impl_joinable!(A, B, C, D, E, F, G, H, I, J);
impl_joinable!(A, B, C, D, E, F, G, H, I, J, K);
impl_joinable!(A, B, C, D, E, F, G, H, I, J, K, L);

/// Runs every awaitable in `awaitables` concurrently and resolves to a tuple
/// of their values, in input order.
///
/// `()`-valued awaitables, such as timers, contribute `()` to their slot. An
/// empty tuple resolves to `()` on the first poll without suspending.
///
/// # Errors
///
/// The returned task fails with the first error recorded by any branch.
///
/// # Example
/// ```
/// use lockstep::{Task, block_on, join_all, sleep_for};
/// use std::time::Duration;
///
/// let a = Task::new(async {
///     sleep_for(Duration::from_millis(2)).await;
///     Ok(1)
/// });
/// let b = async { Ok::<_, anyhow::Error>("two") };
/// let joined = join_all((a, b, sleep_for(Duration::from_millis(1))));
/// assert_eq!(block_on(joined).unwrap(), (1, "two", ()));
/// ```
pub fn join_all<J>(awaitables: J) -> Task<J::Output>
where
    J: Joinable,
    J::Output: 'static,
{
    Task::new(awaitables.into_join())
}

/// Like [`join_all`], for any number of awaitables of the same type.
///
/// # Errors
///
/// The returned task fails with the first error recorded by any branch.
pub fn join_iter<I>(awaitables: I) -> Task<Vec<ValueOf<I::Item>>>
where
    I: IntoIterator,
    I::Item: IntoFuture,
    <I::Item as IntoFuture>::IntoFuture: 'static,
    <I::Item as IntoFuture>::Output: Outcome,
    ValueOf<I::Item>: 'static,
{
    let mut builder = JoinBuilder::new();
    let slots: Vec<_> = awaitables
        .into_iter()
        .map(|awaitable| builder.branch(awaitable))
        .collect();
    Task::new(builder.finish(move || slots.iter().map(Slot::take).collect()))
}

/// Joins a list of awaitables; shorthand for [`join_all`] on a tuple.
///
/// ```
/// use lockstep::{Task, block_on};
///
/// let task = Task::new(async {
///     let (a, b) = lockstep::join_all!(
///         Task::new(async { Ok(1) }),
///         Task::new(async { Ok(2) }),
///     )
///     .await?;
///     Ok(a + b)
/// });
/// assert_eq!(block_on(task).unwrap(), 3);
/// ```
#[macro_export]
macro_rules! join_all {
    ($($awaitable:expr),* $(,)?) => {
        $crate::join::join_all(($($awaitable,)*))
    };
}
