//! Provides the `Scheduler` that drives tasks and timers to completion.
//!
//! A scheduler owns two structures: a FIFO ready queue of task ids and a
//! min-heap of timer entries ordered by deadline. [`Scheduler::run`] drains the
//! ready queue completely, then looks at the earliest timer: an expired one is
//! fired, otherwise the thread blocks until its deadline. It returns once both
//! structures are empty.
//!
//! Everything runs on the thread that calls `run`. A resumed task runs until it
//! suspends on its own; the scheduler never interrupts it.
//!
//! Every thread has a lazily created default scheduler, reachable through
//! [`Scheduler::current`] while no other scheduler is running on that thread.

use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, VecDeque},
    fmt,
    rc::{Rc, Weak},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    task::Waker,
    time::{Duration, Instant},
};

use tracing::{debug, debug_span, trace};

use crate::{
    task::{Resume, Task},
    time::Sleep,
    waker::Notifier,
};

const DEFAULT_NAME: &str = "lockstep";
const DEFAULT_READY_CAPACITY: usize = 64;
const DEFAULT_TIMER_CAPACITY: usize = 16;

thread_local! {
    // Scheduler whose `run` is currently on the stack of this thread.
    static CURRENT: RefCell<Option<Scheduler>> = const { RefCell::new(None) };

    static DEFAULT: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

/// Identifies a task registered with a [`Scheduler`].
///
/// Ids are handed out when a task is first bound to a scheduler and are unique
/// within that scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// Ready queue shared with the wakers. Wakers may fire on any thread, so this
// is the one piece of scheduler state behind a lock. The condvar lets a parked
// driver notice wake-ups coming from other threads.
pub(crate) struct ReadyQueue {
    queue: Mutex<VecDeque<TaskId>>,
    signal: Condvar,
}

impl ReadyQueue {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            signal: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, id: TaskId) {
        self.lock().push_back(id);
        self.signal.notify_one();
    }

    fn pop(&self) -> Option<TaskId> {
        self.lock().pop_front()
    }

    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn wait_timeout(&self, timeout: Duration) {
        let queue = self.lock();
        let _queue = self
            .signal
            .wait_timeout_while(queue, timeout, |q| q.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TaskId>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// A pending wake-up. Ordered by deadline only; the comparison is reversed so
// that `BinaryHeap` pops the earliest deadline first. Equal deadlines come out
// in no particular order.
struct TimerEntry {
    deadline: Instant,
    waker: Waker,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

// Binding between a task and the scheduler it is registered with. Dropping it
// removes the task from the registry.
pub(crate) struct Registration {
    pub(crate) id: TaskId,
    pub(crate) waker: Waker,
    pub(crate) notifier: Arc<Notifier>,
    scheduler: Weak<Inner>,
}

impl Registration {
    pub(crate) fn belongs_to(&self, scheduler: &Scheduler) -> bool {
        self.scheduler.ptr_eq(&Rc::downgrade(&scheduler.inner))
    }

    pub(crate) fn scheduler(&self) -> Option<Scheduler> {
        self.scheduler.upgrade().map(|inner| Scheduler { inner })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(inner) = self.scheduler.upgrade() {
            match inner.tasks.try_borrow_mut() {
                Ok(mut tasks) => {
                    tasks.remove(&self.id);
                }
                // Swept at the end of the next run.
                Err(_) => trace!(task.id = %self.id, "registry busy, removal deferred"),
            }
        }
    }
}

struct Inner {
    name: String,
    ready: Arc<ReadyQueue>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    // Non-owning: dropping a `Task` must release its computation even while
    // its id is still queued.
    tasks: RefCell<HashMap<TaskId, Weak<dyn Resume>>>,
    // Owning: tasks that must run to completion with no handle left.
    detached: RefCell<HashMap<TaskId, Rc<dyn Resume>>>,
    next_id: Cell<u64>,
}

/// Configures and creates a [`Scheduler`].
///
/// # Example
/// ```
/// use lockstep::Scheduler;
///
/// let scheduler = Scheduler::builder()
///     .name("worker")
///     .ready_capacity(128)
///     .timer_capacity(4)
///     .build();
/// assert_eq!(scheduler.name(), "worker");
/// ```
#[derive(Clone, Debug)]
#[must_use]
pub struct Builder {
    name: String,
    ready_capacity: usize,
    timer_capacity: usize,
}

impl Builder {
    /// Creates a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            name: DEFAULT_NAME.to_owned(),
            ready_capacity: DEFAULT_READY_CAPACITY,
            timer_capacity: DEFAULT_TIMER_CAPACITY,
        }
    }

    /// Sets the name recorded on the scheduler's tracing span.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets how many ready entries are preallocated.
    pub fn ready_capacity(mut self, capacity: usize) -> Self {
        self.ready_capacity = capacity;
        self
    }

    /// Sets how many timer entries are preallocated.
    pub fn timer_capacity(mut self, capacity: usize) -> Self {
        self.timer_capacity = capacity;
        self
    }

    /// Builds the scheduler.
    pub fn build(self) -> Scheduler {
        Scheduler {
            inner: Rc::new(Inner {
                name: self.name,
                ready: Arc::new(ReadyQueue::with_capacity(self.ready_capacity)),
                timers: RefCell::new(BinaryHeap::with_capacity(self.timer_capacity)),
                tasks: RefCell::new(HashMap::with_capacity(self.ready_capacity)),
                detached: RefCell::new(HashMap::new()),
                next_id: Cell::new(0),
            }),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// A cooperative, single-threaded driver for tasks and timers.
///
/// `Scheduler` is a cheap handle; clones refer to the same queues. It is not
/// `Send`, which keeps every task it drives on one thread.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

impl Scheduler {
    /// Creates a scheduler with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Builder::new().build()
    }

    /// Returns a [`Builder`] for a custom configuration.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Returns the scheduler currently running on this thread, or the thread's
    /// default scheduler when none is running.
    ///
    /// The default scheduler is created on first access and lives until the
    /// thread exits or [`reset_default`] replaces it.
    #[must_use]
    pub fn current() -> Self {
        CURRENT
            .with(|current| current.borrow().clone())
            .unwrap_or_else(thread_default)
    }

    /// Name given through [`Builder::name`].
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns `true` if `self` and `other` are handles to the same scheduler.
    #[must_use]
    pub fn ptr_eq(&self, other: &Scheduler) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Appends `task` to the ready queue, binding it to this scheduler.
    ///
    /// A task that is already queued is not queued twice.
    ///
    /// # Panics
    ///
    /// Panics if `task` is empty or already bound to another scheduler.
    pub fn submit_ready<T: 'static>(&self, task: &Task<T>) {
        task.registration_in(self).waker.wake_by_ref();
    }

    /// Registers `waker` to be woken once `deadline` has passed.
    pub fn submit_timer(&self, deadline: Instant, waker: Waker) {
        trace!(scheduler = %self.inner.name, ?deadline, "timer registered");
        self.inner
            .timers
            .borrow_mut()
            .push(TimerEntry { deadline, waker });
    }

    /// Returns `true` while the ready queue or the timer heap is non-empty.
    #[must_use]
    pub fn has_work(&self) -> bool {
        !self.inner.ready.is_empty() || !self.inner.timers.borrow().is_empty()
    }

    /// Drives ready tasks and timers until no work remains.
    ///
    /// The ready queue is drained in FIFO order, picking up entries queued by
    /// the tasks it resumes. Once empty, the earliest timer is fired if its
    /// deadline has passed; otherwise the thread blocks until that deadline or
    /// until a wake-up arrives from another thread.
    pub fn run(&self) {
        let span = debug_span!("scheduler", name = %self.inner.name);
        let _span = span.enter();
        let _context = Context::enter(self.clone());

        debug!("run started");
        while self.has_work() {
            while let Some(id) = self.inner.ready.pop() {
                self.resume(id);
            }
            self.advance_timers();
        }
        self.inner
            .tasks
            .borrow_mut()
            .retain(|_, task| task.strong_count() > 0);
        debug!(detached = self.inner.detached.borrow().len(), "run drained");
    }

    /// Runs `task` to completion on this scheduler and returns its result.
    ///
    /// The task is queued, then [`run`](Self::run) is called. Wake-ups from
    /// other threads are picked up while the scheduler still has work, for
    /// instance while it waits on a timer.
    ///
    /// # Errors
    ///
    /// Returns the error captured by the task.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler runs out of work while `task` is still
    /// suspended, since nothing is left that could resume it.
    ///
    /// # Example
    /// ```
    /// use lockstep::{Scheduler, Task};
    ///
    /// let scheduler = Scheduler::new();
    /// let task = Task::new(async { Ok(6 * 7) });
    /// assert_eq!(scheduler.block_on(task).unwrap(), 42);
    /// ```
    pub fn block_on<T: 'static>(&self, mut task: Task<T>) -> anyhow::Result<T> {
        self.submit_ready(&task);
        self.run();
        assert!(
            task.is_finished(),
            "scheduler {} ran out of work before the root task completed",
            self.inner.name
        );
        task.take_result()
    }

    /// Returns a timer future bound to this scheduler that completes at
    /// `deadline`.
    pub fn sleep_until(&self, deadline: Instant) -> Sleep {
        Sleep::at(deadline, Some(self.clone()))
    }

    /// Returns a timer future bound to this scheduler that completes after
    /// `duration`, counted from the first poll.
    pub fn sleep_for(&self, duration: Duration) -> Sleep {
        Sleep::after(duration, Some(self.clone()))
    }

    pub(crate) fn register(&self, task: Weak<dyn Resume>) -> Registration {
        let id = TaskId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);
        self.inner.tasks.borrow_mut().insert(id, task);

        let notifier = Arc::new(Notifier::new(id, Arc::clone(&self.inner.ready)));
        trace!(scheduler = %self.inner.name, task.id = %id, "task registered");
        Registration {
            id,
            waker: futures::task::waker(Arc::clone(&notifier)),
            notifier,
            scheduler: Rc::downgrade(&self.inner),
        }
    }

    // Keeps a task alive until it completes on this scheduler.
    pub(crate) fn detach<T: 'static>(&self, task: Task<T>) {
        let Some(core) = task.into_core() else {
            return;
        };
        if core.is_finished() {
            return;
        }
        let registration = core.bind(self);
        let id = registration.id;
        registration.waker.wake_by_ref();
        trace!(scheduler = %self.inner.name, task.id = %id, "task detached");
        self.inner.detached.borrow_mut().insert(id, core);
    }

    fn resume(&self, id: TaskId) {
        let task = self.inner.tasks.borrow().get(&id).and_then(Weak::upgrade);
        let Some(task) = task else {
            trace!(task.id = %id, "wake-up for a dropped task ignored");
            return;
        };
        if task.resume_queued().is_ready() {
            let detached = self.inner.detached.borrow_mut().remove(&id);
            if detached.is_some() {
                trace!(task.id = %id, "detached task finished");
            }
        }
    }

    fn advance_timers(&self) {
        let mut timers = self.inner.timers.borrow_mut();
        let Some(deadline) = timers.peek().map(|entry| entry.deadline) else {
            return;
        };
        let now = Instant::now();
        if deadline <= now {
            if let Some(entry) = timers.pop() {
                drop(timers);
                trace!(?deadline, "timer expired");
                entry.waker.wake();
            }
        } else {
            drop(timers);
            self.inner.ready.wait_timeout(deadline - now);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("tasks", &self.inner.tasks.borrow().len())
            .field("timers", &self.inner.timers.borrow().len())
            .finish_non_exhaustive()
    }
}

// Installs a scheduler as this thread's current one for the duration of a run,
// restoring the previous one on drop.
struct Context {
    previous: Option<Scheduler>,
}

impl Context {
    fn enter(scheduler: Scheduler) -> Self {
        let previous = CURRENT.with(|current| current.replace(Some(scheduler)));
        Self { previous }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| current.replace(previous));
    }
}

fn thread_default() -> Scheduler {
    DEFAULT.with(|default| default.borrow_mut().get_or_insert_with(Scheduler::new).clone())
}

/// Replaces this thread's default scheduler with a fresh one.
///
/// Pending work on the old default is dropped along with it once no other
/// handle refers to it. Meant for tests that need a clean slate.
pub fn reset_default() {
    let previous = DEFAULT.with(|default| default.borrow_mut().take());
    drop(previous);
}
