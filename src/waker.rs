use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures::task::ArcWake;

use crate::scheduler::{ReadyQueue, TaskId};

// Wake-up target of one registered task. `Waker` must be `Send + Sync`, so this
// only carries the task id and a handle to the scheduler's ready queue; the
// task itself stays on the scheduler's thread.
pub(crate) struct Notifier {
    id: TaskId,
    queued: AtomicBool,
    ready: Arc<ReadyQueue>,
}

impl Notifier {
    pub(crate) fn new(id: TaskId, ready: Arc<ReadyQueue>) -> Self {
        Self {
            id,
            queued: AtomicBool::new(false),
            ready,
        }
    }

    // Called right before the task is polled, so wake-ups issued during the
    // poll queue it again.
    pub(crate) fn clear(&self) {
        self.queued.store(false, Ordering::Release);
    }
}

impl ArcWake for Notifier {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if !arc_self.queued.swap(true, Ordering::AcqRel) {
            arc_self.ready.push(arc_self.id);
        }
    }
}
