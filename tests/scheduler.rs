use std::{
    cell::RefCell,
    rc::Rc,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use futures::task::{ArcWake, waker};
use lockstep::{Scheduler, Task, scheduler, sleep_for};

struct CountingWaker(AtomicUsize);

impl ArcWake for CountingWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn sleeper(id: i32, ms: u64) -> Task<i32> {
    Task::new(async move {
        sleep_for(Duration::from_millis(ms)).await;
        Ok(id)
    })
}

#[test]
fn scheduler_runs_submitted_tasks() {
    let scheduler = Scheduler::new();
    let mut t1 = sleeper(1, 10);
    let mut t2 = sleeper(2, 20);

    scheduler.submit_ready(&t1);
    scheduler.submit_ready(&t2);
    assert!(scheduler.has_work(), "Submitted tasks are ready work");

    scheduler.run();

    assert!(!scheduler.has_work(), "Run should drain everything");
    assert_eq!(t1.take_result().unwrap(), 1, "Task 1 should have result");
    assert_eq!(t2.take_result().unwrap(), 2, "Task 2 should have result");
}

#[test]
fn scheduler_ready_queue_is_fifo() {
    let scheduler = Scheduler::new();
    let log = Rc::new(RefCell::new(String::new()));

    let tasks: Vec<Task<()>> = ["a", "b", "c"]
        .into_iter()
        .map(|name| {
            let log = Rc::clone(&log);
            Task::new(async move {
                log.borrow_mut().push_str(name);
                futures_lite::future::yield_now().await;
                log.borrow_mut().push_str(&name.to_uppercase());
                Ok(())
            })
        })
        .collect();

    for task in &tasks {
        scheduler.submit_ready(task);
    }
    scheduler.run();

    assert_eq!(
        *log.borrow(),
        "abcABC",
        "Re-queued tasks go behind the ones already waiting"
    );
    assert!(tasks.iter().all(Task::is_finished));
}

#[test]
fn scheduler_submitting_twice_queues_once() {
    let scheduler = Scheduler::new();
    let runs = Rc::new(RefCell::new(0));
    let runs_cl = Rc::clone(&runs);

    let task = Task::new(async move {
        *runs_cl.borrow_mut() += 1;
        Ok(())
    });
    scheduler.submit_ready(&task);
    scheduler.submit_ready(&task);
    scheduler.run();

    assert_eq!(*runs.borrow(), 1, "Body should run once");
}

#[test]
fn scheduler_fires_timers_by_deadline() {
    let scheduler = Scheduler::new();
    let now = Instant::now();
    let early = Arc::new(CountingWaker(AtomicUsize::new(0)));
    let late = Arc::new(CountingWaker(AtomicUsize::new(0)));

    scheduler.submit_timer(now + Duration::from_millis(30), waker(Arc::clone(&late)));
    scheduler.submit_timer(now + Duration::from_millis(5), waker(Arc::clone(&early)));
    scheduler.run();

    assert!(now.elapsed() >= Duration::from_millis(30), "Run blocks until the last deadline");
    assert_eq!(early.0.load(Ordering::SeqCst), 1);
    assert_eq!(late.0.load(Ordering::SeqCst), 1);
}

#[test]
fn scheduler_interleaves_timers_with_ready_work() {
    let scheduler = Scheduler::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    let slow = {
        let order = Rc::clone(&order);
        let timer = scheduler.sleep_for(Duration::from_millis(40));
        Task::new(async move {
            timer.await;
            order.borrow_mut().push("slow");
            Ok(())
        })
    };
    let fast = {
        let order = Rc::clone(&order);
        let timer = scheduler.sleep_for(Duration::from_millis(10));
        Task::new(async move {
            timer.await;
            order.borrow_mut().push("fast");
            Ok(())
        })
    };

    scheduler.submit_ready(&slow);
    scheduler.submit_ready(&fast);
    scheduler.run();

    assert_eq!(*order.borrow(), vec!["fast", "slow"]);
}

#[test]
fn scheduler_picks_up_wakes_from_other_threads() {
    let scheduler = Scheduler::new();
    let (sender, receiver) = tokio::sync::oneshot::channel();
    let start = Instant::now();

    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        sender.send(5u32).unwrap();
    });

    let received = Task::new(async move {
        let value = receiver.await?;
        Ok((value, start.elapsed()))
    });
    // The timer keeps the scheduler busy while the other thread sends.
    let task = Task::new(async move {
        let ((value, at), ()) =
            lockstep::join_all((received, sleep_for(Duration::from_millis(150)))).await?;
        Ok((value, at))
    });

    let (value, at) = scheduler.block_on(task).unwrap();
    handle.join().unwrap();

    assert_eq!(value, 5);
    assert!(
        at < Duration::from_millis(150),
        "Wake-up should interrupt the timer wait, arrived after {at:?}"
    );
}

#[test]
#[should_panic(expected = "ran out of work before the root task completed")]
fn scheduler_block_on_without_pending_work_panics() {
    let scheduler = Scheduler::new();
    let task = Task::new(async {
        futures::future::pending::<()>().await;
        Ok(())
    });
    let _ = scheduler.block_on(task);
}

#[test]
fn scheduler_forgets_dropped_tasks() {
    let scheduler = Scheduler::builder().name("registry").build();
    let tasks: Vec<Task<()>> = (0..3).map(|_| Task::new(async { Ok(()) })).collect();
    for task in &tasks {
        scheduler.submit_ready(task);
    }
    assert!(format!("{scheduler:?}").contains("tasks: 3"));

    drop(tasks);
    scheduler.run();

    assert!(
        format!("{scheduler:?}").contains("tasks: 0"),
        "Registry should be empty, got {scheduler:?}"
    );
}

#[test]
fn scheduler_current_is_running_scheduler() {
    let scheduler = Scheduler::builder().name("inner").build();
    let seen = Arc::new(Mutex::new(String::new()));
    let seen_cl = Arc::clone(&seen);

    let task = Task::new(async move {
        *seen_cl.lock().unwrap() = Scheduler::current().name().to_owned();
        Ok(())
    });
    scheduler.block_on(task).unwrap();

    assert_eq!(*seen.lock().unwrap(), "inner");
    assert_eq!(Scheduler::current().name(), "lockstep", "Default is back outside run");
}

#[test]
fn scheduler_default_is_lazy_and_resettable() {
    let first = Scheduler::current();
    assert!(first.ptr_eq(&Scheduler::current()), "Default is created once");

    scheduler::reset_default();
    assert!(!first.ptr_eq(&Scheduler::current()), "Reset installs a fresh default");
}

#[test]
#[should_panic(expected = "already bound to another scheduler")]
fn scheduler_rejects_foreign_task() {
    let first = Scheduler::new();
    let second = Scheduler::new();
    let task = Task::new(async { Ok(()) });

    first.submit_ready(&task);
    second.submit_ready(&task);
}
