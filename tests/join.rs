use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::{Duration, Instant},
};

use lockstep::{Scheduler, Task, block_on, join_all, join_iter, sleep_for};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("branch {0} failed")]
struct BranchError(u32);

fn delayed<T: 'static>(value: T, ms: u64) -> Task<T> {
    Task::new(async move {
        sleep_for(Duration::from_millis(ms)).await;
        Ok(value)
    })
}

fn failing(id: u32, ms: u64, reached: Rc<Cell<bool>>) -> Task<u32> {
    Task::new(async move {
        sleep_for(Duration::from_millis(ms)).await;
        reached.set(true);
        Err(BranchError(id).into())
    })
}

#[test]
fn join_preserves_input_order() {
    let joined = join_all((
        delayed(1, 30),
        delayed("two", 10),
        sleep_for(Duration::from_millis(5)),
        async { Ok::<_, anyhow::Error>(4.5) },
    ));

    let (a, b, (), d) = block_on(joined).unwrap();
    assert_eq!(a, 1);
    assert_eq!(b, "two");
    assert!((d - 4.5f64).abs() < f64::EPSILON);
}

#[test]
fn join_of_nothing_completes_on_first_step() {
    let mut joined = join_all(());
    assert!(joined.step(), "Empty join should not suspend");
    joined.take_result().unwrap();
}

#[test]
fn join_runs_branches_concurrently() {
    let start = Instant::now();
    let (a, b) = block_on(join_all((delayed(1, 100), delayed(2, 150)))).unwrap();
    let elapsed = start.elapsed();

    assert_eq!((a, b), (1, 2));
    assert!(elapsed >= Duration::from_millis(150), "Join waits for the slowest branch");
    assert!(
        elapsed < Duration::from_millis(240),
        "Branches should overlap, took {elapsed:?}"
    );
}

#[test]
fn join_surfaces_branch_error() {
    let reached = Rc::new(Cell::new(false));
    let joined = join_all((delayed(1, 5), failing(7, 10, Rc::clone(&reached))));

    let err = block_on(joined).unwrap_err();
    assert!(reached.get());
    assert_eq!(err.downcast_ref::<BranchError>(), Some(&BranchError(7)));
}

#[test]
fn join_keeps_first_recorded_error() {
    let slow_reached = Rc::new(Cell::new(false));
    let fast_reached = Rc::new(Cell::new(false));
    let joined = join_all((
        failing(1, 40, Rc::clone(&slow_reached)),
        failing(2, 10, Rc::clone(&fast_reached)),
    ));

    let err = block_on(joined).unwrap_err();
    assert_eq!(
        err.downcast_ref::<BranchError>(),
        Some(&BranchError(2)),
        "The earliest failure in time wins"
    );
    assert!(fast_reached.get());
    assert!(slow_reached.get(), "Remaining branches still run to completion");
}

#[test]
fn join_error_resumes_joiner_before_pending_branches() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let fast_reached = Rc::new(Cell::new(false));

    let slow = {
        let log = Rc::clone(&log);
        Task::new(async move {
            sleep_for(Duration::from_millis(80)).await;
            log.borrow_mut().push("slow branch done");
            Ok(1)
        })
    };
    let log_cl = Rc::clone(&log);
    let task = Task::new(async move {
        let start = Instant::now();
        let result = join_all((slow, failing(2, 10, fast_reached))).await;
        log_cl.borrow_mut().push("joiner resumed");
        Ok((result.is_err(), start.elapsed()))
    });

    let (failed, elapsed) = block_on(task).unwrap();
    assert!(failed, "Join should fail");
    assert!(
        elapsed < Duration::from_millis(80),
        "Joiner should resume on the error, resumed after {elapsed:?}"
    );
    assert_eq!(
        *log.borrow(),
        vec!["joiner resumed", "slow branch done"],
        "Pending branch still completes afterwards"
    );
}

#[test]
fn join_resumes_joiner_once() {
    let resumed = Rc::new(Cell::new(0));
    let resumed_cl = Rc::clone(&resumed);

    let task = Task::new(async move {
        let joined = join_all((delayed(1, 10), delayed(2, 5), delayed(3, 15)));
        let values = joined.await?;
        resumed_cl.set(resumed_cl.get() + 1);
        Ok(values)
    });

    assert_eq!(block_on(task).unwrap(), (1, 2, 3));
    assert_eq!(resumed.get(), 1);
}

#[test]
fn join_iter_preserves_input_order() {
    let tasks: Vec<_> = (0..5u64).map(|i| delayed(i, 25 - i * 5)).collect();
    let values = block_on(join_iter(tasks)).unwrap();
    assert_eq!(values, vec![0, 1, 2, 3, 4]);
}

#[test]
fn join_iter_of_nothing_is_empty() {
    let values = block_on(join_iter(Vec::<Task<u8>>::new())).unwrap();
    assert!(values.is_empty());
}

#[test]
fn join_macro_accepts_trailing_comma() {
    let task = Task::new(async {
        let (a, b) = lockstep::join_all!(delayed(3, 5), delayed(4, 1),).await?;
        Ok(a * b)
    });
    assert_eq!(block_on(task).unwrap(), 12);
}

#[test]
fn join_can_run_twice_in_sequence() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let log_cl = Rc::clone(&log);

    let main = Task::new(async move {
        for _ in 0..2 {
            let (a, b) = join_all((delayed(1, 20), delayed(2, 10))).await?;
            log_cl.borrow_mut().push((a, b));
        }
        Ok(())
    });

    let scheduler = Scheduler::new();
    scheduler.block_on(main).unwrap();
    assert_eq!(*log.borrow(), vec![(1, 2), (1, 2)]);
}

#[test]
fn join_with_inline_branches_does_not_suspend() {
    let joined = join_all((
        Task::new(async { Ok(1) }),
        async { Ok::<_, anyhow::Error>(2) },
    ));
    assert!(joined.step(), "Branches that never suspend finish the join inline");
}
