//! End-to-end lifecycle check: wait with no children fails fast, a
//! single forked child's exit code comes back through wait, and the
//! fork/exit/wait round trip leaves the scheduler where it started.
//!
//! Results travel out of the simulated tasks through statics; the
//! test asserts after `init` returns. One scenario per file: signal
//! handlers and the interval timer are process-global.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicUsize, Ordering::SeqCst};
use std::time::Duration;

use atomic_sched::{
    exit, fork, getpid, init_with_interval, tasks, wait, ForkResult, Pid, SchedError, TaskState,
};

static CHILDLESS_WAIT_FAILED: AtomicBool = AtomicBool::new(false);
static STILL_RUNNING_AFTER_FAILED_WAIT: AtomicBool = AtomicBool::new(false);
static FORKED_PID: AtomicU16 = AtomicU16::new(0);
static REAPED_PID: AtomicU16 = AtomicU16::new(0);
static REAPED_CODE: AtomicI32 = AtomicI32::new(0);
static LIVING_AFTER_REAP: AtomicUsize = AtomicUsize::new(0);
static ROOT_RUNNING_AFTER_REAP: AtomicBool = AtomicBool::new(false);
static REFORKED_PID: AtomicU16 = AtomicU16::new(0);

fn driver() {
    // Scenario S5: no children yet, wait must refuse without blocking.
    if let Err(SchedError::NoChildren) = wait() {
        CHILDLESS_WAIT_FAILED.store(true, SeqCst);
    }
    STILL_RUNNING_AFTER_FAILED_WAIT.store(getpid() == Pid(1), SeqCst);

    // Scenario S1: one child, echo its exit code back through wait.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => exit(42),
        Ok(ForkResult::Parent { child }) => FORKED_PID.store(child.0, SeqCst),
        Err(_) => exit(100),
    }
    match wait() {
        Ok((pid, code)) => {
            REAPED_PID.store(pid.0, SeqCst);
            REAPED_CODE.store(code, SeqCst);
        }
        Err(_) => exit(101),
    }

    let snap = tasks();
    LIVING_AFTER_REAP.store(snap.len(), SeqCst);
    ROOT_RUNNING_AFTER_REAP.store(
        snap.len() == 1 && snap[0].pid == Pid(1) && snap[0].state == TaskState::Running,
        SeqCst,
    );

    // The reaped child's pid was released at exit, so an immediate
    // re-fork gets the same small pid back.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => exit(0),
        Ok(ForkResult::Parent { child }) => REFORKED_PID.store(child.0, SeqCst),
        Err(_) => exit(102),
    }
    if wait().is_err() {
        exit(103);
    }
    exit(0);
}

#[test]
fn single_child_echo() {
    init_with_interval(driver, Duration::from_millis(5)).unwrap();

    assert!(CHILDLESS_WAIT_FAILED.load(SeqCst));
    assert!(STILL_RUNNING_AFTER_FAILED_WAIT.load(SeqCst));

    let forked = FORKED_PID.load(SeqCst);
    assert_ne!(forked, 0);
    assert_eq!(REAPED_PID.load(SeqCst), forked);
    assert_eq!(REAPED_CODE.load(SeqCst), 42);

    assert_eq!(LIVING_AFTER_REAP.load(SeqCst), 1);
    assert!(ROOT_RUNNING_AFTER_REAP.load(SeqCst));
    assert_eq!(REFORKED_PID.load(SeqCst), forked);

    // Teardown is complete: no living ring survives init's return.
    assert!(tasks().is_empty());
}
