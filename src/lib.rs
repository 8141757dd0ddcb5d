//! User-space simulation of a preemptive, priority-based process
//! scheduler.
//!
//! The whole simulation runs inside a single host thread. Simulated
//! tasks live on private 64 KiB stacks and are multiplexed with saved
//! register contexts; a periodic virtual-time timer (SIGVTALRM)
//! delivers ticks that charge the running task and force it off the
//! CPU when its slice runs out. Tasks follow a Unix-like lifecycle:
//! `fork` copies the caller onto a fresh stack, `exit` leaves a
//! zombie behind, `wait` reaps it, and orphans are handed to the
//! grandparent.
//!
//! A driver seeds the simulation with [`init`], which builds task 1
//! and only returns once that task exits:
//!
//! ```no_run
//! use atomic_sched::{exit, fork, init, wait, ForkResult};
//!
//! fn entry() {
//!     match unsafe { fork() } {
//!         Ok(ForkResult::Child) => exit(42),
//!         Ok(ForkResult::Parent { .. }) => {
//!             let (pid, code) = wait().unwrap();
//!             println!("child {pid} exited with {code}");
//!             exit(0);
//!         }
//!         Err(err) => {
//!             eprintln!("fork failed: {err}");
//!             exit(1);
//!         }
//!     }
//! }
//!
//! init(entry).unwrap();
//! ```
//!
//! Only x86_64 Unix hosts are supported; the context-switch primitive
//! is register-level.

#[cfg(not(all(target_arch = "x86_64", unix)))]
compile_error!("the scheduler simulation requires an x86_64 Unix host");

pub mod log;
pub mod scheduler;
pub mod signals;

pub use scheduler::task::{Pid, TaskInfo, TaskState, INITIAL_SLICE, NPROC, STACK_SIZE};
pub use scheduler::{
    exit, fork, getpid, getppid, gettick, init, init_with_interval, listing, nice, tasks, wait,
    ForkResult, SchedError,
};
