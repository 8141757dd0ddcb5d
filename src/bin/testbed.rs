//! Demo driver for the scheduler simulation: task 1 gives itself the
//! friendliest nice value, spawns five children that each pick a
//! different niceness, spin for 100 ticks of their own CPU time, and
//! exit with their tick count; the parent reaps them all. Runs on the
//! real 100 ms virtual timer, so expect it to take a while. Send the
//! process SIGABRT to get a task listing at any point.

use atomic_sched::{exit, fork, getpid, gettick, init, nice, wait, ForkResult};

const CHILD_COUNT: usize = 5;
const TICK_MAX: u64 = 100;

fn child_nice(i: usize) -> i16 {
    5 * i as i16 - 20
}

fn testbed() {
    nice(19);

    for i in 0..CHILD_COUNT {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                nice(child_nice(i));
                while gettick() < TICK_MAX {
                    std::hint::spin_loop();
                }
                exit(gettick() as i32);
            }
            Ok(ForkResult::Parent { child }) => {
                println!(">>> parent {} spawned child {}", getpid(), child);
            }
            Err(err) => {
                eprintln!(">>> fork failed: {}", err);
            }
        }
    }

    for _ in 0..CHILD_COUNT {
        match wait() {
            Ok((pid, code)) => println!(">>> child {} exited and returned {}", pid, code),
            Err(err) => eprintln!(">>> wait failed: {}", err),
        }
    }

    exit(0);
}

fn main() {
    match init(testbed) {
        Ok(()) => println!("init task exited; simulation over"),
        Err(err) => eprintln!("scheduler setup failed: {}", err),
    }
}
