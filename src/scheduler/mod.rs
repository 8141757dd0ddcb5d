pub mod context;
pub mod pid;
pub mod task;

use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::Duration;

use spin::Mutex;
use thiserror::Error;

use crate::signals::{self, SignalGuard};
use context::{
    adjust_stack, restore_context, save_context, Context, EXIT_RET, INIT_RET, SWITCH_RET,
};
use pid::PidTable;
pub use task::{Pid, TaskInfo, TaskState};
use task::{Link, Slot, Task, ANCHOR, NICE_MAX, NICE_MIN, NPROC, STACK_SIZE};

/// Errors surfaced by the public scheduler operations. The
/// no-runnable-task condition is not here: that one is fatal and
/// aborts the process.
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("scheduler is not initialized")]
    NotInitialized,
    #[error("scheduler is already initialized")]
    AlreadyInitialized,
    #[error("all {NPROC} task identifiers are in use")]
    PidExhausted,
    #[error("calling task has no children")]
    NoChildren,
    #[error("signal handler installation failed: {0}")]
    Signal(#[source] nix::Error),
    #[error("virtual timer setup failed: {0}")]
    Timer(#[source] std::io::Error),
}

/// What `fork` returned, and to whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkResult {
    /// Returned in the calling task; carries the new child's pid.
    Parent { child: Pid },
    /// Returned in the new task once it is first scheduled.
    Child,
}

/// The one process-wide scheduler. `None` outside `init`'s lifetime.
/// Lock guards are never held across a context save or restore; the
/// signal mask is what actually keeps the handlers out.
static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);

// Mirror of the current task's identity and tick count, so the
// accessors are single atomic loads even from a tight spin loop.
// Published at every dispatch and bumped by the tick handler.
static CURRENT_PID: AtomicU16 = AtomicU16::new(0);
static CURRENT_PPID: AtomicU16 = AtomicU16::new(0);
static CURRENT_TICKS: AtomicU64 = AtomicU64::new(0);

fn publish_current(t: &Task) {
    CURRENT_PID.store(t.pid.0, Ordering::Relaxed);
    CURRENT_PPID.store(t.ppid.0, Ordering::Relaxed);
    CURRENT_TICKS.store(t.cpu_time, Ordering::Relaxed);
}

/// Write straight to stderr, bypassing the log sink. Used from signal
/// handlers and the fatal path, where the interrupted task may hold
/// the sink lock.
fn raw_stderr(s: &str) {
    let bytes = s.as_bytes();
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
        )
    };
}

/// Scheduler state: the task arena, the intrusive rings across it,
/// the identifier table, and the saved driver context. Operations on
/// a `Scheduler` value never touch process-global state, so tests can
/// build as many as they like.
pub(crate) struct Scheduler {
    /// Task records, addressed by slot. A slot outlives the task's
    /// pid: a zombie keeps its slot (and stack) until reaped, while
    /// its pid is already back in the pool.
    arena: Vec<Option<Task>>,
    free: Vec<Slot>,
    /// Anchor of the global living-task ring.
    living: Link,
    current: Slot,
    pids: PidTable,
    /// Context that returns control out of `init` when task 1 exits.
    driver_ctx: Context,
}

impl Scheduler {
    fn new() -> Scheduler {
        Scheduler {
            arena: Vec::new(),
            free: Vec::new(),
            living: Link::detached(),
            current: 0,
            pids: PidTable::new(),
            driver_ctx: Context::empty(),
        }
    }

    fn task(&self, slot: Slot) -> &Task {
        self.arena[slot].as_ref().expect("stale task slot")
    }

    fn task_mut(&mut self, slot: Slot) -> &mut Task {
        self.arena[slot].as_mut().expect("stale task slot")
    }

    fn insert_task(&mut self, task: Task) -> Slot {
        match self.free.pop() {
            Some(slot) => {
                self.arena[slot] = Some(task);
                slot
            }
            None => {
                self.arena.push(Some(task));
                self.arena.len() - 1
            }
        }
    }

    /// Drop a record, releasing its stack. The pid is not touched;
    /// `exit` already returned it.
    fn free_task(&mut self, slot: Slot) {
        self.arena[slot] = None;
        self.free.push(slot);
    }

    /// Build task 1: its own parent, pid 1, RUNNING, entering the
    /// simulation at `entry` on a fresh private stack.
    fn bootstrap_root(&mut self, entry: fn()) {
        let pid = self.pids.acquire().expect("fresh pid table");
        debug_assert_eq!(pid, Pid(1));
        let mut root = Task::new(pid, pid, 0, 0, TaskState::Running);
        root.ctx = Context::bootstrap(root.stack_top, entry);
        let slot = self.insert_task(root);
        self.task_mut(slot).parent = slot;
        self.living_insert_after(None, slot);
        self.current = slot;
    }

    // ----- living ring ------------------------------------------------

    fn live_next(&self, s: Slot) -> Slot {
        if s == ANCHOR { self.living.next } else { self.task(s).live.next }
    }

    fn set_live_next(&mut self, s: Slot, v: Slot) {
        if s == ANCHOR { self.living.next = v } else { self.task_mut(s).live.next = v }
    }

    fn set_live_prev(&mut self, s: Slot, v: Slot) {
        if s == ANCHOR { self.living.prev = v } else { self.task_mut(s).live.prev = v }
    }

    /// Insert `n` immediately after `after` (`None` = the anchor, i.e.
    /// the ring front). `fork` uses this to place a child right after
    /// its parent.
    fn living_insert_after(&mut self, after: Option<Slot>, n: Slot) {
        let a = after.unwrap_or(ANCHOR);
        let b = self.live_next(a);
        self.set_live_next(a, n);
        self.task_mut(n).live = Link { prev: a, next: b };
        self.set_live_prev(b, n);
    }

    fn living_remove(&mut self, n: Slot) {
        let Link { prev, next } = self.task(n).live;
        self.set_live_next(prev, next);
        self.set_live_prev(next, prev);
        self.task_mut(n).live = Link::detached();
    }

    // ----- children rings ---------------------------------------------

    fn set_kid_next(&mut self, parent: Slot, s: Slot, v: Slot) {
        if s == ANCHOR { self.task_mut(parent).kids.next = v } else { self.task_mut(s).sib.next = v }
    }

    fn set_kid_prev(&mut self, parent: Slot, s: Slot, v: Slot) {
        if s == ANCHOR { self.task_mut(parent).kids.prev = v } else { self.task_mut(s).sib.prev = v }
    }

    fn child_push_front(&mut self, parent: Slot, child: Slot) {
        let first = self.task(parent).kids.next;
        self.task_mut(child).sib = Link { prev: ANCHOR, next: first };
        self.set_kid_prev(parent, first, child);
        self.task_mut(parent).kids.next = child;
    }

    fn child_remove(&mut self, parent: Slot, child: Slot) {
        let Link { prev, next } = self.task(child).sib;
        self.set_kid_next(parent, prev, next);
        self.set_kid_prev(parent, next, prev);
        self.task_mut(child).sib = Link::detached();
    }

    /// Splice `from`'s whole children ring onto the front of `to`'s,
    /// in O(1). Used by `exit` to hand orphaned grandchildren to the
    /// grandparent.
    fn child_splice_front(&mut self, from: Slot, to: Slot) {
        let first = self.task(from).kids.next;
        if first == ANCHOR {
            return;
        }
        let last = self.task(from).kids.prev;
        let old_first = self.task(to).kids.next;

        self.task_mut(to).kids.next = first;
        self.task_mut(first).sib.prev = ANCHOR;
        self.task_mut(last).sib.next = old_first;
        if old_first == ANCHOR {
            self.task_mut(to).kids.prev = last;
        } else {
            self.task_mut(old_first).sib.prev = last;
        }
        self.task_mut(from).kids = Link::detached();
    }

    fn children_slots(&self, parent: Slot) -> Vec<Slot> {
        let mut out = Vec::new();
        let mut s = self.task(parent).kids.next;
        while s != ANCHOR {
            out.push(s);
            s = self.task(s).sib.next;
        }
        out
    }

    fn has_children(&self, parent: Slot) -> bool {
        self.task(parent).kids.next != ANCHOR
    }

    fn has_zombie_child(&self, parent: Slot) -> bool {
        let mut s = self.task(parent).kids.next;
        while s != ANCHOR {
            let t = self.task(s);
            if t.state == TaskState::Zombie {
                return true;
            }
            s = t.sib.next;
        }
        false
    }

    // ----- policy -----------------------------------------------------

    fn refresh_priorities(&mut self) {
        let mut s = self.living.next;
        while s != ANCHOR {
            let t = self.task_mut(s);
            t.priority = 19 - t.nice;
            s = self.task(s).live.next;
        }
    }

    /// A round is over once no READY task still holds a slice.
    fn round_exhausted(&self) -> bool {
        let mut s = self.living.next;
        while s != ANCHOR {
            let t = self.task(s);
            if t.state == TaskState::Ready && t.slice_max != 0 {
                return false;
            }
            s = t.live.next;
        }
        true
    }

    /// Grant new slices sized by priority. When a round is still in
    /// progress only tasks that have not yet run (nonzero slice_max)
    /// are topped up, so the already-ran mark survives.
    fn replenish_slices(&mut self, new_round: bool) {
        let mut s = self.living.next;
        while s != ANCHOR {
            let t = self.task_mut(s);
            if new_round || t.slice_max != 0 {
                t.slice_max = (t.priority + 1) as u64;
            }
            s = self.task(s).live.next;
        }
    }

    /// Highest-priority READY task still holding a slice. Ties go to
    /// the first one encountered in ring order, which favors a parent
    /// over its freshly forked children.
    fn select_next(&self) -> Option<Slot> {
        let mut best = None;
        let mut best_priority = i16::MIN;
        let mut s = self.living.next;
        while s != ANCHOR {
            let t = self.task(s);
            if t.state == TaskState::Ready && t.slice_max != 0 && t.priority > best_priority {
                best_priority = t.priority;
                best = Some(s);
            }
            s = t.live.next;
        }
        best
    }

    // ----- lifecycle helpers ------------------------------------------

    /// Hand every child of `cur` to `cur`'s parent, then splice the
    /// whole children ring across.
    fn reparent_children(&mut self, cur: Slot) {
        let parent = self.task(cur).parent;
        let ppid = self.task(cur).ppid;
        let mut s = self.task(cur).kids.next;
        while s != ANCHOR {
            let t = self.task_mut(s);
            t.parent = parent;
            t.ppid = ppid;
            s = self.task(s).sib.next;
        }
        self.child_splice_front(cur, parent);
    }

    /// Free every zombie child of `parent` in one front-to-back walk.
    /// Reports the pid and exit code of the last zombie encountered;
    /// which one that is when several are present is deliberately
    /// unspecified by the ordering contract.
    fn reap_zombies(&mut self, parent: Slot) -> Option<(Pid, i32)> {
        let mut reaped = None;
        for slot in self.children_slots(parent) {
            if self.task(slot).state != TaskState::Zombie {
                continue;
            }
            let (pid, code) = {
                let t = self.task(slot);
                (t.pid, t.exit_code)
            };
            self.living_remove(slot);
            self.child_remove(parent, slot);
            self.free_task(slot);
            reaped = Some((pid, code));
        }
        reaped
    }

    fn snapshot(&self) -> Vec<TaskInfo> {
        let mut out = Vec::new();
        let mut s = self.living.next;
        while s != ANCHOR {
            let t = self.task(s);
            out.push(TaskInfo {
                pid: t.pid,
                ppid: t.ppid,
                state: t.state,
                stack_base: t.stack_base(),
                nice: t.nice,
                priority: t.priority,
                cpu_time: t.cpu_time,
            });
            s = t.live.next;
        }
        out
    }
}

// ---------------------------------------------------------------------
// Public operations
// ---------------------------------------------------------------------

/// Start the simulation with the default 100 ms virtual-time tick.
/// Builds task 1 on a private stack, transfers execution to `entry`,
/// and returns once task 1 exits.
pub fn init(entry: fn()) -> Result<(), SchedError> {
    init_with_interval(entry, Duration::from_millis(100))
}

/// `init` with an explicit tick period. Shorter periods compress
/// virtual time, which keeps scheduling tests fast without changing
/// any ordering behavior.
pub fn init_with_interval(entry: fn(), period: Duration) -> Result<(), SchedError> {
    {
        let mut lk = SCHEDULER.lock();
        if lk.is_some() {
            return Err(SchedError::AlreadyInitialized);
        }
        let mut sched = Scheduler::new();
        sched.bootstrap_root(entry);
        *lk = Some(sched);
    }

    let driver_mask = signals::current_mask();

    if let Err(err) = signals::install_handlers(tick_handler, listing_handler) {
        crate::log_error!("init failed: could not install signal handlers: {}", err);
        SCHEDULER.lock().take();
        return Err(SchedError::Signal(err));
    }
    if let Err(err) = signals::arm_timer(period) {
        crate::log_error!("init failed: could not arm the virtual timer: {}", err);
        SCHEDULER.lock().take();
        return Err(SchedError::Timer(err));
    }

    let (driver_ctx, root_ctx) = {
        let mut lk = SCHEDULER.lock();
        let sched = lk.as_mut().expect("scheduler vanished during init");
        publish_current(sched.task(sched.current));
        (
            &mut sched.driver_ctx as *mut Context,
            &sched.task(sched.current).ctx as *const Context,
        )
    };

    if unsafe { save_context(driver_ctx) } == 0 {
        // Hand the host thread to task 1 on its own stack. From here
        // on the driver context only resumes when task 1 exits.
        unsafe { restore_context(root_ctx, 0) };
    }

    // Task 1 exited. Stop the tick, drop all remaining records (and
    // their stacks), and give the driver its own signal mask back:
    // the exiting task left everything blocked.
    signals::disarm_timer();
    SCHEDULER.lock().take();
    signals::set_mask(&driver_mask);
    Ok(())
}

/// Create a new task that is a copy of the caller: same stack
/// contents, same nice value, fresh pid. Returns
/// `ForkResult::Parent` in the caller and `ForkResult::Child` in the
/// new task once it is first scheduled; their relative order is up to
/// the scheduler.
///
/// # Safety
/// The child re-runs the caller's live stack frames on a private
/// copy. Any non-`Copy` local reachable from those frames is logically
/// duplicated, and dropping it in both tasks is a double free. Keep
/// owning locals out of scope around the call and move shared results
/// through statics or the heap.
pub unsafe fn fork() -> Result<ForkResult, SchedError> {
    let guard = SignalGuard::block();

    struct Prep {
        child: Slot,
        child_pid: Pid,
        parent_base: *const u8,
        child_base: *mut u8,
        parent_top: usize,
        offset: isize,
    }

    let prep = {
        let mut lk = SCHEDULER.lock();
        let Some(sched) = lk.as_mut() else {
            drop(lk);
            guard.release();
            return Err(SchedError::NotInitialized);
        };
        let cur = sched.current;
        let Some(pid) = sched.pids.acquire() else {
            crate::log_error!("fork failed: all {} task identifiers are in use", NPROC);
            drop(lk);
            guard.release();
            return Err(SchedError::PidExhausted);
        };

        // The child enters the rings READY before its context exists;
        // the signal mask keeps any dispatch from seeing it half
        // built.
        let (ppid, nice) = {
            let p = sched.task(cur);
            (p.pid, p.nice)
        };
        let child = sched.insert_task(Task::new(pid, ppid, nice, cur, TaskState::Ready));
        sched.living_insert_after(Some(cur), child);
        sched.child_push_front(cur, child);

        let parent_top = sched.task(cur).stack_top;
        let child_top = sched.task(child).stack_top;
        Prep {
            child,
            child_pid: pid,
            parent_base: sched.task(cur).stack_base() as *const u8,
            child_base: sched.task(child).stack_base() as *mut u8,
            parent_top,
            offset: child_top as isize - parent_top as isize,
        }
    };

    // Byte-for-byte copy of the caller's stack window, taken while we
    // are running on it.
    unsafe { core::ptr::copy_nonoverlapping(prep.parent_base, prep.child_base, STACK_SIZE) };

    let mut ctx = Context::empty();
    if unsafe { save_context(&mut ctx) } == SWITCH_RET {
        // The child's first dispatch resumes right here, on the copy.
        guard.release();
        return Ok(ForkResult::Child);
    }

    unsafe { adjust_stack(prep.child_base, prep.child_base.add(STACK_SIZE), prep.offset) };
    ctx.relocate(prep.parent_top - STACK_SIZE, prep.parent_top, prep.offset);

    {
        let mut lk = SCHEDULER.lock();
        let sched = lk.as_mut().expect("scheduler vanished during fork");
        sched.task_mut(prep.child).ctx = ctx;
    }
    guard.release();
    Ok(ForkResult::Parent { child: prep.child_pid })
}

/// Terminate the calling task. Children are handed to the caller's
/// parent, the pid goes back to the pool, and the record lingers as a
/// zombie until the parent reaps it. When task 1 exits the whole
/// simulation ends and `init` returns instead.
pub fn exit(code: i32) -> ! {
    let _guard = SignalGuard::block();
    let mut lk = SCHEDULER.lock();

    {
        let sched = lk.as_mut().expect("exit called outside the simulation");
        let cur = sched.current;
        if sched.task(cur).pid == Pid(1) {
            // Root exit ends the simulation before re-parenting could
            // ever look at the root's self-parent link. Marking it
            // ZOMBIE first keeps a straggling tick from charging the
            // driver's time to it.
            let t = sched.task_mut(cur);
            t.state = TaskState::Zombie;
            t.exit_code = code;
            let ctx = &sched.driver_ctx as *const Context;
            drop(lk);
            unsafe { restore_context(ctx, INIT_RET) };
        }
    }

    {
        let sched = lk.as_mut().expect("exit called outside the simulation");
        let cur = sched.current;
        sched.reparent_children(cur);
        let t = sched.task_mut(cur);
        t.state = TaskState::Zombie;
        t.exit_code = code;
        let pid = t.pid;
        sched.pids.release(pid);
    }
    drop(lk);

    switch();
    unreachable!("a zombie is never switched back in");
}

/// Reap one batch of zombie children. Blocks (SLEEPING) until a child
/// exits if none is a zombie yet; fails fast when the caller has no
/// children at all. Every zombie child present is freed in this one
/// call; the returned pid and exit code are the last zombie
/// encountered in the children ring.
pub fn wait() -> Result<(Pid, i32), SchedError> {
    let guard = SignalGuard::block();

    {
        let mut lk = SCHEDULER.lock();
        let Some(sched) = lk.as_mut() else {
            drop(lk);
            guard.release();
            return Err(SchedError::NotInitialized);
        };
        let cur = sched.current;
        if !sched.has_children(cur) {
            drop(lk);
            guard.release();
            return Err(SchedError::NoChildren);
        }
    }

    loop {
        let save_ptr = {
            let mut lk = SCHEDULER.lock();
            let sched = lk.as_mut().expect("scheduler vanished during wait");
            let cur = sched.current;
            if sched.has_zombie_child(cur) {
                break;
            }
            let t = sched.task_mut(cur);
            t.state = TaskState::Sleeping;
            t.slice_acc = 0;
            &mut t.ctx as *mut Context
        };
        // The context is saved here, not in switch, so an exiting
        // child can resume us directly with EXIT_RET.
        if unsafe { save_context(save_ptr) } == 0 {
            switch();
            unreachable!("a sleeping task is resumed only through its saved context");
        }
        // Woken by a child's exit.
        let mut lk = SCHEDULER.lock();
        let sched = lk.as_mut().expect("scheduler vanished during wait");
        let cur = sched.current;
        sched.task_mut(cur).state = TaskState::Running;
    }

    let reaped = {
        let mut lk = SCHEDULER.lock();
        let sched = lk.as_mut().expect("scheduler vanished during wait");
        let cur = sched.current;
        sched.reap_zombies(cur)
    };
    guard.release();
    let (pid, code) = reaped.expect("woke from wait with no zombie child");
    Ok((pid, code))
}

/// Set the calling task's nice value. Values outside
/// [-20, +19] leave the current value untouched.
pub fn nice(v: i16) {
    if !(NICE_MIN..=NICE_MAX).contains(&v) {
        return;
    }
    let guard = SignalGuard::block();
    {
        let mut lk = SCHEDULER.lock();
        if let Some(sched) = lk.as_mut() {
            let cur = sched.current;
            sched.task_mut(cur).nice = v;
        }
    }
    guard.release();
}

/// Pid of the calling task. Meaningful only while the simulation is
/// running.
pub fn getpid() -> Pid {
    Pid(CURRENT_PID.load(Ordering::Relaxed))
}

/// Pid of the calling task's parent.
pub fn getppid() -> Pid {
    Pid(CURRENT_PPID.load(Ordering::Relaxed))
}

/// Ticks charged to the calling task so far.
pub fn gettick() -> u64 {
    CURRENT_TICKS.load(Ordering::Relaxed)
}

/// Snapshot of every task in the living ring, zombies included.
pub fn tasks() -> Vec<TaskInfo> {
    let guard = SignalGuard::block();
    let snapshot = {
        let lk = SCHEDULER.lock();
        match lk.as_ref() {
            Some(sched) => sched.snapshot(),
            None => Vec::new(),
        }
    };
    guard.release();
    snapshot
}

/// Print the living-task table to stderr. Also installed as the
/// SIGABRT handler so an operator can demand a snapshot at any time.
pub fn listing() {
    use core::fmt::Write;

    let guard = SignalGuard::block();
    // try_lock, like tick: a handler that finds the lock held (e.g. a
    // SIGABRT landing inside init's unguarded setup windows) must
    // skip rather than spin against its own thread.
    let snapshot = {
        match SCHEDULER.try_lock() {
            Some(lk) => lk.as_ref().map(|sched| sched.snapshot()),
            None => None,
        }
    };
    if let Some(rows) = snapshot {
        // Formatted into one buffer and written raw: the interrupted
        // task may be holding the log sink.
        let mut out = String::new();
        let _ = writeln!(out, "PID\tPPID\tSTATE\t\tSTACK_BASE\tNICE\tPRI\tCPU_TIME");
        for r in rows {
            let _ = writeln!(
                out,
                "{:>4}\t{:>4}\t{:<8}\t{:#014x}\t{}\t{}\t{}",
                r.pid,
                r.ppid,
                r.state.as_str(),
                r.stack_base,
                r.nice,
                r.priority,
                r.cpu_time
            );
        }
        raw_stderr(&out);
    }
    guard.release();
}

// ---------------------------------------------------------------------
// Tick and switch
// ---------------------------------------------------------------------

extern "C" fn tick_handler(_sig: libc::c_int) {
    tick();
}

extern "C" fn listing_handler(_sig: libc::c_int) {
    listing();
}

/// One firing of the virtual timer. Charges the running task and
/// preempts it once its slice is spent. A tick that lands while no
/// task is RUNNING (mid-teardown, or a guarded window that briefly
/// unmasked) is ignored.
fn tick() {
    {
        let Some(mut lk) = SCHEDULER.try_lock() else {
            return;
        };
        let Some(sched) = lk.as_mut() else {
            return;
        };
        let cur = sched.current;
        if sched.task(cur).state != TaskState::Running {
            return;
        }
        let t = sched.task_mut(cur);
        if t.slice_acc < t.slice_max {
            t.cpu_time += 1;
            t.slice_acc += 1;
            CURRENT_TICKS.store(t.cpu_time, Ordering::Relaxed);
            return;
        }
        // Slice spent: off the CPU.
        t.state = TaskState::Ready;
    }
    switch();
}

/// The only place a context switch happens. Callers are `exit`,
/// `wait` (after putting themselves to sleep) and the tick handler;
/// control comes back here only when the caller is switched back in.
pub(crate) fn switch() {
    let guard = SignalGuard::block();
    let mut lk = SCHEDULER.lock();

    // An exiting zombie whose parent sleeps in wait hands the CPU
    // straight to that parent; nothing else changes until the parent
    // reaps.
    {
        let sched = lk.as_mut().expect("switch without an active scheduler");
        let cur = sched.current;
        if sched.task(cur).state == TaskState::Zombie {
            let parent = sched.task(cur).parent;
            if sched.task(parent).state == TaskState::Sleeping {
                sched.current = parent;
                publish_current(sched.task(parent));
                let ctx = &sched.task(parent).ctx as *const Context;
                drop(lk);
                unsafe { restore_context(ctx, EXIT_RET) };
            }
        }
    }

    let save_ptr = {
        let sched = lk.as_mut().expect("switch without an active scheduler");
        let cur = sched.current;

        // The caller's burst is over.
        let t = sched.task_mut(cur);
        t.slice_max = 0;
        t.slice_acc = 0;

        sched.refresh_priorities();
        let new_round = sched.round_exhausted();
        sched.replenish_slices(new_round);

        // A SLEEPING caller already saved its context in wait; saving
        // again here would clobber the resume point exit relies on.
        if sched.task(cur).state == TaskState::Sleeping {
            None
        } else {
            Some(&mut sched.task_mut(cur).ctx as *mut Context)
        }
    };
    drop(lk);

    if let Some(ctx) = save_ptr {
        if unsafe { save_context(ctx) } == SWITCH_RET {
            // Switched back in: return to the operation that called
            // us, unmasking on the way out.
            guard.release();
            return;
        }
    }

    let next_ctx = {
        let mut lk = SCHEDULER.lock();
        let sched = lk.as_mut().expect("switch without an active scheduler");
        let Some(next) = sched.select_next() else {
            raw_stderr("FATAL: no READY task is eligible to run; simulation is deadlocked\n");
            std::process::abort();
        };
        sched.current = next;
        let t = sched.task_mut(next);
        t.state = TaskState::Running;
        publish_current(t);
        &sched.task(next).ctx as *const Context
    };
    unsafe { restore_context(next_ctx, SWITCH_RET) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_entry() {}

    fn sched_with_root() -> Scheduler {
        let mut s = Scheduler::new();
        s.bootstrap_root(noop_entry);
        s
    }

    /// Fabricate a READY child the way fork links one in, minus the
    /// stack copying.
    fn spawn_child(s: &mut Scheduler, parent: Slot, nice: i16) -> Slot {
        let pid = s.pids.acquire().unwrap();
        let ppid = s.task(parent).pid;
        let child = s.insert_task(Task::new(pid, ppid, nice, parent, TaskState::Ready));
        s.living_insert_after(Some(parent), child);
        s.child_push_front(parent, child);
        child
    }

    fn living_pids(s: &Scheduler) -> Vec<u16> {
        s.snapshot().iter().map(|t| t.pid.0).collect()
    }

    #[test]
    fn root_is_its_own_parent_with_pid_one() {
        let s = sched_with_root();
        let root = s.current;
        assert_eq!(s.task(root).pid, Pid(1));
        assert_eq!(s.task(root).ppid, Pid(1));
        assert_eq!(s.task(root).parent, root);
        assert_eq!(living_pids(&s), vec![1]);
    }

    #[test]
    fn forked_children_sit_right_after_their_parent_in_ring_order() {
        let mut s = sched_with_root();
        let root = s.current;
        spawn_child(&mut s, root, 0);
        spawn_child(&mut s, root, 0);
        spawn_child(&mut s, root, 0);
        // Each insert lands directly after the parent, so the newest
        // child is closest to it.
        assert_eq!(living_pids(&s), vec![1, 4, 3, 2]);
    }

    #[test]
    fn children_ring_front_holds_the_newest_child() {
        let mut s = sched_with_root();
        let root = s.current;
        let a = spawn_child(&mut s, root, 0);
        let b = spawn_child(&mut s, root, 0);
        assert_eq!(s.children_slots(root), vec![b, a]);
    }

    #[test]
    fn select_prefers_higher_priority() {
        let mut s = sched_with_root();
        let root = s.current;
        let lazy = spawn_child(&mut s, root, 10);
        let eager = spawn_child(&mut s, root, -10);
        s.refresh_priorities();
        assert_eq!(s.task(lazy).priority, 9);
        assert_eq!(s.task(eager).priority, 29);
        assert_eq!(s.select_next(), Some(eager));
    }

    #[test]
    fn select_breaks_ties_by_ring_order() {
        let mut s = sched_with_root();
        let root = s.current;
        let older = spawn_child(&mut s, root, 0);
        let newer = spawn_child(&mut s, root, 0);
        s.refresh_priorities();
        // Root is RUNNING, both children READY at equal priority; the
        // one closer to the ring front wins.
        assert_eq!(s.select_next(), Some(newer));
        let _ = older;
    }

    #[test]
    fn ran_parent_loses_tie_to_fresh_child_only_after_its_slice_is_gone() {
        let mut s = sched_with_root();
        let root = s.current;
        let child = spawn_child(&mut s, root, 0);
        s.task_mut(root).state = TaskState::Ready;
        s.task_mut(root).slice_max = 0; // already ran this round
        s.refresh_priorities();
        assert_eq!(s.select_next(), Some(child));

        s.task_mut(root).slice_max = 21;
        // With both holding slices the parent is first in ring order.
        assert_eq!(s.select_next(), Some(root));
    }

    #[test]
    fn select_skips_sleepers_and_zombies() {
        let mut s = sched_with_root();
        let root = s.current;
        let a = spawn_child(&mut s, root, 0);
        let b = spawn_child(&mut s, root, 0);
        s.task_mut(a).state = TaskState::Sleeping;
        s.task_mut(b).state = TaskState::Zombie;
        s.refresh_priorities();
        assert_eq!(s.select_next(), None);
    }

    #[test]
    fn round_ends_only_when_no_ready_task_holds_a_slice() {
        let mut s = sched_with_root();
        let root = s.current;
        let a = spawn_child(&mut s, root, 0);
        assert!(!s.round_exhausted());

        s.task_mut(a).slice_max = 0;
        // Root is RUNNING, not READY, so it does not keep the round
        // open.
        assert!(s.round_exhausted());
    }

    #[test]
    fn replenish_preserves_the_already_ran_mark_mid_round() {
        let mut s = sched_with_root();
        let root = s.current;
        let ran = spawn_child(&mut s, root, 0);
        let fresh = spawn_child(&mut s, root, -5);
        s.task_mut(ran).slice_max = 0;
        s.refresh_priorities();

        s.replenish_slices(false);
        assert_eq!(s.task(ran).slice_max, 0);
        assert_eq!(s.task(fresh).slice_max, 25);

        s.replenish_slices(true);
        assert_eq!(s.task(ran).slice_max, 20);
        assert_eq!(s.task(fresh).slice_max, 25);
    }

    #[test]
    fn exit_bookkeeping_reparents_grandchildren_to_the_grandparent() {
        let mut s = sched_with_root();
        let root = s.current;
        let a = spawn_child(&mut s, root, 0);
        let b = spawn_child(&mut s, a, 0);
        let c = spawn_child(&mut s, a, 0);

        // The bookkeeping exit() performs for a non-root task.
        s.reparent_children(a);
        let pid_a = s.task(a).pid;
        s.task_mut(a).state = TaskState::Zombie;
        s.task_mut(a).exit_code = 7;
        s.pids.release(pid_a);

        for slot in [b, c] {
            assert_eq!(s.task(slot).parent, root);
            assert_eq!(s.task(slot).ppid, Pid(1));
        }
        // Orphans land at the front of the grandparent's ring.
        assert_eq!(s.children_slots(root), vec![c, b, a]);
        assert!(!s.has_children(a));
        assert!(s.has_zombie_child(root));
    }

    #[test]
    fn reap_frees_every_zombie_and_reports_the_last_one_walked() {
        let mut s = sched_with_root();
        let root = s.current;
        let a = spawn_child(&mut s, root, 0);
        let b = spawn_child(&mut s, root, 0);
        let alive = spawn_child(&mut s, root, 0);

        for (slot, code) in [(a, 11), (b, 22)] {
            let pid = s.task(slot).pid;
            s.task_mut(slot).state = TaskState::Zombie;
            s.task_mut(slot).exit_code = code;
            s.pids.release(pid);
        }

        // Ring order is [alive, b, a]; the last zombie walked is a.
        let reaped = s.reap_zombies(root).unwrap();
        assert_eq!(reaped, (Pid(2), 11));

        assert_eq!(s.children_slots(root), vec![alive]);
        assert_eq!(living_pids(&s), vec![1, 4]);
        // Released pids come straight back, lowest first.
        assert_eq!(s.pids.acquire(), Some(Pid(2)));
        assert_eq!(s.pids.acquire(), Some(Pid(3)));
    }

    #[test]
    fn reap_with_no_zombies_reports_nothing() {
        let mut s = sched_with_root();
        let root = s.current;
        spawn_child(&mut s, root, 0);
        assert_eq!(s.reap_zombies(root), None);
        assert_eq!(s.children_slots(root).len(), 1);
    }

    #[test]
    fn fork_exit_wait_leaves_state_isomorphic_to_before() {
        let mut s = sched_with_root();
        let root = s.current;
        let before = s.snapshot();
        let before_pids = s.pids.in_use();

        let child = spawn_child(&mut s, root, 0);
        let pid = s.task(child).pid;
        s.task_mut(child).state = TaskState::Zombie;
        s.pids.release(pid);
        s.reap_zombies(root);

        assert_eq!(s.snapshot(), before);
        assert_eq!(s.pids.in_use(), before_pids);
    }

    #[test]
    fn slot_reuse_does_not_disturb_a_lingering_zombie() {
        let mut s = sched_with_root();
        let root = s.current;
        let z = spawn_child(&mut s, root, 0);
        let zpid = s.task(z).pid;
        s.task_mut(z).state = TaskState::Zombie;
        s.pids.release(zpid);

        // The released pid is reused while the zombie's record still
        // occupies its slot.
        let reborn = spawn_child(&mut s, root, 0);
        assert_eq!(s.task(reborn).pid, zpid);
        assert_ne!(reborn, z);
        assert_eq!(s.task(z).state, TaskState::Zombie);
    }

    #[test]
    fn independent_schedulers_share_nothing() {
        let mut a = sched_with_root();
        let mut b = sched_with_root();
        let a_current = a.current;
        spawn_child(&mut a, a_current, 0);
        assert_eq!(living_pids(&a), vec![1, 2]);
        assert_eq!(living_pids(&b), vec![1]);
        let b_current = b.current;
        spawn_child(&mut b, b_current, 0);
        assert_eq!(living_pids(&b), vec![1, 2]);
    }
}
