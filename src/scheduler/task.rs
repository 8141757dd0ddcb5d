use super::context::Context;

/// Highest task identifier the simulation will ever hand out.
pub const NPROC: usize = 4096;

/// Size of each task's private stack.
pub const STACK_SIZE: usize = 64 * 1024;

/// Slack allocated past `STACK_SIZE` so the usable window can start
/// at a 16-byte-aligned top regardless of what the allocator returns.
pub const STACK_ALIGN: usize = 16;

/// Nominal slice granted to a freshly created task, in ticks.
pub const INITIAL_SLICE: u64 = 21;

/// Default dynamic priority of a freshly created task.
pub const DEFAULT_PRIORITY: i16 = 20;

pub const NICE_MIN: i16 = -20;
pub const NICE_MAX: i16 = 19;

/// Unique task identifier, 1 ..= NPROC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u16);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

/// Task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Sleeping,
    Zombie,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Ready => "READY",
            TaskState::Running => "RUNNING",
            TaskState::Sleeping => "SLEEPING",
            TaskState::Zombie => "ZOMBIE",
        }
    }
}

/// Arena slot of a task record. Slots are scheduler-internal handles;
/// identity visible to drivers is always the pid.
pub type Slot = usize;

/// Ring terminator. A link holding `ANCHOR` points at the ring's
/// sentinel rather than at another task.
pub const ANCHOR: Slot = usize::MAX;

/// Membership of one task in one intrusive ring, expressed as arena
/// slots instead of pointers.
#[derive(Debug, Clone, Copy)]
pub struct Link {
    pub prev: Slot,
    pub next: Slot,
}

impl Link {
    /// A detached link, equivalent to an empty ring when used as an
    /// anchor.
    pub fn detached() -> Link {
        Link { prev: ANCHOR, next: ANCHOR }
    }
}

/// A single simulated task.
pub struct Task {
    pub state: TaskState,
    /// Total ticks ever charged to this task.
    pub cpu_time: u64,
    /// Ticks this task may still claim in the current round; 0 marks
    /// a task that already ran this round.
    pub slice_max: u64,
    /// Ticks consumed within the current scheduled burst.
    pub slice_acc: u64,
    /// Dynamic priority, 19 − nice.
    pub priority: i16,
    /// Static niceness in [NICE_MIN, NICE_MAX].
    pub nice: i16,
    pub pid: Pid,
    pub ppid: Pid,
    /// Meaningful only once the task is a zombie.
    pub exit_code: i32,
    pub ctx: Context,
    /// Owned private stack memory — kept alive until the record is
    /// reaped. The usable window is the `STACK_SIZE` bytes below
    /// `stack_top`.
    pub stack: Box<[u8]>,
    /// Aligned top of the usable stack window (one past its highest
    /// byte).
    pub stack_top: usize,
    /// Arena slot of the parent record. The root task is its own
    /// parent.
    pub parent: Slot,
    /// Membership in the global living-task ring.
    pub live: Link,
    /// Membership in the parent's children ring.
    pub sib: Link,
    /// Anchor of this task's own children ring.
    pub kids: Link,
}

impl Task {
    /// Allocate a record with a fresh private stack. Linkage starts
    /// detached; the scheduler wires the rings up.
    pub fn new(pid: Pid, ppid: Pid, nice: i16, parent: Slot, state: TaskState) -> Task {
        let stack = vec![0u8; STACK_SIZE + STACK_ALIGN].into_boxed_slice();
        let stack_top = (stack.as_ptr() as usize + stack.len()) & !(STACK_ALIGN - 1);
        Task {
            state,
            cpu_time: 0,
            slice_max: INITIAL_SLICE,
            slice_acc: 0,
            priority: DEFAULT_PRIORITY,
            nice,
            pid,
            ppid,
            exit_code: 0,
            ctx: Context::empty(),
            stack,
            stack_top,
            parent,
            live: Link::detached(),
            sib: Link::detached(),
            kids: Link::detached(),
        }
    }

    /// Lowest address of the usable stack window.
    pub fn stack_base(&self) -> usize {
        self.stack_top - STACK_SIZE
    }
}

/// One row of the living-task snapshot exposed by `tasks()` and
/// printed by `listing()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub pid: Pid,
    pub ppid: Pid,
    pub state: TaskState,
    pub stack_base: usize,
    pub nice: i16,
    pub priority: i16,
    pub cpu_time: u64,
}
