use super::task::{Pid, NPROC};

/// Tracks which task identifiers are held by living, non-zombie
/// tasks. A zombie gives its identifier back in `exit` while its
/// record lives on until the parent reaps it, so small pids come back
/// around quickly.
pub struct PidTable {
    // Index 0 is never handed out.
    used: Box<[bool]>,
}

impl PidTable {
    pub fn new() -> PidTable {
        PidTable {
            used: vec![false; NPROC + 1].into_boxed_slice(),
        }
    }

    /// Claim the lowest unused identifier, or `None` when all NPROC
    /// identifiers are taken.
    pub fn acquire(&mut self) -> Option<Pid> {
        for pid in 1..=NPROC {
            if !self.used[pid] {
                self.used[pid] = true;
                return Some(Pid(pid as u16));
            }
        }
        None
    }

    /// Return an identifier to the pool. Releasing an already-free
    /// identifier is a no-op.
    pub fn release(&mut self, pid: Pid) {
        self.used[pid.0 as usize] = false;
    }

    /// Number of identifiers currently claimed.
    pub fn in_use(&self) -> usize {
        self.used.iter().filter(|u| **u).count()
    }
}
