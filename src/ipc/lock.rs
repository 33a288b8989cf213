//! Binary locks with Mesa-semantics hand-off: release wakes every waiter
//! and the first one the scheduler runs re-checks and takes the lock.

use std::collections::VecDeque;

use crate::hardware::Machine;
use crate::ipc::UtilityId;
use crate::kernel::{Kernel, PendingOp, Pid, WaitChannel};
use crate::scheduler::task::TaskState;
use crate::{KernelError, Result};

pub struct Lock {
    /// 1 = free, 0 = held.
    counter: i32,
    pub wait_queue: VecDeque<Pid>,
}

impl Lock {
    pub fn new() -> Self {
        Lock {
            counter: 1,
            wait_queue: VecDeque::new(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.counter == 0
    }

    pub fn lock(&mut self) {
        self.counter -= 1;
    }

    pub fn unlock(&mut self) {
        self.counter += 1;
    }
}

impl Default for Lock {
    fn default() -> Self {
        Lock::new()
    }
}

impl<M: Machine> Kernel<M> {
    /// Acquire, blocking while the lock is held. Every wake-up re-checks:
    /// another waiter may have won the race in between.
    pub(crate) fn lock_do_acquire(&mut self, id: UtilityId) {
        let cur = self.current;
        if self.lock_mut(id).is_locked() {
            let t = self.task_mut(cur);
            t.state = TaskState::Pending;
            t.pending = Some(PendingOp::LockAcquire { id });
            t.blocked_on = Some(WaitChannel::Lock(id));
            self.lock_mut(id).wait_queue.push_back(cur);
            self.schedule();
            return;
        }
        self.lock_mut(id).lock();
        self.set_ret(0);
    }

    /// Release a held lock and wake all waiters.
    pub(crate) fn lock_do_release(&mut self, id: UtilityId) -> Result<()> {
        if !self.lock_mut(id).is_locked() {
            log::error!("release of a lock that is not held");
            return Err(KernelError::NotHeld);
        }
        self.lock_mut(id).unlock();
        self.lock_wake_up_all(id);
        Ok(())
    }

    pub(crate) fn lock_wake_up_all(&mut self, id: UtilityId) {
        while let Some(pid) = self.lock_mut(id).wait_queue.pop_front() {
            self.task_wake_up(pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_tracks_hold_state() {
        let mut l = Lock::new();
        assert!(!l.is_locked());
        l.lock();
        assert!(l.is_locked());
        l.unlock();
        assert!(!l.is_locked());
    }
}
