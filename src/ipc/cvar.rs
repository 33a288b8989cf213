//! Condition variables.
//!
//! `wait` must be entered with the lock held: it releases the lock while
//! keeping an extra reference to it, sleeps on the cvar queue, and
//! re-acquires the lock after being signalled (possibly queueing on the
//! lock again). The extra reference is dropped only once the wait has
//! fully completed.

use std::collections::VecDeque;

use crate::hardware::Machine;
use crate::ipc::UtilityId;
use crate::kernel::{CvarPhase, Kernel, PendingOp, Pid, WaitChannel};
use crate::scheduler::task::TaskState;
use crate::syscalls::ERROR;

pub struct Cvar {
    pub wait_queue: VecDeque<Pid>,
}

impl Cvar {
    pub fn new() -> Self {
        Cvar {
            wait_queue: VecDeque::new(),
        }
    }
}

impl Default for Cvar {
    fn default() -> Self {
        Cvar::new()
    }
}

impl<M: Machine> Kernel<M> {
    /// First half of a cvar wait: drop the lock, park on the cvar queue.
    pub(crate) fn cvar_do_wait(&mut self, cvar: UtilityId, lock: UtilityId) {
        let cur = self.current;
        self.utility_get(lock);
        if self.lock_do_release(lock).is_err() {
            let _ = self.utility_put(lock);
            self.set_ret(ERROR);
            return;
        }

        let t = self.task_mut(cur);
        t.state = TaskState::Pending;
        t.pending = Some(PendingOp::CvarWait {
            cvar,
            lock,
            phase: CvarPhase::Waiting,
        });
        t.blocked_on = Some(WaitChannel::Cvar(cvar));
        self.cvar_mut(cvar).wait_queue.push_back(cur);
        self.schedule();
    }

    /// Second half, run each time the waiter is scheduled back in: take
    /// the lock if it is free, otherwise queue on it and keep waiting.
    pub(crate) fn cvar_finish_wait(&mut self, cvar: UtilityId, lock: UtilityId) {
        let cur = self.current;
        if self.lock_mut(lock).is_locked() {
            let t = self.task_mut(cur);
            t.state = TaskState::Pending;
            t.pending = Some(PendingOp::CvarWait {
                cvar,
                lock,
                phase: CvarPhase::Reacquire,
            });
            t.blocked_on = Some(WaitChannel::Lock(lock));
            self.lock_mut(lock).wait_queue.push_back(cur);
            self.schedule();
            return;
        }
        self.lock_mut(lock).lock();
        let _ = self.utility_put(lock);
        self.set_ret(0);
    }

    /// Wake the longest waiter.
    pub(crate) fn cvar_do_signal(&mut self, id: UtilityId) {
        if let Some(pid) = self.cvar_mut(id).wait_queue.pop_front() {
            self.task_wake_up(pid);
        }
        self.set_ret(0);
    }

    /// Wake every waiter.
    pub(crate) fn cvar_do_broadcast(&mut self, id: UtilityId) {
        while let Some(pid) = self.cvar_mut(id).wait_queue.pop_front() {
            self.task_wake_up(pid);
        }
        self.set_ret(0);
    }
}
