//! The scheduler: ready queue, wait-queue bookkeeping, round-robin
//! preemption and the yield path every blocking operation funnels into.

pub mod context;
pub mod task;

use crate::hardware::{Machine, VMEM_1_BASE, VMEM_1_LIMIT};
use crate::kernel::{Kernel, Pid, WaitChannel};
use crate::memory::Region;
use task::TaskState;

impl<M: Machine> Kernel<M> {
    /// Queue a task at the tail of the ready queue.
    pub(crate) fn ready_enqueue(&mut self, pid: Pid) {
        self.ready.push_back(pid);
    }

    /// Queue a task at the head of the ready queue. Used for fresh fork
    /// children and just-completed I/O waiters.
    pub(crate) fn ready_queue_insert(&mut self, pid: Pid) {
        self.ready.push_front(pid);
    }

    /// Pop the next runnable task. Idle runs only when nothing else is
    /// ready: if it surfaces while the queue is non-empty it goes back to
    /// the tail and the pick repeats.
    fn ready_dequeue(&mut self) -> Option<Pid> {
        loop {
            let pid = self.ready.pop_front()?;
            if pid == Pid::IDLE && !self.ready.is_empty() {
                self.ready.push_back(pid);
                continue;
            }
            return Some(pid);
        }
    }

    /// Make a task runnable at the tail of the ready queue.
    pub(crate) fn task_wake_up(&mut self, pid: Pid) {
        let t = self.task_mut(pid);
        t.state = TaskState::Ready;
        t.blocked_on = None;
        self.ready_enqueue(pid);
    }

    /// Make a task runnable at the head of the ready queue.
    pub(crate) fn task_wake_up_front(&mut self, pid: Pid) {
        let t = self.task_mut(pid);
        t.state = TaskState::Ready;
        t.blocked_on = None;
        self.ready_queue_insert(pid);
    }

    /// Relinquish the CPU. The caller has already set `current`'s state to
    /// its outgoing value (READY, PENDING or ZOMBIE).
    ///
    /// Stack pages the user SP has retreated past are released before
    /// yielding. If nothing else is runnable and the outgoing state is
    /// READY, the task simply keeps the CPU.
    pub(crate) fn schedule(&mut self) {
        if self.halted {
            return;
        }
        let cur = self.current;

        if self.task(cur).state != TaskState::Zombie
            && self.task(cur).page_table.is_some()
            && self.uctx.sp >= VMEM_1_BASE
            && self.uctx.sp < VMEM_1_LIMIT
        {
            let sp_page = Region::User.page_index(self.uctx.sp);
            let stack_start = self.task(cur).stack_start;
            if sp_page > stack_start {
                self.task_vm_expand_stack(cur, stack_start as isize - sp_page as isize);
            }
        }

        let next = match self.ready_dequeue() {
            None => {
                self.task_mut(cur).state = TaskState::Running;
                return;
            }
            Some(n) => n,
        };
        if self.task(cur).state == TaskState::Ready {
            self.ready_enqueue(cur);
        }
        self.context_switch(next);
    }

    /// Round-robin tick: once the deadline passes, refresh it and rotate.
    /// A cooperative yield does not refresh the deadline.
    pub(crate) fn rr_schedule(&mut self) {
        if self.jiffies >= self.rr_deadline {
            self.rr_deadline = self.jiffies + self.config.time_slice;
            log::debug!("rr: preempting pid {:?}", self.current);
            self.task_mut(self.current).state = TaskState::Ready;
            self.schedule();
        }
    }

    // ---- terminal wait queues ----

    pub(crate) fn tty_read_enqueue(&mut self, pid: Pid, tty: usize) {
        self.task_mut(pid).blocked_on = Some(WaitChannel::TtyRead(tty));
        self.tty_read_queues[tty].push_back(pid);
    }

    pub(crate) fn tty_trans_enqueue(&mut self, pid: Pid, tty: usize) {
        self.task_mut(pid).blocked_on = Some(WaitChannel::TtyTrans(tty));
        self.tty_trans_queues[tty].push_back(pid);
    }

    /// Let the first queued reader retry for the terminal.
    pub(crate) fn tty_read_wake_up_one(&mut self, tty: usize) {
        if let Some(pid) = self.tty_read_queues[tty].pop_front() {
            self.task_wake_up_front(pid);
        }
    }

    /// Let the first queued writer retry for the terminal.
    pub(crate) fn tty_trans_wake_up_one(&mut self, tty: usize) {
        if let Some(pid) = self.tty_trans_queues[tty].pop_front() {
            self.task_wake_up_front(pid);
        }
    }

    /// Release any terminal `pid` holds as its active reader or writer
    /// and pass it to the first queued waiter — the same hand-off the
    /// completion paths perform. Exit runs this so a process dying
    /// mid-transfer cannot leave a terminal claimed forever.
    pub(crate) fn tty_release_ownership(&mut self, pid: Pid) {
        for tty in 0..self.tty_readers.len() {
            if self.tty_readers[tty] == Some(pid) {
                self.tty_readers[tty] = None;
                self.task_mut(pid).tty_buf = None;
                self.tty_read_wake_up_one(tty);
            }
        }
        for tty in 0..self.tty_writers.len() {
            if self.tty_writers[tty] == Some(pid) {
                self.tty_writers[tty] = None;
                self.tty_trans_wake_up_one(tty);
            }
        }
    }

    /// Splice a task out of whatever wait structure it sits on. Exit runs
    /// this before the task can be destroyed.
    pub(crate) fn remove_from_wait_channel(&mut self, pid: Pid) {
        let channel = match self.task_mut(pid).blocked_on.take() {
            None => return,
            Some(c) => c,
        };
        match channel {
            WaitChannel::Child => {}
            WaitChannel::Timer => self.timers.retain(|t| t.pid != pid),
            WaitChannel::TtyRead(tty) => self.tty_read_queues[tty].retain(|&p| p != pid),
            WaitChannel::TtyTrans(tty) => self.tty_trans_queues[tty].retain(|&p| p != pid),
            WaitChannel::PipeRead(id)
            | WaitChannel::PipeWrite(id)
            | WaitChannel::Lock(id)
            | WaitChannel::Cvar(id) => {
                if let Some(u) = self.utilities.get_mut(&id) {
                    u.remove_waiter(pid);
                }
            }
        }
    }
}
