//! Sleep timers: a single list kept sorted by absolute expiry tick.

use crate::hardware::Machine;
use crate::kernel::{Kernel, Pid, WaitChannel};

/// One sleeping process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    /// Absolute tick at which the sleeper wakes.
    pub timeout: u64,
    pub pid: Pid,
}

impl<M: Machine> Kernel<M> {
    /// Park `pid` until the clock reaches `timeout`, keeping the list
    /// sorted so expiry scans stop at the first live timer.
    pub(crate) fn add_timer(&mut self, timeout: u64, pid: Pid) {
        let pos = self
            .timers
            .iter()
            .position(|t| timeout < t.timeout)
            .unwrap_or(self.timers.len());
        self.timers.insert(pos, Timer { timeout, pid });
        self.task_mut(pid).blocked_on = Some(WaitChannel::Timer);
    }

    /// Wake every sleeper whose expiry is at or before `now`, in expiry
    /// order.
    pub(crate) fn wake_up_timers(&mut self, now: u64) {
        while let Some(first) = self.timers.first() {
            if first.timeout > now {
                break;
            }
            let timer = self.timers.remove(0);
            log::debug!("timer: waking pid {:?} at tick {}", timer.pid, now);
            self.task_wake_up(timer.pid);
        }
    }
}
