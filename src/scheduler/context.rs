//! The kernel context-switch trampoline.
//!
//! The machine primitive is split in two: capture the outgoing kernel
//! context, run the switch callback, reinstall the context it returns.
//! The rest of the scheduler only ever calls `context_switch(next)`.

use crate::hardware::{
    KernelContext, Machine, Register, KERNEL_STACK_BASE, KERNEL_STACK_PAGES, MAX_PT_LEN,
};
use crate::kernel::{Kernel, Pid};
use crate::memory::{Region, TableId};
use crate::scheduler::task::TaskState;

impl<M: Machine> Kernel<M> {
    /// Switch execution from `current` to `next`: save the outgoing user
    /// context, run the kernel-context trampoline, then reload the
    /// incoming user context and install its region-1 table.
    pub(crate) fn context_switch(&mut self, next: Pid) {
        let cur = self.current;
        if self.task(cur).state != TaskState::Zombie {
            self.task_mut(cur).ucontext = self.uctx;
        }

        let kctx = self.machine.save_kernel_context();
        let next_kctx = self.switch_callback(kctx, cur, next);
        self.machine.restore_kernel_context(&next_kctx);

        let now = self.current;
        self.task_mut(now).state = TaskState::Running;
        self.uctx = self.task(now).ucontext;
        if now != Pid::IDLE {
            self.install_region1(now);
        }
    }

    /// The callback handed to the machine's context-switch primitive.
    ///
    /// Saves the outgoing kernel context (unless the task is a zombie on
    /// its way out), makes `next` current, realizes a first-run fork
    /// child's kernel stack by cloning the outgoing stack into fresh
    /// frames, swings the region-0 kernel-stack window onto `next`'s
    /// frames, and finally destroys the outgoing task if it was a zombie.
    fn switch_callback(&mut self, kctx: KernelContext, cur: Pid, next: Pid) -> KernelContext {
        log::debug!("context switch {:?} -> {:?}", cur, next);
        if self.task(cur).state != TaskState::Zombie {
            self.task_mut(cur).kcontext = kctx;
        }
        self.task_mut(next).state = TaskState::Running;
        self.current = next;

        if self.task(next).kernel_stack_frames.is_empty() {
            self.task_mut(next).kcontext = kctx;
            let kstack_page = Region::Kernel.page_index(KERNEL_STACK_BASE);
            match self.get_free_pages_and_copy(
                TableId::Kernel,
                self.kernel_brk,
                kstack_page,
                KERNEL_STACK_PAGES,
            ) {
                Ok(frames) => {
                    let t = self.task_mut(next);
                    for f in frames {
                        t.kernel_stack_frames.push(f);
                    }
                }
                Err(e) => log::error!("kernel stack clone for {:?} failed: {}", next, e),
            }
        }

        let frames: Vec<u32> = self.task(next).kernel_stack_frames.iter().copied().collect();
        let kstack_page = Region::Kernel.page_index(KERNEL_STACK_BASE);
        if let Err(e) = self.update_pages_indexes(TableId::Kernel, kstack_page, &frames) {
            log::error!("kernel stack window update failed: {}", e);
        }

        if self.task(cur).state == TaskState::Zombie {
            self.free_task(cur);
        }

        self.task(self.current).kcontext
    }

    /// Point the MMU at a process's region-1 table and flush that region.
    pub(crate) fn install_region1(&mut self, pid: Pid) {
        self.machine.write_register(Register::Ptbr1, pid.0);
        self.machine
            .write_register(Register::Ptlr1, MAX_PT_LEN as u64);
        self.flush_region(Region::User);
    }
}
