//! The trap vector and its handlers.
//!
//! Boot installs a vector of eight handlers; every hardware event enters
//! through [`Kernel::on_trap`], which dispatches the handler and then
//! drives the pending-operation resume loop: whenever a suspended process
//! becomes current, its recorded operation re-runs (re-checking its
//! predicate, Mesa style) before control returns to user code.

use crate::hardware::{
    Machine, MemoryFaultKind, Register, Trap, TRAP_VECTOR_SIZE, VMEM_1_BASE, VMEM_1_LIMIT,
};
use crate::kernel::Kernel;
use crate::memory::{Prot, Region};
use crate::syscalls::{EIO, ENOMEM, ERROR};

pub type TrapHandler<M> = fn(&mut Kernel<M>, Trap);

/// The handler table, indexed by `Trap::vector_index`.
pub fn build_vector<M: Machine>() -> [TrapHandler<M>; TRAP_VECTOR_SIZE] {
    [
        trap_kernel_handler,
        trap_clock_handler,
        trap_illegal_handler,
        trap_memory_handler,
        trap_math_handler,
        trap_tty_receive_handler,
        trap_tty_transmit_handler,
        trap_disk_handler,
    ]
}

impl<M: Machine> Kernel<M> {
    /// Deliver one trap to the kernel. This is the only entry point after
    /// boot.
    pub fn on_trap(&mut self, trap: Trap) {
        if self.halted {
            return;
        }
        let handler = self.trap_vector[trap.vector_index()];
        handler(self, trap);
        self.run_pending();
    }

    /// Resume suspended operations until the process about to return to
    /// user code has none. Each resume may block again and schedule a
    /// different process, so the loop follows `current`.
    fn run_pending(&mut self) {
        while !self.halted {
            let op = match self.tasks.get_mut(&self.current).and_then(|t| t.pending.take()) {
                None => return,
                Some(op) => op,
            };
            self.resume_op(op);
        }
    }
}

fn trap_kernel_handler<M: Machine>(kernel: &mut Kernel<M>, trap: Trap) {
    if let Trap::Kernel { code } = trap {
        kernel.syscall_dispatch(code);
    }
}

fn trap_clock_handler<M: Machine>(kernel: &mut Kernel<M>, _trap: Trap) {
    kernel.jiffies += 1;
    let now = kernel.jiffies;
    kernel.wake_up_timers(now);
    kernel.rr_schedule();
}

fn trap_illegal_handler<M: Machine>(kernel: &mut Kernel<M>, _trap: Trap) {
    log::error!("illegal instruction in pid {:?}", kernel.current_pid());
    kernel.sys_exit(ERROR);
}

/// Page-fault policy, in order: grow the stack by one page when the fault
/// is just below it; page a swapped process back in; give a COW sharer a
/// private writable copy; kill anything else (text writes, guard-page
/// touches, stray addresses).
fn trap_memory_handler<M: Machine>(kernel: &mut Kernel<M>, trap: Trap) {
    let (kind, addr, write) = match trap {
        Trap::Memory { kind, addr, write } => (kind, addr, write),
        _ => return,
    };
    let cur = kernel.current_pid();
    log::debug!("page fault: pid {:?} addr {:#x} {:?}", cur, addr, kind);

    if !(VMEM_1_BASE..VMEM_1_LIMIT).contains(&addr) {
        log::error!("fault outside region 1 in pid {:?}", cur);
        kernel.sys_exit(ERROR);
        return;
    }
    let page = Region::User.page_index(addr);
    let pte = match kernel.task_page_entry(cur, page) {
        Some(p) => p,
        None => {
            kernel.sys_exit(ERROR);
            return;
        }
    };

    match kind {
        MemoryFaultKind::Missing => {
            let stack_start = kernel.task_layout(cur).map(|l| l.4).unwrap_or(0);
            if !pte.swap() && page + 1 == stack_start {
                kernel.task_vm_expand_stack(cur, 1);
                return;
            }
            if pte.swap() {
                if let Err(e) = kernel.swap_in(cur) {
                    log::error!("swap-in for pid {:?} failed: {}", cur, e);
                    kernel.sys_exit(EIO);
                }
                return;
            }
            log::error!("segmentation violation: pid {:?} at {:#x}", cur, addr);
            kernel.sys_exit(ERROR);
        }
        MemoryFaultKind::Permission => {
            if kernel.cow_enabled() && pte.cow() && pte.prot() == Prot::READ {
                if kernel.task_cow_copy_page(cur, page).is_err() {
                    kernel.sys_exit(ENOMEM);
                }
                return;
            }
            if pte.prot() == (Prot::READ | Prot::EXEC) && write {
                log::error!("write to text page in pid {:?}", cur);
                kernel.sys_exit(ERROR);
                return;
            }
            log::error!("protection violation: pid {:?} at {:#x}", cur, addr);
            kernel.sys_exit(ERROR);
        }
    }
}

fn trap_math_handler<M: Machine>(kernel: &mut Kernel<M>, _trap: Trap) {
    log::error!("arithmetic trap in pid {:?}", kernel.current_pid());
    kernel.sys_exit(ERROR);
}

/// Input arrived: collect it straight into the active reader's staging
/// buffer and wake the reader.
fn trap_tty_receive_handler<M: Machine>(kernel: &mut Kernel<M>, trap: Trap) {
    let tty = match trap {
        Trap::TtyReceive { tty } => tty,
        _ => return,
    };
    let reader = match kernel.tty_readers.get(tty).copied().flatten() {
        Some(r) => r,
        None => {
            log::debug!("tty {} input with no reader; dropped", tty);
            return;
        }
    };
    let mut staged = kernel.task_mut(reader).tty_buf.take().unwrap_or_default();
    let n = kernel.machine.tty_receive(tty, &mut staged);
    {
        let t = kernel.task_mut(reader);
        t.tty_buf = Some(staged);
        t.tty_len = n;
    }
    kernel.task_wake_up(reader);
}

/// A transmit finished: wake the writer so it can commit its next chunk
/// or complete.
fn trap_tty_transmit_handler<M: Machine>(kernel: &mut Kernel<M>, trap: Trap) {
    let tty = match trap {
        Trap::TtyTransmit { tty } => tty,
        _ => return,
    };
    if let Some(writer) = kernel.tty_writers.get(tty).copied().flatten() {
        kernel.task_wake_up(writer);
    }
}

fn trap_disk_handler<M: Machine>(kernel: &mut Kernel<M>, _trap: Trap) {
    log::error!("disk trap in pid {:?}", kernel.current_pid());
    kernel.sys_exit(ERROR);
}

impl<M: Machine> Kernel<M> {
    pub(crate) fn cow_enabled(&self) -> bool {
        self.config.cow
    }

    /// One region-1 entry of a task, if it has a table.
    pub(crate) fn task_page_entry(
        &self,
        pid: crate::kernel::Pid,
        page: usize,
    ) -> Option<crate::memory::pte::Pte> {
        self.tasks
            .get(&pid)
            .and_then(|t| t.page_table.as_ref())
            .map(|t| t.entry(page))
    }

    /// Install the trap vector, as boot does through `REG_VECTOR_BASE`.
    pub(crate) fn install_trap_vector(&mut self) {
        self.trap_vector = build_vector();
        self.machine.write_register(Register::VectorBase, 1);
    }
}
