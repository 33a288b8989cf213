//! The system-call surface: process lifecycle, memory growth, timed
//! sleep, terminal and pipe I/O, locks, condition variables and
//! reclamation.
//!
//! Arguments arrive in `regs[0..n]` of the trapped context; every call
//! leaves a single integer result in `regs[0]`. Calls that must suspend
//! record a `PendingOp` and are resumed — with a fresh predicate check —
//! each time their process is scheduled back in.

use crate::hardware::{Machine, TERMINAL_MAX_LINE, VMEM_1_BASE, VMEM_1_LIMIT};
use crate::ipc::{Cvar, Lock, Pipe, UtilityId, UtilityKind, UtilityType};
use crate::kernel::{Kernel, PendingOp, Pid, TtyPhase, WaitChannel};
use crate::loader::LoadOutcome;
use crate::memory::{up_to_page, vm, Prot, Region, TableId};
use crate::scheduler::task::{TaskState, ZombieRecord};

// System-call numbers.
pub const SYS_FORK: u64 = 1;
pub const SYS_EXEC: u64 = 2;
pub const SYS_EXIT: u64 = 3;
pub const SYS_WAIT: u64 = 4;
pub const SYS_GETPID: u64 = 5;
pub const SYS_BRK: u64 = 6;
pub const SYS_DELAY: u64 = 7;
pub const SYS_TTY_READ: u64 = 8;
pub const SYS_TTY_WRITE: u64 = 9;
pub const SYS_PIPE_INIT: u64 = 10;
pub const SYS_PIPE_READ: u64 = 11;
pub const SYS_PIPE_WRITE: u64 = 12;
pub const SYS_LOCK_INIT: u64 = 13;
pub const SYS_LOCK_ACQUIRE: u64 = 14;
pub const SYS_LOCK_RELEASE: u64 = 15;
pub const SYS_CVAR_INIT: u64 = 16;
pub const SYS_CVAR_WAIT: u64 = 17;
pub const SYS_CVAR_SIGNAL: u64 = 18;
pub const SYS_CVAR_BROADCAST: u64 = 19;
pub const SYS_RECLAIM: u64 = 20;
/// `fork_share`: fork with shared text, data and heap.
pub const SYS_CUSTOM_0: u64 = 21;

// Result codes handed back in `regs[0]`.
pub const ERROR: i64 = -1;
pub const ENOMEM: i64 = -2;
pub const EIO: i64 = -3;

const MAX_ARGS: usize = 32;
const MAX_ARG_LEN: usize = 256;

fn from_user_space(addr: u64) -> bool {
    (VMEM_1_BASE..VMEM_1_LIMIT).contains(&addr)
}

impl<M: Machine> Kernel<M> {
    /// Demultiplex a kernel trap. Pointer arguments that do not point
    /// into region 1 kill the caller outright.
    pub(crate) fn syscall_dispatch(&mut self, code: u64) {
        let args = self.uctx.regs;
        log::debug!(
            "syscall {} from pid {:?} ({:#x}, {:#x}, {:#x})",
            code,
            self.current,
            args[0],
            args[1],
            args[2]
        );

        // Which argument slots must be user-space pointers.
        let pointer_args: &[usize] = match code {
            SYS_WAIT | SYS_PIPE_INIT | SYS_LOCK_INIT | SYS_CVAR_INIT => &[0],
            SYS_TTY_READ | SYS_TTY_WRITE | SYS_PIPE_READ | SYS_PIPE_WRITE => &[1],
            SYS_EXEC => &[0, 1],
            _ => &[],
        };
        for &i in pointer_args {
            if !from_user_space(args[i]) {
                log::error!("pid {:?} passed kernel pointer {:#x}", self.current, args[i]);
                self.sys_exit(ERROR);
                return;
            }
        }

        match code {
            SYS_FORK => self.sys_fork(),
            SYS_EXEC => self.sys_exec(args[0], args[1]),
            SYS_EXIT => self.sys_exit(args[0] as i64),
            SYS_WAIT => self.sys_wait(args[0]),
            SYS_GETPID => self.set_ret(self.current.0 as i64),
            SYS_BRK => self.sys_brk(args[0]),
            SYS_DELAY => self.sys_delay(args[0] as i64),
            SYS_TTY_READ => self.sys_tty_read(args[0] as usize, args[1], args[2] as usize),
            SYS_TTY_WRITE => self.sys_tty_write(args[0] as usize, args[1], args[2] as usize),
            SYS_PIPE_INIT => self.sys_utility_init(args[0], UtilityType::Pipe),
            SYS_PIPE_READ => self.sys_pipe_read(args[0] as usize, args[1], args[2] as usize),
            SYS_PIPE_WRITE => self.sys_pipe_write(args[0] as usize, args[1], args[2] as usize),
            SYS_LOCK_INIT => self.sys_utility_init(args[0], UtilityType::Lock),
            SYS_LOCK_ACQUIRE => self.sys_lock_acquire(args[0] as usize),
            SYS_LOCK_RELEASE => self.sys_lock_release(args[0] as usize),
            SYS_CVAR_INIT => self.sys_utility_init(args[0], UtilityType::Cvar),
            SYS_CVAR_WAIT => self.sys_cvar_wait(args[0] as usize, args[1] as usize),
            SYS_CVAR_SIGNAL => self.sys_cvar_signal(args[0] as usize),
            SYS_CVAR_BROADCAST => self.sys_cvar_broadcast(args[0] as usize),
            SYS_RECLAIM => self.sys_reclaim(args[0] as usize),
            SYS_CUSTOM_0 => self.sys_fork_share(),
            _ => {
                log::error!("unknown syscall {}", code);
                self.set_ret(ERROR);
            }
        }
    }

    /// Re-enter a suspended operation after its process was scheduled
    /// back in.
    pub(crate) fn resume_op(&mut self, op: PendingOp) {
        match op {
            PendingOp::Wait { status_ptr } => self.finish_wait(status_ptr),
            PendingOp::Delay => self.set_ret(0),
            PendingOp::TtyRead { tty, buf, len, phase: TtyPhase::Queued } => {
                self.tty_read_attempt(tty, buf, len)
            }
            PendingOp::TtyRead { tty, buf, phase: TtyPhase::Active, .. } => {
                self.tty_read_finish(tty, buf)
            }
            PendingOp::TtyWrite { tty, buf, len, phase: TtyPhase::Queued, .. } => {
                self.tty_write_attempt(tty, buf, len, 0)
            }
            PendingOp::TtyWrite { tty, buf, len, written, phase: TtyPhase::Active } => {
                if written < len {
                    self.tty_write_attempt(tty, buf, len, written)
                } else {
                    self.tty_write_finish(tty, len)
                }
            }
            PendingOp::PipeRead { id, buf, len } => {
                if self.utility_is(id, UtilityType::Pipe) {
                    self.pipe_do_read(id, buf, len);
                } else {
                    self.set_ret(ERROR);
                }
            }
            PendingOp::PipeWrite { id, buf, len, written } => {
                if self.utility_is(id, UtilityType::Pipe) {
                    self.pipe_do_write(id, buf, len, written);
                } else {
                    self.set_ret(ERROR);
                }
            }
            PendingOp::LockAcquire { id } => {
                if self.utility_is(id, UtilityType::Lock) {
                    self.lock_do_acquire(id);
                } else {
                    self.set_ret(ERROR);
                }
            }
            PendingOp::CvarWait { cvar, lock, phase: _ } => {
                if self.utility_is(lock, UtilityType::Lock) {
                    self.cvar_finish_wait(cvar, lock);
                } else {
                    self.set_ret(ERROR);
                }
            }
        }
    }

    fn utility_is(&self, id: UtilityId, utype: UtilityType) -> bool {
        self.utilities.get(&id).map(|u| u.utype()) == Some(utype)
    }

    // ---- process lifecycle ----

    pub(crate) fn sys_fork(&mut self) {
        let parent = self.current;
        log::debug!("fork: parent {:?}", parent);

        let child = self.spawn_child(parent);
        if let Err(e) = self.task_vm_copy(child, parent) {
            log::error!("fork: address-space copy failed: {}", e);
            self.fork_cleanup(child, parent);
            self.set_ret(ENOMEM);
            return;
        }
        self.task_utilities_copy(child, parent);

        {
            let uctx = self.uctx;
            let c = self.task_mut(child);
            c.ucontext = uctx;
            c.ucontext.regs[0] = 0;
            c.state = TaskState::Ready;
        }
        self.set_ret(child.0 as i64);
        self.ready_queue_insert(child);
        self.task_mut(parent).state = TaskState::Ready;
        self.schedule();
    }

    /// `fork_share`: like fork, but text+data+heap frames are shared with
    /// the parent and only the stack is copied. Needs the COW machinery.
    pub(crate) fn sys_fork_share(&mut self) {
        if !self.config.cow {
            self.set_ret(ERROR);
            return;
        }
        let parent = self.current;
        log::debug!("fork_share: parent {:?}", parent);

        let child = self.spawn_child(parent);
        if let Err(e) = self.task_vm_share_copy(child, parent) {
            log::error!("fork_share: address-space copy failed: {}", e);
            self.fork_cleanup(child, parent);
            self.set_ret(ENOMEM);
            return;
        }
        self.task_utilities_copy(child, parent);

        {
            let uctx = self.uctx;
            let c = self.task_mut(child);
            c.ucontext = uctx;
            c.ucontext.regs[0] = 0;
            c.state = TaskState::Ready;
        }
        self.set_ret(child.0 as i64);
        self.ready_queue_insert(child);
        self.task_mut(parent).state = TaskState::Ready;
        self.schedule();
    }

    /// Undo a half-built child after a failed address-space copy.
    fn fork_cleanup(&mut self, child: Pid, parent: Pid) {
        let mut freed: Vec<u32> = Vec::new();
        if let Some(table) = self.task_mut(child).page_table.take() {
            for pte in table.iter() {
                if pte.valid() && !pte.cow() {
                    freed.push(pte.pfn());
                }
            }
        }
        self.frames.bulk_release(&freed);
        self.cow_leave(child);
        self.task_mut(parent).children.retain(|&c| c != child);
        self.tasks.remove(&child);
    }

    pub(crate) fn sys_exec(&mut self, filename_ptr: u64, argv_ptr: u64) {
        let cur = self.current;
        let parsed = self.read_exec_args(filename_ptr, argv_ptr);
        let (filename, args) = match parsed {
            Ok(v) => v,
            Err(_) => {
                self.set_ret(ERROR);
                return;
            }
        };
        log::debug!("exec: pid {:?} -> '{}'", cur, filename);

        match self.sys_load(&filename, &args, cur) {
            LoadOutcome::Loaded => {
                self.task_mut(cur).state = TaskState::Running;
                self.uctx = self.task(cur).ucontext;
            }
            LoadOutcome::Rejected(e) => {
                log::error!("exec: '{}' rejected: {}", filename, e);
                self.set_ret(ERROR);
            }
            LoadOutcome::Fatal(e) => {
                log::error!("exec: '{}' failed after commit: {}", filename, e);
                self.sys_exit(ERROR);
            }
        }
    }

    fn read_exec_args(&self, filename_ptr: u64, argv_ptr: u64) -> crate::Result<(String, Vec<String>)> {
        let table = self
            .task(self.current)
            .page_table
            .as_ref()
            .ok_or(crate::KernelError::Fault)?;
        let filename = vm::read_cstr(&self.machine, table, filename_ptr, MAX_ARG_LEN)?;
        let mut args = Vec::new();
        for i in 0..MAX_ARGS {
            let p = vm::read_u64(&self.machine, table, argv_ptr + 8 * i as u64)?;
            if p == 0 {
                return Ok((filename, args));
            }
            if !from_user_space(p) {
                return Err(crate::KernelError::BadArgument);
            }
            args.push(vm::read_cstr(&self.machine, table, p, MAX_ARG_LEN)?);
        }
        Err(crate::KernelError::BadArgument)
    }

    pub(crate) fn sys_exit(&mut self, exit_code: i64) {
        let cur = self.current;
        log::debug!("exit: pid {:?} code {}", cur, exit_code);

        if cur == Pid::INIT {
            log::info!("init exited; halting the machine");
            self.machine.halt();
            self.halted = true;
            return;
        }

        self.task_mut(cur).exit_code = exit_code;
        self.task_rescue_children(cur);
        let parent = self.task(cur).parent;
        if let Some(p) = self.tasks.get_mut(&parent) {
            p.children.retain(|&c| c != cur);
        }
        self.remove_from_wait_channel(cur);
        self.tty_release_ownership(cur);
        // A wait parked on a condition variable still owns the extra lock
        // reference cvar_do_wait took; put it back before the operation is
        // discarded, or the lock's refcount stays inflated forever.
        if let Some(PendingOp::CvarWait { lock, .. }) = self.task(cur).pending {
            let _ = self.utility_put(lock);
        }
        self.task_mut(cur).pending = None;

        let mut wake_parent = false;
        if let Some(p) = self.tasks.get_mut(&parent) {
            p.zombies.push_back(ZombieRecord { pid: cur, exit_code });
            if p.wait_child_flag {
                p.wait_child_flag = false;
                wake_parent = true;
            }
        }
        if wake_parent {
            self.task_wake_up(parent);
        }

        self.task_mut(cur).state = TaskState::Zombie;
        self.schedule();
    }

    pub(crate) fn sys_wait(&mut self, status_ptr: u64) {
        let t = self.task(self.current);
        if t.children.is_empty() && t.zombies.is_empty() {
            log::error!("wait: pid {:?} has no children", self.current);
            self.set_ret(ERROR);
            return;
        }
        self.finish_wait(status_ptr);
    }

    /// Reap one zombie, or go (back) to sleep until a child exits.
    fn finish_wait(&mut self, status_ptr: u64) {
        let cur = self.current;
        match self.task_mut(cur).zombies.pop_front() {
            Some(z) => {
                let ok = {
                    let table = self.tasks[&cur].page_table.as_ref().expect("waiter has a table");
                    vm::write_u64(&mut self.machine, table, status_ptr, z.exit_code as u64).is_ok()
                };
                if !ok {
                    self.set_ret(ERROR);
                    return;
                }
                self.set_ret(z.pid.0 as i64);
            }
            None => {
                let t = self.task_mut(cur);
                t.wait_child_flag = true;
                t.state = TaskState::Pending;
                t.pending = Some(PendingOp::Wait { status_ptr });
                t.blocked_on = Some(WaitChannel::Child);
                self.schedule();
            }
        }
    }

    // ---- memory ----

    pub(crate) fn sys_brk(&mut self, new_brk: u64) {
        let cur = self.current;
        if !from_user_space(new_brk) {
            self.set_ret(ERROR);
            return;
        }
        let new_brk = up_to_page(new_brk);
        let (brk, stack_start) = {
            let t = self.task(cur);
            (t.brk, t.stack_start)
        };

        if new_brk > brk {
            if Region::User.page_index(new_brk) >= stack_start {
                log::error!("brk: pid {:?} would run into the stack", cur);
                self.set_ret(ERROR);
                return;
            }
            let start = Region::User.page_index(brk);
            let n = crate::memory::page_count(new_brk - brk);
            if let Err(e) = self.map_pages(TableId::Task(cur), start, n, Prot::READ | Prot::WRITE) {
                self.set_ret(e.code());
                return;
            }
            self.task_mut(cur).brk = new_brk;
        } else if brk > new_brk {
            let start = Region::User.page_index(new_brk);
            let n = crate::memory::page_count(brk - new_brk);
            self.unmap_pages(TableId::Task(cur), start, n);
            self.task_mut(cur).brk = new_brk;
        }
        self.set_ret(0);
    }

    // ---- clock ----

    pub(crate) fn sys_delay(&mut self, ticks: i64) {
        let cur = self.current;
        if ticks < 0 {
            self.set_ret(ERROR);
            return;
        }
        if ticks == 0 {
            self.set_ret(0);
            return;
        }
        let deadline = self.jiffies + ticks as u64;
        self.add_timer(deadline, cur);
        let t = self.task_mut(cur);
        t.state = TaskState::Pending;
        t.pending = Some(PendingOp::Delay);
        self.schedule();
    }

    // ---- terminals ----

    pub(crate) fn sys_tty_read(&mut self, tty: usize, buf: u64, len: usize) {
        if tty >= self.machine.tty_count() || len == 0 {
            self.set_ret(ERROR);
            return;
        }
        let len = len.min(TERMINAL_MAX_LINE);
        self.tty_read_attempt(tty, buf, len);
    }

    /// Become the terminal's single reader, or queue behind the one that
    /// already is.
    fn tty_read_attempt(&mut self, tty: usize, buf: u64, len: usize) {
        let cur = self.current;
        if self.tty_readers[tty].is_some() {
            let t = self.task_mut(cur);
            t.state = TaskState::Pending;
            t.pending = Some(PendingOp::TtyRead { tty, buf, len, phase: TtyPhase::Queued });
            self.tty_read_enqueue(cur, tty);
            self.schedule();
            return;
        }

        self.tty_readers[tty] = Some(cur);
        let t = self.task_mut(cur);
        t.tty_buf = Some(vec![0u8; len]);
        t.tty_len = 0;
        t.state = TaskState::Pending;
        t.pending = Some(PendingOp::TtyRead { tty, buf, len, phase: TtyPhase::Active });
        self.schedule();
    }

    /// The receive interrupt filled our staging buffer; hand the bytes to
    /// user space and pass the terminal on.
    fn tty_read_finish(&mut self, tty: usize, buf: u64) {
        let cur = self.current;
        let (staged, n) = {
            let t = self.task_mut(cur);
            (t.tty_buf.take().unwrap_or_default(), t.tty_len)
        };
        let ok = {
            let table = self.tasks[&cur].page_table.as_ref().expect("reader has a table");
            vm::write_bytes(&mut self.machine, table, buf, &staged[..n]).is_ok()
        };
        self.tty_readers[tty] = None;
        self.tty_read_wake_up_one(tty);
        if !ok {
            log::error!("tty read: user buffer fault");
            self.set_ret(ERROR);
            return;
        }
        self.set_ret(n as i64);
    }

    pub(crate) fn sys_tty_write(&mut self, tty: usize, buf: u64, len: usize) {
        if tty >= self.machine.tty_count() || len == 0 {
            self.set_ret(ERROR);
            return;
        }
        self.tty_write_attempt(tty, buf, len, 0);
    }

    /// Commit the next `TERMINAL_MAX_LINE`-sized chunk of a write, first
    /// claiming the terminal if someone else holds it.
    fn tty_write_attempt(&mut self, tty: usize, buf: u64, len: usize, written: usize) {
        let cur = self.current;
        match self.tty_writers[tty] {
            Some(owner) if owner != cur => {
                let t = self.task_mut(cur);
                t.state = TaskState::Pending;
                t.pending = Some(PendingOp::TtyWrite {
                    tty,
                    buf,
                    len,
                    written: 0,
                    phase: TtyPhase::Queued,
                });
                self.tty_trans_enqueue(cur, tty);
                self.schedule();
                return;
            }
            _ => {}
        }

        self.tty_writers[tty] = Some(cur);
        let chunk = (len - written).min(TERMINAL_MAX_LINE);
        let mut data = vec![0u8; chunk];
        let ok = {
            let table = self.tasks[&cur].page_table.as_ref().expect("writer has a table");
            vm::read_bytes(&self.machine, table, buf + written as u64, &mut data).is_ok()
        };
        if !ok {
            log::error!("tty write: user buffer fault");
            self.tty_writers[tty] = None;
            self.tty_trans_wake_up_one(tty);
            self.set_ret(ERROR);
            return;
        }

        self.machine.tty_transmit(tty, &data);
        let t = self.task_mut(cur);
        t.state = TaskState::Pending;
        t.pending = Some(PendingOp::TtyWrite {
            tty,
            buf,
            len,
            written: written + chunk,
            phase: TtyPhase::Active,
        });
        self.schedule();
    }

    fn tty_write_finish(&mut self, tty: usize, len: usize) {
        self.tty_writers[tty] = None;
        self.tty_trans_wake_up_one(tty);
        self.set_ret(len as i64);
    }

    // ---- utilities ----

    /// Shared create path for pipes, locks and cvars: claim a handle
    /// slot, build the object, store the slot number at `id_ptr`.
    fn sys_utility_init(&mut self, id_ptr: u64, utype: UtilityType) {
        let cur = self.current;
        let slot = match self.task(cur).new_utility_slot() {
            Ok(s) => s,
            Err(_) => {
                log::error!("pid {:?} exhausted its handle table", cur);
                self.set_ret(ERROR);
                return;
            }
        };
        let kind = match utype {
            UtilityType::Pipe => UtilityKind::Pipe(Pipe::new()),
            UtilityType::Lock => UtilityKind::Lock(Lock::new()),
            UtilityType::Cvar => UtilityKind::Cvar(Cvar::new()),
        };
        let id = self.utility_alloc(slot, kind);

        let ok = {
            let table = self.tasks[&cur].page_table.as_ref().expect("caller has a table");
            vm::write_u64(&mut self.machine, table, id_ptr, slot as u64).is_ok()
        };
        if !ok {
            let _ = self.utility_put(id);
            self.set_ret(ERROR);
            return;
        }
        self.task_mut(cur).utilities[slot] = Some(id);
        self.set_ret(0);
    }

    pub(crate) fn sys_pipe_read(&mut self, slot: usize, buf: u64, len: usize) {
        let id = match self.current_utility(slot, UtilityType::Pipe) {
            Ok(id) => id,
            Err(e) => {
                self.set_ret(e.code());
                return;
            }
        };
        if len == 0 {
            self.set_ret(ERROR);
            return;
        }
        self.pipe_do_read(id, buf, len);
    }

    pub(crate) fn sys_pipe_write(&mut self, slot: usize, buf: u64, len: usize) {
        let id = match self.current_utility(slot, UtilityType::Pipe) {
            Ok(id) => id,
            Err(e) => {
                self.set_ret(e.code());
                return;
            }
        };
        if len == 0 {
            self.set_ret(ERROR);
            return;
        }
        self.pipe_do_write(id, buf, len, 0);
    }

    pub(crate) fn sys_lock_acquire(&mut self, slot: usize) {
        match self.current_utility(slot, UtilityType::Lock) {
            Ok(id) => self.lock_do_acquire(id),
            Err(e) => self.set_ret(e.code()),
        }
    }

    pub(crate) fn sys_lock_release(&mut self, slot: usize) {
        match self.current_utility(slot, UtilityType::Lock) {
            Ok(id) => match self.lock_do_release(id) {
                Ok(()) => self.set_ret(0),
                Err(e) => self.set_ret(e.code()),
            },
            Err(e) => self.set_ret(e.code()),
        }
    }

    pub(crate) fn sys_cvar_wait(&mut self, cvar_slot: usize, lock_slot: usize) {
        let cvar = match self.current_utility(cvar_slot, UtilityType::Cvar) {
            Ok(id) => id,
            Err(e) => {
                self.set_ret(e.code());
                return;
            }
        };
        let lock = match self.current_utility(lock_slot, UtilityType::Lock) {
            Ok(id) => id,
            Err(e) => {
                self.set_ret(e.code());
                return;
            }
        };
        self.cvar_do_wait(cvar, lock);
    }

    pub(crate) fn sys_cvar_signal(&mut self, slot: usize) {
        match self.current_utility(slot, UtilityType::Cvar) {
            Ok(id) => self.cvar_do_signal(id),
            Err(e) => self.set_ret(e.code()),
        }
    }

    pub(crate) fn sys_cvar_broadcast(&mut self, slot: usize) {
        match self.current_utility(slot, UtilityType::Cvar) {
            Ok(id) => self.cvar_do_broadcast(id),
            Err(e) => self.set_ret(e.code()),
        }
    }

    /// Drop the current process's reference behind a handle. The slot is
    /// cleared only when the put succeeds, so a refused free (a held
    /// lock) keeps the refcount law intact.
    pub(crate) fn sys_reclaim(&mut self, slot: usize) {
        let cur = self.current;
        let id = match self.task(cur).get_utility(slot) {
            Some(id) => id,
            None => {
                self.set_ret(ERROR);
                return;
            }
        };
        match self.utility_put(id) {
            Ok(()) => {
                self.task_mut(cur).utilities[slot] = None;
                self.set_ret(0);
            }
            Err(e) => self.set_ret(e.code()),
        }
    }
}
