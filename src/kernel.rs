//! The kernel's single state value.
//!
//! `current`, the clock, the frame free list, the PCB table, queues, TTY
//! ownership and the utility arena all live here and are threaded
//! explicitly through every subsystem, so each component runs
//! deterministically under test. Interrupt handlers never re-enter, so no
//! locking is needed.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;

use crate::hardware::{Machine, UserContext, TRAP_VECTOR_SIZE};
use crate::interrupts::TrapHandler;
use crate::ipc::{Utility, UtilityId};
use crate::memory::frame_allocator::FrameAllocator;
use crate::memory::{PageTable, Region};
use crate::scheduler::task::{Task, TaskState};
use crate::timer::Timer;
use crate::{KernelError, Result};

/// Process identifier. 0 is idle, 1 is init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u64);

impl Pid {
    pub const IDLE: Pid = Pid(0);
    pub const INIT: Pid = Pid(1);
}

/// Boot-time configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Round-robin slice in clock ticks.
    pub time_slice: u64,
    /// Copy-on-write fork. The `cow` cargo feature sets the default.
    pub cow: bool,
    /// Directory holding per-pid swap files.
    pub swap_dir: PathBuf,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            time_slice: 1,
            cow: cfg!(feature = "cow"),
            swap_dir: PathBuf::from("_SWAP"),
        }
    }
}

/// The wait structure a pending process sits on, recorded in its PCB so
/// exit can splice it out in O(1) without scanning every queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitChannel {
    /// Blocked in wait() until a child exits; no queue membership.
    Child,
    /// Sleeping on the sorted timer list.
    Timer,
    /// Queued behind the active reader of a terminal.
    TtyRead(usize),
    /// Queued behind the active writer of a terminal.
    TtyTrans(usize),
    PipeRead(UtilityId),
    PipeWrite(UtilityId),
    Lock(UtilityId),
    Cvar(UtilityId),
}

/// Progress of a terminal operation that had to suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtyPhase {
    /// Waiting to become the terminal's single reader/writer.
    Queued,
    /// Owning the terminal, waiting for the hardware interrupt.
    Active,
}

/// Progress of a condition-variable wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvarPhase {
    /// On the cvar's wait queue.
    Waiting,
    /// Signalled; re-acquiring the lock (may queue on it).
    Reacquire,
}

/// A suspended kernel operation.
///
/// Handlers run to completion, so a blocking point records what it was
/// doing here, schedules away, and is resumed (with a Mesa-style re-check)
/// when its process becomes current again. Return values are written into
/// the process's saved `regs[0]` — never smuggled through `exit_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    Wait { status_ptr: u64 },
    Delay,
    TtyRead { tty: usize, buf: u64, len: usize, phase: TtyPhase },
    TtyWrite { tty: usize, buf: u64, len: usize, written: usize, phase: TtyPhase },
    PipeRead { id: UtilityId, buf: u64, len: usize },
    PipeWrite { id: UtilityId, buf: u64, len: usize, written: usize },
    LockAcquire { id: UtilityId },
    CvarWait { cvar: UtilityId, lock: UtilityId, phase: CvarPhase },
}

/// The whole kernel.
pub struct Kernel<M: Machine> {
    pub(crate) machine: M,
    pub(crate) config: KernelConfig,

    pub(crate) frames: FrameAllocator,
    pub(crate) region0: PageTable,
    pub(crate) kernel_brk: u64,
    pub(crate) vm_enabled: bool,
    pub(crate) total_pages: u32,

    pub(crate) tasks: BTreeMap<Pid, Task>,
    pub(crate) current: Pid,
    pub(crate) next_pid: u64,

    pub(crate) ready: VecDeque<Pid>,
    pub(crate) tty_read_queues: Vec<VecDeque<Pid>>,
    pub(crate) tty_trans_queues: Vec<VecDeque<Pid>>,
    pub(crate) tty_readers: Vec<Option<Pid>>,
    pub(crate) tty_writers: Vec<Option<Pid>>,

    pub(crate) utilities: BTreeMap<UtilityId, Utility>,
    pub(crate) next_utility: u64,

    /// Copy-on-write peer groups: group id -> member pids.
    pub(crate) cow_groups: BTreeMap<u64, Vec<Pid>>,
    pub(crate) next_cow_group: u64,

    pub(crate) timers: Vec<Timer>,
    pub(crate) jiffies: u64,
    pub(crate) rr_deadline: u64,

    /// The live exception frame of the trapped process. `schedule` saves
    /// it into the outgoing PCB and reloads it from the incoming one.
    pub(crate) uctx: UserContext,

    pub(crate) trap_vector: [TrapHandler<M>; TRAP_VECTOR_SIZE],
    pub(crate) halted: bool,
}

impl<M: Machine> Kernel<M> {
    pub(crate) fn new(machine: M, config: KernelConfig) -> Self {
        let ttys = machine.tty_count();
        let total_pages = machine.memory_pages();
        Kernel {
            machine,
            config,
            frames: FrameAllocator::new(),
            region0: PageTable::new(Region::Kernel),
            kernel_brk: 0,
            vm_enabled: false,
            total_pages,
            tasks: BTreeMap::new(),
            current: Pid::IDLE,
            next_pid: 2,
            ready: VecDeque::new(),
            tty_read_queues: (0..ttys).map(|_| VecDeque::new()).collect(),
            tty_trans_queues: (0..ttys).map(|_| VecDeque::new()).collect(),
            tty_readers: vec![None; ttys],
            tty_writers: vec![None; ttys],
            utilities: BTreeMap::new(),
            next_utility: 0,
            cow_groups: BTreeMap::new(),
            next_cow_group: 0,
            timers: Vec::new(),
            jiffies: 0,
            rr_deadline: 0,
            uctx: UserContext::default(),
            trap_vector: crate::interrupts::build_vector(),
            halted: false,
        }
    }

    /// Take a free frame, falling back to the swap engine once when the
    /// list is dry.
    pub(crate) fn alloc_frame(&mut self) -> Result<u32> {
        if let Some(f) = self.frames.pop() {
            return Ok(f);
        }
        if let Err(e) = self.swap_out() {
            log::error!("swap_out failed while out of frames: {}", e);
        }
        self.frames.pop().ok_or(KernelError::OutOfMemory)
    }

    /// Store a system-call return value in the live exception frame.
    pub(crate) fn set_ret(&mut self, value: i64) {
        self.uctx.regs[0] = value as u64;
    }

    pub(crate) fn task(&self, pid: Pid) -> &Task {
        self.tasks.get(&pid).expect("pid names a live task")
    }

    pub(crate) fn task_mut(&mut self, pid: Pid) -> &mut Task {
        self.tasks.get_mut(&pid).expect("pid names a live task")
    }

    // ---- introspection (tests, demo binary) ----

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    pub fn current_pid(&self) -> Pid {
        self.current
    }

    pub fn jiffies(&self) -> u64 {
        self.jiffies
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn free_frames(&self) -> usize {
        self.frames.free_count()
    }

    pub fn task_state(&self, pid: Pid) -> Option<TaskState> {
        self.tasks.get(&pid).map(|t| t.state)
    }

    pub fn task_exists(&self, pid: Pid) -> bool {
        self.tasks.contains_key(&pid)
    }

    /// The live user context (the exception frame of `current`).
    pub fn user_context(&self) -> &UserContext {
        &self.uctx
    }

    /// Set system-call arguments in the live exception frame before
    /// delivering a kernel trap.
    pub fn set_syscall_args(&mut self, args: &[u64]) {
        for (i, a) in args.iter().enumerate() {
            self.uctx.regs[i] = *a;
        }
    }

    /// A process's most recent system-call return value: live for
    /// `current`, otherwise from its saved context.
    pub fn saved_ret(&self, pid: Pid) -> i64 {
        if pid == self.current {
            self.uctx.regs[0] as i64
        } else {
            self.tasks
                .get(&pid)
                .map(|t| t.ucontext.regs[0] as i64)
                .unwrap_or(crate::syscalls::ERROR)
        }
    }

    /// Region-1 segment layout of a process:
    /// `(code_start, code_pgn, data_start, brk, stack_start, stack_pgn)`.
    pub fn task_layout(&self, pid: Pid) -> Option<(usize, usize, usize, u64, usize, usize)> {
        self.tasks.get(&pid).map(|t| {
            (t.code_start, t.code_pgn, t.data_start, t.brk, t.stack_start, t.stack_pgn)
        })
    }

    /// Refcount of the utility behind a handle slot.
    pub fn handle_refcount(&self, pid: Pid, slot: usize) -> Option<u32> {
        let id = self.tasks.get(&pid)?.utilities.get(slot).copied().flatten()?;
        self.utilities.get(&id).map(|u| u.refcount)
    }

    /// Read user memory of any process through its region-1 table, the way
    /// the kernel itself would.
    pub fn peek_user(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
        let task = self.tasks.get(&pid).ok_or(KernelError::BadArgument)?;
        let table = task.page_table.as_ref().ok_or(KernelError::Fault)?;
        crate::memory::vm::read_bytes(&self.machine, table, addr, buf)
    }

    /// Write user memory of any process through its region-1 table.
    pub fn poke_user(&mut self, pid: Pid, addr: u64, bytes: &[u8]) -> Result<()> {
        let task = self.tasks.get(&pid).ok_or(KernelError::BadArgument)?;
        let table = task.page_table.as_ref().ok_or(KernelError::Fault)?;
        crate::memory::vm::write_bytes(&mut self.machine, table, addr, bytes)
    }

    /// Check the kernel-wide bookkeeping laws: frame conservation, the
    /// handle refcount law, wait-queue disjointness, and that exactly the
    /// current process is RUNNING. Returns a description of the first
    /// violation found.
    pub fn check_invariants(&self) -> core::result::Result<(), String> {
        // Frame conservation. COW-shared frames count once.
        let mut accounted = self.frames.free_count();
        let mut cow_pfns: BTreeSet<u32> = BTreeSet::new();
        let mut tally = |table: &PageTable, cow_pfns: &mut BTreeSet<u32>| -> usize {
            let mut n = 0;
            for pte in table.iter() {
                if pte.valid() {
                    if pte.cow() {
                        cow_pfns.insert(pte.pfn());
                    } else {
                        n += 1;
                    }
                }
            }
            n
        };
        accounted += tally(&self.region0, &mut cow_pfns);
        for task in self.tasks.values() {
            if let Some(table) = &task.page_table {
                accounted += tally(table, &mut cow_pfns);
                accounted += table.swapped_count();
            }
            if task.pid != self.current {
                accounted += task.kernel_stack_frames.len();
            }
        }
        accounted += cow_pfns.len();
        if accounted != self.total_pages as usize {
            return Err(format!(
                "frame conservation: accounted {} of {} frames",
                accounted, self.total_pages
            ));
        }

        // Refcount law, with one extra reference per in-flight cvar wait.
        let mut refs: BTreeMap<UtilityId, u32> = BTreeMap::new();
        for task in self.tasks.values() {
            for id in task.utilities.iter().flatten() {
                *refs.entry(*id).or_insert(0) += 1;
            }
            if let Some(PendingOp::CvarWait { lock, .. }) = task.pending {
                *refs.entry(lock).or_insert(0) += 1;
            }
        }
        for (id, u) in &self.utilities {
            let expected = refs.get(id).copied().unwrap_or(0);
            if u.refcount != expected {
                return Err(format!(
                    "refcount law: utility {:?} has refcount {} but {} references",
                    id, u.refcount, expected
                ));
            }
        }

        // Wait-queue disjointness.
        let mut seen: BTreeMap<Pid, usize> = BTreeMap::new();
        let mut note = |pid: Pid, seen: &mut BTreeMap<Pid, usize>| {
            *seen.entry(pid).or_insert(0) += 1;
        };
        for q in self.tty_read_queues.iter().chain(self.tty_trans_queues.iter()) {
            for &pid in q {
                note(pid, &mut seen);
            }
        }
        for u in self.utilities.values() {
            for pid in u.wait_queues() {
                note(pid, &mut seen);
            }
        }
        for t in &self.timers {
            note(t.pid, &mut seen);
        }
        for (pid, n) in &seen {
            if *n > 1 {
                return Err(format!("pid {:?} is on {} wait lists", pid, n));
            }
            if self.ready.contains(pid) {
                return Err(format!("pid {:?} is both ready and waiting", pid));
            }
        }

        // RUNNING is exactly `current`.
        for task in self.tasks.values() {
            if task.state == TaskState::Running && task.pid != self.current {
                return Err(format!("pid {:?} RUNNING but not current", task.pid));
            }
        }
        Ok(())
    }
}
