//! The process control block and its address space.

use std::collections::VecDeque;

use arrayvec::ArrayVec;

use crate::hardware::{
    KernelContext, Machine, UserContext, KERNEL_STACK_PAGES, MAX_PT_LEN,
};
use crate::ipc::UtilityId;
use crate::kernel::{Kernel, PendingOp, Pid, WaitChannel};
use crate::memory::{PageTable, Prot, Region, TableId};
use crate::{KernelError, Result};

/// Per-process limit on open pipes/locks/cvars.
pub const MAX_NUM_OPEN: usize = 128;

/// Process states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Ready,
    Pending,
    Zombie,
    Exit,
    None,
}

/// What a parent reaps: the child's pid and exit code, queued in the
/// parent's zombie inbox when the child exits. The child's PCB itself is
/// destroyed by the context-switch callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZombieRecord {
    pub pid: Pid,
    pub exit_code: i64,
}

/// One process.
pub struct Task {
    pub pid: Pid,
    pub state: TaskState,
    pub exit_code: i64,

    pub parent: Pid,
    pub children: Vec<Pid>,
    pub zombies: VecDeque<ZombieRecord>,
    pub wait_child_flag: bool,

    pub ucontext: UserContext,
    pub kcontext: KernelContext,

    /// Physical frames backing the kernel stack. Empty means this is a
    /// forked child that has never run; the context-switch callback clones
    /// the outgoing stack into fresh frames on its first dispatch.
    pub kernel_stack_frames: ArrayVec<u32, KERNEL_STACK_PAGES>,

    // Region-1 layout, in page indices except `brk`.
    pub code_start: usize,
    pub code_pgn: usize,
    pub data_start: usize,
    pub data_pgn: usize,
    pub brk: u64,
    pub stack_start: usize,
    pub stack_pgn: usize,

    pub page_table: Option<PageTable>,

    /// Handle table; the handle is the slot index.
    pub utilities: Vec<Option<UtilityId>>,

    /// Kernel-side staging buffer while this process is the active reader
    /// of some terminal, plus the received length (explicit, never routed
    /// through `exit_code`).
    pub tty_buf: Option<Vec<u8>>,
    pub tty_len: usize,

    pub swapped: bool,
    /// Copy-on-write peer group membership.
    pub cow_group: Option<u64>,

    /// The wait structure this task is blocked on, if any.
    pub blocked_on: Option<WaitChannel>,
    /// The suspended operation to resume when scheduled back in.
    pub pending: Option<PendingOp>,
}

impl Task {
    /// A blank task. Boot uses this for idle and init; `spawn_child`
    /// builds forked children from their parent instead.
    pub fn bare(pid: Pid, parent: Pid) -> Self {
        Task {
            pid,
            state: TaskState::None,
            exit_code: 0,
            parent,
            children: Vec::new(),
            zombies: VecDeque::new(),
            wait_child_flag: false,
            ucontext: UserContext::default(),
            kcontext: KernelContext::default(),
            kernel_stack_frames: ArrayVec::new(),
            code_start: 0,
            code_pgn: 0,
            data_start: 0,
            data_pgn: 0,
            brk: 0,
            stack_start: 0,
            stack_pgn: 0,
            page_table: None,
            utilities: vec![None; MAX_NUM_OPEN],
            tty_buf: None,
            tty_len: 0,
            swapped: false,
            cow_group: None,
            blocked_on: None,
            pending: None,
        }
    }

    /// First empty handle slot, or an error when the table is full.
    pub fn new_utility_slot(&self) -> Result<usize> {
        self.utilities
            .iter()
            .position(|u| u.is_none())
            .ok_or(KernelError::OutOfMemory)
    }

    /// The utility behind a handle, if the slot is live.
    pub fn get_utility(&self, slot: usize) -> Option<UtilityId> {
        self.utilities.get(slot).copied().flatten()
    }

    /// Page index of the first unmapped page above the heap.
    pub fn brk_page(&self) -> usize {
        Region::User.page_index(crate::memory::up_to_page(self.brk))
    }
}

impl<M: Machine> Kernel<M> {
    /// Allocate and link a child of `parent`: layout and saved contexts
    /// copied, lineage and per-process resources reset.
    pub(crate) fn spawn_child(&mut self, parent: Pid) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;

        let p = self.task(parent);
        let mut child = Task::bare(pid, parent);
        child.ucontext = p.ucontext;
        child.kcontext = p.kcontext;
        child.code_start = p.code_start;
        child.code_pgn = p.code_pgn;
        child.data_start = p.data_start;
        child.data_pgn = p.data_pgn;
        child.brk = p.brk;
        child.stack_start = p.stack_start;
        child.stack_pgn = p.stack_pgn;

        self.tasks.insert(pid, child);
        self.task_mut(parent).children.push(pid);
        pid
    }

    /// Copy `from`'s region-1 address space into `to`.
    ///
    /// Plain mode maps fresh frames and copies text, data+heap and stack;
    /// COW mode shares every frame, downgrades writable pages to read-only
    /// on both sides, and joins the two processes into a peer group.
    pub(crate) fn task_vm_copy(&mut self, to: Pid, from: Pid) -> Result<()> {
        let mut table = PageTable::new(Region::User);
        let (code_start, code_pgn, data_start, brk, stack_start, stack_pgn, brk_page) = {
            let f = self.task(from);
            (f.code_start, f.code_pgn, f.data_start, f.brk, f.stack_start, f.stack_pgn, f.brk_page())
        };

        if self.config.cow {
            {
                let src = self.task(from).page_table.as_ref().expect("parent has a table");
                for i in 0..MAX_PT_LEN {
                    table.set(i, src.entry(i));
                }
            }
            self.task_mut(to).page_table = Some(table);
            for i in 0..MAX_PT_LEN {
                let entry = self
                    .task(from)
                    .page_table
                    .as_ref()
                    .expect("parent has a table")
                    .entry(i);
                if !entry.valid() {
                    continue;
                }
                if entry.prot() == (Prot::READ | Prot::WRITE) {
                    self.update_pages_prot(TableId::Task(to), i, 1, Prot::READ)?;
                    self.update_pages_prot(TableId::Task(from), i, 1, Prot::READ)?;
                }
                self.update_pages_cow(TableId::Task(to), i, 1, true)?;
                self.update_pages_cow(TableId::Task(from), i, 1, true)?;
            }
            self.cow_join(from, to);
        } else {
            self.task_mut(to).page_table = Some(table);
            self.map_pages_and_copy(TableId::Task(to), TableId::Task(from), brk, code_start, code_pgn)?;
            self.update_pages_prot(TableId::Task(to), code_start, code_pgn, Prot::READ | Prot::EXEC)?;
            self.map_pages_and_copy(
                TableId::Task(to),
                TableId::Task(from),
                brk,
                data_start,
                brk_page - data_start,
            )?;
            self.map_pages_and_copy(TableId::Task(to), TableId::Task(from), brk, stack_start, stack_pgn)?;
        }
        Ok(())
    }

    /// The `fork_share` variant: text, data and heap frames are shared
    /// outright (no protection downgrade), only the stack is physically
    /// copied. Both processes join the peer group so shared frames free
    /// exactly once.
    pub(crate) fn task_vm_share_copy(&mut self, to: Pid, from: Pid) -> Result<()> {
        let mut table = PageTable::new(Region::User);
        let (brk, stack_start, stack_pgn) = {
            let f = self.task(from);
            (f.brk, f.stack_start, f.stack_pgn)
        };

        {
            let src = self.task(from).page_table.as_ref().expect("parent has a table");
            for i in 0..stack_start {
                table.set(i, src.entry(i));
            }
        }
        self.task_mut(to).page_table = Some(table);
        for i in 0..stack_start {
            let valid = self
                .task(from)
                .page_table
                .as_ref()
                .expect("parent has a table")
                .entry(i)
                .valid();
            if valid {
                self.update_pages_cow(TableId::Task(to), i, 1, true)?;
                self.update_pages_cow(TableId::Task(from), i, 1, true)?;
            }
        }
        self.map_pages_and_copy(TableId::Task(to), TableId::Task(from), brk, stack_start, stack_pgn)?;
        self.cow_join(from, to);
        Ok(())
    }

    /// Grow (`increment > 0`) or shrink (`increment < 0`) the stack
    /// towards the heap. Refuses to touch the heap or leave region 1.
    pub(crate) fn task_vm_expand_stack(&mut self, pid: Pid, increment: isize) {
        if increment == 0 {
            return;
        }
        let (stack_start, brk_page) = {
            let t = self.task(pid);
            (t.stack_start, t.brk_page())
        };
        let new_start = stack_start as isize - increment;
        if new_start <= brk_page as isize || new_start >= MAX_PT_LEN as isize {
            return;
        }
        let new_start = new_start as usize;

        if increment > 0 {
            if self
                .map_pages(TableId::Task(pid), new_start, increment as usize, Prot::READ | Prot::WRITE)
                .is_err()
            {
                return;
            }
        } else {
            self.unmap_pages(TableId::Task(pid), stack_start, (-increment) as usize);
        }
        let t = self.task_mut(pid);
        t.stack_start = new_start;
        t.stack_pgn = (t.stack_pgn as isize + increment) as usize;
    }

    /// Give every COW peer of `pid` a private copy of one shared page,
    /// then make `pid`'s own mapping writable and un-shared.
    pub(crate) fn task_cow_copy_page(&mut self, pid: Pid, page_index: usize) -> Result<()> {
        let brk = self.task(pid).brk;
        for peer in self.cow_peers(pid) {
            self.page_cow_copy(TableId::Task(peer), TableId::Task(pid), brk, page_index)?;
        }
        self.update_pages_prot(TableId::Task(pid), page_index, 1, Prot::READ | Prot::WRITE)?;
        self.update_pages_cow(TableId::Task(pid), page_index, 1, false)?;
        Ok(())
    }

    /// Unmap a task's whole region-1 address space. When the task is the
    /// last member of its COW group the shared bits are cleared first so
    /// the frames really return to the free list.
    pub(crate) fn task_address_space_unmap(&mut self, pid: Pid) {
        if self.task(pid).page_table.is_none() {
            return;
        }
        let (code_start, code_pgn, data_start, stack_start, stack_pgn, brk_page) = {
            let t = self.task(pid);
            (t.code_start, t.code_pgn, t.data_start, t.stack_start, t.stack_pgn, t.brk_page())
        };

        if self.config.cow && self.cow_peers(pid).is_empty() {
            let _ = self.update_pages_cow(TableId::Task(pid), code_start, code_pgn, false);
            let _ = self.update_pages_cow(TableId::Task(pid), data_start, brk_page - data_start, false);
            let _ = self.update_pages_cow(TableId::Task(pid), stack_start, stack_pgn, false);
        }
        self.unmap_pages(TableId::Task(pid), code_start, code_pgn);
        self.unmap_pages(TableId::Task(pid), data_start, brk_page - data_start);
        self.unmap_pages(TableId::Task(pid), stack_start, stack_pgn);
        self.cow_leave(pid);
    }

    /// Destroy a dead task: address space, kernel stack, handle
    /// references, PCB. Called from the context-switch callback once the
    /// task can no longer be running.
    pub(crate) fn free_task(&mut self, pid: Pid) {
        self.task_address_space_unmap(pid);
        let frames: Vec<u32> = self.task(pid).kernel_stack_frames.iter().copied().collect();
        self.collect_back_pages(&frames);
        let handles: Vec<UtilityId> = self.task(pid).utilities.iter().flatten().copied().collect();
        for id in handles {
            let _ = self.utility_put(id);
        }
        self.tasks.remove(&pid);
    }

    /// Hand a dying task's live children and unreaped zombies to init.
    pub(crate) fn task_rescue_children(&mut self, pid: Pid) {
        let (children, zombies) = {
            let t = self.task_mut(pid);
            (std::mem::take(&mut t.children), std::mem::take(&mut t.zombies))
        };
        for child in &children {
            if let Some(c) = self.tasks.get_mut(child) {
                c.parent = Pid::INIT;
            }
        }
        let init = self.task_mut(Pid::INIT);
        init.children.extend(children);
        init.zombies.extend(zombies);
    }

    /// Copy the whole handle table from parent to child, bumping each
    /// utility's refcount.
    pub(crate) fn task_utilities_copy(&mut self, to: Pid, from: Pid) {
        let handles = self.task(from).utilities.clone();
        for id in handles.iter().flatten() {
            self.utility_get(*id);
        }
        self.task_mut(to).utilities = handles;
    }

    // ---- COW peer groups ----

    /// Peers sharing frames with `pid` (not including `pid` itself).
    pub(crate) fn cow_peers(&self, pid: Pid) -> Vec<Pid> {
        match self.tasks.get(&pid).and_then(|t| t.cow_group) {
            None => Vec::new(),
            Some(g) => self.cow_groups[&g]
                .iter()
                .copied()
                .filter(|&p| p != pid)
                .collect(),
        }
    }

    fn cow_join(&mut self, a: Pid, b: Pid) {
        let group = match self.task(a).cow_group {
            Some(g) => g,
            None => {
                let g = self.next_cow_group;
                self.next_cow_group += 1;
                self.cow_groups.insert(g, vec![a]);
                self.task_mut(a).cow_group = Some(g);
                g
            }
        };
        self.cow_groups.get_mut(&group).expect("live cow group").push(b);
        self.task_mut(b).cow_group = Some(group);
    }

    pub(crate) fn cow_leave(&mut self, pid: Pid) {
        if let Some(g) = self.task(pid).cow_group {
            let members = self.cow_groups.get_mut(&g).expect("live cow group");
            members.retain(|&p| p != pid);
            if members.is_empty() {
                self.cow_groups.remove(&g);
            }
            self.task_mut(pid).cow_group = None;
        }
    }
}
