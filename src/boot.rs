//! Machine bring-up.
//!
//! Installs the trap vector, builds the region-0 page table (kernel text,
//! data, stack, everything else to the free list), turns on virtual
//! memory, creates idle and init, loads the initial user program and
//! snapshots a kernel stack for idle.

use crate::hardware::{
    Machine, Register, KERNEL_STACK_BASE, KERNEL_STACK_PAGES, MAX_PT_LEN,
};
use crate::kernel::{Kernel, KernelConfig, Pid};
use crate::loader::LoadOutcome;
use crate::memory::pte::Pte;
use crate::memory::{page_count, up_to_page, Prot, Region, TableId};
use crate::scheduler::task::{Task, TaskState};
use crate::{KernelError, Result};

/// Pages of kernel text at the bottom of region 0.
pub const KERNEL_TEXT_PAGES: usize = 16;
/// Pages of kernel data following the text; the kernel brk starts on top.
pub const KERNEL_DATA_PAGES: usize = 16;

impl<M: Machine> Kernel<M> {
    /// Boot the kernel on `machine`. `argv[0]` names the initial user
    /// program, defaulting to `init`; the whole argv is passed through to
    /// that program.
    pub fn boot(machine: M, config: KernelConfig, argv: &[&str]) -> Result<Kernel<M>> {
        let mut kernel = Kernel::new(machine, config);
        if kernel.total_pages < MAX_PT_LEN as u32 {
            log::error!("machine too small: {} frames", kernel.total_pages);
            return Err(KernelError::OutOfMemory);
        }

        kernel.install_trap_vector();
        kernel.init_kernel_page_table();

        kernel.machine.write_register(Register::Ptbr0, 0);
        kernel
            .machine
            .write_register(Register::Ptlr0, MAX_PT_LEN as u64);
        kernel
            .machine
            .write_register(Register::Ptbr1, Pid::INIT.0);
        kernel
            .machine
            .write_register(Register::Ptlr1, MAX_PT_LEN as u64);
        kernel.machine.write_register(Register::VmEnable, 1);
        kernel.vm_enabled = true;

        kernel.initialize_processes_at_boot();
        kernel.task_wake_up(Pid::IDLE);

        let program = argv.first().copied().unwrap_or("init");
        let args: Vec<String> = if argv.is_empty() {
            vec![String::from("init")]
        } else {
            argv.iter().map(|s| s.to_string()).collect()
        };
        match kernel.sys_load(program, &args, Pid::INIT) {
            LoadOutcome::Loaded => {}
            _ => {
                log::error!("boot: cannot load initial program '{}'", program);
                return Err(KernelError::BadArgument);
            }
        }
        kernel.current = Pid::INIT;

        // Give idle its own kernel stack: capture the boot kernel context
        // and clone the live stack pages into fresh frames.
        let kctx = kernel.machine.save_kernel_context();
        kernel.task_mut(Pid::IDLE).kcontext = kctx;
        let kstack_page = Region::Kernel.page_index(KERNEL_STACK_BASE);
        let kernel_brk = kernel.kernel_brk;
        let frames = kernel.get_free_pages_and_copy(
            TableId::Kernel,
            kernel_brk,
            kstack_page,
            KERNEL_STACK_PAGES,
        )?;
        {
            let idle = kernel.task_mut(Pid::IDLE);
            for f in frames {
                idle.kernel_stack_frames.push(f);
            }
        }
        kernel.machine.restore_kernel_context(&kctx);

        kernel.task_mut(Pid::INIT).state = TaskState::Running;
        kernel.uctx = kernel.task(Pid::INIT).ucontext;
        log::info!(
            "boot complete: {} frames, {} free, init='{}'",
            kernel.total_pages,
            kernel.frames.free_count(),
            program
        );
        Ok(kernel)
    }

    /// Region 0: text R|X, data R|W, the kernel stack pinned at the top,
    /// and every remaining frame on the free list.
    fn init_kernel_page_table(&mut self) {
        let kstack_page = Region::Kernel.page_index(KERNEL_STACK_BASE);
        let brk_page = KERNEL_TEXT_PAGES + KERNEL_DATA_PAGES;

        for i in 0..KERNEL_TEXT_PAGES {
            self.region0.set(i, Pte::mapping(i as u32, Prot::READ | Prot::EXEC));
        }
        for i in KERNEL_TEXT_PAGES..brk_page {
            self.region0.set(i, Pte::mapping(i as u32, Prot::READ | Prot::WRITE));
        }
        self.kernel_brk = Region::Kernel.page_addr(brk_page);

        for i in brk_page..kstack_page {
            self.frames.release(i as u32);
        }
        for i in kstack_page..MAX_PT_LEN {
            self.region0.set(i, Pte::mapping(i as u32, Prot::READ | Prot::WRITE));
        }
        for i in MAX_PT_LEN as u32..self.total_pages {
            self.frames.release(i);
        }
    }

    /// Idle (pid 0) and init (pid 1), the ready queue and the first
    /// round-robin deadline.
    fn initialize_processes_at_boot(&mut self) {
        let mut idle = Task::bare(Pid::IDLE, Pid::IDLE);
        idle.state = TaskState::Ready;

        let mut init = Task::bare(Pid::INIT, Pid::IDLE);
        init.state = TaskState::None;
        // Init runs on the boot kernel stack, identity-backed at the top
        // of region 0.
        let kstack_page = Region::Kernel.page_index(KERNEL_STACK_BASE);
        for k in 0..KERNEL_STACK_PAGES {
            init.kernel_stack_frames.push((kstack_page + k) as u32);
        }

        self.tasks.insert(Pid::IDLE, idle);
        self.tasks.insert(Pid::INIT, init);
        self.next_pid = 2;
        self.rr_deadline = self.jiffies + self.config.time_slice;
    }

    /// Grow or shrink the kernel heap. Before virtual memory is enabled
    /// this only records the break.
    pub fn set_kernel_brk(&mut self, addr: u64) -> Result<()> {
        if !self.vm_enabled {
            self.kernel_brk = addr;
            return Ok(());
        }
        let new_brk = up_to_page(addr);
        if new_brk >= KERNEL_STACK_BASE {
            log::error!("kernel brk would run into the kernel stack");
            return Err(KernelError::OutOfMemory);
        }

        if new_brk > self.kernel_brk {
            let start = Region::Kernel.page_index(self.kernel_brk);
            let n = page_count(new_brk - self.kernel_brk);
            self.map_pages(TableId::Kernel, start, n, Prot::READ | Prot::WRITE)?;
            self.kernel_brk = new_brk;
        } else if self.kernel_brk > new_brk {
            let start = Region::Kernel.page_index(new_brk);
            let n = page_count(self.kernel_brk - new_brk);
            self.unmap_pages(TableId::Kernel, start, n);
            self.kernel_brk = new_brk;
        }
        Ok(())
    }

    /// Current kernel break (tests and diagnostics).
    pub fn kernel_brk(&self) -> u64 {
        self.kernel_brk
    }
}
