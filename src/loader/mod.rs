//! The program loader: parse an executable, rebuild the target process's
//! region-1 address space, read the segments in, and lay out the argv
//! vector at the top of the new stack.

pub mod load_info;

pub use load_info::{build_image, LoadInfo};

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::hardware::{Machine, PAGE_SIZE, MAX_PT_LEN, VMEM_1_BASE, VMEM_1_LIMIT};
use crate::kernel::{Kernel, Pid};
use crate::memory::{down_to_page, page_count, vm, Prot, Region, TableId};
use crate::scheduler::task::TaskState;
use crate::KernelError;

/// Bytes reserved below the argv block for the program's first frame.
const INITIAL_STACK_FRAME_SIZE: u64 = 64;

/// How a load attempt ended.
pub enum LoadOutcome {
    Loaded,
    /// Failed before touching the target address space; the caller keeps
    /// running and gets ERROR.
    Rejected(KernelError),
    /// Failed after the old address space was destroyed; the target
    /// process cannot continue.
    Fatal(KernelError),
}

impl<M: Machine> Kernel<M> {
    /// Load `filename` with arguments `args` into `pid`'s region 1.
    ///
    /// All validation happens before the first destructive step; from
    /// there on any failure is fatal to the target.
    pub(crate) fn sys_load(&mut self, filename: &str, args: &[String], pid: Pid) -> LoadOutcome {
        let mut file = match File::open(filename) {
            Ok(f) => f,
            Err(_) => {
                log::error!("load: cannot open '{}'", filename);
                return LoadOutcome::Rejected(KernelError::BadArgument);
            }
        };
        let li = match LoadInfo::read(&mut file) {
            Ok(li) => li,
            Err(e) => {
                log::error!("load: '{}' is not a valid executable", filename);
                return LoadOutcome::Rejected(e);
            }
        };
        if li.entry < VMEM_1_BASE || li.entry >= VMEM_1_LIMIT {
            log::error!("load: '{}' entry {:#x} is not in region 1", filename, li.entry);
            return LoadOutcome::Rejected(KernelError::BadArgument);
        }

        let text_pg1 = Region::User.page_index(li.t_vaddr);
        let data_pg1 = Region::User.page_index(li.id_vaddr);
        let data_npg = li.id_npg + li.ud_npg;

        // Bytes of argument strings, NUL terminators included.
        let arg_bytes: usize = args.iter().map(|a| a.len() + 1).sum();
        let argcount = args.len();

        // Strings go at the very top; below them argc, the argv pointers
        // and two NULL terminators, eight-byte aligned; the stack pointer
        // sits a fixed reservation below that.
        let cp = VMEM_1_LIMIT - arg_bytes as u64;
        let cpp = (cp - ((argcount as u64 + 3) * 8)) & !7;
        let sp = cpp - INITIAL_STACK_FRAME_SIZE;

        let stack_npg = page_count(VMEM_1_LIMIT - down_to_page(sp));
        // Keeps at least one unmapped guard page between heap and stack.
        if data_pg1 + data_npg + stack_npg >= MAX_PT_LEN {
            log::error!("load: '{}' does not fit in region 1", filename);
            return LoadOutcome::Rejected(KernelError::BadArgument);
        }

        // Committed. Stash the argument bytes in a kernel buffer before
        // the old region 1 goes away.
        let mut argbuf = Vec::with_capacity(arg_bytes);
        for a in args {
            argbuf.extend_from_slice(a.as_bytes());
            argbuf.push(0);
        }

        if self.task(pid).page_table.is_some() {
            self.task_address_space_unmap(pid);
        } else {
            self.task_mut(pid).page_table = Some(crate::memory::PageTable::new(Region::User));
        }

        if let Err(e) = self.map_pages(TableId::Task(pid), text_pg1, li.t_npg, Prot::READ | Prot::WRITE) {
            return LoadOutcome::Fatal(e);
        }
        {
            let t = self.task_mut(pid);
            t.code_start = text_pg1;
            t.code_pgn = li.t_npg;
        }

        if let Err(e) = self.map_pages(TableId::Task(pid), data_pg1, data_npg, Prot::READ | Prot::WRITE) {
            return LoadOutcome::Fatal(e);
        }
        {
            let t = self.task_mut(pid);
            t.data_start = data_pg1;
            t.data_pgn = data_npg;
            t.brk = Region::User.page_addr(data_pg1 + data_npg);
        }

        let stack_start = Region::User.page_index(down_to_page(sp));
        if let Err(e) = self.map_pages(TableId::Task(pid), stack_start, stack_npg, Prot::READ | Prot::WRITE) {
            return LoadOutcome::Fatal(e);
        }
        {
            let t = self.task_mut(pid);
            t.stack_start = stack_start;
            t.stack_pgn = stack_npg;
        }

        self.install_region1(pid);

        // Text and data move from the file straight into the new pages.
        if let Err(e) = self.read_segment(&mut file, li.t_faddr, pid, li.t_vaddr, li.t_npg) {
            return LoadOutcome::Fatal(e);
        }
        if let Err(e) = self.read_segment(&mut file, li.id_faddr, pid, li.id_vaddr, li.id_npg) {
            return LoadOutcome::Fatal(e);
        }

        if let Err(e) = self.update_pages_prot(TableId::Task(pid), text_pg1, li.t_npg, Prot::READ | Prot::EXEC) {
            return LoadOutcome::Fatal(e);
        }

        // Zero the bss.
        let bss_start = li.id_vaddr + (li.id_npg * PAGE_SIZE) as u64;
        {
            let zero_ok = {
                let table = self.tasks[&pid].page_table.as_ref().expect("fresh table");
                vm::write_zeros(&mut self.machine, table, bss_start, li.ud_npg * PAGE_SIZE).is_ok()
            };
            if !zero_ok {
                return LoadOutcome::Fatal(KernelError::Fault);
            }
        }

        // Build the argv vector: argc, argv[0..n], NULL, NULL, then the
        // string bytes they point at.
        if self.build_argv(pid, cpp, cp, argcount, &argbuf).is_err() {
            return LoadOutcome::Fatal(KernelError::Fault);
        }

        {
            let t = self.task_mut(pid);
            t.ucontext = crate::hardware::UserContext::default();
            t.ucontext.pc = li.entry;
            t.ucontext.sp = sp;
            t.state = TaskState::Ready;
        }
        log::info!(
            "loaded '{}' into pid {:?}: text {}p data {}p stack {}p",
            filename,
            pid,
            li.t_npg,
            data_npg,
            stack_npg
        );
        LoadOutcome::Loaded
    }

    fn read_segment(
        &mut self,
        file: &mut File,
        faddr: u64,
        pid: Pid,
        vaddr: u64,
        npg: usize,
    ) -> crate::Result<()> {
        if npg == 0 {
            return Ok(());
        }
        let mut bytes = vec![0u8; npg * PAGE_SIZE];
        file.seek(SeekFrom::Start(faddr))?;
        file.read_exact(&mut bytes).map_err(|_| KernelError::Io)?;
        let table = self.tasks[&pid].page_table.as_ref().expect("fresh table");
        vm::write_bytes(&mut self.machine, table, vaddr, &bytes)
    }

    fn build_argv(
        &mut self,
        pid: Pid,
        cpp: u64,
        cp: u64,
        argcount: usize,
        argbuf: &[u8],
    ) -> crate::Result<()> {
        let table_write = |k: &mut Self, addr: u64, value: u64| -> crate::Result<()> {
            let table = k.tasks[&pid].page_table.as_ref().expect("fresh table");
            vm::write_u64(&mut k.machine, table, addr, value)
        };

        table_write(self, cpp, argcount as u64)?;

        let mut string_addr = cp;
        let mut arg_start = 0usize;
        for i in 0..argcount {
            table_write(self, cpp + 8 * (1 + i as u64), string_addr)?;
            let len = argbuf[arg_start..]
                .iter()
                .position(|&b| b == 0)
                .expect("argbuf strings are NUL terminated");
            {
                let table = self.tasks[&pid].page_table.as_ref().expect("fresh table");
                vm::write_bytes(
                    &mut self.machine,
                    table,
                    string_addr,
                    &argbuf[arg_start..arg_start + len + 1],
                )?;
            }
            string_addr += (len + 1) as u64;
            arg_start += len + 1;
        }
        // argv and envp NULL terminators.
        table_write(self, cpp + 8 * (1 + argcount as u64), 0)?;
        table_write(self, cpp + 8 * (2 + argcount as u64), 0)?;
        Ok(())
    }
}
