//! The swap engine.
//!
//! When the free list runs dry the allocator asks for a whole victim
//! process to be paged out to a per-pid file under the swap directory:
//! text first, then data+heap, sequentially. Pages shared through COW are
//! skipped — their frames belong to a peer. A later fault on any `swap=1`
//! entry pages the whole process back in and unlinks the file.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

use crate::hardware::{Machine, PAGE_SIZE};
use crate::kernel::{Kernel, Pid};
use crate::memory::{vm, Region, TableId};
use crate::scheduler::task::TaskState;
use crate::{KernelError, Result};

impl<M: Machine> Kernel<M> {
    fn swap_file_path(&self, pid: Pid) -> PathBuf {
        self.config.swap_dir.join(pid.0.to_string())
    }

    /// First process that is neither idle, init, current, already swapped
    /// nor dead.
    fn pick_victim(&self) -> Option<Pid> {
        self.tasks
            .values()
            .find(|t| {
                t.pid > Pid::INIT
                    && t.pid != self.current
                    && !t.swapped
                    && t.state != TaskState::Zombie
                    && t.page_table.is_some()
            })
            .map(|t| t.pid)
    }

    /// Page a victim process out to disk, freeing its resident frames.
    pub(crate) fn swap_out(&mut self) -> Result<()> {
        let victim = match self.pick_victim() {
            Some(v) => v,
            None => {
                log::debug!("swap_out: no eligible victim");
                return Err(KernelError::OutOfMemory);
            }
        };
        log::info!("swapping out pid {:?}", victim);

        fs::create_dir_all(&self.config.swap_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(
                &self.config.swap_dir,
                fs::Permissions::from_mode(0o700),
            );
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.swap_file_path(victim))?;

        self.install_region1(victim);

        let (code_start, code_pgn, data_start, brk_page) = {
            let t = self.task(victim);
            (t.code_start, t.code_pgn, t.data_start, t.brk_page())
        };
        let ret = self
            .pages_swap_out(victim, code_start, code_pgn, &mut file)
            .and_then(|_| {
                self.pages_swap_out(victim, data_start, brk_page - data_start, &mut file)
            });

        match ret {
            Ok(()) => self.task_mut(victim).swapped = true,
            Err(_) => self.task_mut(victim).swapped = false,
        }
        self.reinstall_current_region1();
        ret.map_err(|_| KernelError::Io)
    }

    fn pages_swap_out(
        &mut self,
        victim: Pid,
        start: usize,
        n: usize,
        file: &mut fs::File,
    ) -> Result<()> {
        let cow_enabled = self.config.cow;
        let mut page = vec![0u8; PAGE_SIZE];
        for i in start..start + n {
            let pte = self.table_ref(TableId::Task(victim)).entry(i);
            if !pte.valid() || (cow_enabled && pte.cow()) {
                continue;
            }
            {
                let table = self.tasks[&victim]
                    .page_table
                    .as_ref()
                    .expect("victim has a table");
                vm::read_bytes(&self.machine, table, Region::User.page_addr(i), &mut page)?;
            }
            file.write_all(&page)?;

            let pfn = self.with_table(TableId::Task(victim), |t| {
                let e = t.entry_mut(i);
                e.set_swap(true);
                e.set_valid(false);
                e.pfn()
            });
            self.flush_addr(Region::User.page_addr(i));
            self.frames.release(pfn);
        }
        Ok(())
    }

    /// Page a swapped process back in. Any short read rolls that page
    /// back to its swapped state and fails with an I/O error; the swap
    /// file is unlinked only after a fully successful load.
    pub(crate) fn swap_in(&mut self, pid: Pid) -> Result<()> {
        if !self.task(pid).swapped {
            log::error!("swap_in: pid {:?} is not swapped", pid);
            return Err(KernelError::BadArgument);
        }
        log::info!("swapping in pid {:?}", pid);

        let path = self.swap_file_path(pid);
        let mut file = fs::File::open(&path)?;

        self.install_region1(pid);
        let (code_start, code_pgn, data_start, brk_page) = {
            let t = self.task(pid);
            (t.code_start, t.code_pgn, t.data_start, t.brk_page())
        };
        let ret = self
            .pages_swap_in(pid, code_start, code_pgn, &mut file)
            .and_then(|_| self.pages_swap_in(pid, data_start, brk_page - data_start, &mut file));

        self.task_mut(pid).swapped = false;
        self.reinstall_current_region1();
        match ret {
            Ok(()) => {
                let _ = fs::remove_file(&path);
                Ok(())
            }
            Err(_) => Err(KernelError::Io),
        }
    }

    fn pages_swap_in(
        &mut self,
        pid: Pid,
        start: usize,
        n: usize,
        file: &mut fs::File,
    ) -> Result<()> {
        let mut page = vec![0u8; PAGE_SIZE];
        for i in start..start + n {
            let pte = self.table_ref(TableId::Task(pid)).entry(i);
            if !pte.swap() || pte.valid() {
                continue;
            }
            let pfn = self.alloc_frame()?;
            self.with_table(TableId::Task(pid), |t| {
                let e = t.entry_mut(i);
                e.set_pfn(pfn);
                e.set_valid(true);
                e.set_swap(false);
            });
            self.flush_addr(Region::User.page_addr(i));

            if file.read_exact(&mut page).is_err() {
                log::error!("swap_in: short read for page {} of pid {:?}", i, pid);
                self.with_table(TableId::Task(pid), |t| {
                    let e = t.entry_mut(i);
                    e.set_valid(false);
                    e.set_swap(true);
                });
                self.flush_addr(Region::User.page_addr(i));
                self.frames.release(pfn);
                return Err(KernelError::Io);
            }
            let table = self.tasks[&pid].page_table.as_ref().expect("task has a table");
            vm::write_bytes(&mut self.machine, table, Region::User.page_addr(i), &page)?;
        }
        Ok(())
    }

    /// Put the running process's table back after operating on a victim.
    fn reinstall_current_region1(&mut self) {
        let cur = self.current;
        if self.tasks.get(&cur).map_or(false, |t| t.page_table.is_some()) {
            self.install_region1(cur);
        }
    }
}
