//! Page-table operations.
//!
//! Map, unmap, copy, re-protect, COW marking, frame re-indexing. Every
//! mutation is followed by the matching TLB invalidation: per-address for
//! point updates, whole-region after bulk changes. Copies between address
//! spaces go through a scratch mapping installed just above the source's
//! brk, exactly one page at a time.

use crate::hardware::{Machine, Register, PAGE_SIZE, TLB_FLUSH_0, TLB_FLUSH_1};
use crate::kernel::Kernel;
use crate::memory::pte::Pte;
use crate::memory::{up_to_page, PageTable, Prot, Region, TableId};
use crate::{KernelError, Result};

impl<M: Machine> Kernel<M> {
    pub(crate) fn flush_addr(&mut self, addr: u64) {
        self.machine.write_register(Register::TlbFlush, addr);
    }

    pub(crate) fn flush_region(&mut self, region: Region) {
        let sentinel = match region {
            Region::Kernel => TLB_FLUSH_0,
            Region::User => TLB_FLUSH_1,
        };
        self.machine.write_register(Register::TlbFlush, sentinel);
    }

    pub(crate) fn table_region(&self, id: TableId) -> Region {
        match id {
            TableId::Kernel => Region::Kernel,
            TableId::Task(_) => Region::User,
        }
    }

    pub(crate) fn table_ref(&self, id: TableId) -> &PageTable {
        match id {
            TableId::Kernel => &self.region0,
            TableId::Task(pid) => self
                .tasks
                .get(&pid)
                .and_then(|t| t.page_table.as_ref())
                .expect("task owns a region-1 table"),
        }
    }

    pub(crate) fn with_table<R>(&mut self, id: TableId, f: impl FnOnce(&mut PageTable) -> R) -> R {
        match id {
            TableId::Kernel => f(&mut self.region0),
            TableId::Task(pid) => f(self
                .tasks
                .get_mut(&pid)
                .and_then(|t| t.page_table.as_mut())
                .expect("task owns a region-1 table")),
        }
    }

    /// Copy one page of virtual memory, both sides translated through
    /// `table`.
    fn copy_virtual_page(&mut self, table: TableId, from: u64, to: u64) -> Result<()> {
        let mut page = vec![0u8; PAGE_SIZE];
        crate::memory::vm::read_bytes(&self.machine, self.table_ref(table), from, &mut page)?;
        match table {
            TableId::Kernel => {
                crate::memory::vm::write_bytes(&mut self.machine, &self.region0, to, &page)
            }
            TableId::Task(pid) => {
                let t = self.tasks[&pid]
                    .page_table
                    .as_ref()
                    .expect("task owns a region-1 table");
                crate::memory::vm::write_bytes(&mut self.machine, t, to, &page)
            }
        }
    }

    /// Map `n` pages starting at `start`, backing each with a fresh frame.
    /// On failure the pages mapped so far remain; the caller rolls back.
    pub(crate) fn map_pages(
        &mut self,
        id: TableId,
        start: usize,
        n: usize,
        prot: Prot,
    ) -> Result<()> {
        let mut ret = Ok(());
        for i in start..start + n {
            match self.alloc_frame() {
                Ok(pfn) => self.with_table(id, |t| t.set(i, Pte::mapping(pfn, prot))),
                Err(e) => {
                    log::error!("map_pages: no frame for page {}", i);
                    ret = Err(e);
                    break;
                }
            }
        }
        self.flush_region(self.table_region(id));
        ret
    }

    /// Like `map_pages`, but fills each new frame with the contents of the
    /// corresponding virtual page of `src`, copied through a scratch
    /// mapping just above the source's brk. Only used when COW is off.
    pub(crate) fn map_pages_and_copy(
        &mut self,
        dest: TableId,
        src: TableId,
        src_brk: u64,
        start: usize,
        n: usize,
    ) -> Result<()> {
        let src_region = self.table_region(src);
        let scratch_addr = up_to_page(src_brk);
        let scratch = src_region.page_index(scratch_addr);

        for i in start..start + n {
            let pfn = self.alloc_frame()?;
            let pte = Pte::mapping(pfn, Prot::READ | Prot::WRITE);
            self.with_table(dest, |t| t.set(i, pte));
            self.with_table(src, |t| t.set(scratch, pte));
            self.flush_addr(scratch_addr);
            self.copy_virtual_page(src, src_region.page_addr(i), scratch_addr)?;
        }

        self.with_table(src, |t| t.entry_mut(scratch).clear());
        self.flush_addr(scratch_addr);
        Ok(())
    }

    /// Allocate `n` bare frames and copy into them the contents of the
    /// virtual pages `start..start+n` of `src`, again through the scratch
    /// window above `src_brk`. Used to clone a kernel stack.
    pub(crate) fn get_free_pages_and_copy(
        &mut self,
        src: TableId,
        src_brk: u64,
        start: usize,
        n: usize,
    ) -> Result<Vec<u32>> {
        let src_region = self.table_region(src);
        let scratch_addr = up_to_page(src_brk);
        let scratch = src_region.page_index(scratch_addr);
        let mut record = Vec::with_capacity(n);

        for i in start..start + n {
            let pfn = self.alloc_frame()?;
            let pte = Pte::mapping(pfn, Prot::READ | Prot::WRITE);
            self.with_table(src, |t| t.set(scratch, pte));
            self.flush_addr(scratch_addr);
            self.copy_virtual_page(src, src_region.page_addr(i), scratch_addr)?;
            record.push(pfn);
        }

        self.with_table(src, |t| t.entry_mut(scratch).clear());
        self.flush_addr(scratch_addr);
        Ok(record)
    }

    /// Re-protect `n` valid pages.
    pub(crate) fn update_pages_prot(
        &mut self,
        id: TableId,
        start: usize,
        n: usize,
        prot: Prot,
    ) -> Result<()> {
        let region = self.table_region(id);
        for i in start..start + n {
            let ok = self.with_table(id, |t| {
                let pte = t.entry_mut(i);
                if !pte.valid() {
                    return false;
                }
                pte.set_prot(prot);
                true
            });
            if !ok {
                log::error!("update_pages_prot: page {} is invalid", i);
                return Err(KernelError::BadArgument);
            }
            self.flush_addr(region.page_addr(i));
        }
        Ok(())
    }

    /// Point `n` valid pages at new physical frames. Used by the
    /// context-switch callback to swing the kernel-stack window.
    pub(crate) fn update_pages_indexes(
        &mut self,
        id: TableId,
        start: usize,
        indexes: &[u32],
    ) -> Result<()> {
        let region = self.table_region(id);
        for (k, &pfn) in indexes.iter().enumerate() {
            let i = start + k;
            let ok = self.with_table(id, |t| {
                let pte = t.entry_mut(i);
                if !pte.valid() {
                    return false;
                }
                pte.set_pfn(pfn);
                true
            });
            if !ok {
                log::error!("update_pages_indexes: page {} is invalid", i);
                return Err(KernelError::BadArgument);
            }
            self.flush_addr(region.page_addr(i));
        }
        Ok(())
    }

    /// Set or clear the COW bit on `n` valid pages.
    pub(crate) fn update_pages_cow(
        &mut self,
        id: TableId,
        start: usize,
        n: usize,
        cow: bool,
    ) -> Result<()> {
        let region = self.table_region(id);
        for i in start..start + n {
            let ok = self.with_table(id, |t| {
                let pte = t.entry_mut(i);
                if !pte.valid() {
                    return false;
                }
                pte.set_cow(cow);
                true
            });
            if !ok {
                log::error!("update_pages_cow: page {} is invalid", i);
                return Err(KernelError::BadArgument);
            }
            self.flush_addr(region.page_addr(i));
        }
        Ok(())
    }

    /// Tear down `n` pages. A COW-shared frame stays with its peers; any
    /// other backing frame returns to the free list.
    pub(crate) fn unmap_pages(&mut self, id: TableId, start: usize, n: usize) {
        let cow_enabled = self.config.cow;
        let region = self.table_region(id);
        for i in start..start + n {
            let freed = self.with_table(id, |t| {
                let pte = t.entry_mut(i);
                let freed = if pte.valid() && !(cow_enabled && pte.cow()) {
                    Some(pte.pfn())
                } else {
                    None
                };
                pte.clear();
                freed
            });
            if let Some(pfn) = freed {
                self.frames.release(pfn);
            }
            self.flush_addr(region.page_addr(i));
        }
        self.flush_region(region);
    }

    /// Return bare frames to the free list without touching any table.
    pub(crate) fn collect_back_pages(&mut self, indexes: &[u32]) {
        self.frames.bulk_release(indexes);
    }

    /// Give `dest` a private copy of the frame it currently shares with
    /// `src` at `page_index`. The new frame is filled through the scratch
    /// window above the source's brk, then swapped into `dest`'s entry
    /// with R|W protection and the COW bit cleared.
    pub(crate) fn page_cow_copy(
        &mut self,
        dest: TableId,
        src: TableId,
        src_brk: u64,
        page_index: usize,
    ) -> Result<()> {
        let shared = self.table_ref(dest).entry(page_index).pfn()
            == self.table_ref(src).entry(page_index).pfn();
        if !shared {
            return Ok(());
        }

        let pfn = self.alloc_frame()?;
        let src_region = self.table_region(src);
        let scratch_addr = up_to_page(src_brk);
        let scratch = src_region.page_index(scratch_addr);

        self.with_table(dest, |t| {
            let pte = t.entry_mut(page_index);
            pte.set_pfn(pfn);
            pte.set_prot(Prot::READ | Prot::WRITE);
            pte.set_cow(false);
        });
        self.with_table(src, |t| {
            t.set(scratch, Pte::mapping(pfn, Prot::READ | Prot::WRITE))
        });
        self.flush_addr(scratch_addr);
        self.copy_virtual_page(src, src_region.page_addr(page_index), scratch_addr)?;
        self.with_table(src, |t| t.entry_mut(scratch).clear());
        self.flush_addr(scratch_addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimMachine;
    use crate::kernel::{KernelConfig, Pid};
    use crate::scheduler::task::Task;

    fn kernel_with_frames(n: u32) -> Kernel<SimMachine> {
        let mut k = Kernel::new(SimMachine::new(n, 1), KernelConfig::default());
        for i in 0..n {
            k.frames.release(i);
        }
        k
    }

    fn add_task_with_table(k: &mut Kernel<SimMachine>, pid: u64) -> Pid {
        let pid = Pid(pid);
        let mut t = Task::bare(pid, Pid::INIT);
        t.page_table = Some(PageTable::new(Region::User));
        k.tasks.insert(pid, t);
        pid
    }

    fn poke_page(k: &mut Kernel<SimMachine>, pid: Pid, index: usize, fill: u8) {
        let page = vec![fill; PAGE_SIZE];
        let table = k.tasks[&pid].page_table.as_ref().unwrap();
        crate::memory::vm::write_bytes(
            &mut k.machine,
            table,
            Region::User.page_addr(index),
            &page,
        )
        .unwrap();
    }

    fn peek_byte(k: &Kernel<SimMachine>, pid: Pid, index: usize) -> u8 {
        let mut b = [0u8; 1];
        let table = k.tasks[&pid].page_table.as_ref().unwrap();
        crate::memory::vm::read_bytes(&k.machine, table, Region::User.page_addr(index), &mut b)
            .unwrap();
        b[0]
    }

    #[test]
    fn map_then_unmap_conserves_frames() {
        let mut k = kernel_with_frames(8);
        assert_eq!(k.frames.free_count(), 8);
        k.map_pages(TableId::Kernel, 0, 3, Prot::READ | Prot::WRITE)
            .unwrap();
        assert_eq!(k.frames.free_count(), 5);
        assert_eq!(k.region0.valid_count(), 3);
        k.unmap_pages(TableId::Kernel, 0, 3);
        assert_eq!(k.frames.free_count(), 8);
        assert_eq!(k.region0.valid_count(), 0);
    }

    #[test]
    fn map_and_copy_round_trip_preserves_source() {
        let mut k = kernel_with_frames(16);
        let a = add_task_with_table(&mut k, 7);
        let b = add_task_with_table(&mut k, 8);

        // Source pages 0..2 mapped and filled; brk right above them.
        k.map_pages(TableId::Task(a), 0, 2, Prot::READ | Prot::WRITE)
            .unwrap();
        poke_page(&mut k, a, 0, 0xAA);
        poke_page(&mut k, a, 1, 0xBB);
        let brk = Region::User.page_addr(2);
        let free_before = k.frames.free_count();

        k.map_pages_and_copy(TableId::Task(b), TableId::Task(a), brk, 0, 2)
            .unwrap();
        // The copies carry the source contents.
        assert_eq!(peek_byte(&k, b, 0), 0xAA);
        assert_eq!(peek_byte(&k, b, 1), 0xBB);
        // The source is intact and its scratch entry is gone.
        assert_eq!(peek_byte(&k, a, 0), 0xAA);
        assert!(!k.tasks[&a].page_table.as_ref().unwrap().entry(2).valid());

        // Tearing the copy down restores the frame count exactly.
        k.unmap_pages(TableId::Task(b), 0, 2);
        assert_eq!(k.frames.free_count(), free_before);
        assert_eq!(peek_byte(&k, a, 1), 0xBB);
    }

    #[test]
    fn page_cow_copy_splits_a_shared_frame() {
        let mut k = kernel_with_frames(16);
        k.config.cow = true;
        let a = add_task_with_table(&mut k, 7);
        let b = add_task_with_table(&mut k, 8);

        k.map_pages(TableId::Task(a), 0, 1, Prot::READ | Prot::WRITE)
            .unwrap();
        poke_page(&mut k, a, 0, 0x5A);
        // Share the mapping the way a COW fork does.
        let shared = k.tasks[&a].page_table.as_ref().unwrap().entry(0);
        k.with_table(TableId::Task(b), |t| t.set(0, shared));
        k.update_pages_cow(TableId::Task(a), 0, 1, true).unwrap();
        k.update_pages_cow(TableId::Task(b), 0, 1, true).unwrap();

        let brk = Region::User.page_addr(1);
        let free_before = k.frames.free_count();
        k.page_cow_copy(TableId::Task(b), TableId::Task(a), brk, 0)
            .unwrap();
        assert_eq!(k.frames.free_count(), free_before - 1);

        let pa = k.tasks[&a].page_table.as_ref().unwrap().entry(0);
        let pb = k.tasks[&b].page_table.as_ref().unwrap().entry(0);
        assert_ne!(pa.pfn(), pb.pfn());
        assert!(!pb.cow());
        assert_eq!(pb.prot(), Prot::READ | Prot::WRITE);
        assert_eq!(peek_byte(&k, b, 0), 0x5A);
    }

    #[test]
    fn update_prot_rejects_invalid_pages() {
        let mut k = kernel_with_frames(4);
        assert!(k
            .update_pages_prot(TableId::Kernel, 0, 1, Prot::READ)
            .is_err());
    }

    #[test]
    fn unmap_keeps_cow_frames() {
        let mut k = kernel_with_frames(4);
        k.config.cow = true;
        k.map_pages(TableId::Kernel, 0, 2, Prot::READ | Prot::WRITE)
            .unwrap();
        k.update_pages_cow(TableId::Kernel, 0, 1, true).unwrap();
        let free_before = k.frames.free_count();
        k.unmap_pages(TableId::Kernel, 0, 2);
        // Page 0 was shared: only page 1's frame came back.
        assert_eq!(k.frames.free_count(), free_before + 1);
    }

    #[test]
    fn every_mutation_flushes_the_tlb() {
        let mut k = kernel_with_frames(8);
        k.map_pages(TableId::Kernel, 0, 2, Prot::READ | Prot::WRITE)
            .unwrap();
        let flushes = k.machine.tlb_flushes.len();
        k.update_pages_prot(TableId::Kernel, 0, 2, Prot::READ).unwrap();
        // One per-address invalidation per touched page.
        assert_eq!(k.machine.tlb_flushes.len(), flushes + 2);
        k.unmap_pages(TableId::Kernel, 0, 2);
        assert!(k.machine.tlb_flushes.len() > flushes + 2);
    }
}
