//! Virtual-memory foundations: protection bits, address arithmetic and the
//! two kinds of page table (kernel region 0, per-process region 1).

pub mod frame_allocator;
pub mod paging;
pub mod pte;
pub mod swap;
pub mod vm;

use bitflags::bitflags;

use crate::hardware::{PAGE_SHIFT, PAGE_SIZE, MAX_PT_LEN, VMEM_0_BASE, VMEM_1_BASE};
use crate::kernel::Pid;
use pte::Pte;

bitflags! {
    /// Page protection, in the hardware's 3-bit encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

/// Which half of the virtual address space a page table maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Kernel,
    User,
}

impl Region {
    pub fn base(self) -> u64 {
        match self {
            Region::Kernel => VMEM_0_BASE,
            Region::User => VMEM_1_BASE,
        }
    }

    /// Page index of `addr` within this region.
    pub fn page_index(self, addr: u64) -> usize {
        ((addr - self.base()) >> PAGE_SHIFT) as usize
    }

    /// Base virtual address of page `index` within this region.
    pub fn page_addr(self, index: usize) -> u64 {
        self.base() + ((index as u64) << PAGE_SHIFT)
    }
}

/// Which page table an operation targets: the process-wide kernel table or
/// the region-1 table owned by one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableId {
    Kernel,
    Task(Pid),
}

/// Round `addr` up to the next page boundary.
pub fn up_to_page(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Round `addr` down to its page boundary.
pub fn down_to_page(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Number of whole pages covering `bytes`.
pub fn page_count(bytes: u64) -> usize {
    (up_to_page(bytes) >> PAGE_SHIFT) as usize
}

/// One page table: a fixed run of packed entries plus the region it maps,
/// so TLB flushes know which half of the address space they invalidate.
#[derive(Debug, Clone)]
pub struct PageTable {
    region: Region,
    entries: Vec<Pte>,
}

impl PageTable {
    pub fn new(region: Region) -> Self {
        PageTable {
            region,
            entries: vec![Pte::empty(); MAX_PT_LEN],
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn entry(&self, index: usize) -> Pte {
        self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut Pte {
        &mut self.entries[index]
    }

    pub fn set(&mut self, index: usize, pte: Pte) {
        self.entries[index] = pte;
    }

    /// Count of live (valid) mappings.
    pub fn valid_count(&self) -> usize {
        self.entries.iter().filter(|e| e.valid()).count()
    }

    /// Count of pages currently resident in a swap file.
    pub fn swapped_count(&self) -> usize {
        self.entries.iter().filter(|e| e.swap() && !e.valid()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pte> {
        self.entries.iter()
    }
}
