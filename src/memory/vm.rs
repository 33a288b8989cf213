//! Kernel access to virtual memory.
//!
//! The simulator addresses physical frames only, so every kernel touch of
//! a virtual address — user buffers, the loader writing segments, the
//! scratch copy window — translates through a page table here, page by
//! page.

use crate::hardware::{Machine, MAX_PT_LEN, PAGE_SIZE};
use crate::memory::PageTable;
use crate::{KernelError, Result};

/// Translate one virtual address through `table` to `(pfn, offset)`.
/// Fails on out-of-region addresses and invalid mappings.
pub fn translate(table: &PageTable, addr: u64) -> Result<(u32, usize)> {
    let region = table.region();
    let base = region.base();
    let limit = base + (MAX_PT_LEN * PAGE_SIZE) as u64;
    if addr < base || addr >= limit {
        return Err(KernelError::Fault);
    }
    let index = region.page_index(addr);
    let pte = table.entry(index);
    if !pte.valid() {
        return Err(KernelError::Fault);
    }
    Ok((pte.pfn(), (addr as usize) & (PAGE_SIZE - 1)))
}

/// Copy bytes out of virtual memory into `buf`.
pub fn read_bytes<M: Machine>(
    machine: &M,
    table: &PageTable,
    mut addr: u64,
    mut buf: &mut [u8],
) -> Result<()> {
    while !buf.is_empty() {
        let (pfn, offset) = translate(table, addr)?;
        let chunk = buf.len().min(PAGE_SIZE - offset);
        let (head, tail) = buf.split_at_mut(chunk);
        machine.read_frame(pfn, offset, head);
        buf = tail;
        addr += chunk as u64;
    }
    Ok(())
}

/// Copy `data` into virtual memory.
pub fn write_bytes<M: Machine>(
    machine: &mut M,
    table: &PageTable,
    mut addr: u64,
    mut data: &[u8],
) -> Result<()> {
    while !data.is_empty() {
        let (pfn, offset) = translate(table, addr)?;
        let chunk = data.len().min(PAGE_SIZE - offset);
        machine.write_frame(pfn, offset, &data[..chunk]);
        data = &data[chunk..];
        addr += chunk as u64;
    }
    Ok(())
}

/// Zero-fill `len` bytes of virtual memory.
pub fn write_zeros<M: Machine>(
    machine: &mut M,
    table: &PageTable,
    mut addr: u64,
    mut len: usize,
) -> Result<()> {
    let zeros = [0u8; PAGE_SIZE];
    while len > 0 {
        let (pfn, offset) = translate(table, addr)?;
        let chunk = len.min(PAGE_SIZE - offset);
        machine.write_frame(pfn, offset, &zeros[..chunk]);
        len -= chunk;
        addr += chunk as u64;
    }
    Ok(())
}

/// Read a little-endian u64 from virtual memory.
pub fn read_u64<M: Machine>(machine: &M, table: &PageTable, addr: u64) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_bytes(machine, table, addr, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Write a little-endian u64 into virtual memory.
pub fn write_u64<M: Machine>(
    machine: &mut M,
    table: &PageTable,
    addr: u64,
    value: u64,
) -> Result<()> {
    write_bytes(machine, table, addr, &value.to_le_bytes())
}

/// Read a NUL-terminated string, refusing anything longer than `max`.
pub fn read_cstr<M: Machine>(
    machine: &M,
    table: &PageTable,
    mut addr: u64,
    max: usize,
) -> Result<String> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    while out.len() < max {
        read_bytes(machine, table, addr, &mut byte)?;
        if byte[0] == 0 {
            return String::from_utf8(out).map_err(|_| KernelError::BadArgument);
        }
        out.push(byte[0]);
        addr += 1;
    }
    Err(KernelError::BadArgument)
}
