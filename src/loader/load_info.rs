//! The simulator's native executable format.
//!
//! A fixed 64-byte header followed by the text pages and then the
//! initialized-data pages, both page-aligned in memory but packed
//! back-to-back in the file:
//!
//! ```text
//! magic      [u8; 4]   "FEX1"
//! (pad)      u32
//! entry      u64       program counter to start at (region 1)
//! t_vaddr    u64       text load address
//! id_vaddr   u64       initialized-data load address
//! t_npg      u32       text pages
//! id_npg     u32       initialized-data pages
//! ud_npg     u32       uninitialized-data (bss) pages
//! (pad)      u32
//! ```

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::hardware::PAGE_SIZE;
use crate::{KernelError, Result};

pub const IMAGE_MAGIC: [u8; 4] = *b"FEX1";
pub const HEADER_SIZE: u64 = 64;

/// Parsed executable header plus the segment file offsets.
#[derive(Debug, Clone, Copy)]
pub struct LoadInfo {
    pub entry: u64,
    pub t_vaddr: u64,
    pub id_vaddr: u64,
    pub t_npg: usize,
    pub id_npg: usize,
    pub ud_npg: usize,
    pub t_faddr: u64,
    pub id_faddr: u64,
}

impl LoadInfo {
    /// Read and validate the header of an open executable.
    pub fn read(file: &mut File) -> Result<LoadInfo> {
        let mut header = [0u8; HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        if header[0..4] != IMAGE_MAGIC {
            return Err(KernelError::BadArgument);
        }
        let u64_at = |o: usize| u64::from_le_bytes(header[o..o + 8].try_into().unwrap());
        let u32_at = |o: usize| u32::from_le_bytes(header[o..o + 4].try_into().unwrap());

        let t_npg = u32_at(32) as usize;
        Ok(LoadInfo {
            entry: u64_at(8),
            t_vaddr: u64_at(16),
            id_vaddr: u64_at(24),
            t_npg,
            id_npg: u32_at(36) as usize,
            ud_npg: u32_at(40) as usize,
            t_faddr: HEADER_SIZE,
            id_faddr: HEADER_SIZE + (t_npg * PAGE_SIZE) as u64,
        })
    }
}

/// Write an executable image. Text and data are padded out to whole
/// pages. Used by the demo binary and the test suite in place of a real
/// toolchain.
pub fn build_image(
    path: &Path,
    entry: u64,
    t_vaddr: u64,
    text: &[u8],
    id_vaddr: u64,
    data: &[u8],
    ud_npg: usize,
) -> Result<()> {
    let t_npg = pages_for(text.len());
    let id_npg = pages_for(data.len());

    let mut header = [0u8; HEADER_SIZE as usize];
    header[0..4].copy_from_slice(&IMAGE_MAGIC);
    header[8..16].copy_from_slice(&entry.to_le_bytes());
    header[16..24].copy_from_slice(&t_vaddr.to_le_bytes());
    header[24..32].copy_from_slice(&id_vaddr.to_le_bytes());
    header[32..36].copy_from_slice(&(t_npg as u32).to_le_bytes());
    header[36..40].copy_from_slice(&(id_npg as u32).to_le_bytes());
    header[40..44].copy_from_slice(&(ud_npg as u32).to_le_bytes());

    let mut file = File::create(path)?;
    file.write_all(&header)?;
    write_padded(&mut file, text, t_npg)?;
    write_padded(&mut file, data, id_npg)?;
    Ok(())
}

fn pages_for(bytes: usize) -> usize {
    ((bytes + PAGE_SIZE - 1) / PAGE_SIZE).max(1)
}

fn write_padded(file: &mut File, bytes: &[u8], npg: usize) -> Result<()> {
    file.write_all(bytes)?;
    let pad = npg * PAGE_SIZE - bytes.len();
    file.write_all(&vec![0u8; pad])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::VMEM_1_BASE;

    #[test]
    fn header_round_trip() {
        let dir = std::env::temp_dir().join("ferrite_loadinfo_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("img");
        build_image(&path, VMEM_1_BASE + 8, VMEM_1_BASE, b"code", VMEM_1_BASE + 0x2000, b"data", 2)
            .unwrap();

        let mut f = File::open(&path).unwrap();
        let li = LoadInfo::read(&mut f).unwrap();
        assert_eq!(li.entry, VMEM_1_BASE + 8);
        assert_eq!(li.t_npg, 1);
        assert_eq!(li.id_npg, 1);
        assert_eq!(li.ud_npg, 2);
        assert_eq!(li.t_faddr, HEADER_SIZE);
        assert_eq!(li.id_faddr, HEADER_SIZE + PAGE_SIZE as u64);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = std::env::temp_dir().join("ferrite_loadinfo_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bogus");
        std::fs::write(&path, vec![0u8; 128]).unwrap();
        let mut f = File::open(&path).unwrap();
        assert!(LoadInfo::read(&mut f).is_err());
    }
}
