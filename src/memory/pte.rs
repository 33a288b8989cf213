//! The packed page-table entry.
//!
//! One 32-bit word per entry, laid out to match the simulator's MMU:
//!
//! ```text
//! bit  0      valid
//! bits 1..4   prot (R=1, W=2, X=4)
//! bit  4      cow   (frame shared with another table)
//! bit  5      swap  (contents live in a swap file)
//! bits 6..8   reserved
//! bits 8..32  pfn   (physical frame number, valid mappings only)
//! ```

use bit_field::BitField;

use super::Prot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(u32);

impl Pte {
    /// An all-zero entry: invalid, unprotected, unswapped.
    pub fn empty() -> Self {
        Pte(0)
    }

    /// A fresh valid mapping of `pfn` with protection `prot`.
    pub fn mapping(pfn: u32, prot: Prot) -> Self {
        let mut pte = Pte(0);
        pte.set_valid(true);
        pte.set_prot(prot);
        pte.set_pfn(pfn);
        pte
    }

    pub fn valid(self) -> bool {
        self.0.get_bit(0)
    }

    pub fn set_valid(&mut self, v: bool) {
        self.0.set_bit(0, v);
    }

    pub fn prot(self) -> Prot {
        Prot::from_bits_truncate(self.0.get_bits(1..4) as u8)
    }

    pub fn set_prot(&mut self, prot: Prot) {
        self.0.set_bits(1..4, prot.bits() as u32);
    }

    pub fn cow(self) -> bool {
        self.0.get_bit(4)
    }

    pub fn set_cow(&mut self, v: bool) {
        self.0.set_bit(4, v);
    }

    pub fn swap(self) -> bool {
        self.0.get_bit(5)
    }

    pub fn set_swap(&mut self, v: bool) {
        self.0.set_bit(5, v);
    }

    pub fn pfn(self) -> u32 {
        self.0.get_bits(8..32)
    }

    pub fn set_pfn(&mut self, pfn: u32) {
        self.0.set_bits(8..32, pfn);
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Raw word, as the MMU would see it.
    pub fn raw(self) -> u32 {
        self.0
    }
}
