// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory primitives for the GPU MMU: page-table geometry, entry
//! encoding, and the per-connection address space built on top of them.

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::hal::PageAllocError;

pub mod address_space;
pub mod gpu_mapping;
pub mod page_table;

/// Number of bits in a page offset.
pub const PAGE_SHIFT: usize = 12;
/// Size of a GPU page in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// Index bits consumed per page-table level.
pub const LEVEL_BITS: usize = 9;
/// Entries per page-table node.
pub const PT_ENTRIES: usize = 1 << LEVEL_BITS;
/// Levels in the radix tree; level 0 holds the leaves.
pub const PT_LEVELS: usize = 4;
/// Width of the GPU virtual address space.
pub const VA_BITS: usize = 48;

// The tree must tile the virtual address space exactly.
const_assert_eq!(PT_LEVELS * LEVEL_BITS + PAGE_SHIFT, VA_BITS);

/// Bytes per page-table entry.
pub(crate) const PTE_SIZE: usize = 8;

// Entry type tag in bits [1:0].
pub(crate) const ENTRY_TYPE_MASK: u64 = 0b11;
/// Leaf address-translation entry.
pub(crate) const ENTRY_ATE: u64 = 0b01;
/// Explicitly invalid entry; fresh tables are filled with this.
pub(crate) const ENTRY_INVALID: u64 = 0b10;
/// Pointer to the next page-table level.
pub(crate) const ENTRY_TABLE: u64 = 0b11;
/// Access bit set on every installed leaf entry.
pub(crate) const ENTRY_ACCESS_BIT: u64 = 1 << 10;

/// Output-address field of a leaf entry: bits [47:12].
pub const PTE_ADDRESS_MASK: u64 = ((1 << VA_BITS) - 1) & !(PAGE_SIZE - 1);

bitflags! {
    /// Access flags OR'd into leaf page-table entries.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const READ = 1 << 6;
        const WRITE = 1 << 7;
        const SHARE_OUTER = 2 << 8;
        const SHARE_INNER = 3 << 8;
        const NO_EXECUTE = 1 << 54;
    }
}

/// Errors reported by address-space mapping operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MapError {
    /// Address, offset, or length was not page aligned.
    #[error("address or length not page aligned")]
    Unaligned,
    /// Range does not fit the 48-bit virtual span.
    #[error("range exceeds the virtual address span")]
    OutOfRange,
    /// The backing buffer could not resolve bus addresses for the range.
    #[error("bus address resolution failed")]
    PageResolveFailed,
    /// A page-table node could not be allocated.
    #[error("page table allocation failed")]
    PageTableAlloc,
    /// The GPU virtual range collides with an existing mapping.
    #[error("range overlaps an existing mapping")]
    Overlap,
    /// No mapping exists at the given GPU virtual address.
    #[error("no mapping at this address")]
    NotMapped,
}

impl From<PageAllocError> for MapError {
    fn from(_: PageAllocError) -> Self {
        MapError::PageTableAlloc
    }
}

/// Splits a raw leaf entry into its output address and access flags.
pub fn decode_pte(pte: u64) -> (u64, PteFlags) {
    (pte & PTE_ADDRESS_MASK, PteFlags::from_bits_truncate(pte))
}
