// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! MMU address-space register window.
//!
//! Each hardware address slot owns one register block of `MMU_AS_STRIDE`
//! bytes starting at `MMU_AS_BASE`. The block is programmed only through
//! [`AsRegisters`], which an [`crate::mmu::AddressManager`] keeps behind that
//! slot's hardware lock.

use std::hint::spin_loop;
use std::time::{Duration, Instant};

use crate::hal::RegisterIo;
use crate::mm::PAGE_SIZE;

/// Base offset of the per-slot address-space register blocks.
pub const MMU_AS_BASE: u32 = 0x2400;
/// Stride between consecutive slot register blocks.
pub const MMU_AS_STRIDE: u32 = 0x40;

// Offsets within one address-space block.
pub const AS_TRANSTAB_LO: u32 = 0x00;
pub const AS_TRANSTAB_HI: u32 = 0x04;
pub const AS_MEMATTR_LO: u32 = 0x08;
pub const AS_MEMATTR_HI: u32 = 0x0c;
pub const AS_LOCKADDR_LO: u32 = 0x10;
pub const AS_LOCKADDR_HI: u32 = 0x14;
pub const AS_COMMAND: u32 = 0x18;
pub const AS_FAULTSTATUS: u32 = 0x1c;
pub const AS_FAULTADDRESS_LO: u32 = 0x20;
pub const AS_FAULTADDRESS_HI: u32 = 0x24;
pub const AS_STATUS: u32 = 0x28;

// AS_COMMAND values.
pub const AS_COMMAND_NOP: u32 = 0;
pub const AS_COMMAND_UPDATE: u32 = 1;
pub const AS_COMMAND_LOCK: u32 = 2;
pub const AS_COMMAND_UNLOCK: u32 = 3;
pub const AS_COMMAND_FLUSH_PT: u32 = 4;
pub const AS_COMMAND_FLUSH_MEM: u32 = 5;

/// AS_STATUS bit set while a translation command is in flight.
pub const AS_STATUS_ACTIVE: u32 = 1 << 0;

/// Addressing-mode bits OR'd into the translation-table-base value.
pub const TRANSTAB_ADRMODE_UNMAPPED: u64 = 0;
pub const TRANSTAB_ADRMODE_TABLE: u64 = 3;
pub const TRANSTAB_READ_INNER: u64 = 1 << 2;

/// MEMATTR register value: one attribute byte per index, write-alloc
/// inner-cacheable for every slot the driver uses.
pub const MEMATTR_DEFAULT: u64 = 0x8848_8848_8848_8848;

/// Bound on the MMU idle busy-poll. Exceeding it is logged, not escalated.
const MMU_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Register block for one hardware address slot.
///
/// Owned by the slot's hardware mutex in the address manager, so holding
/// `&mut AsRegisters`/`&AsRegisters` out of that mutex is what "holding the
/// hardware slot lock" means.
pub(crate) struct AsRegisters {
    slot: usize,
    base: u32,
}

impl AsRegisters {
    pub(crate) fn new(slot: usize) -> Self {
        Self {
            slot,
            base: MMU_AS_BASE + slot as u32 * MMU_AS_STRIDE,
        }
    }

    fn write64(&self, io: &dyn RegisterIo, offset: u32, value: u64) {
        io.write32(self.base + offset, value as u32);
        io.write32(self.base + offset + 4, (value >> 32) as u32);
    }

    fn command(&self, io: &dyn RegisterIo, command: u32) {
        io.write32(self.base + AS_COMMAND, command);
    }

    /// Programs the slot with a new translation table and memory attributes.
    /// The previous resident space is invalidated first.
    pub(crate) fn assign(&self, io: &dyn RegisterIo, translation_table_entry: u64, memattr: u64) {
        self.invalidate(io);
        self.write64(io, AS_TRANSTAB_LO, translation_table_entry);
        self.write64(io, AS_MEMATTR_LO, memattr);
        self.command(io, AS_COMMAND_UPDATE);
        self.wait_for_idle(io);
    }

    /// Points the slot at no translation table.
    pub(crate) fn invalidate(&self, io: &dyn RegisterIo) {
        self.write64(io, AS_TRANSTAB_LO, TRANSTAB_ADRMODE_UNMAPPED);
        self.command(io, AS_COMMAND_UPDATE);
        self.wait_for_idle(io);
    }

    /// Locks the covering hardware region, flushes stale translations for it,
    /// then unlocks, waiting for MMU idle between each step.
    pub(crate) fn flush_range(&self, io: &dyn RegisterIo, start: u64, length: u64) {
        self.write64(io, AS_LOCKADDR_LO, region_encode(start, length));
        self.command(io, AS_COMMAND_LOCK);
        self.wait_for_idle(io);
        self.command(io, AS_COMMAND_FLUSH_PT);
        self.wait_for_idle(io);
        self.command(io, AS_COMMAND_UNLOCK);
        self.wait_for_idle(io);
    }

    /// Busy-polls AS_STATUS until the active bit clears. A timeout leaves the
    /// hardware state possibly inconsistent; the caller proceeds regardless.
    pub(crate) fn wait_for_idle(&self, io: &dyn RegisterIo) {
        let deadline = Instant::now() + MMU_IDLE_TIMEOUT;
        while io.read32(self.base + AS_STATUS) & AS_STATUS_ACTIVE != 0 {
            if Instant::now() >= deadline {
                log::warn!(
                    target: "mmu",
                    "address slot {} MMU not idle after {:?}; continuing",
                    self.slot,
                    MMU_IDLE_TIMEOUT
                );
                return;
            }
            spin_loop();
        }
    }
}

/// Encodes a lock region as `aligned base | log2(size in bytes)`, the format
/// the LOCKADDR register expects. The region is widened to the smallest
/// page-aligned power of two covering `start..start + length`.
fn region_encode(start: u64, length: u64) -> u64 {
    let mut size = length.max(PAGE_SIZE).next_power_of_two();
    // Widen until the aligned-down base covers the whole range.
    while (start & !(size - 1)) + size < start + length {
        size <<= 1;
    }
    let base = start & !(size - 1);
    base | u64::from(size.trailing_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_encode_single_page() {
        let encoded = region_encode(0x5000, PAGE_SIZE);
        assert_eq!(encoded & 0x3f, 12);
        assert_eq!(encoded & !0x3f, 0x5000);
    }

    #[test]
    fn region_encode_widens_to_cover_range() {
        // 8 pages starting off a power-of-two boundary need a 64 KiB region.
        let encoded = region_encode(0x7000, 8 * PAGE_SIZE);
        let log2 = encoded & 0x3f;
        let base = encoded & !0x3f;
        assert_eq!(log2, 16);
        assert_eq!(base, 0);
        assert!(base + (1 << log2) >= 0x7000 + 8 * PAGE_SIZE);
    }

    #[test]
    fn region_encode_base_is_aligned() {
        let encoded = region_encode(0x12000, 3 * PAGE_SIZE);
        let log2 = encoded & 0x3f;
        let base = encoded & !0x3f;
        assert_eq!(base % (1 << log2), 0);
        assert!(base <= 0x12000);
        assert!(base + (1 << log2) >= 0x12000 + 3 * PAGE_SIZE);
    }
}
