// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-connection GPU address space: a 48-bit virtual range translated by a
//! four-level radix page table. Mutated only on the owning connection's
//! thread; the device thread reaches it indirectly through the address
//! manager's locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::hal::{DevicePageAllocator, MappedBuffer};
use crate::regs::{TRANSTAB_ADRMODE_TABLE, TRANSTAB_READ_INNER, MEMATTR_DEFAULT};

use super::page_table::PageTable;
use super::{
    MapError, PteFlags, ENTRY_ACCESS_BIT, ENTRY_ATE, ENTRY_TYPE_MASK, PAGE_SHIFT, PAGE_SIZE,
    PTE_ADDRESS_MASK, PT_ENTRIES, PT_LEVELS, VA_BITS,
};

struct SpaceInner {
    root: PageTable,
    /// Subtrees detached by GC, awaiting reclamation once the hardware
    /// walker is known to be quiesced.
    stale: Vec<Box<PageTable>>,
}

/// One connection's GPU page table plus the bits of state the slot
/// arbitration layer needs (root address, lost flag).
pub struct AddressSpace {
    inner: Mutex<SpaceInner>,
    allocator: Arc<dyn DevicePageAllocator>,
    root_bus_address: u64,
    lost: AtomicBool,
}

impl AddressSpace {
    /// Creates an empty address space with a fresh root table.
    pub fn new(allocator: Arc<dyn DevicePageAllocator>) -> Result<Self, MapError> {
        let root = PageTable::new(PT_LEVELS - 1, allocator.as_ref())?;
        let root_bus_address = root.bus_address();
        Ok(Self {
            inner: Mutex::new(SpaceInner {
                root,
                stale: Vec::new(),
            }),
            allocator,
            root_bus_address,
            lost: AtomicBool::new(false),
        })
    }

    /// Maps `length` bytes of `buffer` starting at `offset` to GPU virtual
    /// address `addr`. All three must be page aligned, and the target range
    /// must fit the 48-bit span. Touched leaf spans receive a single
    /// cache-clean each; whole pages are never flushed.
    pub fn insert(
        &self,
        addr: u64,
        buffer: &dyn MappedBuffer,
        offset: u64,
        length: u64,
        flags: PteFlags,
    ) -> Result<(), MapError> {
        check_aligned(addr, offset, length)?;
        check_range(addr, length)?;
        if length == 0 {
            return Ok(());
        }
        let page_count = length >> PAGE_SHIFT;
        let bus = buffer
            .bus_page_addresses(offset >> PAGE_SHIFT, page_count)
            .ok_or(MapError::PageResolveFailed)?;
        if bus.len() as u64 != page_count {
            return Err(MapError::PageResolveFailed);
        }

        let mut inner = self.inner.lock();
        let mut page_index = addr >> PAGE_SHIFT;
        let mut next_bus = bus.iter();
        let mut remaining = page_count;
        while remaining > 0 {
            let first = (page_index & (PT_ENTRIES as u64 - 1)) as usize;
            let in_table = remaining.min((PT_ENTRIES - first) as u64);
            let entries: Vec<u64> = next_bus
                .by_ref()
                .take(in_table as usize)
                .map(|phys| {
                    (phys & PTE_ADDRESS_MASK) | flags.bits() | ENTRY_ACCESS_BIT | ENTRY_ATE
                })
                .collect();
            let leaf = inner
                .root
                .leaf_table_mut(page_index, self.allocator.as_ref(), true)?
                .ok_or(MapError::PageTableAlloc)?;
            leaf.write_leaf_entries(first, &entries);
            page_index += in_table;
            remaining -= in_table;
        }
        log::debug!(
            target: "mm",
            "mapped {:#x}..{:#x} ({} pages)",
            addr,
            addr + length,
            page_count
        );
        Ok(())
    }

    /// Invalidates every leaf entry covering `start..start + length`, then
    /// garbage-collects nodes emptied by the operation. Detached subtrees
    /// stay queued until [`AddressSpace::release_stale_tables`]; the caller
    /// must first make sure the MMU is not walking the stale range.
    pub fn clear(&self, start: u64, length: u64) -> Result<(), MapError> {
        check_aligned(start, 0, length)?;
        check_range(start, length)?;
        if length == 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let SpaceInner { root, stale } = &mut *inner;
        root.clear_pages(
            start >> PAGE_SHIFT,
            (start + length) >> PAGE_SHIFT,
            stale,
        );
        log::debug!(
            target: "mm",
            "cleared {:#x}..{:#x}, {} stale table(s) pending",
            start,
            start + length,
            stale.len()
        );
        Ok(())
    }

    /// Reclaims subtrees detached by earlier `clear` calls.
    pub fn release_stale_tables(&self) {
        self.inner.lock().stale.clear();
    }

    /// Number of detached subtrees awaiting reclamation.
    pub fn stale_table_count(&self) -> usize {
        self.inner.lock().stale.len()
    }

    /// PTE inspection path: the raw leaf entry mapped at `addr`, if valid.
    pub fn lookup_pte(&self, addr: u64) -> Option<u64> {
        if addr % PAGE_SIZE != 0 || addr >= 1 << VA_BITS {
            return None;
        }
        let entry = self.inner.lock().root.lookup(addr >> PAGE_SHIFT)?;
        (entry & ENTRY_TYPE_MASK == ENTRY_ATE).then_some(entry)
    }

    /// Value for the hardware translation-table-base register: the root
    /// node's bus address OR'd with the fixed addressing-mode bits.
    pub fn translation_table_entry(&self) -> u64 {
        self.root_bus_address | TRANSTAB_ADRMODE_TABLE | TRANSTAB_READ_INNER
    }

    /// Value for the hardware memory-attributes register.
    pub fn memory_attributes(&self) -> u64 {
        MEMATTR_DEFAULT
    }

    /// Marks the space unusable after an unrecoverable fault; the slot
    /// arbitration layer refuses to schedule against a lost space.
    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Total page-table nodes currently owned, root included.
    pub fn page_table_node_count(&self) -> usize {
        self.inner.lock().root.node_count()
    }
}

fn check_aligned(addr: u64, offset: u64, length: u64) -> Result<(), MapError> {
    if addr % PAGE_SIZE != 0 || offset % PAGE_SIZE != 0 || length % PAGE_SIZE != 0 {
        return Err(MapError::Unaligned);
    }
    Ok(())
}

fn check_range(addr: u64, length: u64) -> Result<(), MapError> {
    match addr.checked_add(length) {
        Some(end) if end <= 1 << VA_BITS => Ok(()),
        _ => Err(MapError::OutOfRange),
    }
}
