// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Radix page table with lazy allocation of intermediate levels and
//! bottom-up garbage collection of emptied nodes.

use crate::hal::{DevicePage, DevicePageAllocator};

use super::{
    MapError, ENTRY_ATE, ENTRY_INVALID, ENTRY_TABLE, ENTRY_TYPE_MASK, LEVEL_BITS, PTE_SIZE,
    PT_ENTRIES,
};

/// One node of the tree, backed by a page of device-visible memory.
///
/// A non-leaf entry is either invalid or points at exactly one owned child;
/// a leaf entry is either invalid or an address-translation entry.
/// `valid_count` mirrors the number of valid entries so a parent can observe
/// "all entries invalid" without rescanning the page.
pub(crate) struct PageTable {
    level: usize,
    page: Box<dyn DevicePage>,
    children: Vec<Option<Box<PageTable>>>,
    valid_count: usize,
}

/// Index into a level's entries for a page index (virtual address >> 12).
fn entry_index(level: usize, page_index: u64) -> usize {
    ((page_index >> (LEVEL_BITS * level)) & (PT_ENTRIES as u64 - 1)) as usize
}

impl PageTable {
    /// Allocates a node at `level` with every entry marked invalid.
    pub(crate) fn new(
        level: usize,
        allocator: &dyn DevicePageAllocator,
    ) -> Result<Self, MapError> {
        let mut page = allocator.alloc_page()?;
        for i in 0..PT_ENTRIES {
            page.write_entry(i, ENTRY_INVALID);
        }
        page.clean_range(0, PT_ENTRIES * PTE_SIZE);
        let children = if level == 0 {
            Vec::new()
        } else {
            (0..PT_ENTRIES).map(|_| None).collect()
        };
        Ok(Self {
            level,
            page,
            children,
            valid_count: 0,
        })
    }

    pub(crate) fn bus_address(&self) -> u64 {
        self.page.bus_address()
    }

    /// Walks down to the level-0 node covering `page_index`, creating
    /// interior nodes on the way when `create` is set. Returns `None` only
    /// when not creating and a level is missing.
    pub(crate) fn leaf_table_mut(
        &mut self,
        page_index: u64,
        allocator: &dyn DevicePageAllocator,
        create: bool,
    ) -> Result<Option<&mut PageTable>, MapError> {
        let mut table = self;
        loop {
            if table.level == 0 {
                return Ok(Some(table));
            }
            let idx = entry_index(table.level, page_index);
            if table.children[idx].is_none() {
                if !create {
                    return Ok(None);
                }
                let child = PageTable::new(table.level - 1, allocator)?;
                let entry = child.bus_address() | ENTRY_TABLE;
                table.page.write_entry(idx, entry);
                table.page.clean_range(idx * PTE_SIZE, PTE_SIZE);
                table.valid_count += 1;
                table.children[idx] = Some(Box::new(child));
            }
            match table.children[idx].as_deref_mut() {
                Some(child) => table = child,
                None => return Ok(None),
            }
        }
    }

    /// Writes `entries` into this level-0 node starting at `first_index`,
    /// then cleans exactly the touched span.
    pub(crate) fn write_leaf_entries(&mut self, first_index: usize, entries: &[u64]) {
        debug_assert_eq!(self.level, 0);
        debug_assert!(first_index + entries.len() <= PT_ENTRIES);
        for (i, entry) in entries.iter().enumerate() {
            let idx = first_index + i;
            if self.page.read_entry(idx) & ENTRY_TYPE_MASK != ENTRY_ATE {
                self.valid_count += 1;
            }
            self.page.write_entry(idx, *entry);
        }
        self.page.clean_range(first_index * PTE_SIZE, entries.len() * PTE_SIZE);
    }

    /// Reads the raw leaf entry for `page_index`, walking without creating.
    pub(crate) fn lookup(&self, page_index: u64) -> Option<u64> {
        let mut table = self;
        while table.level > 0 {
            let idx = entry_index(table.level, page_index);
            table = table.children[idx].as_deref()?;
        }
        Some(table.page.read_entry(entry_index(0, page_index)))
    }

    /// Invalidates every leaf entry in `start..end` (page indices), then
    /// collapses nodes left without a single valid entry. Detached subtrees
    /// are pushed onto `stale` for deferred reclamation; the node this is
    /// called on (the root) is never detached.
    pub(crate) fn clear_pages(
        &mut self,
        start: u64,
        end: u64,
        stale: &mut Vec<Box<PageTable>>,
    ) {
        if self.level == 0 {
            let first = entry_index(0, start);
            let count = (end - start) as usize;
            for i in 0..count {
                let idx = first + i;
                if self.page.read_entry(idx) & ENTRY_TYPE_MASK == ENTRY_ATE {
                    self.valid_count -= 1;
                }
                self.page.write_entry(idx, ENTRY_INVALID);
            }
            self.page.clean_range(first * PTE_SIZE, count * PTE_SIZE);
            return;
        }

        let child_span = 1u64 << (LEVEL_BITS * self.level);
        let mut page = start;
        while page < end {
            let idx = entry_index(self.level, page);
            let boundary = (page & !(child_span - 1)) + child_span;
            let child_end = boundary.min(end);
            if let Some(child) = self.children[idx].as_deref_mut() {
                child.clear_pages(page, child_end, stale);
                if child.valid_count == 0 {
                    // Invalidate the pointer before structurally detaching.
                    self.page.write_entry(idx, ENTRY_INVALID);
                    self.page.clean_range(idx * PTE_SIZE, PTE_SIZE);
                    self.valid_count -= 1;
                    if let Some(dead) = self.children[idx].take() {
                        stale.push(dead);
                    }
                }
            }
            page = child_end;
        }
    }

    /// Number of nodes in this subtree, including this one.
    pub(crate) fn node_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .flatten()
            .map(|child| child.node_count())
            .sum::<usize>()
    }
}
