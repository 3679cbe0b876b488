// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Collaborator contracts at the edge of the driver core.
//!
//! The core treats hardware registers, device-visible memory, and client
//! buffers as opaque capabilities provided by the surrounding driver. These
//! traits are the whole of that boundary; everything behind them (bus
//! programming, pinning, cache maintenance implementation) is out of scope.

use thiserror::Error;

/// Synchronous 32-bit register window. Writes are visible once the call
/// returns; no other bus-latency assumptions are made.
pub trait RegisterIo: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// Allocation of a device-visible page failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("device-visible page allocation failed")]
pub struct PageAllocError;

/// One pinned, device-visible page holding 512 page-table entries, with a
/// CPU-side view for writing them and a cache-clean primitive over a byte
/// range within the page.
pub trait DevicePage: Send {
    /// Bus address the MMU uses to reach this page.
    fn bus_address(&self) -> u64;

    /// Reads the entry at `index` (0..512).
    fn read_entry(&self, index: usize) -> u64;

    /// Writes the entry at `index`; not visible to the device until the
    /// covering span has been cleaned.
    fn write_entry(&mut self, index: usize, value: u64);

    /// Cleans (writes back) the byte range `offset..offset + length` so the
    /// device observes prior entry writes.
    fn clean_range(&mut self, offset: usize, length: usize);
}

/// Allocates pinned device-visible pages for page-table nodes.
pub trait DevicePageAllocator: Send + Sync {
    fn alloc_page(&self) -> Result<Box<dyn DevicePage>, PageAllocError>;
}

/// A client buffer whose pages are pinned and bus-addressable.
pub trait MappedBuffer {
    /// Total size of the buffer in bytes.
    fn size(&self) -> u64;

    /// Resolves bus addresses for `page_count` pages starting at page index
    /// `start_page` within the buffer, or `None` if the range is not pinned.
    fn bus_page_addresses(&self, start_page: u64, page_count: u64) -> Option<Vec<u64>>;
}
