// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory stand-ins for the hardware-facing traits, shared by the unit
//! tests across modules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::hal::{DevicePage, DevicePageAllocator, MappedBuffer, PageAllocError, RegisterIo};
use crate::mm::{PAGE_SIZE, PT_ENTRIES};

/// Register window backed by a map. Reads of never-written registers return
/// zero, which conveniently reads as "idle" for every status register the
/// core polls. Every write is recorded for assertions.
pub(crate) struct TestRegisterIo {
    state: Mutex<HashMap<u32, u32>>,
    writes: Mutex<Vec<(u32, u32)>>,
}

impl TestRegisterIo {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// All writes since construction or the last [`clear_writes`], in order.
    ///
    /// [`clear_writes`]: Self::clear_writes
    pub(crate) fn writes(&self) -> Vec<(u32, u32)> {
        self.writes.lock().clone()
    }

    pub(crate) fn clear_writes(&self) {
        self.writes.lock().clear();
    }
}

impl RegisterIo for TestRegisterIo {
    fn read32(&self, offset: u32) -> u32 {
        self.state.lock().get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: u32, value: u32) {
        self.state.lock().insert(offset, value);
        self.writes.lock().push((offset, value));
    }
}

pub(crate) struct TestPage {
    bus_address: u64,
    entries: Vec<u64>,
    clean_log: Arc<Mutex<Vec<(u64, usize, usize)>>>,
    live: Arc<AtomicUsize>,
}

impl DevicePage for TestPage {
    fn bus_address(&self) -> u64 {
        self.bus_address
    }

    fn read_entry(&self, index: usize) -> u64 {
        self.entries[index]
    }

    fn write_entry(&mut self, index: usize, value: u64) {
        self.entries[index] = value;
    }

    fn clean_range(&mut self, offset: usize, length: usize) {
        assert!(offset + length <= PAGE_SIZE as usize);
        self.clean_log.lock().push((self.bus_address, offset, length));
    }
}

impl Drop for TestPage {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Hands out fake device pages at ascending nonzero bus addresses and keeps
/// a count of pages still alive plus a log of cache-clean calls.
pub(crate) struct TestPageAllocator {
    next_bus_address: AtomicUsize,
    live: Arc<AtomicUsize>,
    clean_log: Arc<Mutex<Vec<(u64, usize, usize)>>>,
}

impl TestPageAllocator {
    const BUS_BASE: usize = 0x1000_0000;

    pub(crate) fn new() -> Self {
        Self {
            next_bus_address: AtomicUsize::new(Self::BUS_BASE),
            live: Arc::new(AtomicUsize::new(0)),
            clean_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Pages allocated and not yet dropped.
    pub(crate) fn live_pages(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Recorded `(bus_address, offset, length)` clean calls, in order.
    pub(crate) fn clean_log(&self) -> Vec<(u64, usize, usize)> {
        self.clean_log.lock().clone()
    }

    pub(crate) fn clear_clean_log(&self) {
        self.clean_log.lock().clear();
    }
}

impl DevicePageAllocator for TestPageAllocator {
    fn alloc_page(&self) -> Result<Box<dyn DevicePage>, PageAllocError> {
        let bus_address = self
            .next_bus_address
            .fetch_add(PAGE_SIZE as usize, Ordering::Relaxed) as u64;
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(TestPage {
            bus_address,
            entries: vec![0; PT_ENTRIES],
            clean_log: self.clean_log.clone(),
            live: self.live.clone(),
        }))
    }
}

/// Pinned buffer whose pages sit contiguously at a fixed bus address.
pub(crate) struct TestBuffer {
    bus_base: u64,
    size: u64,
}

impl TestBuffer {
    pub(crate) fn new(bus_base: u64, size: u64) -> Self {
        Self { bus_base, size }
    }
}

impl MappedBuffer for TestBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn bus_page_addresses(&self, start_page: u64, page_count: u64) -> Option<Vec<u64>> {
        let end = start_page.checked_add(page_count)?;
        if end * PAGE_SIZE > self.size {
            return None;
        }
        Some(
            (start_page..end)
                .map(|page| self.bus_base + page * PAGE_SIZE)
                .collect(),
        )
    }
}
