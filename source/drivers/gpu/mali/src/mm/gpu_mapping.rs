// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bookkeeping record for one buffer range mapped into a GPU address space.
//! The buffer itself is only consulted while the mapping is installed; the
//! record keeps an index-based back-reference instead of a pointer.

use crate::types::BufferId;

use super::{PteFlags, PAGE_SHIFT};

/// One installed mapping: where it lives in the GPU virtual space, which
/// part of which buffer backs it, and the access flags it was installed with.
#[derive(Clone, Debug)]
pub struct GpuMapping {
    gpu_va: u64,
    page_offset: u64,
    length: u64,
    buffer_id: BufferId,
    flags: PteFlags,
}

impl GpuMapping {
    pub(crate) fn new(
        gpu_va: u64,
        page_offset: u64,
        length: u64,
        buffer_id: BufferId,
        flags: PteFlags,
    ) -> Self {
        Self {
            gpu_va,
            page_offset,
            length,
            buffer_id,
            flags,
        }
    }

    pub fn gpu_va(&self) -> u64 {
        self.gpu_va
    }

    /// First mapped page within the backing buffer.
    pub fn page_offset(&self) -> u64 {
        self.page_offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn page_count(&self) -> u64 {
        self.length >> PAGE_SHIFT
    }

    /// One past the last mapped GPU virtual address.
    pub fn end(&self) -> u64 {
        self.gpu_va + self.length
    }

    pub fn buffer_id(&self) -> BufferId {
        self.buffer_id
    }

    pub fn flags(&self) -> PteFlags {
        self.flags
    }
}
