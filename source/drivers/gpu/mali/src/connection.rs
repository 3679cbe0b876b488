// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Client connections and the central registry that resolves them.
//!
//! Everything else in the core refers to a connection by [`ConnectionId`];
//! "the connection expired" is exactly "the registry no longer knows the
//! id". Teardown ordering matters: slot mappings are released from the
//! address manager before the registry entry disappears.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::hal::{DevicePageAllocator, MappedBuffer};
use crate::mm::address_space::AddressSpace;
use crate::mm::gpu_mapping::GpuMapping;
use crate::mm::{MapError, PteFlags, PAGE_SIZE};
use crate::mmu::AddressManager;
use crate::types::{BufferId, ConnectionId};

/// One client graphics context: its address space plus the map of installed
/// buffer mappings, keyed by GPU virtual address.
pub struct Connection {
    id: ConnectionId,
    address_space: AddressSpace,
    mappings: Mutex<BTreeMap<u64, GpuMapping>>,
}

impl Connection {
    fn new(id: ConnectionId, allocator: Arc<dyn DevicePageAllocator>) -> Result<Self, MapError> {
        Ok(Self {
            id,
            address_space: AddressSpace::new(allocator)?,
            mappings: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.address_space
    }

    /// Installs `page_count` pages of `buffer` (starting at `page_offset`)
    /// at `gpu_va`, rejecting collisions with existing mappings.
    pub fn map_buffer_gpu(
        &self,
        buffer: &dyn MappedBuffer,
        buffer_id: BufferId,
        gpu_va: u64,
        page_offset: u64,
        page_count: u64,
        flags: PteFlags,
    ) -> Result<(), MapError> {
        let length = page_count
            .checked_mul(PAGE_SIZE)
            .ok_or(MapError::OutOfRange)?;
        let mut mappings = self.mappings.lock();
        if overlaps(&mappings, gpu_va, length) {
            return Err(MapError::Overlap);
        }
        self.address_space
            .insert(gpu_va, buffer, page_offset * PAGE_SIZE, length, flags)?;
        mappings.insert(
            gpu_va,
            GpuMapping::new(gpu_va, page_offset, length, buffer_id, flags),
        );
        Ok(())
    }

    /// Removes the mapping installed at `gpu_va` and invalidates its range.
    /// The caller still owes the hardware a range flush before the detached
    /// page tables are reclaimed.
    pub fn unmap_buffer_gpu(&self, gpu_va: u64) -> Result<GpuMapping, MapError> {
        let mut mappings = self.mappings.lock();
        let mapping = mappings.remove(&gpu_va).ok_or(MapError::NotMapped)?;
        self.address_space.clear(gpu_va, mapping.length())?;
        Ok(mapping)
    }

    /// Number of installed mappings.
    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }
}

fn overlaps(mappings: &BTreeMap<u64, GpuMapping>, gpu_va: u64, length: u64) -> bool {
    if let Some((_, prev)) = mappings.range(..=gpu_va).next_back() {
        if prev.end() > gpu_va {
            return true;
        }
    }
    if let Some((next_va, _)) = mappings.range(gpu_va..).next() {
        if *next_va < gpu_va + length {
            return true;
        }
    }
    false
}

/// Central table of live connections. Lookups by id are the only way the
/// rest of the core reaches a connection, so removal here is what makes a
/// connection "expired" everywhere else.
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    next_id: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                connections: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Opens a new connection with a fresh address space.
    pub fn open(
        &self,
        allocator: Arc<dyn DevicePageAllocator>,
    ) -> Result<Arc<Connection>, MapError> {
        let mut inner = self.inner.lock();
        let id = ConnectionId::from_counter(inner.next_id).ok_or(MapError::OutOfRange)?;
        inner.next_id += 1;
        let connection = Arc::new(Connection::new(id, allocator)?);
        inner.connections.insert(id, connection.clone());
        log::debug!(target: "gpu", "connection {} opened", id.to_raw());
        Ok(connection)
    }

    /// Resolves an id to a live connection.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.lock().connections.get(&id).cloned()
    }

    /// Tears down a connection: hardware slot bindings are released first,
    /// then the id stops resolving.
    pub fn close(&self, id: ConnectionId, address_manager: &AddressManager) {
        address_manager.release_space_mappings(id);
        let removed = self.inner.lock().connections.remove(&id);
        if removed.is_some() {
            log::debug!(target: "gpu", "connection {} closed", id.to_raw());
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
