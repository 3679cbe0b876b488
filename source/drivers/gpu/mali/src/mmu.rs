// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Arbitration of the fixed hardware MMU address slots
//! PUBLIC API: AddressManager, AddressSlotMapping, SlotError
//! DEPENDS_ON: regs (register programming), connection (liveness lookups)
//! INVARIANTS: Slot-table lock is outer, hardware-slot locks are inner and
//!             acquired one at a time; at most one live mapping per slot; a
//!             logical binding is cleared only on release_space_mappings.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::atom::Atom;
use crate::connection::{Connection, ConnectionRegistry};
use crate::hal::RegisterIo;
use crate::regs::AsRegisters;
use crate::types::ConnectionId;

/// Hardware address-space register blocks on the device.
pub const ADDRESS_SLOT_COUNT: usize = 8;

/// Failures while binding an address space to a hardware slot. All of these
/// are recoverable: the atom simply cannot run this round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SlotError {
    /// The atom's connection has been torn down.
    #[error("connection has expired")]
    ConnectionExpired,
    /// The connection's address space was marked lost after a fault.
    #[error("address space is lost")]
    AddressSpaceLost,
    /// Every hardware slot is held by a live mapping. No eviction is
    /// implemented; callers retry once a mapping is released.
    #[error("all address slots are in use")]
    AllSlotsBusy,
}

/// Handle representing one reference to a slot binding.
///
/// Each handle is exactly one count in the manager's arena; it is returned
/// through [`AddressManager::release_mapping`] when the holder is done. The
/// hardware binding itself outlives the last handle and remains reusable
/// until the slot is reprogrammed or the space released.
#[must_use = "a slot mapping holds a reference until released"]
#[derive(Debug)]
pub struct AddressSlotMapping {
    slot: usize,
    connection: ConnectionId,
}

impl AddressSlotMapping {
    pub fn slot_number(&self) -> usize {
        self.slot
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(slot: usize, connection: ConnectionId) -> Self {
        Self { slot, connection }
    }
}

/// Logical state of one slot. `refs > 0` means a live mapping exists;
/// `refs == 0` with a connection recorded means the hardware still holds a
/// valid, re-materializable binding; no connection means the slot is free.
struct LogicalSlot {
    refs: u32,
    connection: Option<ConnectionId>,
}

/// Owns the fixed tables of logical and hardware address slots and keeps the
/// MMU registers consistent with the current bindings.
pub struct AddressManager {
    register_io: Arc<dyn RegisterIo>,
    registry: Arc<ConnectionRegistry>,
    /// Outer lock: who occupies which slot.
    slots: Mutex<Vec<LogicalSlot>>,
    /// Inner locks: one per hardware register block.
    hardware: Vec<Mutex<AsRegisters>>,
}

impl AddressManager {
    pub fn new(
        register_io: Arc<dyn RegisterIo>,
        registry: Arc<ConnectionRegistry>,
        slot_count: usize,
    ) -> Self {
        Self {
            register_io,
            registry,
            slots: Mutex::new(
                (0..slot_count)
                    .map(|_| LogicalSlot {
                        refs: 0,
                        connection: None,
                    })
                    .collect(),
            ),
            hardware: (0..slot_count)
                .map(|slot| Mutex::new(AsRegisters::new(slot)))
                .collect(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.hardware.len()
    }

    /// Binds the atom's connection's address space to a hardware slot and
    /// attaches the mapping to the atom. Fails if the connection has expired,
    /// its address space is lost, or no slot can be obtained.
    pub fn assign_address_space(&self, atom: &Atom) -> Result<(), SlotError> {
        let connection = self
            .registry
            .get(atom.connection_id())
            .ok_or(SlotError::ConnectionExpired)?;
        if connection.address_space().is_lost() {
            return Err(SlotError::AddressSpaceLost);
        }
        let mapping = self.allocate_slot_mapping(&connection)?;
        atom.set_slot_mapping(mapping);
        Ok(())
    }

    /// Allocation policy, executed under the slot-table lock:
    /// (a) the connection already occupies a slot: bump the count, same slot;
    /// (b) a wholly free slot exists: bind it;
    /// (c) an expired binding exists: rebind that slot;
    /// (d) otherwise fail; nothing live is evicted.
    pub fn allocate_slot_mapping(
        &self,
        connection: &Connection,
    ) -> Result<AddressSlotMapping, SlotError> {
        let id = connection.id();
        let mut slots = self.slots.lock();

        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.connection == Some(id) {
                slot.refs += 1;
                return Ok(AddressSlotMapping {
                    slot: index,
                    connection: id,
                });
            }
        }

        if let Some(index) = slots.iter().position(|slot| slot.connection.is_none()) {
            return Ok(self.bind_slot(slots, index, connection));
        }

        if let Some(index) = slots.iter().position(|slot| slot.refs == 0) {
            return Ok(self.bind_slot(slots, index, connection));
        }

        log::debug!(target: "mmu", "no address slot available for connection {}", id.to_raw());
        Err(SlotError::AllSlotsBusy)
    }

    /// Programs `index` for `connection`. The hardware lock is taken while
    /// the table lock is still held, then the table lock is dropped before
    /// the (slow) register sequence runs.
    fn bind_slot(
        &self,
        mut slots: MutexGuard<'_, Vec<LogicalSlot>>,
        index: usize,
        connection: &Connection,
    ) -> AddressSlotMapping {
        slots[index] = LogicalSlot {
            refs: 1,
            connection: Some(connection.id()),
        };
        let hardware = self.hardware[index].lock();
        drop(slots);

        let space = connection.address_space();
        hardware.assign(
            self.register_io.as_ref(),
            space.translation_table_entry(),
            space.memory_attributes(),
        );
        log::debug!(
            target: "mmu",
            "bound connection {} to address slot {}",
            connection.id().to_raw(),
            index
        );
        AddressSlotMapping {
            slot: index,
            connection: connection.id(),
        }
    }

    /// Returns a new reference to the live mapping in `slot`, if any.
    pub fn get_mapping_for_slot(&self, slot: usize) -> Option<AddressSlotMapping> {
        let mut slots = self.slots.lock();
        let state = slots.get_mut(slot)?;
        if state.refs == 0 {
            return None;
        }
        let connection = state.connection?;
        state.refs += 1;
        Some(AddressSlotMapping { slot, connection })
    }

    /// Returns a reference to the connection's slot binding, re-materializing
    /// a handle even if the previous ones were all released: the hardware
    /// binding, not the handle object, is the source of truth.
    pub fn get_mapping_for_address_space(
        &self,
        connection: ConnectionId,
    ) -> Option<AddressSlotMapping> {
        let mut slots = self.slots.lock();
        let (index, state) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.connection == Some(connection))?;
        state.refs += 1;
        Some(AddressSlotMapping {
            slot: index,
            connection,
        })
    }

    /// Drops one reference to a slot binding. The hardware stays programmed;
    /// an expired binding is reclaimed lazily by allocation policy (c).
    pub fn release_mapping(&self, mapping: AddressSlotMapping) {
        let mut slots = self.slots.lock();
        let state = &mut slots[mapping.slot];
        debug_assert_eq!(state.connection, Some(mapping.connection));
        debug_assert!(state.refs > 0, "release without a live reference");
        state.refs = state.refs.saturating_sub(1);
    }

    /// Flushes stale translations for `start..start + length` in the slot
    /// currently holding `connection`, if any. The table lock is held only
    /// long enough to locate the slot; the flush itself runs under the
    /// hardware lock alone.
    pub fn flush_address_mapping_range(&self, connection: ConnectionId, start: u64, length: u64) {
        let slots = self.slots.lock();
        let Some(index) = slots
            .iter()
            .position(|slot| slot.connection == Some(connection))
        else {
            return;
        };
        let hardware = self.hardware[index].lock();
        drop(slots);
        hardware.flush_range(self.register_io.as_ref(), start, length);
    }

    /// Called while a connection is being destroyed: every atom must already
    /// have released its mapping. Invalidates the hardware slot and clears
    /// the logical binding under both locks.
    pub fn release_space_mappings(&self, connection: ConnectionId) {
        let mut slots = self.slots.lock();
        let Some(index) = slots
            .iter()
            .position(|slot| slot.connection == Some(connection))
        else {
            return;
        };
        debug_assert_eq!(
            slots[index].refs, 0,
            "address space released while atoms still hold its mapping"
        );
        let hardware = self.hardware[index].lock();
        slots[index] = LogicalSlot {
            refs: 0,
            connection: None,
        };
        drop(slots);
        hardware.invalidate(self.register_io.as_ref());
        log::debug!(
            target: "mmu",
            "released address slot {} for connection {}",
            index,
            connection.to_raw()
        );
    }
}
