// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Units of GPU work and the dependency edges between them.
//!
//! An atom's result is a lock-free atomic so completion paths can read it
//! without touching the state mutex; everything mutable beyond that lives
//! behind one small mutex.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::mmu::AddressSlotMapping;
use crate::types::{AtomResult, ConnectionId, DependencyKind};

/// Edge to a predecessor atom. The target is held weakly; once the
/// predecessor finishes (or is dropped) the edge keeps only the snapshot of
/// its result, letting the predecessor be freed.
pub struct Dependency {
    pub kind: DependencyKind,
    pub atom: Weak<Atom>,
    saved_result: AtomResult,
}

impl Dependency {
    pub fn new(kind: DependencyKind, atom: &Arc<Atom>) -> Self {
        Self {
            kind,
            atom: Arc::downgrade(atom),
            saved_result: AtomResult::Success,
        }
    }

    pub fn saved_result(&self) -> AtomResult {
        self.saved_result
    }
}

struct AtomState {
    dependencies: Vec<Dependency>,
    dependencies_set: bool,
    slot_mapping: Option<AddressSlotMapping>,
    execution_start: Option<Instant>,
}

/// One schedulable unit of GPU work.
pub struct Atom {
    connection: ConnectionId,
    gpu_address: u64,
    slot: u32,
    atom_number: u8,
    user_data: u64,
    /// Retained for clients to read back; the scheduler is strictly FIFO
    /// and never consults it.
    priority: i32,
    result: AtomicU32,
    state: Mutex<AtomState>,
}

impl Atom {
    pub fn new(
        connection: ConnectionId,
        gpu_address: u64,
        slot: u32,
        atom_number: u8,
        user_data: u64,
        priority: i32,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            gpu_address,
            slot,
            atom_number,
            user_data,
            priority,
            result: AtomicU32::new(AtomResult::Running as u32),
            state: Mutex::new(AtomState {
                dependencies: Vec::new(),
                dependencies_set: false,
                slot_mapping: None,
                execution_start: None,
            }),
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn atom_number(&self) -> u8 {
        self.atom_number
    }

    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Attaches the dependency list, exactly once, before scheduling.
    pub fn set_dependencies(&self, dependencies: Vec<Dependency>) {
        let mut state = self.state.lock();
        debug_assert!(!state.dependencies_set, "dependencies set twice");
        state.dependencies_set = true;
        state.dependencies = dependencies;
    }

    /// Re-examines outstanding dependencies, snapshotting and dropping the
    /// edge to every predecessor that has finished. Returns true when no
    /// unfinished predecessor remains. A dropped predecessor counts as
    /// finished with its default snapshot.
    pub fn update_dependencies(&self) -> bool {
        let mut state = self.state.lock();
        for dep in state.dependencies.iter_mut() {
            if let Some(target) = dep.atom.upgrade() {
                let result = target.result();
                if result == AtomResult::Running {
                    return false;
                }
                dep.saved_result = result;
                dep.atom = Weak::new();
            }
        }
        true
    }

    /// First unsuccessful snapshot among data-bearing dependencies, or
    /// `Success`. Order-only edges sequence execution without propagating
    /// failure.
    pub fn final_dependency_result(&self) -> AtomResult {
        let state = self.state.lock();
        for dep in &state.dependencies {
            if dep.kind == DependencyKind::Order {
                continue;
            }
            if dep.saved_result != AtomResult::Success {
                return dep.saved_result;
            }
        }
        AtomResult::Success
    }

    /// Attaches the address-slot mapping obtained for this atom's run.
    pub fn set_slot_mapping(&self, mapping: AddressSlotMapping) {
        debug_assert_eq!(
            mapping.connection(),
            self.connection,
            "slot mapping belongs to a different connection"
        );
        let mut state = self.state.lock();
        debug_assert!(
            state.slot_mapping.is_none(),
            "atom already holds a slot mapping"
        );
        state.slot_mapping = Some(mapping);
    }

    /// Detaches the slot mapping, if any, so the caller can release it.
    pub fn take_slot_mapping(&self) -> Option<AddressSlotMapping> {
        self.state.lock().slot_mapping.take()
    }

    /// Stamps the moment the atom was handed to hardware.
    pub fn mark_started(&self) {
        self.state.lock().execution_start = Some(Instant::now());
    }

    pub fn execution_start(&self) -> Option<Instant> {
        self.state.lock().execution_start
    }

    pub fn result(&self) -> AtomResult {
        AtomResult::from_raw(self.result.load(Ordering::Acquire))
    }

    pub fn set_result(&self, result: AtomResult) {
        self.result.store(result as u32, Ordering::Release);
    }
}
