// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual-memory and command-scheduling core for a Mali GPU driver
//! PUBLIC API: ConnectionRegistry, Connection, AddressManager, JobScheduler, Atom
//! DEPENDS_ON: bitflags, log, parking_lot, static_assertions, thiserror
//! INVARIANTS: Per-address-space page tables stay coherent with the MMU slot
//!             registers; the scheduler runs one atom at a time on a single
//!             device thread.
//!
//! The crate owns everything between "a client asked to map a buffer or run
//! an atom" and "the MMU/job registers were programmed": 4-level page tables,
//! the fixed pool of hardware address slots, and a FIFO atom scheduler with
//! dependency tracking and connection-scoped cancellation. Register access,
//! page pinning, and interrupt dispatch stay behind the traits in [`hal`].

pub mod atom;
pub mod connection;
pub mod hal;
pub mod mm;
pub mod mmu;
pub mod regs;
pub mod sched;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use atom::{Atom, Dependency};
pub use connection::{Connection, ConnectionRegistry};
pub use mm::address_space::AddressSpace;
pub use mm::gpu_mapping::GpuMapping;
pub use mm::{MapError, PteFlags};
pub use mmu::{AddressManager, AddressSlotMapping, SlotError, ADDRESS_SLOT_COUNT};
pub use sched::{JobScheduler, JobSchedulerOwner, JOB_SLOT_COUNT};
pub use types::{AtomResult, BufferId, ConnectionId, DependencyKind};
