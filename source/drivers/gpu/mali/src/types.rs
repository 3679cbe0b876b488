// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Small shared identifier and result types used across the driver core.

use core::num::NonZeroU64;

/// Identifier of a client graphics connection.
///
/// Connections are referenced by id everywhere outside the registry; a failed
/// registry lookup is what "expired" means, so no weak pointers are needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(NonZeroU64);

impl ConnectionId {
    /// Creates an id from the registry's counter.
    pub(crate) fn from_counter(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Constructs an id from a raw value.
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Returns the raw representation of the id.
    pub fn to_raw(self) -> u64 {
        self.0.get()
    }
}

/// Identifier of a client buffer, used as an index-based back-reference in
/// mapping records.
pub type BufferId = u64;

/// Result code carried by an atom; `Running` means not yet finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AtomResult {
    Running = 0,
    Success = 1,
    Fault = 2,
    Terminated = 3,
}

impl AtomResult {
    pub(crate) fn from_raw(raw: u32) -> Self {
        match raw {
            0 => AtomResult::Running,
            1 => AtomResult::Success,
            2 => AtomResult::Fault,
            _ => AtomResult::Terminated,
        }
    }

    /// True once a result other than `Running` has been recorded.
    pub fn is_finished(self) -> bool {
        self != AtomResult::Running
    }
}

/// How an atom depends on a prerequisite atom.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependencyKind {
    /// Sequencing only; a failed prerequisite does not fail this atom.
    Order,
    /// Data dependency; the first non-success prerequisite result propagates.
    Data,
}
