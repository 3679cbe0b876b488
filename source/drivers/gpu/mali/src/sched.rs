// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! FIFO job scheduler.
//!
//! Single-threaded by construction: the scheduler is `!Send + !Sync` and
//! every entry point runs on the device thread. One atom executes at a time;
//! the queue head is only popped on completion, so the executing atom is
//! always `atoms.front()`.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use static_assertions::assert_not_impl_any;

use crate::atom::Atom;
use crate::types::{AtomResult, ConnectionId};

/// Hardware job slots on the device. Execution is nonetheless serialized;
/// completion handling assumes exactly one in-flight atom.
pub const JOB_SLOT_COUNT: u32 = 3;

/// Device-side callbacks the scheduler drives.
pub trait JobSchedulerOwner {
    /// Submits the atom to its hardware job slot. Completion is reported
    /// back later through [`JobScheduler::job_completed`].
    fn run_atom(&mut self, atom: &Arc<Atom>);
    /// An atom finished (ran, failed a dependency, or was cancelled before
    /// running) and carries its final result.
    fn atom_completed(&mut self, atom: &Arc<Atom>);
}

type CancelCallback = Box<dyn FnOnce()>;

pub struct JobScheduler {
    job_slot_count: u32,
    atoms: VecDeque<Arc<Atom>>,
    executing: bool,
    /// Cancellations deferred until the in-flight atom for that connection
    /// drains; fired from `job_completed`.
    finished_callbacks: Vec<(ConnectionId, CancelCallback)>,
    _not_send_sync: PhantomData<*mut ()>,
}

assert_not_impl_any!(JobScheduler: Send, Sync);

impl JobScheduler {
    pub fn new(job_slot_count: u32) -> Self {
        Self {
            job_slot_count,
            atoms: VecDeque::new(),
            executing: false,
            finished_callbacks: Vec::new(),
            _not_send_sync: PhantomData,
        }
    }

    pub fn job_slot_count(&self) -> u32 {
        self.job_slot_count
    }

    pub fn atom_list_size(&self) -> usize {
        self.atoms.len()
    }

    /// Appends an atom to the queue. Scheduling is not attempted here; the
    /// caller invokes [`try_to_schedule`] after every enqueue, as after every
    /// completion.
    ///
    /// [`try_to_schedule`]: Self::try_to_schedule
    pub fn enqueue_atom(&mut self, atom: Arc<Atom>) {
        self.atoms.push_back(atom);
    }

    /// Runs the queue head if nothing is executing and its dependencies have
    /// drained. A head whose data dependency failed completes immediately
    /// with the propagated result instead of running, and the next head is
    /// considered in turn.
    pub fn try_to_schedule(&mut self, owner: &mut dyn JobSchedulerOwner) {
        while !self.executing {
            let Some(atom) = self.atoms.front().cloned() else {
                return;
            };
            if !atom.update_dependencies() {
                return;
            }
            let dep_result = atom.final_dependency_result();
            if dep_result != AtomResult::Success {
                log::debug!(
                    target: "sched",
                    "atom {} completing early with dependency result {:?}",
                    atom.atom_number(),
                    dep_result
                );
                atom.set_result(dep_result);
                owner.atom_completed(&atom);
                self.atoms.pop_front();
                self.fire_finished_callbacks(atom.connection_id());
                continue;
            }
            self.executing = true;
            atom.mark_started();
            log::debug!(
                target: "sched",
                "running atom {} on job slot {}",
                atom.atom_number(),
                atom.slot()
            );
            owner.run_atom(&atom);
            return;
        }
    }

    /// Hardware completion for `job_slot`. Finalizes the executing atom
    /// (filling in `Success` when nothing recorded a result), reports it,
    /// fires any cancellation callback waiting on it, then schedules the
    /// next head.
    pub fn job_completed(&mut self, job_slot: u32, owner: &mut dyn JobSchedulerOwner) {
        debug_assert!(self.executing, "completion with nothing executing");
        let Some(atom) = self.atoms.pop_front() else {
            return;
        };
        debug_assert_eq!(atom.slot(), job_slot);
        self.executing = false;
        if atom.result() == AtomResult::Running {
            atom.set_result(AtomResult::Success);
        }
        owner.atom_completed(&atom);
        self.fire_finished_callbacks(atom.connection_id());
        self.try_to_schedule(owner);
    }

    /// Removes every queued atom belonging to `connection`. An atom already
    /// running on hardware is left in place; `callback` is then deferred
    /// until that atom completes. Otherwise the callback fires immediately.
    pub fn cancel_atoms_for_connection(
        &mut self,
        connection: ConnectionId,
        callback: CancelCallback,
    ) {
        let running_head = self.executing;
        let mut index = 0usize;
        self.atoms.retain(|atom| {
            let keep = atom.connection_id() != connection || (index == 0 && running_head);
            index += 1;
            keep
        });

        let defer = running_head
            && self
                .atoms
                .front()
                .is_some_and(|atom| atom.connection_id() == connection);
        if defer {
            log::debug!(
                target: "sched",
                "deferring cancel of connection {} behind in-flight atom",
                connection.to_raw()
            );
            self.finished_callbacks.push((connection, callback));
        } else {
            callback();
        }
    }

    fn fire_finished_callbacks(&mut self, connection: ConnectionId) {
        let mut remaining = Vec::new();
        for (id, callback) in self.finished_callbacks.drain(..) {
            if id == connection {
                callback();
            } else {
                remaining.push((id, callback));
            }
        }
        self.finished_callbacks = remaining;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Dependency;
    use crate::types::DependencyKind;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Records the order of scheduler callbacks by atom number.
    #[derive(Default)]
    struct TestOwner {
        ran: Vec<u8>,
        completed: Vec<(u8, AtomResult)>,
    }

    impl JobSchedulerOwner for TestOwner {
        fn run_atom(&mut self, atom: &Arc<Atom>) {
            self.ran.push(atom.atom_number());
        }

        fn atom_completed(&mut self, atom: &Arc<Atom>) {
            self.completed.push((atom.atom_number(), atom.result()));
        }
    }

    fn conn(n: u64) -> ConnectionId {
        ConnectionId::from_counter(n).unwrap()
    }

    fn atom(connection: ConnectionId, number: u8) -> Arc<Atom> {
        Atom::new(connection, 0x10_0000, 0, number, 0, 0)
    }

    #[test]
    fn atoms_run_one_at_a_time_in_fifo_order() {
        let mut sched = JobScheduler::new(3);
        let mut owner = TestOwner::default();
        let c = conn(1);

        sched.enqueue_atom(atom(c, 1));
        sched.enqueue_atom(atom(c, 2));
        sched.enqueue_atom(atom(c, 3));
        sched.try_to_schedule(&mut owner);
        assert_eq!(owner.ran, vec![1]);

        sched.job_completed(0, &mut owner);
        assert_eq!(owner.ran, vec![1, 2]);
        sched.job_completed(0, &mut owner);
        sched.job_completed(0, &mut owner);
        assert_eq!(owner.ran, vec![1, 2, 3]);
        assert_eq!(
            owner.completed,
            vec![
                (1, AtomResult::Success),
                (2, AtomResult::Success),
                (3, AtomResult::Success)
            ]
        );
        assert_eq!(sched.atom_list_size(), 0);
    }

    #[test]
    fn head_waits_for_unfinished_dependency() {
        let mut sched = JobScheduler::new(3);
        let mut owner = TestOwner::default();
        let c = conn(1);

        let first = atom(c, 1);
        let second = atom(c, 2);
        second.set_dependencies(vec![Dependency::new(DependencyKind::Data, &first)]);

        sched.enqueue_atom(first);
        sched.enqueue_atom(second);
        sched.try_to_schedule(&mut owner);
        assert_eq!(owner.ran, vec![1]);

        // Completing atom 1 records Success and unblocks atom 2.
        sched.job_completed(0, &mut owner);
        assert_eq!(owner.ran, vec![1, 2]);
        sched.job_completed(0, &mut owner);
        assert_eq!(owner.completed[1], (2, AtomResult::Success));
    }

    #[test]
    fn failed_data_dependency_completes_without_running() {
        let mut sched = JobScheduler::new(3);
        let mut owner = TestOwner::default();
        let c = conn(1);

        let first = atom(c, 1);
        let second = atom(c, 2);
        let third = atom(c, 3);
        second.set_dependencies(vec![Dependency::new(DependencyKind::Data, &first)]);

        sched.enqueue_atom(first.clone());
        sched.enqueue_atom(second);
        sched.enqueue_atom(third);
        sched.try_to_schedule(&mut owner);

        first.set_result(AtomResult::Fault);
        sched.job_completed(0, &mut owner);

        // Atom 2 inherits the fault without running; atom 3 proceeds.
        assert_eq!(owner.ran, vec![1, 3]);
        assert_eq!(owner.completed[0], (1, AtomResult::Fault));
        assert_eq!(owner.completed[1], (2, AtomResult::Fault));
    }

    #[test]
    fn order_dependency_does_not_propagate_failure() {
        let mut sched = JobScheduler::new(3);
        let mut owner = TestOwner::default();
        let c = conn(1);

        let first = atom(c, 1);
        let second = atom(c, 2);
        second.set_dependencies(vec![Dependency::new(DependencyKind::Order, &first)]);

        sched.enqueue_atom(first.clone());
        sched.enqueue_atom(second);
        sched.try_to_schedule(&mut owner);
        first.set_result(AtomResult::Terminated);
        sched.job_completed(0, &mut owner);

        assert_eq!(owner.ran, vec![1, 2]);
        sched.job_completed(0, &mut owner);
        assert_eq!(owner.completed[1], (2, AtomResult::Success));
    }

    #[test]
    fn cancel_removes_queued_atoms_and_defers_behind_running_one() {
        let mut sched = JobScheduler::new(3);
        let mut owner = TestOwner::default();
        let a = conn(1);
        let b = conn(2);

        sched.enqueue_atom(atom(a, 1));
        sched.enqueue_atom(atom(a, 2));
        sched.enqueue_atom(atom(b, 3));
        sched.try_to_schedule(&mut owner);
        assert_eq!(owner.ran, vec![1]);

        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        sched.cancel_atoms_for_connection(a, Box::new(move || flag.set(true)));

        // Atom 1 is on hardware; the callback waits for it.
        assert!(!fired.get());
        assert_eq!(sched.atom_list_size(), 2);

        sched.job_completed(0, &mut owner);
        assert!(fired.get());
        // Connection b's atom is unaffected and now runs.
        assert_eq!(owner.ran, vec![1, 3]);
        sched.job_completed(0, &mut owner);
        assert_eq!(sched.atom_list_size(), 0);
    }

    #[test]
    fn cancel_fires_immediately_when_running_atom_is_foreign() {
        let mut sched = JobScheduler::new(3);
        let a = conn(1);
        let mut owner = TestOwner::default();
        sched.enqueue_atom(atom(conn(2), 1));
        sched.enqueue_atom(atom(a, 2));
        sched.try_to_schedule(&mut owner);

        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        // The running head belongs to another connection, so nothing of
        // connection a's remains after removal.
        sched.cancel_atoms_for_connection(a, Box::new(move || flag.set(true)));
        assert!(fired.get());
        assert_eq!(sched.atom_list_size(), 1);
    }

    #[test]
    fn cancel_on_empty_queue_fires_immediately() {
        let mut sched = JobScheduler::new(3);
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        sched.cancel_atoms_for_connection(conn(7), Box::new(move || flag.set(true)));
        assert!(fired.get());
    }
}
