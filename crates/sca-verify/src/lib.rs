//! # sca-verify: run/cancel protocol checks
//!
//! A step-level model of the job coordinator built on the real
//! [`InFlightRegistry`]. Each method below is one gate section of the
//! coordinator; the record and the notifications are modelled as plain
//! fields. Interleaving the steps of concurrent runs and cancels explores
//! every order the gate can serialise them into.
//!
//! Properties:
//!
//! - at most one terminal notification per job;
//! - a cancel that takes the gate before admission keeps the solver from
//!   being called;
//! - a cancel after `COMPLETED` or `FAILED` changes nothing;
//! - once every run has finished the registry is empty.
//!
//! The Kani harnesses check the properties for symbolic schedules; the
//! tests enumerate schedules exhaustively.

use sca_core::{Admission, InFlightRegistry, JobId, JobStatus};

/// The single job every schedule is about.
pub const JOB: JobId = JobId::from_uuid(uuid::Uuid::from_u128(0x5ca));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    ResultReady,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Run signal: admission under the gate.
    Admit,
    /// Run signal: the solver returned and the outcome is recorded.
    Finish { succeeded: bool },
    Cancel,
}

/// Coordinator state for [`JOB`].
#[derive(Debug)]
pub struct Protocol {
    registry: InFlightRegistry<u8, u8>,
    record: Option<JobStatus>,
    delete_failed: bool,
    pub terminals: Vec<Terminal>,
    pub solver_calls: usize,
    next_handle: u8,
}

impl Protocol {
    /// A freshly submitted job. `delete_failed` selects the delete-on-failure
    /// policy.
    pub fn submitted(delete_failed: bool) -> Self {
        Self {
            registry: InFlightRegistry::new(),
            record: Some(JobStatus::Running),
            delete_failed,
            terminals: Vec::new(),
            solver_calls: 0,
            next_handle: 0,
        }
    }

    pub fn record(&self) -> Option<JobStatus> {
        self.record
    }

    pub fn registry_is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Returns the handle when the run may call the solver.
    pub fn admit(&mut self) -> Option<u8> {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        match self.registry.admit(JOB, handle) {
            Admission::AlreadyInFlight | Admission::CancelRequested => return None,
            Admission::Admitted => {}
        }
        match self.record {
            None => {
                self.registry.release(&JOB);
                return None;
            }
            Some(status) if status.is_terminal() => {
                self.registry.release(&JOB);
                return None;
            }
            Some(_) => self.record = Some(JobStatus::Running),
        }
        self.solver_calls += 1;
        Some(handle)
    }

    pub fn finish(&mut self, succeeded: bool) {
        if self.registry.has_cancel_intent(&JOB) {
            self.registry.release(&JOB);
            return;
        }
        if succeeded {
            if self.record.is_some() {
                self.record = Some(JobStatus::Completed);
                self.terminals.push(Terminal::ResultReady);
            }
        } else {
            self.terminals.push(Terminal::Failed);
            self.record = if self.delete_failed {
                None
            } else {
                self.record.map(|_| JobStatus::Failed)
            };
        }
        self.registry.release(&JOB);
    }

    pub fn cancel(&mut self) {
        if self.registry.has_cancel_intent(&JOB) {
            return;
        }
        match self.record {
            Some(status) if status.is_terminal() => return,
            None if !self.registry.is_in_flight(&JOB) => return,
            _ => {}
        }
        self.registry.record_cancel(JOB, 0);
        self.record = None;
        self.terminals.push(Terminal::Stopped);
    }
}

/// A run signal is two steps; the finish only happens after an admission.
#[derive(Debug, Clone, Copy)]
enum Thread {
    Run { succeeded: bool, admitted: Option<bool> },
    Cancel { done: bool },
}

impl Thread {
    fn finished(&self) -> bool {
        match self {
            Self::Run { admitted, .. } => *admitted == Some(false),
            Self::Cancel { done } => *done,
        }
    }
}

/// Every serialisation of `runs` run signals and `cancels` cancel requests,
/// each given as the sequence of steps taken and the final state.
pub fn explore(
    runs: &[bool],
    cancels: usize,
    delete_failed: bool,
    visit: &mut dyn FnMut(&[Step], &Protocol),
) {
    let mut threads: Vec<Thread> = runs
        .iter()
        .map(|&succeeded| Thread::Run {
            succeeded,
            admitted: None,
        })
        .collect();
    threads.extend((0..cancels).map(|_| Thread::Cancel { done: false }));
    let mut trace = Vec::new();
    walk(&mut threads, &mut trace, delete_failed, visit);
}

fn walk(
    threads: &mut Vec<Thread>,
    trace: &mut Vec<Step>,
    delete_failed: bool,
    visit: &mut dyn FnMut(&[Step], &Protocol),
) {
    let live: Vec<usize> = (0..threads.len())
        .filter(|&i| !threads[i].finished())
        .collect();
    if live.is_empty() {
        let protocol = replay(trace, delete_failed);
        visit(trace, &protocol);
        return;
    }
    for i in live {
        let saved = threads[i];
        let step = match saved {
            Thread::Run {
                admitted: None,
                succeeded,
            } => {
                // A refused admission ends the thread; see below.
                threads[i] = Thread::Run {
                    succeeded,
                    admitted: Some(true),
                };
                Step::Admit
            }
            Thread::Run {
                admitted: Some(true),
                succeeded,
            } => {
                threads[i] = Thread::Run {
                    succeeded,
                    admitted: Some(false),
                };
                Step::Finish { succeeded }
            }
            Thread::Run { .. } | Thread::Cancel { done: true } => continue,
            Thread::Cancel { done: false } => {
                threads[i] = Thread::Cancel { done: true };
                Step::Cancel
            }
        };
        trace.push(step);
        if let Thread::Run { succeeded, admitted: None } = saved {
            if !admits(trace, delete_failed) {
                threads[i] = Thread::Run {
                    succeeded,
                    admitted: Some(false),
                };
            }
        }
        walk(threads, trace, delete_failed, visit);
        trace.pop();
        threads[i] = saved;
    }
}

/// Whether the last `Admit` in `trace` was accepted.
fn admits(trace: &[Step], delete_failed: bool) -> bool {
    let (last, prefix) = match trace.split_last() {
        Some(split) => split,
        None => return false,
    };
    debug_assert_eq!(*last, Step::Admit);
    let mut protocol = replay(prefix, delete_failed);
    protocol.admit().is_some()
}

pub fn replay(trace: &[Step], delete_failed: bool) -> Protocol {
    let mut protocol = Protocol::submitted(delete_failed);
    for step in trace {
        match *step {
            Step::Admit => {
                protocol.admit();
            }
            Step::Finish { succeeded } => protocol.finish(succeeded),
            Step::Cancel => protocol.cancel(),
        }
    }
    protocol
}

#[cfg(kani)]
mod proofs {
    use super::*;

    /// **Proof: one terminal notification per job**
    ///
    /// A run signal delivered twice and a cancel that lands at any of the
    /// five gate boundaries.
    #[kani::proof]
    #[kani::unwind(8)]
    fn verify_single_terminal_notification() {
        let mut protocol = Protocol::submitted(kani::any());
        let cancel_at: u8 = kani::any();
        kani::assume(cancel_at <= 4);
        let succeeded: bool = kani::any();

        let mut slot = 0u8;
        let maybe_cancel = |p: &mut Protocol, slot: &mut u8| {
            if *slot == cancel_at {
                p.cancel();
            }
            *slot += 1;
        };

        maybe_cancel(&mut protocol, &mut slot);
        let first = protocol.admit();
        maybe_cancel(&mut protocol, &mut slot);
        let second = protocol.admit();
        maybe_cancel(&mut protocol, &mut slot);
        if first.is_some() || second.is_some() {
            protocol.finish(succeeded);
        }
        maybe_cancel(&mut protocol, &mut slot);
        maybe_cancel(&mut protocol, &mut slot);

        assert!(protocol.terminals.len() <= 1);
        assert!(protocol.solver_calls <= 1);
        if cancel_at == 0 {
            assert_eq!(protocol.solver_calls, 0);
        }
    }

    /// **Proof: a finished job ignores cancels**
    #[kani::proof]
    fn verify_cancel_after_finish_is_noop() {
        let mut protocol = Protocol::submitted(false);
        protocol.admit();
        protocol.finish(kani::any());
        let before = protocol.record();

        protocol.cancel();

        assert_eq!(protocol.record(), before);
        assert_eq!(protocol.terminals.len(), 1);
        assert!(protocol.registry_is_empty());
    }
}
