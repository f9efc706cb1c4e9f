//! # In-flight Registry
//!
//! Process-local bookkeeping for run/cancel coordination:
//!
//! - `in_flight`: job id -> the live cancellation handle of a running job.
//! - `cancel_intents`: job id -> when a cancel was recorded. A cancel may
//!   arrive before the run it targets, so the intent has to outlive the
//!   cancel call until the run observes it.
//!
//! The registry itself is not synchronised. The coordinator wraps it in the
//! single gate shared by the run and cancel paths; every method here is a
//! step taken while that gate is held.
//!
//! Invariant: once [`InFlightRegistry::release`] has run for an id, neither
//! map holds an entry for it.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::model::JobId;

/// Result of trying to register a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The handle is registered; the run may invoke the solver.
    Admitted,
    /// A cancel was recorded first. The intent is consumed and nothing was
    /// registered.
    CancelRequested,
    /// A run for this id already holds a handle. Nothing changed; a pending
    /// intent stays for that run to observe.
    AlreadyInFlight,
}

/// `H` is the cancellation handle, `S` the stamp recorded with an intent.
#[derive(Debug)]
pub struct InFlightRegistry<H, S = Instant> {
    in_flight: BTreeMap<JobId, H>,
    cancel_intents: BTreeMap<JobId, S>,
}

impl<H, S> Default for InFlightRegistry<H, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H, S> InFlightRegistry<H, S> {
    pub fn new() -> Self {
        Self {
            in_flight: BTreeMap::new(),
            cancel_intents: BTreeMap::new(),
        }
    }

    /// Register `handle` for `id` unless another run or a cancel intent got
    /// there first. The running job is checked before the intent, so a
    /// duplicate delivery never consumes an intent meant for it.
    pub fn admit(&mut self, id: JobId, handle: H) -> Admission {
        if self.in_flight.contains_key(&id) {
            return Admission::AlreadyInFlight;
        }
        if self.cancel_intents.remove(&id).is_some() {
            return Admission::CancelRequested;
        }
        self.in_flight.insert(id, handle);
        Admission::Admitted
    }

    /// Record a cancel for `id` and return the live handle, if any, so the
    /// caller can fire it. A repeated cancel keeps the first stamp.
    pub fn record_cancel(&mut self, id: JobId, stamp: S) -> Option<&H> {
        self.cancel_intents.entry(id).or_insert(stamp);
        self.in_flight.get(&id)
    }

    pub fn has_cancel_intent(&self, id: &JobId) -> bool {
        self.cancel_intents.contains_key(id)
    }

    pub fn is_in_flight(&self, id: &JobId) -> bool {
        self.in_flight.contains_key(id)
    }

    /// Drop every trace of `id`. Called on each termination path.
    pub fn release(&mut self, id: &JobId) -> Option<H> {
        self.cancel_intents.remove(id);
        self.in_flight.remove(id)
    }

    /// Handles of every running job.
    pub fn handles(&self) -> impl Iterator<Item = &H> {
        self.in_flight.values()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn intent_len(&self) -> usize {
        self.cancel_intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty() && self.cancel_intents.is_empty()
    }
}

impl<H, S: Ord> InFlightRegistry<H, S> {
    /// Forget intents stamped before `cutoff` whose job is not running.
    /// Covers cancels for jobs whose run signal never arrives.
    pub fn prune_intents(&mut self, cutoff: &S) -> usize {
        let in_flight = &self.in_flight;
        let before = self.cancel_intents.len();
        self.cancel_intents
            .retain(|id, stamp| in_flight.contains_key(id) || *stamp >= *cutoff);
        before - self.cancel_intents.len()
    }
}

#[cfg(kani)]
mod proofs {
    use super::*;
    use uuid::Uuid;

    /// **Proof: a recorded cancel always wins against a later admission**
    ///
    /// Whatever the prior state of the id, once a cancel intent is recorded
    /// no admission registers a second handle. A fresh run consumes the
    /// intent; a duplicate of a running one leaves it for the running job.
    #[kani::proof]
    fn verify_cancel_blocks_admission() {
        let id = JobId::from_uuid(Uuid::from_u128(7));
        let mut registry: InFlightRegistry<u8, u8> = InFlightRegistry::new();

        let was_running: bool = kani::any();
        if was_running {
            assert_eq!(registry.admit(id, 1), Admission::Admitted);
        }
        registry.record_cancel(id, kani::any());

        let handle: u8 = kani::any();
        let admission = registry.admit(id, handle);
        if was_running {
            assert_eq!(admission, Admission::AlreadyInFlight);
            assert!(registry.has_cancel_intent(&id));
            assert_eq!(registry.in_flight_len(), 1);
            registry.release(&id);
        } else {
            assert_eq!(admission, Admission::CancelRequested);
        }
        assert!(registry.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn id(n: u128) -> JobId {
        JobId::from_uuid(Uuid::from_u128(n))
    }

    #[test]
    fn test_admit_then_release_leaves_nothing() {
        let mut registry: InFlightRegistry<&str, u32> = InFlightRegistry::new();
        assert_eq!(registry.admit(id(1), "h1"), Admission::Admitted);
        assert!(registry.is_in_flight(&id(1)));
        assert_eq!(registry.release(&id(1)), Some("h1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_before_admit_blocks_registration() {
        let mut registry: InFlightRegistry<&str, u32> = InFlightRegistry::new();
        assert!(registry.record_cancel(id(1), 0).is_none());
        assert_eq!(registry.admit(id(1), "h1"), Admission::CancelRequested);
        assert!(!registry.is_in_flight(&id(1)));
        assert!(registry.is_empty());

        // The intent was consumed, so a redelivery after that is admitted.
        assert_eq!(registry.admit(id(1), "h2"), Admission::Admitted);
    }

    #[test]
    fn test_cancel_during_run_returns_handle() {
        let mut registry: InFlightRegistry<&str, u32> = InFlightRegistry::new();
        registry.admit(id(1), "h1");
        assert_eq!(registry.record_cancel(id(1), 0), Some(&"h1"));
        assert!(registry.has_cancel_intent(&id(1)));
    }

    #[test]
    fn test_duplicate_admission() {
        let mut registry: InFlightRegistry<&str, u32> = InFlightRegistry::new();
        registry.admit(id(1), "h1");
        assert_eq!(registry.admit(id(1), "h2"), Admission::AlreadyInFlight);
        assert_eq!(registry.release(&id(1)), Some("h1"));
    }

    #[test]
    fn test_duplicate_admission_keeps_intent_for_running_job() {
        let mut registry: InFlightRegistry<&str, u32> = InFlightRegistry::new();
        registry.admit(id(1), "h1");
        registry.record_cancel(id(1), 0);
        assert_eq!(registry.admit(id(1), "h2"), Admission::AlreadyInFlight);
        assert!(registry.has_cancel_intent(&id(1)));
        assert_eq!(registry.release(&id(1)), Some("h1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handles_lists_running_jobs_only() {
        let mut registry: InFlightRegistry<&str, u32> = InFlightRegistry::new();
        registry.admit(id(1), "h1");
        registry.admit(id(2), "h2");
        registry.record_cancel(id(3), 0);
        let handles: Vec<_> = registry.handles().copied().collect();
        assert_eq!(handles, vec!["h1", "h2"]);
    }

    #[test]
    fn test_prune_keeps_recent_and_running() {
        let mut registry: InFlightRegistry<&str, u32> = InFlightRegistry::new();
        registry.record_cancel(id(1), 1);
        registry.record_cancel(id(2), 10);
        registry.admit(id(3), "h3");
        registry.record_cancel(id(3), 1);

        assert_eq!(registry.prune_intents(&5), 1);
        assert!(!registry.has_cancel_intent(&id(1)));
        assert!(registry.has_cancel_intent(&id(2)));
        assert!(registry.has_cancel_intent(&id(3)));
        assert_eq!(registry.intent_len(), 2);
        assert_eq!(registry.in_flight_len(), 1);
    }

    #[test]
    fn test_repeated_cancel_keeps_first_stamp() {
        let mut registry: InFlightRegistry<&str, u32> = InFlightRegistry::new();
        registry.record_cancel(id(1), 1);
        registry.record_cancel(id(1), 100);
        assert_eq!(registry.prune_intents(&5), 1);
    }
}
