//! Delivery promises.
//!
//! A [`DeliveryPromise`] is registered by an external caller before it asks
//! for an update. It travels with the commit it was drained into and is
//! resolved exactly once: fulfilled when the update reaches the display,
//! resolved as a no-op when the pass had nothing to commit, or broken with a
//! [`BreakReason`] when the pipeline abandons it.

use std::fmt;

use crossbeam_channel::{Receiver, bounded};
use crossbeam_queue::SegQueue;
use smallvec::SmallVec;

use crate::FrameToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakReason {
    CommitFails,
    ActivationFails,
    SwapFails,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOutcome {
    Delivered { frame_token: FrameToken },
    NoUpdate,
    Broken(BreakReason),
}

type Resolve = Box<dyn FnOnce(DeliveryOutcome) + Send>;

pub struct DeliveryPromise {
    trace_id: u64,
    resolve: Option<Resolve>,
}

impl DeliveryPromise {
    pub fn new<F>(trace_id: u64, resolve: F) -> Self
    where
        F: FnOnce(DeliveryOutcome) + Send + 'static,
    {
        Self {
            trace_id,
            resolve: Some(Box::new(resolve)),
        }
    }

    /// Promise whose outcome is delivered on the returned receiver.
    pub fn channel(trace_id: u64) -> (Self, Receiver<DeliveryOutcome>) {
        let (sender, receiver) = bounded(1);
        let promise = Self::new(trace_id, move |outcome| {
            let _ = sender.send(outcome);
        });
        (promise, receiver)
    }

    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    pub fn fulfill(self, frame_token: FrameToken) {
        self.resolve(DeliveryOutcome::Delivered { frame_token });
    }

    pub fn resolve_no_update(self) {
        self.resolve(DeliveryOutcome::NoUpdate);
    }

    pub fn break_with(self, reason: BreakReason) {
        self.resolve(DeliveryOutcome::Broken(reason));
    }

    fn resolve(mut self, outcome: DeliveryOutcome) {
        if let Some(resolve) = self.resolve.take() {
            resolve(outcome);
        }
    }
}

impl Drop for DeliveryPromise {
    fn drop(&mut self) {
        if let Some(resolve) = self.resolve.take() {
            tracing::warn!(
                trace_id = self.trace_id,
                "delivery promise dropped unresolved; breaking with commit failure"
            );
            resolve(DeliveryOutcome::Broken(BreakReason::CommitFails));
        }
    }
}

impl fmt::Debug for DeliveryPromise {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DeliveryPromise")
            .field("trace_id", &self.trace_id)
            .field("pending", &self.resolve.is_some())
            .finish()
    }
}

pub type PromiseList = SmallVec<[DeliveryPromise; 2]>;

pub fn fulfill_all(promises: &mut PromiseList, frame_token: FrameToken) {
    for promise in promises.drain(..) {
        promise.fulfill(frame_token);
    }
}

pub fn resolve_all_no_update(promises: &mut PromiseList) {
    for promise in promises.drain(..) {
        promise.resolve_no_update();
    }
}

pub fn break_all(promises: &mut PromiseList, reason: BreakReason) {
    if !promises.is_empty() {
        tracing::debug!(count = promises.len(), ?reason, "breaking delivery promises");
    }
    for promise in promises.drain(..) {
        promise.break_with(reason);
    }
}

/// Queue external callers push promises onto before requesting an update.
///
/// Safe to share between threads; the producer drains it once per pass.
#[derive(Debug, Default)]
pub struct PromiseRegistry {
    queue: SegQueue<DeliveryPromise>,
}

impl PromiseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, promise: DeliveryPromise) {
        self.queue.push(promise);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn drain(&self) -> PromiseList {
        let mut promises = PromiseList::new();
        while let Some(promise) = self.queue.pop() {
            promises.push(promise);
        }
        promises
    }

    pub fn break_pending(&self, reason: BreakReason) {
        let mut promises = self.drain();
        break_all(&mut promises, reason);
    }

    pub fn resolve_pending_no_update(&self) {
        let mut promises = self.drain();
        resolve_all_no_update(&mut promises);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fulfilled_promise_reports_frame_token() {
        let (promise, outcome) = DeliveryPromise::channel(1);
        promise.fulfill(42);
        assert_eq!(
            outcome.try_recv(),
            Ok(DeliveryOutcome::Delivered { frame_token: 42 })
        );
    }

    #[test]
    fn dropped_promise_breaks_with_commit_failure() {
        let (promise, outcome) = DeliveryPromise::channel(2);
        drop(promise);
        assert_eq!(
            outcome.try_recv(),
            Ok(DeliveryOutcome::Broken(BreakReason::CommitFails))
        );
        assert!(outcome.try_recv().is_err(), "promise resolved more than once");
    }

    #[test]
    fn registry_drains_in_push_order() {
        let registry = PromiseRegistry::new();
        let (first, _first_outcome) = DeliveryPromise::channel(10);
        let (second, _second_outcome) = DeliveryPromise::channel(11);
        registry.push(first);
        registry.push(second);
        assert_eq!(registry.len(), 2);

        let mut drained = registry.drain();
        assert!(registry.is_empty());
        let ids: Vec<u64> = drained.iter().map(DeliveryPromise::trace_id).collect();
        assert_eq!(ids, vec![10, 11]);
        resolve_all_no_update(&mut drained);
    }

    #[test]
    fn break_pending_resolves_every_queued_promise() {
        let registry = PromiseRegistry::new();
        let (first, first_outcome) = DeliveryPromise::channel(1);
        let (second, second_outcome) = DeliveryPromise::channel(2);
        registry.push(first);
        registry.push(second);

        registry.break_pending(BreakReason::CommitFails);

        for outcome in [first_outcome, second_outcome] {
            assert_eq!(
                outcome.try_recv(),
                Ok(DeliveryOutcome::Broken(BreakReason::CommitFails))
            );
        }
    }
}
