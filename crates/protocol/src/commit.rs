//! The move-only commit package handed from producer to consumer.

use std::time::Instant;

use crate::SourceFrameNumber;
use crate::promise::PromiseList;

/// Timestamp record carried by a commit.
///
/// The producer fills `begin_update_start`; the consumer fills the rest as it
/// applies and activates the commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitTimings {
    pub begin_update_start: Instant,
    pub commit_start: Option<Instant>,
    pub commit_finish: Option<Instant>,
    pub activation_finish: Option<Instant>,
}

impl CommitTimings {
    pub fn started_at(begin_update_start: Instant) -> Self {
        Self {
            begin_update_start,
            commit_start: None,
            commit_finish: None,
            activation_finish: None,
        }
    }
}

/// Metrics handed to the scheduler when a commit becomes ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyToCommitMetrics {
    pub source_frame_number: SourceFrameNumber,
    pub begin_update_start: Instant,
    pub ready_at: Instant,
}

/// What the producer learns once the consumer is done with a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitCompletion {
    pub source_frame_number: SourceFrameNumber,
    pub timings: CommitTimings,
    pub activated: bool,
}

/// One committed content update.
///
/// Deliberately not `Clone`: the package is created by the producer, moved
/// across the thread boundary once, and consumed when the consumer applies it.
#[derive(Debug)]
pub struct CommitPackage<Delta> {
    source_frame_number: SourceFrameNumber,
    activation_gated: bool,
    delta: Delta,
    promises: PromiseList,
    timings: CommitTimings,
}

#[derive(Debug)]
pub struct CommitParts<Delta> {
    pub source_frame_number: SourceFrameNumber,
    pub activation_gated: bool,
    pub delta: Delta,
    pub promises: PromiseList,
    pub timings: CommitTimings,
}

impl<Delta> CommitPackage<Delta> {
    pub fn new(
        source_frame_number: SourceFrameNumber,
        activation_gated: bool,
        delta: Delta,
        promises: PromiseList,
        timings: CommitTimings,
    ) -> Self {
        Self {
            source_frame_number,
            activation_gated,
            delta,
            promises,
            timings,
        }
    }

    pub fn source_frame_number(&self) -> SourceFrameNumber {
        self.source_frame_number
    }

    pub fn activation_gated(&self) -> bool {
        self.activation_gated
    }

    pub fn timings(&self) -> &CommitTimings {
        &self.timings
    }

    pub fn promise_count(&self) -> usize {
        self.promises.len()
    }

    pub fn ready_to_commit_metrics(&self, ready_at: Instant) -> ReadyToCommitMetrics {
        ReadyToCommitMetrics {
            source_frame_number: self.source_frame_number,
            begin_update_start: self.timings.begin_update_start,
            ready_at,
        }
    }

    pub fn into_parts(self) -> CommitParts<Delta> {
        CommitParts {
            source_frame_number: self.source_frame_number,
            activation_gated: self.activation_gated,
            delta: self.delta,
            promises: self.promises,
            timings: self.timings,
        }
    }
}
