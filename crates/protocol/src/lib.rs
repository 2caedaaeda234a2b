//! Cross-thread vocabulary of the frame pipeline.
//!
//! Everything the producer and consumer threads exchange is defined here:
//! pipeline stages, early-out reasons, the move-only [`CommitPackage`], the
//! one-shot [`completion_gate`], [`DeliveryPromise`]s and the two mailbox
//! message enums. Feature crates depend on this crate; it depends on nothing
//! in the workspace.

pub mod commit;
pub mod gate;
pub mod promise;

use std::time::{Duration, Instant};

pub use commit::{CommitCompletion, CommitPackage, CommitParts, CommitTimings, ReadyToCommitMetrics};
pub use gate::{GateSignal, GateWaitError, GateWaiter, completion_gate};
pub use promise::{BreakReason, DeliveryOutcome, DeliveryPromise, PromiseList, PromiseRegistry};

pub type SourceFrameNumber = u64;
pub type FrameToken = u64;

/// How far a single update cycle is allowed to progress.
///
/// Ordered: `None < Animate < UpdateLayers < Commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PipelineStage {
    #[default]
    None,
    Animate,
    UpdateLayers,
    Commit,
}

impl PipelineStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            PipelineStage::None => "none",
            PipelineStage::Animate => "animate",
            PipelineStage::UpdateLayers => "update_layers",
            PipelineStage::Commit => "commit",
        }
    }
}

/// Why a pipeline pass terminated before reaching the commit stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EarlyOutReason {
    NotVisible,
    DeferredContentUpdate,
    DeferredCommit,
    NoUpdates,
    CriticalDependencyUnresolved,
}

impl EarlyOutReason {
    /// A no-op pass still counts as a finished commit for scheduling purposes.
    pub const fn handled_commit(self) -> bool {
        matches!(self, EarlyOutReason::NoUpdates)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EarlyOutReason::NotVisible => "not_visible",
            EarlyOutReason::DeferredContentUpdate => "deferred_content_update",
            EarlyOutReason::DeferredCommit => "deferred_commit",
            EarlyOutReason::NoUpdates => "no_updates",
            EarlyOutReason::CriticalDependencyUnresolved => "critical_dependency_unresolved",
        }
    }
}

/// Priority the rasterizer should give the active versus the pending content tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TreePriority {
    #[default]
    SamePriorityForBothTrees,
    SmoothnessTakesPriority,
    NewContentTakesPriority,
}

/// Interaction state sampled by the consumer at every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InteractionSignals {
    pub pointer_gesture_active: bool,
    pub scroll_gesture_active: bool,
    pub pinch_active: bool,
    pub programmatic_scroll_animating: bool,
    pub visible_surface_empty: bool,
    pub critical_resource_evicted: bool,
}

impl InteractionSignals {
    pub const fn interaction_active(&self) -> bool {
        self.pointer_gesture_active
            || self.scroll_gesture_active
            || self.pinch_active
            || self.programmatic_scroll_animating
    }

    pub const fn requires_new_content(&self) -> bool {
        self.visible_surface_empty || self.critical_resource_evicted
    }
}

/// Timing of one frame opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickArgs {
    pub frame_id: u64,
    pub frame_time: Instant,
    pub deadline: Instant,
    pub interval: Duration,
}

impl TickArgs {
    pub fn new(frame_id: u64, frame_time: Instant, interval: Duration) -> Self {
        Self {
            frame_id,
            frame_time,
            deadline: frame_time + interval / 2,
            interval,
        }
    }
}

/// Scroll and pinch deltas accumulated on the consumer since the last update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InteractionDeltas {
    pub scroll_x: f32,
    pub scroll_y: f32,
    pub page_scale: f32,
}

impl InteractionDeltas {
    pub fn has_changes(&self) -> bool {
        self.scroll_x != 0.0 || self.scroll_y != 0.0 || self.page_scale != 1.0
    }

    pub fn accumulate(&mut self, other: InteractionDeltas) {
        self.scroll_x += other.scroll_x;
        self.scroll_y += other.scroll_y;
        self.page_scale *= other.page_scale;
    }
}

impl Default for InteractionDeltas {
    fn default() -> Self {
        Self {
            scroll_x: 0.0,
            scroll_y: 0.0,
            page_scale: 1.0,
        }
    }
}

/// Payload of one dispatched "begin producer update".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateRequest {
    pub tick: TickArgs,
    pub interaction: InteractionDeltas,
    pub sent_at: Instant,
}

/// Outcome of one scheduled draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawResult {
    Success { frame_token: FrameToken },
    AbortedCantDraw,
    AbortedNotReady,
    AbortedNoSink,
    AbortedDrawFailed,
}

impl DrawResult {
    pub const fn is_success(&self) -> bool {
        matches!(self, DrawResult::Success { .. })
    }
}

/// Requests external callers route to the producer thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerRequest {
    SetNeedsAnimate,
    SetNeedsUpdateLayers,
    SetNeedsCommit,
    SetVisible(bool),
    SetDeferContentUpdates(bool),
    StartDeferringCommits(Duration),
    StopDeferringCommits,
    CriticalDependencyResolved,
}

/// Messages posted to the producer thread.
#[derive(Debug)]
pub enum ProducerMsg {
    Request(ProducerRequest),
    BeginUpdate(UpdateRequest),
    BeginUpdateNotExpected,
    /// Non-blocking commit acknowledgement; `None` when the consumer abandoned the commit.
    CommitCompleted(Option<CommitCompletion>),
    DidCommitAndDraw {
        source_frame_number: SourceFrameNumber,
    },
    Stop,
}

/// Messages posted to the consumer thread.
#[derive(Debug)]
pub enum ConsumerMsg<Delta> {
    SetNeedsBeginProducerUpdate,
    SetNeedsRedraw {
        completion: Option<GateSignal<DrawResult>>,
    },
    SetVisible(bool),
    ReceiveCommitPackage {
        gate: GateSignal<CommitCompletion>,
        package: CommitPackage<Delta>,
    },
    BeginUpdateAborted(EarlyOutReason),
    Interaction(InteractionSignals),
    AccumulateInteraction(InteractionDeltas),
    PresentationFeedback {
        frame_token: FrameToken,
        presented_at: Instant,
    },
    DidLoseOutputSink,
    SupplyOutputSink,
    Stop,
}
