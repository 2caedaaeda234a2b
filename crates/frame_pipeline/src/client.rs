//! Collaborators the coordinators drive.
//!
//! [`ContentClient`] lives on the producer thread and computes content.
//! [`Rasterizer`] lives on the consumer thread and turns committed content
//! into frames. Neither trait ever sees the other side of the pipeline.

use std::time::Duration;

use protocol::{
    CommitCompletion, EarlyOutReason, FrameToken, InteractionDeltas, PipelineStage,
    SourceFrameNumber, TickArgs, TreePriority,
};

/// Result of recomputing layers during a pipeline pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Changed,
    Unchanged,
    /// A resource the next frame cannot do without is still outstanding.
    Blocked,
}

/// Stage requests recorded while a content callback runs.
///
/// Applied by the producer after the callback returns: a request for a stage
/// the running pass has not reached yet extends the pass, anything else is
/// scheduled for the next pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageRequests {
    animate: bool,
    update_layers: bool,
    commit: bool,
}

impl StageRequests {
    pub fn set_needs_animate(&mut self) {
        self.animate = true;
    }

    pub fn set_needs_update_layers(&mut self) {
        self.update_layers = true;
    }

    pub fn set_needs_commit(&mut self) {
        self.commit = true;
    }

    pub fn is_empty(&self) -> bool {
        !(self.animate || self.update_layers || self.commit)
    }

    pub(crate) fn requested_stages(&self) -> impl Iterator<Item = PipelineStage> + '_ {
        [
            (self.animate, PipelineStage::Animate),
            (self.update_layers, PipelineStage::UpdateLayers),
            (self.commit, PipelineStage::Commit),
        ]
        .into_iter()
        .filter_map(|(requested, stage)| requested.then_some(stage))
    }
}

/// Producer-thread content model.
pub trait ContentClient {
    type Delta: Send + 'static;

    fn animate(&mut self, tick: &TickArgs, requests: &mut StageRequests);

    fn apply_interaction_deltas(&mut self, deltas: InteractionDeltas) {
        let _ = deltas;
    }

    fn update_layers(&mut self, requests: &mut StageRequests) -> UpdateOutcome;

    /// Move the accumulated changes out for one commit.
    fn take_delta(&mut self) -> Self::Delta;

    /// `None` when the consumer abandoned the commit.
    fn did_commit(&mut self, completion: Option<&CommitCompletion>) {
        let _ = completion;
    }

    fn did_commit_and_draw(&mut self, source_frame_number: SourceFrameNumber) {
        let _ = source_frame_number;
    }

    fn begin_update_not_expected(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutputSinkError {
    #[error("output sink unavailable: {0}")]
    Unavailable(String),
    #[error("output sink initialization failed: {0}")]
    InitFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DrawError {
    #[error("resources for the frame are not ready")]
    ResourcesNotReady,
    #[error("frame contains no drawable content")]
    NothingToDraw,
}

/// Readiness reported after a resource preparation step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceReadiness {
    pub ready_to_activate: bool,
    pub ready_to_draw: bool,
}

impl ResourceReadiness {
    pub const READY: Self = Self {
        ready_to_activate: true,
        ready_to_draw: true,
    };
}

/// Per-draw scratch state handed to the rasterizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameData {
    pub frame_token: FrameToken,
    pub forced: bool,
    pub source_frame_number: Option<SourceFrameNumber>,
    pub has_missing_content: bool,
}

impl FrameData {
    pub fn new(
        frame_token: FrameToken,
        forced: bool,
        source_frame_number: Option<SourceFrameNumber>,
    ) -> Self {
        Self {
            frame_token,
            forced,
            source_frame_number,
            has_missing_content: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawMetrics {
    pub layers_drawn: u32,
    pub gpu_time: Duration,
}

/// Consumer-thread rasterizer.
pub trait Rasterizer {
    type Delta;

    fn create_output_sink(&mut self) -> Result<(), OutputSinkError>;
    fn release_output_sink(&mut self);

    fn apply_commit(&mut self, delta: Self::Delta);
    fn activate_content_tree(&mut self);
    fn prepare_resources(&mut self) -> ResourceReadiness;

    fn can_draw(&self) -> bool;
    fn prepare_to_draw(&mut self, frame: &mut FrameData) -> Result<(), DrawError>;
    /// `None` when the frame could not be submitted.
    fn draw_layers(&mut self, frame: &FrameData) -> Option<DrawMetrics>;
    fn did_draw_all_layers(&mut self, frame: &FrameData);

    fn set_tree_priority(&mut self, priority: TreePriority) {
        let _ = priority;
    }

    fn begin_update_aborted(&mut self, reason: EarlyOutReason) {
        let _ = reason;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_requests_report_in_stage_order() {
        let mut requests = StageRequests::default();
        assert!(requests.is_empty());
        requests.set_needs_commit();
        requests.set_needs_animate();
        let stages: Vec<_> = requests.requested_stages().collect();
        assert_eq!(stages, vec![PipelineStage::Animate, PipelineStage::Commit]);
    }
}
