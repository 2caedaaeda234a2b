//! Consumer-side coordinator.
//!
//! Owns the [`FrameScheduler`], the rasterizer and whatever commit is in
//! flight. The scheduler decides what happens next; this type performs each
//! action against the rasterizer and reports back, so the scheduler is never
//! re-entered while an action runs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use engine::{Clock, ProducerHandle, TelemetryEvent, TelemetrySink};
use frame_scheduler::{
    DeadlineMode, FrameScheduler, OutputSinkState, SchedulerAction, SchedulerConfig,
};
use protocol::promise::{break_all, fulfill_all};
use protocol::{
    BreakReason, CommitCompletion, CommitPackage, ConsumerMsg, DrawResult, EarlyOutReason,
    FrameToken, GateSignal, InteractionDeltas, ProducerMsg, PromiseList, SourceFrameNumber,
    TickArgs, UpdateRequest,
};
use smallvec::SmallVec;

use crate::client::{FrameData, OutputSinkError, Rasterizer};
use crate::config::PipelineConfig;

/// Drawn frames kept for presentation feedback; older ones are forgotten.
pub(crate) const PRESENTATION_WINDOW: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub commit_to_active_tree: bool,
    pub scheduler: SchedulerConfig,
}

impl From<&PipelineConfig> for ConsumerSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            commit_to_active_tree: config.commit_to_active_tree,
            scheduler: config.scheduler,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerFlow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub commits_applied: u64,
    pub rejected_packages: u64,
    pub activations: u64,
    pub frames_drawn: u64,
    pub draw_aborts: u64,
    pub forced_draws: u64,
    pub presentations: u64,
    pub stale_feedback: u64,
}

struct PendingCommit<Delta> {
    gate: GateSignal<CommitCompletion>,
    package: CommitPackage<Delta>,
}

/// Commit gate held back until the committed tree is active.
struct ActivationGate {
    gate: GateSignal<CommitCompletion>,
    completion: CommitCompletion,
}

impl ActivationGate {
    fn release(self, activated_at: Instant) {
        let mut completion = self.completion;
        completion.timings.activation_finish = Some(activated_at);
        completion.activated = true;
        self.gate.signal(completion);
    }
}

struct PendingTree {
    source_frame_number: SourceFrameNumber,
    promises: PromiseList,
    activation_gate: Option<ActivationGate>,
}

#[derive(Default)]
struct ActiveTree {
    source_frame_number: Option<SourceFrameNumber>,
    promises: PromiseList,
    /// Newest activated commit that has not reached a successful draw yet.
    undrawn_commit: Option<SourceFrameNumber>,
}

#[derive(Debug, Clone, Copy)]
struct SubmittedFrame {
    frame_token: FrameToken,
    drawn_at: Instant,
}

pub struct ConsumerCoordinator<R: Rasterizer> {
    scheduler: FrameScheduler,
    rasterizer: Option<R>,
    producer: ProducerHandle,
    clock: Arc<dyn Clock>,
    telemetry: Box<dyn TelemetrySink>,
    settings: ConsumerSettings,

    pending_commit: Option<PendingCommit<R::Delta>>,
    pending_tree: Option<PendingTree>,
    active_tree: ActiveTree,
    draw_completions: SmallVec<[GateSignal<DrawResult>; 2]>,
    interaction: InteractionDeltas,

    next_frame_token: FrameToken,
    submitted_frames: VecDeque<SubmittedFrame>,
    last_draw: Option<DrawResult>,
    stats: ConsumerStats,
    shut_down: bool,
}

impl<R: Rasterizer> ConsumerCoordinator<R> {
    pub fn new(
        rasterizer: R,
        producer: ProducerHandle,
        clock: Arc<dyn Clock>,
        telemetry: Box<dyn TelemetrySink>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            scheduler: FrameScheduler::new(settings.scheduler),
            rasterizer: Some(rasterizer),
            producer,
            clock,
            telemetry,
            settings,
            pending_commit: None,
            pending_tree: None,
            active_tree: ActiveTree::default(),
            draw_completions: SmallVec::new(),
            interaction: InteractionDeltas::default(),
            next_frame_token: 1,
            submitted_frames: VecDeque::new(),
            last_draw: None,
            stats: ConsumerStats::default(),
            shut_down: false,
        }
    }

    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    pub fn rasterizer(&self) -> Option<&R> {
        self.rasterizer.as_ref()
    }

    pub fn rasterizer_mut(&mut self) -> Option<&mut R> {
        self.rasterizer.as_mut()
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    pub fn last_draw_result(&self) -> Option<DrawResult> {
        self.last_draw
    }

    pub fn has_pending_commit(&self) -> bool {
        self.pending_commit.is_some()
    }

    pub fn pending_tree_source_frame(&self) -> Option<SourceFrameNumber> {
        self.pending_tree.as_ref().map(|tree| tree.source_frame_number)
    }

    pub fn active_tree_source_frame(&self) -> Option<SourceFrameNumber> {
        self.active_tree.source_frame_number
    }

    /// Drawn frames still waiting for presentation feedback.
    pub fn unpresented_frames(&self) -> usize {
        self.submitted_frames.len()
    }

    pub fn active_tree_promise_count(&self) -> usize {
        self.active_tree.promises.len()
    }

    pub fn deadline_mode(&self) -> DeadlineMode {
        self.scheduler.deadline_mode()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    // Messages.

    pub fn handle_message(&mut self, message: ConsumerMsg<R::Delta>) -> ConsumerFlow {
        match message {
            ConsumerMsg::SetNeedsBeginProducerUpdate => {
                self.scheduler.set_needs_begin_producer_update()
            }
            ConsumerMsg::SetNeedsRedraw { completion } => {
                self.scheduler.set_needs_redraw();
                if let Some(completion) = completion {
                    if self.shut_down {
                        completion.signal(DrawResult::AbortedCantDraw);
                    } else {
                        self.draw_completions.push(completion);
                    }
                }
            }
            ConsumerMsg::SetVisible(visible) => self.scheduler.set_visible(visible),
            ConsumerMsg::ReceiveCommitPackage { gate, package } => {
                self.on_receive_commit_package(gate, package)
            }
            ConsumerMsg::BeginUpdateAborted(reason) => self.on_begin_update_aborted(reason),
            ConsumerMsg::Interaction(signals) => self.scheduler.set_interaction_signals(signals),
            ConsumerMsg::AccumulateInteraction(deltas) => {
                self.interaction.accumulate(deltas);
                self.scheduler.set_needs_redraw();
                self.scheduler.set_needs_begin_producer_update();
            }
            ConsumerMsg::PresentationFeedback {
                frame_token,
                presented_at,
            } => {
                self.on_presentation_feedback(frame_token, presented_at);
            }
            ConsumerMsg::DidLoseOutputSink => self.did_lose_output_sink(),
            ConsumerMsg::SupplyOutputSink => self.supply_output_sink(),
            ConsumerMsg::Stop => {
                self.shutdown();
                return ConsumerFlow::Stop;
            }
        }
        self.process_scheduled_actions();
        ConsumerFlow::Continue
    }

    // Ticks.

    pub fn begin_tick(&mut self, args: TickArgs) {
        if self.shut_down {
            return;
        }
        if let Some(priority) = self.scheduler.begin_tick(args) {
            if let Some(rasterizer) = self.rasterizer.as_mut() {
                rasterizer.set_tree_priority(priority);
            }
        }
        self.process_scheduled_actions();
    }

    pub fn on_tick_deadline(&mut self) {
        self.scheduler.on_tick_deadline();
        self.process_scheduled_actions();
        self.scheduler.end_tick();
    }

    pub fn process_scheduled_actions(&mut self) {
        loop {
            let action = self.scheduler.next_action();
            if action == SchedulerAction::None {
                break;
            }
            tracing::debug!(?action, "scheduled action");
            self.perform(action);
        }
    }

    fn perform(&mut self, action: SchedulerAction) {
        match action {
            SchedulerAction::None => {}
            SchedulerAction::CreateOutputSink => self.create_output_sink(),
            SchedulerAction::ActivatePendingTree => self.on_scheduled_activation(),
            SchedulerAction::Commit => self.on_scheduled_commit(),
            SchedulerAction::PrepareResources => self.prepare_resources(),
            SchedulerAction::Draw { forced } => {
                self.on_scheduled_draw(forced);
            }
            SchedulerAction::SendBeginProducerUpdate => self.send_begin_producer_update(),
            SchedulerAction::NotifyBeginProducerUpdateNotExpected => {
                self.scheduler.will_notify_begin_producer_update_not_expected();
                if let Err(error) = self.producer.post(ProducerMsg::BeginUpdateNotExpected) {
                    tracing::debug!(%error, "update-not-expected hint dropped");
                }
            }
        }
    }

    fn create_output_sink(&mut self) {
        self.scheduler.will_create_output_sink();
        let result = match self.rasterizer.as_mut() {
            Some(rasterizer) => rasterizer.create_output_sink(),
            None => Err(OutputSinkError::Unavailable("rasterizer released".to_owned())),
        };
        match result {
            Ok(()) => self.scheduler.did_create_output_sink(),
            Err(error) => {
                tracing::warn!(%error, "output sink creation failed");
                self.scheduler.did_fail_create_output_sink();
            }
        }
    }

    fn prepare_resources(&mut self) {
        let readiness = self
            .rasterizer
            .as_mut()
            .map(|rasterizer| rasterizer.prepare_resources())
            .unwrap_or_default();
        self.scheduler.did_prepare_resources();
        if readiness.ready_to_activate {
            self.scheduler.notify_ready_to_activate();
        } else if self.scheduler.has_pending_tree() {
            // Retried on the next tick.
            self.scheduler.set_needs_prepare_resources();
        }
        if readiness.ready_to_draw {
            self.scheduler.notify_ready_to_draw();
        }
        tracing::debug!(
            ready_to_activate = readiness.ready_to_activate,
            ready_to_draw = readiness.ready_to_draw,
            "resources prepared"
        );
    }

    fn send_begin_producer_update(&mut self) {
        let now = self.clock.now();
        let tick = self
            .scheduler
            .current_tick()
            .unwrap_or_else(|| TickArgs::new(0, now, Duration::ZERO));
        self.scheduler.will_send_begin_producer_update();
        let request = UpdateRequest {
            tick,
            interaction: std::mem::take(&mut self.interaction),
            sent_at: now,
        };
        if let Err(error) = self.producer.post(ProducerMsg::BeginUpdate(request)) {
            tracing::warn!(%error, "begin producer update not delivered");
        }
    }

    // Commit.

    pub fn on_receive_commit_package(
        &mut self,
        gate: GateSignal<CommitCompletion>,
        package: CommitPackage<R::Delta>,
    ) {
        if self.rasterizer.is_none() || self.shut_down {
            tracing::debug!(
                source_frame_number = package.source_frame_number(),
                "rejecting commit package after teardown"
            );
            self.stats.rejected_packages += 1;
            let mut parts = package.into_parts();
            break_all(&mut parts.promises, BreakReason::CommitFails);
            gate.abandon();
            return;
        }
        debug_assert!(
            self.pending_commit.is_none(),
            "protocol violation: commit package received while another is pending"
        );
        let metrics = package.ready_to_commit_metrics(self.clock.now());
        self.scheduler.notify_ready_to_commit(metrics);
        self.pending_commit = Some(PendingCommit { gate, package });
    }

    pub fn on_scheduled_commit(&mut self) {
        let creates_pending_tree = !self.settings.commit_to_active_tree;
        let Some(PendingCommit { gate, package }) = self.pending_commit.take() else {
            debug_assert!(false, "protocol violation: commit scheduled without a package");
            self.scheduler.did_commit(false);
            return;
        };
        let mut parts = package.into_parts();
        let Some(rasterizer) = self.rasterizer.as_mut() else {
            break_all(&mut parts.promises, BreakReason::CommitFails);
            gate.abandon();
            self.scheduler.did_commit(false);
            return;
        };

        parts.timings.commit_start = Some(self.clock.now());
        rasterizer.apply_commit(parts.delta);
        parts.timings.commit_finish = Some(self.clock.now());
        self.stats.commits_applied += 1;

        let completion = CommitCompletion {
            source_frame_number: parts.source_frame_number,
            timings: parts.timings,
            activated: false,
        };
        tracing::debug!(
            source_frame_number = parts.source_frame_number,
            creates_pending_tree,
            "commit applied"
        );

        if creates_pending_tree {
            debug_assert!(
                self.pending_tree.is_none(),
                "protocol violation: commit over an unactivated pending tree"
            );
            let activation_gate = if parts.activation_gated {
                Some(ActivationGate { gate, completion })
            } else {
                gate.signal(completion);
                None
            };
            self.pending_tree = Some(PendingTree {
                source_frame_number: parts.source_frame_number,
                promises: parts.promises,
                activation_gate,
            });
        } else {
            rasterizer.activate_content_tree();
            self.stats.activations += 1;
            let activated_at = self.clock.now();
            self.absorb_into_active_tree(parts.source_frame_number, parts.promises);
            ActivationGate { gate, completion }.release(activated_at);
        }
        self.scheduler.did_commit(creates_pending_tree);
    }

    pub fn on_scheduled_activation(&mut self) {
        if let Some(tree) = self.pending_tree.take() {
            if let Some(rasterizer) = self.rasterizer.as_mut() {
                rasterizer.activate_content_tree();
            }
            self.stats.activations += 1;
            let activated_at = self.clock.now();
            tracing::debug!(
                source_frame_number = tree.source_frame_number,
                "pending tree activated"
            );
            self.absorb_into_active_tree(tree.source_frame_number, tree.promises);
            if let Some(activation_gate) = tree.activation_gate {
                activation_gate.release(activated_at);
            }
        }
        self.scheduler.did_activate();
    }

    fn absorb_into_active_tree(
        &mut self,
        source_frame_number: SourceFrameNumber,
        promises: PromiseList,
    ) {
        self.active_tree.source_frame_number = Some(source_frame_number);
        self.active_tree.undrawn_commit = Some(source_frame_number);
        self.active_tree.promises.extend(promises);
    }

    // Draw.

    /// Draw the active tree. Every queued draw-completion gate is signaled
    /// with the result, success or not.
    pub fn on_scheduled_draw(&mut self, forced: bool) -> DrawResult {
        self.scheduler.will_draw();
        let result = self.draw(forced);
        self.scheduler.did_draw(result);
        self.last_draw = Some(result);
        if forced {
            self.stats.forced_draws += 1;
        }
        if !result.is_success() {
            self.stats.draw_aborts += 1;
            tracing::debug!(?result, forced, "draw aborted");
        }
        for completion in self.draw_completions.drain(..) {
            completion.signal(result);
        }
        result
    }

    fn draw(&mut self, forced: bool) -> DrawResult {
        if self.scheduler.output_sink_state() != OutputSinkState::Active {
            return DrawResult::AbortedNoSink;
        }
        let Some(rasterizer) = self.rasterizer.as_mut() else {
            return DrawResult::AbortedCantDraw;
        };
        let mut frame = FrameData::new(
            self.next_frame_token,
            forced,
            self.active_tree.source_frame_number,
        );
        if !rasterizer.can_draw() {
            if forced {
                rasterizer.did_draw_all_layers(&frame);
            }
            return DrawResult::AbortedCantDraw;
        }
        if let Err(error) = rasterizer.prepare_to_draw(&mut frame) {
            if !forced {
                tracing::debug!(%error, "frame not ready");
                return DrawResult::AbortedNotReady;
            }
            tracing::debug!(%error, "forced draw with missing content");
            frame.has_missing_content = true;
        }
        let metrics = rasterizer.draw_layers(&frame);
        rasterizer.did_draw_all_layers(&frame);
        let Some(metrics) = metrics else {
            return DrawResult::AbortedDrawFailed;
        };

        let frame_token = self.next_frame_token;
        self.next_frame_token += 1;
        let drawn_at = self.clock.now();
        if self.submitted_frames.len() == PRESENTATION_WINDOW {
            if let Some(forgotten) = self.submitted_frames.pop_front() {
                tracing::debug!(
                    frame_token = forgotten.frame_token,
                    "presentation feedback window full"
                );
            }
        }
        self.submitted_frames.push_back(SubmittedFrame {
            frame_token,
            drawn_at,
        });
        self.stats.frames_drawn += 1;
        fulfill_all(&mut self.active_tree.promises, frame_token);
        self.telemetry.record(TelemetryEvent::FrameDrawn {
            frame_token,
            at: drawn_at,
        });
        tracing::debug!(frame_token, layers = metrics.layers_drawn, "frame drawn");

        if let Some(source_frame_number) = self.active_tree.undrawn_commit.take() {
            let message = ProducerMsg::DidCommitAndDraw {
                source_frame_number,
            };
            if let Err(error) = self.producer.post(message) {
                tracing::debug!(%error, "commit-and-draw notification dropped");
            }
        }
        DrawResult::Success { frame_token }
    }

    // Feedback.

    pub fn on_begin_update_aborted(&mut self, reason: EarlyOutReason) {
        self.scheduler.begin_producer_update_aborted(reason);
        if let Some(rasterizer) = self.rasterizer.as_mut() {
            rasterizer.begin_update_aborted(reason);
        }
    }

    /// Returns whether the token matched a submitted frame.
    pub fn on_presentation_feedback(
        &mut self,
        frame_token: FrameToken,
        presented_at: Instant,
    ) -> bool {
        let mut matched = false;
        while let Some(front) = self.submitted_frames.front().copied() {
            if front.frame_token > frame_token {
                break;
            }
            self.submitted_frames.pop_front();
            if front.frame_token == frame_token {
                let latency = presented_at.saturating_duration_since(front.drawn_at);
                self.telemetry.record(TelemetryEvent::FramePresented {
                    frame_token,
                    latency,
                });
                self.stats.presentations += 1;
                matched = true;
            }
        }
        if !matched {
            self.stats.stale_feedback += 1;
            tracing::debug!(frame_token, "ignoring stale presentation feedback");
        }
        matched
    }

    // Output sink.

    pub fn did_lose_output_sink(&mut self) {
        self.scheduler.did_lose_output_sink();
        if let Some(rasterizer) = self.rasterizer.as_mut() {
            rasterizer.release_output_sink();
        }
        self.submitted_frames.clear();
        break_all(&mut self.active_tree.promises, BreakReason::SwapFails);
    }

    pub fn supply_output_sink(&mut self) {
        self.scheduler.output_sink_supplied();
    }

    // Shutdown.

    /// Stop the scheduler, release the sink, release every gate and promise,
    /// then drop the rasterizer.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let sink_state = self.scheduler.output_sink_state();
        self.scheduler.stop();

        if matches!(sink_state, OutputSinkState::Active | OutputSinkState::Creating) {
            if let Some(rasterizer) = self.rasterizer.as_mut() {
                rasterizer.release_output_sink();
            }
        }

        if let Some(PendingCommit { gate, package }) = self.pending_commit.take() {
            let mut parts = package.into_parts();
            break_all(&mut parts.promises, BreakReason::CommitFails);
            gate.abandon();
        }
        if let Some(mut tree) = self.pending_tree.take() {
            break_all(&mut tree.promises, BreakReason::ActivationFails);
            if let Some(activation_gate) = tree.activation_gate {
                activation_gate.gate.abandon();
            }
        }
        break_all(&mut self.active_tree.promises, BreakReason::SwapFails);
        for completion in self.draw_completions.drain(..) {
            completion.signal(DrawResult::AbortedCantDraw);
        }
        self.submitted_frames.clear();

        self.rasterizer = None;
        tracing::debug!(
            commits = self.stats.commits_applied,
            frames = self.stats.frames_drawn,
            "consumer stopped"
        );
    }
}

impl<R: Rasterizer> Drop for ConsumerCoordinator<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
