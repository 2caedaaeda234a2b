//! Producer-side coordinator.
//!
//! Owns the content client and the pipeline stage counters. Every dispatched
//! `BeginUpdate` runs one pipeline pass that either early-outs with an
//! [`EarlyOutReason`] or hands a [`CommitPackage`] to the consumer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use engine::{Clock, ConsumerHandle, TelemetryEvent, TelemetrySink};
use protocol::{
    BreakReason, CommitCompletion, CommitPackage, CommitTimings, ConsumerMsg, DeliveryPromise,
    EarlyOutReason, GateSignal, InteractionDeltas, PipelineStage, ProducerMsg, ProducerRequest,
    PromiseRegistry, SourceFrameNumber, UpdateRequest, completion_gate,
};
use smallvec::SmallVec;

use crate::client::{ContentClient, StageRequests, UpdateOutcome};
use crate::config::{CommitMode, PipelineConfig};

const COMMIT_GATE_LABEL: &str = "commit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerSettings {
    pub commit_mode: CommitMode,
    pub activation_gated_commits: bool,
}

impl From<&PipelineConfig> for ProducerSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            commit_mode: config.commit_mode,
            activation_gated_commits: config.activation_gated_commits,
        }
    }
}

/// Mailbox ends the producer needs besides its own inbox.
pub struct ProducerLinks<Delta> {
    pub consumer: ConsumerHandle<Delta>,
    /// Non-blocking commit gates post their completion through this sender.
    pub self_sender: Sender<ProducerMsg>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageSnapshot {
    pub current: PipelineStage,
    pub final_stage: PipelineStage,
    pub max_requested: PipelineStage,
    pub deferred_final: PipelineStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    EarlyOut(EarlyOutReason),
    /// Blocking commit; `completion` is `None` when the consumer abandoned it.
    Committed {
        source_frame_number: SourceFrameNumber,
        completion: Option<CommitCompletion>,
    },
    /// Non-blocking commit; completion arrives as `ProducerMsg::CommitCompleted`.
    CommitPending {
        source_frame_number: SourceFrameNumber,
    },
}

/// Stages one pass went through, in order, and how it ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassRecord {
    pub final_stage: PipelineStage,
    pub stages: SmallVec<[PipelineStage; 4]>,
    pub outcome: PassOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub passes: u64,
    pub commits: u64,
    pub early_outs: u64,
    pub update_requests_posted: u64,
    pub completions: u64,
    pub abandoned_commits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerFlow {
    Continue,
    Stop,
}

pub struct ProducerCoordinator<C: ContentClient> {
    client: C,
    links: ProducerLinks<C::Delta>,
    clock: Arc<dyn Clock>,
    telemetry: Box<dyn TelemetrySink>,
    promises: Arc<PromiseRegistry>,
    settings: ProducerSettings,

    visible: bool,
    defer_content_updates: bool,
    defer_commits_until: Option<Instant>,
    stages: StageSnapshot,
    pass_stages: SmallVec<[PipelineStage; 4]>,
    held_interaction: InteractionDeltas,

    source_frame_number: SourceFrameNumber,
    commits_in_flight: u32,
    last_completion: Option<CommitCompletion>,
    last_pass: Option<PassRecord>,
    stats: ProducerStats,
    stopped: bool,
}

impl<C: ContentClient> ProducerCoordinator<C> {
    pub fn new(
        client: C,
        links: ProducerLinks<C::Delta>,
        clock: Arc<dyn Clock>,
        telemetry: Box<dyn TelemetrySink>,
        promises: Arc<PromiseRegistry>,
        settings: ProducerSettings,
    ) -> Self {
        Self {
            client,
            links,
            clock,
            telemetry,
            promises,
            settings,
            visible: false,
            defer_content_updates: false,
            defer_commits_until: None,
            stages: StageSnapshot::default(),
            pass_stages: SmallVec::new(),
            held_interaction: InteractionDeltas::default(),
            source_frame_number: 0,
            commits_in_flight: 0,
            last_completion: None,
            last_pass: None,
            stats: ProducerStats::default(),
            stopped: false,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub fn promise_registry(&self) -> &Arc<PromiseRegistry> {
        &self.promises
    }

    pub fn stage_snapshot(&self) -> StageSnapshot {
        self.stages
    }

    pub fn last_pass(&self) -> Option<&PassRecord> {
        self.last_pass.as_ref()
    }

    pub fn last_completion(&self) -> Option<CommitCompletion> {
        self.last_completion
    }

    pub fn stats(&self) -> ProducerStats {
        self.stats
    }

    pub fn source_frame_number(&self) -> SourceFrameNumber {
        self.source_frame_number
    }

    pub fn commits_in_flight(&self) -> u32 {
        self.commits_in_flight
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn commits_deferred(&self) -> bool {
        self.defer_commits_until.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    // Requests.

    pub fn set_needs_animate(&mut self) {
        self.request_stage(PipelineStage::Animate);
    }

    pub fn set_needs_update_layers(&mut self) {
        self.request_stage(PipelineStage::UpdateLayers);
    }

    pub fn set_needs_commit(&mut self) {
        self.request_stage(PipelineStage::Commit);
    }

    /// Queue a promise that resolves with the frame carrying the next commit.
    pub fn queue_promise(&mut self, promise: DeliveryPromise) {
        self.promises.push(promise);
    }

    pub fn set_visible(&mut self, visible: bool) {
        if self.visible == visible {
            return;
        }
        tracing::debug!(visible, "producer visibility changed");
        self.visible = visible;
        self.post(ConsumerMsg::SetVisible(visible));
    }

    pub fn set_defer_content_updates(&mut self, defer: bool) {
        if self.defer_content_updates == defer {
            return;
        }
        tracing::debug!(defer, "content update deferral changed");
        self.defer_content_updates = defer;
        if !defer {
            self.replay_deferred_stage();
        }
    }

    /// Withhold commits until [`Self::stop_deferring_commits`] or `timeout`.
    pub fn start_deferring_commits(&mut self, timeout: Duration) {
        if self.defer_commits_until.is_some() {
            return;
        }
        let until = self.clock.now() + timeout;
        tracing::debug!(?timeout, "deferring commits");
        self.defer_commits_until = Some(until);
    }

    pub fn stop_deferring_commits(&mut self) {
        if self.defer_commits_until.take().is_some() {
            tracing::debug!("commit deferral cleared");
            self.replay_deferred_stage();
        }
    }

    pub fn notify_critical_dependency_resolved(&mut self) {
        self.replay_deferred_stage();
    }

    /// Raise `max_requested` and post one update request if none is outstanding.
    ///
    /// Inside a pass, a request for a stage the pass has not reached yet
    /// extends the pass instead.
    fn request_stage(&mut self, stage: PipelineStage) {
        let current = self.stages.current;
        if current != PipelineStage::None && current < stage {
            self.stages.final_stage = self.stages.final_stage.max(stage);
            return;
        }
        let outstanding = self.stages.max_requested != PipelineStage::None;
        self.stages.max_requested = self.stages.max_requested.max(stage);
        if outstanding {
            return;
        }
        self.stats.update_requests_posted += 1;
        self.post(ConsumerMsg::SetNeedsBeginProducerUpdate);
    }

    fn replay_deferred_stage(&mut self) {
        let stage = std::mem::take(&mut self.stages.deferred_final);
        if stage != PipelineStage::None {
            tracing::debug!(stage = stage.as_str(), "replaying deferred stage");
            self.request_stage(stage);
        }
    }

    fn apply_stage_requests(&mut self, requests: StageRequests) {
        for stage in requests.requested_stages() {
            self.request_stage(stage);
        }
    }

    fn post(&mut self, message: ConsumerMsg<C::Delta>) {
        if let Err(error) = self.links.consumer.post(message) {
            tracing::warn!(%error, "dropping message to consumer");
        }
    }

    // Messages.

    pub fn handle_message(&mut self, message: ProducerMsg) -> ProducerFlow {
        match message {
            ProducerMsg::Request(request) => self.handle_request(request),
            ProducerMsg::BeginUpdate(request) => {
                self.run_pipeline_pass(request);
            }
            ProducerMsg::BeginUpdateNotExpected => self.client.begin_update_not_expected(),
            ProducerMsg::CommitCompleted(completion) => self.on_commit_completed(completion),
            ProducerMsg::DidCommitAndDraw {
                source_frame_number,
            } => self.client.did_commit_and_draw(source_frame_number),
            ProducerMsg::Stop => {
                self.shutdown();
                return ProducerFlow::Stop;
            }
        }
        ProducerFlow::Continue
    }

    fn handle_request(&mut self, request: ProducerRequest) {
        match request {
            ProducerRequest::SetNeedsAnimate => self.set_needs_animate(),
            ProducerRequest::SetNeedsUpdateLayers => self.set_needs_update_layers(),
            ProducerRequest::SetNeedsCommit => self.set_needs_commit(),
            ProducerRequest::SetVisible(visible) => self.set_visible(visible),
            ProducerRequest::SetDeferContentUpdates(defer) => {
                self.set_defer_content_updates(defer)
            }
            ProducerRequest::StartDeferringCommits(timeout) => {
                self.start_deferring_commits(timeout)
            }
            ProducerRequest::StopDeferringCommits => self.stop_deferring_commits(),
            ProducerRequest::CriticalDependencyResolved => {
                self.notify_critical_dependency_resolved()
            }
        }
    }

    fn on_commit_completed(&mut self, completion: Option<CommitCompletion>) {
        self.commits_in_flight = self.commits_in_flight.saturating_sub(1);
        self.record_completion(completion);
    }

    fn record_completion(&mut self, completion: Option<CommitCompletion>) {
        match completion {
            Some(completion) => {
                self.stats.completions += 1;
                self.last_completion = Some(completion);
            }
            None => {
                self.stats.abandoned_commits += 1;
                tracing::debug!("commit abandoned by consumer");
            }
        }
        self.client.did_commit(completion.as_ref());
    }

    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.promises.break_pending(BreakReason::CommitFails);
        tracing::debug!(
            passes = self.stats.passes,
            commits = self.stats.commits,
            "producer stopped"
        );
    }

    // Pipeline pass.

    pub fn run_pipeline_pass(&mut self, request: UpdateRequest) -> PassOutcome {
        let pass_start = self.clock.now();
        self.stats.passes += 1;
        self.pass_stages.clear();
        self.telemetry.record(TelemetryEvent::UpdateBegan {
            source_frame_number: self.source_frame_number + 1,
            at: pass_start,
        });

        if let Some(until) = self.defer_commits_until {
            if until <= pass_start {
                tracing::debug!("commit deferral timed out");
                // The pending deferred stage is merged below, no extra request.
                self.defer_commits_until = None;
            }
        }

        self.stages.final_stage = std::mem::take(&mut self.stages.max_requested);

        if !self.visible {
            self.merge_into_deferred();
            self.promises.break_pending(BreakReason::CommitFails);
            return self.early_out(EarlyOutReason::NotVisible);
        }
        if self.defer_content_updates {
            self.merge_into_deferred();
            return self.early_out(EarlyOutReason::DeferredContentUpdate);
        }

        // A dispatched update always animates, requested or not.
        self.stages.final_stage = self
            .stages
            .final_stage
            .max(std::mem::take(&mut self.stages.deferred_final))
            .max(PipelineStage::Animate);

        self.advance_stage(PipelineStage::Animate);
        self.held_interaction.accumulate(request.interaction);
        if !self.commits_deferred() && self.held_interaction.has_changes() {
            let deltas = std::mem::take(&mut self.held_interaction);
            self.client.apply_interaction_deltas(deltas);
        }
        let mut requests = StageRequests::default();
        self.client.animate(&request.tick, &mut requests);
        self.apply_stage_requests(requests);

        let outcome = if self.stages.final_stage >= PipelineStage::UpdateLayers {
            self.advance_stage(PipelineStage::UpdateLayers);
            let mut requests = StageRequests::default();
            let outcome = self.client.update_layers(&mut requests);
            self.apply_stage_requests(requests);
            outcome
        } else {
            UpdateOutcome::Unchanged
        };

        if outcome == UpdateOutcome::Blocked {
            self.merge_into_deferred();
            return self.early_out(EarlyOutReason::CriticalDependencyUnresolved);
        }
        if self.commits_deferred() {
            self.merge_into_deferred();
            let outcome = self.early_out(EarlyOutReason::DeferredCommit);
            // Keep passes coming so the deferral deadline gets polled.
            self.request_stage(PipelineStage::Animate);
            return outcome;
        }
        if outcome == UpdateOutcome::Unchanged || self.stages.final_stage < PipelineStage::Commit {
            self.promises.resolve_pending_no_update();
            return self.early_out(EarlyOutReason::NoUpdates);
        }

        self.advance_stage(PipelineStage::Commit);
        let outcome = self.commit(pass_start);
        self.finish_pass(outcome, None)
    }

    fn commit(&mut self, pass_start: Instant) -> PassOutcome {
        self.source_frame_number += 1;
        self.stats.commits += 1;
        let source_frame_number = self.source_frame_number;
        let package = CommitPackage::new(
            source_frame_number,
            self.settings.activation_gated_commits,
            self.client.take_delta(),
            self.promises.drain(),
            CommitTimings::started_at(pass_start),
        );
        tracing::debug!(
            source_frame_number,
            promises = package.promise_count(),
            mode = ?self.settings.commit_mode,
            "sending commit package"
        );

        match self.settings.commit_mode {
            CommitMode::Blocking => {
                let (gate, waiter) = completion_gate(COMMIT_GATE_LABEL);
                self.post(ConsumerMsg::ReceiveCommitPackage { gate, package });
                let completion = waiter.wait();
                self.record_completion(completion);
                PassOutcome::Committed {
                    source_frame_number,
                    completion,
                }
            }
            CommitMode::NonBlocking => {
                let sender = self.links.self_sender.clone();
                let gate = GateSignal::with_callback(COMMIT_GATE_LABEL, move |completion| {
                    if sender.send(ProducerMsg::CommitCompleted(completion)).is_err() {
                        tracing::debug!("producer gone before commit completion");
                    }
                });
                self.commits_in_flight += 1;
                self.post(ConsumerMsg::ReceiveCommitPackage { gate, package });
                PassOutcome::CommitPending {
                    source_frame_number,
                }
            }
        }
    }

    fn advance_stage(&mut self, stage: PipelineStage) {
        debug_assert!(
            stage > self.stages.current,
            "protocol violation: stage {} does not follow {}",
            stage.as_str(),
            self.stages.current.as_str()
        );
        debug_assert!(
            stage <= self.stages.final_stage,
            "protocol violation: stage {} beyond final stage {}",
            stage.as_str(),
            self.stages.final_stage.as_str()
        );
        self.stages.current = stage;
        self.pass_stages.push(stage);
    }

    fn merge_into_deferred(&mut self) {
        self.stages.deferred_final = self.stages.deferred_final.max(self.stages.final_stage);
    }

    fn early_out(&mut self, reason: EarlyOutReason) -> PassOutcome {
        self.stats.early_outs += 1;
        tracing::debug!(
            reason = reason.as_str(),
            final_stage = self.stages.final_stage.as_str(),
            "pipeline pass early-out"
        );
        self.post(ConsumerMsg::BeginUpdateAborted(reason));
        self.finish_pass(PassOutcome::EarlyOut(reason), Some(reason))
    }

    fn finish_pass(
        &mut self,
        outcome: PassOutcome,
        early_out: Option<EarlyOutReason>,
    ) -> PassOutcome {
        self.stages.current = PipelineStage::None;
        self.telemetry.record(TelemetryEvent::UpdateEnded {
            source_frame_number: self.source_frame_number,
            at: self.clock.now(),
            early_out,
        });
        self.last_pass = Some(PassRecord {
            final_stage: self.stages.final_stage,
            stages: self.pass_stages.clone(),
            outcome,
        });
        outcome
    }
}
