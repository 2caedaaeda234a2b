//! Fake collaborators and a single-threaded harness that pumps both mailboxes.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use engine::{
    Clock, ManualClock, NoopTelemetry, ProducerRegistration, ProducerRegistry, TelemetryReader,
    create_thread_channels, telemetry_ring,
};
use protocol::{
    CommitCompletion, ConsumerMsg, EarlyOutReason, FrameToken, InteractionDeltas, ProducerMsg,
    PromiseRegistry, SourceFrameNumber, TickArgs, TreePriority,
};

use crate::client::{
    ContentClient, DrawError, DrawMetrics, FrameData, OutputSinkError, Rasterizer,
    ResourceReadiness, StageRequests, UpdateOutcome,
};
use crate::config::{CommitMode, PipelineConfig};
use crate::consumer::{ConsumerCoordinator, ConsumerSettings};
use crate::producer::{PassRecord, ProducerCoordinator, ProducerLinks, ProducerSettings};

pub(crate) const INTERVAL: Duration = Duration::from_micros(16_667);

pub(crate) struct FakeContent {
    pub next_outcome: UpdateOutcome,
    pub next_delta: u64,
    pub animations: u32,
    pub layer_updates: u32,
    pub request_commit_on_animate: bool,
    pub interaction: Vec<InteractionDeltas>,
    pub completions: Vec<Option<CommitCompletion>>,
    pub drawn_commits: Vec<SourceFrameNumber>,
    pub not_expected: u32,
    pub completion_sink: Option<Sender<Option<CommitCompletion>>>,
}

impl Default for FakeContent {
    fn default() -> Self {
        Self {
            next_outcome: UpdateOutcome::Changed,
            next_delta: 1,
            animations: 0,
            layer_updates: 0,
            request_commit_on_animate: false,
            interaction: Vec::new(),
            completions: Vec::new(),
            drawn_commits: Vec::new(),
            not_expected: 0,
            completion_sink: None,
        }
    }
}

impl FakeContent {
    pub fn reporting_to(sink: Sender<Option<CommitCompletion>>) -> Self {
        Self {
            completion_sink: Some(sink),
            ..Self::default()
        }
    }
}

impl ContentClient for FakeContent {
    type Delta = u64;

    fn animate(&mut self, _tick: &TickArgs, requests: &mut StageRequests) {
        self.animations += 1;
        if self.request_commit_on_animate {
            requests.set_needs_commit();
        }
    }

    fn apply_interaction_deltas(&mut self, deltas: InteractionDeltas) {
        self.interaction.push(deltas);
    }

    fn update_layers(&mut self, _requests: &mut StageRequests) -> UpdateOutcome {
        self.layer_updates += 1;
        self.next_outcome
    }

    fn take_delta(&mut self) -> u64 {
        let delta = self.next_delta;
        self.next_delta += 1;
        delta
    }

    fn did_commit(&mut self, completion: Option<&CommitCompletion>) {
        self.completions.push(completion.copied());
        if let Some(sink) = &self.completion_sink {
            let _ = sink.send(completion.copied());
        }
    }

    fn did_commit_and_draw(&mut self, source_frame_number: SourceFrameNumber) {
        self.drawn_commits.push(source_frame_number);
    }

    fn begin_update_not_expected(&mut self) {
        self.not_expected += 1;
    }
}

pub(crate) struct FakeRasterizer {
    pub fail_sink_creation: bool,
    pub can_draw: bool,
    pub ready_to_draw: bool,
    pub fail_draw: bool,
    pub readiness: ResourceReadiness,
    pub applied: Vec<u64>,
    pub activations: u32,
    pub drawn: Vec<FrameToken>,
    pub drawn_with_missing_content: Vec<FrameToken>,
    pub did_draw_all_layers: u32,
    pub priorities: Vec<TreePriority>,
    pub aborts: Vec<EarlyOutReason>,
    pub sinks_created: u32,
    pub sinks_released: u32,
}

impl Default for FakeRasterizer {
    fn default() -> Self {
        Self {
            fail_sink_creation: false,
            can_draw: true,
            ready_to_draw: true,
            fail_draw: false,
            readiness: ResourceReadiness::READY,
            applied: Vec::new(),
            activations: 0,
            drawn: Vec::new(),
            drawn_with_missing_content: Vec::new(),
            did_draw_all_layers: 0,
            priorities: Vec::new(),
            aborts: Vec::new(),
            sinks_created: 0,
            sinks_released: 0,
        }
    }
}

impl Rasterizer for FakeRasterizer {
    type Delta = u64;

    fn create_output_sink(&mut self) -> Result<(), OutputSinkError> {
        if self.fail_sink_creation {
            return Err(OutputSinkError::InitFailed("fake sink refused".to_owned()));
        }
        self.sinks_created += 1;
        Ok(())
    }

    fn release_output_sink(&mut self) {
        self.sinks_released += 1;
    }

    fn apply_commit(&mut self, delta: u64) {
        self.applied.push(delta);
    }

    fn activate_content_tree(&mut self) {
        self.activations += 1;
    }

    fn prepare_resources(&mut self) -> ResourceReadiness {
        self.readiness
    }

    fn can_draw(&self) -> bool {
        self.can_draw && self.activations > 0
    }

    fn prepare_to_draw(&mut self, _frame: &mut FrameData) -> Result<(), DrawError> {
        if self.ready_to_draw {
            Ok(())
        } else {
            Err(DrawError::ResourcesNotReady)
        }
    }

    fn draw_layers(&mut self, frame: &FrameData) -> Option<DrawMetrics> {
        if self.fail_draw {
            return None;
        }
        self.drawn.push(frame.frame_token);
        if frame.has_missing_content {
            self.drawn_with_missing_content.push(frame.frame_token);
        }
        Some(DrawMetrics {
            layers_drawn: 1,
            gpu_time: Duration::from_micros(250),
        })
    }

    fn did_draw_all_layers(&mut self, _frame: &FrameData) {
        self.did_draw_all_layers += 1;
    }

    fn set_tree_priority(&mut self, priority: TreePriority) {
        self.priorities.push(priority);
    }

    fn begin_update_aborted(&mut self, reason: EarlyOutReason) {
        self.aborts.push(reason);
    }
}

/// Both coordinators on the test thread, connected by real mailboxes.
///
/// Commits are always non-blocking here; the blocking handshake needs two
/// threads and is covered through [`crate::PipelineBridge`].
pub(crate) struct Harness {
    pub producer: ProducerCoordinator<FakeContent>,
    pub consumer: ConsumerCoordinator<FakeRasterizer>,
    pub clock: ManualClock,
    pub telemetry: TelemetryReader,
    producer_inbox: Receiver<ProducerMsg>,
    consumer_inbox: Receiver<ConsumerMsg<u64>>,
    _registration: ProducerRegistration,
    frame_id: u64,
}

impl Harness {
    pub fn build(mut config: PipelineConfig, rasterizer: FakeRasterizer) -> Self {
        config.commit_mode = CommitMode::NonBlocking;
        let clock = ManualClock::new();
        let registry = ProducerRegistry::new();
        let (producer_channels, consumer_channels, _external) = create_thread_channels(&registry);
        let (consumer_telemetry, telemetry) = telemetry_ring(64);

        let producer = ProducerCoordinator::new(
            FakeContent::default(),
            ProducerLinks {
                consumer: producer_channels.consumer,
                self_sender: producer_channels.self_sender,
            },
            Arc::new(clock.clone()),
            Box::new(NoopTelemetry),
            Arc::new(PromiseRegistry::new()),
            ProducerSettings::from(&config),
        );
        let consumer = ConsumerCoordinator::new(
            rasterizer,
            consumer_channels.producer,
            Arc::new(clock.clone()),
            Box::new(consumer_telemetry),
            ConsumerSettings::from(&config),
        );

        Self {
            producer,
            consumer,
            clock,
            telemetry,
            producer_inbox: producer_channels.inbox,
            consumer_inbox: consumer_channels.inbox,
            _registration: producer_channels.registration,
            frame_id: 0,
        }
    }

    /// Visible, output sink created, and the sink-triggered first update consumed.
    pub fn started_with(config: PipelineConfig) -> Self {
        let mut harness = Self::build(config, FakeRasterizer::default());
        harness.producer.set_visible(true);
        harness.pump();
        harness.tick();
        harness
    }

    pub fn started() -> Self {
        Self::started_with(PipelineConfig::default())
    }

    pub fn rasterizer(&mut self) -> &mut FakeRasterizer {
        self.consumer
            .rasterizer_mut()
            .expect("rasterizer alive")
    }

    pub fn content(&mut self) -> &mut FakeContent {
        self.producer.client_mut()
    }

    pub fn last_pass(&self) -> PassRecord {
        self.producer.last_pass().cloned().expect("a pass ran")
    }

    pub fn pending_consumer_messages(&self) -> usize {
        self.consumer_inbox.len()
    }

    pub fn deliver_to_consumer(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(message) = self.consumer_inbox.try_recv() {
            self.consumer.handle_message(message);
            delivered += 1;
        }
        delivered
    }

    pub fn deliver_to_producer(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(message) = self.producer_inbox.try_recv() {
            self.producer.handle_message(message);
            delivered += 1;
        }
        delivered
    }

    pub fn pump(&mut self) {
        while self.deliver_to_consumer() + self.deliver_to_producer() > 0 {}
    }

    pub fn begin_tick(&mut self) {
        self.frame_id += 1;
        let args = TickArgs::new(self.frame_id, self.clock.now(), INTERVAL);
        self.consumer.begin_tick(args);
    }

    /// One full frame: begin, settle both mailboxes, deadline, settle again.
    pub fn tick(&mut self) {
        self.begin_tick();
        self.pump();
        self.consumer.on_tick_deadline();
        self.pump();
        self.clock.advance(INTERVAL);
    }
}
