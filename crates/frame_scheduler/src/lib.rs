//! Consumer-side frame scheduling state machine.
//!
//! The scheduler never calls out. The consumer asks it for the next
//! [`SchedulerAction`], performs the action, and reports back through the
//! matching `will_*`/`did_*` method. Failures such as a lost output sink are
//! state transitions, never errors.

mod priority;

use std::time::{Duration, Instant};

use protocol::{
    DrawResult, EarlyOutReason, InteractionSignals, ReadyToCommitMetrics, TickArgs, TreePriority,
};
use serde::{Deserialize, Serialize};

pub use priority::TreePriorityArbiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Readiness aborts tolerated before the next draw is forced.
    pub max_consecutive_draw_failures: u32,
    pub smoothness_priority_expiration_micros: u64,
}

impl SchedulerConfig {
    pub fn smoothness_priority_expiration(&self) -> Duration {
        Duration::from_micros(self.smoothness_priority_expiration_micros)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_draw_failures: 3,
            smoothness_priority_expiration_micros: 250_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerAction {
    None,
    CreateOutputSink,
    ActivatePendingTree,
    Commit,
    PrepareResources,
    Draw { forced: bool },
    SendBeginProducerUpdate,
    NotifyBeginProducerUpdateNotExpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginUpdateState {
    Idle,
    Sent,
    ReadyToCommit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSinkState {
    None,
    Creating,
    Active,
    /// Creation failed; waits for a sink to be supplied externally.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    Idle,
    BeginFrame,
    Deadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineMode {
    Immediate,
    Regular,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForcedRedrawState {
    Idle,
    WaitingForDraw,
}

#[derive(Debug, Clone)]
pub struct FrameScheduler {
    config: SchedulerConfig,
    stopped: bool,
    visible: bool,
    tick_phase: TickPhase,
    current_tick: Option<TickArgs>,
    output_sink: OutputSinkState,
    begin_update: BeginUpdateState,
    pending_commit: Option<ReadyToCommitMetrics>,
    needs_begin_update: bool,
    needs_redraw: bool,
    needs_prepare_resources: bool,
    has_pending_tree: bool,
    pending_tree_ready_to_activate: bool,
    active_tree_needs_first_draw: bool,
    ready_to_draw: bool,
    forced_redraw: ForcedRedrawState,
    consecutive_draw_failures: u32,
    did_send_begin_update_this_tick: bool,
    did_prepare_resources_this_tick: bool,
    did_draw_this_tick: bool,
    notified_update_not_expected: bool,
    commit_count: u64,
    priority: TreePriorityArbiter,
}

impl FrameScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            stopped: false,
            visible: false,
            tick_phase: TickPhase::Idle,
            current_tick: None,
            output_sink: OutputSinkState::None,
            begin_update: BeginUpdateState::Idle,
            pending_commit: None,
            needs_begin_update: false,
            needs_redraw: false,
            needs_prepare_resources: false,
            has_pending_tree: false,
            pending_tree_ready_to_activate: false,
            active_tree_needs_first_draw: false,
            ready_to_draw: false,
            forced_redraw: ForcedRedrawState::Idle,
            consecutive_draw_failures: 0,
            did_send_begin_update_this_tick: false,
            did_prepare_resources_this_tick: false,
            did_draw_this_tick: false,
            notified_update_not_expected: false,
            commit_count: 0,
            priority: TreePriorityArbiter::new(config.smoothness_priority_expiration()),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn tick_phase(&self) -> TickPhase {
        self.tick_phase
    }

    pub fn current_tick(&self) -> Option<TickArgs> {
        self.current_tick
    }

    pub fn output_sink_state(&self) -> OutputSinkState {
        self.output_sink
    }

    pub fn begin_update_state(&self) -> BeginUpdateState {
        self.begin_update
    }

    pub fn pending_commit(&self) -> Option<ReadyToCommitMetrics> {
        self.pending_commit
    }

    pub fn needs_begin_producer_update(&self) -> bool {
        self.needs_begin_update
    }

    pub fn needs_redraw(&self) -> bool {
        self.needs_redraw
    }

    pub fn has_pending_tree(&self) -> bool {
        self.has_pending_tree
    }

    pub fn active_tree_needs_first_draw(&self) -> bool {
        self.active_tree_needs_first_draw
    }

    pub fn commit_count(&self) -> u64 {
        self.commit_count
    }

    pub fn tree_priority(&self) -> TreePriority {
        self.priority.current()
    }

    pub fn forced_draw_pending(&self) -> bool {
        self.forced_redraw == ForcedRedrawState::WaitingForDraw
    }

    // Requests. All of these are idempotent and coalesce into one action.

    pub fn set_needs_begin_producer_update(&mut self) {
        self.needs_begin_update = true;
    }

    pub fn set_needs_commit(&mut self) {
        self.set_needs_begin_producer_update();
    }

    pub fn set_needs_redraw(&mut self) {
        self.needs_redraw = true;
    }

    pub fn set_needs_prepare_resources(&mut self) {
        self.needs_prepare_resources = true;
    }

    pub fn set_visible(&mut self, visible: bool) {
        if self.visible != visible {
            tracing::debug!(visible, "scheduler visibility changed");
        }
        self.visible = visible;
    }

    pub fn set_interaction_signals(&mut self, signals: InteractionSignals) {
        self.priority.set_signals(signals);
    }

    pub fn stop(&mut self) {
        self.stopped = true;
        self.tick_phase = TickPhase::Idle;
    }

    // Ticks.

    /// Start a frame opportunity. Returns the tree priority when it changed.
    pub fn begin_tick(&mut self, args: TickArgs) -> Option<TreePriority> {
        self.tick_phase = TickPhase::BeginFrame;
        self.current_tick = Some(args);
        self.did_send_begin_update_this_tick = false;
        self.did_prepare_resources_this_tick = false;
        self.did_draw_this_tick = false;
        self.priority.evaluate(args.frame_time)
    }

    pub fn on_tick_deadline(&mut self) {
        if self.tick_phase == TickPhase::BeginFrame {
            self.tick_phase = TickPhase::Deadline;
        }
    }

    pub fn end_tick(&mut self) {
        self.tick_phase = TickPhase::Idle;
    }

    /// Whether the draw deadline of the current tick can run right away.
    pub fn deadline_mode(&self) -> DeadlineMode {
        if !self.visible || self.output_sink != OutputSinkState::Active {
            return DeadlineMode::Immediate;
        }
        match self.priority.current() {
            TreePriority::NewContentTakesPriority if self.has_pending_tree => DeadlineMode::Blocked,
            TreePriority::SmoothnessTakesPriority => DeadlineMode::Immediate,
            _ if self.ready_to_draw && self.needs_redraw => DeadlineMode::Immediate,
            _ if self.begin_update != BeginUpdateState::Idle => DeadlineMode::Regular,
            _ => DeadlineMode::Immediate,
        }
    }

    // Action selection.

    pub fn next_action(&self) -> SchedulerAction {
        if self.stopped {
            return SchedulerAction::None;
        }
        if self.should_create_output_sink() {
            return SchedulerAction::CreateOutputSink;
        }
        if self.should_activate_pending_tree() {
            return SchedulerAction::ActivatePendingTree;
        }
        if self.should_commit() {
            return SchedulerAction::Commit;
        }
        if self.should_prepare_resources() {
            return SchedulerAction::PrepareResources;
        }
        if self.should_draw() {
            return SchedulerAction::Draw {
                forced: self.forced_draw_pending(),
            };
        }
        if self.should_send_begin_update() {
            return SchedulerAction::SendBeginProducerUpdate;
        }
        if self.should_notify_update_not_expected() {
            return SchedulerAction::NotifyBeginProducerUpdateNotExpected;
        }
        SchedulerAction::None
    }

    fn should_create_output_sink(&self) -> bool {
        self.visible && self.output_sink == OutputSinkState::None
    }

    fn should_activate_pending_tree(&self) -> bool {
        self.has_pending_tree && self.pending_tree_ready_to_activate
    }

    fn should_commit(&self) -> bool {
        // One pending tree at a time: the next commit waits for activation.
        self.begin_update == BeginUpdateState::ReadyToCommit && !self.has_pending_tree
    }

    fn should_prepare_resources(&self) -> bool {
        self.needs_prepare_resources
            && self.output_sink == OutputSinkState::Active
            && self.tick_phase != TickPhase::Idle
            && !self.did_prepare_resources_this_tick
    }

    fn should_draw(&self) -> bool {
        if self.tick_phase != TickPhase::Deadline
            || self.did_draw_this_tick
            || !self.needs_redraw
            || !self.visible
            || self.output_sink != OutputSinkState::Active
        {
            return false;
        }
        if self.forced_draw_pending() {
            return true;
        }
        !(self.priority.current() == TreePriority::NewContentTakesPriority && self.has_pending_tree)
    }

    fn should_send_begin_update(&self) -> bool {
        self.needs_begin_update
            && self.visible
            && self.output_sink == OutputSinkState::Active
            && self.begin_update == BeginUpdateState::Idle
            && self.tick_phase == TickPhase::BeginFrame
            && !self.did_send_begin_update_this_tick
    }

    fn should_notify_update_not_expected(&self) -> bool {
        self.tick_phase == TickPhase::BeginFrame
            && !self.needs_begin_update
            && self.begin_update == BeginUpdateState::Idle
            && !self.notified_update_not_expected
    }

    // Action bookkeeping.

    pub fn will_create_output_sink(&mut self) {
        debug_assert_eq!(
            self.output_sink,
            OutputSinkState::None,
            "protocol violation: output sink creation already in progress"
        );
        self.output_sink = OutputSinkState::Creating;
    }

    pub fn did_create_output_sink(&mut self) {
        tracing::debug!("output sink created");
        self.output_sink = OutputSinkState::Active;
        self.needs_redraw = true;
        self.needs_begin_update = true;
    }

    pub fn did_fail_create_output_sink(&mut self) {
        tracing::warn!("output sink creation failed; waiting for a new sink");
        self.output_sink = OutputSinkState::Failed;
    }

    pub fn did_lose_output_sink(&mut self) {
        tracing::warn!(state = ?self.output_sink, "output sink lost");
        if self.output_sink != OutputSinkState::Failed {
            self.output_sink = OutputSinkState::None;
        }
        self.forced_redraw = ForcedRedrawState::Idle;
        self.consecutive_draw_failures = 0;
        self.ready_to_draw = false;
    }

    /// A replacement sink became available after a failed creation.
    pub fn output_sink_supplied(&mut self) {
        if matches!(self.output_sink, OutputSinkState::Failed | OutputSinkState::None) {
            self.output_sink = OutputSinkState::None;
        }
    }

    pub fn will_send_begin_producer_update(&mut self) {
        debug_assert_eq!(
            self.begin_update,
            BeginUpdateState::Idle,
            "protocol violation: producer update already in flight"
        );
        self.begin_update = BeginUpdateState::Sent;
        self.needs_begin_update = false;
        self.did_send_begin_update_this_tick = true;
        self.notified_update_not_expected = false;
    }

    pub fn will_notify_begin_producer_update_not_expected(&mut self) {
        self.notified_update_not_expected = true;
    }

    /// Must be followed by exactly one [`FrameScheduler::did_commit`].
    pub fn notify_ready_to_commit(&mut self, metrics: ReadyToCommitMetrics) {
        debug_assert!(
            self.pending_commit.is_none(),
            "protocol violation: ready to commit twice without did_commit"
        );
        debug_assert_eq!(
            self.begin_update,
            BeginUpdateState::Sent,
            "protocol violation: ready to commit without a producer update in flight"
        );
        self.begin_update = BeginUpdateState::ReadyToCommit;
        self.pending_commit = Some(metrics);
    }

    pub fn did_commit(&mut self, creates_pending_tree: bool) {
        debug_assert_eq!(
            self.begin_update,
            BeginUpdateState::ReadyToCommit,
            "protocol violation: did_commit without a ready commit"
        );
        self.begin_update = BeginUpdateState::Idle;
        self.pending_commit = None;
        self.commit_count += 1;
        if creates_pending_tree {
            self.has_pending_tree = true;
            self.pending_tree_ready_to_activate = false;
            self.needs_prepare_resources = true;
        } else {
            self.active_tree_needs_first_draw = true;
            self.needs_redraw = true;
        }
    }

    pub fn begin_producer_update_aborted(&mut self, reason: EarlyOutReason) {
        debug_assert_eq!(
            self.begin_update,
            BeginUpdateState::Sent,
            "protocol violation: update aborted while none was in flight"
        );
        tracing::debug!(reason = reason.as_str(), "producer update aborted");
        self.begin_update = BeginUpdateState::Idle;
        match reason {
            // Keep the request; it is dispatched once the surface is visible again.
            EarlyOutReason::NotVisible => self.needs_begin_update = true,
            EarlyOutReason::NoUpdates => self.commit_count += 1,
            // The producer replays these itself once the deferral clears.
            EarlyOutReason::DeferredContentUpdate
            | EarlyOutReason::DeferredCommit
            | EarlyOutReason::CriticalDependencyUnresolved => {}
        }
    }

    pub fn did_prepare_resources(&mut self) {
        self.needs_prepare_resources = false;
        self.did_prepare_resources_this_tick = true;
    }

    pub fn notify_ready_to_activate(&mut self) {
        if self.has_pending_tree {
            self.pending_tree_ready_to_activate = true;
        }
    }

    pub fn notify_ready_to_draw(&mut self) {
        self.ready_to_draw = true;
    }

    pub fn did_activate(&mut self) {
        debug_assert!(
            self.has_pending_tree,
            "protocol violation: activation without a pending tree"
        );
        self.has_pending_tree = false;
        self.pending_tree_ready_to_activate = false;
        self.active_tree_needs_first_draw = true;
        self.needs_redraw = true;
        self.needs_prepare_resources = true;
    }

    pub fn will_draw(&mut self) {
        self.did_draw_this_tick = true;
    }

    pub fn did_draw(&mut self, result: DrawResult) {
        let was_forced = self.forced_draw_pending();
        match result {
            DrawResult::Success { .. } => {
                self.needs_redraw = false;
                self.active_tree_needs_first_draw = false;
                self.consecutive_draw_failures = 0;
                self.forced_redraw = ForcedRedrawState::Idle;
            }
            DrawResult::AbortedNotReady | DrawResult::AbortedDrawFailed => {
                if was_forced {
                    self.forced_redraw = ForcedRedrawState::Idle;
                    self.consecutive_draw_failures = 0;
                } else {
                    self.consecutive_draw_failures += 1;
                    if self.consecutive_draw_failures >= self.config.max_consecutive_draw_failures {
                        tracing::debug!(
                            failures = self.consecutive_draw_failures,
                            "forcing next draw"
                        );
                        self.forced_redraw = ForcedRedrawState::WaitingForDraw;
                    }
                }
            }
            DrawResult::AbortedCantDraw | DrawResult::AbortedNoSink => {}
        }
    }
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(frame_id: u64, frame_time: Instant) -> TickArgs {
        TickArgs::new(frame_id, frame_time, Duration::from_micros(16_667))
    }

    fn metrics(at: Instant) -> ReadyToCommitMetrics {
        ReadyToCommitMetrics {
            source_frame_number: 1,
            begin_update_start: at,
            ready_at: at,
        }
    }

    /// Visible scheduler with an active output sink, inside the begin phase of a tick.
    fn ready_scheduler(origin: Instant) -> FrameScheduler {
        let mut scheduler = FrameScheduler::default();
        scheduler.set_visible(true);
        assert_eq!(scheduler.next_action(), SchedulerAction::CreateOutputSink);
        scheduler.will_create_output_sink();
        scheduler.did_create_output_sink();
        scheduler.begin_tick(tick(1, origin));
        scheduler
    }

    #[test]
    fn invisible_scheduler_creates_nothing() {
        let mut scheduler = FrameScheduler::default();
        scheduler.set_needs_commit();
        scheduler.set_needs_redraw();
        scheduler.begin_tick(tick(1, Instant::now()));
        assert_eq!(scheduler.next_action(), SchedulerAction::None);
    }

    #[test]
    fn repeated_requests_coalesce_into_one_update() {
        let origin = Instant::now();
        let mut scheduler = ready_scheduler(origin);
        scheduler.set_needs_commit();
        scheduler.set_needs_commit();
        scheduler.set_needs_begin_producer_update();

        assert_eq!(scheduler.next_action(), SchedulerAction::SendBeginProducerUpdate);
        scheduler.will_send_begin_producer_update();
        assert_ne!(scheduler.next_action(), SchedulerAction::SendBeginProducerUpdate);
        assert!(!scheduler.needs_begin_producer_update());
    }

    #[test]
    fn commit_follows_ready_to_commit_and_creates_pending_tree() {
        let origin = Instant::now();
        let mut scheduler = ready_scheduler(origin);
        scheduler.set_needs_commit();
        scheduler.will_send_begin_producer_update();
        scheduler.notify_ready_to_commit(metrics(origin));
        assert_eq!(scheduler.next_action(), SchedulerAction::Commit);

        scheduler.did_commit(true);
        assert!(scheduler.has_pending_tree());
        assert_eq!(scheduler.commit_count(), 1);
        assert_eq!(scheduler.next_action(), SchedulerAction::PrepareResources);
        scheduler.did_prepare_resources();

        scheduler.notify_ready_to_activate();
        assert_eq!(scheduler.next_action(), SchedulerAction::ActivatePendingTree);
        scheduler.did_activate();
        assert!(scheduler.needs_redraw());
    }

    #[test]
    fn second_commit_waits_for_activation() {
        let origin = Instant::now();
        let mut scheduler = ready_scheduler(origin);
        scheduler.set_needs_commit();
        scheduler.will_send_begin_producer_update();
        scheduler.notify_ready_to_commit(metrics(origin));
        scheduler.did_commit(true);

        scheduler.begin_tick(tick(2, origin + Duration::from_millis(16)));
        scheduler.set_needs_commit();
        assert_eq!(scheduler.next_action(), SchedulerAction::PrepareResources);
        scheduler.did_prepare_resources();
        assert_eq!(scheduler.next_action(), SchedulerAction::SendBeginProducerUpdate);
        scheduler.will_send_begin_producer_update();
        scheduler.notify_ready_to_commit(metrics(origin));
        assert_ne!(scheduler.next_action(), SchedulerAction::Commit);

        scheduler.notify_ready_to_activate();
        assert_eq!(scheduler.next_action(), SchedulerAction::ActivatePendingTree);
        scheduler.did_activate();
        assert_eq!(scheduler.next_action(), SchedulerAction::Commit);
    }

    #[test]
    fn draws_only_in_deadline_phase() {
        let origin = Instant::now();
        let mut scheduler = ready_scheduler(origin);
        scheduler.will_notify_begin_producer_update_not_expected();
        scheduler.set_needs_redraw();
        scheduler.needs_begin_update = false;
        assert_eq!(scheduler.next_action(), SchedulerAction::None);

        scheduler.on_tick_deadline();
        assert_eq!(scheduler.next_action(), SchedulerAction::Draw { forced: false });
        scheduler.will_draw();
        scheduler.did_draw(DrawResult::Success { frame_token: 1 });
        assert_eq!(scheduler.next_action(), SchedulerAction::None);
        assert!(!scheduler.needs_redraw());
    }

    #[test]
    fn repeated_readiness_aborts_force_the_next_draw() {
        let origin = Instant::now();
        let mut scheduler = ready_scheduler(origin);
        scheduler.needs_begin_update = false;
        scheduler.set_needs_redraw();

        for frame_id in 0..3 {
            scheduler.begin_tick(tick(frame_id + 2, origin));
            scheduler.on_tick_deadline();
            assert_eq!(scheduler.next_action(), SchedulerAction::Draw { forced: false });
            scheduler.will_draw();
            scheduler.did_draw(DrawResult::AbortedNotReady);
        }

        scheduler.begin_tick(tick(10, origin));
        scheduler.on_tick_deadline();
        assert_eq!(scheduler.next_action(), SchedulerAction::Draw { forced: true });
        scheduler.will_draw();
        scheduler.did_draw(DrawResult::AbortedNotReady);
        assert!(!scheduler.forced_draw_pending());
    }

    #[test]
    fn invisible_requests_are_kept_until_visible() {
        let origin = Instant::now();
        let mut scheduler = ready_scheduler(origin);
        scheduler.set_visible(false);
        scheduler.set_needs_commit();
        assert_ne!(scheduler.next_action(), SchedulerAction::SendBeginProducerUpdate);

        scheduler.set_visible(true);
        assert_eq!(scheduler.next_action(), SchedulerAction::SendBeginProducerUpdate);
    }

    #[test]
    fn not_visible_abort_requeues_update() {
        let origin = Instant::now();
        let mut scheduler = ready_scheduler(origin);
        scheduler.set_needs_commit();
        scheduler.will_send_begin_producer_update();
        scheduler.begin_producer_update_aborted(EarlyOutReason::NotVisible);
        assert_eq!(scheduler.begin_update_state(), BeginUpdateState::Idle);
        assert!(scheduler.needs_begin_producer_update());
    }

    #[test]
    fn no_update_abort_counts_as_commit() {
        let origin = Instant::now();
        let mut scheduler = ready_scheduler(origin);
        scheduler.set_needs_commit();
        scheduler.will_send_begin_producer_update();
        scheduler.begin_producer_update_aborted(EarlyOutReason::NoUpdates);
        assert_eq!(scheduler.commit_count(), 1);
        assert!(!scheduler.needs_begin_producer_update());
    }

    #[test]
    fn lost_sink_suppresses_draws_until_recreated() {
        let origin = Instant::now();
        let mut scheduler = ready_scheduler(origin);
        scheduler.needs_begin_update = false;
        scheduler.set_needs_redraw();
        scheduler.did_lose_output_sink();
        scheduler.on_tick_deadline();
        assert_eq!(scheduler.next_action(), SchedulerAction::CreateOutputSink);
        scheduler.will_create_output_sink();
        assert_eq!(scheduler.next_action(), SchedulerAction::None);

        scheduler.did_create_output_sink();
        assert_eq!(scheduler.next_action(), SchedulerAction::Draw { forced: false });
    }

    #[test]
    fn failed_sink_creation_waits_for_supplied_sink() {
        let mut scheduler = FrameScheduler::default();
        scheduler.set_visible(true);
        scheduler.set_needs_commit();
        scheduler.will_create_output_sink();
        scheduler.did_fail_create_output_sink();
        scheduler.begin_tick(tick(1, Instant::now()));
        assert_ne!(scheduler.next_action(), SchedulerAction::CreateOutputSink);
        assert_ne!(scheduler.next_action(), SchedulerAction::SendBeginProducerUpdate);

        scheduler.output_sink_supplied();
        assert_eq!(scheduler.next_action(), SchedulerAction::CreateOutputSink);
    }

    #[test]
    fn new_content_priority_blocks_draw_until_activation() {
        let origin = Instant::now();
        let mut scheduler = ready_scheduler(origin);
        scheduler.set_interaction_signals(InteractionSignals {
            visible_surface_empty: true,
            ..InteractionSignals::default()
        });
        assert_eq!(
            scheduler.begin_tick(tick(2, origin)),
            Some(TreePriority::NewContentTakesPriority)
        );
        scheduler.will_send_begin_producer_update();
        scheduler.notify_ready_to_commit(metrics(origin));
        scheduler.did_commit(true);
        scheduler.did_prepare_resources();
        scheduler.set_needs_redraw();

        assert_eq!(scheduler.deadline_mode(), DeadlineMode::Blocked);
        scheduler.on_tick_deadline();
        assert_eq!(scheduler.next_action(), SchedulerAction::None);

        scheduler.notify_ready_to_activate();
        assert_eq!(scheduler.next_action(), SchedulerAction::ActivatePendingTree);
        scheduler.did_activate();
        assert_eq!(scheduler.next_action(), SchedulerAction::Draw { forced: false });
    }

    #[test]
    fn smoothness_priority_does_not_wait_for_producer() {
        let origin = Instant::now();
        let mut scheduler = ready_scheduler(origin);
        scheduler.set_needs_commit();
        scheduler.will_send_begin_producer_update();
        assert_eq!(scheduler.deadline_mode(), DeadlineMode::Regular);

        scheduler.set_interaction_signals(InteractionSignals {
            scroll_gesture_active: true,
            ..InteractionSignals::default()
        });
        scheduler.begin_tick(tick(2, origin + Duration::from_millis(16)));
        assert_eq!(scheduler.tree_priority(), TreePriority::SmoothnessTakesPriority);
        assert_eq!(scheduler.deadline_mode(), DeadlineMode::Immediate);
    }

    #[test]
    fn stopped_scheduler_issues_no_actions() {
        let origin = Instant::now();
        let mut scheduler = ready_scheduler(origin);
        scheduler.set_needs_commit();
        scheduler.stop();
        assert_eq!(scheduler.next_action(), SchedulerAction::None);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let json = r#"{ "max_consecutive_draw_failures": 5 }"#;
        let config: SchedulerConfig = serde_json::from_str(json).expect("parse config");
        assert_eq!(config.max_consecutive_draw_failures, 5);
        assert_eq!(
            config.smoothness_priority_expiration(),
            Duration::from_millis(250)
        );
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "protocol violation")]
    fn ready_to_commit_twice_panics() {
        let origin = Instant::now();
        let mut scheduler = ready_scheduler(origin);
        scheduler.will_send_begin_producer_update();
        scheduler.notify_ready_to_commit(metrics(origin));
        scheduler.notify_ready_to_commit(metrics(origin));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "protocol violation")]
    fn did_commit_without_ready_commit_panics() {
        let mut scheduler = ready_scheduler(Instant::now());
        scheduler.did_commit(true);
    }
}
