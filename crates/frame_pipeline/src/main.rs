use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use engine::{SystemClock, TelemetryEvent, TelemetryReader, telemetry_ring};
use frame_pipeline::{
    CommitMode, ContentClient, DrawError, DrawMetrics, FrameData, OutputSinkError, PipelineBridge,
    PipelineConfig, Rasterizer, ResourceReadiness, StageRequests, TelemetrySinks, UpdateOutcome,
};
use protocol::{
    CommitCompletion, ConsumerMsg, DeliveryOutcome, DeliveryPromise, FrameToken,
    InteractionDeltas, ProducerRequest, TickArgs,
};
use tracing_subscriber::EnvFilter;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive the split-thread frame pipeline with a demo scene")]
struct Arguments {
    /// Number of committed updates to request.
    #[arg(long, default_value_t = 8)]
    frames: u64,
    /// Pipeline config JSON; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Post commit completions back to the producer instead of blocking on them.
    #[arg(long)]
    non_blocking: bool,
    /// Hold each commit until the committed tree is activated.
    #[arg(long)]
    activation_gated: bool,
    /// Frame interval in microseconds, overriding the config.
    #[arg(long)]
    interval_micros: Option<u64>,
}

/// Scroll position advanced by animation and interaction.
struct DemoScene {
    scroll_offset: f32,
    velocity: f32,
    dirty: bool,
}

#[derive(Debug)]
struct SceneDelta {
    scroll_offset: f32,
}

impl ContentClient for DemoScene {
    type Delta = SceneDelta;

    fn animate(&mut self, tick: &TickArgs, _requests: &mut StageRequests) {
        self.scroll_offset += self.velocity * tick.interval.as_secs_f32();
        self.dirty = true;
    }

    fn apply_interaction_deltas(&mut self, deltas: InteractionDeltas) {
        self.scroll_offset += deltas.scroll_y;
        self.dirty = true;
    }

    fn update_layers(&mut self, _requests: &mut StageRequests) -> UpdateOutcome {
        if std::mem::take(&mut self.dirty) {
            UpdateOutcome::Changed
        } else {
            UpdateOutcome::Unchanged
        }
    }

    fn take_delta(&mut self) -> SceneDelta {
        SceneDelta {
            scroll_offset: self.scroll_offset,
        }
    }

    fn did_commit(&mut self, completion: Option<&CommitCompletion>) {
        match completion {
            Some(completion) => tracing::info!(
                source_frame_number = completion.source_frame_number,
                activated = completion.activated,
                "commit completed"
            ),
            None => tracing::warn!("commit abandoned"),
        }
    }
}

/// Logs draws and reports every drawn token for presentation feedback.
struct LoggingRasterizer {
    scroll_offset: f32,
    activated: bool,
    presented: Sender<(FrameToken, Instant)>,
}

impl Rasterizer for LoggingRasterizer {
    type Delta = SceneDelta;

    fn create_output_sink(&mut self) -> Result<(), OutputSinkError> {
        tracing::info!("output sink created");
        Ok(())
    }

    fn release_output_sink(&mut self) {
        tracing::info!("output sink released");
    }

    fn apply_commit(&mut self, delta: SceneDelta) {
        self.scroll_offset = delta.scroll_offset;
    }

    fn activate_content_tree(&mut self) {
        self.activated = true;
    }

    fn prepare_resources(&mut self) -> ResourceReadiness {
        ResourceReadiness::READY
    }

    fn can_draw(&self) -> bool {
        self.activated
    }

    fn prepare_to_draw(&mut self, _frame: &mut FrameData) -> Result<(), DrawError> {
        Ok(())
    }

    fn draw_layers(&mut self, frame: &FrameData) -> Option<DrawMetrics> {
        tracing::info!(
            frame_token = frame.frame_token,
            source_frame_number = ?frame.source_frame_number,
            scroll_offset = self.scroll_offset,
            "drawing frame"
        );
        let _ = self.presented.send((frame.frame_token, Instant::now()));
        Some(DrawMetrics {
            layers_drawn: 1,
            gpu_time: Duration::ZERO,
        })
    }

    fn did_draw_all_layers(&mut self, _frame: &FrameData) {}
}

fn load_config(arguments: &Arguments) -> Result<PipelineConfig> {
    let mut config = match &arguments.config {
        Some(path) => PipelineConfig::from_path(path)
            .with_context(|| format!("load pipeline config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if arguments.non_blocking {
        config.commit_mode = CommitMode::NonBlocking;
    }
    if arguments.activation_gated {
        config.activation_gated_commits = true;
    }
    if let Some(interval_micros) = arguments.interval_micros {
        config.frame_interval_micros = interval_micros;
    }
    config.validate().context("validate pipeline config")?;
    Ok(config)
}

fn forward_presentations(
    bridge: &PipelineBridge<SceneDelta>,
    presented: &Receiver<(FrameToken, Instant)>,
) -> Result<()> {
    while let Ok((frame_token, presented_at)) = presented.try_recv() {
        bridge
            .post_to_consumer(ConsumerMsg::PresentationFeedback {
                frame_token,
                presented_at,
            })
            .context("post presentation feedback")?;
    }
    Ok(())
}

fn summarize(readers: &mut [TelemetryReader]) {
    let mut events = Vec::new();
    let mut dropped = 0;
    for reader in readers.iter_mut() {
        reader.drain_into(&mut events);
        dropped += reader.dropped_events();
    }

    let mut early_outs = 0_u64;
    let mut frames_drawn = 0_u64;
    let mut latencies = Vec::new();
    for event in &events {
        match event {
            TelemetryEvent::UpdateEnded {
                early_out: Some(_), ..
            } => early_outs += 1,
            TelemetryEvent::FrameDrawn { .. } => frames_drawn += 1,
            TelemetryEvent::FramePresented { latency, .. } => latencies.push(*latency),
            _ => {}
        }
    }
    let mean_latency = if latencies.is_empty() {
        Duration::ZERO
    } else {
        latencies.iter().sum::<Duration>() / latencies.len() as u32
    };
    tracing::info!(
        events = events.len(),
        dropped,
        early_outs,
        frames_drawn,
        presentations = latencies.len(),
        ?mean_latency,
        "telemetry summary"
    );
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let arguments = Arguments::parse();
    let config = load_config(&arguments)?;
    tracing::info!(?config, "starting frame pipeline");

    let (producer_telemetry, producer_reader) = telemetry_ring(config.telemetry_ring_capacity);
    let (consumer_telemetry, consumer_reader) = telemetry_ring(config.telemetry_ring_capacity);
    let (presented_sender, presented) = unbounded();

    let bridge = PipelineBridge::spawn(
        &config,
        Arc::new(SystemClock),
        TelemetrySinks {
            producer: Box::new(producer_telemetry),
            consumer: Box::new(consumer_telemetry),
        },
        || DemoScene {
            scroll_offset: 0.0,
            velocity: 120.0,
            dirty: false,
        },
        move || LoggingRasterizer {
            scroll_offset: 0.0,
            activated: false,
            presented: presented_sender,
        },
    )
    .context("spawn pipeline threads")?;

    for trace_id in 0..arguments.frames {
        let (promise, outcome) = DeliveryPromise::channel(trace_id);
        bridge.queue_promise(promise);
        bridge
            .post_to_consumer(ConsumerMsg::AccumulateInteraction(InteractionDeltas {
                scroll_y: 4.0,
                ..InteractionDeltas::default()
            }))
            .context("post interaction")?;
        bridge
            .request(ProducerRequest::SetNeedsCommit)
            .context("request commit")?;

        match outcome.recv_timeout(DELIVERY_TIMEOUT) {
            Ok(DeliveryOutcome::Delivered { frame_token }) => {
                tracing::info!(trace_id, frame_token, "update delivered")
            }
            Ok(outcome) => tracing::warn!(trace_id, ?outcome, "update not delivered"),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(trace_id, "update still pending after timeout")
            }
            Err(RecvTimeoutError::Disconnected) => {
                anyhow::bail!("delivery promise for update {trace_id} was lost")
            }
        }
        forward_presentations(&bridge, &presented)?;
    }

    bridge.shutdown().context("stop pipeline threads")?;
    summarize(&mut [producer_reader, consumer_reader]);
    Ok(())
}
