//! Split-thread frame pipeline.
//!
//! A producer thread computes content and hands it over as a move-only
//! commit package; a consumer thread schedules commits, activations and draws
//! against its frame ticks. [`PipelineBridge`] runs both threads; the two
//! coordinators can also be driven message by message without threads.

pub mod bridge;
pub mod client;
pub mod config;
pub mod consumer;
pub mod producer;

#[cfg(test)]
mod test_support;

pub use bridge::{BridgeError, PipelineBridge, TelemetrySinks};
pub use client::{
    ContentClient, DrawError, DrawMetrics, FrameData, OutputSinkError, Rasterizer,
    ResourceReadiness, StageRequests, UpdateOutcome,
};
pub use config::{CommitMode, ConfigError, PipelineConfig};
pub use consumer::{ConsumerCoordinator, ConsumerFlow, ConsumerSettings, ConsumerStats};
pub use producer::{
    PassOutcome, PassRecord, ProducerCoordinator, ProducerFlow, ProducerLinks, ProducerSettings,
    ProducerStats, StageSnapshot,
};
