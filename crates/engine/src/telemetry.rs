//! Telemetry capability.
//!
//! Telemetry is best effort: a sink that cannot keep up drops events and never
//! reports back into the pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use protocol::{EarlyOutReason, FrameToken, SourceFrameNumber};
use rtrb::{Consumer, Producer, PushError, RingBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryEvent {
    UpdateBegan {
        source_frame_number: SourceFrameNumber,
        at: Instant,
    },
    UpdateEnded {
        source_frame_number: SourceFrameNumber,
        at: Instant,
        early_out: Option<EarlyOutReason>,
    },
    FrameDrawn {
        frame_token: FrameToken,
        at: Instant,
    },
    FramePresented {
        frame_token: FrameToken,
        latency: Duration,
    },
}

pub trait TelemetrySink: Send {
    fn record(&mut self, event: TelemetryEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&mut self, _event: TelemetryEvent) {}
}

/// Single-producer ring sink; one per pipeline thread.
pub struct RingTelemetry {
    producer: Producer<TelemetryEvent>,
    dropped: Arc<AtomicU64>,
}

impl TelemetrySink for RingTelemetry {
    fn record(&mut self, event: TelemetryEvent) {
        match self.producer.push(event) {
            Ok(()) => {}
            Err(PushError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

pub struct TelemetryReader {
    consumer: Consumer<TelemetryEvent>,
    dropped: Arc<AtomicU64>,
}

impl TelemetryReader {
    /// Append every buffered event to `output`.
    pub fn drain_into(&mut self, output: &mut Vec<TelemetryEvent>) {
        while let Ok(event) = self.consumer.pop() {
            output.push(event);
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub fn telemetry_ring(capacity: usize) -> (RingTelemetry, TelemetryReader) {
    assert!(capacity > 0, "telemetry ring capacity must be greater than zero");
    let (producer, consumer) = RingBuffer::new(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        RingTelemetry {
            producer,
            dropped: dropped.clone(),
        },
        TelemetryReader { consumer, dropped },
    )
}
