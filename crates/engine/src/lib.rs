//! Thread plumbing shared by the producer and consumer sides of the pipeline.
//!
//! - mailbox channels between the two threads (`create_thread_channels`)
//! - a generation-checked arena for the consumer's back-reference to the producer
//! - injected capabilities: [`clock::Clock`] and [`telemetry::TelemetrySink`]

pub mod clock;
pub mod telemetry;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{Receiver, Sender, unbounded};
use protocol::{ConsumerMsg, ProducerMsg};
use slotmap::SlotMap;

pub use clock::{Clock, ManualClock, SystemClock};
pub use telemetry::{
    NoopTelemetry, RingTelemetry, TelemetryEvent, TelemetryReader, TelemetrySink, telemetry_ring,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PostError {
    #[error("producer has been torn down")]
    ProducerGone,
    #[error("consumer mailbox disconnected")]
    ConsumerGone,
}

slotmap::new_key_type! {
    pub struct ProducerKey;
}

/// Arena of live producer mailboxes.
///
/// Keys are generational: once a producer unregisters, every handle that still
/// refers to it fails with [`PostError::ProducerGone`] instead of posting into
/// a stale mailbox.
#[derive(Debug, Default)]
pub struct ProducerRegistry {
    slots: Mutex<SlotMap<ProducerKey, Sender<ProducerMsg>>>,
}

impl ProducerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, sender: Sender<ProducerMsg>) -> ProducerRegistration {
        let key = self.lock_slots().insert(sender);
        ProducerRegistration {
            key,
            registry: self.clone(),
        }
    }

    pub fn live_producers(&self) -> usize {
        self.lock_slots().len()
    }

    fn lock_slots(&self) -> MutexGuard<'_, SlotMap<ProducerKey, Sender<ProducerMsg>>> {
        // A poisoned arena still holds valid keys; keep serving them.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owned by the producer thread; unregisters the producer when dropped.
#[derive(Debug)]
pub struct ProducerRegistration {
    key: ProducerKey,
    registry: Arc<ProducerRegistry>,
}

impl ProducerRegistration {
    pub fn handle(&self) -> ProducerHandle {
        ProducerHandle {
            key: self.key,
            registry: self.registry.clone(),
        }
    }
}

impl Drop for ProducerRegistration {
    fn drop(&mut self) {
        self.registry.lock_slots().remove(self.key);
        tracing::debug!("producer unregistered");
    }
}

/// Weak, generation-checked back-reference from the consumer to the producer.
#[derive(Debug, Clone)]
pub struct ProducerHandle {
    key: ProducerKey,
    registry: Arc<ProducerRegistry>,
}

impl ProducerHandle {
    pub fn is_alive(&self) -> bool {
        self.registry.lock_slots().contains_key(self.key)
    }

    pub fn post(&self, message: ProducerMsg) -> Result<(), PostError> {
        let slots = self.registry.lock_slots();
        let sender = slots.get(self.key).ok_or(PostError::ProducerGone)?;
        sender.send(message).map_err(|_| PostError::ProducerGone)
    }
}

/// Producer-to-consumer mailbox sender.
#[derive(Debug)]
pub struct ConsumerHandle<Delta> {
    sender: Sender<ConsumerMsg<Delta>>,
}

impl<Delta> Clone for ConsumerHandle<Delta> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<Delta> ConsumerHandle<Delta> {
    pub fn post(&self, message: ConsumerMsg<Delta>) -> Result<(), PostError> {
        self.sender.send(message).map_err(|_| PostError::ConsumerGone)
    }
}

pub struct ProducerThreadChannels<Delta> {
    pub inbox: Receiver<ProducerMsg>,
    /// Used by callback-bound gates to post completions back into `inbox`.
    pub self_sender: Sender<ProducerMsg>,
    pub registration: ProducerRegistration,
    pub consumer: ConsumerHandle<Delta>,
}

pub struct ConsumerThreadChannels<Delta> {
    pub inbox: Receiver<ConsumerMsg<Delta>>,
    pub producer: ProducerHandle,
}

/// Both mailboxes are unbounded: the consumer must never block posting to the
/// producer, and the producer's only suspension point is the commit gate.
/// The protocol itself bounds traffic to one outstanding update request.
pub fn create_thread_channels<Delta>(
    registry: &Arc<ProducerRegistry>,
) -> (
    ProducerThreadChannels<Delta>,
    ConsumerThreadChannels<Delta>,
    ConsumerHandle<Delta>,
) {
    let (producer_sender, producer_receiver) = unbounded();
    let (consumer_sender, consumer_receiver) = unbounded();

    let registration = registry.register(producer_sender.clone());
    let producer = registration.handle();
    let consumer = ConsumerHandle {
        sender: consumer_sender,
    };

    let producer_channels = ProducerThreadChannels {
        inbox: producer_receiver,
        self_sender: producer_sender,
        registration,
        consumer: consumer.clone(),
    };
    let consumer_channels = ConsumerThreadChannels {
        inbox: consumer_receiver,
        producer,
    };

    (producer_channels, consumer_channels, consumer)
}
