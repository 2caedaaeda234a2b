//! Pipeline Bridge.
//!
//! Spawns the producer and consumer threads and owns the external ends of
//! both mailboxes. Collaborators are constructed on the thread that uses
//! them, so neither needs to be `Send`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, at, never, select, tick};
use engine::{
    Clock, ConsumerHandle, PostError, ProducerHandle, ProducerRegistration, ProducerRegistry,
    TelemetrySink, create_thread_channels,
};
use frame_scheduler::DeadlineMode;
use protocol::{
    ConsumerMsg, DeliveryPromise, ProducerMsg, ProducerRequest, PromiseRegistry, TickArgs,
};

use crate::client::{ContentClient, Rasterizer};
use crate::config::PipelineConfig;
use crate::consumer::{ConsumerCoordinator, ConsumerFlow, ConsumerSettings};
use crate::producer::{ProducerCoordinator, ProducerFlow, ProducerLinks, ProducerSettings};

const PRODUCER_THREAD_NAME: &str = "frame-producer";
const CONSUMER_THREAD_NAME: &str = "frame-consumer";

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to spawn {thread} thread")]
    Spawn {
        thread: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{thread} thread panicked")]
    ThreadPanicked { thread: &'static str },
    #[error(transparent)]
    Post(#[from] PostError),
}

/// Telemetry sinks for the two pipeline threads.
pub struct TelemetrySinks {
    pub producer: Box<dyn TelemetrySink>,
    pub consumer: Box<dyn TelemetrySink>,
}

impl Default for TelemetrySinks {
    fn default() -> Self {
        Self {
            producer: Box::new(engine::NoopTelemetry),
            consumer: Box::new(engine::NoopTelemetry),
        }
    }
}

/// Handle to a running two-thread pipeline.
///
/// Dropping the bridge stops both threads and joins them.
pub struct PipelineBridge<Delta> {
    producer: ProducerHandle,
    consumer: ConsumerHandle<Delta>,
    promises: Arc<PromiseRegistry>,
    producer_thread: Option<JoinHandle<()>>,
    consumer_thread: Option<JoinHandle<()>>,
}

impl<Delta: Send + 'static> PipelineBridge<Delta> {
    pub fn spawn<C, R, MakeClient, MakeRasterizer>(
        config: &PipelineConfig,
        clock: Arc<dyn Clock>,
        telemetry: TelemetrySinks,
        make_client: MakeClient,
        make_rasterizer: MakeRasterizer,
    ) -> Result<Self, BridgeError>
    where
        C: ContentClient<Delta = Delta>,
        R: Rasterizer<Delta = Delta>,
        MakeClient: FnOnce() -> C + Send + 'static,
        MakeRasterizer: FnOnce() -> R + Send + 'static,
    {
        let registry = ProducerRegistry::new();
        let (producer_channels, consumer_channels, consumer) =
            create_thread_channels::<Delta>(&registry);
        let producer = producer_channels.registration.handle();
        let promises = Arc::new(PromiseRegistry::new());

        let TelemetrySinks {
            producer: producer_telemetry,
            consumer: consumer_telemetry,
        } = telemetry;
        let interval = config.frame_interval();
        let consumer_settings = ConsumerSettings::from(config);
        let consumer_clock = clock.clone();
        let consumer_thread = thread::Builder::new()
            .name(CONSUMER_THREAD_NAME.to_owned())
            .spawn(move || {
                let coordinator = ConsumerCoordinator::new(
                    make_rasterizer(),
                    consumer_channels.producer,
                    consumer_clock.clone(),
                    consumer_telemetry,
                    consumer_settings,
                );
                consumer_loop(coordinator, consumer_channels.inbox, consumer_clock, interval);
            })
            .map_err(|source| BridgeError::Spawn {
                thread: CONSUMER_THREAD_NAME,
                source,
            })?;

        let producer_settings = ProducerSettings::from(config);
        let initially_visible = config.initially_visible;
        let producer_promises = promises.clone();
        let spawn_result = thread::Builder::new()
            .name(PRODUCER_THREAD_NAME.to_owned())
            .spawn(move || {
                let links = ProducerLinks {
                    consumer: producer_channels.consumer,
                    self_sender: producer_channels.self_sender,
                };
                let mut coordinator = ProducerCoordinator::new(
                    make_client(),
                    links,
                    clock,
                    producer_telemetry,
                    producer_promises,
                    producer_settings,
                );
                coordinator.set_visible(initially_visible);
                producer_loop(
                    coordinator,
                    producer_channels.inbox,
                    producer_channels.registration,
                );
            });
        let producer_thread = match spawn_result {
            Ok(handle) => handle,
            Err(source) => {
                let _ = consumer.post(ConsumerMsg::Stop);
                join_thread(CONSUMER_THREAD_NAME, consumer_thread)?;
                return Err(BridgeError::Spawn {
                    thread: PRODUCER_THREAD_NAME,
                    source,
                });
            }
        };

        Ok(Self {
            producer,
            consumer,
            promises,
            producer_thread: Some(producer_thread),
            consumer_thread: Some(consumer_thread),
        })
    }

    pub fn producer(&self) -> &ProducerHandle {
        &self.producer
    }

    pub fn consumer(&self) -> &ConsumerHandle<Delta> {
        &self.consumer
    }

    pub fn request(&self, request: ProducerRequest) -> Result<(), BridgeError> {
        self.producer.post(ProducerMsg::Request(request))?;
        Ok(())
    }

    pub fn post_to_consumer(&self, message: ConsumerMsg<Delta>) -> Result<(), BridgeError> {
        self.consumer.post(message)?;
        Ok(())
    }

    /// Queue a promise for the next commit.
    pub fn queue_promise(&self, promise: DeliveryPromise) {
        self.promises.push(promise);
    }

    /// Stop both threads and report whether either panicked.
    pub fn shutdown(mut self) -> Result<(), BridgeError> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<(), BridgeError> {
        if let Err(error) = self.producer.post(ProducerMsg::Stop) {
            tracing::debug!(%error, "producer already stopped");
        }
        if let Err(error) = self.consumer.post(ConsumerMsg::Stop) {
            tracing::debug!(%error, "consumer already stopped");
        }
        // The consumer goes first: it releases any commit gate the producer waits on.
        let consumer = self
            .consumer_thread
            .take()
            .map(|handle| join_thread(CONSUMER_THREAD_NAME, handle))
            .unwrap_or(Ok(()));
        let producer = self
            .producer_thread
            .take()
            .map(|handle| join_thread(PRODUCER_THREAD_NAME, handle))
            .unwrap_or(Ok(()));
        consumer.and(producer)
    }
}

impl<Delta> Drop for PipelineBridge<Delta> {
    fn drop(&mut self) {
        if self.producer_thread.is_none() && self.consumer_thread.is_none() {
            return;
        }
        let _ = self.producer.post(ProducerMsg::Stop);
        let _ = self.consumer.post(ConsumerMsg::Stop);
        for (name, handle) in [
            (CONSUMER_THREAD_NAME, self.consumer_thread.take()),
            (PRODUCER_THREAD_NAME, self.producer_thread.take()),
        ] {
            if let Some(handle) = handle {
                if let Err(error) = join_thread(name, handle) {
                    tracing::error!(%error, "pipeline thread failed");
                }
            }
        }
    }
}

fn join_thread(thread: &'static str, handle: JoinHandle<()>) -> Result<(), BridgeError> {
    handle
        .join()
        .map_err(|_| BridgeError::ThreadPanicked { thread })
}

fn producer_loop<C: ContentClient>(
    mut coordinator: ProducerCoordinator<C>,
    inbox: Receiver<ProducerMsg>,
    registration: ProducerRegistration,
) {
    tracing::debug!("producer thread started");
    loop {
        select! {
            recv(inbox) -> message => {
                let Ok(message) = message else {
                    coordinator.shutdown();
                    break;
                };
                if coordinator.handle_message(message) == ProducerFlow::Stop {
                    break;
                }
            }
        }
    }
    // Stale handles fail with `ProducerGone` from here on.
    drop(registration);
}

fn consumer_loop<R: Rasterizer>(
    mut coordinator: ConsumerCoordinator<R>,
    inbox: Receiver<ConsumerMsg<R::Delta>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
) {
    tracing::debug!(?interval, "consumer thread started");
    let ticker = tick(interval);
    let mut frame_id = 0_u64;
    let mut deadline: Option<Instant> = None;

    loop {
        let deadline_timer = deadline.map_or_else(never, at);
        select! {
            recv(inbox) -> message => {
                let Ok(message) = message else {
                    coordinator.shutdown();
                    break;
                };
                if coordinator.handle_message(message) == ConsumerFlow::Stop {
                    break;
                }
            }
            recv(ticker) -> _ => {
                if deadline.take().is_some() {
                    coordinator.on_tick_deadline();
                }
                frame_id += 1;
                let args = TickArgs::new(frame_id, clock.now(), interval);
                coordinator.begin_tick(args);
                deadline = match coordinator.deadline_mode() {
                    DeadlineMode::Immediate => {
                        coordinator.on_tick_deadline();
                        None
                    }
                    DeadlineMode::Regular => {
                        Some(Instant::now() + (args.deadline - args.frame_time))
                    }
                    // Held until the next tick unless the blocker clears first.
                    DeadlineMode::Blocked => Some(Instant::now() + interval),
                };
            }
            recv(deadline_timer) -> _ => {
                deadline = None;
                coordinator.on_tick_deadline();
            }
        }
        if deadline.is_some() && coordinator.deadline_mode() == DeadlineMode::Immediate {
            deadline = None;
            coordinator.on_tick_deadline();
        }
    }
    tracing::debug!("consumer thread exiting");
}
