//! OM2M CoAP Client - Provisioning and Telemetry
//!
//! Registers a device with a oneM2M broker over CoAP and streams heart-rate
//! telemetry into it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         OM2M COAP CLIENT                         │
//! │                                                                  │
//! │  ┌──────────────┐    ┌──────────────────┐   ┌─────────────────┐  │
//! │  │ SENSOR POLLER│───▶│ HEARTBEAT PRODUCER│   │ PROBE PRODUCER  │  │
//! │  └──────────────┘    └─────────┬────────┘   └────────┬────────┘  │
//! │                                │   outbound queue    │           │
//! │  ┌─────────────────────────────▼─────────────────────▼────────┐  │
//! │  │                       I/O SCHEDULER                        │  │
//! │  │  Provisioner | Classifier | Latency Estimator | Deadlines  │  │
//! │  └─────────────────────────────┬──────────────────────────────┘  │
//! │                                │                                 │
//! │  ┌─────────────────────────────▼──────────────────────────────┐  │
//! │  │                   CoAP TRANSPORT (UDP)                     │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod classifier;
pub mod coap;
pub mod config;
pub mod estimator;
pub mod link;
pub mod om2m;
pub mod provisioning;
pub mod publisher;
pub mod scheduler;
pub mod sensor;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use classifier::{Classifier, InboundEvent};
pub use config::ClientConfig;
pub use estimator::LatencyEstimator;
pub use link::{link, LinkControl, LinkState};
pub use om2m::{Endpoint, Request};
pub use provisioning::{Phase, Provisioner};
pub use publisher::{HeartbeatProducer, ProbeProducer, Target};
pub use scheduler::Scheduler;
pub use sensor::{HeartRateSensor, SampleSlot, SensorPoller, SimulatedSensor};
pub use transport::{Transport, TransportError, UdpTransport};

/// Client error types
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task ended: {0}")]
    Task(String),
}

const NOTIFICATION_BACKLOG: usize = 16;

/// Provisioning and telemetry client
pub struct Om2mClient {
    config: ClientConfig,
    endpoint: Endpoint,
    estimator: Arc<LatencyEstimator>,
    slot: Arc<SampleSlot>,
}

impl Om2mClient {
    /// Create client, resolving the broker address
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let endpoint = config.endpoint()?;
        let estimator = Arc::new(LatencyEstimator::new(config.latency_alpha));

        Ok(Self {
            config,
            endpoint,
            estimator,
            slot: Arc::new(SampleSlot::new()),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Round-trip estimate shared with the heartbeat producer
    pub fn estimator(&self) -> Arc<LatencyEstimator> {
        self.estimator.clone()
    }

    /// Spawn every task and wait. Only returns if one of them stops.
    ///
    /// `local` is the address announced in the entity's point of access.
    pub async fn run<T, S>(self, transport: T, local: SocketAddr, sensor: S, link: LinkState) -> Result<(), ClientError>
    where
        T: Transport + 'static,
        S: HeartRateSensor + 'static,
    {
        let config = &self.config;
        let timing = &config.timing;
        tracing::info!(
            "Broker {} at {}, entity {}",
            config.broker.cse_id,
            self.endpoint.broker,
            config.entity.name
        );

        let provisioner = Provisioner::new(
            self.endpoint.clone(),
            config.provisioning_steps(local),
            timing.retransmission(),
        );

        let (notify_tx, mut notify_rx) = mpsc::channel(NOTIFICATION_BACKLOG);
        let scheduler = Scheduler::new(transport, provisioner, self.estimator.clone(), link)
            .with_classifier(Classifier::new(config.delay_prefix.clone()))
            .with_max_wait(timing.max_wait())
            .with_observe_window(timing.observe())
            .with_notifications(notify_tx);
        let outbound = scheduler.sender();
        let phase = scheduler.phase();

        let heartbeat = HeartbeatProducer::new(
            Target::new(self.endpoint.clone(), &config.entity.name, &config.containers.telemetry),
            self.slot.clone(),
            self.estimator.clone(),
        )
        .with_spacing(timing.heartbeat_spacing());
        let probe = ProbeProducer::new(Target::new(
            self.endpoint.clone(),
            &config.entity.name,
            &config.containers.delay,
        ))
        .with_prefix(config.delay_prefix.clone())
        .with_interval(timing.probe_interval());
        let poller = SensorPoller::new(sensor, self.slot.clone(), timing.sensor_poll());

        let poller_handle = tokio::spawn(poller.run());
        let scheduler_handle = tokio::spawn(scheduler.run());
        let heartbeat_handle = tokio::spawn(heartbeat.run(phase.clone(), outbound.clone()));
        let probe_handle = tokio::spawn(probe.run(phase, outbound));
        let notification_handle = tokio::spawn(async move {
            while let Some(content) = notify_rx.recv().await {
                tracing::info!("Notification: {}", content);
            }
        });

        let stopped = tokio::select! {
            _ = poller_handle => "sensor poller",
            _ = scheduler_handle => "scheduler",
            _ = heartbeat_handle => "heartbeat producer",
            _ = probe_handle => "probe producer",
            _ = notification_handle => "notification logger",
        };

        tracing::error!("{} stopped", stopped);
        Err(ClientError::Task(stopped.into()))
    }
}
