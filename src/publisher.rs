//! Telemetry Publisher
//!
//! Heartbeat and probe producers. Both stay inert until provisioning reaches
//! [`Phase::Ready`] and hand their requests to the scheduler's send path.

use crate::estimator::{wall_clock_nanos, LatencyEstimator};
use crate::om2m::{self, Endpoint, Request};
use crate::provisioning::Phase;
use crate::sensor::{SampleSlot, TelemetrySample};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, MissedTickBehavior};

/// Minimum gap between two heartbeats
pub const DEFAULT_HEARTBEAT_SPACING: Duration = Duration::from_secs(1);

/// Probe cadence
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Container a producer writes into
#[derive(Debug, Clone)]
pub struct Target {
    pub endpoint: Endpoint,
    pub entity: String,
    pub container: String,
}

impl Target {
    pub fn new(endpoint: Endpoint, entity: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            endpoint,
            entity: entity.into(),
            container: container.into(),
        }
    }

    fn content_instance(&self, name: &str, content: &str) -> Request {
        om2m::create_content_instance(&self.endpoint, &self.entity, &self.container, name, content)
    }
}

/// Block until provisioning completes. `false` if the scheduler went away.
async fn wait_ready(phase: &mut watch::Receiver<Phase>) -> bool {
    phase.wait_for(|p| *p == Phase::Ready).await.is_ok()
}

/// Publishes the sensor average with the current latency estimate
pub struct HeartbeatProducer {
    target: Target,
    slot: Arc<SampleSlot>,
    estimator: Arc<LatencyEstimator>,
    spacing: Duration,
    next_index: u64,
}

impl HeartbeatProducer {
    pub fn new(target: Target, slot: Arc<SampleSlot>, estimator: Arc<LatencyEstimator>) -> Self {
        Self {
            target,
            slot,
            estimator,
            spacing: DEFAULT_HEARTBEAT_SPACING,
            next_index: 0,
        }
    }

    pub fn with_spacing(mut self, spacing: Duration) -> Self {
        self.spacing = spacing;
        self
    }

    /// `HB_{n}` carrying `"{average}:{latency}"`
    pub fn next_request(&mut self, sample: TelemetrySample) -> Request {
        let name = format!("HB_{}", self.next_index);
        self.next_index += 1;
        let content = format!("{:.6}:{:.6}", sample.ir_average, self.estimator.average());
        self.target.content_instance(&name, &content)
    }

    pub async fn run(mut self, mut phase: watch::Receiver<Phase>, tx: mpsc::Sender<Request>) {
        if !wait_ready(&mut phase).await {
            return;
        }
        tracing::info!("Publishing heartbeats to {}/{}", self.target.entity, self.target.container);

        loop {
            let sample = self.slot.wait().await;
            let index = self.next_index;
            let request = self.next_request(sample);

            tracing::info!("Publish;rn:HB_{};timestamp:{}", index, wall_clock_nanos());
            if tx.send(request).await.is_err() {
                tracing::warn!("Send path closed, stopping heartbeats");
                return;
            }

            tokio::time::sleep(self.spacing).await;
        }
    }
}

/// Emits timestamped delay records whose echoes feed the latency estimator
pub struct ProbeProducer {
    target: Target,
    prefix: String,
    interval: Duration,
    next_index: u64,
    clock: fn() -> u64,
}

impl ProbeProducer {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            prefix: crate::classifier::DEFAULT_DELAY_PREFIX.into(),
            interval: DEFAULT_PROBE_INTERVAL,
            next_index: 0,
            clock: wall_clock_nanos,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Record name prefix; must match the classifier's
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// `delay_{n}` carrying the transmit time in nanoseconds
    pub fn next_request(&mut self) -> Request {
        let name = format!("{}{}", self.prefix, self.next_index);
        self.next_index += 1;
        self.target.content_instance(&name, &(self.clock)().to_string())
    }

    pub async fn run(mut self, mut phase: watch::Receiver<Phase>, tx: mpsc::Sender<Request>) {
        if !wait_ready(&mut phase).await {
            return;
        }
        tracing::info!("Probing every {}ms", self.interval.as_millis());

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if tx.send(self.next_request()).await.is_err() {
                tracing::warn!("Send path closed, stopping probes");
                return;
            }
        }
    }
}
