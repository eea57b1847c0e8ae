//! I/O Scheduler
//!
//! Single task that owns the transport. Every iteration computes the earliest
//! deadline among the transport's own retransmissions, the provisioner's resend
//! timer, the observation window and the global wait, then blocks on inbound
//! traffic, the outbound queue fed by the producers, or that deadline.

use crate::classifier::{Classifier, InboundEvent};
use crate::coap;
use crate::estimator::{wall_clock_nanos, LatencyEstimator};
use crate::link::LinkState;
use crate::om2m::Request;
use crate::provisioning::{Phase, Provisioner, Transition};
use crate::transport::{Inbound, InboundRequest, Response, Transport, TransportError};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};

/// Global wait armed when the scheduler starts serving
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(90);

/// Depth of the producers' send queue
pub const OUTBOUND_CAPACITY: usize = 32;

enum Wake {
    Inbound(Result<Option<Inbound>, TransportError>),
    Outbound(Request),
    Deadline,
}

/// Central event loop
pub struct Scheduler<T> {
    transport: T,
    provisioner: Provisioner,
    classifier: Classifier,
    estimator: Arc<LatencyEstimator>,
    link: LinkState,
    outbound_tx: mpsc::Sender<Request>,
    outbound: mpsc::Receiver<Request>,
    phase: watch::Sender<Phase>,
    notifications: Option<mpsc::Sender<String>>,
    max_wait: Duration,
    max_wait_deadline: Option<Instant>,
    observe_window: Option<Duration>,
    obs_wait: Option<Instant>,
    observing: bool,
    clock: fn() -> u64,
}

impl<T: Transport> Scheduler<T> {
    pub fn new(transport: T, provisioner: Provisioner, estimator: Arc<LatencyEstimator>, link: LinkState) -> Self {
        let (outbound_tx, outbound) = mpsc::channel(OUTBOUND_CAPACITY);
        let (phase, _) = watch::channel(provisioner.phase());

        Self {
            transport,
            provisioner,
            classifier: Classifier::default(),
            estimator,
            link,
            outbound_tx,
            outbound,
            phase,
            notifications: None,
            max_wait: DEFAULT_MAX_WAIT,
            max_wait_deadline: None,
            observe_window: None,
            obs_wait: None,
            observing: true,
            clock: wall_clock_nanos,
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Stop forwarding notifications `window` after the subscription is acknowledged
    pub fn with_observe_window(mut self, window: Option<Duration>) -> Self {
        self.observe_window = window;
        self
    }

    /// Forward notification content to `tx`
    pub fn with_notifications(mut self, tx: mpsc::Sender<String>) -> Self {
        self.notifications = Some(tx);
        self
    }

    /// Wall-clock source used to age probe echoes
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// Send path for producers
    pub fn sender(&self) -> mpsc::Sender<Request> {
        self.outbound_tx.clone()
    }

    /// Provisioning phase observer
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Serve forever once the link is up
    pub async fn run(mut self) {
        if !self.link.wait_up().await {
            tracing::error!("Link control dropped before the link came up");
            return;
        }

        let now = Instant::now();
        self.max_wait_deadline = Some(now + self.max_wait);
        if let Some(request) = self.provisioner.start(now) {
            self.transmit(&request).await;
        }
        self.phase.send_replace(self.provisioner.phase());

        loop {
            let deadline = self.next_deadline();

            let wake = tokio::select! {
                inbound = self.transport.receive() => Wake::Inbound(inbound),
                Some(request) = self.outbound.recv() => Wake::Outbound(request),
                _ = sleep_until(deadline) => Wake::Deadline,
            };

            match wake {
                Wake::Inbound(Ok(Some(Inbound::Response(response)))) => self.on_response(response).await,
                Wake::Inbound(Ok(Some(Inbound::Request(request)))) => self.on_request(request).await,
                Wake::Inbound(Ok(None)) => {}
                Wake::Inbound(Err(e)) => tracing::warn!("Receive failed: {}", e),
                Wake::Outbound(request) => self.on_outbound(request).await,
                Wake::Deadline => self.on_deadline(Instant::now()).await,
            }
        }
    }

    /// Earliest pending deadline. Transport retransmissions only count while
    /// the link is up.
    fn next_deadline(&self) -> Option<Instant> {
        let retransmission = self
            .link
            .is_up()
            .then(|| self.transport.peek_next_scheduled())
            .flatten();
        [
            retransmission,
            self.provisioner.next_deadline(),
            self.obs_wait,
            self.max_wait_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn on_deadline(&mut self, now: Instant) {
        if let Some(request) = self.provisioner.poll(now) {
            self.transmit(&request).await;
        }

        if self.link.is_up() {
            if let Err(e) = self.transport.dispatch_scheduled(now).await {
                tracing::warn!("Retransmission failed: {}", e);
            }
        }

        if self.max_wait_deadline.is_some_and(|d| d <= now) {
            tracing::warn!("timeout");
            self.max_wait_deadline = None;
        }

        if self.obs_wait.is_some_and(|d| d <= now) {
            tracing::info!("Observation window closed");
            self.obs_wait = None;
            self.observing = false;
        }
    }

    async fn on_response(&mut self, response: Response) {
        let event = self.classifier.classify_response(self.provisioner.awaiting(), &response);

        match event {
            InboundEvent::ProbeEcho { sent_at_nanos } => {
                let rtt = (self.clock)().saturating_sub(sent_at_nanos);
                let average = self.estimator.update(rtt);
                tracing::debug!("Round trip {}ns, average {:.0}ns", rtt, average);
            }
            InboundEvent::AckAe | InboundEvent::AckContainer | InboundEvent::AckSubscription => {
                self.advance(&event).await;
            }
            _ => {}
        }
    }

    async fn advance(&mut self, event: &InboundEvent) {
        let now = Instant::now();
        let Transition::Advanced(next) = self.provisioner.on_event(event, now) else {
            return;
        };

        if *event == InboundEvent::AckSubscription {
            if let Some(window) = self.observe_window {
                tracing::info!("Observing notifications for {}s", window.as_secs());
                self.obs_wait = Some(now + window);
            }
        }

        if let Some(request) = next {
            self.transmit(&request).await;
        }
        self.phase.send_replace(self.provisioner.phase());
    }

    async fn on_request(&mut self, request: InboundRequest) {
        if let Err(e) = self.transport.respond(&request, coap::CHANGED).await {
            tracing::warn!("Failed to answer {}: {}", request.peer, e);
        }

        let InboundEvent::DataNotification { payload } = self.classifier.classify_request(&request) else {
            return;
        };

        if !self.observing {
            tracing::debug!("Observation window closed, dropping notification");
            return;
        }

        tracing::debug!("Notification from {}: {}", request.peer, payload);
        if let Some(tx) = &self.notifications {
            if tx.try_send(payload).is_err() {
                tracing::debug!("Notification consumer lagging, dropping");
            }
        }
    }

    async fn on_outbound(&mut self, request: Request) {
        if !self.provisioner.is_ready() {
            tracing::debug!("Not provisioned, dropping request to {}", request.path);
            return;
        }
        self.transmit(&request).await;
    }

    /// Send without buffering; a down link or failed send drops the request
    async fn transmit(&mut self, request: &Request) {
        if !self.link.is_up() {
            tracing::debug!("Link down, dropping request to {}", request.path);
            return;
        }
        if let Err(e) = self.transport.send(request).await {
            tracing::warn!("Send to {} failed: {}", request.path, e);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
