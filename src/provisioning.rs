//! Resource Provisioning
//!
//! Creates the application entity, its containers and the subscription, strictly
//! in that order. Each step is retried at a fixed interval until the broker
//! acknowledges it. There is no retry ceiling: without its entity the device has
//! nothing else to do.

use crate::classifier::{AckKind, InboundEvent};
use crate::om2m::{self, Endpoint, Request};
use std::fmt;
use tokio::time::{Duration, Instant};

/// Resend interval for unacknowledged creation requests
pub const DEFAULT_RETRANSMISSION: Duration = Duration::from_secs(5);

/// A resource the client must create on the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    Ae {
        name: String,
        app_id: String,
        /// Point of access announced to the broker
        poa: String,
    },
    Container {
        entity: String,
        name: String,
    },
    Subscription {
        entity: String,
        container: String,
        subscriber: String,
        name: String,
    },
}

impl StepKind {
    /// Ack that completes this step
    pub fn ack_kind(&self) -> AckKind {
        match self {
            Self::Ae { .. } => AckKind::Ae,
            Self::Container { .. } => AckKind::Container,
            Self::Subscription { .. } => AckKind::Subscription,
        }
    }

    fn request(&self, endpoint: &Endpoint) -> Request {
        match self {
            Self::Ae { name, app_id, poa } => om2m::create_ae(endpoint, name, app_id, poa),
            Self::Container { entity, name } => om2m::create_container(endpoint, entity, name),
            Self::Subscription {
                entity,
                container,
                subscriber,
                name,
            } => om2m::create_subscription(endpoint, entity, container, subscriber, name),
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ae { name, .. } => write!(f, "AE {}", name),
            Self::Container { entity, name } => write!(f, "Container {}/{}", entity, name),
            Self::Subscription {
                entity,
                container,
                subscriber,
                name,
            } => write!(f, "Subscription {} to {}/{} with {}", name, entity, container, subscriber),
        }
    }
}

/// Step plus completion flag
#[derive(Debug, Clone)]
pub struct ProvisioningStep {
    pub kind: StepKind,
    pub completed: bool,
}

/// Provisioning phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    AwaitingAe,
    /// Index among the declared containers
    AwaitingContainer(usize),
    AwaitingSubscription,
    Ready,
}

/// Outstanding retry-eligible request
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request: Request,
    pub next_retry: Instant,
    pub interval: Duration,
    pub attempts: u32,
    first_sent: Instant,
}

/// Result of feeding an event to the provisioner
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Unchanged,
    /// The outstanding step completed; carries the next step's request, if any
    Advanced(Option<Request>),
}

/// Ordered retry-until-ack state machine
pub struct Provisioner {
    endpoint: Endpoint,
    steps: Vec<ProvisioningStep>,
    current: usize,
    pending: Option<PendingRequest>,
    interval: Duration,
    started: bool,
}

impl Provisioner {
    pub fn new(endpoint: Endpoint, steps: Vec<StepKind>, interval: Duration) -> Self {
        Self {
            endpoint,
            steps: steps
                .into_iter()
                .map(|kind| ProvisioningStep {
                    kind,
                    completed: false,
                })
                .collect(),
            current: 0,
            pending: None,
            interval,
            started: false,
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        if !self.started {
            return Phase::Start;
        }
        match self.steps.get(self.current).map(|s| &s.kind) {
            None => Phase::Ready,
            Some(StepKind::Ae { .. }) => Phase::AwaitingAe,
            Some(StepKind::Container { .. }) => Phase::AwaitingContainer(
                self.steps[..self.current]
                    .iter()
                    .filter(|s| matches!(s.kind, StepKind::Container { .. }))
                    .count(),
            ),
            Some(StepKind::Subscription { .. }) => Phase::AwaitingSubscription,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Ready
    }

    /// Ack the classifier should look for, `None` once every step completed
    pub fn awaiting(&self) -> Option<AckKind> {
        self.steps.get(self.current).map(|s| s.kind.ack_kind())
    }

    pub fn steps(&self) -> &[ProvisioningStep] {
        &self.steps
    }

    pub fn pending(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }

    /// Deadline of the next resend
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.next_retry)
    }

    /// Leave `Start`; returns the first creation request
    pub fn start(&mut self, now: Instant) -> Option<Request> {
        if self.started {
            return None;
        }
        self.started = true;
        tracing::info!("Provisioning {} resources", self.steps.len());
        self.issue(now)
    }

    /// Resend the outstanding request if its retry deadline passed.
    ///
    /// The resent request is the stored one, byte for byte.
    pub fn poll(&mut self, now: Instant) -> Option<Request> {
        let step = self.steps.get(self.current)?;
        let pending = self.pending.as_mut()?;
        if pending.next_retry > now {
            return None;
        }

        pending.attempts += 1;
        pending.next_retry = now + pending.interval;
        tracing::warn!(
            "{} not acknowledged, attempt {} after {:.1}s",
            step.kind,
            pending.attempts,
            (now - pending.first_sent).as_secs_f64()
        );
        Some(pending.request.clone())
    }

    /// Feed a classified event
    pub fn on_event(&mut self, event: &InboundEvent, now: Instant) -> Transition {
        let Some(kind) = event.ack_kind() else {
            return Transition::Unchanged;
        };
        if !self.started {
            return Transition::Unchanged;
        }
        let Some(step) = self.steps.get_mut(self.current) else {
            return Transition::Unchanged;
        };
        if step.kind.ack_kind() != kind {
            tracing::debug!("Ignoring {:?} ack while waiting for {}", kind, step.kind);
            return Transition::Unchanged;
        }

        step.completed = true;
        tracing::info!("{} created", step.kind);
        self.pending = None;
        self.current += 1;

        if self.current == self.steps.len() {
            tracing::info!("Provisioning complete");
            return Transition::Advanced(None);
        }
        Transition::Advanced(self.issue(now))
    }

    fn issue(&mut self, now: Instant) -> Option<Request> {
        let step = self.steps.get(self.current)?;
        let request = step.kind.request(&self.endpoint);
        tracing::info!("Creating {}", step.kind);

        self.pending = Some(PendingRequest {
            request: request.clone(),
            next_retry: now + self.interval,
            interval: self.interval,
            attempts: 1,
            first_sent: now,
        });
        Some(request)
    }
}

#[cfg(test)]
pub(crate) fn test_steps() -> Vec<StepKind> {
    vec![
        StepKind::Ae {
            name: "ESP8266".into(),
            app_id: "heart-rate".into(),
            poa: "coap://127.0.0.1:5683".into(),
        },
        StepKind::Container {
            entity: "ESP8266".into(),
            name: "HR".into(),
        },
        StepKind::Container {
            entity: "ESP8266".into(),
            name: "DELAY".into(),
        },
        StepKind::Subscription {
            entity: "ESP8266".into(),
            container: "Actuation".into(),
            subscriber: "ESP8266".into(),
            name: "SUB".into(),
        },
    ]
}
