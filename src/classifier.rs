//! Inbound Message Classification
//!
//! Turns responses and broker-initiated requests into [`InboundEvent`]s.
//! Response classification is keyed on the provisioning step currently
//! outstanding: the same `2.01 Created` is an AE ack, a container ack, a
//! subscription ack or a probe echo depending on where provisioning stands.
//!
//! Decode failures never propagate. They become [`InboundEvent::Unrecognized`]
//! and are logged at debug level.

use crate::coap::{self, MessageClass, CREATED, FORBIDDEN};
use crate::transport::{InboundRequest, Response};
use serde_json::Value;
use thiserror::Error;

/// Default `rn` prefix of delay probe records
pub const DEFAULT_DELAY_PREFIX: &str = "delay_";

/// Envelope path of a subscription notification
const NOTIFICATION_PATH: [&str; 4] = ["m2m:sgn", "m2m:nev", "m2m:rep", "m2m:cin"];

/// Acknowledgement kinds of the provisioning ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    Ae,
    Container,
    Subscription,
}

/// Classified inbound message. Routed, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    AckAe,
    AckContainer,
    AckSubscription,
    /// Content pushed through the subscription
    DataNotification { payload: String },
    /// Echoed delay record carrying its transmit timestamp
    ProbeEcho { sent_at_nanos: u64 },
    /// Well-formed record of another kind
    Ignored,
    Unrecognized,
}

impl InboundEvent {
    pub fn ack(kind: AckKind) -> Self {
        match kind {
            AckKind::Ae => Self::AckAe,
            AckKind::Container => Self::AckContainer,
            AckKind::Subscription => Self::AckSubscription,
        }
    }

    pub fn ack_kind(&self) -> Option<AckKind> {
        match self {
            Self::AckAe => Some(AckKind::Ae),
            Self::AckContainer => Some(AckKind::Container),
            Self::AckSubscription => Some(AckKind::Subscription),
            _ => None,
        }
    }
}

/// Envelope decoding failures
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("body is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("missing key `{0}`")]
    MissingKey(&'static str),
    #[error("invalid content: {0}")]
    InvalidContent(String),
}

/// Stateless-per-call classifier; provisioning state is passed in
#[derive(Debug, Clone)]
pub struct Classifier {
    delay_prefix: String,
}

impl Classifier {
    pub fn new(delay_prefix: impl Into<String>) -> Self {
        Self {
            delay_prefix: delay_prefix.into(),
        }
    }

    /// Created, or already exists
    pub fn is_ack(code: MessageClass) -> bool {
        code == CREATED || code == FORBIDDEN
    }

    /// Classify a response.
    ///
    /// `awaiting` is the ack the provisioner is waiting for, `None` once
    /// provisioning has completed.
    pub fn classify_response(&self, awaiting: Option<AckKind>, response: &Response) -> InboundEvent {
        if let Some(kind) = awaiting {
            if Self::is_ack(response.code) {
                return InboundEvent::ack(kind);
            }
            tracing::debug!("Unexpected {} while awaiting {:?} ack", coap::code_string(response.code), kind);
            return InboundEvent::Unrecognized;
        }

        if coap::class(response.code) != coap::class(CREATED) {
            tracing::debug!("Dropping {} response", coap::code_string(response.code));
            return InboundEvent::Unrecognized;
        }

        let Some(body) = response.body() else {
            return InboundEvent::Ignored;
        };

        match self.decode_echo(body) {
            Ok(Some(sent_at_nanos)) => InboundEvent::ProbeEcho { sent_at_nanos },
            Ok(None) => InboundEvent::Ignored,
            Err(e) => {
                tracing::debug!("Dropping malformed creation response: {}", e);
                InboundEvent::Unrecognized
            }
        }
    }

    /// Classify a broker-initiated request
    pub fn classify_request(&self, request: &InboundRequest) -> InboundEvent {
        self.classify_notification(request.payload())
    }

    /// Classify a notification body
    pub fn classify_notification(&self, body: &[u8]) -> InboundEvent {
        match decode_notification(body) {
            Ok(payload) => InboundEvent::DataNotification { payload },
            Err(e) => {
                tracing::debug!("Dropping malformed notification: {}", e);
                InboundEvent::Unrecognized
            }
        }
    }

    fn decode_echo(&self, body: &[u8]) -> Result<Option<u64>, EnvelopeError> {
        let tree: Value = serde_json::from_slice(body)?;
        let cin = field(&tree, "m2m:cin")?;

        let rn = field(cin, "rn")?
            .as_str()
            .ok_or_else(|| EnvelopeError::InvalidContent("rn is not a string".into()))?;
        if !rn.starts_with(&self.delay_prefix) {
            return Ok(None);
        }

        parse_timestamp(field(cin, "con")?).map(Some)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DEFAULT_DELAY_PREFIX)
    }
}

fn field<'a>(tree: &'a Value, key: &'static str) -> Result<&'a Value, EnvelopeError> {
    tree.get(key).ok_or(EnvelopeError::MissingKey(key))
}

fn decode_notification(body: &[u8]) -> Result<String, EnvelopeError> {
    let tree: Value = serde_json::from_slice(body)?;

    let mut node = &tree;
    for key in NOTIFICATION_PATH {
        node = field(node, key)?;
    }

    Ok(match field(node, "con")? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn parse_timestamp(value: &Value) -> Result<u64, EnvelopeError> {
    match value {
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| EnvelopeError::InvalidContent(s.clone())),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| EnvelopeError::InvalidContent(n.to_string())),
        other => Err(EnvelopeError::InvalidContent(other.to_string())),
    }
}
