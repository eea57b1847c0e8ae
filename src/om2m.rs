//! oneM2M Resource Requests
//!
//! Builders for the creation requests the client sends to the CSE: application
//! entity, container, subscription and content instance. Bodies follow the
//! oneM2M JSON serialization (`m2m:ae`, `m2m:cnt`, `m2m:sub`, `m2m:cin`).

use crate::coap::RequestType;
use bytes::Bytes;
use serde_json::json;
use std::net::SocketAddr;

/// Broker addressing. Immutable once the client starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// CSE address
    pub broker: SocketAddr,
    /// Local socket address
    pub bind: SocketAddr,
    /// CSE identifier, e.g. `in-cse`
    pub cse_id: String,
    /// CSE name, e.g. `in-name`
    pub cse_name: String,
    /// Originator credentials (`X-M2M-Origin`)
    pub origin: String,
}

impl Endpoint {
    /// Hierarchical base path of the CSE (`/~/in-cse/in-name`)
    pub fn cse_base(&self) -> String {
        format!("/~/{}/{}", self.cse_id, self.cse_name)
    }

    /// Path of a resource below the CSE base
    pub fn resource_path(&self, segments: &[&str]) -> String {
        let mut path = self.cse_base();
        for segment in segments {
            path.push('/');
            path.push_str(segment);
        }
        path
    }

    /// SP-relative structured address used as a notification target
    pub fn structured_address(&self, resource: &str) -> String {
        format!("/{}/{}/{}", self.cse_id, self.cse_name, resource)
    }
}

/// oneM2M resource type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Ae,
    Container,
    ContentInstance,
    Subscription,
}

impl ResourceType {
    pub const fn code(self) -> u32 {
        match self {
            Self::Ae => 2,
            Self::Container => 3,
            Self::ContentInstance => 4,
            Self::Subscription => 23,
        }
    }
}

/// Outbound request, independent of the CoAP framing
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: RequestType,
    /// Target resource path
    pub path: String,
    pub resource_type: Option<ResourceType>,
    pub origin: String,
    /// Request identifier, fixed for the lifetime of the request
    pub request_id: String,
    pub payload: Bytes,
}

impl Request {
    /// POST creating a child of `parent`
    pub fn create(endpoint: &Endpoint, parent: String, ty: ResourceType, body: serde_json::Value) -> Self {
        Self {
            method: RequestType::Post,
            path: parent,
            resource_type: Some(ty),
            origin: endpoint.origin.clone(),
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            payload: Bytes::from(body.to_string()),
        }
    }
}

/// Register the application entity
pub fn create_ae(endpoint: &Endpoint, name: &str, app_id: &str, poa: &str) -> Request {
    let body = json!({
        "m2m:ae": {
            "rn": name,
            "api": app_id,
            "rr": true,
            "poa": [poa],
        }
    });
    Request::create(endpoint, endpoint.cse_base(), ResourceType::Ae, body)
}

/// Create `entity/name`
pub fn create_container(endpoint: &Endpoint, entity: &str, name: &str) -> Request {
    let body = json!({ "m2m:cnt": { "rn": name } });
    Request::create(endpoint, endpoint.resource_path(&[entity]), ResourceType::Container, body)
}

/// Subscribe `subscriber` to `entity/container`
pub fn create_subscription(
    endpoint: &Endpoint,
    entity: &str,
    container: &str,
    subscriber: &str,
    name: &str,
) -> Request {
    let body = json!({
        "m2m:sub": {
            "rn": name,
            "nu": [endpoint.structured_address(subscriber)],
            "nct": 2,
        }
    });
    Request::create(
        endpoint,
        endpoint.resource_path(&[entity, container]),
        ResourceType::Subscription,
        body,
    )
}

/// Append a content instance to `entity/container`
pub fn create_content_instance(
    endpoint: &Endpoint,
    entity: &str,
    container: &str,
    name: &str,
    content: &str,
) -> Request {
    let body = json!({
        "m2m:cin": {
            "rn": name,
            "cnf": "text/plain:0",
            "con": content,
        }
    });
    Request::create(
        endpoint,
        endpoint.resource_path(&[entity, container]),
        ResourceType::ContentInstance,
        body,
    )
}

#[cfg(test)]
pub(crate) fn test_endpoint() -> Endpoint {
    Endpoint {
        broker: "127.0.0.1:5683".parse().unwrap(),
        bind: "127.0.0.1:0".parse().unwrap(),
        cse_id: "in-cse".into(),
        cse_name: "in-name".into(),
        origin: "admin:admin".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(request: &Request) -> serde_json::Value {
        serde_json::from_slice(&request.payload).unwrap()
    }

    #[test]
    fn test_ae_request() {
        let ep = test_endpoint();
        let req = create_ae(&ep, "ESP8266", "heart-rate", "coap://192.168.1.20:5683");

        assert_eq!(req.method, RequestType::Post);
        assert_eq!(req.path, "/~/in-cse/in-name");
        assert_eq!(req.resource_type, Some(ResourceType::Ae));
        assert_eq!(body(&req)["m2m:ae"]["rn"], "ESP8266");
        assert_eq!(body(&req)["m2m:ae"]["poa"][0], "coap://192.168.1.20:5683");
    }

    #[test]
    fn test_subscription_targets_container() {
        let ep = test_endpoint();
        let req = create_subscription(&ep, "ESP8266", "Actuation", "ESP8266", "SUB");

        assert_eq!(req.path, "/~/in-cse/in-name/ESP8266/Actuation");
        assert_eq!(body(&req)["m2m:sub"]["nu"][0], "/in-cse/in-name/ESP8266");
        assert_eq!(ResourceType::Subscription.code(), 23);
    }

    #[test]
    fn test_content_instance() {
        let ep = test_endpoint();
        let req = create_content_instance(&ep, "ESP8266", "DELAY", "delay_3", "1700000000000000000");

        assert_eq!(req.path, "/~/in-cse/in-name/ESP8266/DELAY");
        assert_eq!(req.resource_type, Some(ResourceType::ContentInstance));
        assert_eq!(body(&req)["m2m:cin"]["con"], "1700000000000000000");
    }

    #[test]
    fn test_request_ids_are_unique() {
        let ep = test_endpoint();
        let a = create_container(&ep, "ESP8266", "HR");
        let b = create_container(&ep, "ESP8266", "HR");

        assert_ne!(a.request_id, b.request_id);
        assert_eq!(a.payload, b.payload);
    }
}
