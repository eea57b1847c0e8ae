//! Client Configuration

use crate::om2m::Endpoint;
use crate::provisioning::StepKind;
use crate::ClientError;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// CSE connection
    pub broker: BrokerConfig,
    /// Local CoAP socket
    pub bind_address: String,
    /// Application entity
    pub entity: EntityConfig,
    /// Containers created below the entity
    pub containers: ContainerConfig,
    /// Subscription for pushed content
    pub subscription: SubscriptionConfig,
    /// Timers
    pub timing: TimingConfig,
    /// EMA smoothing factor for round-trip samples
    pub latency_alpha: f64,
    /// `rn` prefix of delay probe records
    pub delay_prefix: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            bind_address: "0.0.0.0:5683".into(),
            entity: EntityConfig::default(),
            containers: ContainerConfig::default(),
            subscription: SubscriptionConfig::default(),
            timing: TimingConfig::default(),
            latency_alpha: crate::estimator::DEFAULT_ALPHA,
            delay_prefix: crate::classifier::DEFAULT_DELAY_PREFIX.into(),
        }
    }
}

impl ClientConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Resolve broker and bind addresses
    pub fn endpoint(&self) -> Result<Endpoint, ClientError> {
        let broker = (self.broker.host.as_str(), self.broker.port)
            .to_socket_addrs()
            .map_err(|e| ClientError::Config(format!("cannot resolve {}: {}", self.broker.host, e)))?
            .next()
            .ok_or_else(|| ClientError::Config(format!("no address for {}", self.broker.host)))?;
        let bind: SocketAddr = self
            .bind_address
            .parse()
            .map_err(|e| ClientError::Config(format!("bad bind address {}: {}", self.bind_address, e)))?;

        Ok(Endpoint {
            broker,
            bind,
            cse_id: self.broker.cse_id.clone(),
            cse_name: self.broker.cse_name.clone(),
            origin: self.broker.origin.clone(),
        })
    }

    /// Provisioning steps in creation order: entity, containers, subscription.
    ///
    /// `local` is the address notifications reach, so the point of access
    /// carries the bound socket's port.
    pub fn provisioning_steps(&self, local: SocketAddr) -> Vec<StepKind> {
        let entity = &self.entity.name;
        let mut steps = vec![StepKind::Ae {
            name: entity.clone(),
            app_id: self.entity.app_id.clone(),
            poa: format!("coap://{}", local),
        }];

        for name in self.containers.all() {
            steps.push(StepKind::Container {
                entity: entity.clone(),
                name: name.to_string(),
            });
        }

        steps.push(StepKind::Subscription {
            entity: entity.clone(),
            container: self.subscription.container.clone(),
            subscriber: self.subscription.subscriber.clone().unwrap_or_else(|| entity.clone()),
            name: self.subscription.name.clone(),
        });
        steps
    }
}

/// CSE connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub cse_id: String,
    pub cse_name: String,
    /// Originator credentials
    pub origin: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5683,
            cse_id: "in-cse".into(),
            cse_name: "in-name".into(),
            origin: "admin:admin".into(),
        }
    }
}

/// Application entity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityConfig {
    pub name: String,
    pub app_id: String,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            name: "ESP8266".into(),
            app_id: "heart-rate-monitor".into(),
        }
    }
}

/// Container names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Heartbeat publications
    pub telemetry: String,
    /// Target of the subscription
    pub actuation: String,
    /// Delay probes
    pub delay: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            telemetry: "HR".into(),
            actuation: "Actuation".into(),
            delay: "DELAY".into(),
        }
    }
}

impl ContainerConfig {
    /// Creation order
    pub fn all(&self) -> [&str; 3] {
        [&self.telemetry, &self.actuation, &self.delay]
    }
}

/// Subscription settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Container watched, below the entity
    pub container: String,
    /// Resource notified, below the CSE; unset targets the client's own entity
    pub subscriber: Option<String>,
    pub name: String,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            container: "Actuation".into(),
            subscriber: None,
            name: "SUB".into(),
        }
    }
}

/// Timer settings, all in milliseconds except where noted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub retransmission_ms: u64,
    pub heartbeat_spacing_ms: u64,
    pub probe_interval_ms: u64,
    pub sensor_poll_ms: u64,
    pub max_wait_secs: u64,
    /// Observation window after the subscription is acknowledged; unset keeps
    /// notifications flowing forever
    pub observe_secs: Option<u64>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            retransmission_ms: 5000,
            heartbeat_spacing_ms: 1000,
            probe_interval_ms: 500,
            sensor_poll_ms: 160,
            max_wait_secs: 90,
            observe_secs: None,
        }
    }
}

impl TimingConfig {
    pub fn retransmission(&self) -> Duration {
        Duration::from_millis(self.retransmission_ms)
    }

    pub fn heartbeat_spacing(&self) -> Duration {
        Duration::from_millis(self.heartbeat_spacing_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn sensor_poll(&self) -> Duration {
        Duration::from_millis(self.sensor_poll_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn observe(&self) -> Option<Duration> {
        self.observe_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{ "broker": { "host": "10.0.0.5" }, "timing": { "observe_secs": 30 } }"#,
        )
        .unwrap();

        assert_eq!(config.broker.host, "10.0.0.5");
        assert_eq!(config.broker.port, 5683);
        assert_eq!(config.containers.all(), ["HR", "Actuation", "DELAY"]);
        assert_eq!(config.timing.retransmission(), Duration::from_secs(5));
        assert_eq!(config.timing.observe(), Some(Duration::from_secs(30)));
        assert_eq!(config.delay_prefix, "delay_");
    }

    #[test]
    fn test_endpoint_resolution() {
        let endpoint = ClientConfig::default().endpoint().unwrap();

        assert_eq!(endpoint.broker, "127.0.0.1:5683".parse::<SocketAddr>().unwrap());
        assert_eq!(endpoint.cse_base(), "/~/in-cse/in-name");

        let mut bad = ClientConfig::default();
        bad.bind_address = "nowhere".into();
        assert!(matches!(bad.endpoint(), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_provisioning_order() {
        let steps = ClientConfig::default().provisioning_steps("192.168.4.2:5683".parse().unwrap());
        let labels: Vec<String> = steps.iter().map(|s| s.to_string()).collect();

        assert_eq!(
            labels,
            [
                "AE ESP8266",
                "Container ESP8266/HR",
                "Container ESP8266/Actuation",
                "Container ESP8266/DELAY",
                "Subscription SUB to ESP8266/Actuation with ESP8266",
            ]
        );
        assert!(matches!(&steps[0], StepKind::Ae { poa, .. } if poa == "coap://192.168.4.2:5683"));
    }

    #[test]
    fn test_poa_follows_bound_port() {
        let mut config = ClientConfig::default();
        config.subscription.subscriber = Some("Dashboard".into());
        let steps = config.provisioning_steps("10.1.1.7:40123".parse().unwrap());

        assert!(matches!(&steps[0], StepKind::Ae { poa, .. } if poa == "coap://10.1.1.7:40123"));
        assert!(matches!(steps.last(), Some(StepKind::Subscription { subscriber, .. }) if subscriber == "Dashboard"));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("om2m-client-{}.json", uuid::Uuid::new_v4()));
        let path = path.to_str().unwrap();
        let mut config = ClientConfig::default();
        config.entity.name = "Wristband".into();

        config.save(path).unwrap();
        let loaded = ClientConfig::load(path).unwrap();
        std::fs::remove_file(path).unwrap();

        assert_eq!(loaded.entity.name, "Wristband");
    }
}
