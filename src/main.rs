//! OM2M CoAP Client - Main Entry Point

use om2m_coap_client::{link, ClientConfig, Om2mClient, SimulatedSensor, UdpTransport};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("OM2M CoAP client v{}", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = std::env::var("CONFIG_PATH")
        .unwrap_or_else(|_| "/etc/om2m/client.json".into());

    let config = ClientConfig::load(&config_path)
        .unwrap_or_else(|e| {
            tracing::warn!("Config {} unusable ({}), using defaults", config_path, e);
            ClientConfig::default()
        });

    let client = Om2mClient::new(config)?;
    let transport = UdpTransport::bind(client.endpoint()).await?;
    let local = transport.advertised_addr()?;

    // A bound socket is as connected as a host gets
    let (link_control, link_state) = link();
    link_control.set_up();

    client.run(transport, local, SimulatedSensor::default(), link_state).await?;

    Ok(())
}
