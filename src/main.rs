use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use mission_dispatch::config::ControllerConfig;
use mission_dispatch::dispatch::DispatchServer;
use mission_dispatch::store::HttpObjectStore;
use mission_dispatch::transport::MqttTransport;
use mission_dispatch::vda5050::TopicSpace;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match ControllerConfig::resolve() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let space = TopicSpace::new(
        config.mqtt_prefix.clone(),
        config.interface_version.clone(),
        config.manufacturer.clone(),
    );
    let store = Arc::new(HttpObjectStore::new(config.database_url.clone()));
    let (transport, inbound) = MqttTransport::connect(&config, space);

    let mut server = DispatchServer::new(Arc::new(config), store, transport);
    if let Err(e) = server.run(inbound).await {
        tracing::error!("object store contract violation: {e}");
        std::process::exit(2);
    }
}
