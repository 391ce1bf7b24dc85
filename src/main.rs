use penumbra::{Bridge, ConfigStore, Dispatcher, Hub, HubOptions, Receiver, Settings};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();

    match run(Settings::from_env()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> penumbra::Result<()> {
    let config = Arc::new(ConfigStore::load(&settings.config_path)?);

    let hub = Hub::spawn(HubOptions::default());
    let listener = TcpListener::bind(("0.0.0.0", settings.ws_port)).await?;
    tokio::spawn(hub.clone().serve(listener));

    let receiver = Receiver::bind(("0.0.0.0", settings.udp_port)).await?;
    let dispatcher = Dispatcher::new().with_source_name(settings.source_name);

    Bridge::new(hub, dispatcher, config).run(receiver).await
}
