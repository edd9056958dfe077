use color_eyre::{eyre::eyre, Result};
use pointlink::mqtt::RumqttTransport;
use pointlink::{Bridge, BridgeConfig, TracingHost};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => BridgeConfig::default_path()?,
    };
    info!("Using config file {}", path.display());

    let config = BridgeConfig::load(&path).await?;
    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!("{}", e);
        }
        return Err(eyre!(
            "Invalid configuration in {}: {} errors",
            path.display(),
            errors.len()
        ));
    }

    let mut bridge = Bridge::new(
        Arc::new(RumqttTransport::default()),
        Arc::new(TracingHost),
    );
    bridge.apply(config).await?;
    info!("Bridge running with sessions: {:?}", bridge.sessions());

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
    info!("Ctrl-C received, stopping");

    bridge.shutdown().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
