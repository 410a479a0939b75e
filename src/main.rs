use color_eyre::{eyre::eyre, Result};
use mqtt_ingest::config::{Settings, StorageBackend, StorageSettings};
use mqtt_ingest::mqtt::rumqtt::RumqttConnector;
use mqtt_ingest::mqtt::supervisor::Supervisor;
use mqtt_ingest::persistence::memory_store::{MemoryMessageStore, MemoryStatusStore};
use mqtt_ingest::persistence::sled_store::{open_db, SledMessageStore, SledStatusStore};
use mqtt_ingest::persistence::{MessageStore, StatusStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    // warnings raised while loading go through a bootstrap subscriber
    let (settings, level) = tracing::subscriber::with_default(subscriber(Level::INFO), || {
        Settings::load(config_path.as_deref()).map(|s| {
            let level = s.logging.max_level();
            (s, level)
        })
    })
    .map_err(|e| eyre!("Failed to load configuration: {}", e))?;
    tracing::subscriber::set_global_default(subscriber(level))?;

    info!(
        "Starting mqtt-ingest for {}:{} (topics: {})",
        settings.broker.host,
        settings.broker.port,
        settings.broker.topics.join(", ")
    );

    let (messages, status) = open_stores(&settings.storage)?;

    let supervisor = Supervisor::global().get_or_init(|| {
        Supervisor::spawn(&settings, Arc::new(RumqttConnector), messages, status)
    });
    supervisor.initialize().await;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    for e in supervisor.shutdown().await {
        warn!("Shutdown: {}", e);
    }
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn subscriber(level: Level) -> FmtSubscriber {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish()
}

fn open_stores(storage: &StorageSettings) -> Result<(Arc<dyn MessageStore>, Arc<dyn StatusStore>)> {
    let (messages, status): (Arc<dyn MessageStore>, Arc<dyn StatusStore>) = match storage.backend
    {
        StorageBackend::Sled => {
            info!("Opening message database at {}", storage.path.display());
            let db = open_db(&storage.path)?;
            (
                Arc::new(SledMessageStore::new(db.clone())?),
                Arc::new(SledStatusStore::new(db)),
            )
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage, nothing survives a restart");
            (
                Arc::new(MemoryMessageStore::new()),
                Arc::new(MemoryStatusStore::unprovisioned()),
            )
        }
    };

    if storage.provision_on_start {
        if let Err(e) = status.provision() {
            error!("Failed to provision connection status storage: {}", e);
        }
    }
    Ok((messages, status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_subscriber_sees_load_warnings() {
        let (warn_on, debug_on) = tracing::subscriber::with_default(subscriber(Level::INFO), || {
            (tracing::enabled!(Level::WARN), tracing::enabled!(Level::DEBUG))
        });
        assert!(warn_on);
        assert!(!debug_on);
    }

    #[test]
    fn test_subscriber_honors_configured_level() {
        let debug_on = tracing::subscriber::with_default(subscriber(Level::DEBUG), || {
            tracing::enabled!(Level::DEBUG)
        });
        assert!(debug_on);
    }
}
