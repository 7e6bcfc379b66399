use async_trait::async_trait;
use batch_sequencer::{
    Batch, BatchManager, Bytes32, Config, Dispatcher, DispatcherOptions, MemoryStore, MessageType,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Dispatcher that only logs what it would transmit
struct LoggingDispatcher {
    name: &'static str,
}

#[async_trait]
impl Dispatcher for LoggingDispatcher {
    async fn dispatch(&self, batch: &mut Batch, contexts: &[Bytes32]) -> anyhow::Result<()> {
        batch.payload_ref = Some(format!("{}/{}", self.name, batch.id));
        info!(
            dispatcher = self.name,
            batch_id = %batch.id,
            messages = batch.payload.messages.len(),
            contexts = contexts.len(),
            "dispatching batch"
        );
        Ok(())
    }
}

/// Boots the batch manager against an in-memory store.
///
/// Loads the configuration from the path given as the first argument
/// (default `config/default.toml`), runs until Ctrl-C, then shuts down.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/default.toml".to_string());
    let config = Config::load(&path)?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!("Batch manager starting with config: {:?}", config);

    let store = MemoryStore::new();
    let mut manager = BatchManager::builder(config.clone())
        .with_store(Arc::new(store.clone()))
        .with_data_resolver(Arc::new(store))
        .build()?;

    manager.register_dispatcher(
        &[
            MessageType::Definition,
            MessageType::Broadcast,
            MessageType::TransferBroadcast,
        ],
        Arc::new(LoggingDispatcher { name: "broadcast" }),
        DispatcherOptions::from(&config.broadcast),
    )?;
    manager.register_dispatcher(
        &[
            MessageType::Private,
            MessageType::GroupInit,
            MessageType::TransferPrivate,
        ],
        Arc::new(LoggingDispatcher { name: "private" }),
        DispatcherOptions::from(&config.private),
    )?;

    manager.start().await?;
    tokio::signal::ctrl_c().await?;

    manager.close();
    manager.wait_stopped().await;
    info!(offset = manager.current_offset(), "Batch manager stopped");
    Ok(())
}
