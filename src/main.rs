use fablink::{
    init_logging, ipc, AppEvent, Config, ConnectionManager, EventBus, EventCategory, EventFilter,
    BUILD_DATE, VERSION,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    tracing::info!("FabLink {} (built {})", VERSION, BUILD_DATE);

    let config = Config::load_or_default()?;
    config.validate()?;

    let bus = Arc::new(EventBus::new());
    bus.subscribe(EventFilter::only(EventCategory::Error), |event| {
        if let AppEvent::Error(error) = event {
            tracing::warn!("{:?}", error);
        }
    });
    let manager = Arc::new(ConnectionManager::with_config(config, bus));
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    ipc::serve(manager.clone(), stdin, tokio::io::stdout()).await?;

    // Input closed: leave the machine in a clean state.
    if manager.active_connection().is_some() {
        if let Err(e) = manager.close(false).await {
            tracing::warn!("Closing on exit failed: {}", e);
        }
    }
    Ok(())
}
