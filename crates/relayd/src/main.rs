#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relaykit_observability::init();

    let config = relaykit_relayd::config::RelayConfig::from_env();
    tracing::info!(
        dispatch_interval_ms = config.dispatch_interval.as_millis() as u64,
        batch_size = config.batch_size,
        max_attempts = config.max_attempts,
        stream_key = %config.stream_key,
        "starting relayd"
    );

    relaykit_relayd::wiring::run(config).await
}
