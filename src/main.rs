use std::sync::Arc;

use peering_coordinator::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    peering_coordinator::startup(config).await
}
