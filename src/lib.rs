pub mod auth;
pub mod config;
pub mod registry;
pub mod rpc;

pub mod proto {
    pub mod peering {
        tonic::include_proto!("peering");
    }

    pub mod info {
        tonic::include_proto!("info");
    }
}

use std::sync::Arc;

use store::Store;
use tonic::transport::Server;

use self::{
    config::Config,
    proto::{info::info_server::InfoServer, peering::peering_server::PeeringServer},
    registry::Registry,
    rpc::{InfoService, PeeringService},
};

/// In order to let integration tests start a coordinator in-process, a
/// function is opened to replace the main function to directly start the
/// server.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let store = Store::open(&config.database.path).await?;
    store.init_schema().await?;

    let registry = Arc::new(Registry::default());

    log::info!("peering coordinator listening on {}", config.api.listen);

    Server::builder()
        .add_service(PeeringServer::new(PeeringService::new(
            store.clone(),
            registry.clone(),
        )))
        .add_service(InfoServer::new(InfoService::new(store)))
        .serve(config.api.listen)
        .await?;

    Ok(())
}
