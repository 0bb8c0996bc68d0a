//! Non-essential informational services provided by the coordinator.

use std::pin::Pin;

use store::{Asn, Store, models};
use tokio_stream::Stream;
use tonic::{Request, Response, Status};

use super::status_from_store;
use crate::auth;
use crate::proto::info::{GetOwnerRequest, Owner, SearchOwnerRequest, info_server::Info};

pub struct InfoService {
    store: Store,
}

impl InfoService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[tonic::async_trait]
impl Info for InfoService {
    /// Retrieve information on an AS owner by owner name or by an AS.
    async fn get_owner(
        &self,
        request: Request<GetOwnerRequest>,
    ) -> Result<Response<Owner>, Status> {
        auth::authenticate(&self.store, request.metadata()).await?;
        let message = request.into_inner();

        let asn = if message.asn.is_empty() {
            None
        } else {
            Some(
                message
                    .asn
                    .parse::<Asn>()
                    .map_err(|_| Status::invalid_argument("Invalid ASN"))?,
            )
        };
        let name = if message.name.is_empty() {
            None
        } else {
            Some(message.name.as_str())
        };

        let mut conn = self.store.acquire().await.map_err(status_from_store)?;
        let owners = models::find_owners(&mut conn, name, asn)
            .await
            .map_err(status_from_store)?;

        let [owner] = owners.as_slice() else {
            return Err(Status::not_found("No matching owner found"));
        };

        let asns = models::owner_asns(&mut conn, owner.id)
            .await
            .map_err(status_from_store)?;

        Ok(Response::new(Owner {
            name: owner.name.clone(),
            long_name: owner.long_name.clone(),
            asns: asns.iter().map(|asn| asn.to_string()).collect(),
        }))
    }

    type SearchOwnerStream = Pin<Box<dyn Stream<Item = Result<Owner, Status>> + Send>>;

    /// Search for AS owners by a substring of their full name.
    async fn search_owner(
        &self,
        request: Request<SearchOwnerRequest>,
    ) -> Result<Response<Self::SearchOwnerStream>, Status> {
        auth::authenticate(&self.store, request.metadata()).await?;
        let message = request.into_inner();

        let mut conn = self.store.acquire().await.map_err(status_from_store)?;

        let mut results = Vec::new();
        for owner in models::search_owners(&mut conn, &message.long_name)
            .await
            .map_err(status_from_store)?
        {
            let asns = models::owner_asns(&mut conn, owner.id)
                .await
                .map_err(status_from_store)?;

            results.push(Ok(Owner {
                name: owner.name,
                long_name: owner.long_name,
                asns: asns.iter().map(|asn| asn.to_string()).collect(),
            }));
        }

        Ok(Response::new(Box::pin(tokio_stream::iter(results))))
    }
}
