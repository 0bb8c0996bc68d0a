//! Token-based authentication for the gRPC API.
//!
//! Every request carries the `asn`, `client` and `token` metadata headers.
//! The pair `(asn, client)` selects a peering client whose stored secret
//! token must match; anything else is rejected with `UNAUTHENTICATED`.
//! Handlers call [`authenticate`] as their first step and receive the
//! caller's identity.

use store::{Asn, Store, models};
use tonic::Status;
use tonic::metadata::MetadataMap;

pub const ASN_HEADER: &str = "asn";
pub const CLIENT_NAME_HEADER: &str = "client";
pub const TOKEN_HEADER: &str = "token";

fn denied() -> Status {
    Status::unauthenticated("Authentication failed.")
}

fn header<'a>(metadata: &'a MetadataMap, key: &str) -> Result<&'a str, Status> {
    metadata
        .get(key)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(denied)
}

/// Validates the request metadata against the store and returns the
/// caller's AS number and client name.
pub async fn authenticate(store: &Store, metadata: &MetadataMap) -> Result<(Asn, String), Status> {
    let asn: Asn = header(metadata, ASN_HEADER)?.parse().map_err(|_| denied())?;
    let client = header(metadata, CLIENT_NAME_HEADER)?.to_string();
    let token = header(metadata, TOKEN_HEADER)?;

    let mut conn = store.acquire().await.map_err(|_| denied())?;
    let expected = models::client_token(&mut conn, asn, &client)
        .await
        .map_err(|_| denied())?
        .ok_or_else(denied)?;

    // A blank stored token disables API access for the client.
    if expected.is_empty() || expected != token {
        return Err(denied());
    }

    Ok((asn, client))
}
