mod info;
mod peering;

pub use info::InfoService;
pub use peering::PeeringService;

use store::StoreError;
use tonic::Status;

/// Maps store failures onto RPC status codes: validation failures become
/// `INVALID_ARGUMENT`, uniqueness violations `ALREADY_EXISTS`, missing
/// entities `NOT_FOUND` and everything unexpected `INTERNAL`.
fn status_from_store(err: StoreError) -> Status {
    match err {
        StoreError::NotFound(what) => Status::not_found(format!("{what} does not exist")),
        StoreError::AlreadyExists(message) => Status::already_exists(message),
        StoreError::Validation(message) => Status::invalid_argument(message),
        StoreError::Asn(err) => Status::invalid_argument(err.to_string()),
        StoreError::NoUnusedIps(_) | StoreError::NoUnusedPorts(_) => {
            Status::internal(err.to_string())
        }
        StoreError::Database(err) => {
            log::error!("database error: {err}");
            Status::internal("Internal error")
        }
    }
}
