use strata_core::ObjectId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectManagerError {
    #[error(transparent)]
    Store(#[from] strata_store::StoreError),
    #[error("failed to decode state of {id} ({type_name}): {detail}")]
    Decode {
        id: ObjectId,
        type_name: String,
        detail: String,
    },
    #[error("unknown object state type {0:?}")]
    UnknownStateType(String),
}
