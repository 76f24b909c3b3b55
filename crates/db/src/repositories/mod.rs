use approvd_core::store::StoreError;

pub mod audit;
pub mod instance;

pub use audit::SqlAuditStore;
pub use instance::SqlInstanceStore;

pub(crate) fn backend(error: sqlx::Error) -> StoreError {
    StoreError::Backend(error.to_string())
}
