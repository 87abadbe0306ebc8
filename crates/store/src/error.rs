/// Crate-wide result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed errors for durable segment storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying database rejected an operation.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}
