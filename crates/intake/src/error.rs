/// Crate-wide result type for intake operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed errors for the intake pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The segment store rejected an operation.
    #[error(transparent)]
    Store(#[from] courier_store::Error),

    /// The intake handler task has shut down.
    #[error("intake handler is not running")]
    HandlerClosed,
}
