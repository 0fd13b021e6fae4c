use thiserror::Error;

/// Terminal state of a cancellation scope.
///
/// Surfaced only through [`Context::error`](crate::Context::error); the
/// value accessors never fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The scope was released through its guard before any deadline passed.
    #[error("context canceled")]
    Canceled,
    /// The scope's deadline passed before it was released.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}
