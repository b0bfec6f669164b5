use thiserror::Error;

/// Top-level error for the calendar server binary: composes every
/// component's own error enum rather than flattening them, so a caller can
/// still match on which subsystem failed.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Calendar(#[from] crate::calendar::CalendarError),

    #[error(transparent)]
    Aggregator(#[from] crate::aggregator::AggregatorError),

    #[error(transparent)]
    Stamper(#[from] crate::stamper::StamperError),

    #[error(transparent)]
    Backup(#[from] crate::backup::BackupError),

    #[error(transparent)]
    Mirror(#[from] crate::mirror::MirrorError),

    #[error(transparent)]
    Store(#[from] crate::calendar_store::StoreError),

    #[error("bitcoin rpc error: {0}")]
    Rpc(#[from] crate::stamper::RpcError),

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the server binary.
pub type ServerResult<T> = std::result::Result<T, ServerError>;
