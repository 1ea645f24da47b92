//! Error type for ambient concerns (configuration, logging setup) that
//! live outside the engine's own error enum in `binsync-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommonError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CommonError>;
