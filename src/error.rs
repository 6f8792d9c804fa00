use thiserror::Error;

use crate::config::ConfigError;
use crate::core::CoreError;
use crate::core::persist::PersistError;
use crate::proto::CodecError;

/// Crate-level convenience error.
///
/// A thin wrapper over the per-module errors plus the two fatal start-up
/// conditions that have no module of their own.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("cannot bind peer listener on {endpoint}: {source}")]
    Bind {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("cannot reach the bus at {endpoint}: {source}")]
    BusUnreachable {
        endpoint: String,
        source: std::io::Error,
    },
}
