use crate::core::header::VersionPair;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Corrupt stream data: {0}")]
    Corrupt(String),

    #[error("Incompatible version for feature {feature}: stream requires {found}, code supports {supported}")]
    IncompatibleVersion {
        feature: String,
        found: VersionPair,
        supported: VersionPair,
    },

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;
