use std::path::PathBuf;

/// Errors raised by the outer surfaces of the regulator (configuration and process
/// setup). The control core itself never returns errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{name} threshold must be within 0..=100, got {value}")]
    InvalidThreshold { name: &'static str, value: u32 },

    #[error("update interval must be at least 1 second, got {0}")]
    InvalidInterval(u64),

    #[error("hysteresis band must be within 0..=50, got {0}")]
    InvalidBand(f64),

    #[error("failed to register signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
