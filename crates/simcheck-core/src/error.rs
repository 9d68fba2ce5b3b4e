use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid run configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("unsupported language: {0}")]
    LanguageUnsupported(String),

    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("invalid run transition: {0}")]
    InvalidTransition(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}
