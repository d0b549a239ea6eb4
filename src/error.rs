//! Error types for Nodium

use thiserror::Error;

/// Main error type for Nodium
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("destination rejected by rule")]
    RejectedByRule,

    #[error("timeout on sniffing")]
    SniffTimeout,

    #[error("unknown content")]
    UnknownContent,

    #[error("connection cancelled")]
    Cancelled,

    #[error("no outbound handler for tag: {0}")]
    NoOutboundHandler(String),

    #[error("no route for destination: {0}")]
    NoRoute(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("certificate renewal failed: {0}")]
    Cert(String),
}

/// Result type alias for Nodium
pub type Result<T> = std::result::Result<T, Error>;
