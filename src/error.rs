use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid config: {0}")]
    Config(String),
    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("virtual device: {0}")]
    Device(#[source] std::io::Error),
    #[error("transport: {0}")]
    Transport(#[source] std::io::Error),
    #[error("peer {endpoint} [{key}] unreachable after {attempts} attempts")]
    PeerUnreachable {
        endpoint: String,
        key: IpAddr,
        attempts: usize,
    },
    #[error("mesh already started")]
    AlreadyStarted,
    #[error("shutdown")]
    Shutdown,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors that must stop the node from coming up at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::ConfigParse { .. } | Error::Device(_) | Error::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
