use std::{fmt, io, net::SocketAddr};

use comms::config::ConfigErr;

/// The coordinator's result type.
pub type Result<T> = std::result::Result<T, CoordErr>;

/// All errors that can occur in the coordinator.
#[derive(Debug)]
pub enum CoordErr {
    /// Invalid configuration, caught before serving.
    InvalidConfig(String),
    Config(ConfigErr),
    /// Failed to reach the parameter servers.
    ConnectionFailed {
        addrs: Vec<SocketAddr>,
        source: io::Error,
    },
    /// A parameter server couldn't save its shard of the model.
    SaveFailed { addr: SocketAddr, epoch: u32 },
    /// An underlying I/O error not covered by the above variants.
    Io(io::Error),
}

impl fmt::Display for CoordErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::Config(e) => write!(f, "{e}"),
            Self::ConnectionFailed { addrs, source } => {
                write!(f, "connection failed to {addrs:?}: {source}")
            }
            Self::SaveFailed { addr, epoch } => {
                write!(f, "parameter server {addr} failed to save epoch {epoch}")
            }
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for CoordErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::ConnectionFailed { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CoordErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigErr> for CoordErr {
    fn from(e: ConfigErr) -> Self {
        Self::Config(e)
    }
}

impl From<CoordErr> for io::Error {
    fn from(e: CoordErr) -> Self {
        match e {
            CoordErr::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}
