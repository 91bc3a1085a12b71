use std::{error::Error, fmt, io, net::SocketAddr};

use comms::{MsgKind, config::ConfigErr};

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Worker runtime failures.
#[derive(Debug)]
pub enum WorkerErr {
    Io(io::Error),
    Config(ConfigErr),
    InvalidConfig(String),
    UnexpectedMessage {
        peer: SocketAddr,
        expected: MsgKind,
        got: MsgKind,
    },
    SaveFailed {
        peer: SocketAddr,
    },
    Trainer(String),
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
            WorkerErr::Config(e) => write!(f, "config error: {e}"),
            WorkerErr::InvalidConfig(detail) => write!(f, "invalid config: {detail}"),
            WorkerErr::UnexpectedMessage {
                peer,
                expected,
                got,
            } => write!(f, "unexpected message from {peer}: expected {expected:?}, got {got:?}"),
            WorkerErr::SaveFailed { peer } => write!(f, "{peer} failed to save the model"),
            WorkerErr::Trainer(detail) => write!(f, "trainer error: {detail}"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Io(e) => Some(e),
            WorkerErr::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ConfigErr> for WorkerErr {
    fn from(value: ConfigErr) -> Self {
        Self::Config(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
