use std::{error::Error, fmt, io};

/// The comms module's result type.
pub type Result<T> = std::result::Result<T, CommErr>;

/// Failures of the process group and its collective operations.
#[derive(Debug)]
pub enum CommErr {
    Io(io::Error),
    /// A tensor payload did not have the byte length of the receiving buffer.
    ShapeMismatch {
        got: usize,
        expected: usize,
    },
    InvalidRank {
        rank: usize,
        world_size: usize,
    },
    DuplicateRank {
        rank: usize,
    },
    /// Only the root of the group may act as the source of a collective.
    NotRoot {
        src: usize,
    },
    UnexpectedMessage {
        got: &'static str,
    },
    /// The other end reported an error.
    Peer(String),
}

impl fmt::Display for CommErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommErr::Io(e) => write!(f, "io error: {e}"),
            CommErr::ShapeMismatch { got, expected } => write!(
                f,
                "tensor size mismatch: got {got} bytes, expected {expected} bytes"
            ),
            CommErr::InvalidRank { rank, world_size } => {
                write!(f, "rank {rank} is out of range for a world of size {world_size}")
            }
            CommErr::DuplicateRank { rank } => write!(f, "rank {rank} connected twice"),
            CommErr::NotRoot { src } => write!(f, "rank {src} is not the root of the group"),
            CommErr::UnexpectedMessage { got } => write!(f, "unexpected message: got {got}"),
            CommErr::Peer(detail) => write!(f, "peer error: {detail}"),
        }
    }
}

impl Error for CommErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CommErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CommErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<CommErr> for io::Error {
    fn from(value: CommErr) -> Self {
        match value {
            CommErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
