use std::{error::Error, fmt, io};

use comms::CommErr;
use machine_learning::MlErr;
use ndarray::ShapeError;

/// The workload's result type.
pub type Result<T> = std::result::Result<T, WorkloadErr>;

/// Failures surfaced by the MNIST workload.
#[derive(Debug)]
pub enum WorkloadErr {
    Io(io::Error),
    Comm(CommErr),
    Ml(MlErr),
    Config(String),
    /// The global batch size can't be split evenly among the workers.
    IndivisibleBatch {
        global: usize,
        workers: usize,
    },
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    NonContiguous {
        what: &'static str,
    },
    /// The coordinator ended the stream in the middle of a batch.
    UnexpectedEndOfStream,
    /// A backward pass over a forward pass that recorded nothing.
    MissingTape,
}

impl fmt::Display for WorkloadErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadErr::Io(e) => write!(f, "io error: {e}"),
            WorkloadErr::Comm(e) => write!(f, "communication error: {e}"),
            WorkloadErr::Ml(e) => write!(f, "model error: {e}"),
            WorkloadErr::Config(detail) => write!(f, "invalid config: {detail}"),
            WorkloadErr::IndivisibleBatch { global, workers } => write!(
                f,
                "global batch size {global} is not divisible by the {workers} workers"
            ),
            WorkloadErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(f, "{what} shape mismatch: got {got:?}, expected {expected:?}"),
            WorkloadErr::NonContiguous { what } => write!(f, "{what} is not contiguous"),
            WorkloadErr::UnexpectedEndOfStream => {
                write!(f, "the stream ended in the middle of a batch")
            }
            WorkloadErr::MissingTape => write!(f, "the forward pass was not run in train mode"),
        }
    }
}

impl Error for WorkloadErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkloadErr::Io(e) => Some(e),
            WorkloadErr::Comm(e) => Some(e),
            WorkloadErr::Ml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkloadErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<CommErr> for WorkloadErr {
    fn from(value: CommErr) -> Self {
        Self::Comm(value)
    }
}

impl From<MlErr> for WorkloadErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

impl From<ShapeError> for WorkloadErr {
    fn from(value: ShapeError) -> Self {
        Self::Ml(MlErr::Shape(value))
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkloadErr> for io::Error {
    fn from(value: WorkloadErr) -> Self {
        match value {
            WorkloadErr::Io(e) => e,
            WorkloadErr::Comm(e) => e.into(),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
