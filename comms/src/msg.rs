use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_H: Header = 0;
const CONTROL_H: Header = 1;
const TENSOR_H: Header = 2;

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Sent once by every non-root process right after connecting.
    Connect { rank: usize },
    /// The root has no more batches to broadcast.
    EndOfStream,
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    /// The raw bytes of a tensor, the receiving end already knows its shape and dtype.
    Tensor(&'a [u8]),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// Returns a stable name for the kind of this message, used for logging and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Connect { .. }) => "control/connect",
            Msg::Control(Command::EndOfStream) => "control/end_of_stream",
            Msg::Tensor(_) => "tensor",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_H.to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_H.to_be_bytes());
                serde_json::to_writer(buf, cmd)?;
                Ok(None)
            }
            Msg::Tensor(bytes) => {
                buf.extend_from_slice(&TENSOR_H.to_be_bytes());
                Ok(Some(*bytes))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        let Some((kind_buf, rest)) = buf.split_first_chunk::<HEADER_SIZE>() else {
            return Self::buf_is_too_small(buf.len());
        };

        match Header::from_be_bytes(*kind_buf) {
            ERR_H => {
                let string = str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL_H => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            TENSOR_H => Ok(Self::Tensor(rest)),
            kind => Self::invalid_kind(kind),
        }
    }
}
