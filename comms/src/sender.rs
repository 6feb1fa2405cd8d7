use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, Serialize};

/// Writes length-prefixed frames to one peer of a process group.
pub struct OnoSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    /// Scratch space for the frame header, reused across sends.
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> OnoSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Writes `msg` as a single frame and flushes it.
    ///
    /// Tensor payloads are written straight from the caller's slice after the header, so a
    /// broadcast never copies the tensor into `buf`.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { buf, tx } = self;

        buf.clear();
        buf.resize(LEN_TYPE_SIZE, 0);

        let payload = msg.serialize(buf)?;
        let frame_len = buf.len() - LEN_TYPE_SIZE + payload.map_or(0, <[u8]>::len);
        buf[..LEN_TYPE_SIZE].copy_from_slice(&(frame_len as LenType).to_be_bytes());

        tx.write_all(buf).await?;
        if let Some(payload) = payload {
            tx.write_all(payload).await?;
        }

        tx.flush().await
    }
}
