//! Establishes a `ProcessGroup` over TCP at process start.

use log::{debug, info, warn};
use tokio::net::{
    TcpListener, TcpStream, ToSocketAddrs,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};

use crate::{
    CommErr, OnoReceiver, OnoSender, ProcessGroup, ROOT, Result,
    msg::{Command, Msg},
};

/// A process group whose links are TCP connections.
pub type TcpGroup = ProcessGroup<OwnedReadHalf, OwnedWriteHalf>;

type TcpChannel = (OnoReceiver<OwnedReadHalf>, OnoSender<OwnedWriteHalf>);

/// Accepts the `world_size - 1` non-root ranks and builds the root end of the group.
///
/// Every connecting process must announce itself with `Command::Connect`, peers may connect in
/// any order.
///
/// # Arguments
/// * `listener` - A bound listener the other ranks connect to.
/// * `world_size` - The amount of processes in the group, this one included.
///
/// # Errors
/// `CommErr::InvalidRank` or `CommErr::DuplicateRank` for a bad announcement, and I/O errors.
pub async fn accept(listener: &TcpListener, world_size: usize) -> Result<TcpGroup> {
    if world_size == 0 {
        return Err(CommErr::InvalidRank {
            rank: ROOT,
            world_size,
        });
    }

    let mut slots: Vec<Option<TcpChannel>> = (1..world_size).map(|_| None).collect();
    let mut buf: Vec<u32> = Vec::new();

    for _ in 1..world_size {
        let (stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;

        let (rx, tx) = stream.into_split();
        let (mut rx, tx) = crate::channel(rx, tx);

        let rank = match rx.recv_into(&mut buf).await? {
            Msg::Control(Command::Connect { rank }) => rank,
            other => {
                warn!(got = other.kind(); "expected a connect announcement");
                return Err(CommErr::UnexpectedMessage { got: other.kind() });
            }
        };

        if rank == ROOT || rank >= world_size {
            return Err(CommErr::InvalidRank { rank, world_size });
        }

        let slot = &mut slots[rank - 1];
        if slot.is_some() {
            return Err(CommErr::DuplicateRank { rank });
        }

        debug!(rank = rank; "rank connected from {addr}");
        *slot = Some((rx, tx));
    }

    info!(world_size = world_size; "process group is complete");

    // Every slot was filled exactly once above.
    Ok(ProcessGroup::root(slots.into_iter().flatten()))
}

/// Connects to the root at `addr` and builds a non-root end of the group.
///
/// # Arguments
/// * `addr` - The root's listening address.
/// * `rank` - This process' rank, in `1..world_size`.
/// * `world_size` - The amount of processes in the group.
///
/// # Errors
/// `CommErr::InvalidRank` for a bad rank, and I/O errors.
pub async fn connect<A: ToSocketAddrs>(addr: A, rank: usize, world_size: usize) -> Result<TcpGroup> {
    if rank == ROOT || rank >= world_size {
        return Err(CommErr::InvalidRank { rank, world_size });
    }

    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;

    let (rx, tx) = stream.into_split();
    let (rx, mut tx) = crate::channel(rx, tx);
    tx.send(&Msg::Control(Command::Connect { rank })).await?;
    info!(rank = rank; "connected to the root");

    ProcessGroup::leaf(rank, world_size, rx, tx)
}
