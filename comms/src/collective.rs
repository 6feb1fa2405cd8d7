use bytemuck::Pod;
use log::{debug, info, warn};
use tokio::io::{self, AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};

use crate::{
    CommErr, OnoReceiver, OnoSender, Result,
    msg::{Command, Msg},
};

/// The rank of the process that sources every collective.
pub const ROOT: usize = 0;

/// What a non-root process got out of a broadcast.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The buffer was overwritten with the root's tensor.
    Tensor,
    /// The root announced that there is nothing left to broadcast, the buffer is untouched.
    EndOfStream,
}

/// A process group built over an in-memory duplex pipe per non-root rank.
pub type LocalGroup = ProcessGroup<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

struct Peer<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rank: usize,
    rx: OnoReceiver<R>,
    tx: OnoSender<W>,
}

enum Link<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// The root keeps one channel per non-root rank, ordered by rank.
    Root(Vec<Peer<R, W>>),
    /// Every other rank only talks to the root.
    Leaf(Peer<R, W>),
}

/// A fixed set of processes that take part in blocking collective operations.
///
/// The group is a star rooted at rank `ROOT`. Every participant must issue the same collective
/// calls in the same order with buffers of the same size, otherwise the calls either block
/// forever or fail with `CommErr::ShapeMismatch`.
pub struct ProcessGroup<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rank: usize,
    world_size: usize,
    link: Link<R, W>,
    rx_buf: Vec<u32>,
}

impl<R, W> ProcessGroup<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates the root end of a group.
    ///
    /// # Arguments
    /// * `peers` - The channels to ranks `1..world_size`, in rank order.
    ///
    /// # Returns
    /// The group handle for rank `ROOT`.
    pub fn root<I>(peers: I) -> Self
    where
        I: IntoIterator<Item = (OnoReceiver<R>, OnoSender<W>)>,
    {
        let peers: Vec<_> = peers
            .into_iter()
            .enumerate()
            .map(|(i, (rx, tx))| Peer { rank: i + 1, rx, tx })
            .collect();

        Self {
            rank: ROOT,
            world_size: peers.len() + 1,
            link: Link::Root(peers),
            rx_buf: Vec::new(),
        }
    }

    /// Creates a non-root end of a group.
    ///
    /// # Arguments
    /// * `rank` - This process' rank, must be in `1..world_size`.
    /// * `world_size` - The amount of processes in the group.
    /// * `rx` - Receiving end of the channel to the root.
    /// * `tx` - Sending end of the channel to the root.
    ///
    /// # Returns
    /// The group handle or `CommErr::InvalidRank` if `rank` can't be a leaf of this group.
    pub fn leaf(
        rank: usize,
        world_size: usize,
        rx: OnoReceiver<R>,
        tx: OnoSender<W>,
    ) -> Result<Self> {
        if rank == ROOT || rank >= world_size {
            return Err(CommErr::InvalidRank { rank, world_size });
        }

        Ok(Self {
            rank,
            world_size,
            link: Link::Leaf(Peer { rank: ROOT, rx, tx }),
            rx_buf: Vec::new(),
        })
    }

    /// Returns this process' rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Returns the amount of processes in the group.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_root(&self) -> bool {
        self.rank == ROOT
    }

    /// Copies `buf` from rank `src` into `buf` on every other rank.
    ///
    /// # Arguments
    /// * `buf` - The tensor to send on the source, the preallocated destination elsewhere.
    /// * `src` - The source rank, only `ROOT` is supported.
    ///
    /// # Returns
    /// `Delivery::EndOfStream` if the root called `end_stream` instead of broadcasting,
    /// `Delivery::Tensor` otherwise.
    ///
    /// # Errors
    /// `CommErr::InvalidRank` or `CommErr::NotRoot` for a bad `src`, `CommErr::ShapeMismatch` if
    /// the received payload does not fit `buf`, and I/O errors.
    pub async fn broadcast<T: Pod>(&mut self, buf: &mut [T], src: usize) -> Result<Delivery> {
        self.check_src(src)?;

        let Self { link, rx_buf, .. } = self;
        match link {
            Link::Root(peers) => {
                let bytes: &[u8] = bytemuck::cast_slice(buf);
                send_all(peers, &Msg::Tensor(bytes)).await?;
                debug!(bytes = bytes.len(), peers = peers.len(); "broadcast sent");
                Ok(Delivery::Tensor)
            }
            Link::Leaf(root) => recv_tensor(root, rx_buf, bytemuck::cast_slice_mut(buf)).await,
        }
    }

    /// Tells every non-root rank that no more tensors will be broadcast.
    ///
    /// # Errors
    /// `CommErr::NotRoot` when called on a non-root rank, and I/O errors.
    pub async fn end_stream(&mut self) -> Result<()> {
        match &mut self.link {
            Link::Root(peers) => {
                send_all(peers, &Msg::Control(Command::EndOfStream)).await?;
                info!(peers = peers.len(); "end of stream sent");
                Ok(())
            }
            Link::Leaf(_) => Err(CommErr::NotRoot { src: self.rank }),
        }
    }

    /// Fails every pending and future collective on the non-root ranks.
    ///
    /// Non-root ranks get `CommErr::Peer` carrying `reason` out of their next receive. The group
    /// is unusable afterwards.
    ///
    /// # Errors
    /// `CommErr::NotRoot` when called on a non-root rank, and I/O errors.
    pub async fn abort(&mut self, reason: &str) -> Result<()> {
        match &mut self.link {
            Link::Root(peers) => {
                send_all(peers, &Msg::Err(reason.into())).await?;
                warn!(peers = peers.len(), reason = reason; "group aborted");
                Ok(())
            }
            Link::Leaf(_) => Err(CommErr::NotRoot { src: self.rank }),
        }
    }

    /// Sums `buf` element-wise across all ranks, leaving the total in `buf` on every rank.
    ///
    /// # Arguments
    /// * `buf` - This rank's contribution, overwritten with the sum.
    ///
    /// # Errors
    /// `CommErr::ShapeMismatch` if the ranks disagree on the length of `buf`, and I/O errors.
    pub async fn all_reduce_sum(&mut self, buf: &mut [f32]) -> Result<()> {
        let Self { link, rx_buf, .. } = self;
        match link {
            Link::Root(peers) => {
                let expected = size_of_val(buf);

                for peer in peers.iter_mut() {
                    match peer.rx.recv_into(rx_buf).await? {
                        Msg::Tensor(bytes) if bytes.len() == expected => {
                            for (acc, chunk) in buf.iter_mut().zip(bytes.chunks_exact(4)) {
                                *acc += bytemuck::pod_read_unaligned::<f32>(chunk);
                            }
                        }
                        Msg::Tensor(bytes) => {
                            return Err(CommErr::ShapeMismatch {
                                got: bytes.len(),
                                expected,
                            });
                        }
                        other => return Err(unexpected(peer.rank, other)),
                    }
                }

                let bytes: &[u8] = bytemuck::cast_slice(buf);
                send_all(peers, &Msg::Tensor(bytes)).await?;
                debug!(len = buf.len(); "all reduce done");
                Ok(())
            }
            Link::Leaf(root) => {
                root.tx.send(&Msg::Tensor(bytemuck::cast_slice(buf))).await?;

                match recv_tensor(root, rx_buf, bytemuck::cast_slice_mut(buf)).await? {
                    Delivery::Tensor => Ok(()),
                    Delivery::EndOfStream => Err(CommErr::UnexpectedMessage {
                        got: "control/end_of_stream",
                    }),
                }
            }
        }
    }

    fn check_src(&self, src: usize) -> Result<()> {
        if src >= self.world_size {
            return Err(CommErr::InvalidRank {
                rank: src,
                world_size: self.world_size,
            });
        }

        if src != ROOT {
            return Err(CommErr::NotRoot { src });
        }

        Ok(())
    }
}

async fn send_all<R, W>(peers: &mut [Peer<R, W>], msg: &Msg<'_>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    for peer in peers.iter_mut() {
        peer.tx.send(msg).await?;
    }

    Ok(())
}

async fn recv_tensor<R, W>(
    peer: &mut Peer<R, W>,
    rx_buf: &mut Vec<u32>,
    dst: &mut [u8],
) -> Result<Delivery>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match peer.rx.recv_into(rx_buf).await? {
        Msg::Tensor(bytes) if bytes.len() == dst.len() => {
            dst.copy_from_slice(bytes);
            debug!(bytes = bytes.len(); "broadcast received");
            Ok(Delivery::Tensor)
        }
        Msg::Tensor(bytes) => Err(CommErr::ShapeMismatch {
            got: bytes.len(),
            expected: dst.len(),
        }),
        Msg::Control(Command::EndOfStream) => {
            info!("end of stream received");
            Ok(Delivery::EndOfStream)
        }
        other => Err(unexpected(peer.rank, other)),
    }
}

fn unexpected(rank: usize, msg: Msg<'_>) -> CommErr {
    match msg {
        Msg::Err(detail) => CommErr::Peer(detail.into_owned()),
        other => {
            let got = other.kind();
            warn!(rank = rank, got = got; "unexpected message in collective");
            CommErr::UnexpectedMessage { got }
        }
    }
}

/// Builds a fully connected group of `world_size` ranks inside this process.
///
/// # Arguments
/// * `world_size` - The amount of ranks, at least one.
/// * `capacity` - The buffer size in bytes of every duplex pipe.
///
/// # Returns
/// One group handle per rank, indexed by rank.
pub fn in_memory(world_size: usize, capacity: usize) -> Result<Vec<LocalGroup>> {
    if world_size == 0 {
        return Err(CommErr::InvalidRank {
            rank: ROOT,
            world_size,
        });
    }

    let mut root_ends = Vec::with_capacity(world_size - 1);
    let mut leaves = Vec::with_capacity(world_size - 1);

    for rank in 1..world_size {
        let (root_side, leaf_side) = io::duplex(capacity);

        let (rx, tx) = io::split(root_side);
        root_ends.push(crate::channel(rx, tx));

        let (rx, tx) = io::split(leaf_side);
        let (rx, tx) = crate::channel(rx, tx);
        leaves.push(ProcessGroup::leaf(rank, world_size, rx, tx)?);
    }

    let mut groups = Vec::with_capacity(world_size);
    groups.push(ProcessGroup::root(root_ends));
    groups.extend(leaves);
    Ok(groups)
}
