//! Messaging boundary.
//!
//! The rest of the workspace talks to cooperating processes only through the
//! [`Communicator`] trait: duplication, split-by-color, blocking
//! point-to-point transfer and a handful of collectives built on top of it.
//! Implementations: [`ThreadComm`] (in-process world, one endpoint per
//! thread) and `MpiComm` (behind the `mpi` feature).

#[cfg(feature = "mpi")]
pub mod mpi_comm;
pub mod thread;

#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;
pub use thread::ThreadComm;

use crate::error::{CoreError, Result};
use bytemuck::Pod;
use std::fmt::Debug;

/// Tags at or above this value are used by the collectives in [`CommExt`].
/// Kept below the smallest upper bound MPI guarantees for tags (32767).
pub const RESERVED_TAG_BASE: u32 = 30_000;

const TAG_ALL_GATHER: u32 = RESERVED_TAG_BASE;
const TAG_GATHER: u32 = RESERVED_TAG_BASE + 1;
const TAG_SCATTER: u32 = RESERVED_TAG_BASE + 2;
const TAG_BROADCAST: u32 = RESERVED_TAG_BASE + 3;

/// A group of cooperating processes with ordered, reliable, blocking messaging.
///
/// Every method that involves more than one process is collective: all
/// members must call it, in the same order, or the group stalls.
pub trait Communicator: Send + Debug {
    /// Rank of this process within the group.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    /// Creates a communicator with the same members and an isolated message space.
    fn duplicate(&self) -> Result<Box<dyn Communicator>>;

    /// Partitions the group by `color`. Members with equal color form a new
    /// group ordered by `(key, rank)`. A process passing `None` joins no
    /// group and gets `None` back.
    fn split(&self, color: Option<u32>, key: usize) -> Result<Option<Box<dyn Communicator>>>;

    fn send_bytes(&self, dest: usize, tag: u32, data: &[u8]) -> Result<()>;

    /// Blocks until a message from `source` with `tag` arrives.
    fn recv_bytes(&self, source: usize, tag: u32) -> Result<Vec<u8>>;

    /// Name of the host this process runs on.
    fn processor_name(&self) -> Result<String>;

    /// Every member contributes `data`; every member receives all
    /// contributions indexed by rank.
    ///
    /// The default implementation assumes sends are buffered.
    fn all_gather_bytes(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let (rank, size) = (self.rank(), self.size());
        for peer in (0..size).filter(|&p| p != rank) {
            self.send_bytes(peer, TAG_ALL_GATHER, data)?;
        }
        (0..size)
            .map(|peer| {
                if peer == rank {
                    Ok(data.to_vec())
                } else {
                    self.recv_bytes(peer, TAG_ALL_GATHER)
                }
            })
            .collect()
    }

    fn barrier(&self) -> Result<()> {
        self.all_gather_bytes(&[]).map(|_| ())
    }
}

/// Typed helpers over [`Communicator`] for plain-old-data payloads.
pub trait CommExt: Communicator {
    fn send<T: Pod>(&self, dest: usize, tag: u32, data: &[T]) -> Result<()> {
        self.send_bytes(dest, tag, bytemuck::cast_slice(data))
    }

    fn recv<T: Pod>(&self, source: usize, tag: u32) -> Result<Vec<T>> {
        let bytes = self.recv_bytes(source, tag)?;
        decode(&bytes, source, tag)
    }

    fn all_gather<T: Pod>(&self, data: &[T]) -> Result<Vec<Vec<T>>> {
        self.all_gather_bytes(bytemuck::cast_slice(data))?
            .iter()
            .enumerate()
            .map(|(source, bytes)| decode(bytes, source, TAG_ALL_GATHER))
            .collect()
    }

    /// Gathers one value per member, indexed by rank.
    fn all_gather_one<T: Pod>(&self, value: T) -> Result<Vec<T>> {
        let gathered = self.all_gather(std::slice::from_ref(&value))?;
        gathered
            .into_iter()
            .enumerate()
            .map(|(source, chunk)| {
                chunk.first().copied().ok_or(CoreError::MalformedMessage {
                    source_rank: source,
                    tag: TAG_ALL_GATHER,
                    len: 0,
                    elem_size: std::mem::size_of::<T>(),
                })
            })
            .collect()
    }

    /// Variable-length gather. The root receives every member's chunk in
    /// rank order; other members receive `None`.
    fn gather_to_root<T: Pod>(&self, root: usize, data: &[T]) -> Result<Option<Vec<Vec<T>>>> {
        check_rank(root, self.size())?;
        if self.rank() != root {
            self.send(root, TAG_GATHER, data)?;
            return Ok(None);
        }
        let chunks = (0..self.size())
            .map(|source| {
                if source == root {
                    Ok(data.to_vec())
                } else {
                    self.recv(source, TAG_GATHER)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(chunks))
    }

    /// Variable-length scatter, the inverse of [`CommExt::gather_to_root`].
    /// The root passes one chunk per member; everyone returns its own chunk.
    fn scatter_from_root<T: Pod>(&self, root: usize, chunks: Option<&[Vec<T>]>) -> Result<Vec<T>> {
        check_rank(root, self.size())?;
        if self.rank() != root {
            return self.recv(root, TAG_SCATTER);
        }
        let chunks = chunks.ok_or_else(|| {
            CoreError::Comm("scatter root was called without chunks".to_string())
        })?;
        if chunks.len() != self.size() {
            return Err(CoreError::Comm(format!(
                "scatter root has {} chunks for {} members",
                chunks.len(),
                self.size()
            )));
        }
        for (dest, chunk) in chunks.iter().enumerate().filter(|&(dest, _)| dest != root) {
            self.send(dest, TAG_SCATTER, chunk)?;
        }
        Ok(chunks[root].clone())
    }

    fn broadcast<T: Pod>(&self, root: usize, data: Option<&[T]>) -> Result<Vec<T>> {
        check_rank(root, self.size())?;
        if self.rank() != root {
            return self.recv(root, TAG_BROADCAST);
        }
        let data = data.ok_or_else(|| {
            CoreError::Comm("broadcast root was called without data".to_string())
        })?;
        for dest in (0..self.size()).filter(|&d| d != root) {
            self.send(dest, TAG_BROADCAST, data)?;
        }
        Ok(data.to_vec())
    }
}

impl<C: Communicator + ?Sized> CommExt for C {}

fn check_rank(rank: usize, size: usize) -> Result<()> {
    if rank >= size {
        return Err(CoreError::InvalidRank { rank, size });
    }
    Ok(())
}

fn decode<T: Pod>(bytes: &[u8], source: usize, tag: u32) -> Result<Vec<T>> {
    let elem_size = std::mem::size_of::<T>();
    if elem_size == 0 || bytes.len() % elem_size != 0 {
        return Err(CoreError::MalformedMessage {
            source_rank: source,
            tag,
            len: bytes.len(),
            elem_size,
        });
    }
    // Received buffers carry no alignment guarantee.
    Ok(bytes
        .chunks_exact(elem_size)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}
