//! MPI backend for the messaging boundary.
//!
//! Requires the `mpi` feature flag and an MPI installation. The caller
//! initializes MPI and keeps the `Universe` alive for as long as any
//! `MpiComm` exists:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let world = MpiComm::world();
//! ```
//!
//! An `MpiComm` holds no MPI handle. Every operation goes through the world
//! communicator of the calling thread; a derived communicator is a list of
//! world ranks plus a context number that is folded into the message tag.
//! Tags therefore need an MPI implementation whose `MPI_TAG_UB` is
//! `2^31 - 1`, as Open MPI and MPICH provide.

use super::Communicator;
use crate::error::{CoreError, Result};
use mpi::topology::SimpleCommunicator;
use mpi::traits::{Communicator as _, Destination as _, Source as _};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Bits of an MPI tag that carry the caller's tag.
const TAG_BITS: u32 = 16;
/// Contexts must fit the 31-bit tag next to the tag and the control bit.
const MAX_CONTEXT: u32 = (1 << (31 - TAG_BITS - 1)) - 1;

/// Control-channel tag of the all-gather that splits are built on.
const CONTROL_GATHER: u32 = 0;

/// Lowest context number this process has not used yet.
static NEXT_CONTEXT: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone)]
pub struct MpiComm {
    /// World rank of every member, in rank order.
    members: Arc<[i32]>,
    rank: usize,
    context: u32,
}

impl MpiComm {
    pub fn world() -> Self {
        let world = SimpleCommunicator::world();
        Self {
            members: (0..world.size()).collect(),
            rank: world.rank() as usize,
            context: 0,
        }
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.members.len() {
            return Err(CoreError::InvalidRank {
                rank: peer,
                size: self.members.len(),
            });
        }
        Ok(())
    }

    fn post(&self, dest: usize, tag: u32, control: bool, data: &[u8]) -> Result<()> {
        self.check_peer(dest)?;
        let tag = encode_tag(self.context, control, tag)?;
        SimpleCommunicator::world()
            .process_at_rank(self.members[dest])
            .send_with_tag(data, tag);
        Ok(())
    }

    fn take(&self, source: usize, tag: u32, control: bool) -> Result<Vec<u8>> {
        self.check_peer(source)?;
        let tag = encode_tag(self.context, control, tag)?;
        let (data, _status) = SimpleCommunicator::world()
            .process_at_rank(self.members[source])
            .receive_vec_with_tag::<u8>(tag);
        Ok(data)
    }

    /// One split record per member, indexed by rank.
    fn exchange_records(&self, record: [u64; 4]) -> Result<Vec<[u64; 4]>> {
        self.all_gather_bytes(bytemuck::cast_slice(&record))?
            .into_iter()
            .enumerate()
            .map(|(peer, bytes)| {
                bytemuck::try_pod_read_unaligned(&bytes).map_err(|_| {
                    CoreError::MalformedMessage {
                        source_rank: peer,
                        tag: CONTROL_GATHER,
                        len: bytes.len(),
                        elem_size: std::mem::size_of::<[u64; 4]>(),
                    }
                })
            })
            .collect()
    }
}

fn encode_tag(context: u32, control: bool, tag: u32) -> Result<i32> {
    if tag >= 1 << TAG_BITS {
        return Err(CoreError::Comm(format!(
            "tag {} does not fit the MPI backend's {} tag bits",
            tag, TAG_BITS
        )));
    }
    if context > MAX_CONTEXT {
        return Err(CoreError::Comm(format!(
            "out of MPI communicator contexts ({} in use)",
            context
        )));
    }
    let encoded = (context << (TAG_BITS + 1)) | (u32::from(control) << TAG_BITS) | tag;
    i32::try_from(encoded).map_err(|_| CoreError::Comm(format!("tag {} out of range", encoded)))
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn duplicate(&self) -> Result<Box<dyn Communicator>> {
        self.split(Some(0), self.rank)?
            .ok_or_else(|| CoreError::Comm("duplicate produced no communicator".to_string()))
    }

    /// Every member proposes the lowest context it has not used; the group
    /// takes the largest proposal. Two communicators sharing a process thus
    /// never share a context, and disjoint colours may reuse one.
    fn split(&self, color: Option<u32>, key: usize) -> Result<Option<Box<dyn Communicator>>> {
        let record = [
            color.is_some() as u64,
            color.unwrap_or(0) as u64,
            key as u64,
            NEXT_CONTEXT.load(Ordering::Acquire) as u64,
        ];
        let records = self.exchange_records(record)?;
        let context = records.iter().map(|r| r[3]).max().unwrap_or(record[3]);
        let context = u32::try_from(context)
            .map_err(|_| CoreError::Comm(format!("context {} out of range", context)))?;
        NEXT_CONTEXT.fetch_max(context.saturating_add(1), Ordering::AcqRel);

        let Some(color) = color else {
            return Ok(None);
        };
        let mut members: Vec<(u64, usize)> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r[0] == 1 && r[1] == color as u64)
            .map(|(rank, r)| (r[2], rank))
            .collect();
        members.sort_unstable();
        let rank = members
            .iter()
            .position(|&(_, rank)| rank == self.rank)
            .ok_or_else(|| CoreError::Comm("split lost the calling rank".to_string()))?;
        log::trace!(
            "MPI split ctx {} -> ctx {} (color {}, rank {}/{})",
            self.context,
            context,
            color,
            rank,
            members.len()
        );
        Ok(Some(Box::new(MpiComm {
            members: members.iter().map(|&(_, r)| self.members[r]).collect(),
            rank,
            context,
        })))
    }

    fn send_bytes(&self, dest: usize, tag: u32, data: &[u8]) -> Result<()> {
        self.post(dest, tag, false, data)
    }

    fn recv_bytes(&self, source: usize, tag: u32) -> Result<Vec<u8>> {
        self.take(source, tag, false)
    }

    fn processor_name(&self) -> Result<String> {
        mpi::environment::processor_name()
            .map_err(|e| CoreError::Comm(format!("MPI_Get_processor_name failed: {:?}", e)))
    }

    /// Funnels through rank 0, so no two members ever wait on each other's
    /// blocking sends.
    fn all_gather_bytes(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        if self.rank != 0 {
            self.post(0, CONTROL_GATHER, true, data)?;
            let lengths = self.take(0, CONTROL_GATHER, true)?;
            if lengths.len() % 8 != 0 {
                return Err(CoreError::MalformedMessage {
                    source_rank: 0,
                    tag: CONTROL_GATHER,
                    len: lengths.len(),
                    elem_size: 8,
                });
            }
            let lengths: Vec<u64> = lengths
                .chunks_exact(8)
                .map(bytemuck::pod_read_unaligned)
                .collect();
            let joined = self.take(0, CONTROL_GATHER, true)?;
            let mut parts = Vec::with_capacity(lengths.len());
            let mut offset = 0;
            for len in lengths {
                let end = offset.saturating_add(len as usize);
                let part = joined.get(offset..end).ok_or(CoreError::MalformedMessage {
                    source_rank: 0,
                    tag: CONTROL_GATHER,
                    len: joined.len(),
                    elem_size: 1,
                })?;
                parts.push(part.to_vec());
                offset = end;
            }
            return Ok(parts);
        }

        let parts = (0..self.members.len())
            .map(|peer| {
                if peer == 0 {
                    Ok(data.to_vec())
                } else {
                    self.take(peer, CONTROL_GATHER, true)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let lengths: Vec<u64> = parts.iter().map(|p| p.len() as u64).collect();
        let joined = parts.concat();
        for peer in 1..self.members.len() {
            self.post(peer, CONTROL_GATHER, true, bytemuck::cast_slice(&lengths))?;
            self.post(peer, CONTROL_GATHER, true, &joined)?;
        }
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_keep_contexts_and_channels_apart() {
        let user = encode_tag(3, false, 7).unwrap();
        let control = encode_tag(3, true, 7).unwrap();
        let other_context = encode_tag(4, false, 7).unwrap();
        assert_ne!(user, control);
        assert_ne!(user, other_context);
        assert_eq!(encode_tag(0, false, 30_000).unwrap(), 30_000);
    }

    #[test]
    fn oversized_tags_and_contexts_are_rejected() {
        assert!(matches!(encode_tag(0, false, 1 << 16), Err(CoreError::Comm(_))));
        assert!(matches!(encode_tag(MAX_CONTEXT + 1, false, 0), Err(CoreError::Comm(_))));
        assert!(encode_tag(MAX_CONTEXT, true, (1 << 16) - 1).is_ok());
    }
}
