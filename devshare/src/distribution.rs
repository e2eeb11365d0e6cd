//! Redistribution between the all-process row layout and the device-owner
//! row layout.
//!
//! Rows keep their global order: each device owner holds the concatenation
//! of its group members' row blocks, and the owners' blocks tile the global
//! row range in gpu rank order.

use crate::error::{Error, Result};
use crate::topology::Topology;
use bytemuck::Pod;
use devshare_core::{CommExt, CsrPartition, CsrView};

/// Messages and bytes moved by redistribution on this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub messages_sent: usize,
    pub messages_received: usize,
    pub bytes_sent: usize,
    pub bytes_received: usize,
}

impl TrafficStats {
    pub fn total_messages(&self) -> usize {
        self.messages_sent + self.messages_received
    }

    fn sent<T>(&mut self, payload: &[T]) {
        self.messages_sent += 1;
        self.bytes_sent += std::mem::size_of_val(payload);
    }

    fn received<T>(&mut self, payload: &[T]) {
        self.messages_received += 1;
        self.bytes_received += std::mem::size_of_val(payload);
    }
}

/// Row ownership for one operator, identical on every process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionPlan {
    n_global_rows: usize,
    rank: usize,
    /// Rows held by each global rank, and where they start.
    rank_rows: Vec<usize>,
    rank_first_row: Vec<usize>,
    /// Global ranks of this process's device group, in group rank order.
    group: Vec<usize>,
    /// `partition_offsets[g]..partition_offsets[g + 1]` belong to gpu rank `g`.
    partition_offsets: Vec<usize>,
    pass_through: bool,
}

impl DistributionPlan {
    /// Collective over the global communicator.
    pub fn build(topology: &Topology, n_local_rows: usize, n_global_rows: usize) -> Result<Self> {
        let global = topology.global();
        let records = global.all_gather(&[n_local_rows as u64, n_global_rows as u64])?;
        let mut rank_rows = Vec::with_capacity(records.len());
        for (rank, record) in records.iter().enumerate() {
            match record.as_slice() {
                [rows, total] if *total as usize == n_global_rows => rank_rows.push(*rows as usize),
                _ => {
                    return Err(Error::InvalidInput(format!(
                        "rank {} reports a different global row count than {}",
                        rank, n_global_rows
                    )))
                }
            }
        }
        let rank_first_row: Vec<usize> = rank_rows
            .iter()
            .scan(0, |next, &rows| {
                let first = *next;
                *next += rows;
                Some(first)
            })
            .collect();
        let total: usize = rank_rows.iter().sum();
        if total != n_global_rows {
            return Err(Error::InvalidInput(format!(
                "local rows sum to {} but the matrix has {} global rows",
                total, n_global_rows
            )));
        }

        let owner_of = topology.owner_of();
        let owners = topology.owners();
        let mut partition_offsets = Vec::with_capacity(owners.len() + 1);
        partition_offsets.push(0);
        for &owner in &owners {
            let members: Vec<usize> = (0..owner_of.len())
                .filter(|&rank| owner_of[rank] == owner)
                .collect();
            let contiguous =
                members.first() == Some(&owner) && members.windows(2).all(|w| w[1] == w[0] + 1);
            if !contiguous {
                return Err(Error::Topology(format!(
                    "device group of owner {} holds non-contiguous ranks {:?}",
                    owner, members
                )));
            }
            let rows: usize = members.iter().map(|&rank| rank_rows[rank]).sum();
            let next = partition_offsets[partition_offsets.len() - 1] + rows;
            partition_offsets.push(next);
        }

        let rank = global.rank();
        let group: Vec<usize> = (0..owner_of.len())
            .filter(|&r| owner_of[r] == owner_of[rank])
            .collect();
        if group.len() != topology.device_group().size() {
            return Err(Error::Topology(format!(
                "device group has {} members but the plan expects {}",
                topology.device_group().size(),
                group.len()
            )));
        }

        let plan = Self {
            n_global_rows,
            rank,
            rank_rows,
            rank_first_row,
            group,
            partition_offsets,
            pass_through: topology.is_pass_through(),
        };
        log::debug!(
            "Distribution plan: rank {} holds {} rows, owner partition {:?}",
            rank,
            n_local_rows,
            plan.partition_offsets
        );
        Ok(plan)
    }

    pub fn n_global_rows(&self) -> usize {
        self.n_global_rows
    }

    pub fn n_local_rows(&self) -> usize {
        self.rank_rows[self.rank]
    }

    pub fn first_row(&self) -> usize {
        self.rank_first_row[self.rank]
    }

    pub fn partition_offsets(&self) -> &[usize] {
        &self.partition_offsets
    }

    pub fn is_pass_through(&self) -> bool {
        self.pass_through
    }

    /// Rows held by the owner of this process's group after gathering.
    pub fn n_owned_rows(&self) -> usize {
        self.group.iter().map(|&rank| self.rank_rows[rank]).sum()
    }

    fn owned_first_row(&self) -> usize {
        self.group
            .first()
            .map_or(0, |&owner| self.rank_first_row[owner])
    }

    /// Gathers a per-row (or per-entry) array to the group owner, who gets
    /// the members' chunks concatenated in group order.
    fn gather<T: Pod>(
        &self,
        topology: &Topology,
        local: &[T],
        stats: &mut TrafficStats,
    ) -> Result<Option<Vec<Vec<T>>>> {
        let group = topology.device_group();
        if group.size() == 1 {
            return Ok(Some(vec![local.to_vec()]));
        }
        let chunks = group.gather_to_root(0, local)?;
        match &chunks {
            Some(chunks) => chunks[1..].iter().for_each(|chunk| stats.received(chunk)),
            None => stats.sent(local),
        }
        log::trace!(
            "Gathered {} bytes within device group (rank {})",
            std::mem::size_of_val(local),
            group.rank()
        );
        Ok(chunks)
    }

    /// Gathers a row-distributed vector to the owners.
    pub fn gather_vector(
        &self,
        topology: &Topology,
        local: &[f64],
        stats: &mut TrafficStats,
    ) -> Result<Option<Vec<f64>>> {
        if local.len() != self.n_local_rows() {
            return Err(Error::InvalidInput(format!(
                "vector has {} entries for {} local rows",
                local.len(),
                self.n_local_rows()
            )));
        }
        let Some(chunks) = self.gather(topology, local, stats)? else {
            return Ok(None);
        };
        for (&rank, chunk) in self.group.iter().zip(&chunks) {
            if chunk.len() != self.rank_rows[rank] {
                return Err(Error::InvalidInput(format!(
                    "rank {} sent {} vector entries for {} rows",
                    rank,
                    chunk.len(),
                    self.rank_rows[rank]
                )));
            }
        }
        Ok(Some(chunks.concat()))
    }

    /// Gathers matrix values (structure unchanged) to the owners.
    pub fn gather_values(
        &self,
        topology: &Topology,
        values: &[f64],
        stats: &mut TrafficStats,
    ) -> Result<Option<Vec<f64>>> {
        Ok(self.gather(topology, values, stats)?.map(|chunks| chunks.concat()))
    }

    /// Gathers the row blocks of a distributed matrix to the owners.
    pub fn gather_matrix(
        &self,
        topology: &Topology,
        block: &CsrView<'_>,
        stats: &mut TrafficStats,
    ) -> Result<Option<CsrPartition>> {
        if block.n_local_rows() != self.n_local_rows() {
            return Err(Error::InvalidInput(format!(
                "matrix block has {} rows, plan expects {}",
                block.n_local_rows(),
                self.n_local_rows()
            )));
        }
        let offsets: Vec<u64> = block.row_offsets().iter().map(|&o| o as u64).collect();
        let cols: Vec<u64> = block.col_indices().iter().map(|&c| c as u64).collect();

        let offset_chunks = self.gather(topology, &offsets, stats)?;
        let col_chunks = self.gather(topology, &cols, stats)?;
        let value_chunks = self.gather(topology, block.values(), stats)?;
        let (Some(offset_chunks), Some(col_chunks), Some(value_chunks)) =
            (offset_chunks, col_chunks, value_chunks)
        else {
            return Ok(None);
        };

        let mut row_offsets = Vec::with_capacity(self.n_owned_rows() + 1);
        row_offsets.push(0usize);
        for chunk in &offset_chunks {
            let base = row_offsets[row_offsets.len() - 1];
            row_offsets.extend(chunk.iter().skip(1).map(|&o| base + o as usize));
        }
        let col_indices: Vec<usize> = col_chunks.concat().into_iter().map(|c| c as usize).collect();
        let values = value_chunks.concat();

        let owned = CsrPartition::from_parts(
            self.owned_first_row(),
            self.n_global_rows,
            row_offsets,
            col_indices,
            values,
        )?;
        log::debug!(
            "Owner rank {} assembled rows {}..{} ({} non-zeros) from {} processes",
            self.rank,
            owned.first_row(),
            owned.first_row() + self.n_owned_rows(),
            devshare_core::DistributedMatrix::n_local_nz(&owned),
            self.group.len()
        );
        Ok(Some(owned))
    }

    /// Returns each group member its rows of an owner-layout vector; the
    /// inverse of [`DistributionPlan::gather_vector`].
    pub fn scatter_vector(
        &self,
        topology: &Topology,
        owned: Option<&[f64]>,
        stats: &mut TrafficStats,
    ) -> Result<Vec<f64>> {
        let group = topology.device_group();
        let chunks = match owned {
            Some(owned) => {
                if owned.len() != self.n_owned_rows() {
                    return Err(Error::InvalidInput(format!(
                        "owner vector has {} entries for {} rows",
                        owned.len(),
                        self.n_owned_rows()
                    )));
                }
                let mut rest = owned;
                let mut chunks = Vec::with_capacity(self.group.len());
                for &rank in &self.group {
                    let (chunk, tail) = rest.split_at(self.rank_rows[rank]);
                    chunks.push(chunk.to_vec());
                    rest = tail;
                }
                Some(chunks)
            }
            None => None,
        };
        if group.size() == 1 {
            return chunks
                .and_then(|mut c| c.pop())
                .ok_or_else(|| Error::InvalidInput("owner has no vector to return".to_string()));
        }
        if let Some(chunks) = &chunks {
            chunks[1..].iter().for_each(|chunk| stats.sent(chunk));
        }
        let mine = group.scatter_from_root(0, chunks.as_deref())?;
        if chunks.is_none() {
            stats.received(&mine);
        }
        Ok(mine)
    }

    /// Broadcasts `data` from the group owner to its members.
    pub fn share_from_owner<T: Pod>(
        &self,
        topology: &Topology,
        data: Option<&[T]>,
        stats: &mut TrafficStats,
    ) -> Result<Vec<T>> {
        let group = topology.device_group();
        if group.size() == 1 {
            return data
                .map(<[T]>::to_vec)
                .ok_or_else(|| Error::InvalidInput("owner has nothing to share".to_string()));
        }
        if let Some(data) = data {
            (1..group.size()).for_each(|_| stats.sent(data));
        }
        let shared = group.broadcast(0, data)?;
        if data.is_none() {
            stats.received(&shared);
        }
        Ok(shared)
    }
}
