//! Communicator hierarchy: global, node-local, gpu-capable and
//! device-sharing groups, plus the device assigned to each process.

use crate::error::{Error, Result};
use devshare_core::{CommExt, Communicator, DeviceInventory};

/// The device a process drives work on, and whether it owns that device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAssignment {
    pub device: Option<usize>,
    pub gpu_owner: bool,
}

/// Assigns a device to node-local rank `local_rank` out of `local_size`
/// processes sharing `n_devices` devices.
///
/// Processes are spread over devices in contiguous blocks whose sizes differ
/// by at most one, larger blocks first. The first process of each block owns
/// the device. With no more processes than devices every process owns the
/// device matching its local rank.
pub fn assign_device(local_rank: usize, local_size: usize, n_devices: usize) -> DeviceAssignment {
    if n_devices == 0 {
        return DeviceAssignment {
            device: None,
            gpu_owner: false,
        };
    }
    if local_size <= n_devices {
        return DeviceAssignment {
            device: Some(local_rank),
            gpu_owner: true,
        };
    }

    let basic = local_size / n_devices;
    let remain = local_size % n_devices;
    // The first `remain` devices serve `basic + 1` processes each.
    let wide = (basic + 1) * remain;
    let (device, offset) = if local_rank < wide {
        (local_rank / (basic + 1), local_rank % (basic + 1))
    } else {
        let rest = local_rank - wide;
        (rest / basic + remain, rest % basic)
    };
    DeviceAssignment {
        device: Some(device),
        gpu_owner: offset == 0,
    }
}

/// The four-level process topology of one solver instance.
#[derive(Debug)]
pub struct Topology {
    global: Box<dyn Communicator>,
    local: Box<dyn Communicator>,
    gpu: Option<Box<dyn Communicator>>,
    device_group: Box<dyn Communicator>,
    host: String,
    node_devices: usize,
    assignment: DeviceAssignment,
    /// Global rank of the device owner serving each global rank.
    owner_of: Vec<usize>,
}

impl Topology {
    /// Builds the hierarchy from `comm`. Collective over `comm`; either every
    /// process gets a topology or every process gets the same error.
    pub fn build(comm: &dyn Communicator, inventory: &dyn DeviceInventory) -> Result<Self> {
        let global = comm.duplicate()?;

        let host = global.processor_name()?;
        let hosts = global.all_gather_bytes(host.as_bytes())?;
        let node_index = hosts
            .iter()
            .position(|h| h.as_slice() == host.as_bytes())
            .ok_or_else(|| Error::Topology("own host missing from host list".to_string()))?;
        let node_color = u32::try_from(node_index)
            .map_err(|_| Error::Topology(format!("node index {} out of range", node_index)))?;
        let local = global
            .split(Some(node_color), global.rank())?
            .ok_or_else(|| Error::Topology("node-local split excluded this process".to_string()))?;

        let node_devices = Self::agree_on_devices(global.as_ref(), &hosts, inventory)?;

        let assignment = assign_device(local.rank(), local.size(), node_devices);
        if local.rank() == 0 {
            if local.size() > node_devices {
                log::warn!(
                    "Node {}: {} processes share {} devices",
                    host,
                    local.size(),
                    node_devices
                );
            } else if local.size() < node_devices {
                log::warn!(
                    "Node {}: {} devices but only {} processes, {} devices stay idle",
                    host,
                    node_devices,
                    local.size(),
                    node_devices - local.size()
                );
            }
        }

        let gpu = global.split(assignment.gpu_owner.then_some(0), global.rank())?;
        let device_color = assignment
            .device
            .map(|d| u32::try_from(d))
            .transpose()
            .map_err(|_| Error::Topology("device index out of range".to_string()))?;
        let device_group = local
            .split(device_color, local.rank())?
            .ok_or_else(|| Error::Topology("process was assigned no device".to_string()))?;

        let own = [global.rank() as u64];
        let root = device_group.broadcast(0, (device_group.rank() == 0).then_some(&own[..]))?;
        let root = *root
            .first()
            .ok_or_else(|| Error::Topology("empty device group root".to_string()))?;
        let owner_of: Vec<usize> = global
            .all_gather_one(root)?
            .into_iter()
            .map(|r| r as usize)
            .collect();

        if (owner_of[global.rank()] == global.rank()) != assignment.gpu_owner {
            return Err(Error::Topology(format!(
                "rank {} disagrees with its device group about ownership",
                global.rank()
            )));
        }

        log::debug!(
            "Topology: global {}/{}, node {} local {}/{}, device {:?}, owner {}, group {}/{}",
            global.rank(),
            global.size(),
            host,
            local.rank(),
            local.size(),
            assignment.device,
            assignment.gpu_owner,
            device_group.rank(),
            device_group.size()
        );

        Ok(Self {
            global,
            local,
            gpu,
            device_group,
            host,
            node_devices,
            assignment,
            owner_of,
        })
    }

    /// Queries the local device count and makes sure every process agrees
    /// that all nodes can be served.
    fn agree_on_devices(
        global: &dyn Communicator,
        hosts: &[Vec<u8>],
        inventory: &dyn DeviceInventory,
    ) -> Result<usize> {
        let counted = inventory.device_count();
        let record = match &counted {
            Ok(n) => [1u64, *n as u64],
            Err(_) => [0, 0],
        };
        let records = global.all_gather(&record)?;

        if let Some(failed) = records.iter().position(|r| r.first() != Some(&1)) {
            return Err(match counted {
                Err(e) => Error::Device(format!("device query failed: {}", e)),
                Ok(_) => Error::Device(format!("device query failed on rank {}", failed)),
            });
        }
        let unserved: Vec<String> = records
            .iter()
            .zip(hosts)
            .filter(|(r, _)| r.get(1) == Some(&0))
            .map(|(_, h)| String::from_utf8_lossy(h).into_owned())
            .collect();
        if !unserved.is_empty() {
            return Err(Error::Topology(format!(
                "no devices visible to {} process(es) on {:?}",
                unserved.len(),
                unserved
            )));
        }
        counted.map_err(|e| Error::Device(e.to_string()))
    }

    pub fn global(&self) -> &dyn Communicator {
        self.global.as_ref()
    }

    pub fn local(&self) -> &dyn Communicator {
        self.local.as_ref()
    }

    /// The gpu-capable communicator; `None` on processes that own no device.
    pub fn gpu(&self) -> Option<&dyn Communicator> {
        self.gpu.as_deref()
    }

    /// Processes sharing this process's device; rank 0 is the owner.
    pub fn device_group(&self) -> &dyn Communicator {
        self.device_group.as_ref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn node_device_count(&self) -> usize {
        self.node_devices
    }

    pub fn assignment(&self) -> DeviceAssignment {
        self.assignment
    }

    pub fn is_gpu_owner(&self) -> bool {
        self.assignment.gpu_owner
    }

    pub fn owner_of(&self) -> &[usize] {
        &self.owner_of
    }

    /// Global ranks of all device owners, ascending; index `i` is gpu rank `i`.
    pub fn owners(&self) -> Vec<usize> {
        let mut owners = self.owner_of.clone();
        owners.sort_unstable();
        owners.dedup();
        owners
    }

    /// Every process owns a device, so no data has to move.
    pub fn is_pass_through(&self) -> bool {
        self.owner_of
            .iter()
            .enumerate()
            .all(|(rank, &owner)| rank == owner)
    }
}
