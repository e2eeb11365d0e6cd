//! # devshare core
//!
//! Collaborator boundaries shared by the rest of the workspace: the
//! messaging substrate, the device runtime, and the distributed CSR view
//! that callers hand their matrices over with.

pub mod comm;
pub mod context;
pub mod csr;
pub mod device;
pub mod error;

pub use comm::{CommExt, Communicator, ThreadComm};
pub use context::DeviceContext;
pub use csr::{CsrPartition, CsrView, DistributedMatrix, Triplet};
pub use device::{DeviceBinding, DeviceInventory, FixedInventory, WgpuInventory};
pub use error::{CoreError, Result};
