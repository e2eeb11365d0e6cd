//! `devshare`: share a small pool of accelerator devices between many
//! cooperating solver processes.
//!
//! Every process holds its rows of a distributed sparse system. Only one
//! process per device (the device owner) talks to the accelerator; the
//! others hand their rows to their owner and get their part of the solution
//! back. Several solver instances in one process share a single accelerator
//! resource context through a [`ResourceManager`].
//!
//! ```no_run
//! use devshare::{Runtime, SharedSolver};
//! use devshare_core::{CsrPartition, DistributedMatrix, ThreadComm, Triplet};
//!
//! # fn main() -> devshare::Result<()> {
//! let comm = ThreadComm::world(1).pop().unwrap();
//! let mut solver = SharedSolver::new(Runtime::host(1));
//! solver.initialize(&comm, "dDDI", "solver.json")?;
//! let a = CsrPartition::from_triplets(0, 1, 1, vec![Triplet::new(0, 0, 2.0)])?;
//! solver.set_operator(&a.csr_view()?)?;
//! let mut x = vec![0.0];
//! solver.solve(&mut x, &[4.0])?;
//! solver.finalize()?;
//! # Ok(())
//! # }
//! ```

pub mod distribution;
pub mod error;
pub mod lifecycle;
pub mod solver;
pub mod topology;

pub use distribution::{DistributionPlan, TrafficStats};
pub use error::{Error, OrAbort, Result};
pub use lifecycle::{ResourceManager, Runtime};
pub use solver::{SharedSolver, SolveSummary, SolverState};
pub use topology::{assign_device, DeviceAssignment, Topology};

/// Formats a byte count with a binary unit, e.g. `1.50 KB`.
pub fn human_size(bytes: usize) -> String {
    let units = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit + 1 < units.len() {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, units[unit])
}
