//! # devshare accel
//!
//! The accelerator boundary: a handle-based solver library API
//! ([`Accelerator`]), the closed set of accelerator [`Mode`]s, status codes
//! checked through [`check`], owned handles and solver configuration.
//! [`HostAccelerator`] is a host-side implementation of the API.

pub mod accelerator;
pub mod config;
pub mod handle;
pub mod host;
pub mod mode;
pub mod status;

pub use accelerator::{Accelerator, SolveStatus};
pub use config::{ConfigError, Convergence, SolverConfig, SolverParams};
pub use handle::{HandleKind, OwnedHandle, RawHandle};
pub use host::{HostAccelerator, HostStats};
pub use mode::{MemorySpace, Mode, Precision, UnknownMode};
pub use status::{check, AccelError, AccelResult, AccelStatus};
