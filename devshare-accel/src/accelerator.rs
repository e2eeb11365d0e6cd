use crate::handle::{HandleKind, RawHandle};
use crate::mode::Mode;
use crate::status::AccelResult;
use devshare_core::{Communicator, CsrView};
use std::fmt::Debug;
use std::path::Path;

/// Outcome of the most recent solve, as reported by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Success,
    Failed,
    Diverged,
    NotConverged,
}

impl SolveStatus {
    pub fn is_success(self) -> bool {
        self == SolveStatus::Success
    }

    /// Stable integer encoding, used when the status travels between processes.
    pub fn code(self) -> u32 {
        match self {
            SolveStatus::Success => 0,
            SolveStatus::Failed => 1,
            SolveStatus::Diverged => 2,
            SolveStatus::NotConverged => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(SolveStatus::Success),
            1 => Some(SolveStatus::Failed),
            2 => Some(SolveStatus::Diverged),
            3 => Some(SolveStatus::NotConverged),
            _ => None,
        }
    }
}

/// Handle-based accelerator solver library.
///
/// One value stands for the library as loaded into one process. Handles are
/// opaque; they are only meaningful to the accelerator that issued them.
/// Calls marked collective must be made by every member of the resource
/// communicator, in the same order.
pub trait Accelerator: Send + Sync + Debug {
    /// Library-global initialization.
    fn initialize(&self) -> AccelResult<()>;

    /// Library-global teardown. Every handle must already be destroyed.
    fn finalize(&self) -> AccelResult<()>;

    /// Reads a solver configuration file.
    fn create_config(&self, path: &Path) -> AccelResult<RawHandle>;

    /// Creates the resource context shared by all matrices, vectors and
    /// solvers of this process. `comm` holds exactly the processes that
    /// drive a device; `device` is this process's bound device ordinal.
    fn create_resources(
        &self,
        config: RawHandle,
        comm: Box<dyn Communicator>,
        device: usize,
    ) -> AccelResult<RawHandle>;

    fn create_matrix(&self, resources: RawHandle, mode: Mode) -> AccelResult<RawHandle>;

    fn create_vector(&self, resources: RawHandle, mode: Mode) -> AccelResult<RawHandle>;

    fn create_solver(
        &self,
        resources: RawHandle,
        mode: Mode,
        config: RawHandle,
    ) -> AccelResult<RawHandle>;

    fn destroy(&self, kind: HandleKind, handle: RawHandle) -> AccelResult<()>;

    /// Uploads this process's row block of a distributed matrix.
    /// `partition_offsets[r]..partition_offsets[r + 1]` are the global rows
    /// owned by resource rank `r`. Collective.
    fn upload_matrix(
        &self,
        matrix: RawHandle,
        block: CsrView<'_>,
        partition_offsets: &[usize],
    ) -> AccelResult<()>;

    /// Replaces the non-zero values of an uploaded matrix, keeping its
    /// structure. Collective.
    fn replace_coefficients(&self, matrix: RawHandle, values: &[f64]) -> AccelResult<()>;

    /// Uploads the local part of a vector distributed like `matrix`.
    fn upload_vector(&self, vector: RawHandle, matrix: RawHandle, data: &[f64]) -> AccelResult<()>;

    fn download_vector(&self, vector: RawHandle, out: &mut [f64]) -> AccelResult<()>;

    /// Binds `matrix` to `solver` and prepares it. Collective.
    fn setup(&self, solver: RawHandle, matrix: RawHandle) -> AccelResult<()>;

    /// Prepares the solver again after coefficients changed. Collective.
    fn resetup(&self, solver: RawHandle, matrix: RawHandle) -> AccelResult<()>;

    /// Solves with `x` as the initial guess, overwriting it. Collective.
    fn solve(&self, solver: RawHandle, rhs: RawHandle, x: RawHandle) -> AccelResult<()>;

    fn solve_status(&self, solver: RawHandle) -> AccelResult<SolveStatus>;

    /// Iterations performed by the most recent solve.
    fn iterations(&self, solver: RawHandle) -> AccelResult<usize>;

    /// Residual norm recorded at `iteration` of the most recent solve;
    /// iteration 0 is the initial residual.
    fn residual(&self, solver: RawHandle, iteration: usize) -> AccelResult<f64>;
}
