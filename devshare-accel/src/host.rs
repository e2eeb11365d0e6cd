//! Host reference accelerator.
//!
//! Implements the handle API on the host: matrices, vectors and solvers live
//! in a per-process object table and the solver runs a distributed weighted
//! Jacobi iteration over the resource communicator. Single precision modes
//! store values rounded through `f32`, so precision effects are observable.

use crate::accelerator::{Accelerator, SolveStatus};
use crate::config::{Convergence, SolverConfig, SolverParams};
use crate::handle::{HandleKind, RawHandle};
use crate::mode::{Mode, Precision};
use crate::status::{AccelResult, AccelStatus};
use devshare_core::{CommExt, Communicator, CsrView};
use num_traits::Float;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Lifecycle counters, for auditing how often the library and the shared
/// resources were created and torn down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub library_initializations: usize,
    pub library_finalizations: usize,
    pub resources_created: usize,
    pub resources_destroyed: usize,
    pub live_handles: usize,
}

struct Resources {
    comm: Box<dyn Communicator>,
    device: usize,
    config: SolverConfig,
}

struct MatrixData {
    resources: RawHandle,
    mode: Mode,
    uploaded: bool,
    n_global_rows: usize,
    first_row: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<f64>,
}

impl MatrixData {
    fn n_local_rows(&self) -> usize {
        self.row_offsets.len().saturating_sub(1)
    }

    /// Diagonal entries of the local rows, duplicates summed.
    fn diagonal(&self) -> Vec<f64> {
        (0..self.n_local_rows())
            .map(|i| {
                let global_row = self.first_row + i;
                (self.row_offsets[i]..self.row_offsets[i + 1])
                    .filter(|&k| self.col_indices[k] == global_row)
                    .map(|k| self.values[k])
                    .sum()
            })
            .collect()
    }
}

struct VectorData {
    resources: RawHandle,
    mode: Mode,
    data: Vec<f64>,
}

struct SolveRecord {
    status: SolveStatus,
    iterations: usize,
    history: Vec<f64>,
}

struct SolverData {
    resources: RawHandle,
    mode: Mode,
    params: SolverParams,
    matrix: Option<RawHandle>,
    inv_diag: Vec<f64>,
    last: Option<SolveRecord>,
}

enum Object {
    Config(SolverConfig),
    Resources(Resources),
    Matrix(MatrixData),
    Vector(VectorData),
    Solver(SolverData),
}

impl Object {
    fn kind(&self) -> HandleKind {
        match self {
            Object::Config(_) => HandleKind::Config,
            Object::Resources(_) => HandleKind::Resources,
            Object::Matrix(_) => HandleKind::Matrix,
            Object::Vector(_) => HandleKind::Vector,
            Object::Solver(_) => HandleKind::Solver,
        }
    }

    /// The resource context this object was created in, if any.
    fn resources(&self) -> Option<RawHandle> {
        match self {
            Object::Matrix(m) => Some(m.resources),
            Object::Vector(v) => Some(v.resources),
            Object::Solver(s) => Some(s.resources),
            Object::Config(_) | Object::Resources(_) => None,
        }
    }
}

#[derive(Default)]
struct HostState {
    initialized: bool,
    next_handle: u64,
    objects: HashMap<RawHandle, Object>,
    stats: HostStats,
}

impl HostState {
    fn require_initialized(&self) -> AccelResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(AccelStatus::NotInitialized)
        }
    }

    fn insert(&mut self, object: Object) -> RawHandle {
        self.next_handle += 1;
        let handle = RawHandle(self.next_handle);
        log::trace!("Created {:?} handle {}", object.kind(), handle);
        self.objects.insert(handle, object);
        handle
    }

    fn config(&self, handle: RawHandle) -> AccelResult<&SolverConfig> {
        match self.objects.get(&handle) {
            Some(Object::Config(config)) => Ok(config),
            _ => Err(AccelStatus::InvalidHandle),
        }
    }

    fn resources(&self, handle: RawHandle) -> AccelResult<&Resources> {
        match self.objects.get(&handle) {
            Some(Object::Resources(resources)) => Ok(resources),
            _ => Err(AccelStatus::InvalidHandle),
        }
    }

    fn matrix(&self, handle: RawHandle) -> AccelResult<&MatrixData> {
        match self.objects.get(&handle) {
            Some(Object::Matrix(matrix)) => Ok(matrix),
            _ => Err(AccelStatus::InvalidHandle),
        }
    }

    fn matrix_mut(&mut self, handle: RawHandle) -> AccelResult<&mut MatrixData> {
        match self.objects.get_mut(&handle) {
            Some(Object::Matrix(matrix)) => Ok(matrix),
            _ => Err(AccelStatus::InvalidHandle),
        }
    }

    fn vector(&self, handle: RawHandle) -> AccelResult<&VectorData> {
        match self.objects.get(&handle) {
            Some(Object::Vector(vector)) => Ok(vector),
            _ => Err(AccelStatus::InvalidHandle),
        }
    }

    fn vector_mut(&mut self, handle: RawHandle) -> AccelResult<&mut VectorData> {
        match self.objects.get_mut(&handle) {
            Some(Object::Vector(vector)) => Ok(vector),
            _ => Err(AccelStatus::InvalidHandle),
        }
    }

    fn solver(&self, handle: RawHandle) -> AccelResult<&SolverData> {
        match self.objects.get(&handle) {
            Some(Object::Solver(solver)) => Ok(solver),
            _ => Err(AccelStatus::InvalidHandle),
        }
    }

    fn solver_mut(&mut self, handle: RawHandle) -> AccelResult<&mut SolverData> {
        match self.objects.get_mut(&handle) {
            Some(Object::Solver(solver)) => Ok(solver),
            _ => Err(AccelStatus::InvalidHandle),
        }
    }

    fn last_solve(&self, solver: RawHandle) -> AccelResult<&SolveRecord> {
        self.solver(solver)?
            .last
            .as_ref()
            .ok_or(AccelStatus::BadParameters)
    }
}

/// Accelerator library running on the host.
pub struct HostAccelerator {
    state: Mutex<HostState>,
}

impl fmt::Debug for HostAccelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAccelerator")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for HostAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl HostAccelerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState::default()),
        }
    }

    pub fn stats(&self) -> HostStats {
        match self.state.lock() {
            Ok(state) => HostStats {
                live_handles: state.objects.len(),
                ..state.stats
            },
            Err(_) => HostStats::default(),
        }
    }

    fn lock(&self) -> AccelResult<MutexGuard<'_, HostState>> {
        self.state.lock().map_err(|_| AccelStatus::InternalError)
    }

    fn create_in(
        &self,
        resources: RawHandle,
        make: impl FnOnce(&HostState) -> AccelResult<Object>,
    ) -> AccelResult<RawHandle> {
        let mut state = self.lock()?;
        state.require_initialized()?;
        state.resources(resources)?;
        let object = make(&*state)?;
        Ok(state.insert(object))
    }

    /// Runs `setup` or `resetup`: both (re)compute the inverse diagonal.
    fn prepare(&self, solver: RawHandle, matrix: RawHandle, rebind: bool) -> AccelResult<()> {
        let mut state = self.lock()?;
        let solver_data = state.solver(solver)?;
        let matrix_data = state.matrix(matrix)?;
        let comm = state.resources(matrix_data.resources)?.comm.as_ref();

        let local_ok = matrix_data.uploaded
            && solver_data.mode == matrix_data.mode
            && solver_data.resources == matrix_data.resources
            && (rebind || solver_data.matrix == Some(matrix));
        let diagonal = matrix_data.diagonal();
        let nonsingular = diagonal.iter().all(|&d| d != 0.0 && d.is_finite());
        if local_ok && !nonsingular {
            log::error!("Matrix {} has a zero or non-finite diagonal entry", matrix);
        }
        agree(comm, local_ok && nonsingular)?;

        let inv_diag = diagonal.iter().map(|d| 1.0 / d).collect();
        let solver_data = state.solver_mut(solver)?;
        solver_data.inv_diag = inv_diag;
        solver_data.matrix = Some(matrix);
        solver_data.last = None;
        Ok(())
    }
}

/// Collective agreement on a local check: every member fails if any does.
fn agree(comm: &dyn Communicator, ok: bool) -> AccelResult<()> {
    let flags = comm.all_gather_one(ok as u8).map_err(comm_failure)?;
    if flags.iter().all(|&flag| flag == 1) {
        Ok(())
    } else {
        Err(AccelStatus::BadParameters)
    }
}

fn comm_failure(err: devshare_core::CoreError) -> AccelStatus {
    log::error!("Accelerator communication failed: {}", err);
    AccelStatus::CommFailure
}

fn round_through<T: Float>(value: f64) -> f64 {
    T::from(value).and_then(|v| v.to_f64()).unwrap_or(f64::NAN)
}

fn quantize(value: f64, precision: Precision) -> f64 {
    match precision {
        Precision::Double => value,
        Precision::Float => round_through::<f32>(value),
    }
}

fn global_norm(comm: &dyn Communicator, local: &[f64]) -> AccelResult<f64> {
    let local_sq: f64 = local.iter().map(|r| r * r).sum();
    let parts = comm.all_gather_one(local_sq).map_err(comm_failure)?;
    Ok(parts.iter().sum::<f64>().sqrt())
}

/// Weighted Jacobi over a row-distributed matrix. Every member computes the
/// same residual norms, so all members stop at the same iteration.
fn jacobi(
    comm: &dyn Communicator,
    matrix: &MatrixData,
    inv_diag: &[f64],
    rhs: &[f64],
    mut x: Vec<f64>,
    params: &SolverParams,
    vector_precision: Precision,
) -> AccelResult<(Vec<f64>, SolveRecord)> {
    let n_local = matrix.n_local_rows();
    let mut history = Vec::new();
    let mut residual = vec![0.0; n_local];
    let mut iterations = 0;

    let status = loop {
        let global_x: Vec<f64> = comm
            .all_gather(&x)
            .map_err(comm_failure)?
            .into_iter()
            .flatten()
            .collect();
        if global_x.len() != matrix.n_global_rows {
            return Err(AccelStatus::BadParameters);
        }
        for (i, r) in residual.iter_mut().enumerate() {
            let ax: f64 = (matrix.row_offsets[i]..matrix.row_offsets[i + 1])
                .map(|k| matrix.values[k] * global_x[matrix.col_indices[k]])
                .sum();
            *r = rhs[i] - ax;
        }
        let norm = global_norm(comm, &residual)?;
        history.push(norm);

        if !norm.is_finite() {
            break SolveStatus::Diverged;
        }
        if params.monitor_residual {
            let target = match params.convergence {
                Convergence::Absolute => params.tolerance,
                Convergence::RelativeIni => params.tolerance * history[0],
            };
            if norm <= target {
                break SolveStatus::Success;
            }
        }
        if iterations == params.max_iters {
            break if params.monitor_residual {
                SolveStatus::NotConverged
            } else {
                SolveStatus::Success
            };
        }

        for ((xi, ri), di) in x.iter_mut().zip(&residual).zip(inv_diag) {
            *xi = quantize(*xi + params.relaxation_factor * ri * di, vector_precision);
        }
        iterations += 1;
    };

    if !params.store_res_history {
        history.clear();
    }
    Ok((
        x,
        SolveRecord {
            status,
            iterations,
            history,
        },
    ))
}

impl Accelerator for HostAccelerator {
    fn initialize(&self) -> AccelResult<()> {
        let mut state = self.lock()?;
        if state.initialized {
            log::error!("Host accelerator initialized twice");
            return Err(AccelStatus::BadParameters);
        }
        state.initialized = true;
        state.stats.library_initializations += 1;
        log::info!("Host accelerator initialized");
        Ok(())
    }

    fn finalize(&self) -> AccelResult<()> {
        let mut state = self.lock()?;
        state.require_initialized()?;
        if !state.objects.is_empty() {
            log::error!(
                "Host accelerator finalized with {} live handles",
                state.objects.len()
            );
            return Err(AccelStatus::BadParameters);
        }
        state.initialized = false;
        state.stats.library_finalizations += 1;
        log::info!("Host accelerator finalized");
        Ok(())
    }

    fn create_config(&self, path: &Path) -> AccelResult<RawHandle> {
        let mut state = self.lock()?;
        state.require_initialized()?;
        let config = SolverConfig::load(path).map_err(|e| {
            log::error!("Cannot create config from {}: {}", path.display(), e);
            AccelStatus::BadConfiguration
        })?;
        log::debug!("Loaded solver config {}: {:?}", path.display(), config.solver);
        Ok(state.insert(Object::Config(config)))
    }

    fn create_resources(
        &self,
        config: RawHandle,
        comm: Box<dyn Communicator>,
        device: usize,
    ) -> AccelResult<RawHandle> {
        let mut state = self.lock()?;
        state.require_initialized()?;
        let config = state.config(config)?.clone();
        log::info!(
            "Creating resources on device {} for rank {}/{}",
            device,
            comm.rank(),
            comm.size()
        );
        let handle = state.insert(Object::Resources(Resources {
            comm,
            device,
            config,
        }));
        state.stats.resources_created += 1;
        Ok(handle)
    }

    fn create_matrix(&self, resources: RawHandle, mode: Mode) -> AccelResult<RawHandle> {
        self.create_in(resources, |_| {
            Ok(Object::Matrix(MatrixData {
                resources,
                mode,
                uploaded: false,
                n_global_rows: 0,
                first_row: 0,
                row_offsets: vec![0],
                col_indices: Vec::new(),
                values: Vec::new(),
            }))
        })
    }

    fn create_vector(&self, resources: RawHandle, mode: Mode) -> AccelResult<RawHandle> {
        self.create_in(resources, |_| {
            Ok(Object::Vector(VectorData {
                resources,
                mode,
                data: Vec::new(),
            }))
        })
    }

    fn create_solver(
        &self,
        resources: RawHandle,
        mode: Mode,
        config: RawHandle,
    ) -> AccelResult<RawHandle> {
        self.create_in(resources, |state| {
            let params = state.config(config)?.solver.clone();
            let shared = state.resources(resources)?;
            log::debug!(
                "Creating {} solver on device {} (resources config version {})",
                mode,
                shared.device,
                shared.config.config_version
            );
            Ok(Object::Solver(SolverData {
                resources,
                mode,
                params,
                matrix: None,
                inv_diag: Vec::new(),
                last: None,
            }))
        })
    }

    fn destroy(&self, kind: HandleKind, handle: RawHandle) -> AccelResult<()> {
        let mut state = self.lock()?;
        match state.objects.get(&handle) {
            Some(object) if object.kind() == kind => {}
            _ => return Err(AccelStatus::InvalidHandle),
        }
        if kind == HandleKind::Resources {
            let dependents = state
                .objects
                .values()
                .filter(|object| object.resources() == Some(handle))
                .count();
            if dependents > 0 {
                log::error!(
                    "Resources {} still have {} dependent handles",
                    handle,
                    dependents
                );
                return Err(AccelStatus::BadParameters);
            }
            state.stats.resources_destroyed += 1;
        }
        state.objects.remove(&handle);
        log::trace!("Destroyed {:?} handle {}", kind, handle);
        Ok(())
    }

    fn upload_matrix(
        &self,
        matrix: RawHandle,
        block: CsrView<'_>,
        partition_offsets: &[usize],
    ) -> AccelResult<()> {
        let mut state = self.lock()?;
        let matrix_data = state.matrix(matrix)?;
        let comm = state.resources(matrix_data.resources)?.comm.as_ref();
        let (rank, size) = (comm.rank(), comm.size());

        let partition_ok = partition_offsets.len() == size + 1
            && partition_offsets[0] == 0
            && partition_offsets.windows(2).all(|w| w[0] <= w[1])
            && partition_offsets[size] == block.n_global_rows()
            && partition_offsets[rank + 1] - partition_offsets[rank] == block.n_local_rows();
        if !partition_ok {
            log::error!(
                "Rank {} block of {} rows does not match partition {:?}",
                rank,
                block.n_local_rows(),
                partition_offsets
            );
        }
        agree(comm, partition_ok)?;

        let precision = matrix_data.mode.matrix_precision();
        let first_row = partition_offsets[rank];
        let matrix_data = state.matrix_mut(matrix)?;
        matrix_data.n_global_rows = block.n_global_rows();
        matrix_data.first_row = first_row;
        matrix_data.row_offsets = block.row_offsets().to_vec();
        matrix_data.col_indices = block.col_indices().to_vec();
        matrix_data.values = block
            .values()
            .iter()
            .map(|&v| quantize(v, precision))
            .collect();
        matrix_data.uploaded = true;
        log::debug!(
            "Uploaded matrix {}: rows {}..{} of {}, {} non-zeros",
            matrix,
            first_row,
            first_row + block.n_local_rows(),
            block.n_global_rows(),
            block.n_local_nz()
        );
        Ok(())
    }

    fn replace_coefficients(&self, matrix: RawHandle, values: &[f64]) -> AccelResult<()> {
        let mut state = self.lock()?;
        let matrix_data = state.matrix(matrix)?;
        let comm = state.resources(matrix_data.resources)?.comm.as_ref();
        agree(
            comm,
            matrix_data.uploaded && values.len() == matrix_data.values.len(),
        )?;

        let precision = matrix_data.mode.matrix_precision();
        let matrix_data = state.matrix_mut(matrix)?;
        for (stored, &v) in matrix_data.values.iter_mut().zip(values) {
            *stored = quantize(v, precision);
        }
        Ok(())
    }

    fn upload_vector(&self, vector: RawHandle, matrix: RawHandle, data: &[f64]) -> AccelResult<()> {
        let mut state = self.lock()?;
        let matrix_data = state.matrix(matrix)?;
        let vector_data = state.vector(vector)?;
        if !matrix_data.uploaded || data.len() != matrix_data.n_local_rows() {
            return Err(AccelStatus::BadParameters);
        }
        if vector_data.mode != matrix_data.mode {
            return Err(AccelStatus::BadMode);
        }
        let precision = vector_data.mode.vector_precision();
        state.vector_mut(vector)?.data = data.iter().map(|&v| quantize(v, precision)).collect();
        Ok(())
    }

    fn download_vector(&self, vector: RawHandle, out: &mut [f64]) -> AccelResult<()> {
        let state = self.lock()?;
        let vector_data = state.vector(vector)?;
        if out.len() != vector_data.data.len() {
            return Err(AccelStatus::BadParameters);
        }
        out.copy_from_slice(&vector_data.data);
        Ok(())
    }

    fn setup(&self, solver: RawHandle, matrix: RawHandle) -> AccelResult<()> {
        self.prepare(solver, matrix, true)
    }

    fn resetup(&self, solver: RawHandle, matrix: RawHandle) -> AccelResult<()> {
        self.prepare(solver, matrix, false)
    }

    fn solve(&self, solver: RawHandle, rhs: RawHandle, x: RawHandle) -> AccelResult<()> {
        let mut state = self.lock()?;
        let solver_data = state.solver(solver)?;
        let matrix = solver_data.matrix.ok_or(AccelStatus::BadParameters)?;
        let matrix_data = state.matrix(matrix)?;
        let comm = state.resources(matrix_data.resources)?.comm.as_ref();
        let rhs_data = state.vector(rhs)?;
        let x_data = state.vector(x)?;

        let n_local = matrix_data.n_local_rows();
        let local_ok = rhs_data.data.len() == n_local
            && x_data.data.len() == n_local
            && rhs_data.mode == solver_data.mode
            && x_data.mode == solver_data.mode;
        agree(comm, local_ok)?;

        let (solution, record) = jacobi(
            comm,
            matrix_data,
            &solver_data.inv_diag,
            &rhs_data.data,
            x_data.data.clone(),
            &solver_data.params,
            solver_data.mode.vector_precision(),
        )?;
        match record.status {
            SolveStatus::Success => log::debug!(
                "Solver {} converged in {} iterations",
                solver,
                record.iterations
            ),
            status => log::warn!(
                "Solver {} stopped after {} iterations with {:?}",
                solver,
                record.iterations,
                status
            ),
        }

        state.vector_mut(x)?.data = solution;
        state.solver_mut(solver)?.last = Some(record);
        Ok(())
    }

    fn solve_status(&self, solver: RawHandle) -> AccelResult<SolveStatus> {
        Ok(self.lock()?.last_solve(solver)?.status)
    }

    fn iterations(&self, solver: RawHandle) -> AccelResult<usize> {
        Ok(self.lock()?.last_solve(solver)?.iterations)
    }

    fn residual(&self, solver: RawHandle, iteration: usize) -> AccelResult<f64> {
        let state = self.lock()?;
        state
            .last_solve(solver)?
            .history
            .get(iteration)
            .copied()
            .ok_or(AccelStatus::BadParameters)
    }
}
