use crate::distribution::{DistributionPlan, TrafficStats};
use crate::error::{Error, Result};
use crate::lifecycle::Runtime;
use crate::topology::Topology;
use devshare_accel::{check, Accelerator, HandleKind, Mode, OwnedHandle, RawHandle, SolveStatus};
use devshare_core::{CommExt, Communicator, CsrView, DeviceBinding, DistributedMatrix};
use std::path::Path;
use std::sync::Arc;

/// Lifecycle of one [`SharedSolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    Uninitialized,
    Initialized,
    OperatorSet,
    Solved,
    OperatorUpdated,
    /// A collective step failed; only `finalize` is accepted.
    Failed,
    Finalized,
}

/// Outcome of the most recent solve, identical on every process.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveSummary {
    pub status: SolveStatus,
    pub iterations: usize,
    /// Residual norm per iteration, starting with the initial residual.
    /// Empty when the solver keeps no history.
    pub residuals: Vec<f64>,
}

/// Per-instance accelerator handles, held by device owners only.
struct InstanceHandles {
    solver: OwnedHandle,
    x: OwnedHandle,
    rhs: OwnedHandle,
    matrix: OwnedHandle,
    config: OwnedHandle,
}

impl InstanceHandles {
    fn create(
        accel: &Arc<dyn Accelerator>,
        resources: RawHandle,
        mode: Mode,
        config_path: &Path,
    ) -> Result<Self> {
        let own = |kind: HandleKind, raw: RawHandle| OwnedHandle::new(accel.clone(), kind, raw);
        let config = own(
            HandleKind::Config,
            check(accel.create_config(config_path), "config_create")?,
        );
        let matrix = own(
            HandleKind::Matrix,
            check(accel.create_matrix(resources, mode), "matrix_create")?,
        );
        let rhs = own(
            HandleKind::Vector,
            check(accel.create_vector(resources, mode), "vector_create")?,
        );
        let x = own(
            HandleKind::Vector,
            check(accel.create_vector(resources, mode), "vector_create")?,
        );
        let solver = own(
            HandleKind::Solver,
            check(
                accel.create_solver(resources, mode, config.raw()),
                "solver_create",
            )?,
        );
        Ok(Self {
            solver,
            x,
            rhs,
            matrix,
            config,
        })
    }

    /// Destroys every handle, reporting the first failure.
    fn release(self) -> Result<()> {
        let results = [
            self.solver.release(),
            self.x.release(),
            self.rhs.release(),
            self.matrix.release(),
            self.config.release(),
        ];
        for result in results {
            result?;
        }
        Ok(())
    }
}

/// Collective agreement: every process fails if any process failed.
fn agree<T>(comm: &dyn Communicator, local: Result<T>) -> Result<T> {
    let flags = comm.all_gather_one(local.is_ok() as u8)?;
    let failed: Vec<usize> = flags
        .iter()
        .enumerate()
        .filter(|&(_, &ok)| ok == 0)
        .map(|(rank, _)| rank)
        .collect();
    match local {
        Ok(_) if !failed.is_empty() => Err(Error::PeerFailure(format!(
            "rank(s) {:?} failed this step",
            failed
        ))),
        other => other,
    }
}

/// State that exists between a successful topology build and finalize.
struct Session {
    topology: Topology,
    binding: Option<DeviceBinding>,
    handles: Option<InstanceHandles>,
    plan: Option<DistributionPlan>,
    n_local_nz: usize,
}

impl Session {
    fn plan(&self) -> Result<&DistributionPlan> {
        self.plan
            .as_ref()
            .ok_or_else(|| Error::Lifecycle("no operator has been set".to_string()))
    }

    /// Binds the device, registers with the resource manager and creates the
    /// instance handles on device owners.
    fn claim_device(
        &mut self,
        runtime: &Runtime,
        acquired: &mut bool,
        mode: Mode,
        config_path: &Path,
    ) -> Result<()> {
        let assignment = self.topology.assignment();
        let owned = match (assignment.gpu_owner, assignment.device) {
            (true, Some(device)) => Some(device),
            _ => None,
        };
        let bound = owned
            .map(|device| {
                runtime
                    .inventory()
                    .bind(device)
                    .map_err(|e| Error::Device(e.to_string()))
            })
            .transpose();
        // Acquiring is collective over the owners, so none of them may enter
        // it unless all of them hold a device.
        self.binding = agree(self.topology.global(), bound)?;
        if let (Some(device), Some(binding)) = (owned, &self.binding) {
            log::info!(
                "Rank {} on {} drives device {} ({})",
                self.topology.global().rank(),
                self.topology.host(),
                device,
                binding.name()
            );
        }
        let gpu = match owned {
            Some(device) => {
                let comm = self.topology.gpu().ok_or_else(|| {
                    Error::Topology("device owner has no gpu communicator".to_string())
                })?;
                Some((comm, device))
            }
            None => None,
        };

        let resources = runtime.resources().acquire(config_path, gpu)?;
        *acquired = true;
        if let Some(resources) = resources {
            self.handles = Some(InstanceHandles::create(
                runtime.accelerator(),
                resources,
                mode,
                config_path,
            )?);
        }
        Ok(())
    }

    fn set_operator(
        &mut self,
        accel: &Arc<dyn Accelerator>,
        matrix: &CsrView<'_>,
        traffic: &mut TrafficStats,
    ) -> Result<()> {
        let plan = DistributionPlan::build(
            &self.topology,
            matrix.n_local_rows(),
            matrix.n_global_rows(),
        )?;
        let owned = plan.gather_matrix(&self.topology, matrix, traffic)?;
        let uploaded = match (&self.handles, owned) {
            (Some(handles), Some(block)) => (|| -> Result<()> {
                check(
                    accel.upload_matrix(
                        handles.matrix.raw(),
                        block.csr_view()?,
                        plan.partition_offsets(),
                    ),
                    "matrix_upload_all_global",
                )?;
                check(
                    accel.setup(handles.solver.raw(), handles.matrix.raw()),
                    "solver_setup",
                )?;
                Ok(())
            })(),
            (None, None) => Ok(()),
            _ => Err(Error::Topology(
                "matrix gathered to a process without accelerator handles".to_string(),
            )),
        };
        agree(self.topology.global(), uploaded)?;
        self.n_local_nz = matrix.n_local_nz();
        self.plan = Some(plan);
        Ok(())
    }

    fn update_operator(
        &self,
        accel: &Arc<dyn Accelerator>,
        matrix: &CsrView<'_>,
        traffic: &mut TrafficStats,
    ) -> Result<()> {
        let plan = self.plan()?;
        let sizes = if matrix.n_local_rows() != plan.n_local_rows() {
            Err(Error::InvalidInput(format!(
                "update has {} local rows, operator has {}",
                matrix.n_local_rows(),
                plan.n_local_rows()
            )))
        } else if matrix.n_local_nz() != self.n_local_nz {
            Err(Error::InvalidInput(format!(
                "update has {} local non-zeros, operator has {}",
                matrix.n_local_nz(),
                self.n_local_nz
            )))
        } else {
            Ok(())
        };
        agree(self.topology.global(), sizes)?;

        let values = plan.gather_values(&self.topology, matrix.values(), traffic)?;
        let replaced = match (&self.handles, values) {
            (Some(handles), Some(values)) => (|| -> Result<()> {
                check(
                    accel.replace_coefficients(handles.matrix.raw(), &values),
                    "matrix_replace_coefficients",
                )?;
                check(
                    accel.resetup(handles.solver.raw(), handles.matrix.raw()),
                    "solver_resetup",
                )?;
                Ok(())
            })(),
            (None, None) => Ok(()),
            _ => Err(Error::Topology(
                "values gathered to a process without accelerator handles".to_string(),
            )),
        };
        agree(self.topology.global(), replaced)
    }

    fn owner_solve(
        accel: &Arc<dyn Accelerator>,
        handles: &InstanceHandles,
        binding: Option<&DeviceBinding>,
        x: &[f64],
        rhs: &[f64],
    ) -> Result<(Vec<f64>, SolveSummary)> {
        let matrix = handles.matrix.raw();
        let solver = handles.solver.raw();
        check(accel.upload_vector(handles.x.raw(), matrix, x), "vector_upload")?;
        check(accel.upload_vector(handles.rhs.raw(), matrix, rhs), "vector_upload")?;
        check(
            accel.solve(solver, handles.rhs.raw(), handles.x.raw()),
            "solver_solve",
        )?;
        let mut solution = vec![0.0; x.len()];
        check(
            accel.download_vector(handles.x.raw(), &mut solution),
            "vector_download",
        )?;
        if let Some(binding) = binding {
            binding.synchronize()?;
        }

        let status = check(accel.solve_status(solver), "solver_get_status")?;
        let iterations = check(accel.iterations(solver), "solver_get_iterations_number")?;
        let residuals = (0..=iterations)
            .map_while(|it| accel.residual(solver, it).ok())
            .collect();
        Ok((
            solution,
            SolveSummary {
                status,
                iterations,
                residuals,
            },
        ))
    }

    fn solve(
        &self,
        accel: &Arc<dyn Accelerator>,
        unknowns: &[f64],
        rhs: &[f64],
        traffic: &mut TrafficStats,
    ) -> Result<(Vec<f64>, SolveSummary)> {
        let plan = self.plan()?;
        let topology = &self.topology;
        let lengths = if unknowns.len() == plan.n_local_rows() && rhs.len() == plan.n_local_rows()
        {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "unknowns ({}) and rhs ({}) must both have {} local entries",
                unknowns.len(),
                rhs.len(),
                plan.n_local_rows()
            )))
        };
        agree(topology.global(), lengths)?;

        let x = plan.gather_vector(topology, unknowns, traffic)?;
        let b = plan.gather_vector(topology, rhs, traffic)?;
        let (outcome, gathered_x) = match (&self.handles, x, b) {
            (Some(handles), Some(x), Some(b)) => (
                Some(Self::owner_solve(
                    accel,
                    handles,
                    self.binding.as_ref(),
                    &x,
                    &b,
                )),
                Some(x),
            ),
            (None, None, None) => (None, None),
            _ => {
                return Err(Error::Topology(
                    "vectors gathered to a process without accelerator handles".to_string(),
                ))
            }
        };

        // Owners always hand something back so members never wait forever; a
        // failed owner returns the initial guess and a failure header.
        let (owned, header, history): (Option<&[f64]>, Option<[u64; 3]>, Option<&[f64]>) =
            match (&outcome, &gathered_x) {
                (Some(Ok((solution, summary))), _) => (
                    Some(solution.as_slice()),
                    Some([
                        1,
                        summary.status.code() as u64,
                        summary.iterations as u64,
                    ]),
                    Some(summary.residuals.as_slice()),
                ),
                (Some(Err(_)), Some(x)) => (Some(x.as_slice()), Some([0, 0, 0]), Some(&[][..])),
                _ => (None, None, None),
            };
        let mine = plan.scatter_vector(topology, owned, traffic)?;
        let header = plan.share_from_owner(topology, header.as_ref().map(|h| &h[..]), traffic)?;
        let residuals = plan.share_from_owner(topology, history, traffic)?;

        let local = match outcome {
            Some(Err(err)) => Err(err),
            _ => match header.as_slice() {
                [1, status, iterations] => SolveStatus::from_code(*status as u32)
                    .map(|status| SolveSummary {
                        status,
                        iterations: *iterations as usize,
                        residuals,
                    })
                    .ok_or_else(|| {
                        Error::PeerFailure(format!("unknown solve status code {}", status))
                    }),
                _ => Err(Error::PeerFailure(
                    "device owner failed to solve".to_string(),
                )),
            },
        };
        let summary = agree(topology.global(), local)?;
        Ok((mine, summary))
    }
}

/// A linear solver instance shared by all processes of a communicator.
///
/// Every process calls every method in the same order. Matrix and vector
/// data stay in the caller's row distribution; the instance moves them to
/// the device owners and back.
pub struct SharedSolver {
    runtime: Runtime,
    state: SolverState,
    mode: Option<Mode>,
    session: Option<Session>,
    acquired: bool,
    last_solve: Option<SolveSummary>,
    traffic: TrafficStats,
}

impl std::fmt::Debug for SharedSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSolver")
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("traffic", &self.traffic)
            .finish()
    }
}

impl SharedSolver {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            state: SolverState::Uninitialized,
            mode: None,
            session: None,
            acquired: false,
            last_solve: None,
            traffic: TrafficStats::default(),
        }
    }

    /// Creates an instance and initializes it over `comm` in one call.
    pub fn with_config(
        runtime: Runtime,
        comm: &dyn Communicator,
        mode: &str,
        config_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let mut solver = Self::new(runtime);
        solver.initialize(comm, mode, config_path)?;
        Ok(solver)
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    pub fn topology(&self) -> Option<&Topology> {
        self.session.as_ref().map(|s| &s.topology)
    }

    pub fn plan(&self) -> Option<&DistributionPlan> {
        self.session.as_ref().and_then(|s| s.plan.as_ref())
    }

    pub fn is_gpu_owner(&self) -> bool {
        self.topology().is_some_and(Topology::is_gpu_owner)
    }

    /// The device this process drives work on, if any.
    pub fn device(&self) -> Option<usize> {
        self.topology().and_then(|t| t.assignment().device)
    }

    /// Redistribution traffic of this process since initialize.
    pub fn traffic(&self) -> TrafficStats {
        self.traffic
    }

    pub fn last_solve(&self) -> Option<&SolveSummary> {
        self.last_solve.as_ref()
    }

    fn expect_state(&self, allowed: &[SolverState], operation: &str) -> Result<()> {
        if self.state == SolverState::Failed {
            return Err(Error::Lifecycle(format!(
                "{} called on a failed instance; only finalize is allowed",
                operation
            )));
        }
        if !allowed.contains(&self.state) {
            return Err(Error::Lifecycle(format!(
                "{} called in state {:?}",
                operation, self.state
            )));
        }
        Ok(())
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.poisons() {
                log::error!("Solver instance failed: {}", err);
                self.state = SolverState::Failed;
            }
        }
        result
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::Lifecycle("instance is not initialized".to_string()))
    }

    /// Builds the process topology, binds devices and acquires the shared
    /// accelerator resources. Collective over `comm`.
    pub fn initialize(
        &mut self,
        comm: &dyn Communicator,
        mode: &str,
        config_path: impl AsRef<Path>,
    ) -> Result<()> {
        self.expect_state(&[SolverState::Uninitialized], "initialize")?;
        let config_path = config_path.as_ref();

        let arguments = mode.parse::<Mode>().map_err(Error::from).and_then(|mode| {
            std::fs::File::open(config_path)
                .map(|_| mode)
                .map_err(|e| {
                    Error::Config(format!(
                        "cannot read solver configuration {}: {}",
                        config_path.display(),
                        e
                    ))
                })
        });
        // Library traffic never shares a context with the caller's messages.
        let comm = self.settle(comm.duplicate().map_err(Error::from))?;
        let mode = agree(comm.as_ref(), arguments)?;

        let topology = Topology::build(comm.as_ref(), self.runtime.inventory());
        let result = topology.and_then(|topology| {
            let session = self.session.insert(Session {
                topology,
                binding: None,
                handles: None,
                plan: None,
                n_local_nz: 0,
            });
            let claimed = session.claim_device(&self.runtime, &mut self.acquired, mode, config_path);
            agree(session.topology.global(), claimed)
        });
        if let Err(err) = result {
            log::error!("Solver instance failed: {}", err);
            self.state = SolverState::Failed;
            return Err(err);
        }

        self.mode = Some(mode);
        self.state = SolverState::Initialized;
        log::info!("Solver instance initialized in mode {}", mode);
        Ok(())
    }

    /// Distributes the operator to the device owners and sets the solver up.
    /// Called once, before the first solve. Collective.
    pub fn set_operator(&mut self, matrix: &CsrView<'_>) -> Result<()> {
        self.expect_state(&[SolverState::Initialized], "set_operator")?;
        let accel = self.runtime.accelerator().clone();
        let mut traffic = self.traffic;
        let result = self
            .session_mut()
            .and_then(|session| session.set_operator(&accel, matrix, &mut traffic));
        self.traffic = traffic;
        self.settle(result)?;
        self.state = SolverState::OperatorSet;
        Ok(())
    }

    /// Replaces the operator's values, keeping its sparsity structure.
    /// Collective.
    pub fn update_operator(&mut self, matrix: &CsrView<'_>) -> Result<()> {
        self.expect_state(
            &[
                SolverState::OperatorSet,
                SolverState::Solved,
                SolverState::OperatorUpdated,
            ],
            "update_operator",
        )?;
        let accel = self.runtime.accelerator().clone();
        let mut traffic = self.traffic;
        let result = self
            .session_mut()
            .and_then(|session| session.update_operator(&accel, matrix, &mut traffic));
        self.traffic = traffic;
        self.settle(result)?;
        self.state = SolverState::OperatorUpdated;
        Ok(())
    }

    /// Solves with `unknowns` as the initial guess and overwrites it with the
    /// solution. Collective.
    ///
    /// A solver that stops without success still returns its iterate in
    /// `unknowns`, with [`Error::SolveStatus`] on every process.
    pub fn solve(&mut self, unknowns: &mut [f64], rhs: &[f64]) -> Result<()> {
        self.expect_state(
            &[
                SolverState::OperatorSet,
                SolverState::Solved,
                SolverState::OperatorUpdated,
            ],
            "solve",
        )?;
        let accel = self.runtime.accelerator().clone();
        let mut traffic = self.traffic;
        let result = self
            .session_mut()
            .and_then(|session| session.solve(&accel, unknowns, rhs, &mut traffic));
        self.traffic = traffic;
        let (solution, summary) = self.settle(result)?;

        unknowns.copy_from_slice(&solution);
        let status = summary.status;
        self.last_solve = Some(summary);
        self.state = SolverState::Solved;
        if !status.is_success() {
            log::warn!("Solve finished with status {:?}", status);
            return Err(Error::SolveStatus(status));
        }
        Ok(())
    }

    /// Iterations taken by the most recent solve.
    pub fn get_iters(&self) -> Result<usize> {
        self.last_solve
            .as_ref()
            .map(|summary| summary.iterations)
            .ok_or_else(|| Error::Lifecycle("no solve has completed".to_string()))
    }

    /// Residual norm at `iteration` of the most recent solve.
    pub fn get_residual(&self, iteration: usize) -> Result<f64> {
        let summary = self
            .last_solve
            .as_ref()
            .ok_or_else(|| Error::Lifecycle("no solve has completed".to_string()))?;
        summary.residuals.get(iteration).copied().ok_or_else(|| {
            Error::InvalidInput(format!(
                "no residual recorded for iteration {} ({} recorded)",
                iteration,
                summary.residuals.len()
            ))
        })
    }

    /// Destroys the instance handles and releases the shared resources.
    pub fn finalize(&mut self) -> Result<()> {
        match self.state {
            SolverState::Uninitialized => {
                return Err(Error::Lifecycle(
                    "finalize called before initialize".to_string(),
                ))
            }
            SolverState::Finalized => {
                return Err(Error::Lifecycle("instance already finalized".to_string()))
            }
            _ => {}
        }
        self.state = SolverState::Finalized;

        let handles = self
            .session
            .take()
            .and_then(|session| session.handles)
            .map_or(Ok(()), InstanceHandles::release);
        let released = if std::mem::take(&mut self.acquired) {
            self.runtime.resources().release()
        } else {
            Ok(())
        };
        handles?;
        released?;
        log::info!("Solver instance finalized");
        Ok(())
    }
}

impl Drop for SharedSolver {
    fn drop(&mut self) {
        if matches!(
            self.state,
            SolverState::Uninitialized | SolverState::Finalized
        ) {
            return;
        }
        log::debug!("Finalizing solver instance dropped in state {:?}", self.state);
        if let Err(err) = self.finalize() {
            log::error!("Finalizing dropped solver instance failed: {}", err);
        }
    }
}
