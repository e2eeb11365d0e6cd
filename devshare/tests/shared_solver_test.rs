mod common;

use common::{
    assert_approx_eq_vec, host_runtime, init_logger, local_product, run, tridiagonal, write_config,
    CONVERGING_CONFIG,
};
use devshare::{Error, Runtime, SharedSolver, SolverState, TrafficStats};
use devshare_accel::{HostAccelerator, SolveStatus};
use devshare_core::comm::RESERVED_TAG_BASE;
use devshare_core::{
    CommExt, Communicator, CoreError, CsrPartition, DeviceBinding, DeviceInventory,
    DistributedMatrix, FixedInventory, ThreadComm, Triplet,
};
use std::sync::Arc;

/// A node whose devices are visible but cannot be made current.
#[derive(Debug)]
struct UnbindableInventory(FixedInventory);

impl DeviceInventory for UnbindableInventory {
    fn device_count(&self) -> devshare_core::error::Result<usize> {
        self.0.device_count()
    }

    fn bind(&self, ordinal: usize) -> devshare_core::error::Result<DeviceBinding> {
        Err(CoreError::Device {
            ordinal,
            message: "device is in an unrecoverable error state".to_string(),
        })
    }
}

fn exact_solution(n: usize) -> Vec<f64> {
    (0..n).map(|i| 1.0 + (i as f64 * 0.3).sin()).collect()
}

#[test]
fn four_processes_share_two_devices() {
    init_logger();
    let config = write_config("four-two", CONVERGING_CONFIG);
    let n = 100;
    let expected = exact_solution(n);

    let results = run(ThreadComm::world(4), |comm| {
        let (runtime, _) = host_runtime(2);
        let first = comm.rank() * 25;
        let a = tridiagonal(first, 25, n, 4.0);
        let b = local_product(&a, &expected);

        let mut solver = SharedSolver::new(runtime);
        solver.initialize(&comm, "dDDI", &config).unwrap();
        solver.set_operator(&a.csr_view().unwrap()).unwrap();
        let plan = solver.plan().unwrap().clone();

        let mut x = vec![0.0; 25];
        solver.solve(&mut x, &b).unwrap();
        let iterations = solver.get_iters().unwrap();
        let residuals: Vec<f64> = (0..=iterations)
            .map(|it| solver.get_residual(it).unwrap())
            .collect();
        let owner = solver.is_gpu_owner();
        let device = solver.device();
        solver.finalize().unwrap();
        (first, x, owner, device, plan, iterations, residuals)
    });

    let owners: Vec<usize> = (0..4).filter(|&r| results[r].2).collect();
    assert_eq!(owners, vec![0, 2]);
    let devices: Vec<Option<usize>> = results.iter().map(|r| r.3).collect();
    assert_eq!(devices, vec![Some(0), Some(0), Some(1), Some(1)]);

    for (first, x, _, _, plan, iterations, residuals) in &results {
        assert_eq!(plan.partition_offsets(), &[0, 50, 100]);
        assert_eq!(plan.n_owned_rows(), 50);
        assert_approx_eq_vec(x, &expected[*first..*first + 25], 1e-8);
        assert_eq!(*iterations, results[0].5);
        assert_eq!(residuals, &results[0].6);
        assert!(residuals.windows(2).all(|w| w[1] < w[0]));
        assert!(residuals[residuals.len() - 1] <= 1e-10);
    }
}

#[test]
fn uneven_row_counts_come_back_in_order() {
    let config = write_config("uneven", CONVERGING_CONFIG);
    let cuts = [0, 7, 7, 19, 30];
    let n = 30;
    let expected = exact_solution(n);

    let results = run(ThreadComm::world(4), |comm| {
        let (runtime, _) = host_runtime(3);
        let rank = comm.rank();
        let a = tridiagonal(cuts[rank], cuts[rank + 1] - cuts[rank], n, 3.0);
        let b = local_product(&a, &expected);
        let mut solver = SharedSolver::new(runtime);
        solver.initialize(&comm, "dDDI", &config).unwrap();
        solver.set_operator(&a.csr_view().unwrap()).unwrap();
        let mut x = vec![0.0; b.len()];
        solver.solve(&mut x, &b).unwrap();
        solver.finalize().unwrap();
        x
    });

    for (rank, x) in results.iter().enumerate() {
        assert_approx_eq_vec(x, &expected[cuts[rank]..cuts[rank + 1]], 1e-8);
    }
}

#[test]
fn instances_share_one_resource_context() {
    let config = write_config("instances", CONVERGING_CONFIG);
    let results = run(ThreadComm::world(4), |comm| {
        let (runtime, host) = host_runtime(2);
        let new_instance = || {
            let mut solver = SharedSolver::new(runtime.clone());
            solver.initialize(&comm, "dDDI", &config).unwrap();
            solver
        };

        let mut first = new_instance();
        let mut second = new_instance();
        let count_with_two = runtime.resources().count().unwrap();
        // Finalize order differs between processes.
        if comm.rank() % 2 == 0 {
            first.finalize().unwrap();
            second.finalize().unwrap();
        } else {
            second.finalize().unwrap();
            first.finalize().unwrap();
        }
        let after_pair = host.stats();

        let mut third = new_instance();
        let mut fourth = new_instance();
        third.finalize().unwrap();
        let mut fifth = new_instance();
        fourth.finalize().unwrap();
        let active_with_one = runtime.resources().is_active().unwrap();
        fifth.finalize().unwrap();

        (
            comm.rank(),
            count_with_two,
            after_pair,
            active_with_one,
            host.stats(),
            runtime.resources().count().unwrap(),
        )
    });

    for (rank, count_with_two, after_pair, active_with_one, stats, count) in results {
        let owner = rank % 2 == 0;
        let cycles = usize::from(owner);
        assert_eq!(count_with_two, 2);
        assert_eq!(after_pair.resources_created, cycles);
        assert_eq!(after_pair.resources_destroyed, cycles);
        assert_eq!(active_with_one, owner);
        assert_eq!(stats.resources_created, 2 * cycles);
        assert_eq!(stats.resources_destroyed, 2 * cycles);
        assert_eq!(stats.library_initializations, stats.library_finalizations);
        assert_eq!(stats.live_handles, 0);
        assert_eq!(count, 0);
    }
}

#[test]
fn dropping_an_instance_releases_its_resources() {
    let config = write_config("drop", CONVERGING_CONFIG);
    let results = run(ThreadComm::world(2), |comm| {
        let (runtime, host) = host_runtime(1);
        {
            let mut solver = SharedSolver::new(runtime.clone());
            solver.initialize(&comm, "dDDI", &config).unwrap();
            let a = tridiagonal(comm.rank() * 3, 3, 6, 4.0);
            solver.set_operator(&a.csr_view().unwrap()).unwrap();
        }
        (comm.rank(), host.stats(), runtime.resources().count().unwrap())
    });
    for (rank, stats, count) in results {
        assert_eq!(count, 0);
        assert_eq!(stats.live_handles, 0);
        assert_eq!(stats.resources_destroyed, usize::from(rank == 0));
    }
}

#[test]
fn finalize_twice_is_an_error() {
    let config = write_config("twice", CONVERGING_CONFIG);
    let comm = ThreadComm::world(1).pop().unwrap();
    let (runtime, _) = host_runtime(1);
    let mut solver = SharedSolver::new(runtime);
    assert!(matches!(solver.finalize(), Err(Error::Lifecycle(_))));
    solver.initialize(&comm, "hDDI", &config).unwrap();
    solver.finalize().unwrap();
    assert_eq!(solver.state(), SolverState::Finalized);
    assert!(matches!(solver.finalize(), Err(Error::Lifecycle(_))));
}

#[test]
fn bad_arguments_leave_the_instance_reusable() {
    let config = write_config("arguments", CONVERGING_CONFIG);
    let missing = std::env::temp_dir().join("devshare-no-such-config.json");
    let results = run(ThreadComm::world(2), |comm| {
        let (runtime, host) = host_runtime(1);
        let mut solver = SharedSolver::new(runtime);

        let bad_mode = solver.initialize(&comm, "dXYZ", &config);
        let after_mode = solver.state();
        let bad_config = solver.initialize(&comm, "dDDI", &missing);
        let after_config = solver.state();
        solver.initialize(&comm, "dDFI", &config).unwrap();
        let mode = solver.mode();
        solver.finalize().unwrap();
        (bad_mode, after_mode, bad_config, after_config, mode, host.stats())
    });
    for (bad_mode, after_mode, bad_config, after_config, mode, stats) in results {
        assert!(matches!(bad_mode, Err(Error::Mode(_))));
        assert_eq!(after_mode, SolverState::Uninitialized);
        assert!(matches!(bad_config, Err(Error::Config(_))));
        assert_eq!(after_config, SolverState::Uninitialized);
        assert_eq!(mode.map(|m| m.as_str()), Some("dDFI"));
        assert_eq!(stats.live_handles, 0);
    }
}

#[test]
fn one_bad_mode_fails_every_process() {
    let config = write_config("one-bad-mode", CONVERGING_CONFIG);
    let results = run(ThreadComm::world(3), |comm| {
        let (runtime, _) = host_runtime(1);
        let mut solver = SharedSolver::new(runtime);
        let mode = if comm.rank() == 1 { "bogus" } else { "dDDI" };
        (solver.initialize(&comm, mode, &config), solver.state())
    });
    for (rank, (result, state)) in results.into_iter().enumerate() {
        match (rank, result) {
            (1, Err(Error::Mode(_))) | (_, Err(Error::PeerFailure(_))) => {}
            (_, other) => panic!("Unexpected initialize result on rank {}: {:?}", rank, other),
        }
        assert_eq!(state, SolverState::Uninitialized);
    }
}

#[test]
fn calls_out_of_order_are_rejected() {
    let config = write_config("order", CONVERGING_CONFIG);
    let comm = ThreadComm::world(1).pop().unwrap();
    let (runtime, _) = host_runtime(1);
    let mut solver = SharedSolver::new(runtime);
    let a = tridiagonal(0, 4, 4, 4.0);
    let view = a.csr_view().unwrap();

    assert!(matches!(solver.set_operator(&view), Err(Error::Lifecycle(_))));
    solver.initialize(&comm, "dDDI", &config).unwrap();
    assert!(matches!(
        solver.initialize(&comm, "dDDI", &config),
        Err(Error::Lifecycle(_))
    ));
    let mut x = vec![0.0; 4];
    assert!(matches!(
        solver.solve(&mut x, &[1.0; 4]),
        Err(Error::Lifecycle(_))
    ));
    assert!(matches!(solver.update_operator(&view), Err(Error::Lifecycle(_))));
    assert!(matches!(solver.get_iters(), Err(Error::Lifecycle(_))));
    assert!(matches!(solver.get_residual(0), Err(Error::Lifecycle(_))));
    // Ordering mistakes do not poison the instance.
    assert_eq!(solver.state(), SolverState::Initialized);

    solver.set_operator(&view).unwrap();
    assert!(matches!(solver.set_operator(&view), Err(Error::Lifecycle(_))));
    solver.solve(&mut x, &[1.0; 4]).unwrap();
    let iterations = solver.get_iters().unwrap();
    assert!(matches!(
        solver.get_residual(iterations + 1),
        Err(Error::InvalidInput(_))
    ));
    solver.finalize().unwrap();
}

#[test]
fn updated_coefficients_change_the_solution() {
    let config = write_config("update", CONVERGING_CONFIG);
    let n = 12;
    let results = run(ThreadComm::world(4), |comm| {
        let (runtime, _) = host_runtime(2);
        let first = comm.rank() * 3;
        let a = tridiagonal(first, 3, n, 4.0);
        let b = vec![1.0; 3];
        let mut solver = SharedSolver::new(runtime);
        solver.initialize(&comm, "dDDI", &config).unwrap();
        solver.set_operator(&a.csr_view().unwrap()).unwrap();
        let mut before = vec![0.0; 3];
        solver.solve(&mut before, &b).unwrap();

        let mut doubled = a.clone();
        doubled.values_mut().iter_mut().for_each(|v| *v *= 2.0);
        solver.update_operator(&doubled.csr_view().unwrap()).unwrap();
        assert_eq!(solver.state(), SolverState::OperatorUpdated);
        let mut after = before.clone();
        solver.solve(&mut after, &b).unwrap();
        solver.finalize().unwrap();
        (before, after)
    });
    for (before, after) in results {
        let halved: Vec<f64> = before.iter().map(|v| v / 2.0).collect();
        assert_approx_eq_vec(&after, &halved, 1e-8);
    }
}

#[test]
fn mismatched_update_fails_the_instance_everywhere() {
    let config = write_config("bad-update", CONVERGING_CONFIG);
    let results = run(ThreadComm::world(2), |comm| {
        let (runtime, host) = host_runtime(1);
        let first = comm.rank() * 4;
        let a = tridiagonal(first, 4, 8, 4.0);
        let mut solver = SharedSolver::new(runtime);
        solver.initialize(&comm, "dDDI", &config).unwrap();
        solver.set_operator(&a.csr_view().unwrap()).unwrap();

        let update = if comm.rank() == 1 {
            let diagonal = (first..first + 4).map(|r| Triplet::new(r, r, 5.0)).collect();
            CsrPartition::from_triplets(first, 4, 8, diagonal).unwrap()
        } else {
            a.clone()
        };
        let result = solver.update_operator(&update.csr_view().unwrap());
        let state = solver.state();
        let mut x = vec![0.0; 4];
        let after = solver.solve(&mut x, &[1.0; 4]);
        solver.finalize().unwrap();
        (result, state, after, host.stats())
    });
    for (result, state, after, stats) in results {
        assert!(matches!(
            result,
            Err(Error::InvalidInput(_)) | Err(Error::PeerFailure(_))
        ));
        assert_eq!(state, SolverState::Failed);
        assert!(matches!(after, Err(Error::Lifecycle(_))));
        assert_eq!(stats.live_handles, 0);
    }
}

#[test]
fn unfinished_solve_reports_status_and_iterate() {
    let json = serde_json::json!({
        "config_version": 2,
        "solver": { "max_iters": 2, "tolerance": 1e-12, "convergence": "ABSOLUTE" }
    });
    let config = write_config("two-iterations", &json.to_string());
    let results = run(ThreadComm::world(3), |comm| {
        let (runtime, _) = host_runtime(1);
        let first = comm.rank() * 5;
        let a = tridiagonal(first, 5, 15, 4.0);
        let mut solver = SharedSolver::new(runtime);
        solver.initialize(&comm, "dDDI", &config).unwrap();
        solver.set_operator(&a.csr_view().unwrap()).unwrap();
        let mut x = vec![0.0; 5];
        let result = solver.solve(&mut x, &[1.0; 5]);
        let iterations = solver.get_iters();
        let state = solver.state();
        solver.finalize().unwrap();
        (result, iterations, state, x)
    });
    for (result, iterations, state, x) in results {
        assert!(matches!(
            result,
            Err(Error::SolveStatus(SolveStatus::NotConverged))
        ));
        assert_eq!(iterations.unwrap(), 2);
        assert_eq!(state, SolverState::Solved);
        assert!(x.iter().all(|&v| v > 0.0));
    }
}

#[test]
fn node_without_devices_fails_initialize() {
    let config = write_config("no-devices", CONVERGING_CONFIG);
    let hosts = ["gpu-node", "gpu-node", "cpu-node"];
    let results = run(ThreadComm::world_on_hosts(&hosts), |comm| {
        let devices = if comm.rank() == 2 { 0 } else { 1 };
        let (runtime, host) = host_runtime(devices);
        let mut solver = SharedSolver::new(runtime);
        let result = solver.initialize(&comm, "dDDI", &config);
        let state = solver.state();
        drop(solver);
        (result, state, host.stats())
    });
    for (result, state, stats) in results {
        assert!(matches!(result, Err(Error::Topology(_))));
        assert_eq!(state, SolverState::Failed);
        assert_eq!(stats.library_initializations, 0);
    }
}

#[test]
fn failed_bind_on_one_owner_fails_every_process() {
    let config = write_config("unbindable", CONVERGING_CONFIG);
    let results = run(ThreadComm::world_on_hosts(&["node-a", "node-b"]), |comm| {
        let host = Arc::new(HostAccelerator::new());
        let inventory: Arc<dyn DeviceInventory> = if comm.rank() == 1 {
            Arc::new(UnbindableInventory(FixedInventory::new(1)))
        } else {
            Arc::new(FixedInventory::new(1))
        };
        let runtime = Runtime::new(host.clone(), inventory);
        let mut solver = SharedSolver::new(runtime.clone());
        let result = solver.initialize(&comm, "dDDI", &config);
        let state = solver.state();
        drop(solver);
        (result, state, host.stats(), runtime.resources().count().unwrap())
    });
    for (rank, (result, state, stats, count)) in results.into_iter().enumerate() {
        match (rank, result) {
            (1, Err(Error::Device(_))) | (0, Err(Error::PeerFailure(_))) => {}
            (_, other) => panic!("Unexpected initialize result on rank {}: {:?}", rank, other),
        }
        assert_eq!(state, SolverState::Failed);
        assert_eq!(stats.library_initializations, 0);
        assert_eq!(count, 0);
    }
}

#[test]
fn initialize_leaves_caller_messages_in_flight() {
    let config = write_config("in-flight", CONVERGING_CONFIG);
    let results = run(ThreadComm::world(2), |comm| {
        let (runtime, _) = host_runtime(1);
        // Caller traffic on the tag the collectives use, received only after
        // initialize.
        if comm.rank() == 0 {
            comm.send(1, RESERVED_TAG_BASE, &[42u8]).unwrap();
        }
        let mut solver = SharedSolver::new(runtime);
        solver.initialize(&comm, "dDDI", &config).unwrap();
        let received = if comm.rank() == 1 {
            comm.recv::<u8>(0, RESERVED_TAG_BASE).unwrap()
        } else {
            vec![]
        };
        solver.finalize().unwrap();
        received
    });
    assert_eq!(results[1], vec![42]);
}

#[test]
fn with_config_creates_an_initialized_instance() {
    let config = write_config("with-config", CONVERGING_CONFIG);
    let results = run(ThreadComm::world(2), |comm| {
        let (runtime, _) = host_runtime(1);
        let mut solver = SharedSolver::with_config(runtime, &comm, "dDDI", &config).unwrap();
        let initialized = (solver.state(), solver.mode().map(|m| m.as_str()));
        solver.finalize().unwrap();

        let (runtime, _) = host_runtime(1);
        let rejected = SharedSolver::with_config(runtime, &comm, "dXYZ", &config).map(|_| ());
        (initialized, rejected)
    });
    for (initialized, rejected) in results {
        assert_eq!(initialized, (SolverState::Initialized, Some("dDDI")));
        assert!(matches!(rejected, Err(Error::Mode(_))));
    }
}

#[test]
fn one_process_per_device_moves_no_data() {
    let config = write_config("pass-through", CONVERGING_CONFIG);
    let n = 9;
    let expected = exact_solution(n);
    let results = run(ThreadComm::world(3), |comm| {
        let (runtime, _) = host_runtime(3);
        let first = comm.rank() * 3;
        let a = tridiagonal(first, 3, n, 4.0);
        let b = local_product(&a, &expected);
        let mut solver = SharedSolver::new(runtime);
        solver.initialize(&comm, "dDDI", &config).unwrap();
        solver.set_operator(&a.csr_view().unwrap()).unwrap();
        let mut x = vec![0.0; 3];
        solver.solve(&mut x, &b).unwrap();
        let traffic = solver.traffic();
        let owner = solver.is_gpu_owner();
        solver.finalize().unwrap();
        (first, x, traffic, owner)
    });
    for (first, x, traffic, owner) in results {
        assert!(owner);
        assert_eq!(traffic, TrafficStats::default());
        assert_approx_eq_vec(&x, &expected[first..first + 3], 1e-8);
    }
}

#[test]
fn members_pay_for_redistribution() {
    let config = write_config("traffic", CONVERGING_CONFIG);
    let results = run(ThreadComm::world(2), |comm| {
        let (runtime, _) = host_runtime(1);
        let a = tridiagonal(comm.rank() * 4, 4, 8, 4.0);
        let mut solver = SharedSolver::new(runtime);
        solver.initialize(&comm, "dDDI", &config).unwrap();
        solver.set_operator(&a.csr_view().unwrap()).unwrap();
        let after_setup = solver.traffic();
        let mut x = vec![0.0; 4];
        solver.solve(&mut x, &[1.0; 4]).unwrap();
        let after_solve = solver.traffic();
        solver.finalize().unwrap();
        (after_setup, after_solve)
    });
    let (member_setup, member_solve) = results[1];
    // Offsets, columns and values.
    assert_eq!(member_setup.messages_sent, 3);
    // Unknowns and rhs out; solution, status header and residual history back.
    assert_eq!(member_solve.messages_sent - member_setup.messages_sent, 2);
    assert_eq!(member_solve.messages_received, 3);
    let (owner_setup, owner_solve) = results[0];
    assert_eq!(owner_setup.messages_received, 3);
    assert_eq!(owner_solve.messages_sent, 3);
}
