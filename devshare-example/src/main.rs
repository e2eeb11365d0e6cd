use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use devshare::{human_size, Runtime, SharedSolver, TrafficStats};
use devshare_accel::{Convergence, HostAccelerator, SolverConfig};
use devshare_core::{
    Communicator, CsrPartition, DistributedMatrix, FixedInventory, ThreadComm, Triplet,
    WgpuInventory,
};

const PROCESSES: usize = 4;
const DEVICES_PER_NODE: usize = 2;
const ROWS: usize = 400;
const STEPS: usize = 6;

struct RankReport {
    rank: usize,
    device: Option<usize>,
    owner: bool,
    heat: f64,
    traffic: TrafficStats,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .filter_module("wgpu", log::LevelFilter::Off)
        .filter_module("naga", log::LevelFilter::Off)
        .init();

    let mut config = SolverConfig::default();
    config.solver.tolerance = 1e-9;
    config.solver.convergence = Convergence::RelativeIni;
    let config_path = std::env::temp_dir().join("devshare-heat-solver.json");
    std::fs::write(&config_path, config.to_json()?)?;

    // `--wgpu` binds the GPU adapters of this machine instead of simulated devices.
    let use_wgpu = std::env::args().any(|arg| arg == "--wgpu");

    println!(
        "Implicit heat equation on {} cells, {} processes sharing {} devices",
        ROWS,
        PROCESSES,
        if use_wgpu { "the GPU".to_string() } else { DEVICES_PER_NODE.to_string() }
    );
    let start_time = std::time::Instant::now();
    let reports = thread::scope(|s| {
        let handles: Vec<_> = ThreadComm::world(PROCESSES)
            .into_iter()
            .map(|comm| {
                let config_path = config_path.as_path();
                s.spawn(move || run_rank(comm, config_path, runtime(use_wgpu)))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| "solver thread panicked"))
            .collect::<Result<Vec<_>, _>>()
    })?;
    println!("Elapsed time: {:?}", start_time.elapsed());

    let mut total_heat = 0.0;
    for report in reports {
        let report = report?;
        println!(
            "rank {}: device {:?}{}, heat {:.6}, sent {} in {} messages",
            report.rank,
            report.device,
            if report.owner { " (owner)" } else { "" },
            report.heat,
            human_size(report.traffic.bytes_sent),
            report.traffic.messages_sent
        );
        total_heat += report.heat;
    }
    println!("Total heat after {} steps: {:.6}", STEPS, total_heat);
    Ok(())
}

/// Rows of `I + r * L` where `L` is the 1D Laplacian with insulated ends.
fn heat_operator(first_row: usize, n_local: usize, r: f64) -> devshare_core::Result<CsrPartition> {
    let mut triplets = Vec::with_capacity(3 * n_local);
    for row in first_row..first_row + n_local {
        let mut diagonal = 1.0;
        if row > 0 {
            triplets.push(Triplet::new(row, row - 1, -r));
            diagonal += r;
        }
        if row + 1 < ROWS {
            triplets.push(Triplet::new(row, row + 1, -r));
            diagonal += r;
        }
        triplets.push(Triplet::new(row, row, diagonal));
    }
    CsrPartition::from_triplets(first_row, n_local, ROWS, triplets)
}

/// One runtime per simulated process, as each real process would have.
fn runtime(use_wgpu: bool) -> Runtime {
    if use_wgpu {
        Runtime::new(
            Arc::new(HostAccelerator::new()),
            Arc::new(WgpuInventory::default()),
        )
    } else {
        Runtime::new(
            Arc::new(HostAccelerator::new()),
            Arc::new(FixedInventory::new(DEVICES_PER_NODE)),
        )
    }
}

fn run_rank(
    comm: ThreadComm,
    config_path: &Path,
    runtime: Runtime,
) -> devshare::Result<RankReport> {
    let rank = comm.rank();
    let size = comm.size();
    let n_local = ROWS / size + usize::from(rank < ROWS % size);
    let first_row = (0..rank)
        .map(|r| ROWS / size + usize::from(r < ROWS % size))
        .sum::<usize>();

    let mut solver = SharedSolver::new(runtime);
    solver.initialize(&comm, "dDDI", config_path)?;
    solver.set_operator(&heat_operator(first_row, n_local, 1.0)?.csr_view()?)?;

    let hot = ROWS / 2 - 10..ROWS / 2 + 10;
    let mut u: Vec<f64> = (first_row..first_row + n_local)
        .map(|i| if hot.contains(&i) { 100.0 } else { 0.0 })
        .collect();

    for step in 0..STEPS {
        if step == STEPS / 2 {
            // Larger time step, same stencil.
            solver.update_operator(&heat_operator(first_row, n_local, 4.0)?.csr_view()?)?;
        }
        let previous = u.clone();
        solver.solve(&mut u, &previous)?;
        if rank == 0 {
            let iterations = solver.get_iters()?;
            log::info!(
                "step {}: {} iterations, final residual {:e}",
                step,
                iterations,
                solver.get_residual(iterations)?
            );
        }
    }

    let report = RankReport {
        rank,
        device: solver.device(),
        owner: solver.is_gpu_owner(),
        heat: u.iter().sum(),
        traffic: solver.traffic(),
    };
    solver.finalize()?;
    Ok(report)
}
