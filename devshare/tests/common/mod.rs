#![allow(dead_code)]

use devshare::Runtime;
use devshare_accel::HostAccelerator;
use devshare_core::{CsrPartition, DistributedMatrix, FixedInventory, ThreadComm, Triplet};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

pub const CONVERGING_CONFIG: &str = r#"{
    "config_version": 2,
    "solver": { "max_iters": 1000, "tolerance": 1e-10, "convergence": "ABSOLUTE" }
}"#;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Runs `f` once per endpoint, each on its own thread, and returns the
/// results in rank order.
pub fn run<F, R>(comms: Vec<ThreadComm>, f: F) -> Vec<R>
where
    F: Fn(ThreadComm) -> R + Sync,
    R: Send,
{
    thread::scope(|s| {
        let handles: Vec<_> = comms.into_iter().map(|comm| s.spawn(|| f(comm))).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

pub fn write_config(name: &str, json: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "devshare-{}-{}.json",
        std::process::id(),
        name
    ));
    std::fs::write(&path, json).unwrap();
    path
}

/// A process-private runtime whose accelerator stays inspectable.
pub fn host_runtime(devices: usize) -> (Runtime, Arc<HostAccelerator>) {
    let host = Arc::new(HostAccelerator::new());
    let runtime = Runtime::new(host.clone(), Arc::new(FixedInventory::new(devices)));
    (runtime, host)
}

/// Rows `first_row..first_row + n_local` of tridiag(-1, diag, -1) of size n.
pub fn tridiagonal(first_row: usize, n_local: usize, n: usize, diag: f64) -> CsrPartition {
    let mut triplets = Vec::new();
    for row in first_row..first_row + n_local {
        if row > 0 {
            triplets.push(Triplet::new(row, row - 1, -1.0));
        }
        triplets.push(Triplet::new(row, row, diag));
        if row + 1 < n {
            triplets.push(Triplet::new(row, row + 1, -1.0));
        }
    }
    CsrPartition::from_triplets(first_row, n_local, n, triplets).unwrap()
}

/// Local rows of `A * x` for a globally known `x`.
pub fn local_product(block: &CsrPartition, x: &[f64]) -> Vec<f64> {
    let offsets = block.row_offsets();
    (0..block.n_local_rows())
        .map(|i| {
            (offsets[i]..offsets[i + 1])
                .map(|k| block.values()[k] * x[block.col_indices()[k]])
                .sum()
        })
        .collect()
}

/// Splits `n` rows over `parts` processes at random cut points.
pub fn random_partition(rng: &mut fastrand::Rng, n: usize, parts: usize) -> Vec<usize> {
    let mut cuts: Vec<usize> = (0..parts - 1).map(|_| rng.usize(0..=n)).collect();
    cuts.push(0);
    cuts.push(n);
    cuts.sort_unstable();
    cuts
}

pub fn assert_approx_eq_vec(a: &[f64], b: &[f64], tolerance: f64) {
    assert_eq!(a.len(), b.len(), "Vector lengths differ");
    for i in 0..a.len() {
        let diff = (a[i] - b[i]).abs();
        assert!(
            diff <= tolerance,
            "Verification failed at index {}: expected {}, got {}, diff {}",
            i,
            b[i],
            a[i],
            diff
        );
    }
}
