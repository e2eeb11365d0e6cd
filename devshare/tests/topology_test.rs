mod common;

use common::{random_partition, run};
use devshare::{DistributionPlan, Error, Topology, TrafficStats};
use devshare_core::{Communicator, FixedInventory, ThreadComm};

#[test]
fn every_process_gets_a_device_and_every_device_one_owner() {
    for n_procs in 1..=6 {
        for n_devices in 1..=n_procs {
            let results = run(ThreadComm::world(n_procs), |comm| {
                let topology = Topology::build(&comm, &FixedInventory::new(n_devices)).unwrap();
                (
                    topology.assignment(),
                    topology.gpu().map(|gpu| gpu.size()),
                    topology.device_group().size(),
                )
            });
            for (assignment, _, _) in &results {
                assert!(assignment.device.is_some_and(|d| d < n_devices));
            }
            for device in 0..n_devices {
                let owners = results
                    .iter()
                    .filter(|(a, _, _)| a.device == Some(device) && a.gpu_owner)
                    .count();
                assert_eq!(owners, 1, "{} procs / {} devices", n_procs, n_devices);
            }
            // Only owners sit in the gpu-capable communicator, and it holds all of them.
            for (assignment, gpu_size, _) in &results {
                assert_eq!(gpu_size.is_some(), assignment.gpu_owner);
                if let Some(size) = gpu_size {
                    assert_eq!(*size, n_devices);
                }
            }
        }
    }
}

#[test]
fn four_processes_two_devices_owned_by_ranks_zero_and_two() {
    let results = run(ThreadComm::world(4), |comm| {
        let topology = Topology::build(&comm, &FixedInventory::new(2)).unwrap();
        (
            topology.is_gpu_owner(),
            topology.assignment().device,
            topology.owner_of().to_vec(),
            topology.is_pass_through(),
        )
    });
    let owners: Vec<usize> = (0..4).filter(|&r| results[r].0).collect();
    assert_eq!(owners, vec![0, 2]);
    assert_eq!(results[1].1, Some(0));
    assert_eq!(results[3].1, Some(1));
    assert!(results.iter().all(|r| r.2 == vec![0, 0, 2, 2]));
    assert!(results.iter().all(|r| !r.3));
}

#[test]
fn nodes_are_split_by_host_name() {
    let hosts = ["node-a", "node-a", "node-a", "node-b", "node-b"];
    let results = run(ThreadComm::world_on_hosts(&hosts), |comm| {
        let topology = Topology::build(&comm, &FixedInventory::new(2)).unwrap();
        (
            topology.local().size(),
            topology.assignment(),
            topology.owners(),
        )
    });
    let local_sizes: Vec<usize> = results.iter().map(|r| r.0).collect();
    assert_eq!(local_sizes, vec![3, 3, 3, 2, 2]);
    let devices: Vec<Option<usize>> = results.iter().map(|r| r.1.device).collect();
    assert_eq!(devices, vec![Some(0), Some(0), Some(1), Some(0), Some(1)]);
    assert!(results.iter().all(|r| r.2 == vec![0, 2, 3, 4]));
}

#[test]
fn node_without_devices_is_rejected_everywhere() {
    let hosts = ["gpu-node", "gpu-node", "cpu-node"];
    let results = run(ThreadComm::world_on_hosts(&hosts), |comm| {
        let devices = if comm.processor_name().unwrap() == "cpu-node" { 0 } else { 1 };
        Topology::build(&comm, &FixedInventory::new(devices)).map(|_| ())
    });
    for result in results {
        match result {
            Err(Error::Topology(message)) => assert!(message.contains("cpu-node")),
            other => panic!("Expected a topology error, got {:?}", other),
        }
    }
}

#[test]
fn interleaved_device_groups_are_rejected() {
    // Ranks 0 and 2 share node-a's only device but hold non-adjacent rows.
    let hosts = ["node-a", "node-b", "node-a", "node-b"];
    let results = run(ThreadComm::world_on_hosts(&hosts), |comm| {
        let topology = Topology::build(&comm, &FixedInventory::new(1)).unwrap();
        DistributionPlan::build(&topology, 5, 20).map(|_| ())
    });
    assert!(results
        .iter()
        .all(|r| matches!(r, Err(Error::Topology(_)))));
}

#[test]
fn inconsistent_row_counts_are_rejected() {
    let results = run(ThreadComm::world(2), |comm| {
        let topology = Topology::build(&comm, &FixedInventory::new(1)).unwrap();
        DistributionPlan::build(&topology, 5, 12).map(|_| ())
    });
    assert!(results
        .iter()
        .all(|r| matches!(r, Err(Error::InvalidInput(_)))));
}

#[test]
fn scatter_inverts_gather_for_random_partitions() {
    let mut rng = fastrand::Rng::with_seed(7);
    for _ in 0..10 {
        let n = rng.usize(1..60);
        let n_procs = rng.usize(1..=6);
        let n_devices = rng.usize(1..=n_procs);
        let cuts = random_partition(&mut rng, n, n_procs);

        let results = run(ThreadComm::world(n_procs), |comm| {
            let rank = comm.rank();
            let local: Vec<f64> = (cuts[rank]..cuts[rank + 1]).map(|i| i as f64 * 1.5).collect();
            let topology = Topology::build(&comm, &FixedInventory::new(n_devices)).unwrap();
            let plan = DistributionPlan::build(&topology, local.len(), n).unwrap();
            let mut traffic = TrafficStats::default();
            let owned = plan.gather_vector(&topology, &local, &mut traffic).unwrap();
            let back = plan
                .scatter_vector(&topology, owned.as_deref(), &mut traffic)
                .unwrap();
            let owned_range = topology.is_gpu_owner().then(|| {
                let g = topology.owners().iter().position(|&o| o == rank).unwrap();
                (plan.partition_offsets()[g], plan.partition_offsets()[g + 1])
            });
            (local, back, owned, owned_range)
        });

        for (local, back, owned, owned_range) in results {
            assert_eq!(back, local);
            // Owners hold exactly their contiguous slice of the global vector.
            if let (Some(owned), Some((start, end))) = (owned, owned_range) {
                let expected: Vec<f64> = (start..end).map(|i| i as f64 * 1.5).collect();
                assert_eq!(owned, expected);
            }
        }
    }
}

#[test]
fn one_process_per_device_moves_nothing() {
    let cuts = [0, 3, 3, 10];
    let results = run(ThreadComm::world(3), |comm| {
        let rank = comm.rank();
        let local: Vec<f64> = (cuts[rank]..cuts[rank + 1]).map(|i| i as f64).collect();
        let topology = Topology::build(&comm, &FixedInventory::new(3)).unwrap();
        let plan = DistributionPlan::build(&topology, local.len(), 10).unwrap();
        let mut traffic = TrafficStats::default();
        let owned = plan.gather_vector(&topology, &local, &mut traffic).unwrap();
        let back = plan
            .scatter_vector(&topology, owned.as_deref(), &mut traffic)
            .unwrap();
        (plan.is_pass_through(), owned == Some(local.clone()), back == local, traffic)
    });
    for (pass_through, owned_same, back_same, traffic) in results {
        assert!(pass_through);
        assert!(owned_same);
        assert!(back_same);
        assert_eq!(traffic, TrafficStats::default());
    }
}

#[test]
fn members_send_one_message_per_vector() {
    let results = run(ThreadComm::world(4), |comm| {
        let topology = Topology::build(&comm, &FixedInventory::new(2)).unwrap();
        let plan = DistributionPlan::build(&topology, 25, 100).unwrap();
        let mut traffic = TrafficStats::default();
        let local = vec![comm.rank() as f64; 25];
        let owned = plan.gather_vector(&topology, &local, &mut traffic).unwrap();
        plan.scatter_vector(&topology, owned.as_deref(), &mut traffic)
            .unwrap();
        (plan.n_owned_rows(), traffic)
    });
    for (owned_rows, traffic) in results {
        assert_eq!(owned_rows, 50);
        assert_eq!(traffic.messages_sent, 1);
        assert_eq!(traffic.messages_received, 1);
        assert_eq!(traffic.bytes_sent, 25 * 8);
        assert_eq!(traffic.bytes_received, 25 * 8);
    }
}
