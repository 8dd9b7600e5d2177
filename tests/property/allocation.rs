use proptest::prelude::*;

use dagcluster::dag::TaskId;
use dagcluster::master::{Cluster, CpuTopology, Host};
use dagcluster::protocol::Registration;

#[derive(Debug, Clone)]
enum Op {
    Allocate { memory: u32, cpus: u32 },
    Release { pick: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..3000, 0u32..5).prop_map(|(memory, cpus)| Op::Allocate { memory, cpus }),
        any::<usize>().prop_map(|pick| Op::Release { pick }),
    ]
}

fn registrations() -> Vec<(u32, Registration)> {
    let host = |name: &str, memory, cpus| Registration {
        hostname: name.to_string(),
        memory,
        cpus,
        cores: cpus,
        sockets: 1,
    };
    vec![
        (1, host("alpha", 4096, 4)),
        (2, host("alpha", 4096, 4)),
        (3, host("beta", 8192, 8)),
        (4, host("alpha", 4096, 4)),
        (5, host("beta", 8192, 8)),
    ]
}

fn snapshot(host: &Host) -> (u32, u32, u32, Vec<u32>) {
    (
        host.free_memory(),
        host.free_cpus(),
        host.free_slots(),
        host.free_cpu_ids(),
    )
}

proptest! {
    #[test]
    fn allocate_and_release_are_inverses(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let mut cluster = Cluster::from_registrations(&registrations(), None).unwrap();
        let initial: Vec<_> = cluster.hosts().iter().map(snapshot).collect();
        let mut busy: Vec<u32> = Vec::new();
        let mut next_task = 0usize;

        for op in ops {
            match op {
                Op::Allocate { memory, cpus } => {
                    let Some(rank) = cluster.find_slot(memory, cpus) else {
                        continue;
                    };
                    let host_idx = cluster.slot(rank).unwrap().host;
                    let before = snapshot(&cluster.hosts()[host_idx]);
                    prop_assert!(before.0 >= memory && before.1 >= cpus);

                    let binding = cluster
                        .allocate(rank, TaskId::new(next_task), memory, cpus)
                        .unwrap();
                    next_task += 1;
                    prop_assert_eq!(binding.len() as u32, cpus);

                    let after = snapshot(&cluster.hosts()[host_idx]);
                    prop_assert_eq!(after.0, before.0 - memory);
                    prop_assert_eq!(after.1, before.1 - cpus);
                    prop_assert_eq!(after.3.len() as u32, after.1);
                    for cpu in &binding {
                        prop_assert!(before.3.contains(cpu), "cpu {} was already bound", cpu);
                    }
                    busy.push(rank);
                }
                Op::Release { pick } => {
                    if busy.is_empty() {
                        continue;
                    }
                    let rank = busy.remove(pick % busy.len());
                    let host_idx = cluster.slot(rank).unwrap().host;
                    let before = snapshot(&cluster.hosts()[host_idx]);

                    let assignment = cluster.release(rank).unwrap();
                    let after = snapshot(&cluster.hosts()[host_idx]);
                    prop_assert_eq!(after.0, before.0 + assignment.memory);
                    prop_assert_eq!(after.1, before.1 + assignment.cpus);
                    prop_assert_eq!(after.2, before.2 + 1);
                    for cpu in &assignment.binding {
                        prop_assert!(after.3.contains(cpu));
                    }
                }
            }
        }

        for rank in busy {
            cluster.release(rank).unwrap();
        }
        let restored: Vec<_> = cluster.hosts().iter().map(snapshot).collect();
        prop_assert_eq!(restored, initial);
        prop_assert_eq!(cluster.free_slot_count(), 5);
    }
}

#[test]
fn cpu_binding_on_two_socket_host() {
    let mut host = Host::new("node", 8192, CpuTopology::new(8, 4, 2));

    assert!(host.allocate(0, 0).is_empty());
    let two = host.allocate(0, 2);
    let four = host.allocate(0, 4);
    assert_eq!(two, vec![0, 1]);
    assert_eq!(four, vec![2, 3, 4, 5]);
    assert_eq!(host.free_cpu_ids(), vec![6, 7]);

    host.release(0, 4, &four);
    assert_eq!(host.free_cpu_ids(), vec![2, 3, 4, 5, 6, 7]);
    assert_eq!(host.allocate(0, 4), four);
}
