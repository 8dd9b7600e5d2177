// tests/master_cluster.rs

mod common;
use crate::common::builders::registration;
use crate::common::write_file;

use std::time::Duration;

use bytes::Bytes;
use chrono::{Local, TimeZone};
use dagcluster::dag::TaskId;
use dagcluster::errors::ClusterError;
use dagcluster::master::resource_log::ResourceLog;
use dagcluster::master::stdio::{OutputSink, write_forwarded};
use dagcluster::master::summary::utilization;
use dagcluster::master::{Cluster, ClusterSummary, ReadyQueue, RunStats, WorkerStdio};
use dagcluster::protocol::{ForwardedOutput, Registration};
use tempfile::TempDir;

fn two_hosts() -> Vec<(u32, Registration)> {
    vec![
        (3, registration("beta", 8192, 8)),
        (1, registration("alpha", 2048, 2)),
        (2, registration("beta", 8192, 8)),
        (4, registration("alpha", 2048, 2)),
    ]
}

#[test]
fn workers_are_grouped_by_hostname() {
    let cluster = Cluster::from_registrations(&two_hosts(), None).unwrap();

    let hosts: Vec<_> = cluster.hosts().iter().map(|h| (h.name.as_str(), h.slots)).collect();
    assert_eq!(hosts, vec![("beta", 2), ("alpha", 2)]);
    assert_eq!(cluster.worker_count(), 4);
    assert_eq!(cluster.total_cpus(), 10);
    assert_eq!(cluster.free_slot_count(), 4);
    assert_eq!(cluster.busy_slot_count(), 0);
}

#[test]
fn host_rank_zero_is_lowest_global_rank_per_host() {
    let cluster = Cluster::from_registrations(&two_hosts(), None).unwrap();

    let ranks: Vec<_> = cluster
        .slots()
        .iter()
        .map(|s| (s.rank, cluster.host_of(s).name.as_str(), s.host_rank))
        .collect();
    assert_eq!(
        ranks,
        vec![(1, "alpha", 0), (2, "beta", 0), (3, "beta", 1), (4, "alpha", 1)]
    );
}

#[test]
fn missing_rank_is_a_protocol_error() {
    let regs = vec![(1, registration("a", 100, 1)), (3, registration("a", 100, 1))];
    assert!(matches!(
        Cluster::from_registrations(&regs, None),
        Err(ClusterError::Protocol(_))
    ));
}

#[test]
fn satisfiability_needs_one_big_enough_host() {
    let cluster = Cluster::from_registrations(&two_hosts(), None).unwrap();

    assert!(cluster.can_satisfy(8192, 8));
    assert!(cluster.can_satisfy(2048, 2));
    assert!(!cluster.can_satisfy(8193, 1));
    assert!(!cluster.can_satisfy(100, 9));
}

#[test]
fn find_slot_skips_hosts_without_room() {
    let mut cluster = Cluster::from_registrations(&two_hosts(), None).unwrap();

    // Idle slots are scanned in rank order; rank 1 is on the small host.
    assert_eq!(cluster.find_slot(1024, 1), Some(1));
    assert_eq!(cluster.find_slot(4096, 4), Some(2));

    cluster.allocate(2, TaskId::new(0), 6000, 6).unwrap();
    assert_eq!(cluster.find_slot(4096, 4), None);
    assert_eq!(cluster.find_slot(2000, 2), Some(1));
    assert_eq!(cluster.find_slot(2192, 2), Some(3));
}

#[test]
fn allocate_rejects_busy_or_overfull_slots() {
    let mut cluster = Cluster::from_registrations(&two_hosts(), None).unwrap();

    cluster.allocate(1, TaskId::new(0), 2048, 1).unwrap();
    assert!(cluster.allocate(1, TaskId::new(1), 0, 0).is_err());
    assert!(cluster.allocate(4, TaskId::new(1), 1, 0).is_err());
}

#[test]
fn release_returns_the_assignment() {
    let mut cluster = Cluster::from_registrations(&two_hosts(), None).unwrap();

    let binding = cluster.allocate(3, TaskId::new(7), 512, 3).unwrap();
    assert_eq!(binding, vec![0, 1, 2]);
    assert_eq!(cluster.busy_slot_count(), 1);
    assert_eq!(cluster.slot(3).unwrap().running.as_ref().unwrap().task, TaskId::new(7));

    let assignment = cluster.release(3).unwrap();
    assert_eq!(assignment.task, TaskId::new(7));
    assert_eq!(assignment.memory, 512);
    assert_eq!(assignment.binding, binding);
    assert!(cluster.slot(3).unwrap().running.is_none());

    // A result from an idle worker is a protocol violation.
    assert!(matches!(cluster.release(3), Err(ClusterError::Protocol(_))));
    assert!(matches!(cluster.release(9), Err(ClusterError::Protocol(_))));
}

#[test]
fn resource_log_records_every_change() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("wf.resource");
    let log = ResourceLog::open(&path).unwrap();
    let regs = vec![(1, registration("solo", 1000, 4)), (2, registration("solo", 1000, 4))];

    let mut cluster = Cluster::from_registrations(&regs, Some(log)).unwrap();
    cluster.allocate(1, TaskId::new(0), 250, 2).unwrap();
    cluster.release(1).unwrap();
    cluster.flush_log().unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<Vec<&str>> = text
        .lines()
        .map(|l| l.split(',').skip(1).collect())
        .collect();
    assert_eq!(
        rows,
        vec![
            vec!["2", "4", "1000", "solo"],
            vec!["2", "4", "1000", "*"],
            vec!["1", "2", "750", "solo"],
            vec!["1", "2", "750", "*"],
            vec!["2", "4", "1000", "solo"],
            vec!["2", "4", "1000", "*"],
        ]
    );
    for line in text.lines() {
        let ts: f64 = line.split(',').next().unwrap().parse().unwrap();
        assert!(ts > 0.0);
    }
}

#[test]
fn queue_orders_by_priority_then_arrival() {
    let mut queue = ReadyQueue::new();
    queue.push(TaskId::new(0), 0);
    queue.push(TaskId::new(1), 5);
    queue.push(TaskId::new(2), 0);
    queue.push(TaskId::new(3), -1);
    queue.push(TaskId::new(4), 5);

    let order: Vec<usize> = std::iter::from_fn(|| queue.pop())
        .map(|p| p.task.index())
        .collect();
    assert_eq!(order, vec![1, 4, 0, 2, 3]);
    assert!(queue.is_empty());
}

#[test]
fn deferred_entries_keep_their_place() {
    let mut queue = ReadyQueue::new();
    queue.push(TaskId::new(0), 1);
    queue.push(TaskId::new(1), 1);
    queue.push(TaskId::new(2), 1);

    let first = queue.pop().unwrap();
    let second = queue.pop().unwrap();
    assert_eq!(first.task.index(), 0);

    // Something new arrives while the first two are set aside.
    queue.push(TaskId::new(3), 1);
    queue.defer(second);
    queue.defer(first);

    assert_eq!(queue.len(), 4);
    let order: Vec<usize> = std::iter::from_fn(|| queue.pop())
        .map(|p| p.task.index())
        .collect();
    assert_eq!(order, vec![0, 1, 2, 3]);
}

#[test]
fn summary_line_format() {
    let summary = ClusterSummary {
        failed: false,
        stats: RunStats {
            submitted: 5,
            succeeded: 4,
            failed: 1,
            runtime: 12.5,
        },
        start: Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        duration: Duration::from_millis(3250),
        pid: 4242,
        app: "dagcluster".to_string(),
        slots: 4,
        cpus: 16,
    };
    let line = summary.to_string();

    assert!(line.starts_with("[cluster-summary stat=\"ok\", tasks=5, succeeded=4, failed=1, extra=0, start=\"2024-03-01T12:00:00.000"));
    assert!(line.ends_with(
        "duration=3.250, pid=4242, app=\"dagcluster\", runtime=12.500, slots=4, cpus=16]"
    ));

    let failed = ClusterSummary {
        failed: true,
        ..summary
    };
    assert!(failed.to_string().contains("stat=\"failed\""));
}

#[test]
fn stats_and_utilization() {
    let mut stats = RunStats::default();
    stats.record_result(0, 2.0);
    stats.record_result(1, 1.0);
    stats.record_result(-9, 1.0);

    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.runtime, 4.0);

    assert_eq!(utilization(4.0, Duration::from_secs(2), 4), 0.5);
    assert_eq!(utilization(4.0, Duration::from_secs(2), 5), 0.4);
    assert_eq!(utilization(0.0, Duration::from_secs(2), 4), 0.0);
    assert_eq!(utilization(4.0, Duration::ZERO, 4), 0.0);
}

#[test]
fn worker_output_is_merged_and_removed() {
    let dir = TempDir::new().unwrap();
    let dag = dir.path().join("wf.dag");
    let stdio = WorkerStdio::for_dag(&dag, 99);

    assert!(stdio.out_path(2).ends_with("wf.dag.99.out.2"));
    assert!(stdio.err_path(1).ends_with("wf.dag.99.err.1"));

    std::fs::write(stdio.out_path(1), "one\n").unwrap();
    std::fs::write(stdio.out_path(2), "two\n").unwrap();
    std::fs::write(stdio.err_path(2), "oops\n").unwrap();

    let out_path = dir.path().join("out.txt");
    let err_path = dir.path().join("err.txt");
    let mut out = OutputSink::open(Some(&out_path), OutputSink::Stdout).unwrap();
    let mut err = OutputSink::open(Some(&err_path), OutputSink::Stderr).unwrap();

    // Worker 1 never wrote stderr: a warning, not an error.
    stdio.merge(2, &mut out, &mut err).unwrap();

    assert_eq!(std::fs::read_to_string(&out_path).unwrap(), "one\ntwo\n");
    assert_eq!(std::fs::read_to_string(&err_path).unwrap(), "oops\n");
    assert!(!stdio.out_path(1).exists());
    assert!(!stdio.err_path(2).exists());
}

#[test]
fn forwarded_output_is_appended() {
    let dir = TempDir::new().unwrap();
    let dest = write_file(dir.path(), "collected.txt", "existing\n");
    let dest_str = dest.display().to_string();

    write_forwarded(&[
        ForwardedOutput {
            dest: dest_str.clone(),
            data: Bytes::from_static(b"first\n"),
        },
        ForwardedOutput {
            dest: dest_str,
            data: Bytes::from_static(b"second\n"),
        },
    ])
    .unwrap();

    assert_eq!(
        std::fs::read_to_string(&dest).unwrap(),
        "existing\nfirst\nsecond\n"
    );
}
