// tests/master_runtime.rs

mod common;
use crate::common::builders::{TaskBuilder, WorkflowBuilder, diamond, registration};
use crate::common::{engine, init_tracing, with_timeout};

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dagcluster::engine::{Engine, EngineOptions, RescueLog};
use dagcluster::errors::{ClusterError, Result};
use dagcluster::master::{Master, MasterOptions, RunReport, WorkerStdio};
use dagcluster::protocol::{Channel, Registration, local};
use dagcluster::worker::{Worker, WorkerOptions};
use dagcluster_test_utils::fake_worker::{Dispatch, DispatchLog, ExitScript, FakeWorker, script};
use futures::future::join_all;
use tempfile::TempDir;

/// A master plus in-process fake workers.
struct Harness {
    dir: TempDir,
    workers: Vec<Registration>,
    options: MasterOptions,
    script: ExitScript,
    delay: Duration,
    barrier: bool,
}

struct Outcome {
    report: Result<RunReport>,
    dispatches: Vec<Dispatch>,
}

impl Outcome {
    fn report(&self) -> &RunReport {
        self.report.as_ref().expect("master run failed")
    }

    fn names(&self) -> Vec<&str> {
        self.dispatches
            .iter()
            .map(|d| d.command.name.as_str())
            .collect()
    }
}

impl Harness {
    fn new(workers: Vec<Registration>) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let options = MasterOptions {
            program: "dagcluster".to_string(),
            stdout: Some(dir.path().join("tasks.out")),
            stderr: Some(dir.path().join("tasks.err")),
            ..Default::default()
        };
        Self {
            dir,
            workers,
            options,
            script: script(Vec::new()),
            delay: Duration::from_millis(5),
            barrier: false,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn stdout(&self) -> String {
        std::fs::read_to_string(self.path("tasks.out")).unwrap()
    }

    async fn run(&self, engine: Engine) -> Outcome {
        let (master_end, worker_ends) = local::network(self.workers.len() as u32);
        let log: DispatchLog = Arc::new(Mutex::new(Vec::new()));

        let fakes = worker_ends
            .into_iter()
            .zip(self.workers.iter().cloned())
            .map(|(channel, reg)| {
                let mut fake = FakeWorker::new(channel, reg, log.clone())
                    .with_script(self.script.clone())
                    .with_delay(self.delay);
                if self.barrier {
                    fake = fake.with_barrier();
                }
                fake.run()
            });

        let master = Master::new(
            master_end,
            self.workers.len() as u32,
            engine,
            self.options.clone(),
        )
        .unwrap();

        let (report, _workers) = with_timeout(async {
            tokio::join!(master.run(), join_all(fakes))
        })
        .await;

        let dispatches = log.lock().unwrap().clone();
        Outcome { report, dispatches }
    }
}

fn single_host(workers: usize, memory: u32, cpus: u32) -> Vec<Registration> {
    vec![registration("node", memory, cpus); workers]
}

#[tokio::test]
async fn diamond_completes_and_writes_summary() {
    let h = Harness::new(single_host(2, 1000, 4));
    let out = h.run(diamond().build_engine()).await;

    let report = out.report();
    assert!(!report.failed);
    assert!(!report.aborted);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.stats.submitted, 4);
    assert_eq!(report.stats.succeeded, 4);
    assert_eq!(report.stats.failed, 0);

    let names = out.names();
    assert_eq!(names.first(), Some(&"A"));
    assert_eq!(names.last(), Some(&"D"));
    assert_eq!(
        names[1..3].iter().copied().collect::<BTreeSet<_>>(),
        BTreeSet::from(["B", "C"])
    );

    let stdout = h.stdout();
    let summary = stdout.lines().last().unwrap();
    assert!(summary.starts_with(
        "[cluster-summary stat=\"ok\", tasks=4, succeeded=4, failed=0, extra=0, start=\""
    ));
    assert!(summary.contains("app=\"dagcluster\""));
    assert!(summary.ends_with("slots=2, cpus=4]"));
}

trait BuildEngine {
    fn build_engine(self) -> Engine;
}

impl BuildEngine for WorkflowBuilder {
    fn build_engine(self) -> Engine {
        engine(&self.text(), EngineOptions::default())
    }
}

#[tokio::test]
async fn single_worker_runs_by_priority() {
    let h = Harness::new(single_host(1, 1000, 4));
    let wf = WorkflowBuilder::new()
        .with_task(TaskBuilder::new("low", "true").priority(-1))
        .with_task(TaskBuilder::new("plain", "true"))
        .with_task(TaskBuilder::new("high", "true").priority(10))
        .with_task(TaskBuilder::new("mid", "true").priority(5))
        .with_task(TaskBuilder::new("plain2", "true"));

    let out = h.run(wf.build_engine()).await;
    assert_eq!(out.names(), vec!["high", "mid", "plain", "plain2", "low"]);
}

#[tokio::test]
async fn failed_attempts_are_retried() {
    let mut h = Harness::new(single_host(1, 1000, 4));
    h.script = script(vec![("flaky", vec![1, -9])]);
    let wf = WorkflowBuilder::new()
        .with_task(TaskBuilder::new("flaky", "true").tries(3))
        .with_task(TaskBuilder::new("after", "true"))
        .with_edge("flaky", "after");

    let out = h.run(wf.build_engine()).await;
    let report = out.report();

    assert_eq!(out.names(), vec!["flaky", "flaky", "flaky", "after"]);
    assert!(!report.failed);
    assert_eq!(report.stats.submitted, 4);
    assert_eq!(report.stats.failed, 2);
    assert_eq!(report.stats.succeeded, 2);
}

#[tokio::test]
async fn permanent_failure_fails_the_run() {
    let mut h = Harness::new(single_host(2, 1000, 4));
    h.script = script(vec![("B", vec![3, 3])]);

    let out = h
        .run(engine(
            &diamond().text(),
            EngineOptions {
                max_failures: 0,
                tries: 2,
            },
        ))
        .await;
    let report = out.report();

    assert!(report.failed);
    assert!(!report.aborted);
    assert_eq!(report.exit_code(), 1);
    assert!(!out.names().contains(&"D"));
    assert_eq!(out.names().iter().filter(|n| **n == "B").count(), 2);
    assert!(h.stdout().contains("[cluster-summary stat=\"failed\""));
}

#[tokio::test]
async fn max_failures_stops_releasing_work() {
    let mut h = Harness::new(single_host(1, 1000, 4));
    h.script = script(vec![("first", vec![1])]);
    let wf = WorkflowBuilder::new()
        .with_task(TaskBuilder::new("first", "true").priority(10))
        .with_task(TaskBuilder::new("second", "true"))
        .with_task(TaskBuilder::new("third", "true"))
        .with_edge("second", "third");

    let out = h
        .run(engine(
            &wf.text(),
            EngineOptions {
                max_failures: 1,
                tries: 1,
            },
        ))
        .await;

    // `second` was already pending when the limit was hit; its child is
    // never released.
    assert_eq!(out.names(), vec!["first", "second"]);
    assert!(out.report().failed);
}

#[tokio::test]
async fn unsatisfiable_task_is_rejected_before_scheduling() {
    let h = Harness::new(vec![registration("small", 1000, 2), registration("wide", 100, 8)]);
    let wf = WorkflowBuilder::new()
        .with_task(TaskBuilder::new("ok", "true"))
        .with_task(TaskBuilder::new("huge", "true").memory(1000).cpus(4));

    let out = h.run(wf.build_engine()).await;
    match out.report {
        Err(ClusterError::Unsatisfiable { task, memory, cpus }) => {
            assert_eq!((task.as_str(), memory, cpus), ("huge", 1000, 4));
        }
        other => panic!("Expected Unsatisfiable, got: {:?}", other),
    }
    assert!(out.dispatches.is_empty());
}

#[tokio::test]
async fn tasks_wait_for_memory_on_their_host() {
    let mut h = Harness::new(single_host(2, 1000, 4));
    h.delay = Duration::from_millis(50);
    let wf = WorkflowBuilder::new()
        .with_task(TaskBuilder::new("big1", "true").memory(800).priority(10))
        .with_task(TaskBuilder::new("big2", "true").memory(800).priority(5))
        .with_task(TaskBuilder::new("small", "true").memory(100));

    let out = h.run(wf.build_engine()).await;
    // big2 does not fit next to big1, so small overtakes it.
    assert_eq!(out.names(), vec!["big1", "small", "big2"]);
    assert!(!out.report().failed);
}

#[tokio::test]
async fn host_script_barrier_precedes_scheduling() {
    let mut h = Harness::new(single_host(3, 1000, 4));
    h.options.host_script = true;
    h.barrier = true;

    let out = h.run(diamond().build_engine()).await;
    assert!(!out.report().failed);
    assert_eq!(out.dispatches.len(), 4);
}

#[tokio::test]
async fn forwarded_output_lands_on_the_master() {
    let h = Harness::new(single_host(1, 1000, 4));
    let dest = h.path("prov.txt");
    let wf = WorkflowBuilder::new()
        .with_task(
            TaskBuilder::new("one", "true").pipe_forward("PROV", &dest.display().to_string()),
        )
        .with_task(
            TaskBuilder::new("two", "true").pipe_forward("PROV", &dest.display().to_string()),
        )
        .with_edge("one", "two");

    let out = h.run(wf.build_engine()).await;
    assert!(!out.report().failed);
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "one\ntwo\n");
}

#[tokio::test]
async fn affinity_is_sent_only_when_requested() {
    let wf = || {
        WorkflowBuilder::new()
            .with_task(TaskBuilder::new("pair", "true").cpus(2))
            .with_task(TaskBuilder::new("triple", "true").cpus(3))
            .with_edge("pair", "triple")
    };

    let mut h = Harness::new(single_host(1, 1000, 4));
    h.options.set_affinity = true;
    let out = h.run(wf().build_engine()).await;
    let bindings: Vec<_> = out.dispatches.iter().map(|d| d.command.affinity.clone()).collect();
    assert_eq!(bindings, vec![vec![0, 1], vec![0, 1, 2]]);

    let h = Harness::new(single_host(1, 1000, 4));
    let out = h.run(wf().build_engine()).await;
    assert!(out.dispatches.iter().all(|d| d.command.affinity.is_empty()));
}

#[tokio::test]
async fn host_ranks_count_per_host() {
    let mut h = Harness::new(vec![
        registration("h1", 1000, 2),
        registration("h2", 1000, 2),
        registration("h1", 1000, 2),
    ]);
    h.delay = Duration::from_millis(50);
    let wf = WorkflowBuilder::new()
        .with_task(TaskBuilder::new("a", "true"))
        .with_task(TaskBuilder::new("b", "true"))
        .with_task(TaskBuilder::new("c", "true"));

    let out = h.run(wf.build_engine()).await;
    let ranks: BTreeSet<(u32, u32)> = out.dispatches.iter().map(|d| (d.rank, d.host_rank)).collect();
    assert_eq!(ranks, BTreeSet::from([(1, 0), (2, 0), (3, 1)]));
}

#[tokio::test]
async fn raised_abort_flag_stops_the_run() {
    let h = Harness::new(single_host(2, 1000, 4));
    let (master_end, worker_ends) = local::network(2);
    let log: DispatchLog = Arc::new(Mutex::new(Vec::new()));
    let fakes = worker_ends
        .into_iter()
        .zip(h.workers.iter().cloned())
        .map(|(channel, reg)| FakeWorker::new(channel, reg, log.clone()).run());

    let master = Master::new(master_end, 2, diamond().build_engine(), h.options.clone()).unwrap();
    master.abort_flag().raise();

    let (report, workers) =
        with_timeout(async { tokio::join!(master.run(), join_all(fakes)) }).await;
    let report = report.unwrap();

    assert!(report.aborted);
    assert!(report.failed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.stats.submitted, 0);
    assert!(log.lock().unwrap().is_empty());
    // Every worker still got a clean shutdown.
    for ran in workers {
        assert_eq!(ran.unwrap(), 0);
    }
}

#[tokio::test]
async fn successes_reach_the_rescue_log() {
    let h = Harness::new(single_host(2, 1000, 4));
    let rescue = h.path("wf.dag.rescue");
    let dag = diamond().build();
    let log = RescueLog::open(&rescue, None, &dag).unwrap();
    let engine = Engine::new(dag, EngineOptions::default(), Some(log));

    let out = h.run(engine).await;
    assert!(!out.report().failed);

    let text = std::fs::read_to_string(&rescue).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "DONE A");
    assert_eq!(lines[3], "DONE D");
}

#[tokio::test]
async fn resource_log_tracks_the_run() {
    let mut h = Harness::new(single_host(2, 1000, 4));
    let path = h.path("wf.dag.resource");
    h.options.resource_log = Some(path.clone());

    let out = h.run(diamond().build_engine()).await;
    assert!(!out.report().failed);

    let text = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<&str> = text.lines().collect();
    // Initial host and total rows, then two per allocation and release.
    assert_eq!(rows.len(), 2 + 4 * 2 * 2);
    assert!(rows[0].ends_with(",2,4,1000,node"));
    assert!(rows.last().unwrap().ends_with(",2,4,1000,*"));
}

#[test]
fn master_needs_workers() {
    let (master_end, _) = local::network(0);
    let result = Master::new(master_end, 0, diamond().build_engine(), MasterOptions::default());
    assert!(matches!(result, Err(ClusterError::ConfigError(_))));
}

#[tokio::test]
async fn real_workers_run_a_workflow() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let stdio = WorkerStdio::for_dag(&dir.path().join("wf.dag"), 1);
    let wf = WorkflowBuilder::new()
        .with_annotation("ID0001", "say", "A")
        .with_task(TaskBuilder::new("A", "echo alpha"))
        .with_task(TaskBuilder::new("B", "sh -c 'echo beta >&2'"))
        .with_task(TaskBuilder::new("C", "echo gamma"))
        .with_task(TaskBuilder::new("D", "sh -c 'exit 0'"))
        .with_edge("A", "B")
        .with_edge("A", "C")
        .with_edge("B", "D")
        .with_edge("C", "D");

    let options = MasterOptions {
        program: "dagcluster".to_string(),
        stdout: Some(dir.path().join("tasks.out")),
        stderr: Some(dir.path().join("tasks.err")),
        worker_stdio: Some(stdio.clone()),
        ..Default::default()
    };

    let (master_end, worker_ends) = local::network(2);
    let workers = worker_ends.into_iter().map(|channel| {
        let rank = channel.rank();
        let options = WorkerOptions {
            task_stdout: Some(stdio.out_path(rank)),
            task_stderr: Some(stdio.err_path(rank)),
            ..Default::default()
        };
        Worker::new(channel, options)
            .with_registration(registration("local", 1000, 2))
            .run()
    });
    let master = Master::new(master_end, 2, wf.build_engine(), options).unwrap();

    let (report, workers) =
        with_timeout(async { tokio::join!(master.run(), join_all(workers)) }).await;
    let report = report.unwrap();
    for worker in workers {
        worker.unwrap();
    }
    assert!(!report.failed);
    assert_eq!(report.stats.succeeded, 4);

    let stdout = std::fs::read_to_string(dir.path().join("tasks.out")).unwrap();
    assert!(stdout.lines().any(|l| l == "alpha"));
    assert!(stdout.lines().any(|l| l == "gamma"));

    let records: Vec<&str> = stdout
        .lines()
        .filter(|l| l.starts_with("[cluster-task "))
        .collect();
    assert_eq!(records.len(), 4);
    let a = records
        .iter()
        .find(|l| l.contains("name=A,"))
        .expect("no record for A");
    assert!(a.starts_with("[cluster-task id=ID0001, name=A, start=\""));
    assert!(a.contains("status=0, app=\"echo\", hostname=\"local\""));
    assert!(a.ends_with("cpus=1, memory=0]"));
    assert!(stdout.lines().last().unwrap().starts_with("[cluster-summary stat=\"ok\""));

    let stderr = std::fs::read_to_string(dir.path().join("tasks.err")).unwrap();
    assert_eq!(stderr, "beta\n");

    for rank in 1..=2 {
        assert!(!stdio.out_path(rank).exists());
        assert!(!stdio.err_path(rank).exists());
    }
}
