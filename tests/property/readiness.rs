use std::collections::HashSet;

use proptest::prelude::*;

use dagcluster::dag::Dag;
use dagcluster::engine::{Engine, EngineOptions};

use crate::common::builders::{TaskBuilder, WorkflowBuilder};

/// Random DAGs: task N may only depend on tasks 0..N, so every graph is acyclic.
/// Each task also gets an exit code; non-zero means it fails its only attempt.
fn workflow_strategy(max_tasks: usize) -> impl Strategy<Value = (Dag, Vec<i32>)> {
    (1..=max_tasks).prop_flat_map(|num_tasks| {
        let deps = proptest::collection::vec(
            proptest::collection::vec(any::<usize>(), 0..num_tasks),
            num_tasks,
        );
        let codes = proptest::collection::vec(prop_oneof![4 => Just(0), 1 => Just(1)], num_tasks);

        (deps, codes).prop_map(move |(raw_deps, codes)| {
            let mut builder = WorkflowBuilder::new();
            for i in 0..num_tasks {
                builder = builder.with_task(TaskBuilder::new(&format!("t{i}"), "true"));
            }
            for (i, potential) in raw_deps.into_iter().enumerate() {
                let parents: HashSet<usize> = potential
                    .into_iter()
                    .filter(|_| i > 0)
                    .map(|p| p % i)
                    .collect();
                for p in parents {
                    builder = builder.with_edge(&format!("t{p}"), &format!("t{i}"));
                }
            }
            (builder.build(), codes)
        })
    })
}

fn all_parents_succeeded(dag: &Dag, name: &str) -> bool {
    let id = dag.task_id(name).unwrap();
    dag.parents(id).all(|p| dag.task(p).success)
}

proptest! {
    #[test]
    fn offered_tasks_are_exactly_the_ready_ones((dag, codes) in workflow_strategy(24)) {
        let mut engine = Engine::new(dag, EngineOptions::default(), None);
        let mut offered: HashSet<String> = HashSet::new();

        while engine.has_ready_task() {
            let id = engine.next_ready_task().unwrap();
            let name = engine.dag().task(id).name.clone();

            prop_assert!(all_parents_succeeded(engine.dag(), &name), "{} offered too early", name);
            prop_assert!(offered.insert(name.clone()), "{} offered twice", name);

            let idx: usize = name[1..].parse().unwrap();
            engine.mark_task_finished(id, codes[idx]).unwrap();
        }

        prop_assert!(engine.is_finished());

        // Every task never offered has at least one parent that did not succeed.
        let dag = engine.dag();
        for task in dag.tasks() {
            if !offered.contains(&task.name) {
                prop_assert!(!all_parents_succeeded(dag, &task.name), "{} was ready but never offered", task.name);
            }
        }

        let any_failed = dag.tasks().any(|t| !t.success);
        prop_assert_eq!(engine.is_failed(), any_failed);
        prop_assert_eq!(any_failed, codes.iter().any(|&c| c != 0));
    }

    #[test]
    fn always_failing_task_runs_exactly_tries_times(tries in 1u32..8) {
        let dag = WorkflowBuilder::new()
            .with_task(TaskBuilder::new("flaky", "false").tries(tries))
            .build();
        let mut engine = Engine::new(dag, EngineOptions::default(), None);

        let mut attempts = 0;
        while engine.has_ready_task() {
            let id = engine.next_ready_task().unwrap();
            engine.mark_task_finished(id, 1).unwrap();
            attempts += 1;
        }

        prop_assert_eq!(attempts, tries);
        prop_assert_eq!(engine.dag().get("flaky").unwrap().failures, tries);
        prop_assert!(engine.is_finished());
        prop_assert_eq!(engine.failures(), 1);
    }
}
