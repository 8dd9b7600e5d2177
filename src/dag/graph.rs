// src/dag/graph.rs

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, info};

use crate::dag::parser::{Workflow, parse_workflow};
use crate::dag::rescue;
use crate::dag::task::Task;
use crate::errors::{ClusterError, Result};

/// Index of a task inside its [`Dag`].
pub type TaskId = NodeIndex;

/// How to load a workflow from disk.
#[derive(Debug, Clone, Default)]
pub struct DagOptions {
    /// Take an exclusive advisory lock on the workflow file.
    pub lock: bool,
    /// Rescue file to replay after the graph is built.
    pub rescue: Option<PathBuf>,
}

/// The workflow: an arena of tasks plus the dependency edges between them.
///
/// Edges point from parent to child. The topology is fixed once built; only
/// [`Task::success`] and [`Task::failures`] change afterwards.
#[derive(Debug)]
pub struct Dag {
    graph: DiGraph<Task, ()>,
    by_name: HashMap<String, TaskId>,
    /// Held for the lifetime of the DAG; dropping the file releases the lock.
    lock: Option<File>,
}

impl Dag {
    /// Read, lock and build a workflow file, then replay the rescue file.
    pub fn load(path: impl AsRef<Path>, options: &DagOptions) -> Result<Self> {
        let path = path.as_ref();

        let lock = if options.lock {
            Some(lock_file(path)?)
        } else {
            None
        };

        let text = fs::read_to_string(path)?;
        let mut dag = Self::parse(&text)?;
        dag.lock = lock;

        if let Some(rescue) = &options.rescue {
            dag.replay_rescue(rescue)?;
        }

        info!(
            path = %path.display(),
            tasks = dag.len(),
            edges = dag.graph.edge_count(),
            "loaded workflow"
        );
        Ok(dag)
    }

    /// Build a DAG from workflow text without touching the filesystem.
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_workflow(parse_workflow(text)?)
    }

    pub fn from_workflow(workflow: Workflow) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(workflow.tasks.len(), workflow.edges.len());
        let mut by_name = HashMap::with_capacity(workflow.tasks.len());

        for (_line, task) in workflow.tasks {
            if by_name.contains_key(&task.name) {
                return Err(ClusterError::DuplicateTask(task.name));
            }
            let name = task.name.clone();
            let id = graph.add_node(task);
            by_name.insert(name, id);
        }

        for edge in workflow.edges {
            let lookup = |name: &str| {
                by_name.get(name).copied().ok_or_else(|| {
                    ClusterError::parse(
                        edge.line,
                        format!("EDGE {} -> {} references unknown task {name}", edge.parent, edge.child),
                    )
                })
            };
            let parent = lookup(&edge.parent)?;
            let child = lookup(&edge.child)?;
            if parent == child {
                return Err(ClusterError::parse(
                    edge.line,
                    format!("task {} cannot depend on itself", edge.parent),
                ));
            }
            // Repeated EDGE lines collapse into one dependency.
            graph.update_edge(parent, child, ());
        }

        Ok(Self {
            graph,
            by_name,
            lock: None,
        })
    }

    /// Mark every task named by `DONE` lines in `path` as successful.
    ///
    /// A missing file is not an error: there is simply nothing to resume.
    pub fn replay_rescue(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no rescue file to replay");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut replayed = 0;
        for (line, name) in rescue::parse_rescue(&text)? {
            let id = self.task_id(&name).ok_or_else(|| ClusterError::Rescue {
                line,
                message: format!("unknown task {name}"),
            })?;
            self.graph[id].success = true;
            replayed += 1;
        }

        info!(path = %path.display(), replayed, "replayed rescue file");
        Ok(replayed)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub fn task_id(&self, name: &str) -> Option<TaskId> {
        self.by_name.get(name).copied()
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.graph[id]
    }

    pub fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.graph[id]
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.task_id(name).map(|id| &self.graph[id])
    }

    /// All task ids in file order.
    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.graph.node_indices()
    }

    /// All tasks in file order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Parents in file order.
    pub fn parents(&self, id: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.neighbors(id, Direction::Incoming)
    }

    /// Children in file order.
    pub fn children(&self, id: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.neighbors(id, Direction::Outgoing)
    }

    // petgraph walks a node's edges newest first.
    fn neighbors(&self, id: TaskId, dir: Direction) -> std::vec::IntoIter<TaskId> {
        let mut ids: Vec<TaskId> = self.graph.neighbors_directed(id, dir).collect();
        ids.sort_unstable();
        ids.into_iter()
    }

    /// A task is ready iff every parent has succeeded (vacuously true for roots).
    pub fn is_ready(&self, id: TaskId) -> bool {
        self.parents(id).all(|p| self.graph[p].success)
    }
}

fn lock_file(path: &Path) -> Result<File> {
    let file = File::open(path)?;
    file.try_lock_exclusive()
        .map_err(|_| ClusterError::Lock(path.display().to_string()))?;
    debug!(path = %path.display(), "locked workflow file");
    Ok(file)
}
