#![allow(dead_code)]

use std::path::{Path, PathBuf};

use dagcluster::dag::Dag;
use dagcluster::engine::{Engine, EngineOptions};

// Not every test binary uses every re-export.
#[allow(unused_imports)]
pub use dagcluster_test_utils::builders;
#[allow(unused_imports)]
pub use dagcluster_test_utils::{init_tracing, with_timeout};

/// Write `text` as `<dir>/<name>` and return the path.
pub fn write_file(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).expect("Failed to write test file");
    path
}

/// Engine over `text` with no rescue log.
pub fn engine(text: &str, options: EngineOptions) -> Engine {
    let dag = Dag::parse(text).expect("Failed to parse workflow");
    Engine::new(dag, options, None)
}

/// Drain the engine's ready queue, returning task names in order.
pub fn drain_ready(engine: &mut Engine) -> Vec<String> {
    let mut names = Vec::new();
    while engine.has_ready_task() {
        let id = engine.next_ready_task().expect("ready queue said non-empty");
        names.push(engine.dag().task(id).name.clone());
    }
    names
}

/// Report `name` finished with `exit_code`.
pub fn finish(engine: &mut Engine, name: &str, exit_code: i32) {
    let id = engine.dag().task_id(name).expect("unknown task");
    engine
        .mark_task_finished(id, exit_code)
        .expect("mark_task_finished failed");
}
