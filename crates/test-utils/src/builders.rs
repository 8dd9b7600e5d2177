#![allow(dead_code)]

use std::fmt::Write as _;
use std::path::Path;

use dagcluster::dag::Dag;
use dagcluster::protocol::Registration;

/// Builder for workflow files to simplify test setup.
///
/// Produces the text format read by [`Dag::parse`], so tests exercise the
/// real parser instead of constructing graphs by hand.
#[derive(Debug, Clone, Default)]
pub struct WorkflowBuilder {
    lines: Vec<String>,
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task(mut self, task: TaskBuilder) -> Self {
        self.lines.push(task.line());
        self
    }

    pub fn with_edge(mut self, parent: &str, child: &str) -> Self {
        self.lines.push(format!("EDGE {parent} {child}"));
        self
    }

    pub fn with_annotation(mut self, opaque_id: &str, transformation: &str, name: &str) -> Self {
        self.lines
            .push(format!("#@ {opaque_id} {transformation} {name}"));
        self
    }

    pub fn with_comment(mut self, comment: &str) -> Self {
        self.lines.push(format!("# {comment}"));
        self
    }

    pub fn text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            let _ = writeln!(out, "{line}");
        }
        out
    }

    pub fn write_to(&self, path: &Path) {
        std::fs::write(path, self.text()).expect("Failed to write workflow file");
    }

    pub fn build(self) -> Dag {
        Dag::parse(&self.text()).expect("Failed to build valid workflow from builder")
    }
}

/// A -> {B, C} -> D, every task `true`.
pub fn diamond() -> WorkflowBuilder {
    WorkflowBuilder::new()
        .with_task(TaskBuilder::new("A", "true"))
        .with_task(TaskBuilder::new("B", "true"))
        .with_task(TaskBuilder::new("C", "true"))
        .with_task(TaskBuilder::new("D", "true"))
        .with_edge("A", "B")
        .with_edge("A", "C")
        .with_edge("B", "D")
        .with_edge("C", "D")
}

/// A linear chain `names[0] -> names[1] -> ...`, every task `true`.
pub fn chain(names: &[&str]) -> WorkflowBuilder {
    let mut builder = WorkflowBuilder::new();
    for name in names {
        builder = builder.with_task(TaskBuilder::new(name, "true"));
    }
    for pair in names.windows(2) {
        builder = builder.with_edge(pair[0], pair[1]);
    }
    builder
}

/// Builder for one `TASK` line.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    name: String,
    command: String,
    options: Vec<String>,
}

impl TaskBuilder {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            options: Vec::new(),
        }
    }

    pub fn memory(mut self, mb: u32) -> Self {
        self.options.push(format!("-m {mb}"));
        self
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.options.push(format!("-c {cpus}"));
        self
    }

    pub fn tries(mut self, tries: u32) -> Self {
        self.options.push(format!("-t {tries}"));
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.options.push(format!("-p {priority}"));
        self
    }

    pub fn pipe_forward(mut self, var: &str, dest: &str) -> Self {
        self.options.push(format!("-f {var}={dest}"));
        self
    }

    pub fn file_forward(mut self, src: &str, dest: &str) -> Self {
        self.options.push(format!("-F {src}={dest}"));
        self
    }

    fn line(&self) -> String {
        let mut line = format!("TASK {}", self.name);
        for opt in &self.options {
            line.push(' ');
            line.push_str(opt);
        }
        line.push_str(" -- ");
        line.push_str(&self.command);
        line
    }
}

/// Registration for a single-socket host where every CPU is its own core.
pub fn registration(hostname: &str, memory: u32, cpus: u32) -> Registration {
    Registration {
        hostname: hostname.to_string(),
        memory,
        cpus,
        cores: cpus,
        sockets: 1,
    }
}
