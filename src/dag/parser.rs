// src/dag/parser.rs

//! Line parser for workflow files.
//!
//! ```text
//! TASK <name> [options] [--] <command...>
//! EDGE <parent> <child>
//! #@ <opaque_id> <transformation> <name>
//! # comment
//! ```
//!
//! The parser only checks each line on its own. Cross-line checks
//! (duplicate names, dangling edges) belong to [`crate::dag::Dag`].

use std::collections::HashMap;

use tracing::warn;

use crate::dag::task::Task;
use crate::errors::{ClusterError, Result};
use crate::types::Forward;

/// An `EDGE` record, kept with its line number for error reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeDecl {
    pub line: usize,
    pub parent: String,
    pub child: String,
}

/// Result of parsing a workflow file: tasks in file order plus raw edges.
#[derive(Debug, Clone, Default)]
pub struct Workflow {
    pub tasks: Vec<(usize, Task)>,
    pub edges: Vec<EdgeDecl>,
}

struct Annotation {
    line: usize,
    opaque_id: String,
    transformation: String,
}

pub fn parse_workflow(text: &str) -> Result<Workflow> {
    let mut workflow = Workflow::default();
    let mut annotations: HashMap<String, Annotation> = HashMap::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("#@") {
            let (name, ann) = parse_annotation(line, rest)?;
            annotations.insert(name, ann);
            continue;
        }
        if trimmed.starts_with('#') {
            continue;
        }

        let (keyword, rest) = split_first(trimmed);
        match keyword {
            "TASK" => {
                let mut task = parse_task(line, rest)?;
                if let Some(ann) = annotations.remove(&task.name) {
                    task.opaque_id = Some(ann.opaque_id);
                    task.transformation = Some(ann.transformation);
                }
                workflow.tasks.push((line, task));
            }
            "EDGE" => workflow.edges.push(parse_edge(line, rest)?),
            other => {
                return Err(ClusterError::parse(
                    line,
                    format!("unknown record type '{other}'"),
                ));
            }
        }
    }

    for (name, ann) in annotations {
        warn!(
            line = ann.line,
            task = %name,
            "annotation does not precede any TASK with that name; ignoring"
        );
    }

    Ok(workflow)
}

fn split_first(s: &str) -> (&str, &str) {
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

fn parse_annotation(line: usize, rest: &str) -> Result<(String, Annotation)> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 3 {
        return Err(ClusterError::parse(
            line,
            "annotation needs '#@ <opaque_id> <transformation> <name>'",
        ));
    }
    Ok((
        fields[2].to_string(),
        Annotation {
            line,
            opaque_id: fields[0].to_string(),
            transformation: fields[1].to_string(),
        },
    ))
}

fn parse_edge(line: usize, rest: &str) -> Result<EdgeDecl> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    match fields.as_slice() {
        [parent, child] => Ok(EdgeDecl {
            line,
            parent: parent.to_string(),
            child: child.to_string(),
        }),
        _ => Err(ClusterError::parse(line, "EDGE needs '<parent> <child>'")),
    }
}

fn parse_task(line: usize, rest: &str) -> Result<Task> {
    let (name, mut rest) = split_first(rest);
    if name.is_empty() {
        return Err(ClusterError::parse(line, "TASK is missing a name"));
    }
    let mut task = Task::new(name, "");

    loop {
        let (token, after) = split_first(rest);
        if token == "--" {
            rest = after;
            break;
        }
        if !token.starts_with('-') || token.len() < 2 {
            break;
        }

        // `--flag=value` carries its value inline.
        let (flag, inline) = match token.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag, Some(value)),
            _ => (token, None),
        };
        let (value, after) = match inline {
            Some(value) => (value, after),
            None => {
                let (value, after) = split_first(after);
                if value.is_empty() {
                    return Err(ClusterError::parse(
                        line,
                        format!("option '{flag}' requires a value"),
                    ));
                }
                (value, after)
            }
        };
        rest = after;

        match flag {
            "-m" | "--request-memory" => task.memory = number(line, flag, value)?,
            "-c" | "--request-cpus" => task.cpus = number(line, flag, value)?,
            "-t" | "--tries" => {
                let tries: u32 = number(line, flag, value)?;
                if tries == 0 {
                    return Err(ClusterError::parse(line, "tries must be at least 1"));
                }
                task.tries = Some(tries);
            }
            "-p" | "--priority" => task.priority = number(line, flag, value)?,
            "-f" | "--pipe-forward" => task.pipe_forwards.push(forward(line, value)?),
            "-F" | "--file-forward" => task.file_forwards.push(forward(line, value)?),
            other => {
                return Err(ClusterError::parse(
                    line,
                    format!("unknown option '{other}' for task {name}"),
                ));
            }
        }
    }

    if rest.is_empty() {
        return Err(ClusterError::parse(
            line,
            format!("task {name} has no command"),
        ));
    }
    task.command = rest.to_string();
    Ok(task)
}

fn number<T: std::str::FromStr>(line: usize, flag: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        ClusterError::parse(line, format!("invalid value '{value}' for option '{flag}'"))
    })
}

fn forward(line: usize, value: &str) -> Result<Forward> {
    value
        .parse::<Forward>()
        .map_err(|msg| ClusterError::parse(line, msg))
}
