// src/dag/diagram.rs

//! Mermaid flowchart rendering of a job, optionally overlaid with the state
//! of one execution.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write;

use crate::dag::graph::TaskGraph;
use crate::dag::job_definition::JobDefinition;
use crate::dag::task_definition::TaskDefinition;
use crate::errors::{FormicaryError, Result};
use crate::execution::JobExecution;
use crate::types::{RequestState, TaskMethod};

const CLASSES: [(&str, &str, &str); 7] = [
    ("primary", "#e1f5fe", "#01579b"),
    ("success", "#e8f5e8", "#2e7d32"),
    ("error", "#ffebee", "#c62828"),
    ("warning", "#fff3e0", "#ef6c00"),
    ("info", "#e3f2fd", "#1565c0"),
    ("secondary", "#f5f5f5", "#616161"),
    ("default", "#fafafa", "#9e9e9e"),
];

impl JobDefinition {
    /// Render the job as a Mermaid `flowchart TD`.
    ///
    /// With an execution, visited tasks are coloured by state, edges between
    /// visited tasks are drawn thick (`==>`) and the rest dotted (`-.->`).
    pub fn mermaid(&self, execution: Option<&JobExecution>) -> Result<String> {
        let first = self.get_first_task()?;
        let graph = TaskGraph::from_definition(self);
        render(self, &graph, first, execution)
            .map_err(|e| FormicaryError::Other(anyhow::anyhow!("rendering diagram: {e}")))
    }
}

fn node_id(task_type: &str) -> String {
    task_type.replace(['-', ' ', '.'], "_")
}

fn shape(task: &TaskDefinition, decision: bool) -> String {
    let label = &task.task_type;
    if decision {
        format!("{{\"{label}\"}}")
    } else if task.always_run || task.method == TaskMethod::AwaitForkedJob {
        format!("[/\"{label}\"\\]")
    } else if task.method == TaskMethod::ForkJob {
        format!("[\\\"{label}\"/]")
    } else {
        format!("[\"{label}\"]")
    }
}

fn state_color(state: RequestState) -> &'static str {
    match state {
        RequestState::Completed => "success",
        RequestState::Failed => "error",
        RequestState::Ready | RequestState::Started | RequestState::Executing => "warning",
        RequestState::Cancelled => "secondary",
        RequestState::Pending => "default",
    }
}

fn render(
    job: &JobDefinition,
    graph: &TaskGraph,
    first: &TaskDefinition,
    execution: Option<&JobExecution>,
) -> std::result::Result<String, std::fmt::Error> {
    let mut out = String::new();
    let mut styles: BTreeMap<String, String> = BTreeMap::new();
    let terminal = execution.is_some_and(|e| e.job_state.is_terminal());
    let visited = |task_type: &str| execution.and_then(|e| e.get_task(task_type));

    writeln!(out, "flowchart TD")?;
    if let Some(exec) = execution {
        writeln!(out, "    START{{\"START\"}}")?;
        styles.insert("START".into(), "class_primary_bold".into());
        if terminal {
            writeln!(out, "    END[\"END\"]")?;
            let color = if exec.completed() {
                "success"
            } else if exec.failed() {
                "error"
            } else {
                "primary"
            };
            styles.insert("END".into(), format!("class_{color}_bold"));
        }
    }

    for task in job.tasks() {
        let id = node_id(&task.task_type);
        let decision = graph.successors(&task.task_type).len() > 1;
        writeln!(out, "    {id}{}", shape(task, decision))?;
        let class = match visited(&task.task_type) {
            Some(t) => format!("class_{}_bold", state_color(t.task_state)),
            None => "class_default".to_string(),
        };
        styles.insert(id, class);
    }

    if execution.is_some() {
        writeln!(out, "    START --> {}", node_id(&first.task_type))?;
    }

    // Depth-first from the root so edges read in walk order.
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut stack = vec![first.task_type.clone()];
    while let Some(from) = stack.pop() {
        let mut pushed = Vec::new();
        for to in graph.successors(&from) {
            if !seen.insert((from.clone(), to.to_string())) {
                continue;
            }
            let connector = match execution {
                None => "-->",
                Some(_) if visited(&from).is_some() && visited(to).is_some() => "==>",
                Some(_) => "-.->",
            };
            writeln!(out, "    {} {connector} {}", node_id(&from), node_id(to))?;
            pushed.push(to.to_string());
        }
        stack.extend(pushed.into_iter().rev());
    }

    if let Some(exec) = execution.filter(|_| terminal) {
        let last = exec
            .get_last_executed_task()
            .map(|t| t.task_type.clone())
            .or_else(|| job.get_last_task().map(|t| t.task_type.clone()));
        if let Some(last) = last {
            writeln!(out, "    {} --> END", node_id(&last))?;
        }
    }

    writeln!(out)?;
    for (name, fill, stroke) in CLASSES {
        writeln!(out, "    classDef class_{name} fill:{fill},stroke:{stroke},stroke-width:2px")?;
        writeln!(out, "    classDef class_{name}_bold fill:{fill},stroke:{stroke},stroke-width:4px")?;
    }
    for (id, class) in styles {
        writeln!(out, "    class {id} {class}")?;
    }
    Ok(out)
}
