// src/dag/dynamic.rs

//! Per-run materialisation of a task from its templated YAML fragment.
//!
//! Rendering is a separate step from validation: the fragment for one task
//! is cut out of the stored source, rendered with Handlebars (no HTML
//! escaping, missing variables render empty) and only then parsed and
//! validated as a fresh [`TaskDefinition`] plus [`ExecutorOptions`].

use std::collections::BTreeMap;

use chrono::{Datelike, Utc};
use handlebars::Handlebars;
use serde_json::Value;
use tracing::debug;

use crate::dag::job_definition::JobDefinition;
use crate::dag::task_definition::TaskDefinition;
use crate::errors::{FormicaryError, Result};
use crate::protocol::ExecutorOptions;

impl JobDefinition {
    /// Build the concrete task for this run.
    ///
    /// Template data, later entries overriding earlier ones: job variables,
    /// task variables, `vars` (request parameters and retry counters) and
    /// the date built-ins.
    pub fn dynamic_task(
        &self,
        task_type: &str,
        vars: &BTreeMap<String, Value>,
    ) -> Result<(TaskDefinition, ExecutorOptions)> {
        let stored = self
            .get_task(task_type)
            .ok_or_else(|| FormicaryError::TaskNotFound(format!("task '{task_type}' not found")))?;

        let fragment = if self.raw_yaml().is_empty() {
            None
        } else {
            extract_task_fragment(self.raw_yaml(), task_type)
        };

        let (mut task, mut opts) = match fragment {
            Some(fragment) => {
                let source = if self.uses_template() {
                    let data = template_data(self, stored, vars);
                    render(&fragment, &data)?
                } else {
                    fragment
                };
                debug!(task_type, bytes = source.len(), "parsed dynamic task fragment");
                let task: TaskDefinition = serde_yaml::from_str(&source)?;
                let opts: ExecutorOptions = serde_yaml::from_str(&source)?;
                (task, opts)
            }
            None => (stored.clone(), ExecutorOptions::default()),
        };

        task.after_load();
        task.task_order = stored.task_order;
        if task.task_type != stored.task_type {
            return Err(FormicaryError::Template(format!(
                "rendered task '{}' does not match '{}'",
                task.task_type, stored.task_type
            )));
        }
        task.validate()?;

        opts.name = task.task_type.clone();
        opts.method = task.method;
        opts.fork_job_type = task.fork_job_type.clone();
        opts.fork_job_version = task.fork_job_version.clone();
        opts.await_forked_tasks = task.await_forked_tasks.clone();
        opts.validate()?;

        Ok((task, opts))
    }
}

fn template_data(
    job: &JobDefinition,
    task: &TaskDefinition,
    vars: &BTreeMap<String, Value>,
) -> serde_json::Map<String, Value> {
    let now = Utc::now();
    let mut data = serde_json::Map::new();
    data.extend(job.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
    data.extend(task.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
    data.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
    data.insert("DateYear".into(), Value::from(now.year()));
    data.insert("DateMonth".into(), Value::from(now.month()));
    data.insert("DateDay".into(), Value::from(now.day()));
    data.insert("YearDay".into(), Value::from(now.ordinal()));
    data.insert("FullDate".into(), Value::from(now.format("%Y-%m-%d").to_string()));
    data.insert("EpochSecs".into(), Value::from(now.timestamp()));
    data
}

fn render(fragment: &str, data: &serde_json::Map<String, Value>) -> Result<String> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(false);
    registry.register_escape_fn(handlebars::no_escape);
    registry
        .render_template(fragment, data)
        .map_err(|e| FormicaryError::Template(e.to_string()))
}

/// Cut the YAML mapping of one task out of a job source and dedent it.
///
/// The task is located by its `task_type:` line; the mapping starts at the
/// enclosing `-` list item and ends at the first non-empty line indented at
/// or left of that dash.
pub(crate) fn extract_task_fragment(source: &str, task_type: &str) -> Option<String> {
    let lines: Vec<&str> = source.lines().collect();
    let key_line = lines.iter().position(|line| {
        let body = line.trim_start().trim_start_matches('-').trim_start();
        body.strip_prefix("task_type:")
            .map(|v| v.trim().trim_matches(|c| c == '"' || c == '\'') == task_type)
            .unwrap_or(false)
    })?;
    let key_col = lines[key_line].find("task_type:")?;

    // Walk back to the list item that owns the key.
    let start = (0..=key_line)
        .rev()
        .find(|&i| item_content_col(lines[i]) == Some(key_col))?;
    let dash_col = indent_of(lines[start]);
    let content_col = key_col;

    let mut out = Vec::new();
    out.push(lines[start][content_col..].to_string());
    for line in &lines[start + 1..] {
        if line.trim().is_empty() {
            continue;
        }
        let indent = indent_of(line);
        if indent <= dash_col {
            break;
        }
        let cut = indent.min(content_col);
        out.push(line[cut..].to_string());
    }
    Some(out.join("\n"))
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Column where the mapping of a `- key: value` list item starts.
fn item_content_col(line: &str) -> Option<usize> {
    let dash = indent_of(line);
    let rest = line[dash..].strip_prefix('-')?;
    let pad = rest.len() - rest.trim_start().len();
    (pad > 0).then_some(dash + 1 + pad)
}
