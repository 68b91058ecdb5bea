// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod execution;
pub mod logging;
pub mod protocol;
pub mod resource;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::{CliArgs, Command, RunArgs};
use crate::config::{ConfigFile, load_or_default};
use crate::dag::JobDefinition;
use crate::engine::{CoreRuntime, ProcessLifecycle, RunSummary, Runtime, RuntimeEvent};
use crate::exec::{
    ChannelTransport, LocalAnt, QueueDispatchBackend, Transport, spawn_registration_pump,
    spawn_response_pump,
};
use crate::execution::JobRequest;
use crate::resource::AntReservation;

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Validate { job } => {
            let definition = load_definition(&job)?;
            print_validation(&definition);
            Ok(())
        }
        Command::Graph { job } => {
            let definition = load_definition(&job)?;
            println!("{}", definition.mermaid(None)?);
            Ok(())
        }
        Command::Run(run_args) => {
            let cfg = load_or_default(&args.config)
                .with_context(|| format!("loading config {}", args.config.display()))?;
            run_job(&cfg, run_args).await
        }
    }
}

async fn run_job(cfg: &ConfigFile, args: RunArgs) -> Result<()> {
    let definition = Arc::new(load_definition(&args.job)?);
    let mut catalog = Vec::with_capacity(args.with_jobs.len());
    for path in &args.with_jobs {
        catalog.push(Arc::new(load_definition(path)?));
    }

    let mut request = JobRequest::new(definition.job_type.clone());
    for (name, value) in args.params {
        request = request.with_param(name, param_value(&value));
    }
    request.validate()?;

    if args.dry_run {
        print_dry_run(cfg, &definition, &request)?;
        return Ok(());
    }

    let request_id = request.id;
    let summary = execute_job(cfg, definition, catalog, request).await?;
    let report = summary
        .job(request_id)
        .context("runtime stopped before the job finished")?;

    println!("job {} {}", report.request.job_type, report.state());
    for task in report.execution.tasks() {
        let code = task.error_code.as_deref().unwrap_or("-");
        println!("  {:<24} {:<10} {code}", task.task_type, task.task_state.as_str());
    }
    if !report.state().completed() {
        bail!(
            "job {} finished as {}: {}",
            report.request.job_type,
            report.state(),
            report.execution.error_message.as_deref().unwrap_or("no error message")
        );
    }
    Ok(())
}

/// Run one job request on the ants configured in `cfg` and return once the
/// runtime stops (with the default `exit_when_idle`, when the job and its
/// forked children are done).
///
/// This wires together:
/// - an in-process transport with response and registration pumps
/// - one [`LocalAnt`] per `[[ants]]` entry
/// - the core runtime and its async shell
/// - Ctrl-C handling through [`ProcessLifecycle`]
pub async fn execute_job(
    cfg: &ConfigFile,
    definition: Arc<JobDefinition>,
    catalog: Vec<Arc<JobDefinition>>,
    request: JobRequest,
) -> Result<RunSummary> {
    let options = cfg.runtime_options();
    let transport: Arc<dyn Transport> = Arc::new(ChannelTransport::default());
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(256);

    // Pumps subscribe before any ant publishes.
    let responses = spawn_response_pump(transport.as_ref(), &options.response_topic, rt_tx.clone());
    let registrations = spawn_registration_pump(
        transport.as_ref(),
        &cfg.scheduler.registration_topic,
        rt_tx.clone(),
    );

    let lifecycle = ProcessLifecycle::new();
    let ctrl_c = lifecycle.install_ctrl_c(rt_tx.clone());
    lifecycle.on_shutdown(move || {
        responses.abort();
        registrations.abort();
    });

    let resources = Arc::new(cfg.resource_manager());
    if cfg.ants.is_empty() {
        warn!("no [[ants]] configured; tasks wait for external ants");
    }
    let mut ants = Vec::with_capacity(cfg.ants.len());
    for ant_cfg in &cfg.ants {
        let registration = ant_cfg.registration();
        resources.register(registration.clone())?;
        let ant = LocalAnt::new(
            registration,
            Arc::clone(&transport),
            options.shared_secret.clone(),
            cfg.scheduler.registration_topic.clone(),
            cfg.heartbeat_interval(),
        );
        debug!(ant_id = %ant.ant_id(), "starting local ant");
        ants.push(ant.spawn(lifecycle.subscribe()));
    }

    let backend = QueueDispatchBackend::new(Arc::clone(&transport), options.shared_secret.clone());
    let mut core = CoreRuntime::new(options, resources, cfg.classifier().clone());
    core.register_definition(Arc::clone(&definition));
    for extra in catalog {
        core.register_definition(extra);
    }

    info!(request_id = %request.id, job_type = %definition.job_type, "submitting job");
    rt_tx
        .send(RuntimeEvent::SubmitJob {
            request,
            definition,
        })
        .await
        .context("submitting job to runtime")?;

    let runtime = Runtime::new(core, rt_tx, rt_rx, backend);
    let result = runtime.run().await;

    lifecycle.shutdown();
    ctrl_c.abort();
    for ant in ants {
        if let Err(e) = ant.await {
            warn!(error = %e, "local ant task failed");
        }
    }

    Ok(result?)
}

/// Match every ant-dispatched task of `definition` against the ants
/// configured in `cfg`, without reserving anything.
pub fn plan_job_resources(cfg: &ConfigFile, definition: &JobDefinition) -> Result<Vec<AntReservation>> {
    let resources = cfg.resource_manager();
    for ant_cfg in &cfg.ants {
        resources.register(ant_cfg.registration())?;
    }
    resources
        .check_job_resources(definition)
        .with_context(|| format!("configured ants cannot run job {}", definition.job_type))
}

/// Read and validate a YAML job definition.
pub fn load_definition(path: &Path) -> Result<JobDefinition> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading job definition {}", path.display()))?;
    JobDefinition::from_yaml(&source)
        .with_context(|| format!("invalid job definition {}", path.display()))
}

/// `--param` values that parse as JSON keep their type.
fn param_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_validation(definition: &JobDefinition) {
    println!("job {} is valid", definition.job_type);
    println!("  tasks: {}", definition.tasks().len());
    if let Ok(first) = definition.get_first_task() {
        println!("  first: {}", first.task_type);
    }
    if let Some(last) = definition.get_last_task() {
        println!("  last: {}", last.task_type);
    }
    let always: Vec<&str> = definition
        .get_last_always_run_tasks()
        .iter()
        .map(|t| t.task_type.as_str())
        .collect();
    if !always.is_empty() {
        println!("  always run: {}", always.join(", "));
    }
}

fn print_dry_run(cfg: &ConfigFile, definition: &JobDefinition, request: &JobRequest) -> Result<()> {
    println!("formicary dry-run");
    println!("  job_type = {}", definition.job_type);
    for (name, value) in request.params.iter() {
        println!("  param {name} = {value}");
    }
    println!(
        "  ants = [{}]",
        cfg.ants
            .iter()
            .map(|a| format!("{}x{}", a.ant_id, a.max_capacity))
            .collect::<Vec<_>>()
            .join(", ")
    );
    for planned in plan_job_resources(cfg, definition)? {
        println!(
            "  task {} -> ant {} (load {}, matching ants {})",
            planned.task_type, planned.ant_id, planned.current_load, planned.total_reservations
        );
    }
    println!();
    println!("{}", definition.mermaid(None)?);

    debug!("dry-run complete (no execution)");
    Ok(())
}
