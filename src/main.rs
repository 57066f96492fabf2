mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use ab_harness::config::ProjectConfig;
use ab_harness::context::ResolverFactory;
use ab_harness::log::{ExecutionLog, LogEvent};
use ab_harness::orchestrator::{OrchestratorConfig, run_experiment};
use ab_harness::paths::capture_process_env;
use ab_harness::selection::{
    HistoryIndex, SelectionOptions, load_history, select_ab_tasks_for_execution,
};
use ab_harness::task::{WorkerType, load_catalog};
use cli::{Cli, Command, SelectionArgs};

/// Exit status when the experiment ran but the gate did not pass.
const GATE_FAILED_EXIT_CODE: i32 = 2;

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .ab-harness/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<28} {value}\n"));
}

fn or_none(value: Option<&str>) -> &str {
    value.unwrap_or("(none)")
}

fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    let exp = &config.experiment;
    output.push_str("Experiment\n");
    let workers: Vec<&str> = exp.worker_types.iter().map(|w| w.as_str()).collect();
    push_kv(&mut output, "worker_types", workers.join(", "));
    push_kv(
        &mut output,
        "max_tasks",
        exp.max_tasks
            .map(|n| n.to_string())
            .unwrap_or_else(|| "(all)".to_string()),
    );
    push_kv(&mut output, "selection", exp.selection);
    push_kv(&mut output, "stable_threshold", exp.stable_threshold);
    push_kv(&mut output, "uncertain_share", exp.uncertain_share);
    push_kv(&mut output, "artifact_dir", exp.artifact_dir.display());
    push_kv(&mut output, "workspace_exclude", exp.workspace_exclude.join(", "));
    output.push('\n');

    let exec = &config.execution;
    output.push_str("Execution\n");
    push_kv(&mut output, "command_timeout", format!("{}ms", exec.command_timeout_ms));
    push_kv(&mut output, "agent_timeout", format!("{}ms", exec.agent_timeout_ms));
    push_kv(&mut output, "max_extra_context_files", exec.max_extra_context_files);
    push_kv(&mut output, "allow_edit_fallback", exec.allow_edit_fallback);
    push_kv(
        &mut output,
        "prompt_template",
        if exec.prompt_template.is_some() { "(custom)" } else { "(built-in)" },
    );
    output.push('\n');

    output.push_str("Agent\n");
    match &config.agent.command {
        None => push_kv(&mut output, "command", "(none)"),
        Some(template) => {
            for worker in &exp.worker_types {
                push_kv(
                    &mut output,
                    &format!("command.{worker}"),
                    or_none(template.for_worker(*worker)),
                );
            }
        }
    }
    output.push('\n');

    let ctx = &config.context;
    output.push_str("Context\n");
    push_kv(&mut output, "resolver_command", or_none(ctx.resolver_command.as_deref()));
    push_kv(&mut output, "resolver_timeout", format!("{}ms", ctx.resolver_timeout_ms));
    if ctx.level_overrides.is_empty() {
        push_kv(&mut output, "level_overrides", "(none)");
    } else {
        for (level, files) in &ctx.level_overrides {
            output.push_str(&format!("  - level {level} => {}\n", files.join(", ")));
        }
    }
    output.push('\n');

    let gate = &config.gate;
    output.push_str("Gate\n");
    push_kv(&mut output, "min_t3_success_lift", gate.min_t3_success_lift);
    push_kv(&mut output, "require_t3_significance", gate.require_t3_significance);
    push_kv(&mut output, "min_samples_per_group", gate.min_samples_per_group);
    push_kv(&mut output, "ceiling_rate", gate.ceiling_rate);
    push_kv(&mut output, "ceiling_min_time_reduction", gate.ceiling_min_time_reduction);
    push_kv(&mut output, "min_agent_command_share", gate.min_agent_command_share);
    push_kv(&mut output, "min_verified_execution_share", gate.min_verified_execution_share);
    push_kv(&mut output, "min_artifact_integrity_share", gate.min_artifact_integrity_share);
    push_kv(&mut output, "max_fallback_share", gate.max_fallback_share);
    push_kv(&mut output, "require_no_critical_failures", gate.require_no_critical_failures);
    output.push('\n');

    output.push_str("Significance\n");
    push_kv(&mut output, "alpha", config.significance.alpha);
    push_kv(&mut output, "min_samples", config.significance.min_samples);
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let exp = &config.experiment;
    let exec = &config.execution;
    let payload = serde_json::json!({
        "experiment": {
            "worker_types": &exp.worker_types,
            "max_tasks": exp.max_tasks,
            "selection": exp.selection,
            "stable_threshold": exp.stable_threshold,
            "uncertain_share": exp.uncertain_share,
            "artifact_dir": exp.artifact_dir.display().to_string(),
            "workspace_exclude": &exp.workspace_exclude
        },
        "execution": {
            "command_timeout_ms": exec.command_timeout_ms,
            "agent_timeout_ms": exec.agent_timeout_ms,
            "max_extra_context_files": exec.max_extra_context_files,
            "allow_edit_fallback": exec.allow_edit_fallback,
            "prompt_template": &exec.prompt_template
        },
        "agent": {
            "command": &config.agent.command
        },
        "context": {
            "resolver_command": &config.context.resolver_command,
            "resolver_timeout_ms": config.context.resolver_timeout_ms,
            "level_overrides": &config.context.level_overrides
        },
        "gate": &config.gate,
        "significance": &config.significance,
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

fn selection_options(config: &ProjectConfig, args: &SelectionArgs) -> SelectionOptions {
    let mut options = config.selection_options();
    if let Some(mode) = args.selection {
        options.mode = mode;
    }
    if args.max_tasks.is_some() {
        options.max_tasks = args.max_tasks;
    }
    options
}

fn history_index(args: &SelectionArgs) -> Result<HistoryIndex> {
    let history = load_history(&args.history)?;
    let index = HistoryIndex::from_results(&history);
    if !args.history.is_empty() {
        info!(files = args.history.len(), tasks = index.len(), "loaded run history");
    }
    Ok(index)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "ab_harness=warn",
        0 => "ab_harness=info",
        1 => "ab_harness=debug",
        _ => "ab_harness=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .ab-harness/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Run {
            selection,
            repos,
            out,
            artifacts,
            workers,
            log,
        } => {
            let env = capture_process_env();
            let tasks = load_catalog(&selection.catalog)?;
            let history = history_index(&selection)?;

            let artifact_root = artifacts.unwrap_or_else(|| config.experiment.artifact_dir.clone());
            let mut orchestrator =
                OrchestratorConfig::new(resolve(&cwd, repos), resolve(&cwd, artifact_root), env);
            orchestrator.worker_types = if workers.is_empty() {
                config.experiment.worker_types.clone()
            } else {
                workers
            };
            orchestrator.selection = selection_options(&config, &selection);
            orchestrator.executor = config.executor_options()?;
            orchestrator.workspace_exclude = config.experiment.workspace_exclude.clone();
            orchestrator.thresholds = config.gate.clone();
            orchestrator.significance = config.significance;

            let factory = config.resolver_factory(&orchestrator.env);
            if factory.is_none() && orchestrator.worker_types.contains(&WorkerType::Treatment) {
                warn!("no context resolver configured; treatment runs will have no extra context");
            }
            let log = log.map(|p| ExecutionLog::new(&resolve(&cwd, p))).transpose()?;

            let report = run_experiment(
                &orchestrator,
                &tasks,
                &history,
                factory.as_ref().map(|f| f as &dyn ResolverFactory),
                log.as_ref(),
            )
            .await?;

            let out = resolve(&cwd, out);
            report.write_json(&out)?;
            let finished = log.as_ref().map(|log| {
                log.log(LogEvent::ExperimentFinished {
                    run_id: report.run_id.clone(),
                    runs: report.results.len(),
                    report_path: Some(out.display().to_string()),
                })
            });
            if let Some(Err(e)) = finished {
                warn!(error = %e, "failed to write execution log");
            }

            for line in report.summary_lines() {
                println!("{line}");
            }
            println!("report: {}", out.display());

            if !report.analysis.gate.passed {
                std::process::exit(GATE_FAILED_EXIT_CODE);
            }
        }
        Command::Select { selection } => {
            let tasks = load_catalog(&selection.catalog)?;
            let history = history_index(&selection)?;
            let options = selection_options(&config, &selection);
            let picked = select_ab_tasks_for_execution(&tasks, &history, &options);
            println!("{} of {} tasks ({})", picked.len(), tasks.len(), options.mode);
            for scored in picked {
                println!(
                    "  {:<32} {}  uncertainty={:.3}",
                    scored.task.id, scored.task.complexity, scored.uncertainty
                );
            }
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
    }

    Ok(())
}

fn resolve(cwd: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}
