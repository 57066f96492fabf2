use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use ab_harness::selection::SelectionMode;
use ab_harness::task::WorkerType;

#[derive(Parser, Debug)]
#[command(
    name = "ab-harness",
    about = "Control/treatment experiments for coding agents with statistical release gates",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Flags shared by commands that pick tasks.
#[derive(Args, Debug)]
pub struct SelectionArgs {
    /// Task catalog (YAML or JSON)
    #[arg(long)]
    pub catalog: PathBuf,

    /// Task budget; all tasks when omitted
    #[arg(long)]
    pub max_tasks: Option<usize>,

    /// Selection strategy when the budget is smaller than the catalog
    #[arg(long, value_parser = parse_selection_mode)]
    pub selection: Option<SelectionMode>,

    /// Prior report or run-result file feeding the uncertainty scores (repeatable)
    #[arg(long = "history")]
    pub history: Vec<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an experiment and evaluate the release gate
    Run {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Directory containing one subdirectory per repository
        #[arg(long)]
        repos: PathBuf,

        /// Where to write the experiment report
        #[arg(long, default_value = "ab-report.json")]
        out: PathBuf,

        /// Override the artifact root directory
        #[arg(long)]
        artifacts: Option<PathBuf>,

        /// Worker types to run, in order (repeatable)
        #[arg(long = "worker", value_parser = parse_worker_type)]
        workers: Vec<WorkerType>,

        /// Append a JSON-lines execution log to this file
        #[arg(long)]
        log: Option<PathBuf>,
    },

    /// Show which tasks would run, with their uncertainty scores
    Select {
        #[command(flatten)]
        selection: SelectionArgs,
    },

    /// Show project configuration
    Config {
        /// Render as JSON
        #[arg(long)]
        json: bool,
    },
}

fn parse_selection_mode(value: &str) -> Result<SelectionMode, String> {
    value.parse().map_err(|e: anyhow::Error| e.to_string())
}

fn parse_worker_type(value: &str) -> Result<WorkerType, String> {
    value.parse().map_err(|e: anyhow::Error| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_parses_repeated_flags() {
        let cli = Cli::try_parse_from([
            "ab-harness",
            "run",
            "--catalog",
            "tasks.yaml",
            "--repos",
            "repos",
            "--worker",
            "treatment",
            "--history",
            "a.json",
            "--history",
            "b.json",
            "--selection",
            "uncertainty",
            "-vv",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Run {
                selection,
                workers,
                out,
                ..
            } => {
                assert_eq!(workers, vec![WorkerType::Treatment]);
                assert_eq!(selection.history.len(), 2);
                assert_eq!(selection.selection, Some(SelectionMode::Uncertainty));
                assert_eq!(out, PathBuf::from("ab-report.json"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_worker() {
        let err = Cli::try_parse_from([
            "ab-harness",
            "run",
            "--catalog",
            "t.yaml",
            "--repos",
            "r",
            "--worker",
            "placebo",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn config_json_flag() {
        let cli = Cli::try_parse_from(["ab-harness", "config", "--json"]).unwrap();
        assert!(matches!(cli.command, Command::Config { json: true }));
    }
}
