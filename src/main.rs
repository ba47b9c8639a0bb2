use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use rusty_ratio::data::loader::{self, FileBlockSource};
use rusty_ratio::data::BlockSource;
use rusty_ratio::{Estimate, EvaluationResult, Provenance, Session};

#[derive(Debug, Parser)]
#[command(
    name = "rusty-ratio",
    about = "Reduce multi-collector intensities to isotope ratios with propagated uncertainties"
)]
struct Cli {
    /// Session file (JSON): configuration, constants, steps and optionally blocks.
    session: PathBuf,

    /// Raw blocks (.json or .csv, or a directory holding `<session id>.json|csv`).
    /// Replaces any blocks stored in the session file.
    #[arg(long)]
    blocks: Option<PathBuf>,

    /// Session id used to pick a file when `--blocks` is a directory.
    #[arg(long, default_value = "session")]
    session_id: String,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,

    /// Evaluate blocks in parallel.
    #[arg(long)]
    parallel: bool,
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    order: &'a [String],
    results: Vec<EvaluationResult>,
    block_errors: Vec<String>,
    session_errors: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut state = loader::load_session_file(&cli.session)?;
    if cli.parallel {
        state.config.parallel_blocks = true;
    }
    // steps are validated against the channels of the blocks they will run on
    if let Some(path) = &cli.blocks {
        let blocks = FileBlockSource::new(path).load_blocks(&cli.session_id)?;
        state.replace_blocks(blocks);
    }
    let mut session = Session::from_state(state)
        .with_context(|| format!("validating {}", cli.session.display()))?;

    let report = session.reduce().context("running reduction")?;

    if cli.json {
        let out = JsonReport {
            order: &report.order,
            results: report.results(),
            block_errors: report.block_errors.iter().map(ToString::to_string).collect(),
            session_errors: report.session_errors.iter().map(ToString::to_string).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for result in report.results() {
        print_result(&result);
    }
    for err in &report.block_errors {
        eprintln!("error: {err}");
    }
    for err in &report.session_errors {
        eprintln!("error: {err}");
    }
    Ok(())
}

fn print_result(result: &EvaluationResult) {
    let place = match result.provenance {
        Provenance::Session => String::new(),
        Provenance::Block { block } => format!(" [block {block}]"),
        Provenance::Cycle { block, cycle } => format!(" [block {block}, cycle {cycle}]"),
    };
    match &result.estimate {
        Estimate::Scalar(m) => println!(
            "{}{place} = {} ± {}{}",
            result.step,
            m.value,
            m.sigma,
            if m.included { "" } else { " (excluded)" }
        ),
        Estimate::Vector(items) => {
            let included = items.iter().flatten().filter(|m| m.included).count();
            println!(
                "{}{place}: {} values, {included} included",
                result.step,
                items.len()
            );
        }
    }
}
