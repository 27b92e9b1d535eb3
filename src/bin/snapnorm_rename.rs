use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use snapnorm::{canonicalize_tree_with, init_logging, FileOutcome, RenameCli, RunSummary};

fn main() -> ExitCode {
    let cli = RenameCli::parse();
    if let Err(err) = init_logging(cli.verbose, cli.log_format) {
        eprintln!("failed to initialize logging: {err}");
    }

    let Some(directory) = cli.directory.as_deref() else {
        eprintln!("usage: snapnorm_rename <directory> [--apply] [--quiet] [--no-canonical]");
        return ExitCode::from(1);
    };
    if !directory.is_dir() {
        eprintln!("{} is not a directory", directory.display());
        return ExitCode::from(1);
    }

    match run(&cli, directory) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: &RenameCli, directory: &Path) -> Result<RunSummary> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let controls = cli.build_controls();
    let quiet = cli.quiet;

    let summary = runtime
        .block_on(canonicalize_tree_with(directory, &controls, Utc::now(), |outcome| {
            if !quiet {
                print_outcome(directory, outcome);
            }
        }))
        .with_context(|| format!("failed to canonicalize {}", directory.display()))?;

    if !quiet {
        if controls.apply() {
            println!(
                "{} renamed, {} unchanged, {} failed",
                summary.renamed, summary.unchanged, summary.failed
            );
        } else {
            println!(
                "dry run: {} would be renamed, {} unchanged, {} failed (pass --apply to rename)",
                summary.would_rename, summary.unchanged, summary.failed
            );
        }
    }
    Ok(summary)
}

fn print_outcome(root: &Path, outcome: &FileOutcome) {
    let show = |path: &Path| path.strip_prefix(root).unwrap_or(path).display().to_string();
    match outcome {
        FileOutcome::Renamed { from, to } | FileOutcome::WouldRename { from, to } => {
            println!("{} -> {}", show(from), show(to));
        }
        FileOutcome::Failed { path, error } => eprintln!("skipped {}: {error}", show(path)),
        FileOutcome::Unchanged { .. } => {}
    }
}
