use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use snapnorm::{compact_file, init_logging, CompactCli, CompactControls, CompactionSummary};

fn main() -> ExitCode {
    let cli = CompactCli::parse();
    if let Err(err) = init_logging(cli.verbose, cli.log_format) {
        eprintln!("failed to initialize logging: {err}");
    }

    let path = match cli.files.as_slice() {
        [path] => path,
        [] => {
            eprintln!("usage: snapnorm_compact <file> [--maxWidth=N] [--quality=N] [--targetBytes=N]");
            return ExitCode::from(2);
        }
        _ => {
            eprintln!("expected exactly one file, got {}", cli.files.len());
            return ExitCode::from(2);
        }
    };

    match run(path, &cli.build_controls()) {
        Ok(summary) if cli.json => match serde_json::to_string_pretty(&summary) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("error: failed to serialize summary: {err}");
                ExitCode::from(1)
            }
        },
        Ok(summary) => {
            print_summary(path, &summary);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(path: &Path, controls: &CompactControls) -> Result<CompactionSummary> {
    compact_file(path, controls).with_context(|| format!("failed to compact {}", path.display()))
}

fn print_summary(path: &Path, summary: &CompactionSummary) {
    for filter in &summary.filters {
        println!("stripped {}: {} bytes", filter.kind, filter.report.bytes_removed);
    }
    if let Some(state) = summary.budget_state {
        println!("{} after {} pass(es)", state, summary.passes.len());
    }
    if summary.assets_written > 0 {
        println!("extracted {} asset(s)", summary.assets_written);
    }
    let saved = summary.original_bytes.saturating_sub(summary.final_bytes);
    let percent = if summary.original_bytes == 0 {
        0.0
    } else {
        saved as f64 * 100.0 / summary.original_bytes as f64
    };
    println!(
        "{}: {} -> {} bytes ({percent:.1}% smaller, {} encodes, {} cache hits)",
        path.display(),
        summary.original_bytes,
        summary.final_bytes,
        summary.encodes,
        summary.cache_hits
    );
}
