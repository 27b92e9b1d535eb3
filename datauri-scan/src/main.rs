//! Prints an inventory of the base64 images embedded in a captured page.

use clap::Parser;
use datauri_scan::{inventory, ResourceSummary};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    name = "datauri_scan",
    version,
    about = "List the base64 image payloads embedded in a captured page as JSON"
)]
struct Args {
    /// HTML file to scan; stdin when omitted or `-`
    input: Option<PathBuf>,

    /// Only report resources whose MIME type starts with this prefix
    #[arg(long)]
    mime: Option<String>,

    /// Print per-MIME totals instead of one entry per resource
    #[arg(long, default_value_t = false)]
    totals: bool,
}

#[derive(Debug, Default, Serialize)]
struct MimeTotal {
    count: usize,
    encoded_bytes: usize,
    decoded_bytes: usize,
    undecodable: usize,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("datauri_scan: {err}");
            ExitCode::from(1)
        }
    }
}

fn run(args: &Args) -> Result<(), String> {
    let document = match args.input.as_deref() {
        None => read_stdin()?,
        Some(path) if path == Path::new("-") => read_stdin()?,
        Some(path) => {
            fs::read(path).map_err(|err| format!("failed to read '{}': {err}", path.display()))?
        }
    };

    let resources: Vec<ResourceSummary> = inventory(&document)
        .into_iter()
        .filter(|resource| {
            args.mime.as_deref().map_or(true, |prefix| {
                resource
                    .mime
                    .to_ascii_lowercase()
                    .starts_with(&prefix.to_ascii_lowercase())
            })
        })
        .collect();

    let json = if args.totals {
        serde_json::to_string_pretty(&totals(&resources))
    } else {
        serde_json::to_string_pretty(&resources)
    }
    .map_err(|err| format!("failed to serialize JSON: {err}"))?;
    println!("{json}");
    Ok(())
}

fn totals(resources: &[ResourceSummary]) -> BTreeMap<String, MimeTotal> {
    let mut by_mime: BTreeMap<String, MimeTotal> = BTreeMap::new();
    for resource in resources {
        let entry = by_mime.entry(resource.mime.to_ascii_lowercase()).or_default();
        entry.count += 1;
        entry.encoded_bytes += resource.encoded_len;
        match resource.decoded_len {
            Some(len) => entry.decoded_bytes += len,
            None => entry.undecodable += 1,
        }
    }
    by_mime
}

fn read_stdin() -> Result<Vec<u8>, String> {
    let mut buf = Vec::new();
    io::stdin()
        .read_to_end(&mut buf)
        .map_err(|err| format!("failed to read stdin: {err}"))?;
    Ok(buf)
}
