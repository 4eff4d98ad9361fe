//! Command-line front end for runtime dependency capture.
//!
//! Usage:
//!   loadtrace capture --entry com.acme.Demo --path build/classes --path libs/util.zip --dest store
//!   loadtrace catalog --path build/classes
//!   loadtrace pass ...   (relaunch protocol, emitted by `capture`)
//!
//! Every pass prints one manifest line on stdout; logs go to stderr.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use loadtrace::capture::sink;
use loadtrace::manifest::UnitRecord;
use loadtrace::{
    CaptureRequest, Capturer, Catalog, Manifest, PassArgs, SecondPassSettings, config,
    logging, second_pass,
};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "loadtrace")]
#[command(about = "Capture the units and resources a program loads at run time")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). LOADTRACE_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an entry point under the tracking loader.
    Capture(CaptureArgs),
    /// Run one relaunched pass.
    #[command(hide = true)]
    Pass(PassArgs),
    /// List the units a scan of the candidate paths indexes.
    Catalog(CatalogArgs),
}

#[derive(Args, Debug)]
struct CaptureArgs {
    /// Qualified name of the entry unit.
    #[arg(long)]
    entry: String,
    /// Candidate path (directory or archive). Repeatable; native separators split
    /// lists. Defaults to LOADTRACE_PATH.
    #[arg(long = "path")]
    paths: Vec<OsString>,
    /// Destination store. Without it nothing is persisted and no pass is relaunched.
    #[arg(long)]
    dest: Option<PathBuf>,
    /// Also capture resolved resources.
    #[arg(long)]
    resources: bool,
    /// Count the entry unit itself as a dependency.
    #[arg(long)]
    include_entry: bool,
    /// Wait this long after the entry returns (falls back to LOADTRACE_GRACE_MS).
    #[arg(long)]
    grace_ms: Option<u64>,
    /// Skip the relaunched passes.
    #[arg(long)]
    single_pass: bool,
    /// Upper bound on passes, the in-process one included (falls back to LOADTRACE_MAX_PASSES).
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_passes: Option<u32>,
}

#[derive(Args, Debug)]
struct CatalogArgs {
    /// Defaults to LOADTRACE_PATH.
    #[arg(long = "path")]
    paths: Vec<OsString>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let capturer = Capturer::default();

    match cli.command {
        Command::Capture(args) => run_capture(&capturer, args),
        Command::Pass(args) => {
            let capture = second_pass::run_pass(&args, &capturer)?;
            emit(&Manifest::from_capture(args.pass, &args.entry, &capture))
        }
        Command::Catalog(args) => run_catalog(args),
    }
}

fn run_capture(capturer: &Capturer, args: CaptureArgs) -> Result<()> {
    let paths = candidate_paths(&args.paths)?;
    let grace = match args.grace_ms {
        Some(millis) => (millis > 0).then(|| Duration::from_millis(millis)),
        None => config::grace_from_env()?,
    };

    let mut request = CaptureRequest::new(&args.entry, paths)
        .include_entry(args.include_entry)
        .grace(grace);
    match &args.dest {
        Some(dest) => {
            request = request.unit_sink(sink::store()).store(dest);
            if args.resources {
                request = request.resource_sink(sink::store());
            }
            if !args.single_pass {
                let mut settings = SecondPassSettings::from_env()?;
                if let Some(max) = args.max_passes {
                    settings.max_passes = max;
                }
                request = request.second_pass(settings);
            }
        }
        None => {
            request = request.unit_sink(sink::collect());
            if args.resources {
                request = request.resource_sink(sink::collect());
            }
        }
    }

    let capture = capturer
        .capture(request)
        .with_context(|| format!("starting capture of {}", args.entry))?;
    capture
        .wait()
        .with_context(|| format!("capture of {} failed", args.entry))?;
    emit(&Manifest::from_capture(1, &args.entry, &capture))
}

fn run_catalog(args: CatalogArgs) -> Result<()> {
    let paths = candidate_paths(&args.paths)?;
    let catalog = Catalog::scan(&paths).context("scanning candidate paths")?;
    for entry in catalog.entries() {
        let record = UnitRecord {
            name: entry.name.clone(),
            key: entry.key.to_string(),
            path: entry.relative_path.clone(),
            size: entry.content.len(),
        };
        println!(
            "{}",
            serde_json::to_string(&record).context("serializing catalog entry")?
        );
    }
    Ok(())
}

fn emit(manifest: &Manifest) -> Result<()> {
    println!("{}", manifest.to_json_line()?);
    Ok(())
}

fn candidate_paths(raw: &[OsString]) -> Result<Vec<PathBuf>> {
    let explicit = raw
        .iter()
        .flat_map(|value| config::split_search_path(value))
        .collect();
    let paths = config::candidate_paths_or_env(explicit);
    if paths.is_empty() {
        bail!("no candidate paths: pass --path or set {}", config::ENV_SEARCH_PATH);
    }
    Ok(paths)
}
