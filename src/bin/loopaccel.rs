//! Example analysis CLI: loads a `FormatB` JSON fixture, runs the
//! acceleration-and-chaining engine over it, and prints the resulting
//! verdict and proof sketch.
//!
//! This binary is the "driver glue" `spec.md` §1 calls out as an external
//! collaborator — it exists only to give the library something to run
//! end-to-end in this repository; a real CLI would also accept Format A/B
//! text input (`spec.md` §6), which this crate does not parse.

#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use loopaccel::config::Config;
use loopaccel::formats::{FormatB, InMemoryFormatB, ItsSource};
use loopaccel::recurrence::StandardRecurrenceOracle;
use loopaccel::smt::LinearArithmeticOracle;
use loopaccel::Context;

#[derive(Parser, Debug)]
#[command(name = "loopaccel", about = "Derive an asymptotic runtime bound for an ITS")]
struct Cli {
    /// Path to a `FormatB` JSON fixture (see `loopaccel::formats::FormatB`).
    input: PathBuf,

    /// Path to a JSON `Config` override; defaults are used for any field
    /// left out (`spec.md` §6 "Configuration").
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit the proof sketch as well as the verdict.
    #[arg(long)]
    show_sketch: bool,
}

fn load_config(path: &Option<PathBuf>) -> anyhow::Result<Config> {
    match path {
        None => Ok(Config::default()),
        Some(p) => {
            let text = fs::read_to_string(p).map_err(|e| anyhow::anyhow!("reading config {}: {e}", p.display()))?;
            serde_json::from_str(&text).map_err(|e| anyhow::anyhow!("parsing config {}: {e}", p.display()))
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_target(false).init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    let text = fs::read_to_string(&cli.input).map_err(|e| anyhow::anyhow!("reading {}: {e}", cli.input.display()))?;
    let fmt: FormatB = serde_json::from_str(&text).map_err(|e| anyhow::anyhow!("parse fail: {e}"))?;

    let mut cx = Context::new();
    let source = InMemoryFormatB(fmt);
    let mut its = source.load(&mut cx).map_err(|e| anyhow::anyhow!("parse fail: {e}"))?;

    let mut oracle = LinearArithmeticOracle::new();
    let mut rec = StandardRecurrenceOracle::new();
    let report = loopaccel::run(&mut its, &mut cx, &mut oracle, &mut rec, &cfg);

    println!("verdict: {:?}", report.verdict);
    if let Some(guard) = &report.witness_guard {
        println!("witness guard: {} atom(s)", guard.atoms.len());
    }
    if cli.show_sketch {
        println!("{}", report.sketch.render());
    }

    // Every branch above that reaches here produced a `Report` — even
    // `Verdict::Unknown` is a produced verdict (`spec.md` §6), not a
    // driver/parser failure, so the process always exits 0 from this point;
    // only the earlier `anyhow::Result` `Err` returns (bad input, parse
    // failure) are reserved for a non-zero exit.
    Ok(())
}
