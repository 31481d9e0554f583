//! Runs a cache coherence latency measurement and prints one CSV row per problem size.
//!
//! # Usage
//!
//! ```text
//! coherence_bench [--parameters <FILE>] [--env-prefix <PREFIX>]
//! ```
//!
//! Parameters come from the optional TOML parameter file, overridden by environment variables
//! that carry the prefix (`CCBENCH_` by default), so `CCBENCH_USE_MODE=S` overrides `USE_MODE`.
//!
//! Every row is `size, cycles per slot, nanoseconds per slot, counter values per slot`, with
//! one slot per processor of `CPU_LIST`. Logs go to stderr and are filtered with `RUST_LOG`.
//!
//! The exit code is 1 for configuration problems, 2 for worker failures and 127 if memory or
//! threads could not be obtained.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use argh::FromArgs;
use coherence_bench::{
    DEFAULT_ENV_PREFIX, Error, Kernel, ParameterStore, PointerChase, RunConfig, Topology,
};
use itertools::Itertools;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Measures memory access latency between processors under controlled cache coherence states.
#[derive(FromArgs)]
struct Args {
    /// TOML file with the benchmark parameters
    #[argh(option)]
    parameters: Option<PathBuf>,

    /// prefix of the environment variables that override parameters
    #[argh(option, default = "DEFAULT_ENV_PREFIX.to_string()")]
    env_prefix: String,
}

fn main() -> ExitCode {
    let args: Args = argh::from_env();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(args: &Args) -> Result<(), Error> {
    let store = match &args.parameters {
        Some(path) => ParameterStore::from_file(path)?,
        None => ParameterStore::new(),
    }
    .with_environment(&args.env_prefix);

    let config = RunConfig::new(&store, Topology::detect()?)?;
    let size_count = config.schedule().len();

    let seed = rand::random::<u64>();
    debug!(seed, "pointer chase seed");

    let mut kernel = Kernel::initialize(config, Arc::new(PointerChase::new(seed)))?;

    let mut stdout = io::stdout().lock();

    for index in 0..size_count {
        let results = kernel.measure(index)?;

        // A closed stdout (e.g. piped into `head`) ends the run early; nothing left to report to.
        if writeln!(stdout, "{}", results.iter().join(",")).is_err() {
            info!("stdout closed, stopping after {} of {size_count} sizes", index + 1);
            break;
        }
    }

    kernel.teardown();

    Ok(())
}
