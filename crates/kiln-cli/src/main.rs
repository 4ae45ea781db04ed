//! kiln - compute runtime command line
//!
//! Lists backends and devices, inspects universal binaries and builds them
//! through the configured toolchain.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kiln_core::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Device-agnostic compute runtime tools")]
#[command(long_about = "
Inspect the compute backends and devices kiln sees, and work with universal
binaries (FUBA archives).

Examples:
  kiln backends                                  # Backends compiled in and available
  kiln devices --backend vulkan                  # Devices of one backend
  kiln fuba info kernels.fuba                    # Binaries inside an archive
  kiln fuba match kernels.fuba --backend cuda    # Binary each device would load
  kiln fuba build kernels.kc -o kernels.fuba -t cuda:sm_86 -t vulkan:1.3

Logging is controlled by KILN_LOG (e.g. KILN_LOG=kiln_compute=trace).
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON config file (defaults to KILN_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List backends and whether they are usable
    #[command(visible_alias = "b")]
    Backends,

    /// List devices per backend
    #[command(visible_alias = "d")]
    Devices(DevicesArgs),

    /// Universal binary tools
    Fuba(FubaArgs),
}

#[derive(Args)]
struct DevicesArgs {
    /// Only this backend (host, cuda, vulkan)
    #[arg(short, long)]
    backend: Option<String>,
}

#[derive(Args)]
struct FubaArgs {
    #[command(subcommand)]
    command: FubaCommands,
}

#[derive(Subcommand)]
enum FubaCommands {
    /// Show the binaries inside an archive
    Info(FubaInfoArgs),

    /// Show which binary each device of a backend would load
    Match(FubaMatchArgs),

    /// Compile a source file for several targets into an archive
    Build(FubaBuildArgs),
}

#[derive(Args)]
struct FubaInfoArgs {
    /// Archive file(s)
    #[arg(required = true)]
    input: Vec<PathBuf>,

    /// Also list every function and its arguments
    #[arg(short, long)]
    functions: bool,
}

#[derive(Args)]
struct FubaMatchArgs {
    /// Archive file
    input: PathBuf,

    /// Backend whose devices are matched (defaults to the best available)
    #[arg(short, long)]
    backend: Option<String>,
}

#[derive(Args)]
struct FubaBuildArgs {
    /// Program source
    source: PathBuf,

    /// Output archive
    #[arg(short, long)]
    output: PathBuf,

    /// Targets, e.g. cuda:sm_86, vulkan:1.3, opencl:3.0:spir, host
    #[arg(short, long = "target", required = true)]
    targets: Vec<String>,

    /// Compiler executable (overrides toolchain.compiler)
    #[arg(long)]
    compiler: Option<PathBuf>,

    /// Extra compiler flags
    #[arg(long = "flag", allow_hyphen_values = true)]
    flags: Vec<String>,

    /// Emit debug info
    #[arg(long)]
    debug: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("KILN_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(Config::from_env()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Backends => commands::backends::run(cli.verbose),
        Commands::Devices(args) => commands::devices::run(args, &config, cli.verbose),
        Commands::Fuba(args) => match args.command {
            FubaCommands::Info(args) => commands::fuba::run_info(args, cli.verbose),
            FubaCommands::Match(args) => commands::fuba::run_match(args, &config),
            FubaCommands::Build(args) => commands::fuba::run_build(args, &config),
        },
    }
}
