//! ufsck command line interface
//!
//! Checks and repairs FFS/UFS volumes, or prints what their metadata says.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};

mod commands;

/// ufsck - offline FFS/UFS consistency checker
#[derive(Parser)]
#[command(
    name = "ufsck",
    about = "ufsck command-line interface",
    version = env!("CARGO_PKG_VERSION"),
    author = "ufsck contributors"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a volume and repair what is wrong with it
    Check(commands::check::CheckArgs),

    /// Print the superblock and cylinder group summaries
    Info(commands::info::InfoArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new().filter_level(log_level).init();

    info!("ufsck v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Check(args) => {
            let code = commands::check::run(args)?;
            std::process::exit(code);
        }
        Commands::Info(args) => commands::info::run(args),
    }
}
