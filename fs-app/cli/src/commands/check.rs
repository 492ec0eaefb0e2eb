//! Check command: run the checker over a device or image file

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ufsck::config::{CheckConfig, RunMode};
use ufsck::confirm::{AlwaysYes, Confirm};
use ufsck::engine::Engine;
use ufsck::report::{Action, RunReport, RunStatus};

/// Check and repair a filesystem
#[derive(Parser, Debug)]
#[command(about = "Check and repair an FFS/UFS volume")]
pub struct CheckArgs {
    /// Device or image file to check
    pub device: PathBuf,

    /// Report problems without repairing anything
    #[arg(short = 'n', conflicts_with_all = ["yes", "preen", "background"])]
    pub no: bool,

    /// Answer yes to every repair question
    #[arg(short = 'y', conflicts_with_all = ["preen", "background"])]
    pub yes: bool,

    /// Apply the safe repairs without asking
    #[arg(short = 'p', conflicts_with = "background")]
    pub preen: bool,

    /// Throttled read-only check, for a volume in use
    #[arg(short = 'B')]
    pub background: bool,

    /// Ignore the soft-updates journal and run the full check
    #[arg(long = "no-journal")]
    pub no_journal: bool,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,

    /// JSON file with configuration overrides
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Buffer cache capacity, in buffers
    #[arg(long = "cache-blocks")]
    pub cache_blocks: Option<usize>,
}

impl CheckArgs {
    /// Mode picked on the command line, if any
    fn mode(&self) -> Option<RunMode> {
        if self.no {
            Some(RunMode::ReadOnly)
        } else if self.yes {
            Some(RunMode::Interactive)
        } else if self.preen {
            Some(RunMode::Preen)
        } else if self.background {
            Some(RunMode::Background)
        } else {
            None
        }
    }

    fn build_config(&self) -> Result<CheckConfig> {
        let mut config = match &self.config {
            Some(path) => CheckConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => CheckConfig::with_mode(RunMode::Interactive),
        };
        if let Some(mode) = self.mode() {
            config.mode = mode;
        }
        if self.no_journal {
            config.use_journal = false;
        }
        if let Some(n) = self.cache_blocks {
            config.cache_blocks = n;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Asks on the terminal, like the format prompt did
struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&mut self, question: &str) -> bool {
        print!("{} [y/N] ", question);
        if std::io::stdout().flush().is_err() {
            return false;
        }
        let mut input = String::new();
        match std::io::stdin().lock().read_line(&mut input) {
            Ok(0) | Err(_) => {
                println!();
                false
            }
            Ok(_) => input.trim().eq_ignore_ascii_case("y") || input.trim().eq_ignore_ascii_case("yes"),
        }
    }
}

/// Runs the check and returns the process exit status
pub fn run(args: CheckArgs) -> Result<i32> {
    if !args.device.exists() {
        bail!("Device {:?} does not exist", args.device);
    }
    let config = args.build_config()?;
    info!("Checking {} in {:?} mode", args.device.display(), config.mode);

    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let flag = interrupt.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })
        .context("Failed to install interrupt handler")?;
    }

    let confirm: Box<dyn Confirm> = if args.yes {
        Box::new(AlwaysYes)
    } else {
        Box::new(TerminalConfirm)
    };
    let report = Engine::new(config)
        .with_confirm(confirm)
        .with_interrupt(interrupt)
        .run_path(&args.device);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if report.status == RunStatus::Rerun {
        warn!("Run did not complete; run the check again");
    }
    Ok(report.status.exit_code())
}

fn print_report(report: &RunReport) {
    let mut phase = None;
    for d in &report.diagnostics {
        if phase != Some(d.phase) {
            println!("{}", d.phase.banner());
            phase = Some(d.phase);
        }
        let suffix = match d.action {
            Action::Fixed => "  (FIXED)",
            Action::Declined => "  (NOT FIXED)",
            Action::Noted => "",
        };
        println!("{}{}", d.message, suffix);
    }
    if let Some(err) = &report.error {
        println!("{}: {}", report.device, err);
    }
    let u = &report.usage;
    println!(
        "{} files, {} directories, {} used, {} free ({} frags, {} blocks)",
        u.files,
        u.dirs,
        u.used_frags,
        u.free_frags + u.free_blocks,
        u.free_frags,
        u.free_blocks
    );
    if report.journal_replayed {
        println!("***** JOURNAL REPLAYED *****");
    }
    match report.status {
        RunStatus::Repaired => println!("\n***** FILE SYSTEM WAS MODIFIED *****"),
        RunStatus::Unresolved => println!("\n***** FILE SYSTEM STILL DIRTY *****"),
        RunStatus::Rerun => println!("\n***** PLEASE RERUN FSCK *****"),
        RunStatus::Unrecoverable => println!("\n***** CANNOT CHECK {} *****", report.device),
        RunStatus::Clean if report.modified => println!("\n***** FILE SYSTEM WAS MODIFIED *****"),
        RunStatus::Clean => {}
    }
}
