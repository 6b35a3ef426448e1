use drover_core::command::CommandDialect;
use drover_core::config::CampaignConfig;
use drover_core::cores::CoreAllocator;
use drover_core::session::Session;

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Driver for a distributed fuzzing campaign", long_about = None)]
struct Cli {
    /// Path to the fuzzing session config
    #[clap(short, long, value_parser)]
    config: PathBuf,
    /// Print processes info every N seconds
    #[clap(long, default_value_t = 300)]
    print_every: u64,
    /// The number of the core from which the other cores are counted
    #[clap(long, default_value_t = 0)]
    start_core: usize,
    /// Command line layout expected by the fuzzer binaries
    #[clap(long, value_enum, default_value = "extended")]
    dialect: DialectArg,
    /// Print resolved start commands and enable debug logging
    #[clap(long)]
    debug: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DialectArg {
    #[value(name = "basic")]
    Basic,
    #[value(name = "extended")]
    Extended,
}

impl From<DialectArg> for CommandDialect {
    fn from(value: DialectArg) -> Self {
        match value {
            DialectArg::Basic => CommandDialect::Basic,
            DialectArg::Extended => CommandDialect::Extended,
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = CampaignConfig::load_from_file(&cli.config)?;
    let mut session = Session::build(
        &config,
        CoreAllocator::new(cli.start_core),
        cli.dialect.into(),
    )?;

    if cli.debug {
        println!(
            "Start commands ({} cores pinned, cwd: {}):",
            session.cores().allocated(),
            session.root().display()
        );
        for (name, handle) in session.handles() {
            println!("  {name}: {}", handle.command());
        }
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))
            .map_err(|e| anyhow::anyhow!("Failed to install interrupt handler: {}", e))?;
    }

    for (name, outcome) in session.start_all() {
        match outcome {
            Ok(pid) => println!("Starting \"{name}\" process (pid {pid})"),
            Err(err) => eprintln!("Failed to start \"{name}\": {err}"),
        }
    }

    while !interrupted.load(Ordering::SeqCst) {
        println!("{}", chrono::Local::now().format("%H:%M:%S%.3f"));
        for (name, status) in session.status_all() {
            println!("  {name}: {status}");
        }
        sleep_until_interrupt(cli.print_every, &interrupted);
    }

    println!("Interrupted, terminating campaign...");
    let failures = session.terminate_all();
    for (name, err) in &failures {
        eprintln!("Failed to terminate \"{name}\": {err}");
    }
    if failures.is_empty() {
        println!("All processes terminated.");
    }

    Ok(())
}

/// Sleeps for the print interval in small steps so an interrupt cuts the
/// wait short instead of stalling teardown.
fn sleep_until_interrupt(seconds: u64, interrupted: &AtomicBool) {
    let deadline = Instant::now() + Duration::from_secs(seconds.max(1));
    while Instant::now() < deadline && !interrupted.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(250));
    }
}
