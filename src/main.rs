use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use logwarden::alerts::{Notifier, QueuedNotifier};
use logwarden::config::Config;
use logwarden::supervisor::{self, Supervisor};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

/// Command-line arguments for logwarden
#[derive(Parser)]
#[command(
    name = "logwarden",
    about = "Log and disk space monitor with throttled alerts",
    long_about = "Follows growing log files, reassembles multi-line entries, reports them by level \
                  with rate limiting, watches free disk space, and batches matching entries into \
                  email alerts. Type `status` on stdin for a summary."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        conflicts_with = "quiet",
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, help = "Only log errors (sets RUST_LOG=error)")]
    quiet: bool,

    /// Send a test email through every alerter and exit
    #[arg(long, help = "Send a test alert through every configured email alerter, then exit")]
    email_test: bool,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// # Returns
    ///
    /// `Ok(())` if all arguments are valid, `Err(String)` with error message otherwise
    fn validate(&self) -> Result<(), String> {
        if !self.config.exists() {
            return Err(format!(
                "Configuration file not found: {}",
                self.config.display()
            ));
        }
        if !self.config.is_file() {
            return Err(format!(
                "Configuration path is not a file: {}",
                self.config.display()
            ));
        }

        // Check if file has .toml extension (optional but recommended)
        if self.config.extension().map_or(true, |ext| ext != "toml") {
            warn!(
                "Configuration file does not have .toml extension: {}",
                self.config.display()
            );
        }

        Ok(())
    }

    fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }
}

/// Print the status report whenever `status` is read on stdin
fn serve_status(supervisor: Arc<Mutex<Supervisor>>) {
    for line in io::stdin().lock().lines() {
        match line {
            Ok(command) if command.trim().eq_ignore_ascii_case("status") => {
                let report = supervisor
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .status();
                print!("{}", report);
            }
            Ok(command) if command.trim().is_empty() => {}
            Ok(command) => warn!("Unknown command: {}", command.trim()),
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    cli.validate().map_err(anyhow::Error::msg)?;

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;

    if cli.email_test {
        info!("Testing email alerts");
        let sent = supervisor::email_test(&config).context("Failed to build email alerters")?;
        info!("Sent {} test alerts", sent);
        return Ok(());
    }

    let (notifier, _writer) = QueuedNotifier::spawn_writer(io::stdout());
    let notifier: Arc<dyn Notifier> = Arc::new(notifier);

    let mut supervisor = Supervisor::from_config(&config, Arc::clone(&notifier))
        .context("Failed to initialize monitors")?;
    supervisor.start().context("Failed to start monitors")?;

    let started = supervisor.status();
    if let Err(e) = notifier.notify(started.trim_end()) {
        warn!("Failed to announce startup: {}", e);
    }

    let supervisor = Arc::new(Mutex::new(supervisor));
    let status_supervisor = Arc::clone(&supervisor);
    thread::Builder::new()
        .name("status".to_string())
        .spawn(move || serve_status(status_supervisor))
        .context("Failed to start status thread")?;

    let (shutdown_sender, shutdown_receiver) = mpsc::channel();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down...");
        if let Err(e) = shutdown_sender.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    })
    .context("Failed to install SIGINT handler")?;

    info!("logwarden is running. Press Ctrl+C to stop.");
    // A closed channel means the handler is gone; treat it as shutdown too
    let _ = shutdown_receiver.recv();

    supervisor
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .stop();
    info!("logwarden stopped");
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    // Explicit flags win over RUST_LOG
    if cli.verbose || cli.quiet || std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", cli.log_level());
    }
    env_logger::init();

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
