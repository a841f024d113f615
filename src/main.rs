//! Command-line front end for the pulse control core.
//!
//! Loads a sequence file, drives the board through its lifecycle and
//! reports status. The board is reached through the driver executable
//! named in the configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use pulse_ctrl::config::Settings;
use pulse_ctrl::dispatch::Dispatcher;
use pulse_ctrl::driver::SubprocessTransport;
use pulse_ctrl::instruction::{self, Instruction};
use pulse_ctrl::session::DeviceSession;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "pulse_ctrl")]
#[command(about = "Program and run a pulse generator board")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config/pulse.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a sequence file without touching the board
    Validate {
        /// JSON file holding the instruction sequence
        file: PathBuf,
    },
    /// Program a sequence and start it
    Run {
        /// JSON file holding the instruction sequence
        file: PathBuf,

        /// Wait up to this many seconds for the program to stop
        #[arg(long)]
        wait: Option<u64>,
    },
    /// Print the board's status register
    Status,
    /// Stop a running program and reset the board
    Halt,
}

fn load_sequence(path: &PathBuf) -> Result<Vec<Instruction>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read sequence file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse sequence file {}", path.display()))
}

async fn connected_session(settings: &Settings) -> Result<DeviceSession> {
    let transport = SubprocessTransport::new(settings.driver.executable.clone());
    let session = DeviceSession::new(Dispatcher::new(transport))
        .with_wait_poll_interval(settings.poller.wait_poll_interval);
    session
        .connect(settings.board)
        .await
        .context("failed to connect to board")?;
    Ok(session)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config).context("failed to load configuration")?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&settings.application.log_level),
    )
    .init();

    match cli.command {
        Command::Validate { file } => {
            let sequence = load_sequence(&file)?;
            let (instructions, warnings) =
                instruction::normalize_sequence(&sequence, settings.board.core_clock_mhz)?;
            for warning in &warnings {
                warn!("{warning}");
            }
            println!(
                "{}: {} instructions valid at {} MHz",
                file.display(),
                instructions.len(),
                settings.board.core_clock_mhz
            );
        }
        Command::Run { file, wait } => {
            let sequence = load_sequence(&file)?;
            let session = connected_session(&settings).await?;

            let warnings = session.program(&sequence).await?;
            for warning in &warnings {
                warn!("{warning}");
            }
            session.start().await?;
            info!("sequence from {} started", file.display());

            if let Some(secs) = wait {
                let stopped = session
                    .wait_until_stopped(Duration::from_secs(secs))
                    .await?;
                if stopped {
                    println!("program finished");
                } else {
                    println!("program still running after {secs}s");
                }
            }
        }
        Command::Status => {
            let session = connected_session(&settings).await?;
            let status = session.status().await?;
            println!(
                "raw=0x{:x} running={} stopped={} reset={} waiting={}",
                status.raw, status.running, status.stopped, status.reset, status.waiting
            );
        }
        Command::Halt => {
            let session = connected_session(&settings).await?;
            session.disconnect().await;
            println!("board halted and reset");
        }
    }

    Ok(())
}
