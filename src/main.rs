//! Terminal front end for osci_control
//!
//! Starts the `hpctrl` helper, optionally connects to the oscilloscope, then forwards
//! operator lines:
//! - lines whose first word is `q` are queries; the answer is printed
//! - `clear`, `cls` and `clr` are ignored
//! - `quit` leaves the terminal
//! - everything else is sent without waiting for an answer
//!
//! # Usage
//!
//! ```bash
//! osci_control --address 7
//! osci_control --testing --config config/osci.toml
//! osci_control --init-config
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use osci_control::config::{Settings, DEFAULT_CONFIG_PATH};
use osci_control::terminal::TerminalInput;
use osci_control::{logging, validation, Oscilloscope};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "osci_control")]
#[command(about = "Terminal for an HP 83480A oscilloscope behind hpctrl", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Launch the fake helper instead of the real one
    #[arg(long)]
    testing: bool,

    /// Connect to this bus address and enter command mode before reading input
    #[arg(long, value_parser = parse_address)]
    address: Option<u8>,

    /// Write the effective settings to the settings file and exit
    #[arg(long)]
    init_config: bool,
}

fn parse_address(text: &str) -> Result<u8, String> {
    validation::parse_bus_address(text).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    if cli.testing {
        settings.helper.testing = true;
    }
    settings.validate()?;
    if cli.init_config {
        settings
            .save(&cli.config)
            .with_context(|| format!("Failed to write {}", cli.config.display()))?;
        println!("Settings written to {}", cli.config.display());
        return Ok(());
    }

    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;
    settings
        .ensure_directories()
        .context("Failed to create working directories")?;

    let mut scope = Oscilloscope::from_settings(&settings);
    scope.start().await.context("Failed to start helper")?;

    if let Some(address) = cli.address {
        match scope.initialize(address).await {
            Ok(()) => println!("Connected to oscilloscope at address {address}"),
            Err(e) => eprintln!("{e}"),
        }
    }

    let result = run_terminal(&mut scope).await;
    scope.shutdown().await;
    result
}

async fn run_terminal(scope: &mut Oscilloscope) -> Result<()> {
    let timeout = scope.response_timeout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        prompt()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match TerminalInput::parse(&line) {
            TerminalInput::Empty | TerminalInput::Clear => {}
            TerminalInput::Quit => break,
            TerminalInput::Query(query) => match scope.custom_query(query, timeout).await {
                Ok(answer) => println!("{answer}"),
                Err(e) => eprintln!("{e}"),
            },
            TerminalInput::Command(command) => {
                if let Err(e) = scope.custom(command).await {
                    eprintln!("{e}");
                }
            }
        }
    }
    Ok(())
}

fn prompt() -> Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, ">>> ")?;
    stdout.flush()?;
    Ok(())
}
