//! tbk-pos - command line client for Transbank POS terminals.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use transbank_pos as app;

use app::config::{AppConfig, ConfigLoadResult, LoggingConfig};
use app::PosError;
use app::pos::{self, PosTerminal, RawFrame};

/// Drive a Transbank POS terminal over a serial port.
#[derive(Parser)]
#[command(name = "tbk-pos", version)]
struct Cli {
    /// Config file to use instead of the platform default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use config.toml from current directory (dev mode)
    #[arg(long, global = true)]
    dev: bool,

    /// Serial port, overrides the config file
    #[arg(long, global = true)]
    port: Option<String>,

    /// Baud rate, overrides the config file
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List serial ports visible to the OS
    ListPorts,
    /// Check the terminal is connected
    Poll,
    /// Switch the terminal back to normal mode
    NormalMode,
    /// Load keys from the acquirer
    LoadKeys,
    /// Close the day
    Close,
    /// Transaction count and total since the last close
    Totals,
    /// Fetch the last sale
    LastSale,
    /// Request a sale
    Sale {
        /// Amount, up to 9 digits
        #[arg(long)]
        amount: u64,
        /// Ticket number, up to 6 digits
        #[arg(long)]
        ticket: u32,
        /// Ask the terminal to report intermediate messages
        #[arg(long)]
        send_messages: bool,
    },
    /// Cancel a previous transaction
    Cancel {
        /// Transaction id, up to 6 digits
        #[arg(long)]
        transaction_id: u32,
    },
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Raw frame as printed by `--json`.
#[derive(Serialize)]
struct FrameOutput {
    length: usize,
    fields: Vec<String>,
    hex: String,
}

impl From<&RawFrame> for FrameOutput {
    fn from(frame: &RawFrame) -> Self {
        Self {
            length: frame.len(),
            fields: frame
                .fields()
                .map(|fields| fields.into_iter().map(str::to_string).collect())
                .unwrap_or_default(),
            hex: frame.as_bytes().iter().map(|b| format!("{b:02X}")).collect(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = if let Some(path) = &cli.config {
        path.clone()
    } else if cli.dev {
        PathBuf::from("config.toml")
    } else {
        AppConfig::default_path()
    };

    if let Cmd::InitConfig { force } = cli.cmd {
        init_logging(&LoggingConfig::default())?;
        return init_config(config_path, force);
    }

    let mut config = match AppConfig::try_load(&config_path) {
        ConfigLoadResult::Loaded(config) => config,
        ConfigLoadResult::Missing => AppConfig::default(),
        ConfigLoadResult::Invalid(e) => {
            bail!("Invalid config {}: {e}", config_path.display());
        }
    };
    if let Some(port) = &cli.port {
        config.serial.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.serial.baud_rate = baud;
    }
    config.validate().context("Invalid settings")?;

    let _guard = init_logging(&config.logging)?;
    tracing::info!("Config path: {:?}", config_path);

    if let Cmd::ListPorts = cli.cmd {
        let ports = pos::list_ports()?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&ports)?);
        } else if ports.is_empty() {
            println!("No serial ports found");
        } else {
            for port in &ports {
                match (&port.product, port.vid, port.pid) {
                    (Some(product), Some(vid), Some(pid)) => {
                        println!("{}  {product} [{vid:04x}:{pid:04x}]", port.name)
                    }
                    _ => println!("{}", port.name),
                }
            }
        }
        return Ok(());
    }

    tracing::info!(
        "Opening {} at {} baud",
        config.serial.port,
        config.serial.baud_rate
    );
    let mut terminal = PosTerminal::open_with(&config.serial, config.protocol.engine_config())
        .with_context(|| format!("Failed to open {}", config.serial.port))?;

    let result = run_command(&mut terminal, &cli.cmd, cli.json);

    if let Err(e) = &result
        && e.downcast_ref::<PosError>().is_some_and(PosError::is_transport)
    {
        tracing::error!("Serial link to {} failed, check the cable and port settings", config.serial.port);
    }

    if let Err(e) = terminal.close_port() {
        if result.is_ok() {
            return Err(e.into());
        }
        tracing::warn!("Failed to flush {}: {e}", config.serial.port);
    }
    result
}

fn run_command(terminal: &mut PosTerminal, cmd: &Cmd, json: bool) -> anyhow::Result<()> {
    match cmd {
        Cmd::Poll => {
            terminal.poll()?;
            print_ack(json, "Terminal connected")
        }
        Cmd::NormalMode => {
            terminal.set_normal_mode()?;
            print_ack(json, "Terminal switched to normal mode")
        }
        Cmd::LoadKeys => {
            let response = terminal.load_keys()?;
            print_record(json, &response, || {
                format!(
                    "Load keys: {:?} (code {:02}), commerce {}, terminal {}",
                    response.status, response.response_code, response.commerce_code, response.terminal_id
                )
            })
        }
        Cmd::Close => {
            let response = terminal.close()?;
            print_record(json, &response, || {
                format!(
                    "Close: {:?} (code {:02}), commerce {}, terminal {}",
                    response.status, response.response_code, response.commerce_code, response.terminal_id
                )
            })
        }
        Cmd::Totals => {
            let totals = terminal.get_totals()?;
            print_record(json, &totals, || {
                format!(
                    "Totals: {:?} (code {:02}), {} transactions, total {}",
                    totals.status, totals.response_code, totals.tx_count, totals.tx_total
                )
            })
        }
        Cmd::LastSale => {
            let frame = terminal.last_sale()?;
            print_frame(json, &frame)
        }
        Cmd::Sale {
            amount,
            ticket,
            send_messages,
        } => {
            let frame = terminal.sale(*amount, *ticket, *send_messages)?;
            print_frame(json, &frame)
        }
        Cmd::Cancel { transaction_id } => {
            let frame = terminal.cancellation(*transaction_id)?;
            print_frame(json, &frame)
        }
        Cmd::ListPorts | Cmd::InitConfig { .. } => Ok(()),
    }
}

fn print_ack(json: bool, text: &str) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::json!({ "acknowledged": true }));
    } else {
        println!("{text}");
    }
    Ok(())
}

fn print_record<T: Serialize>(json: bool, record: &T, text: impl FnOnce() -> String) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(record)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

fn print_frame(json: bool, frame: &RawFrame) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&FrameOutput::from(frame))?);
    } else {
        println!("{} bytes: {frame}", frame.len());
    }
    Ok(())
}

fn init_config(path: PathBuf, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    AppConfig::default()
        .save(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!("Wrote default config to {:?}", path);
    println!("{}", path.display());
    Ok(())
}

/// Console logging to stderr, plus a daily rolling file when configured.
///
/// The returned guard flushes the file writer on drop.
fn init_logging(logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Invalid log level")?;

    let console_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let (file_layer, guard) = match &logging.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "tbk-pos.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
