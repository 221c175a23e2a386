// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// XMODEM / YMODEM receiver and serial file browser
mod buffer;
mod checksum;
mod header;
mod logging;
mod path;
mod protocol;
mod receiver;
mod serial;
mod shell;
mod storage;

use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};
use receiver::{ReceiveConfig, ReceiveError, ReceivedFile, Session, SessionStatus, StartError, Timeouts};
use serial::RealSerialPort;
use shell::{Shell, ShellConfig};
use storage::RootedStorage;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Parser)]
#[command(name = "xyrecv")]
#[command(about = "XMODEM/YMODEM receiver and serial file browser", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name = "BITS", value_parser = parse_data_bits)]
    data_bits: DataBits,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none", value_parser = parse_parity)]
    parity: Parity,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name = "BITS", value_parser = parse_stop_bits)]
    stop_bits: StopBits,

    /// Host directory exposed as the device's root
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Inter-byte timeout inside a block
    #[arg(long, default_value = "1000", value_name = "MS")]
    short_timeout_ms: u64,

    /// Idle timeout before re-prompting the sender
    #[arg(long, default_value = "3000", value_name = "MS")]
    long_timeout_ms: u64,

    /// Use the 8-bit checksum instead of CRC-16
    #[arg(long)]
    checksum: bool,

    /// Only accept 128-byte blocks
    #[arg(long)]
    small_blocks: bool,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the file browser shell on the port
    Shell,
    /// Receive one file with XMODEM
    Rx {
        /// Destination path under the root
        file: String,
    },
    /// Receive a YMODEM batch
    Rb {
        /// Directory under the root to receive into
        #[arg(default_value = "/")]
        dir: String,
    },
}

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Receive(#[from] ReceiveError),

    #[error("serial channel error: {0}")]
    Channel(#[from] std::io::Error),
}

fn parse_data_bits(bits: &str) -> Result<DataBits, String> {
    match bits {
        "5" => Ok(DataBits::Five),
        "6" => Ok(DataBits::Six),
        "7" => Ok(DataBits::Seven),
        "8" => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: &str) -> Result<StopBits, String> {
    match bits {
        "1" => Ok(StopBits::One),
        "2" => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init_logging(cli.debug) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    let storage = match RootedStorage::new(cli.root.clone()) {
        Ok(storage) => storage,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!("Opening serial port: {}", cli.port);
    println!("Settings: {} baud, {:?}, {:?}, {:?}", cli.baud, cli.data_bits, cli.parity, cli.stop_bits);

    let serial_port = match RealSerialPort::open(&cli.port, cli.baud, cli.data_bits, cli.parity, cli.stop_bits) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Failed to open serial port: {}", e);
            std::process::exit(1);
        }
    };

    let timeouts = Timeouts {
        short: Duration::from_millis(cli.short_timeout_ms),
        long: Duration::from_millis(cli.long_timeout_ms),
    };
    debug!(?timeouts, root = %cli.root.display(), "configuration");

    let result = match cli.command {
        Commands::Shell => {
            let config = ShellConfig {
                use_crc: !cli.checksum,
                one_k: !cli.small_blocks,
                timeouts,
            };
            println!("\nServing shell, files under: {}", cli.root.display());
            run_shell(serial_port, storage, config)
        }
        Commands::Rx { file } => {
            println!("\nReceiving (XMODEM) to: {}", file);
            let config = ReceiveConfig::xmodem(&file);
            receive_files(serial_port, storage, apply_flags(config, cli.checksum, cli.small_blocks, timeouts))
        }
        Commands::Rb { dir } => {
            println!("\nReceiving (YMODEM) into: {}", dir);
            let config = ReceiveConfig::ymodem(&dir);
            receive_files(serial_port, storage, apply_flags(config, cli.checksum, cli.small_blocks, timeouts))
        }
    };

    if let Err(e) = result {
        error!(error = %e, "failed");
        eprintln!("Receive failed: {}", e);
        std::process::exit(1);
    }
}

fn apply_flags(config: ReceiveConfig, checksum: bool, small_blocks: bool, timeouts: Timeouts) -> ReceiveConfig {
    config
        .with_crc(!checksum)
        .with_one_k(!small_blocks)
        .with_timeouts(timeouts)
}

fn run_shell(serial_port: RealSerialPort, storage: RootedStorage, config: ShellConfig) -> Result<(), RunError> {
    let mut shell = Shell::new(serial_port, storage, config);
    shell.start()?;

    loop {
        shell.poll()?;
        thread::sleep(POLL_INTERVAL);
    }
}

fn receive_files(
    mut serial_port: RealSerialPort,
    mut storage: RootedStorage,
    config: ReceiveConfig,
) -> Result<(), RunError> {
    let mut session = Session::start(&config, &mut serial_port, &mut storage)?;

    while session.advance(&mut serial_port, &mut storage) == SessionStatus::InProgress {
        thread::sleep(POLL_INTERVAL);
    }

    let files: Vec<ReceivedFile> = session.finish()?;
    for file in &files {
        println!("Received {} ({} bytes)", file.path, file.bytes);
    }
    println!("\nTransfer complete!");
    Ok(())
}
