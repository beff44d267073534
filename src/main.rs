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

// ZMODEM sender over a serial line
use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use std::path::PathBuf;

use zlink::config::{FilePolicy, TransferConfig};
use zlink::sender::{self, SenderFsm};
use zlink::serial::RealSerialPort;

#[derive(Parser)]
#[command(name = "zlink")]
#[command(about = "ZMODEM file transfer and remote commands over RS-232", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "9600")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name = "BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name = "BITS")]
    stop_bits: u8,

    /// Cap the data block length (bytes)
    #[arg(long, value_name = "BYTES")]
    block_len: Option<usize>,

    /// Max unacknowledged bytes in flight (0 = unlimited)
    #[arg(long, default_value = "0", value_name = "BYTES")]
    window: usize,

    /// Bytes between mid-stream ack requests when a window is set
    #[arg(long, default_value = "1024", value_name = "BYTES")]
    ack_spacing: usize,

    /// Use 16-bit frame checks even if the receiver offers 32-bit
    #[arg(long)]
    no_crc32: bool,

    /// Escape all control bytes, and ask the receiver to do the same
    #[arg(long)]
    escape_controls: bool,

    /// Existing-file policy at the receiver (default, clobber, append,
    /// protect, or newer)
    #[arg(long, default_value = "default")]
    policy: String,

    /// Ask the receiver to skip files it has no copy of
    #[arg(long)]
    existing_only: bool,

    /// Send the full path instead of the bare file name
    #[arg(long)]
    full_path: bool,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send files using the ZMODEM protocol
    Send {
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Run a command on the remote end
    Command {
        /// Command line to execute remotely
        command: String,
    },
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
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

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn parse_policy(policy: &str) -> Result<FilePolicy, String> {
    match policy.to_lowercase().as_str() {
        "default" => Ok(FilePolicy::ReceiverDefault),
        "clobber" => Ok(FilePolicy::Clobber),
        "append" => Ok(FilePolicy::Append),
        "protect" => Ok(FilePolicy::Protect),
        "newer" => Ok(FilePolicy::NewerOnly),
        _ => Err(format!(
            "Invalid policy: {}. Must be 'default', 'clobber', 'append', 'protect', or 'newer'",
            policy
        )),
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_target(false)
        .init();

    let data_bits = match parse_data_bits(cli.data_bits) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let parity = match parse_parity(&cli.parity) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let stop_bits = match parse_stop_bits(cli.stop_bits) {
        Ok(sb) => sb,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let policy = match parse_policy(&cli.policy) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let config = TransferConfig {
        block_len: cli.block_len,
        window: cli.window,
        ack_spacing: cli.ack_spacing,
        want_crc32: !cli.no_crc32,
        escape_controls: cli.escape_controls,
        policy,
        skip_if_absent: cli.existing_only,
        full_path: cli.full_path,
        baud: cli.baud,
        ..TransferConfig::default()
    };

    println!("Opening serial port: {}", cli.port);
    println!(
        "Settings: {} baud, {:?}, {:?}, {:?}",
        cli.baud, data_bits, parity, stop_bits
    );

    let serial_port = match RealSerialPort::open(&cli.port, cli.baud, data_bits, parity, stop_bits)
    {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Failed to open serial port: {}", e);
            std::process::exit(1);
        }
    };

    let fsm = match cli.command {
        Commands::Send { files } => {
            for file in &files {
                if !file.exists() {
                    eprintln!("Warning: {} not found, will be skipped", file.display());
                }
            }
            SenderFsm::new(Box::new(serial_port), files, config)
        }
        Commands::Command { command } => {
            SenderFsm::new_command(Box::new(serial_port), command, config)
        }
    };

    match sender::run(fsm) {
        Ok(0) => println!("\nSession completed successfully"),
        Ok(failed) => {
            eprintln!("\nSession completed with {} failed file(s)", failed);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("\nSession failed: {}", e);
            std::process::exit(1);
        }
    }
}
