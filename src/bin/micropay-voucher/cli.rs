//! CLI definition for micropay-voucher.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Operator tool for vouchers and gateway configuration.
#[derive(Parser, Debug)]
#[command(name = "micropay-voucher")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level. Falls back to `log_level` of `--config`, then `warn`.
    #[arg(long, env = "RUST_LOG")]
    pub log_level: Option<String>,

    /// Gateway configuration file.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Command to run.
    #[command(subcommand)]
    pub command: VoucherCommand,
}

/// Voucher commands.
#[derive(Subcommand, Debug)]
pub enum VoucherCommand {
    /// Generate a signing key and print it with its client id.
    Keygen,
    /// Sign a voucher and print it as hex.
    Sign {
        /// Hex-encoded 32-byte signing key.
        #[arg(long, env = "MICROPAY_SIGNING_KEY")]
        key: String,
        /// Hex-encoded 32-byte vendor id.
        #[arg(long)]
        vendor: String,
        /// Chain position of the voucher.
        #[arg(long)]
        nonce: u64,
        /// Value in atoms.
        #[arg(long)]
        atoms: u64,
    },
    /// Decode a hex voucher, verify it, and print its fields as JSON.
    Inspect {
        /// Hex-encoded voucher.
        voucher: String,
    },
    /// Write the default gateway configuration, or validate an existing one.
    Config {
        /// Output file (defaults to stdout if omitted).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Validate this file instead of writing defaults.
        #[arg(long, conflicts_with = "output")]
        check: Option<PathBuf>,
    },
}
