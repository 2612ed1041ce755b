//! micropay-voucher CLI entry point.

mod cli;

use clap::Parser;
use cli::{Cli, VoucherCommand};
use micropay_gateway::voucher::signed::{SignedVoucher, VendorId, VoucherSigner};
use micropay_gateway::{GatewayConfig, Voucher};
use std::path::Path;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Length of a signing key in bytes.
const SIGNING_KEY_LEN: usize = 32;

/// Log level when neither the command line nor a config file sets one.
const DEFAULT_LOG_LEVEL: &str = "warn";

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = cli
        .config
        .as_deref()
        .map(GatewayConfig::from_file)
        .transpose()?;

    let level = log_level(cli.log_level.as_deref(), config.as_ref());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    debug!("micropay-voucher v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        VoucherCommand::Keygen => {
            let signer = VoucherSigner::generate();
            println!("signing_key: {}", hex::encode(signer.to_bytes()));
            println!("client_id:   {}", signer.client());
        }
        VoucherCommand::Sign {
            key,
            vendor,
            nonce,
            atoms,
        } => {
            let signer = VoucherSigner::from_bytes(&parse_key(&key)?);
            let vendor: VendorId = vendor.parse()?;
            let voucher = signer.sign(vendor, nonce, atoms);
            info!("Signed voucher {}", voucher.id());
            println!("{}", voucher.to_hex()?);
        }
        VoucherCommand::Inspect { voucher } => {
            let voucher = SignedVoucher::from_hex(voucher.trim())?;
            let report = serde_json::json!({
                "client": voucher.client.to_string(),
                "vendor": voucher.vendor.to_string(),
                "nonce": voucher.nonce,
                "atoms": voucher.atoms,
                "signature_valid": voucher.verify_signature(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        VoucherCommand::Config { output, check } => {
            if let Some(path) = check {
                check_config(&path)?;
            } else {
                let config = GatewayConfig::default();
                match output {
                    Some(path) => {
                        config.to_file(&path)?;
                        info!("Wrote default configuration to {}", path.display());
                    }
                    None => print!("{}", config.to_toml()?),
                }
            }
        }
    }

    Ok(())
}

fn log_level(cli: Option<&str>, config: Option<&GatewayConfig>) -> String {
    cli.map(str::to_string)
        .or_else(|| config.map(|c| c.log_level.clone()))
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
}

fn parse_key(hex_str: &str) -> color_eyre::Result<[u8; SIGNING_KEY_LEN]> {
    let bytes = hex::decode(hex_str.trim().trim_start_matches("0x"))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        color_eyre::eyre::eyre!(
            "signing key must be {SIGNING_KEY_LEN} bytes, got {}",
            b.len()
        )
    })
}

fn check_config(path: &Path) -> color_eyre::Result<()> {
    let config = GatewayConfig::from_file(path)?;
    println!(
        "{}: ok (expand_risk_factor={}, exhaustion_policy={:?}, oracle ttl={}ms)",
        path.display(),
        config.credit.expand_risk_factor,
        config.credit.exhaustion_policy,
        config.oracle.ttl_ms
    );
    Ok(())
}
