//! USB HID barcode scanner to Home Assistant MQTT bridge.

mod app;
mod devices;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::info;

use habridge_core::Config;
use habridge_scanner::layouts;

const APP_NAME: &str = "habridge";

#[derive(Parser, Debug)]
#[command(name = APP_NAME)]
#[command(version, about = "USB barcode scanner client for Home Assistant")]
struct Args {
    /// Load configuration from FILE.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// List available HID devices that might be barcode scanners.
    #[arg(long)]
    list_devices: bool,

    /// Set log level (trace, debug, info, warn, error). Overrides the
    /// config file.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.list_devices {
        return devices::print_config_snippet();
    }

    if args.config == PathBuf::from("config.yaml") && !args.config.exists() {
        return Err(anyhow!(
            "no configuration found - create config.yaml or specify one with --config"
        ));
    }

    let config = Config::load(&args.config).context("configuration error")?;
    init_logging(&args, &config);

    layouts::load().context("failed to load keyboard layouts")?;
    validate_layouts(&config)?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting {APP_NAME}");
    app::Application::new(config).run().await
}

fn init_logging(args: &Args, config: &Config) {
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if config.logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

/// Layout availability is checked here rather than in config validation
/// because the layout registry lives beside the decoder.
fn validate_layouts(config: &Config) -> Result<()> {
    for (id, scanner) in &config.scanners {
        if !layouts::is_available(&scanner.keyboard_layout) {
            return Err(anyhow!(
                "scanners[{id}].keyboard_layout '{}' is not available; available layouts: {}",
                scanner.keyboard_layout,
                layouts::available().join(", ")
            ));
        }
    }
    Ok(())
}
