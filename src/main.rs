use clap::Parser;
use das::config::Config;
use das::controller;
use log::{error, info, LevelFilter};
use std::env;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "das",
    about = "Escalates sidecar resource envelopes on repeated out-of-resource exits"
)]
struct Args {
    /// Path to the sidecar step configuration
    #[arg(long = "config_file", default_value = "config.json")]
    config_file: PathBuf,
}

#[tokio::main]
async fn main() {
    init_log();
    info!("das says hi..");
    let args = Args::parse();

    info!("reading config from {}", args.config_file.display());
    let conf = match Config::parse(&args.config_file) {
        Ok(conf) => conf,
        Err(e) => {
            error!(
                "error parsing config {}: {}",
                args.config_file.display(),
                e
            );
            std::process::exit(1);
        }
    };

    tokio::select! {
        res = controller::start(conf) => {
            if let Err(e) = res {
                error!("error in controller manager: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
}

fn init_log() {
    let level = match env::var("LOG_LEVEL")
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Warn,
    };
    env_logger::Builder::new().filter_level(level).init();
}
