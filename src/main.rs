// src/main.rs

//! The main entry point for the TesseraDB server processes.

use anyhow::Result;
use std::env;
use tesseradb::config::Config;
use tesseradb::server;
use tracing::error;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("TesseraDB version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path; defaults to "config.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();

    // The process mode selects which subsystem this instance runs.
    let mode = args
        .iter()
        .find(|a| {
            matches!(
                a.as_str(),
                "--master" | "--rangeserver" | "--replication-master" | "--replication-slave"
            )
        })
        .map(|s| s.as_str())
        .unwrap_or("--rangeserver");

    let result = match mode {
        "--master" => server::run_master(config).await,
        "--replication-master" => server::run_replication_master(config).await,
        "--replication-slave" => server::run_replication_slave(config).await,
        _ => server::run_rangeserver(config).await,
    };

    if let Err(e) = &result {
        error!("Server runtime error: {}", e);
    }
    result
}
