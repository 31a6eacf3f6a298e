mod api;
mod dtos;
mod recorder;
mod utils;

use crate::api::status::StatusServer;
use crate::recorder::hub::Hub;
use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use env_logger::Env;
use log::{error, info};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Continuous multi-camera recorder.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

fn run(args: &Args) -> Result<()> {
    let conf = utils::config::Config::new().read_config(&args.config)?;
    info!("Config: {:?}", conf);

    let exit = Arc::new(AtomicBool::new(false));
    let flag = exit.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("installing the Ctrl-C handler")?;

    let mut hub = Hub::new(&conf).context("starting the hub")?;
    let mut status = match &conf.status {
        Some(status) => Some(StatusServer::start(&status.listen, hub.board())?),
        None => None,
    };

    hub.run(&exit);

    info!("shutting down");
    if let Some(status) = status.as_mut() {
        status.stop();
    }
    hub.shutdown();
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}:{}] - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();
    let args = Args::parse();
    info!("Starting camhub");
    if let Err(e) = run(&args) {
        error!("{e:#}");
        std::process::exit(1);
    }
}
