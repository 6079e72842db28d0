// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use codewire::config::Config;
use codewire::pidfile::AlreadyRunning;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    let fmt = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone())),
    );
    if config.log_format == "json" {
        fmt.json().init();
    } else {
        fmt.init();
    }

    let settings = match config.resolve() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    };

    match codewire::run::run(settings).await {
        Ok(code) => std::process::exit(code),
        Err(e) if e.downcast_ref::<AlreadyRunning>().is_some() => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}
