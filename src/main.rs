//! RuleGate - A declarative rewrite gate for LLM backends
//!
//! A configuration-driven reverse proxy that rewrites LLM requests and
//! responses in flight according to ordered matching rules.

#![forbid(unsafe_code)]

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rulegate::args::Args;
use rulegate::handler::ReadyConfig;
use rulegate::{reload, server};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let overrides = args.overrides();

    let loaded = match rulegate_core::loader::load(&args.config, &overrides) {
        Ok(loaded) => loaded,
        Err(err) => fatal(&format!("config: {err}")),
    };

    init_tracing(overrides.debug || loaded.config.proxies.iter().any(|p| p.debug));

    let ready = match ReadyConfig::prepare(loaded) {
        Ok(ready) => Arc::new(ready),
        Err(err) => fatal(&format!("config: {err}")),
    };

    server::print_startup_info(&ready);

    let handles = match server::start_listeners(ready.clone()).await {
        Ok(handles) => handles,
        Err(err) => fatal(&err.to_string()),
    };

    let controller =
        match reload::ReloadController::spawn(ready, args.config.clone(), overrides, handles) {
            Ok(controller) => controller,
            Err(err) => fatal(&format!("config watcher: {err}")),
        };

    println!("rulegate ready");

    let signal = shutdown_signal().await;
    println!("\n{signal} received, draining listeners...");

    controller.shutdown().await;
    println!("rulegate stopped");
}

fn fatal(message: &str) -> ! {
    eprintln!("rulegate: {message}");
    std::process::exit(1);
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Waits for a termination signal and reports which one fired.
#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            // Without a SIGTERM handler the process still stops on
            // ctrl-c; log and fall back rather than dying here.
            tracing::warn!(error = %err, "could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl-c"
}
