//! echo-bench: a TCP echo benchmark server
//!
//! Compares three Linux I/O models under one connection lifecycle and one
//! metrics surface:
//! - epoll: edge-triggered readiness notification
//! - uring: single-shot completion-based submission
//! - multishot: multishot submissions with a kernel-shared buffer pool
//!
//! stdout carries the startup line and the periodic status line; all
//! diagnostics go to stderr.

mod config;
mod engine;
mod metrics;

use config::Config;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // INT and TERM both end the run through the same flag; engines observe
    // it at every loop iteration.
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        eprintln!("failed to install signal handler: {e}");
        process::exit(1);
    }

    println!("echo-bench: {} engine on port {}", config.mode, config.port);

    if let Err(e) = engine::run(&config, &shutdown) {
        eprintln!("{e}");
        process::exit(1);
    }

    info!("shutdown complete");
}
