//! `skyward-cli` – Skyward operator console
//!
//! This binary brings up a simulated observatory around the orchestration
//! core and hands it to the operator.  It:
//!
//! 1. Loads `~/.skyward/config.toml`, writing first-run defaults when the
//!    file is absent.
//! 2. Starts a [`Facility`][skyward_runtime::Facility] on a simulated
//!    gateway with the configured modules, each sending heartbeats.
//! 3. Runs the scheduler loop in the background.
//! 4. Drops the operator into an **interactive REPL** (`/help` lists the
//!    commands).
//! 5. Intercepts **Ctrl-C** to abort every running task and exit.

mod config;
mod repl;
mod sim;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{error, warn};

use sim::SimulatedSite;

fn main() {
    // Hold the guard until exit so pending spans are flushed.
    let _telemetry = skyward_runtime::init_tracing("skyward");

    print_banner();

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => write_first_run_config(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    // ── Runtime & site ────────────────────────────────────────────────────
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the Tokio runtime");
            std::process::exit(1);
        }
    };
    let _ctx = runtime.enter();

    let site = match SimulatedSite::start(&cfg) {
        Ok(site) => site,
        Err(e) => {
            println!("{}: {}", "Failed to start facility".red(), e);
            std::process::exit(1);
        }
    };
    println!(
        "  {} simulated module(s) online, {} sensor source(s) configured",
        cfg.modules.len().to_string().bold(),
        cfg.facility.sensors.len().to_string().bold()
    );
    if cfg.facility.sensors.iter().any(|s| s.required) {
        println!(
            "  Dispatch is held until every required sensor reports safe ({}).",
            "/sensor <source> safe".cyan()
        );
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler = runtime.spawn(Arc::clone(&site.facility).run(stop_rx));

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let facility = Arc::clone(&site.facility);
    let handle = runtime.handle().clone();
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
        println!();
        println!("{}", "⚠  Ctrl-C received – aborting running tasks …".yellow().bold());
        let aborted = handle.block_on(facility.shutdown());
        println!("{} {}", "  ✓ Aborted:".green(), aborted.len());
        println!("{}", "  ✓ Exiting Skyward.".green());
        std::process::exit(130);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; running tasks will not be aborted on Ctrl-C");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&site, shutdown);

    // ── Orderly shutdown ──────────────────────────────────────────────────
    let aborted = runtime.block_on(site.facility.shutdown());
    if !aborted.is_empty() {
        println!("  Aborted {} running task(s).", aborted.len());
    }
    if stop_tx.send(true).is_ok() && runtime.block_on(scheduler).is_err() {
        warn!("scheduler loop ended abnormally");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// First run
// ─────────────────────────────────────────────────────────────────────────────

fn write_first_run_config() -> config::Config {
    println!();
    println!("  No configuration found.  Writing defaults for a simulated site.");
    let cfg = config::Config::first_run();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   _____ __                                __"#.bold().cyan());
    println!("{}", r#"  / ___// /____  ___      ______ __________/ /"#.bold().cyan());
    println!("{}", r#"  \__ \/ //_/ / / / | /| / / __ `/ ___/ __  / "#.bold().cyan());
    println!("{}", r#" ___/ / ,< / /_/ /| |/ |/ / /_/ / /  / /_/ /  "#.bold().cyan());
    println!("{}", r#"/____/_/|_|\__, / |__/|__/\__,_/_/   \__,_/   "#.bold().cyan());
    println!("{}", r#"          /____/                                "#.bold().cyan());
    println!();
    println!("  {} {}",
        "Skyward".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Observatory Orchestration Core");
    println!();
}
