//! `teleop-cli` – operator console for the robot backend.
//!
//! This binary:
//!
//! 1. Checks for `~/.teleop/config.toml`; runs a **First-Run Wizard** when the
//!    file is absent.
//! 2. Connects the control, telemetry and streaming channels.
//! 3. Drops the operator into an **interactive REPL** (`/status`, `/robots`,
//!    `/switch`, `/drive`, `/latency`, `/help`).
//! 4. Intercepts **Ctrl-C** to stop the robot, export pending latency results
//!    and close every channel before exiting.

mod config;
mod repl;
mod sink;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

use teleop_perception::PointCloudObject;
use teleop_runtime::{LatencyTestEngine, init_tracing};
use teleop_transport::TransportManager;
use teleop_types::VelocityCommand;

use crate::sink::CsvFileSink;

fn main() {
    // Hold the guard until exit so pending spans are flushed.
    let _tracing = init_tracing("teleop");

    print_banner();

    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("teleop-io")
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            std::process::exit(1);
        }
    };
    // Channel tasks are spawned onto this runtime from the REPL thread.
    let _enter = runtime.enter();

    // ── Wiring ────────────────────────────────────────────────────────────
    let cloud = Arc::new(PointCloudObject::new(cfg.point_cloud.clone()));
    let transport = Arc::new(
        TransportManager::new(cfg.transport.clone()).with_point_cloud(Arc::clone(&cloud)),
    );
    let latency = Arc::new(
        LatencyTestEngine::new(cfg.latency.clone(), transport.clone())
            .with_export(Arc::new(CsvFileSink::new(cfg.export_dir.clone()))),
    );
    let _latency_feed = latency.attach(&transport.frame_hub());

    println!();
    println!(
        "  Connecting to {} (streaming {}, encoding {}) …",
        cfg.transport.endpoints.control.bold(),
        cfg.transport.endpoints.streaming.dimmed(),
        cfg.transport.encoding.yellow()
    );
    if let Err(e) = transport.connect_all(
        cfg.transport.endpoints.clone(),
        cfg.transport.reconnect_interval(),
    ) {
        println!("{}: {}", "Connection setup failed".red(), e);
        std::process::exit(1);
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        let transport = transport.clone();
        let latency = latency.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            println!();
            println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());

            if transport.send_command(VelocityCommand::default()) {
                println!("{}", "  ✓ Stop command sent.".green());
            }
            match latency.stop_continuous_test() {
                Ok(0) => {}
                Ok(n) => println!("{} {} latency results exported.", "  ✓".green(), n),
                Err(e) => println!("{}: {}", "  Latency export failed".red(), e),
            }
            transport.shutdown();
            println!("{}", "  ✓ Channels closed.".green());

            shutdown.store(true, Ordering::SeqCst);
            std::process::exit(130);
        }) {
            warn!(error = %e, "failed to install Ctrl-C handler; Ctrl-C will not shut down cleanly");
        }
    }

    println!(
        "  Type {} for a list of commands.\n",
        "/help".bold().cyan()
    );

    let session = repl::Session {
        transport: transport.clone(),
        latency: latency.clone(),
        cloud,
    };
    repl::run(&session, shutdown);

    if let Err(e) = latency.stop_continuous_test() {
        println!("{}: {}", "Latency export failed".red(), e);
    }
    transport.shutdown();
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║       Teleop First-Run Wizard        ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's point the console at a backend.\n");

    let mut cfg = config::Config::default();
    let endpoints = &mut cfg.transport.endpoints;

    endpoints.control = prompt_line(
        &format!("  Control channel URL [{}]: ", endpoints.control),
        &endpoints.control,
    );
    endpoints.telemetry = prompt_line(
        &format!("  Telemetry channel URL [{}]: ", endpoints.telemetry),
        &endpoints.telemetry,
    );
    endpoints.streaming = prompt_line(
        &format!("  Streaming channel URL [{}]: ", endpoints.streaming),
        &endpoints.streaming,
    );
    endpoints.signaling = prompt_line(
        &format!("  Signaling server URL [{}]: ", endpoints.signaling),
        &endpoints.signaling,
    );
    cfg.transport.encoding = prompt_line(
        &format!("  Point-cloud encoding [{}]: ", cfg.transport.encoding),
        &cfg.transport.encoding,
    );
    let dir = prompt_line(
        &format!("  Latency export directory [{}]: ", cfg.export_dir.display()),
        &cfg.export_dir.to_string_lossy(),
    );
    cfg.export_dir = dir.into();

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
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
    println!("{}", r#"  ______     __                "#.bold().cyan());
    println!("{}", r#" /_  __/__  / /__ ___  ___     "#.bold().cyan());
    println!("{}", r#"  / / / -_)/ / -_) _ \/ _ \    "#.bold().cyan());
    println!("{}", r#" /_/  \__//_/\__/\___/ .__/    "#.bold().cyan());
    println!("{}", r#"                    /_/        "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Teleop".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Remote robot operator console");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
