//! REPL – line-oriented operator console.
//!
//! Supported slash-commands:
//!   /help                        – show this list
//!   /status                      – channel states, selected robot, cloud size
//!   /robots                      – list the backend roster
//!   /switch <index>              – select a robot from the roster
//!   /mode <mode>                 – switch the robot's operating mode
//!   /drive <linear> <angular>    – send one velocity command
//!   /latency once|start|stop|abort|mark|stats
//!   /load <file.ply> [fraction]  – show an offline point cloud
//!   /random <n>                  – show n random points
//!   /quit | /exit                – leave the console

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use teleop_perception::PointCloudObject;
use teleop_runtime::LatencyTestEngine;
use teleop_transport::TransportManager;
use teleop_types::{ChannelKind, ChannelState, VelocityCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyAction {
    Once,
    Start,
    Stop,
    Abort,
    /// Operator saw the marked frame.
    Mark,
    Stats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Robots,
    Switch(usize),
    Mode(String),
    Drive { linear: f64, angular: f64 },
    Latency(LatencyAction),
    Load { path: PathBuf, decimation: f32 },
    Random(usize),
    Quit,
}

/// Parse one input line.  The error is the message shown to the operator.
pub fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();

    let command = match (head, args.as_slice()) {
        ("/help", []) => Command::Help,
        ("/status", []) => Command::Status,
        ("/robots", []) => Command::Robots,
        ("/switch", [index]) => Command::Switch(
            index
                .parse()
                .map_err(|_| format!("'{index}' is not a roster index"))?,
        ),
        ("/mode", [mode]) => Command::Mode(mode.to_string()),
        ("/drive", [linear, angular]) => Command::Drive {
            linear: parse_number(linear)?,
            angular: parse_number(angular)?,
        },
        ("/latency", [action]) => Command::Latency(match *action {
            "once" => LatencyAction::Once,
            "start" => LatencyAction::Start,
            "stop" => LatencyAction::Stop,
            "abort" => LatencyAction::Abort,
            "mark" => LatencyAction::Mark,
            "stats" => LatencyAction::Stats,
            other => return Err(format!("unknown latency action '{other}'")),
        }),
        ("/load", [path]) => Command::Load {
            path: PathBuf::from(*path),
            decimation: 1.0,
        },
        ("/load", [path, fraction]) => {
            let decimation: f32 = fraction
                .parse()
                .map_err(|_| format!("'{fraction}' is not a fraction"))?;
            if !(decimation > 0.0 && decimation <= 1.0) {
                return Err("fraction must be in (0, 1]".to_string());
            }
            Command::Load {
                path: PathBuf::from(*path),
                decimation,
            }
        }
        ("/random", [count]) => Command::Random(
            count
                .parse()
                .map_err(|_| format!("'{count}' is not a point count"))?,
        ),
        ("/quit" | "/exit", []) => Command::Quit,
        ("/help" | "/status" | "/robots" | "/switch" | "/mode" | "/drive" | "/latency"
        | "/load" | "/random" | "/quit" | "/exit", _) => {
            return Err(format!("wrong arguments for {head}"));
        }
        (other, _) => return Err(format!("Unknown command: '{other}'")),
    };
    Ok(command)
}

fn parse_number(s: &str) -> Result<f64, String> {
    s.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("'{s}' is not a number"))
}

/// Everything the console operates on.
pub struct Session {
    pub transport: Arc<TransportManager>,
    pub latency: Arc<LatencyTestEngine>,
    pub cloud: Arc<PointCloudObject>,
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(session: &Session, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "teleop>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        if line.trim().is_empty() {
            continue;
        }
        match parse(&line) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(command) => execute(session, command),
            Err(msg) => println!(
                "{} Type {} for available commands.",
                msg.red(),
                "/help".bold()
            ),
        }
    }
}

pub fn execute(session: &Session, command: Command) {
    match command {
        Command::Help => cmd_help(),
        Command::Status => cmd_status(session),
        Command::Robots => cmd_robots(&session.transport),
        Command::Switch(index) => match session.transport.switch_robot(index) {
            Ok(true) => println!("{} robot #{}", "Switching to".green(), index),
            Ok(false) => println!("{}", "Control channel is not open.".yellow()),
            Err(e) => println!("{}", e.to_string().red()),
        },
        Command::Mode(mode) => report_send(session.transport.switch_mode(mode), "Control"),
        Command::Drive { linear, angular } => report_send(
            session
                .transport
                .send_command(VelocityCommand::drive(linear, angular)),
            "Telemetry",
        ),
        Command::Latency(action) => cmd_latency(&session.latency, action),
        Command::Load { path, decimation } => {
            match session.cloud.load_from_file(&path, decimation) {
                Ok(n) => println!("{} {} points from {}", "Loaded".green(), n, path.display()),
                Err(e) => println!("{}", e.to_string().red()),
            }
        }
        Command::Random(count) => {
            session.cloud.load_random(count);
            println!("{} {} random points", "Loaded".green(), count);
        }
        Command::Quit => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Teleop Commands".bold().underline());
    println!("  {}                 – channel and robot status", "/status".bold().cyan());
    println!("  {}                 – list the robot roster", "/robots".bold().cyan());
    println!("  {}       – select a robot", "/switch <index>".bold().cyan());
    println!("  {}            – switch operating mode", "/mode <mode>".bold().cyan());
    println!("  {}   – send one velocity command", "/drive <lin> <ang>".bold().cyan());
    println!(
        "  {}  – once | start | stop | abort | mark | stats",
        "/latency <action>".bold().cyan()
    );
    println!("  {}  – show a PLY file", "/load <file> [frac]".bold().cyan());
    println!("  {}            – show random points", "/random <n>".bold().cyan());
    println!("  {}           – exit the console", "/quit  /exit".bold().cyan());
    println!();
}

fn paint_state(state: ChannelState) -> colored::ColoredString {
    let text = state.to_string();
    match state {
        ChannelState::Open => text.green(),
        ChannelState::Connecting | ChannelState::Initializing => text.yellow(),
        ChannelState::Closed | ChannelState::Error => text.red(),
    }
}

fn cmd_status(session: &Session) {
    let transport = &session.transport;
    println!("{}", "Status".bold().underline());
    for kind in ChannelKind::ALL {
        println!("  {:<10} {}", kind.to_string(), paint_state(transport.channel_state(kind)));
    }
    println!("  Encoding   {}", transport.config().encoding.yellow());

    let selection = transport.selection();
    match &selection.selected {
        Some(robot) => println!("  Robot      {} ({})", robot.name.bold(), robot.id),
        None => println!("  Robot      {}", "none".dimmed()),
    }
    if selection.switching {
        println!("  {}", "switch pending…".yellow());
    }

    let buffer = session.cloud.snapshot();
    println!(
        "  Cloud      {} points, z-scale {:.2}",
        buffer.point_count(),
        buffer.material.z_scale
    );
}

fn cmd_robots(transport: &TransportManager) {
    let selection = transport.selection();
    if selection.roster.is_empty() {
        println!("  {}", "No robots reported by the backend.".dimmed());
        return;
    }
    println!("{}", "Robots".bold().underline());
    for (index, robot) in selection.roster.iter().enumerate() {
        let marker = if selection.selected.as_ref().is_some_and(|s| s.id == robot.id) {
            "▶"
        } else {
            " "
        };
        let battery = robot
            .battery
            .map(|b| format!("{b:.0}%"))
            .unwrap_or_else(|| "–".to_string());
        println!(
            "  {} [{}] {} {} {}",
            marker.green(),
            index,
            robot.name.bold(),
            format!("id={}", robot.id).dimmed(),
            battery
        );
    }
}

fn cmd_latency(engine: &LatencyTestEngine, action: LatencyAction) {
    match action {
        LatencyAction::Once => match engine.test_once() {
            Ok(id) => println!("{} test #{}", "Triggered".green(), id),
            Err(e) => println!("{}", e.to_string().red()),
        },
        LatencyAction::Start => match engine.start_continuous_test() {
            Ok(_) => println!("{}", "Continuous latency testing started.".green()),
            Err(e) => println!("{}", e.to_string().red()),
        },
        LatencyAction::Stop => match engine.stop_continuous_test() {
            Ok(0) => println!("Continuous testing stopped; no results recorded."),
            Ok(n) => println!("{} {} results exported.", "Stopped.".green(), n),
            Err(e) => println!("{}", e.to_string().red()),
        },
        LatencyAction::Abort => {
            if engine.abort_current_test() {
                println!("{}", "Current test aborted.".yellow());
            } else {
                println!("{}", "No test in progress.".dimmed());
            }
        }
        LatencyAction::Mark => match engine.manual_color_frame_received() {
            Some(r) => println!("{} test #{}: {:.1} ms", "Marked".green(), r.id, r.latency_ms),
            None => println!("{}", "No test in progress.".dimmed()),
        },
        LatencyAction::Stats => {
            let [r, g, b] = engine.target_color();
            println!("{}", "Latency".bold().underline());
            println!("  Target colour  rgb({r}, {g}, {b})");
            println!(
                "  State          {}{}",
                if engine.is_testing() { "armed" } else { "idle" },
                if engine.is_continuous() { ", continuous" } else { "" }
            );
            match engine.last_latency() {
                Some(ms) => println!("  Last           {ms:.1} ms"),
                None => println!("  Last           {}", "–".dimmed()),
            }
            println!(
                "  Average        {:.1} ms over {} results",
                engine.average_latency(),
                engine.results().len()
            );
        }
    }
}

fn report_send(sent: bool, channel: &str) {
    if sent {
        println!("{}", "Sent.".green());
    } else {
        println!("{} channel is not open; nothing sent.", channel.yellow());
    }
}
