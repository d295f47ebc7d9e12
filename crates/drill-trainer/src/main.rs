//! Drill runner
//!
//! Plays one opening-drill session from stdin against a local Stockfish and
//! the move-probability service, printing the session snapshot after each
//! command.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use drill_trainer::config::TrainerConfig;
use drill_trainer::maia::MaiaClient;
use drill_trainer::session::DrillConfiguration;
use drill_trainer::stockfish::StockfishSearch;
use drill_trainer::{DrillController, SessionPhase};

const HELP: &str = "commands: move <uci|san>, back, forward, root, complete, next, continue, \
load <selection-id>, drill <index>, analysis on|off, status, reset, quit";

#[derive(Debug, PartialEq)]
enum Command {
    Move(String),
    Back,
    Forward,
    Root,
    Complete,
    Next,
    Continue,
    Load(String),
    Drill(usize),
    Analysis(bool),
    Status,
    Reset,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let command = match (parts.next()?, parts.next()) {
            ("move", Some(token)) => Command::Move(token.to_string()),
            ("back", None) => Command::Back,
            ("forward", None) => Command::Forward,
            ("root", None) => Command::Root,
            ("complete", None) => Command::Complete,
            ("next", None) => Command::Next,
            ("continue", None) => Command::Continue,
            ("load", Some(id)) => Command::Load(id.to_string()),
            ("drill", Some(index)) => Command::Drill(index.parse().ok()?),
            ("analysis", Some("on")) => Command::Analysis(true),
            ("analysis", Some("off")) => Command::Analysis(false),
            ("status", None) => Command::Status,
            ("reset", None) => Command::Reset,
            ("quit" | "exit", None) => Command::Quit,
            _ => return None,
        };
        Some(command)
    }
}

/// Parse the drills file path from CLI args
fn parse_drills_path() -> Option<String> {
    std::env::args().nth(1)
}

fn print_snapshot(controller: &DrillController) -> anyhow::Result<()> {
    let snapshot = controller.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    if snapshot.phase == SessionPhase::AllDrillsComplete {
        println!("{}", serde_json::to_string_pretty(&controller.session_summary())?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load .env file for local dev
    let _ = dotenvy::dotenv();

    let path = parse_drills_path().context("usage: drill-runner <drills.json>")?;
    let drills_json = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {path}"))?;
    let drills = DrillConfiguration::from_json(&drills_json)?;

    let config = TrainerConfig::from_env()?;
    let maia_url = config.maia_url.clone().context("MAIA_URL must be set")?;

    let search = StockfishSearch::spawn(&config.stockfish_path, config.search_target_depth).await?;
    info!(stockfish_path = %config.stockfish_path, "Stockfish engine ready");
    let maia = Arc::new(MaiaClient::new(&maia_url)?);

    let controller = DrillController::new(Arc::new(search.clone()), maia.clone(), maia, &config);
    if !controller.start_session(&drills) {
        anyhow::bail!("no playable drills in {path}");
    }
    eprintln!("{HELP}");
    print_snapshot(&controller)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let Some(command) = Command::parse(&line) else {
            warn!(input = %line.trim(), "Unknown command");
            eprintln!("{HELP}");
            continue;
        };

        let accepted = match command {
            Command::Move(token) => controller.make_player_move(&token),
            Command::Back => controller.go_previous(),
            Command::Forward => controller.go_next(),
            Command::Root => controller.go_root(),
            Command::Complete => controller.complete_drill().await,
            Command::Next => controller.move_to_next_drill(),
            Command::Continue => controller.continue_analyzing(),
            Command::Load(id) => controller.load_completed_drill(&id),
            Command::Drill(index) => controller.navigate_to_drill(index),
            Command::Analysis(enabled) => {
                controller.set_analysis_enabled(enabled);
                true
            }
            Command::Status => true,
            Command::Reset => {
                controller.reset_session();
                controller.start_session(&drills)
            }
            Command::Quit => break,
        };
        if !accepted {
            eprintln!("(ignored)");
        }
        print_snapshot(&controller)?;
    }

    info!("Shutting down Stockfish engine");
    search.quit().await;
    Ok(())
}
