//! Stockfish engine wrapper using UCI protocol (async I/O)

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::engines::{SearchEngine, SearchInfo, SearchStream};
use crate::error::TrainerError;

type InfoSender = mpsc::Sender<Result<SearchInfo, TrainerError>>;

/// Stockfish engine instance
pub struct StockfishEngine {
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl StockfishEngine {
    /// Spawn a new Stockfish process and initialize UCI
    pub async fn new(path: &str) -> Result<Self, TrainerError> {
        let mut process = Command::new(path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TrainerError::Stockfish(format!("Failed to spawn Stockfish: {e}")))?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| TrainerError::Stockfish("Stockfish stdin unavailable".into()))?;
        let stdout = process
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| TrainerError::Stockfish("Stockfish stdout unavailable".into()))?;

        let mut engine = Self {
            process,
            stdin,
            stdout,
        };

        engine.send("uci").await?;
        engine.wait_for("uciok").await?;

        engine.send("setoption name Threads value 1").await?;
        engine.send("setoption name Hash value 128").await?;
        engine.send("setoption name UCI_AnalyseMode value true").await?;
        engine.send("isready").await?;
        engine.wait_for("readyok").await?;

        Ok(engine)
    }

    /// Send a command to Stockfish
    async fn send(&mut self, cmd: &str) -> Result<(), TrainerError> {
        debug!(cmd, "SF <");
        self.stdin
            .write_all(format!("{cmd}\n").as_bytes())
            .await
            .map_err(|e| TrainerError::Stockfish(format!("Failed to write to Stockfish: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| TrainerError::Stockfish(format!("Failed to flush stdin: {e}")))?;
        Ok(())
    }

    async fn read_line(&mut self, line: &mut String) -> Result<(), TrainerError> {
        line.clear();
        let read = self
            .stdout
            .read_line(line)
            .await
            .map_err(|e| TrainerError::Stockfish(format!("Failed to read from Stockfish: {e}")))?;
        if read == 0 {
            return Err(TrainerError::Stockfish("Stockfish closed its output".into()));
        }
        Ok(())
    }

    /// Wait for a specific response line
    async fn wait_for(&mut self, expected: &str) -> Result<(), TrainerError> {
        let mut line = String::new();
        loop {
            self.read_line(&mut line).await?;
            let trimmed = line.trim();
            debug!(line = trimmed, "SF >");
            if trimmed == expected {
                return Ok(());
            }
        }
    }

    /// Search `fen` to `depth`, forwarding each scored info line to `tx`.
    /// If the receiver goes away the search is stopped and drained.
    pub async fn stream_search(&mut self, fen: &str, depth: u32, tx: &InfoSender) -> Result<(), TrainerError> {
        self.send(&format!("position fen {fen}")).await?;
        self.send(&format!("go depth {depth}")).await?;

        let mut stopped = false;
        let mut line = String::new();
        loop {
            self.read_line(&mut line).await?;
            let trimmed = line.trim();

            if trimmed.starts_with("bestmove") {
                break;
            }
            if stopped || !trimmed.starts_with("info") || !trimmed.contains(" pv ") {
                continue;
            }
            if let Some(info) = parse_info(trimmed) {
                if tx.send(Ok(info)).await.is_err() {
                    self.send("stop").await?;
                    stopped = true;
                }
            }
        }

        Ok(())
    }

    /// Send quit command and wait for process to exit
    pub async fn quit(&mut self) {
        let _ = self.send("quit").await;
        let _ = self.process.wait().await;
    }
}

/// Shared Stockfish process exposed as a [`SearchEngine`].
/// Searches are serialized on the one process.
#[derive(Clone)]
pub struct StockfishSearch {
    engine: Arc<Mutex<StockfishEngine>>,
    max_depth: u32,
}

impl StockfishSearch {
    pub async fn spawn(path: &str, max_depth: u32) -> Result<Self, TrainerError> {
        let engine = StockfishEngine::new(path).await?;
        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
            max_depth,
        })
    }

    pub async fn quit(&self) {
        self.engine.lock().await.quit().await;
    }
}

#[async_trait]
impl SearchEngine for StockfishSearch {
    async fn evaluation_stream(&self, fen: &str, _move_hint: usize) -> Result<SearchStream, TrainerError> {
        let (tx, rx) = mpsc::channel(32);
        let engine = self.engine.clone();
        let fen = fen.to_string();
        let depth = self.max_depth;

        tokio::spawn(async move {
            let mut engine = engine.lock().await;
            if let Err(e) = engine.stream_search(&fen, depth, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

fn parse_info(line: &str) -> Option<SearchInfo> {
    let depth = parse_depth(line)?;
    let pv = parse_pv(line);
    Some(SearchInfo {
        depth,
        cp: parse_cp(line),
        mate: parse_mate(line),
        best_move: pv.first().cloned(),
        pv,
    })
}

fn parse_field<T: std::str::FromStr>(line: &str, key: &str) -> Option<T> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    for (i, part) in parts.iter().enumerate() {
        if *part == key && i + 1 < parts.len() {
            return parts[i + 1].parse().ok();
        }
    }
    None
}

/// Parse search depth from info line
fn parse_depth(line: &str) -> Option<u32> {
    parse_field(line, "depth")
}

/// Parse centipawn score from info line
fn parse_cp(line: &str) -> Option<i32> {
    parse_field(line, "cp")
}

/// Parse mate score from info line
fn parse_mate(line: &str) -> Option<i32> {
    parse_field(line, "mate")
}

/// Parse PV moves from info line
fn parse_pv(line: &str) -> Vec<String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let mut in_pv = false;
    let mut moves = Vec::new();

    for part in parts {
        if part == "pv" {
            in_pv = true;
            continue;
        }
        if in_pv {
            if part.starts_with("bmc") || part == "string" {
                break;
            }
            moves.push(part.to_string());
        }
    }

    moves
}
