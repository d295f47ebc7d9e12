//! Trainer error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainerError {
    #[error("Configuration error: {0}")]
    Config(&'static str),

    #[error("Stockfish error: {0}")]
    Stockfish(String),

    #[error("Move service error: {0}")]
    MoveService(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rules error: {0}")]
    Rules(#[from] chess_core::RulesError),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Node {0} is not part of the tree")]
    UnknownNode(usize),

    #[error("No evaluation data for any player move")]
    NoAnalysis,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
