//! Contracts for the external evaluation and move services.
//!
//! The controller and analyzer only see these traits; `stockfish` and `maia`
//! provide the production implementations.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::TrainerError;

/// One `info` update from an iterative-deepening search.
/// Scores are from the side to move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchInfo {
    pub depth: u32,
    pub cp: Option<i32>,
    pub mate: Option<i32>,
    pub best_move: Option<String>,
    pub pv: Vec<String>,
}

pub type SearchStream = BoxStream<'static, Result<SearchInfo, TrainerError>>;

#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Start a search and stream increasing-depth results.
    /// Dropping the stream abandons the search.
    async fn evaluation_stream(&self, fen: &str, move_hint: usize) -> Result<SearchStream, TrainerError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveProbability {
    pub uci: String,
    pub probability: f32,
}

/// Best-response distribution for one position at one strength.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionPolicy {
    pub fen: String,
    pub rating: u32,
    /// Sorted highest to lowest
    pub moves: Vec<MoveProbability>,
}

impl PositionPolicy {
    pub fn top_move(&self) -> Option<&MoveProbability> {
        self.moves.first()
    }

    /// Probability and 1-based rank of `uci`, if the model considered it.
    pub fn lookup(&self, uci: &str) -> Option<(f32, usize)> {
        self.moves
            .iter()
            .position(|m| m.uci == uci)
            .map(|idx| (self.moves[idx].probability, idx + 1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbabilityBatch {
    pub results: Vec<PositionPolicy>,
    pub elapsed_ms: u64,
}

#[async_trait]
pub trait MoveProbabilityModel: Send + Sync {
    async fn evaluate_batch(
        &self,
        fens: &[String],
        ratings: &[u32],
        thresholds: &[f32],
    ) -> Result<ProbabilityBatch, TrainerError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpponentMoveRequest {
    /// UCI moves from the tree root to the current position
    pub history: Vec<String>,
    /// Opponent model identifier, e.g. `maia_kdd_1500`
    pub strength: String,
    pub fen: String,
    pub initial_clock_secs: u32,
    pub increment_secs: u32,
}

#[async_trait]
pub trait OpponentService: Send + Sync {
    /// A proposed reply in UCI, or `None` when the service has nothing to offer.
    async fn request_move(&self, request: &OpponentMoveRequest) -> Result<Option<String>, TrainerError>;
}
