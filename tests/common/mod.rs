#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chess_core::rules;
use chess_core::{PlayerColor, STANDARD_START_FEN};
use futures::StreamExt;

use drill_trainer::analyzer::BackgroundAnalyzer;
use drill_trainer::cache::AnalysisCache;
use drill_trainer::config::{AnalysisSettings, DrillTiming};
use drill_trainer::engines::{
    MoveProbability, MoveProbabilityModel, OpponentMoveRequest, OpponentService, PositionPolicy,
    ProbabilityBatch, SearchEngine, SearchInfo, SearchStream,
};
use drill_trainer::session::{DrillConfiguration, DrillSelection};
use drill_trainer::{DrillController, TrainerError};

/// Search engine that deepens one ply per `step` and counts its searches.
pub struct CountingSearch {
    pub calls: AtomicUsize,
    step: Duration,
}

impl CountingSearch {
    pub fn new(step: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            step,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchEngine for CountingSearch {
    async fn evaluation_stream(&self, fen: &str, _move_hint: usize) -> Result<SearchStream, TrainerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let best_move = rules::legal_moves(fen)?.first().map(|m| m.uci.clone());
        let step = self.step;

        let stream = futures::stream::unfold(1u32, move |depth| {
            let best_move = best_move.clone();
            async move {
                if depth > 20 {
                    return None;
                }
                tokio::time::sleep(step).await;
                let info = SearchInfo {
                    depth,
                    cp: Some(20),
                    mate: None,
                    pv: best_move.iter().cloned().collect(),
                    best_move,
                };
                Some((Ok(info), depth + 1))
            }
        });
        Ok(stream.boxed())
    }
}

/// Probability model that ranks legal moves in generation order.
pub struct CountingModel {
    pub calls: AtomicUsize,
}

impl CountingModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MoveProbabilityModel for CountingModel {
    async fn evaluate_batch(
        &self,
        fens: &[String],
        ratings: &[u32],
        _thresholds: &[f32],
    ) -> Result<ProbabilityBatch, TrainerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut results = Vec::new();
        for (fen, rating) in fens.iter().zip(ratings) {
            let moves = rules::legal_moves(fen)?
                .into_iter()
                .enumerate()
                .map(|(idx, m)| MoveProbability {
                    uci: m.uci,
                    probability: 0.5 / (idx + 1) as f32,
                })
                .collect();
            results.push(PositionPolicy {
                fen: fen.clone(),
                rating: *rating,
                moves,
            });
        }
        Ok(ProbabilityBatch {
            results,
            elapsed_ms: 1,
        })
    }
}

pub struct FailingSearch;

#[async_trait]
impl SearchEngine for FailingSearch {
    async fn evaluation_stream(&self, _fen: &str, _move_hint: usize) -> Result<SearchStream, TrainerError> {
        Err(TrainerError::Stockfish("engine crashed".into()))
    }
}

pub struct FailingModel;

#[async_trait]
impl MoveProbabilityModel for FailingModel {
    async fn evaluate_batch(&self, _: &[String], _: &[u32], _: &[f32]) -> Result<ProbabilityBatch, TrainerError> {
        Err(TrainerError::MoveService("model offline".into()))
    }
}

/// Probability model that never answers.
pub struct SilentModel;

#[async_trait]
impl MoveProbabilityModel for SilentModel {
    async fn evaluate_batch(&self, _: &[String], _: &[u32], _: &[f32]) -> Result<ProbabilityBatch, TrainerError> {
        futures::future::pending::<Result<ProbabilityBatch, TrainerError>>().await
    }
}

/// Opponent that plays a fixed script, then has nothing to offer.
pub struct ScriptedOpponent {
    script: Mutex<VecDeque<String>>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedOpponent {
    pub fn new(moves: &[&str]) -> Arc<Self> {
        Self::with_delay(moves, Duration::ZERO)
    }

    pub fn with_delay(moves: &[&str], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(moves.iter().map(|m| m.to_string()).collect()),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OpponentService for ScriptedOpponent {
    async fn request_move(&self, _request: &OpponentMoveRequest) -> Result<Option<String>, TrainerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.script.lock().unwrap().pop_front())
    }
}

pub struct FailingOpponent;

#[async_trait]
impl OpponentService for FailingOpponent {
    async fn request_move(&self, _request: &OpponentMoveRequest) -> Result<Option<String>, TrainerError> {
        Err(TrainerError::MoveService("opponent offline".into()))
    }
}

pub fn analyzer(search: Arc<dyn SearchEngine>, model: Arc<dyn MoveProbabilityModel>) -> BackgroundAnalyzer {
    BackgroundAnalyzer::new(Arc::new(AnalysisCache::new()), search, model, AnalysisSettings::default())
}

pub fn controller(
    search: Arc<dyn SearchEngine>,
    model: Arc<dyn MoveProbabilityModel>,
    opponent: Arc<dyn OpponentService>,
) -> DrillController {
    DrillController::with_analyzer(analyzer(search, model), opponent, DrillTiming::default(), true)
}

/// Controller backed by instant fake engines.
pub fn quick_controller(opponent: Arc<dyn OpponentService>) -> DrillController {
    controller(CountingSearch::new(Duration::ZERO), CountingModel::new(), opponent)
}

pub fn selection(id: &str, pgn: &str, color: PlayerColor, target: u32) -> DrillSelection {
    DrillSelection {
        id: id.to_string(),
        name: format!("Drill {id}"),
        variation: None,
        pgn: pgn.to_string(),
        start_fen: STANDARD_START_FEN.to_string(),
        player_color: color,
        target_move_number: target,
        opponent_strength: "maia_kdd_1500".to_string(),
    }
}

pub fn configuration(selections: Vec<DrillSelection>) -> DrillConfiguration {
    DrillConfiguration {
        selections,
        drill_count: None,
    }
}

pub async fn wait(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
