//! Performance reports for finished drills.
//!
//! The primary path classifies every player move from cached (or freshly
//! fetched) engine and model analysis. Any failure there, including a panic,
//! downgrades to a fixed heuristic so a report is always produced.

use std::collections::HashMap;

use chess_core::rules;
use chess_core::{NodeId, PlayerColor};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::analysis::{self, Classifications, MoveClass};
use crate::analyzer::BackgroundAnalyzer;
use crate::cache::AnalysisEntry;
use crate::error::TrainerError;
use crate::session::{CompletedDrill, DrillGame};

const FEEDBACK_EXCELLENT: f64 = 90.0;
const FEEDBACK_GOOD: f64 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportSource {
    Engines,
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveAnalysis {
    pub ply: usize,
    pub uci: String,
    pub san: String,
    pub classification: Option<MoveClass>,
    pub cp_loss: Option<i32>,
    /// White-relative evaluation before and after the move
    pub eval_before: Option<i32>,
    pub eval_after: Option<i32>,
    pub engine_best: Option<String>,
    pub model_probability: Option<f32>,
    pub model_rank: Option<usize>,
    pub model_top: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingEstimate {
    pub rating: f64,
    pub sample_size: usize,
    pub spread: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrillPerformance {
    pub selection_id: String,
    pub accuracy: f64,
    pub avg_cp_loss: f64,
    pub player_moves: usize,
    pub classifications: Classifications,
    pub moves: Vec<MoveAnalysis>,
    /// SAN of moves classified best, excellent or good
    pub good_moves: Vec<String>,
    pub blunders: Vec<String>,
    pub rating: Option<RatingEstimate>,
    /// Share of moves matching the model's top choice
    pub model_agreement: Option<f64>,
    pub feedback: String,
    pub source: ReportSource,
    pub final_fen: String,
}

pub fn feedback_for(accuracy: f64) -> String {
    if accuracy >= FEEDBACK_EXCELLENT {
        "Excellent! You played this opening with confidence.".to_string()
    } else if accuracy >= FEEDBACK_GOOD {
        "Good job. A few moves could be sharper.".to_string()
    } else {
        "Needs practice. Review the critical moments of this line.".to_string()
    }
}

#[derive(Clone)]
pub struct PerformanceEvaluator {
    analyzer: BackgroundAnalyzer,
}

impl PerformanceEvaluator {
    pub fn new(analyzer: BackgroundAnalyzer) -> Self {
        Self { analyzer }
    }

    /// Report for the game ending at `final_node`. Never fails.
    pub async fn evaluate(&self, game: &DrillGame, final_node: NodeId) -> DrillPerformance {
        let evaluator = self.clone();
        let owned = game.clone();
        let primary = tokio::spawn(async move { evaluator.analyze(&owned, final_node).await });

        match primary.await {
            Ok(Ok(performance)) => performance,
            Ok(Err(e)) => {
                warn!(game_id = %game.id, error = %e, "Falling back to heuristic report");
                heuristic_performance(game, final_node)
            }
            Err(e) => {
                warn!(game_id = %game.id, error = %e, "Evaluator task failed, using heuristic report");
                heuristic_performance(game, final_node)
            }
        }
    }

    /// Engine-backed report. Fails with [`TrainerError::NoAnalysis`] when no
    /// player move could be classified.
    pub async fn analyze(&self, game: &DrillGame, final_node: NodeId) -> Result<DrillPerformance, TrainerError> {
        let pairs = player_move_nodes(game, final_node);

        let mut fens: Vec<String> = Vec::new();
        for (parent, node) in &pairs {
            for id in [*parent, *node] {
                let fen = game.fen(id).ok_or(TrainerError::UnknownNode(id.index()))?;
                if !fens.iter().any(|f| f == fen) {
                    fens.push(fen.to_string());
                }
            }
        }

        let fetched = join_all(fens.iter().map(|fen| self.analyzer.fetch(fen))).await;
        let entries: HashMap<&str, AnalysisEntry> = fens
            .iter()
            .map(String::as_str)
            .zip(fetched)
            .filter_map(|(fen, entry)| entry.map(|e| (fen, e)))
            .collect();

        let mut moves = Vec::with_capacity(pairs.len());
        for (parent, node) in &pairs {
            let before_fen = game.fen(*parent).ok_or(TrainerError::UnknownNode(parent.index()))?;
            let after_fen = game.fen(*node).ok_or(TrainerError::UnknownNode(node.index()))?;
            let played = game.tree.get(*node).ok_or(TrainerError::UnknownNode(node.index()))?;
            moves.push(assess_move(
                played.ply,
                played.uci.as_deref().unwrap_or_default(),
                played.san.as_deref().unwrap_or_default(),
                before_fen,
                after_fen,
                entries.get(before_fen),
                entries.get(after_fen),
            )?);
        }

        if !moves.is_empty() && moves.iter().all(|m| m.cp_loss.is_none()) {
            return Err(TrainerError::NoAnalysis);
        }
        let performance = engine_report(game, final_node, moves);

        info!(
            game_id = %game.id,
            accuracy = performance.accuracy,
            rating = performance.rating.as_ref().map(|r| r.rating),
            "Drill evaluated"
        );
        Ok(performance)
    }
}

/// Aggregate per-move analysis into an engine-backed report.
fn engine_report(game: &DrillGame, final_node: NodeId, moves: Vec<MoveAnalysis>) -> DrillPerformance {
    let classified: Vec<(MoveClass, i32)> = moves
        .iter()
        .filter_map(|m| Some((m.classification?, m.cp_loss?)))
        .collect();

    let mut classifications = Classifications::default();
    let mut total_loss = 0;
    for (class, loss) in &classified {
        classifications.record(*class);
        total_loss += loss;
    }

    let count = classified.len();
    let accuracy = analysis::calculate_accuracy(total_loss, count as u32);
    let avg_cp_loss = if count == 0 { 0.0 } else { total_loss as f64 / count as f64 };

    let ratings: Vec<f64> = classified.iter().map(|(_, loss)| analysis::move_rating(*loss)).collect();
    let rating = (!ratings.is_empty()).then(|| {
        let (rating, spread) = analysis::mean_and_spread(&ratings);
        RatingEstimate {
            rating,
            sample_size: ratings.len(),
            spread,
        }
    });

    let compared: Vec<bool> = moves
        .iter()
        .filter_map(|m| m.model_top.as_ref().map(|top| *top == m.uci))
        .collect();
    let model_agreement = (!compared.is_empty())
        .then(|| compared.iter().filter(|agrees| **agrees).count() as f64 / compared.len() as f64);

    DrillPerformance {
        selection_id: game.selection.id.clone(),
        accuracy,
        avg_cp_loss,
        player_moves: moves.len(),
        good_moves: labels(&moves, MoveClass::is_good),
        blunders: labels(&moves, |c| c == MoveClass::Blunder),
        classifications,
        moves,
        rating,
        model_agreement,
        feedback: feedback_for(accuracy),
        source: ReportSource::Engines,
        final_fen: game.fen(final_node).unwrap_or_default().to_string(),
    }
}

impl DrillPerformance {
    /// Re-derive the report for the game's current main line.
    ///
    /// Analysis is kept for player moves still on the line. Moves played
    /// since stay unclassified until the drill is evaluated again.
    pub fn follow_line(&self, game: &DrillGame) -> DrillPerformance {
        let final_node = game.final_node();
        if self.source == ReportSource::Heuristic {
            return heuristic_performance(game, final_node);
        }

        let moves = player_move_nodes(game, final_node)
            .into_iter()
            .filter_map(|(_, node)| game.tree.get(node))
            .map(|played| {
                let uci = played.uci.clone().unwrap_or_default();
                self.moves
                    .iter()
                    .find(|m| m.ply == played.ply && m.uci == uci)
                    .cloned()
                    .unwrap_or_else(|| MoveAnalysis {
                        ply: played.ply,
                        san: played.san.clone().unwrap_or_default(),
                        uci,
                        classification: None,
                        cp_loss: None,
                        eval_before: None,
                        eval_after: None,
                        engine_best: None,
                        model_probability: None,
                        model_rank: None,
                        model_top: None,
                    })
            })
            .collect();
        engine_report(game, final_node, moves)
    }
}

fn labels(moves: &[MoveAnalysis], keep: impl Fn(MoveClass) -> bool) -> Vec<String> {
    moves
        .iter()
        .filter(|m| m.classification.is_some_and(&keep))
        .map(|m| m.san.clone())
        .collect()
}

fn assess_move(
    ply: usize,
    uci: &str,
    san: &str,
    before_fen: &str,
    after_fen: &str,
    before: Option<&AnalysisEntry>,
    after: Option<&AnalysisEntry>,
) -> Result<MoveAnalysis, TrainerError> {
    let is_white = rules::side_to_move(before_fen)? == PlayerColor::White;
    let checkmate = rules::is_checkmate(after_fen);

    let search_before = before.and_then(|e| e.search.as_ref());
    let search_after = after.and_then(|e| e.search.as_ref());
    let policy = before.and_then(|e| e.policy.as_ref());

    let eval_before = search_before.and_then(|s| analysis::eval_to_white_cp(s.cp, s.mate, is_white));
    let eval_after = search_after.and_then(|s| analysis::eval_to_white_cp(s.cp, s.mate, !is_white));
    let engine_best = search_before.and_then(|s| s.best_move.clone());
    let (model_probability, model_rank) = match policy.and_then(|p| p.lookup(uci)) {
        Some((probability, rank)) => (Some(probability), Some(rank)),
        None => (None, None),
    };

    let verdict = if checkmate || engine_best.as_deref() == Some(uci) {
        Some((MoveClass::Best, 0))
    } else if let (Some(best), Some(played)) = (eval_before, eval_after) {
        let loss = analysis::calculate_cp_loss(best, played, is_white, false);
        if analysis::is_mate_blunder(best, played, is_white, false) {
            Some((MoveClass::Blunder, loss.max(MoveClass::Blunder.nominal_cp_loss())))
        } else {
            Some((analysis::classify_move(loss, false), loss))
        }
    } else if policy.is_some() {
        let class = analysis::classify_by_probability(model_probability, model_rank);
        Some((class, class.nominal_cp_loss()))
    } else {
        None
    };

    Ok(MoveAnalysis {
        ply,
        uci: uci.to_string(),
        san: san.to_string(),
        classification: verdict.map(|(class, _)| class),
        cp_loss: verdict.map(|(_, loss)| loss),
        eval_before,
        eval_after,
        engine_best,
        model_probability,
        model_rank,
        model_top: policy.and_then(|p| p.top_move()).map(|m| m.uci.clone()),
    })
}

/// `(position before, position after)` for each player move between the
/// opening end and `final_node`.
pub fn player_move_nodes(game: &DrillGame, final_node: NodeId) -> Vec<(NodeId, NodeId)> {
    let path = game.tree.path(final_node);
    let Some(start) = path.iter().position(|id| *id == game.opening_end) else {
        return Vec::new();
    };

    let mut turn = game.opening_side;
    let mut pairs = Vec::new();
    for step in path[start..].windows(2) {
        if turn == game.selection.player_color {
            pairs.push((step[0], step[1]));
        }
        turn = turn.opposite();
    }
    pairs
}

/// Deterministic stand-in report: 70% good, 20% blunders, the rest unclassified.
pub fn heuristic_performance(game: &DrillGame, final_node: NodeId) -> DrillPerformance {
    let pairs = player_move_nodes(game, final_node);
    let total = pairs.len();
    let good = total * 7 / 10;
    let blunders = total * 2 / 10;

    let mut classifications = Classifications::default();
    let mut total_loss = 0;
    let moves: Vec<MoveAnalysis> = pairs
        .iter()
        .enumerate()
        .map(|(idx, (_, node))| {
            let class = if idx < good {
                Some(MoveClass::Good)
            } else if idx < good + blunders {
                Some(MoveClass::Blunder)
            } else {
                None
            };
            if let Some(class) = class {
                classifications.record(class);
                total_loss += class.nominal_cp_loss();
            }
            let played = game.tree.get(*node);
            MoveAnalysis {
                ply: played.map(|n| n.ply).unwrap_or_default(),
                uci: played.and_then(|n| n.uci.clone()).unwrap_or_default(),
                san: played.and_then(|n| n.san.clone()).unwrap_or_default(),
                classification: class,
                cp_loss: class.map(MoveClass::nominal_cp_loss),
                eval_before: None,
                eval_after: None,
                engine_best: None,
                model_probability: None,
                model_rank: None,
                model_top: None,
            }
        })
        .collect();

    let accuracy = if total == 0 {
        100.0
    } else {
        100.0 * (total - blunders) as f64 / total as f64
    };
    let classified = good + blunders;

    DrillPerformance {
        selection_id: game.selection.id.clone(),
        accuracy,
        avg_cp_loss: if classified == 0 { 0.0 } else { total_loss as f64 / classified as f64 },
        player_moves: total,
        good_moves: labels(&moves, MoveClass::is_good),
        blunders: labels(&moves, |c| c == MoveClass::Blunder),
        classifications,
        moves,
        rating: None,
        model_agreement: None,
        feedback: feedback_for(accuracy),
        source: ReportSource::Heuristic,
        final_fen: game.fen(final_node).unwrap_or_default().to_string(),
    }
}

/// Statistics across every completed drill in the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub drills_completed: usize,
    pub total_player_moves: usize,
    pub average_accuracy: f64,
    pub rating: Option<RatingEstimate>,
    pub good_moves: usize,
    pub blunders: usize,
    /// Selection ids with the highest and lowest accuracy
    pub strongest: Option<String>,
    pub weakest: Option<String>,
}

impl SessionSummary {
    pub fn from_completed(drills: &[CompletedDrill]) -> Self {
        if drills.is_empty() {
            return Self::default();
        }

        let reports: Vec<&DrillPerformance> = drills.iter().map(|d| &d.performance).collect();
        let average_accuracy = reports.iter().map(|p| p.accuracy).sum::<f64>() / reports.len() as f64;

        // Pooled over every rated move, not averaged per drill.
        let rated: Vec<&RatingEstimate> = reports.iter().filter_map(|p| p.rating.as_ref()).collect();
        let samples: usize = rated.iter().map(|r| r.sample_size).sum();
        let rating = (samples > 0).then(|| {
            let n = samples as f64;
            let mean = rated.iter().map(|r| r.rating * r.sample_size as f64).sum::<f64>() / n;
            let variance = rated
                .iter()
                .map(|r| r.sample_size as f64 * (r.spread.powi(2) + (r.rating - mean).powi(2)))
                .sum::<f64>()
                / n;
            RatingEstimate {
                rating: mean,
                sample_size: samples,
                spread: variance.sqrt(),
            }
        });

        let by_accuracy = |a: &&CompletedDrill, b: &&CompletedDrill| {
            a.performance.accuracy.total_cmp(&b.performance.accuracy)
        };

        Self {
            drills_completed: drills.len(),
            total_player_moves: drills.iter().map(|d| d.player_moves.len()).sum(),
            average_accuracy,
            rating,
            good_moves: drills.iter().map(|d| d.good_moves.len()).sum(),
            blunders: drills.iter().map(|d| d.blunders.len()).sum(),
            strongest: drills.iter().max_by(by_accuracy).map(|d| d.selection.id.clone()),
            weakest: drills.iter().min_by(by_accuracy).map(|d| d.selection.id.clone()),
        }
    }
}
