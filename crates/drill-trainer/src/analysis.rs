//! Move classification: pure functions only
//! (No tree/cache/engine dependencies)

use serde::{Deserialize, Serialize};

/// Classification thresholds (centipawn loss)
const THRESHOLD_BEST: i32 = 0;
const THRESHOLD_EXCELLENT: i32 = 10;
const THRESHOLD_GOOD: i32 = 50;
const THRESHOLD_INACCURACY: i32 = 100;
const THRESHOLD_MISTAKE: i32 = 200;

/// Probability bounds for moves only the human-move model has seen
const PROB_GOOD: f32 = 0.25;
const PROB_INACCURACY: f32 = 0.10;
const PROB_MISTAKE: f32 = 0.02;

/// Mate detection threshold
const MATE_THRESHOLD: i32 = 9000;

/// Maximum CP loss to cap at
const MAX_CP_LOSS: i32 = 500;

const RATING_CEILING: f64 = 2700.0;
const RATING_FLOOR: f64 = 600.0;
const RATING_PER_CP: f64 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveClass {
    Best,
    Excellent,
    Good,
    Inaccuracy,
    Mistake,
    Blunder,
}

impl MoveClass {
    pub fn as_str(self) -> &'static str {
        match self {
            MoveClass::Best => "best",
            MoveClass::Excellent => "excellent",
            MoveClass::Good => "good",
            MoveClass::Inaccuracy => "inaccuracy",
            MoveClass::Mistake => "mistake",
            MoveClass::Blunder => "blunder",
        }
    }

    pub fn is_good(self) -> bool {
        matches!(self, MoveClass::Best | MoveClass::Excellent | MoveClass::Good)
    }

    /// Stand-in centipawn loss for moves classified without an engine score.
    pub fn nominal_cp_loss(self) -> i32 {
        match self {
            MoveClass::Best => 0,
            MoveClass::Excellent => 5,
            MoveClass::Good => 25,
            MoveClass::Inaccuracy => 75,
            MoveClass::Mistake => 150,
            MoveClass::Blunder => 300,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classifications {
    pub best: u32,
    pub excellent: u32,
    pub good: u32,
    pub inaccuracy: u32,
    pub mistake: u32,
    pub blunder: u32,
}

impl Classifications {
    pub fn record(&mut self, class: MoveClass) {
        match class {
            MoveClass::Best => self.best += 1,
            MoveClass::Excellent => self.excellent += 1,
            MoveClass::Good => self.good += 1,
            MoveClass::Inaccuracy => self.inaccuracy += 1,
            MoveClass::Mistake => self.mistake += 1,
            MoveClass::Blunder => self.blunder += 1,
        }
    }
}

fn is_mate_position(eval: i32) -> bool {
    eval.abs() > MATE_THRESHOLD
}

/// Convert an engine score (side to move) into centipawns from white's view.
pub fn eval_to_white_cp(cp: Option<i32>, mate: Option<i32>, is_white_to_move: bool) -> Option<i32> {
    let score = if let Some(m) = mate {
        if m > 0 {
            10000 - m * 10
        } else {
            -10000 - m * 10
        }
    } else {
        cp?
    };
    Some(if is_white_to_move { score } else { -score })
}

pub fn is_mate_blunder(best_eval: i32, after_eval: i32, is_white: bool, is_checkmate: bool) -> bool {
    if is_checkmate {
        return false;
    }

    let best_is_mate = is_mate_position(best_eval);
    let after_is_mate = is_mate_position(after_eval);

    if best_is_mate && !after_is_mate {
        // Only throwing away our own mate counts
        return if is_white { best_eval > 0 } else { best_eval < 0 };
    }

    if !best_is_mate && after_is_mate {
        return if is_white { after_eval < 0 } else { after_eval > 0 };
    }

    false
}

pub fn calculate_cp_loss(best_eval: i32, after_eval: i32, is_white: bool, is_checkmate: bool) -> i32 {
    if is_checkmate {
        return 0;
    }

    let best_is_mate = is_mate_position(best_eval);
    let after_is_mate = is_mate_position(after_eval);

    if best_is_mate && after_is_mate {
        if (best_eval > 0) == (after_eval > 0) {
            return 0;
        } else {
            return MAX_CP_LOSS;
        }
    }

    let cp_loss = if is_white {
        best_eval - after_eval
    } else {
        after_eval - best_eval
    };

    cp_loss.clamp(0, MAX_CP_LOSS)
}

pub fn classify_move(cp_loss: i32, is_mate_blunder: bool) -> MoveClass {
    if is_mate_blunder {
        return MoveClass::Blunder;
    }
    if cp_loss <= THRESHOLD_BEST {
        MoveClass::Best
    } else if cp_loss < THRESHOLD_EXCELLENT {
        MoveClass::Excellent
    } else if cp_loss < THRESHOLD_GOOD {
        MoveClass::Good
    } else if cp_loss < THRESHOLD_INACCURACY {
        MoveClass::Inaccuracy
    } else if cp_loss < THRESHOLD_MISTAKE {
        MoveClass::Mistake
    } else {
        MoveClass::Blunder
    }
}

/// Classification from the human-move model alone.
/// `probability` is `None` when the model never considered the move.
pub fn classify_by_probability(probability: Option<f32>, rank: Option<usize>) -> MoveClass {
    if rank == Some(1) {
        return MoveClass::Best;
    }
    match probability {
        Some(p) if p >= PROB_GOOD => MoveClass::Good,
        Some(p) if p >= PROB_INACCURACY => MoveClass::Inaccuracy,
        Some(p) if p >= PROB_MISTAKE => MoveClass::Mistake,
        _ => MoveClass::Blunder,
    }
}

pub fn calculate_accuracy(total_cp_loss: i32, move_count: u32) -> f64 {
    if move_count == 0 {
        return 100.0;
    }
    let acpl = total_cp_loss as f64 / move_count as f64;
    let accuracy = 100.0 * (1.0 / (1.0 + acpl / 100.0)).sqrt();
    accuracy.clamp(0.0, 100.0)
}

/// Rating a single move "plays like".
pub fn move_rating(cp_loss: i32) -> f64 {
    (RATING_CEILING - RATING_PER_CP * cp_loss as f64).clamp(RATING_FLOOR, RATING_CEILING)
}

/// Mean and population standard deviation.
pub fn mean_and_spread(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}
