//! Drill selections, live drill games and completed-drill records.

use std::sync::atomic::{AtomicU64, Ordering};

use chess_core::rules::{self, AppliedMove};
use chess_core::{pgn, NodeId, PlayerColor, PositionTree, STANDARD_START_FEN};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::TrainerError;
use crate::evaluator::DrillPerformance;

/// Game ids starting with this mark a drill rebuilt from a completed record.
pub const REPLAY_PREFIX: &str = "replay-";

static NEXT_GAME: AtomicU64 = AtomicU64::new(1);

fn default_start_fen() -> String {
    STANDARD_START_FEN.to_string()
}

fn default_strength() -> String {
    "maia_kdd_1500".to_string()
}

/// One opening to drill. Immutable once a drill starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrillSelection {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub variation: Option<String>,
    /// Opening move text, e.g. `1. e4 c5 2. Nf3`
    pub pgn: String,
    #[serde(default = "default_start_fen")]
    pub start_fen: String,
    pub player_color: PlayerColor,
    /// Player moves to make after the opening before the drill completes
    pub target_move_number: u32,
    #[serde(default = "default_strength")]
    pub opponent_strength: String,
}

impl DrillSelection {
    pub fn display_name(&self) -> String {
        match &self.variation {
            Some(variation) => format!("{}: {}", self.name, variation),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillConfiguration {
    pub selections: Vec<DrillSelection>,
    /// Number of drills to run; defaults to every selection
    #[serde(default)]
    pub drill_count: Option<usize>,
}

impl DrillConfiguration {
    pub fn from_json(json: &str) -> Result<Self, TrainerError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Selections that make up the session, in order.
    pub fn drills(&self) -> &[DrillSelection] {
        let count = self.drill_count.unwrap_or(self.selections.len());
        &self.selections[..count.min(self.selections.len())]
    }
}

/// Live (or replayed) state of one drill.
#[derive(Debug, Clone)]
pub struct DrillGame {
    pub id: String,
    pub selection: DrillSelection,
    pub tree: PositionTree,
    /// Node where the seeded opening stops
    pub opening_end: NodeId,
    /// Side to move at `opening_end`
    pub opening_side: PlayerColor,
    /// Node the player is looking at
    pub cursor: NodeId,
    /// UCI moves on the main line after the opening
    pub moves: Vec<String>,
    pub player_move_count: u32,
}

impl DrillGame {
    pub fn new(selection: DrillSelection) -> Result<Self, TrainerError> {
        let id = format!("{}#{}", selection.id, NEXT_GAME.fetch_add(1, Ordering::Relaxed));
        Self::with_id(selection, id)
    }

    fn with_id(selection: DrillSelection, id: String) -> Result<Self, TrainerError> {
        rules::parse_position(&selection.start_fen)?;

        let mut tree = PositionTree::new(&selection.start_fen);
        let opening_end = pgn::seed(&selection.pgn, &mut tree);
        let opening_fen = tree
            .fen(opening_end)
            .ok_or(TrainerError::UnknownNode(opening_end.index()))?;
        let opening_side = rules::side_to_move(opening_fen)?;

        debug!(game_id = %id, opening = %selection.name, ply = tree.get(opening_end).map(|n| n.ply), "Drill game created");
        Ok(Self {
            id,
            selection,
            tree,
            opening_end,
            opening_side,
            cursor: opening_end,
            moves: Vec::new(),
            player_move_count: 0,
        })
    }

    /// Rebuild a finished drill by replaying its recorded moves.
    ///
    /// Uses the full move list when present, else the player's own moves.
    /// Replay stops at the first move that no longer fits.
    pub fn replay(completed: &CompletedDrill) -> Result<Self, TrainerError> {
        let id = format!(
            "{REPLAY_PREFIX}{}#{}",
            completed.selection.id,
            NEXT_GAME.fetch_add(1, Ordering::Relaxed)
        );
        let mut game = Self::with_id(completed.selection.clone(), id)?;

        let moves = completed.all_moves.as_deref().unwrap_or(&completed.player_moves);
        for token in moves {
            if let Err(e) = game.play(token) {
                warn!(game_id = %game.id, token = %token, error = %e, "Replay stopped early");
                break;
            }
        }

        if game.fen(game.cursor) != Some(completed.final_fen.as_str()) {
            warn!(game_id = %game.id, "Replay did not reach the recorded final position");
        }
        Ok(game)
    }

    pub fn is_replay(&self) -> bool {
        self.id.starts_with(REPLAY_PREFIX)
    }

    pub fn fen(&self, node: NodeId) -> Option<&str> {
        self.tree.fen(node)
    }

    pub fn cursor_fen(&self) -> Option<&str> {
        self.tree.fen(self.cursor)
    }

    /// Last node of the main line.
    pub fn final_node(&self) -> NodeId {
        self.tree.main_line().last().copied().unwrap_or(self.opening_end)
    }

    pub fn is_player_turn_at(&self, node: NodeId) -> bool {
        self.fen(node)
            .and_then(|fen| rules::side_to_move(fen).ok())
            .is_some_and(|side| side == self.selection.player_color)
    }

    pub fn is_player_turn(&self) -> bool {
        self.is_player_turn_at(self.cursor)
    }

    /// True for the opening end and anything played after it.
    pub fn is_in_drill(&self, node: NodeId) -> bool {
        self.tree.path(node).contains(&self.opening_end)
    }

    /// Play `token` from the cursor and move the cursor onto the result.
    ///
    /// A move that already exists is reused as-is. Otherwise any existing
    /// continuation is destroyed before the new move becomes the main line.
    pub fn play(&mut self, token: &str) -> Result<NodeId, TrainerError> {
        let cursor = self.cursor;
        let fen = self.fen(cursor).ok_or(TrainerError::UnknownNode(cursor.index()))?;
        let AppliedMove { uci, san, fen } = rules::apply_move(fen, token)?;

        let node = match self.tree.find_child(cursor, &uci) {
            Some(existing) => existing,
            None => {
                if self.tree.get(cursor).is_some_and(|n| !n.children.is_empty()) {
                    debug!(game_id = %self.id, uci = %uci, "Overwriting continuation");
                    self.tree.remove_all_children(cursor);
                }
                self.tree
                    .add_main_move(cursor, &fen, &uci, &san)
                    .ok_or(TrainerError::UnknownNode(cursor.index()))?
            }
        };

        self.cursor = node;
        self.recompute();
        Ok(node)
    }

    /// Re-derive the move list and player move count from the main line.
    pub fn recompute(&mut self) {
        let line = self.tree.main_line_after(self.opening_end);
        self.moves = line
            .iter()
            .filter_map(|id| self.tree.get(*id).and_then(|node| node.uci.clone()))
            .collect();
        self.player_move_count = self.player_moves().len() as u32;
    }

    /// Player-attributable moves after the opening, alternating from the opening side.
    pub fn player_moves(&self) -> Vec<String> {
        let mut turn = self.opening_side;
        let mut player_moves = Vec::new();
        for uci in &self.moves {
            if turn == self.selection.player_color {
                player_moves.push(uci.clone());
            }
            turn = turn.opposite();
        }
        player_moves
    }

    pub fn target_reached(&self) -> bool {
        self.player_move_count >= self.selection.target_move_number
    }

    /// UCI history from the tree root to `node`.
    pub fn history(&self, node: NodeId) -> Vec<String> {
        self.tree
            .path(node)
            .into_iter()
            .filter_map(|id| self.tree.get(id).and_then(|n| n.uci.clone()))
            .collect()
    }

    /// SAN labels along the main line, opening included.
    pub fn main_line_san(&self) -> Vec<String> {
        self.tree
            .main_line()
            .into_iter()
            .filter_map(|id| self.tree.get(id).and_then(|n| n.san.clone()))
            .collect()
    }

    /// Short label for the move that produced `node`, e.g. `3... Nc6`.
    pub fn describe(&self, node: NodeId) -> Option<String> {
        let current = self.tree.get(node)?;
        let parent_fen = self.fen(current.parent?)?;
        let san = current.san.as_deref()?;
        let mut fields = parent_fen.split_whitespace().skip(1);
        let dots = if fields.next() == Some("b") { "..." } else { "." };
        let number = fields.nth(3).unwrap_or("1");
        Some(format!("{number}{dots} {san}"))
    }
}

/// Record of a finished drill and its report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedDrill {
    pub selection: DrillSelection,
    pub game_id: String,
    pub final_fen: String,
    /// Every move after the opening; absent in older records
    #[serde(default)]
    pub all_moves: Option<Vec<String>>,
    pub player_moves: Vec<String>,
    pub good_moves: Vec<String>,
    pub blunders: Vec<String>,
    pub performance: DrillPerformance,
    pub completed_at: DateTime<Utc>,
}

impl CompletedDrill {
    pub fn from_game(game: &DrillGame, performance: DrillPerformance) -> Self {
        Self {
            selection: game.selection.clone(),
            game_id: game.id.clone(),
            final_fen: game.fen(game.final_node()).unwrap_or_default().to_string(),
            all_moves: Some(game.moves.clone()),
            player_moves: game.player_moves(),
            good_moves: performance.good_moves.clone(),
            blunders: performance.blunders.clone(),
            performance,
            completed_at: Utc::now(),
        }
    }

    /// Follow further play on the same drill. Everything derived from the
    /// move list, the report included, is rebuilt from the live game.
    pub fn refresh_from(&mut self, game: &DrillGame) {
        let performance = self.performance.follow_line(game);
        self.game_id = game.id.clone();
        self.final_fen = performance.final_fen.clone();
        self.all_moves = Some(game.moves.clone());
        self.player_moves = game.player_moves();
        self.good_moves = performance.good_moves.clone();
        self.blunders = performance.blunders.clone();
        self.performance = performance;
    }
}
