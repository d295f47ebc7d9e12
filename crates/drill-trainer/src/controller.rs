//! Drill session controller.
//!
//! A single-user state machine over one live [`DrillGame`]. All state sits
//! behind one mutex that is never held across an await: collaborator calls
//! run on a snapshot and their results are re-validated against the current
//! game and cursor before anything is applied.
//!
//! Delayed actions (opponent "thinking", the completion grace period) are
//! [`Timers`] keyed to the state that armed them. Timer tasks hold a
//! controller handle and look the current state up when they fire.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chess_core::{rules, NodeId};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::analyzer::BackgroundAnalyzer;
use crate::cache::{AnalysisCache, AnalysisProgress};
use crate::config::{DrillTiming, TrainerConfig};
use crate::engines::{MoveProbabilityModel, OpponentMoveRequest, OpponentService, SearchEngine};
use crate::evaluator::{DrillPerformance, PerformanceEvaluator, SessionSummary};
use crate::session::{CompletedDrill, DrillConfiguration, DrillGame, DrillSelection};
use crate::timers::{TimerKey, TimerKind, Timers};

/// Clock parameters sent with every opponent request.
const OPPONENT_CLOCK_SECS: u32 = 600;
const OPPONENT_INCREMENT_SECS: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionPhase {
    Uninitialized,
    /// The opening ends on the opponent's turn; its first move is pending
    AwaitingOpponentOpening,
    /// Live drill with no opponent reply owed
    PlayerToMove,
    /// The player moved and the opponent owes a reply
    AwaitingOpponentReply,
    /// Report is showing
    DrillComplete,
    /// Free play past completion; the target no longer ends the drill
    ContinueAnalyzing { awaiting_opponent: bool },
    /// Summary is showing
    AllDrillsComplete,
}

impl SessionPhase {
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionPhase::AwaitingOpponentOpening
                | SessionPhase::PlayerToMove
                | SessionPhase::AwaitingOpponentReply
                | SessionPhase::ContinueAnalyzing { .. }
        )
    }

    pub fn is_continue(self) -> bool {
        matches!(self, SessionPhase::ContinueAnalyzing { .. })
    }

    pub fn awaiting_opponent(self) -> bool {
        matches!(
            self,
            SessionPhase::AwaitingOpponentOpening
                | SessionPhase::AwaitingOpponentReply
                | SessionPhase::ContinueAnalyzing { awaiting_opponent: true }
        )
    }
}

/// Everything the rendering layer needs to draw the session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub drill_index: Option<usize>,
    pub current_drill: Option<DrillSelection>,
    pub remaining_drills: Vec<String>,
    pub completed_drills: Vec<String>,
    pub game_id: Option<String>,
    pub is_replay: bool,
    pub cursor: Option<usize>,
    pub cursor_fen: Option<String>,
    pub is_player_turn: bool,
    /// SAN along the main line, opening included
    pub main_line: Vec<String>,
    pub opening_plies: usize,
    /// Origin square to destinations; empty unless the player may move
    pub legal_moves: BTreeMap<String, Vec<String>>,
    pub player_move_count: u32,
    pub target_move_number: Option<u32>,
    pub analysis_enabled: bool,
    pub analysis: AnalysisProgress,
    pub show_performance: bool,
    pub show_summary: bool,
    pub report: Option<DrillPerformance>,
}

struct SessionState {
    phase: SessionPhase,
    drills: Vec<DrillSelection>,
    /// Current drill first
    remaining: Vec<DrillSelection>,
    current_index: Option<usize>,
    game: Option<DrillGame>,
    completed: Vec<CompletedDrill>,
    report: Option<DrillPerformance>,
    /// Bumped on every drill-level transition
    epoch: u64,
    timers: Timers,
    analysis_enabled: bool,
}

impl SessionState {
    fn new(analysis_enabled: bool, epoch: u64, runtime: Handle) -> Self {
        Self {
            phase: SessionPhase::Uninitialized,
            drills: Vec::new(),
            remaining: Vec::new(),
            current_index: None,
            game: None,
            completed: Vec::new(),
            report: None,
            epoch,
            timers: Timers::new(runtime),
            analysis_enabled,
        }
    }
}

struct Inner {
    state: Mutex<SessionState>,
    analyzer: BackgroundAnalyzer,
    evaluator: PerformanceEvaluator,
    opponent: Arc<dyn OpponentService>,
    timing: DrillTiming,
}

/// Cheap handle to one drill session.
///
/// Build it inside a Tokio runtime. Timers and background analysis run on
/// that runtime, so the synchronous methods may be called from any thread.
#[derive(Clone)]
pub struct DrillController {
    inner: Arc<Inner>,
}

impl DrillController {
    pub fn new(
        search: Arc<dyn SearchEngine>,
        model: Arc<dyn MoveProbabilityModel>,
        opponent: Arc<dyn OpponentService>,
        config: &TrainerConfig,
    ) -> Self {
        let analyzer = BackgroundAnalyzer::new(
            Arc::new(AnalysisCache::new()),
            search,
            model,
            config.analysis_settings(),
        );
        Self::with_analyzer(analyzer, opponent, config.timing(), config.analysis_enabled)
    }

    pub fn with_analyzer(
        analyzer: BackgroundAnalyzer,
        opponent: Arc<dyn OpponentService>,
        timing: DrillTiming,
        analysis_enabled: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SessionState::new(analysis_enabled, 0, analyzer.runtime().clone())),
                evaluator: PerformanceEvaluator::new(analyzer.clone()),
                analyzer,
                opponent,
                timing,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn analyzer(&self) -> &BackgroundAnalyzer {
        &self.inner.analyzer
    }

    // ---- Drill lifecycle ----

    /// Start a new session on the configured drills. Previous drill state is discarded.
    pub fn start_session(&self, config: &DrillConfiguration) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        *state = SessionState::new(state.analysis_enabled, state.epoch + 1, self.inner.analyzer.runtime().clone());

        let drills = config.drills().to_vec();
        if drills.is_empty() {
            warn!("Drill configuration has no selections");
            return false;
        }
        info!(drills = drills.len(), "Session started");
        state.remaining = drills.clone();
        state.drills = drills;
        self.start_drill(state, 0)
    }

    fn start_drill(&self, state: &mut SessionState, index: usize) -> bool {
        let Some(selection) = state.drills.get(index).cloned() else {
            return false;
        };
        let game = match DrillGame::new(selection) {
            Ok(game) => game,
            Err(e) => {
                warn!(drill = index, error = %e, "Could not set up drill");
                return false;
            }
        };

        state.epoch += 1;
        state.report = None;
        state.current_index = Some(index);
        state.phase = if game.is_player_turn_at(game.opening_end) {
            SessionPhase::PlayerToMove
        } else {
            SessionPhase::AwaitingOpponentOpening
        };
        info!(game_id = %game.id, drill = index, phase = ?state.phase, "Drill started");

        if state.analysis_enabled {
            self.request_analysis(&game, game.opening_end);
        }
        state.game = Some(game);
        self.sync_timers(state);
        true
    }

    /// Evaluate the live drill and show its report.
    ///
    /// Re-completing a drill replaces the earlier record for the same selection.
    pub async fn complete_drill(&self) -> bool {
        let (game, final_node, epoch) = {
            let mut state = self.lock();
            if !state.phase.is_live() {
                return false;
            }
            let Some(game) = state.game.clone() else {
                return false;
            };
            state.timers.cancel(TimerKind::Completion);
            let final_node = game.final_node();
            (game, final_node, state.epoch)
        };

        let performance = self.inner.evaluator.evaluate(&game, final_node).await;

        let mut guard = self.lock();
        let state = &mut *guard;
        let same_game = state.game.as_ref().is_some_and(|g| g.id == game.id);
        if state.epoch != epoch || !same_game {
            debug!(game_id = %game.id, "Discarding report for a superseded drill");
            return false;
        }

        info!(
            game_id = %game.id,
            accuracy = performance.accuracy,
            source = ?performance.source,
            "Drill completed"
        );
        let record = CompletedDrill::from_game(&game, performance.clone());
        match state
            .completed
            .iter_mut()
            .find(|c| c.selection.id == record.selection.id)
        {
            Some(existing) => *existing = record,
            None => state.completed.push(record),
        }

        state.report = Some(performance);
        state.phase = SessionPhase::DrillComplete;
        state.epoch += 1;
        self.sync_timers(state);
        true
    }

    /// Dismiss the report and start the next queued drill, if any.
    pub fn move_to_next_drill(&self) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        if matches!(state.phase, SessionPhase::Uninitialized | SessionPhase::AllDrillsComplete) {
            return false;
        }

        state.report = None;
        if let Some(current) = state.current_index.and_then(|i| state.drills.get(i)) {
            let id = current.id.clone();
            state.remaining.retain(|s| s.id != id);
        }

        let next = state
            .remaining
            .first()
            .and_then(|next| state.drills.iter().position(|s| s.id == next.id));
        match next {
            Some(index) => self.start_drill(state, index),
            None => {
                info!(completed = state.completed.len(), "All drills complete");
                state.phase = SessionPhase::AllDrillsComplete;
                state.epoch += 1;
                self.sync_timers(state);
                true
            }
        }
    }

    /// Resume play on the current position with the completion gate lifted.
    ///
    /// A drill completed before the opponent's first move resumes with that
    /// move pending.
    pub fn continue_analyzing(&self) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        if !matches!(state.phase, SessionPhase::DrillComplete | SessionPhase::AllDrillsComplete) {
            return false;
        }
        let Some(game) = state.game.as_ref() else {
            return false;
        };

        let awaiting_opponent = !game.is_player_turn() && game.is_in_drill(game.cursor);
        if state.analysis_enabled {
            self.request_analysis(game, game.cursor);
        }
        info!(game_id = %game.id, "Continuing analysis");

        state.phase = SessionPhase::ContinueAnalyzing { awaiting_opponent };
        state.report = None;
        state.epoch += 1;
        self.sync_timers(state);
        true
    }

    /// Rebuild a completed drill for further play.
    ///
    /// The opponent never moves on its own right after a load, even when
    /// the recorded game ended on its turn.
    pub fn load_completed_drill(&self, selection_id: &str) -> bool {
        let mut guard = self.lock();
        self.load_locked(&mut guard, selection_id)
    }

    fn load_locked(&self, state: &mut SessionState, selection_id: &str) -> bool {
        let Some(record) = state.completed.iter().find(|c| c.selection.id == selection_id) else {
            debug!(selection_id, "No completed drill to load");
            return false;
        };
        let game = match DrillGame::replay(record) {
            Ok(game) => game,
            Err(e) => {
                warn!(selection_id, error = %e, "Could not rebuild completed drill");
                return false;
            }
        };

        info!(game_id = %game.id, moves = game.moves.len(), "Completed drill loaded");
        state.timers.cancel_all();
        state.current_index = state.drills.iter().position(|s| s.id == selection_id);
        state.phase = SessionPhase::ContinueAnalyzing {
            awaiting_opponent: !game.is_player_turn(),
        };
        state.report = None;
        state.epoch += 1;
        state.game = Some(game);
        true
    }

    /// Jump to drill `index`: replay it if completed, otherwise start it fresh
    /// and make it the head of the queue.
    pub fn navigate_to_drill(&self, index: usize) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(selection) = state.drills.get(index) else {
            debug!(index, "Drill index out of range");
            return false;
        };
        let selection_id = selection.id.clone();

        if state.completed.iter().any(|c| c.selection.id == selection_id) {
            return self.load_locked(state, &selection_id);
        }
        state.remaining = state.drills[index..].to_vec();
        self.start_drill(state, index)
    }

    /// Drop all drills, records and cached analysis.
    pub fn reset_session(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        *state = SessionState::new(state.analysis_enabled, state.epoch + 1, self.inner.analyzer.runtime().clone());
        self.inner.analyzer.cache().clear();
        info!("Session reset");
    }

    // ---- Moves ----

    /// Play `token` for the player. Returns `false`, changing nothing, when
    /// the move is illegal or it is not the player's turn.
    pub fn make_player_move(&self, token: &str) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let phase = state.phase;
        let Some(game) = state.game.as_mut() else {
            return false;
        };
        if !phase.is_live() || !game.is_player_turn() || !game.is_in_drill(game.cursor) {
            debug!(token, phase = ?phase, "Move rejected: not the player's turn");
            return false;
        }

        let node = match game.play(token) {
            Ok(node) => node,
            Err(e) => {
                debug!(token, error = %e, "Move rejected");
                return false;
            }
        };
        let complete_after = game.target_reached() && !phase.is_continue();
        let game_id = game.id.clone();
        debug!(game_id = %game_id, token, player_moves = game.player_move_count, "Player moved");

        state.phase = if phase.is_continue() {
            SessionPhase::ContinueAnalyzing { awaiting_opponent: true }
        } else {
            SessionPhase::AwaitingOpponentReply
        };
        self.after_move(state, node);

        if complete_after {
            let key = TimerKey {
                kind: TimerKind::Completion,
                epoch: state.epoch,
                game_id,
                node: None,
            };
            self.arm(state, key, self.inner.timing.completion_delay);
        }
        true
    }

    /// Ask the opponent service for a move at the cursor and play it.
    ///
    /// The request runs without the session lock. The reply is dropped if the
    /// game or cursor changed while it was outstanding.
    pub async fn make_opponent_move(&self) -> bool {
        let (request, game_id, cursor) = {
            let state = self.lock();
            let Some(game) = state.game.as_ref() else {
                return false;
            };
            if !state.phase.is_live() || game.is_player_turn() || !game.is_in_drill(game.cursor) {
                return false;
            }
            let Some(fen) = game.cursor_fen() else {
                return false;
            };
            let request = OpponentMoveRequest {
                history: game.history(game.cursor),
                strength: game.selection.opponent_strength.clone(),
                fen: fen.to_string(),
                initial_clock_secs: OPPONENT_CLOCK_SECS,
                increment_secs: OPPONENT_INCREMENT_SECS,
            };
            (request, game.id.clone(), game.cursor)
        };

        let proposed = match self.inner.opponent.request_move(&request).await {
            Ok(Some(uci)) => uci,
            Ok(None) => {
                debug!(game_id = %game_id, "Opponent had no move");
                return false;
            }
            Err(e) => {
                warn!(game_id = %game_id, error = %e, "Opponent move request failed");
                return false;
            }
        };

        let mut guard = self.lock();
        let state = &mut *guard;
        let phase = state.phase;
        let Some(game) = state.game.as_mut() else {
            return false;
        };
        if game.id != game_id || game.cursor != cursor || !phase.is_live() {
            debug!(game_id = %game_id, uci = %proposed, "Discarding stale opponent move");
            return false;
        }

        let node = match game.play(&proposed) {
            Ok(node) => node,
            Err(e) => {
                warn!(game_id = %game_id, uci = %proposed, error = %e, "Opponent proposed an unplayable move");
                return false;
            }
        };
        debug!(game_id = %game_id, uci = %proposed, "Opponent moved");

        state.phase = if phase.is_continue() {
            SessionPhase::ContinueAnalyzing { awaiting_opponent: false }
        } else {
            SessionPhase::PlayerToMove
        };
        self.after_move(state, node);
        true
    }

    fn after_move(&self, state: &mut SessionState, node: NodeId) {
        if let Some(game) = state.game.as_ref() {
            if state.analysis_enabled {
                self.request_analysis(game, node);
            }
            if state.phase.is_continue() {
                if let Some(record) = state
                    .completed
                    .iter_mut()
                    .find(|c| c.selection.id == game.selection.id)
                {
                    record.refresh_from(game);
                }
            }
        }
        self.sync_timers(state);
    }

    fn request_analysis(&self, game: &DrillGame, node: NodeId) {
        if let Some(fen) = game.fen(node) {
            self.inner.analyzer.spawn_analysis(fen, game.describe(node));
        }
    }

    // ---- Navigation ----

    pub fn goto_node(&self, node: NodeId) -> bool {
        self.navigate(|_| Some(node))
    }

    /// Follow the main continuation.
    pub fn go_next(&self) -> bool {
        self.navigate(|game| game.tree.get(game.cursor)?.main_child)
    }

    pub fn go_previous(&self) -> bool {
        self.navigate(|game| game.tree.get(game.cursor)?.parent)
    }

    pub fn go_root(&self) -> bool {
        self.navigate(|game| Some(game.tree.root()))
    }

    fn navigate(&self, pick: impl FnOnce(&DrillGame) -> Option<NodeId>) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(game) = state.game.as_mut() else {
            return false;
        };
        let Some(target) = pick(game).filter(|id| game.tree.contains(*id)) else {
            return false;
        };
        game.cursor = target;
        self.sync_timers(state);
        true
    }

    // ---- Timers ----

    /// Drop timers that no longer match the state and arm the opponent timer
    /// the current phase calls for.
    fn sync_timers(&self, state: &mut SessionState) {
        let Some(game) = state.game.as_ref() else {
            state.timers.cancel_all();
            return;
        };
        let epoch = state.epoch;
        let cursor = game.cursor;
        state.timers.retain(|key| key.matches(epoch, &game.id, cursor));

        let kind = match state.phase {
            SessionPhase::AwaitingOpponentOpening if cursor == game.opening_end => TimerKind::OpponentOpening,
            SessionPhase::ContinueAnalyzing { awaiting_opponent: true }
                if cursor == game.opening_end && !game.is_replay() && !game.is_player_turn() =>
            {
                TimerKind::OpponentOpening
            }
            phase
                if phase.awaiting_opponent()
                    && !game.moves.is_empty()
                    && cursor != game.opening_end
                    && game.is_in_drill(cursor)
                    && !game.is_player_turn() =>
            {
                TimerKind::OpponentReply
            }
            _ => return,
        };

        let key = TimerKey {
            kind,
            epoch,
            game_id: game.id.clone(),
            node: Some(cursor),
        };
        self.arm(state, key, self.inner.timing.opponent_delay);
    }

    fn arm(&self, state: &mut SessionState, key: TimerKey, delay: std::time::Duration) {
        let fire = self.on_timer(key.clone());
        state.timers.schedule(key, delay, fire);
    }

    fn on_timer(&self, key: TimerKey) -> BoxFuture<'static, ()> {
        let controller = self.clone();
        async move {
            let proceed = {
                let mut state = controller.lock();
                let claimed = state.timers.claim(&key);
                let epoch = state.epoch;
                let current = state
                    .game
                    .as_ref()
                    .is_some_and(|g| key.matches(epoch, &g.id, g.cursor));
                let phase_ok = match key.kind {
                    TimerKind::OpponentOpening | TimerKind::OpponentReply => state.phase.awaiting_opponent(),
                    TimerKind::Completion => state.phase.is_live() && !state.phase.is_continue(),
                };
                claimed && current && phase_ok
            };
            if !proceed {
                debug!(kind = ?key.kind, "Timer fired on stale state");
                return;
            }

            match key.kind {
                TimerKind::OpponentOpening | TimerKind::OpponentReply => {
                    controller.make_opponent_move().await;
                }
                TimerKind::Completion => {
                    controller.complete_drill().await;
                }
            }
        }
        .boxed()
    }

    // ---- Queries and settings ----

    pub fn set_analysis_enabled(&self, enabled: bool) {
        let mut state = self.lock();
        state.analysis_enabled = enabled;
        if enabled {
            if let Some(game) = state.game.as_ref() {
                self.request_analysis(game, game.cursor);
            }
        }
        info!(enabled, "Background analysis toggled");
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock().phase
    }

    pub fn with_game<R>(&self, f: impl FnOnce(&DrillGame) -> R) -> Option<R> {
        self.lock().game.as_ref().map(f)
    }

    pub fn tree_json(&self) -> Option<JsonValue> {
        self.with_game(|game| game.tree.to_json())
    }

    pub fn completed_drills(&self) -> Vec<CompletedDrill> {
        self.lock().completed.clone()
    }

    pub fn session_summary(&self) -> SessionSummary {
        SessionSummary::from_completed(&self.lock().completed)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        let game = state.game.as_ref();
        let may_move = game.is_some_and(|g| {
            state.phase.is_live() && g.is_player_turn() && g.is_in_drill(g.cursor)
        });
        let legal_moves = game
            .filter(|_| may_move)
            .and_then(|g| g.cursor_fen())
            .and_then(|fen| rules::legal_move_map(fen).ok())
            .unwrap_or_default();

        SessionSnapshot {
            phase: state.phase,
            drill_index: state.current_index,
            current_drill: game.map(|g| g.selection.clone()),
            remaining_drills: state.remaining.iter().map(|s| s.id.clone()).collect(),
            completed_drills: state.completed.iter().map(|c| c.selection.id.clone()).collect(),
            game_id: game.map(|g| g.id.clone()),
            is_replay: game.is_some_and(DrillGame::is_replay),
            cursor: game.map(|g| g.cursor.index()),
            cursor_fen: game.and_then(|g| g.cursor_fen()).map(str::to_string),
            is_player_turn: game.is_some_and(DrillGame::is_player_turn),
            main_line: game.map(DrillGame::main_line_san).unwrap_or_default(),
            opening_plies: game
                .and_then(|g| g.tree.get(g.opening_end))
                .map(|n| n.ply)
                .unwrap_or_default(),
            legal_moves,
            player_move_count: game.map(|g| g.player_move_count).unwrap_or_default(),
            target_move_number: game.map(|g| g.selection.target_move_number),
            analysis_enabled: state.analysis_enabled,
            analysis: self.inner.analyzer.cache().progress(),
            show_performance: state.phase == SessionPhase::DrillComplete,
            show_summary: state.phase == SessionPhase::AllDrillsComplete,
            report: state.report.clone(),
        }
    }
}
