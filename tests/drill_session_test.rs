//! Integration tests: full drill sessions against scripted collaborators.
//!
//! Every test runs on a paused tokio clock, so the opponent delay (1000 ms)
//! and the completion grace period (1500 ms) elapse deterministically.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chess_core::rules;
use chess_core::PlayerColor;
use drill_trainer::evaluator::{heuristic_performance, ReportSource};
use drill_trainer::session::{CompletedDrill, DrillGame};
use drill_trainer::SessionPhase;

use common::*;

// ---------------------------------------------------------------------------
// Turn taking and completion
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_target_reached_completes_after_grace_period() {
    let opponent = ScriptedOpponent::new(&["b8c6"]);
    let controller = quick_controller(opponent.clone());
    assert!(controller.start_session(&configuration(vec![selection("italian", "1. e4 e5", PlayerColor::White, 1)])));
    assert_eq!(controller.phase(), SessionPhase::PlayerToMove);

    assert!(controller.make_player_move("Nf3"));
    assert_eq!(controller.phase(), SessionPhase::AwaitingOpponentReply);

    // Opponent replies at 1000 ms, before the drill closes at 1500 ms
    wait(1100).await;
    assert_eq!(opponent.calls(), 1);
    assert_eq!(controller.phase(), SessionPhase::PlayerToMove);

    wait(1000).await;
    assert_eq!(controller.phase(), SessionPhase::DrillComplete);

    let snapshot = controller.snapshot();
    assert!(snapshot.show_performance);
    assert!(snapshot.legal_moves.is_empty());
    let report = snapshot.report.expect("report shown");
    assert_eq!(report.source, ReportSource::Engines);
    assert_eq!(report.player_moves, 1);
    assert!(report.rating.is_some());

    let completed = controller.completed_drills();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].player_moves, vec!["g1f3"]);
    assert_eq!(completed[0].all_moves, Some(vec!["g1f3".to_string(), "b8c6".to_string()]));
}

#[tokio::test(start_paused = true)]
async fn test_opponent_moves_first_when_opening_ends_on_its_turn() {
    let opponent = ScriptedOpponent::new(&["e7e5"]);
    let controller = quick_controller(opponent.clone());
    controller.start_session(&configuration(vec![selection("kings-pawn", "1. e4", PlayerColor::White, 3)]));
    assert_eq!(controller.phase(), SessionPhase::AwaitingOpponentOpening);
    assert!(!controller.make_player_move("d4"));

    wait(900).await;
    assert_eq!(opponent.calls(), 0);

    wait(200).await;
    assert_eq!(opponent.calls(), 1);
    assert_eq!(controller.phase(), SessionPhase::PlayerToMove);
    assert_eq!(controller.with_game(|g| g.moves.clone()), Some(vec!["e7e5".to_string()]));
    assert_eq!(controller.with_game(|g| g.player_move_count), Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_player_move_count_follows_main_line() {
    let opponent = ScriptedOpponent::new(&["d2d4"]);
    let controller = quick_controller(opponent);
    controller.start_session(&configuration(vec![selection(
        "sicilian",
        "1. e4 c5 2. Nf3",
        PlayerColor::Black,
        10,
    )]));

    assert!(controller.make_player_move("d6"));
    assert_eq!(controller.with_game(|g| g.player_move_count), Some(1));

    wait(1100).await;
    assert!(controller.make_player_move("cxd4"));
    assert_eq!(controller.with_game(|g| g.player_move_count), Some(2));
    assert_eq!(controller.snapshot().player_move_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_moves_change_nothing() {
    let controller = quick_controller(ScriptedOpponent::new(&[]));
    controller.start_session(&configuration(vec![selection("italian", "1. e4 e5", PlayerColor::White, 5)]));
    let before = controller.snapshot();

    assert!(!controller.make_player_move("e7e5"));
    assert!(!controller.make_player_move("not-a-move"));
    let after = controller.snapshot();
    assert_eq!(before.cursor, after.cursor);
    assert_eq!(after.phase, SessionPhase::PlayerToMove);
    assert!(!after.legal_moves.is_empty());

    assert!(controller.make_player_move("Nf3"));
    // Black to move now
    assert!(!controller.make_player_move("Nc3"));
    assert!(controller.snapshot().legal_moves.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_diverging_move_overwrites_history() {
    let controller = quick_controller(ScriptedOpponent::new(&["b8c6"]));
    controller.start_session(&configuration(vec![selection("italian", "1. e4 e5", PlayerColor::White, 5)]));
    assert!(controller.make_player_move("Nf3"));
    wait(1100).await;

    let old_line = controller
        .with_game(|g| g.tree.main_line_after(g.opening_end))
        .unwrap();
    assert_eq!(old_line.len(), 2);

    assert!(controller.go_previous());
    assert!(controller.go_previous());
    assert!(controller.make_player_move("Bc4"));

    controller
        .with_game(|g| {
            assert!(old_line.iter().all(|id| !g.tree.contains(*id)));
            assert_eq!(g.moves, vec!["f1c4"]);
            assert_eq!(g.player_move_count, 1);
        })
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_replaying_an_existing_move_only_navigates() {
    let controller = quick_controller(ScriptedOpponent::new(&["b8c6"]));
    controller.start_session(&configuration(vec![selection("italian", "1. e4 e5", PlayerColor::White, 5)]));
    assert!(controller.make_player_move("Nf3"));
    wait(1100).await;
    let nodes = controller.with_game(|g| g.tree.len()).unwrap();

    assert!(controller.go_previous());
    assert!(controller.go_previous());
    assert!(controller.make_player_move("g1f3"));
    assert_eq!(controller.with_game(|g| g.tree.len()), Some(nodes));
    assert_eq!(controller.with_game(|g| g.moves.len()), Some(2));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_reply_arriving_after_navigation_is_discarded() {
    let opponent = ScriptedOpponent::with_delay(&["b8c6"], Duration::from_millis(500));
    let controller = quick_controller(opponent.clone());
    controller.start_session(&configuration(vec![selection("italian", "1. e4 e5", PlayerColor::White, 5)]));
    assert!(controller.make_player_move("Nf3"));

    // Request goes out at 1000 ms and answers at 1500 ms
    wait(1200).await;
    assert_eq!(opponent.calls(), 1);
    assert!(controller.go_previous());

    wait(1000).await;
    controller
        .with_game(|g| {
            assert_eq!(g.moves, vec!["g1f3"]);
            assert_eq!(g.cursor, g.opening_end);
        })
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reset_cancels_pending_timers() {
    let opponent = ScriptedOpponent::new(&["b8c6"]);
    let controller = quick_controller(opponent.clone());
    controller.start_session(&configuration(vec![selection("italian", "1. e4 e5", PlayerColor::White, 1)]));
    assert!(controller.make_player_move("Nf3"));

    controller.reset_session();
    assert!(controller.analyzer().cache().is_empty());
    assert_eq!(controller.phase(), SessionPhase::Uninitialized);

    wait(3000).await;
    assert_eq!(opponent.calls(), 0);
    assert_eq!(controller.phase(), SessionPhase::Uninitialized);
    assert!(controller.completed_drills().is_empty());
    assert!(controller.snapshot().game_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_opponent_failure_leaves_session_usable() {
    let controller = quick_controller(Arc::new(FailingOpponent));
    controller.start_session(&configuration(vec![selection("italian", "1. e4 e5", PlayerColor::White, 5)]));
    assert!(controller.make_player_move("Nf3"));

    wait(2000).await;
    assert_eq!(controller.phase(), SessionPhase::AwaitingOpponentReply);
    assert!(controller.complete_drill().await);
    assert_eq!(controller.phase(), SessionPhase::DrillComplete);
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_failing_engines_fall_back_to_heuristic() {
    let controller = controller(
        Arc::new(FailingSearch),
        Arc::new(FailingModel),
        ScriptedOpponent::new(&["b8c6"]),
    );
    controller.start_session(&configuration(vec![selection("italian", "1. e4 e5", PlayerColor::White, 5)]));
    assert!(controller.make_player_move("Nf3"));
    wait(1100).await;
    assert!(controller.make_player_move("Bc4"));

    assert!(controller.complete_drill().await);
    let report = controller.snapshot().report.expect("report shown");
    assert_eq!(report.source, ReportSource::Heuristic);
    assert!((0.0..=100.0).contains(&report.accuracy));
    assert!(!report.feedback.is_empty());
    assert_eq!(report.player_moves, 2);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_model_still_yields_report() {
    let controller = controller(Arc::new(FailingSearch), Arc::new(SilentModel), ScriptedOpponent::new(&[]));
    controller.start_session(&configuration(vec![selection("italian", "1. e4 e5", PlayerColor::White, 5)]));
    assert!(controller.make_player_move("Nf3"));

    let completed = tokio::time::timeout(Duration::from_secs(60), controller.complete_drill()).await;
    assert_eq!(completed.ok(), Some(true));
    assert_eq!(controller.phase(), SessionPhase::DrillComplete);
    let report = controller.snapshot().report.expect("report shown");
    assert_eq!(report.source, ReportSource::Heuristic);
    assert_eq!(report.player_moves, 1);
}

#[tokio::test(start_paused = true)]
async fn test_recompleting_replaces_record() {
    let controller = quick_controller(ScriptedOpponent::new(&["b8c6"]));
    controller.start_session(&configuration(vec![selection("italian", "1. e4 e5", PlayerColor::White, 5)]));
    assert!(controller.make_player_move("Nf3"));
    assert!(controller.complete_drill().await);

    assert!(controller.continue_analyzing());
    wait(1100).await;
    assert!(controller.make_player_move("Bc4"));
    assert!(controller.complete_drill().await);

    let completed = controller.completed_drills();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].player_moves, vec!["g1f3", "f1c4"]);
}

// ---------------------------------------------------------------------------
// Continue analyzing and replay
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_continue_analyzing_lifts_completion_gate() {
    let controller = quick_controller(ScriptedOpponent::new(&["b8c6", "a7a6"]));
    controller.start_session(&configuration(vec![selection("ruy-lopez", "1. e4 e5", PlayerColor::White, 1)]));
    assert!(controller.make_player_move("Nf3"));
    wait(2000).await;
    assert_eq!(controller.phase(), SessionPhase::DrillComplete);

    assert!(controller.continue_analyzing());
    assert_eq!(controller.phase(), SessionPhase::ContinueAnalyzing { awaiting_opponent: false });
    assert!(controller.make_player_move("Bb5"));
    assert_eq!(controller.phase(), SessionPhase::ContinueAnalyzing { awaiting_opponent: true });

    wait(5000).await;
    assert_eq!(controller.phase(), SessionPhase::ContinueAnalyzing { awaiting_opponent: false });
    let completed = controller.completed_drills();
    assert_eq!(completed.len(), 1);
    assert_eq!(
        completed[0].all_moves.as_deref(),
        Some(&["g1f3".to_string(), "b8c6".to_string(), "f1b5".to_string(), "a7a6".to_string()][..])
    );
}

#[tokio::test(start_paused = true)]
async fn test_overwrite_in_continue_mode_rederives_record() {
    let controller = quick_controller(ScriptedOpponent::new(&[]));
    controller.start_session(&configuration(vec![selection("italian", "1. e4 e5", PlayerColor::White, 5)]));
    assert!(controller.make_player_move("Nf3"));
    assert!(controller.complete_drill().await);

    assert!(controller.continue_analyzing());
    assert!(controller.go_previous());
    assert!(controller.make_player_move("d4"));

    let record = controller.completed_drills().remove(0);
    assert_eq!(record.player_moves, vec!["d2d4"]);
    assert_eq!(record.all_moves, Some(vec!["d2d4".to_string()]));
    assert!(!record.good_moves.iter().any(|san| san == "Nf3"));
    assert!(!record.blunders.iter().any(|san| san == "Nf3"));
    assert_eq!(record.performance.final_fen, record.final_fen);
    assert_eq!(record.performance.player_moves, 1);
    assert!(record.performance.moves.iter().all(|m| m.uci == "d2d4"));
    assert_eq!(record.good_moves, record.performance.good_moves);

    let summary = controller.session_summary();
    assert_eq!(summary.total_player_moves, 1);
    assert_eq!(summary.good_moves + summary.blunders, 0);
}

#[tokio::test(start_paused = true)]
async fn test_continue_before_opponent_opening_resumes_play() {
    let opponent = ScriptedOpponent::new(&["e7e5"]);
    let controller = quick_controller(opponent.clone());
    controller.start_session(&configuration(vec![selection("kings-pawn", "1. e4", PlayerColor::White, 3)]));
    assert!(controller.complete_drill().await);
    assert_eq!(opponent.calls(), 0);

    assert!(controller.continue_analyzing());
    assert_eq!(controller.phase(), SessionPhase::ContinueAnalyzing { awaiting_opponent: true });

    wait(1100).await;
    assert_eq!(opponent.calls(), 1);
    assert_eq!(controller.phase(), SessionPhase::ContinueAnalyzing { awaiting_opponent: false });
    assert!(controller.make_player_move("Nf3"));
    assert_eq!(
        controller.completed_drills()[0].all_moves,
        Some(vec!["e7e5".to_string(), "g1f3".to_string()])
    );
}

#[tokio::test(start_paused = true)]
async fn test_load_completed_drill_reconstructs_moves() {
    let controller = quick_controller(ScriptedOpponent::new(&["e7e5"]));
    controller.start_session(&configuration(vec![selection("open", "", PlayerColor::White, 5)]));
    assert!(controller.make_player_move("e2e4"));
    wait(1100).await;
    assert!(controller.complete_drill().await);

    assert!(controller.load_completed_drill("open"));
    assert_eq!(controller.phase(), SessionPhase::ContinueAnalyzing { awaiting_opponent: false });

    let after_e4 = rules::apply_move(chess_core::STANDARD_START_FEN, "e2e4").unwrap();
    let after_e5 = rules::apply_move(&after_e4.fen, "e7e5").unwrap();
    controller
        .with_game(|g| {
            assert!(g.is_replay());
            let line = g.tree.main_line_after(g.opening_end);
            assert_eq!(line.len(), 2);
            let first = g.tree.get(line[0]).unwrap();
            let second = g.tree.get(line[1]).unwrap();
            assert_eq!(first.uci.as_deref(), Some("e2e4"));
            assert_eq!(first.fen, after_e4.fen);
            assert_eq!(second.uci.as_deref(), Some("e7e5"));
            assert_eq!(second.fen, after_e5.fen);
            assert_eq!(g.cursor, line[1]);
        })
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_loaded_replay_waits_for_navigation_before_opponent_moves() {
    let opponent = ScriptedOpponent::new(&["e7e5"]);
    let controller = quick_controller(opponent.clone());
    controller.start_session(&configuration(vec![selection("open", "", PlayerColor::White, 5)]));
    assert!(controller.make_player_move("e2e4"));
    assert!(controller.complete_drill().await);

    assert!(controller.load_completed_drill("open"));
    assert_eq!(controller.phase(), SessionPhase::ContinueAnalyzing { awaiting_opponent: true });
    wait(3000).await;
    assert_eq!(opponent.calls(), 0);

    assert!(controller.go_previous());
    assert!(controller.go_next());
    wait(1100).await;
    assert_eq!(opponent.calls(), 1);
    assert_eq!(controller.phase(), SessionPhase::ContinueAnalyzing { awaiting_opponent: false });
    assert_eq!(controller.completed_drills()[0].all_moves.as_ref().map(Vec::len), Some(2));
}

#[test]
fn test_replay_falls_back_to_player_moves() {
    let mut game = DrillGame::new(selection("kings-pawn", "1. e4", PlayerColor::Black, 3)).unwrap();
    game.play("e7e5").unwrap();
    let performance = heuristic_performance(&game, game.final_node());
    let mut record = CompletedDrill::from_game(&game, performance);
    record.all_moves = None;

    let replayed = DrillGame::replay(&record).unwrap();
    assert!(replayed.is_replay());
    assert_eq!(replayed.moves, vec!["e7e5"]);
    assert_eq!(replayed.cursor_fen(), Some(record.final_fen.as_str()));
}

// ---------------------------------------------------------------------------
// Drill sequencing
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_session_runs_every_drill_then_summarizes() {
    let controller = quick_controller(ScriptedOpponent::new(&["b8c6", "g8f6"]));
    controller.start_session(&configuration(vec![
        selection("italian", "1. e4 e5", PlayerColor::White, 1),
        selection("queens-gambit", "1. d4 d5", PlayerColor::White, 1),
    ]));

    assert!(controller.make_player_move("Nf3"));
    wait(2000).await;
    assert_eq!(controller.phase(), SessionPhase::DrillComplete);

    assert!(controller.move_to_next_drill());
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.drill_index, Some(1));
    assert_eq!(snapshot.remaining_drills, vec!["queens-gambit"]);
    assert!(snapshot.report.is_none());

    assert!(controller.make_player_move("c4"));
    wait(2000).await;
    assert_eq!(controller.phase(), SessionPhase::DrillComplete);

    assert!(controller.move_to_next_drill());
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.phase, SessionPhase::AllDrillsComplete);
    assert!(snapshot.show_summary);

    let summary = controller.session_summary();
    assert_eq!(summary.drills_completed, 2);
    assert_eq!(summary.total_player_moves, 2);
    assert!(summary.rating.is_some());

    assert!(controller.navigate_to_drill(0));
    assert_eq!(controller.with_game(|g| g.is_replay()), Some(true));
    assert!(controller.phase().is_continue());
}

#[tokio::test(start_paused = true)]
async fn test_navigate_to_unplayed_drill_truncates_queue() {
    let controller = quick_controller(ScriptedOpponent::new(&[]));
    controller.start_session(&configuration(vec![
        selection("a", "1. e4", PlayerColor::Black, 2),
        selection("b", "1. d4", PlayerColor::Black, 2),
        selection("c", "1. c4", PlayerColor::Black, 2),
    ]));

    assert!(controller.navigate_to_drill(2));
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.drill_index, Some(2));
    assert_eq!(snapshot.remaining_drills, vec!["c"]);
    assert_eq!(snapshot.current_drill.map(|s| s.id), Some("c".to_string()));

    assert!(!controller.navigate_to_drill(7));
    assert_eq!(controller.snapshot().drill_index, Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_sync_calls_from_a_plain_thread() {
    let controller = quick_controller(ScriptedOpponent::new(&["b8c6"]));
    let remote = controller.clone();
    let accepted = std::thread::spawn(move || {
        remote.start_session(&configuration(vec![selection("italian", "1. e4 e5", PlayerColor::White, 5)]))
            && remote.make_player_move("Nf3")
            && remote.go_previous()
            && remote.go_next()
    })
    .join()
    .expect("caller thread finished");
    assert!(accepted);

    wait(1100).await;
    assert_eq!(controller.phase(), SessionPhase::PlayerToMove);
    assert_eq!(controller.with_game(|g| g.moves.clone()), Some(vec!["g1f3".to_string(), "b8c6".to_string()]));
}
