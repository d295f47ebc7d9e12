//! Opening drill trainer.
//!
//! Drives a player through a sequence of opening drills against a
//! human-like opponent, analyzes every reached position in the background
//! and reports on each finished drill.

pub use chess_core;

pub mod analysis;
pub mod analyzer;
pub mod cache;
pub mod config;
pub mod controller;
pub mod engines;
pub mod error;
pub mod evaluator;
pub mod maia;
pub mod session;
pub mod stockfish;
pub mod timers;

pub use controller::{DrillController, SessionPhase, SessionSnapshot};
pub use error::TrainerError;
