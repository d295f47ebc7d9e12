//! Chess primitives for the opening drill trainer: a rules adapter over
//! shakmaty, the position tree and the tolerant PGN seeder.

pub mod pgn;
pub mod rules;
pub mod tree;

pub use rules::{AppliedMove, PlayerColor, RulesError, STANDARD_START_FEN};
pub use tree::{NodeId, PositionNode, PositionTree};
