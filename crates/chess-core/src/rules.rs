//! Move legality and position bookkeeping backed by shakmaty.
//!
//! Positions cross module boundaries as FEN strings; everything that needs a
//! real board goes through [`parse_position`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shakmaty::fen::Fen;
use shakmaty::san::{San, SanPlus};
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Move, Position};

pub const STANDARD_START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error("Invalid FEN {fen}: {reason}")]
    InvalidFen { fen: String, reason: String },

    #[error("Illegal move {token} in {fen}")]
    IllegalMove { token: String, fen: String },
}

/// The side a drill assigns to the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerColor {
    White,
    Black,
}

impl PlayerColor {
    pub fn opposite(self) -> Self {
        match self {
            PlayerColor::White => PlayerColor::Black,
            PlayerColor::Black => PlayerColor::White,
        }
    }
}

impl From<Color> for PlayerColor {
    fn from(color: Color) -> Self {
        match color {
            Color::White => PlayerColor::White,
            Color::Black => PlayerColor::Black,
        }
    }
}

impl From<PlayerColor> for Color {
    fn from(color: PlayerColor) -> Self {
        match color {
            PlayerColor::White => Color::White,
            PlayerColor::Black => Color::Black,
        }
    }
}

/// Outcome of playing one token on a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMove {
    /// Canonical move identifier (UCI).
    pub uci: String,
    /// Human-readable label (SAN).
    pub san: String,
    /// Position after the move.
    pub fen: String,
}

/// A legal move in both notations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegalMove {
    pub uci: String,
    pub san: String,
}

pub fn parse_position(fen: &str) -> Result<Chess, RulesError> {
    let invalid = |reason: String| RulesError::InvalidFen {
        fen: fen.to_string(),
        reason,
    };
    let parsed: Fen = fen.trim().parse().map_err(|e: shakmaty::fen::ParseFenError| invalid(e.to_string()))?;
    parsed
        .into_position::<Chess>(CastlingMode::Standard)
        .map_err(|e| invalid(e.to_string()))
}

pub fn position_fen(pos: &Chess) -> String {
    Fen::from_position(pos, EnPassantMode::Legal).to_string()
}

/// Resolve a UCI or SAN token against a position.
/// Trailing annotation glyphs (`!`, `?`) and check marks are tolerated.
pub fn resolve_move(pos: &Chess, token: &str) -> Option<Move> {
    let cleaned = token.trim().trim_end_matches(['!', '?']);
    if cleaned.is_empty() {
        return None;
    }

    if let Ok(uci) = cleaned.parse::<UciMove>() {
        if let Ok(mv) = uci.to_move(pos) {
            return Some(mv);
        }
    }

    let san: SanPlus = cleaned.parse().ok()?;
    san.san.to_move(pos).ok()
}

pub fn apply_move(fen: &str, token: &str) -> Result<AppliedMove, RulesError> {
    let mut pos = parse_position(fen)?;
    let mv = resolve_move(&pos, token).ok_or_else(|| RulesError::IllegalMove {
        token: token.to_string(),
        fen: fen.to_string(),
    })?;

    let uci = mv.to_uci(CastlingMode::Standard).to_string();
    let san = San::from_move(&pos, mv.clone()).to_string();
    pos.play_unchecked(mv);

    Ok(AppliedMove {
        uci,
        san,
        fen: position_fen(&pos),
    })
}

pub fn legal_moves(fen: &str) -> Result<Vec<LegalMove>, RulesError> {
    let pos = parse_position(fen)?;
    Ok(pos
        .legal_moves()
        .into_iter()
        .map(|mv| LegalMove {
            uci: mv.to_uci(CastlingMode::Standard).to_string(),
            san: San::from_move(&pos, mv.clone()).to_string(),
        })
        .collect())
}

/// Origin square -> reachable destination squares, for board highlighting.
pub fn legal_move_map(fen: &str) -> Result<BTreeMap<String, Vec<String>>, RulesError> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for mv in legal_moves(fen)? {
        if mv.uci.len() < 4 {
            continue;
        }
        let dests = map.entry(mv.uci[..2].to_string()).or_default();
        let dest = mv.uci[2..4].to_string();
        if !dests.contains(&dest) {
            dests.push(dest);
        }
    }
    Ok(map)
}

pub fn side_to_move(fen: &str) -> Result<PlayerColor, RulesError> {
    Ok(parse_position(fen)?.turn().into())
}

/// False for terminal positions and for anything that fails to parse.
pub fn has_legal_moves(fen: &str) -> bool {
    parse_position(fen)
        .map(|pos| !pos.legal_moves().is_empty())
        .unwrap_or(false)
}

pub fn is_checkmate(fen: &str) -> bool {
    parse_position(fen)
        .map(|pos| pos.is_checkmate())
        .unwrap_or(false)
}

/// Cache key for a position: placement, side, castling and en passant.
/// Move clocks are dropped so transpositions share one key.
pub fn fingerprint(fen: &str) -> String {
    fen.split_whitespace().take(4).collect::<Vec<_>>().join(" ")
}
