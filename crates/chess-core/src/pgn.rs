//! Opening seeder: replays an opening's move text into a position tree.
//!
//! The tokenizer is deliberately forgiving. Headers, comments, variations,
//! NAGs, move numbers and results are stripped before replay.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::rules;
use crate::tree::{NodeId, PositionTree};

static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[[^\]]*\]").expect("valid regex"));
static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{[^}]*\}").expect("valid regex"));
static VARIATION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\([^()]*\)").expect("valid regex"));
static MOVE_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+\.(\.\.)?").expect("valid regex"));

fn is_noise(token: &str) -> bool {
    token.starts_with('$') || matches!(token, "1-0" | "0-1" | "1/2-1/2" | "*")
}

/// Castling written with zeros, as hand-typed PGN often does.
fn normalize_castling(token: String) -> String {
    if let Some(rest) = token.strip_prefix("0-0-0") {
        format!("O-O-O{rest}")
    } else if let Some(rest) = token.strip_prefix("0-0") {
        format!("O-O{rest}")
    } else {
        token
    }
}

/// Split opening text into bare move tokens.
pub fn move_tokens(move_text: &str) -> Vec<String> {
    let no_headers = HEADER_RE.replace_all(move_text, " ");
    let no_comments = COMMENT_RE.replace_all(&no_headers, " ");

    // Nested variations collapse from the inside out.
    let mut text = no_comments.into_owned();
    while VARIATION_RE.is_match(&text) {
        text = VARIATION_RE.replace_all(&text, " ").into_owned();
    }

    // Results first, so "1-0" is not half-eaten as a move number.
    text.split_whitespace()
        .filter(|token| !is_noise(token))
        .map(|token| MOVE_NUMBER_RE.replace_all(token, "").into_owned())
        .filter(|token| !token.is_empty())
        .map(normalize_castling)
        .collect()
}

/// Replay `move_text` from the tree root and return the last node reached.
///
/// Stops at the first illegal or unparseable token. Existing children are
/// reused, so seeding the same text twice leaves the tree unchanged.
pub fn seed(move_text: &str, tree: &mut PositionTree) -> NodeId {
    let mut current = tree.root();

    for token in move_tokens(move_text) {
        let Some(fen) = tree.fen(current).map(str::to_string) else {
            break;
        };
        let applied = match rules::apply_move(&fen, &token) {
            Ok(applied) => applied,
            Err(e) => {
                warn!(token = %token, error = %e, "Opening text truncated at unplayable token");
                break;
            }
        };
        match tree.add_main_move(current, &applied.fen, &applied.uci, &applied.san) {
            Some(next) => current = next,
            None => break,
        }
    }

    debug!(ply = tree.get(current).map(|n| n.ply).unwrap_or(0), "Opening seeded");
    current
}
