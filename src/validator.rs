//! Syntactic validation of raw cell input.
//!
//! This layer is deliberately under-constrained: it only decides whether a
//! typed token *looks like* a placement. Range checks and game rules are the
//! engine's job; anything this module lets through that the rules forbid
//! comes back as a recoverable rejection from `Engine::place`.

/// The marker a player types to place a cross-out (value 0)
pub const BLANK_MARKER: &str = "x";

/// Syntactic classification of a raw input token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Empty field: typing in progress, nothing to commit
    Partial,
    /// The blank marker, committing to a cross-out
    Blank,
    /// A digit sequence and its integer value
    Digits(usize),
}

/// Classify a raw token; None means syntactically illegal and the input
/// never reaches the engine.
pub fn classify(raw: &str) -> Option<Token> {
    if raw.is_empty() {
        return Some(Token::Partial);
    }
    if raw.eq_ignore_ascii_case(BLANK_MARKER) {
        return Some(Token::Blank);
    }
    if raw.chars().all(|c| c.is_ascii_digit()) {
        // sequences too long to represent can't be meant seriously
        return raw.parse::<usize>().ok().map(Token::Digits);
    }
    None
}

/// Convert a committed token to a placement value: blank marker to 0, digit
/// sequence to its integer value. None for empty or illegal input, in which
/// case the commit attempt is dropped.
pub fn commit_value(raw: &str) -> Option<usize> {
    match classify(raw)? {
        Token::Partial => None,
        Token::Blank => Some(0),
        Token::Digits(value) => Some(value),
    }
}
