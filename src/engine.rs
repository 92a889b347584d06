//! The narrow contract the session controller consumes, plus the in-crate
//! search engine implementing it.
//!
//! The engine is the sole owner of game-legal state. The controller never
//! inspects the rules directly; it queries cells, scores and the active
//! participant, submits placements, and asks for search work one unit at a
//! time. Anything implementing [`Engine`] can stand in for the real thing,
//! which is how the session tests drive the controller with a scripted fake.

use crate::game::{Cell, GameError, GameState, IllegalMove, Player};
use crate::mcts::SearchTree;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Participant {
    Human,
    Agent,
}

/// Render-facing view of one cell. A cross-out carries no owner, whether a
/// participant placed it or the rules crossed the cell out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CellState {
    Empty,
    CrossedOut,
    Guess { owner: Participant, value: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Scores {
    pub human: usize,
    pub agent: usize,
}

/// The engine's current top-ranked candidate move with its accumulated
/// outcome statistics. `value == 0` encodes the cross-out placement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recommendation {
    pub row: usize,
    pub col: usize,
    pub value: usize,
    pub visits: u64,
    pub score: f64,
}

/// Decision-engine contract consumed by the session controller.
pub trait Engine: Send {
    /// Grid dimensions as (nrows, ncols)
    fn dims(&self) -> (usize, usize);

    /// Always defined for in-bounds coordinates
    fn cell(&self, row: usize, col: usize) -> CellState;

    /// Whose turn it is; None once the game is finished
    fn active_participant(&self) -> Option<Participant>;

    fn scores(&self) -> Scores;

    fn is_finished(&self) -> bool;

    /// Apply a placement. A rejection leaves the engine state untouched and
    /// is recoverable at the call site.
    fn place(&mut self, row: usize, col: usize, value: usize) -> Result<(), IllegalMove>;

    /// One unit of search work; safe to call repeatedly in a tight loop.
    fn advance_search(&mut self);

    /// None before any search work has reached the current position, or once
    /// the game is finished.
    fn best_action(&self) -> Option<Recommendation>;
}

/// MCTS-backed engine. Owns the authoritative game position and the search
/// tree; the tree is pruned every time play advances so memory stays bounded
/// for the life of a session.
pub struct MctsEngine {
    root: GameState,
    tree: SearchTree,
    human: Player,
    rng: StdRng,
}

impl MctsEngine {
    pub fn new(
        nrows: usize,
        ncols: usize,
        first_mover: Participant,
    ) -> Result<Self, GameError> {
        Ok(Self::from_parts(
            GameState::new(nrows, ncols)?,
            first_mover,
            StdRng::from_entropy(),
        ))
    }

    /// Deterministic variant for tests
    pub fn with_seed(
        nrows: usize,
        ncols: usize,
        first_mover: Participant,
        seed: u64,
    ) -> Result<Self, GameError> {
        Ok(Self::from_parts(
            GameState::new(nrows, ncols)?,
            first_mover,
            StdRng::seed_from_u64(seed),
        ))
    }

    fn from_parts(root: GameState, first_mover: Participant, rng: StdRng) -> Self {
        // the first mover holds the First seat
        let human = match first_mover {
            Participant::Human => Player::First,
            Participant::Agent => Player::Second,
        };
        MctsEngine {
            root,
            tree: SearchTree::new(),
            human,
            rng,
        }
    }

    fn participant(&self, player: Player) -> Participant {
        if player == self.human {
            Participant::Human
        } else {
            Participant::Agent
        }
    }
}

impl Engine for MctsEngine {
    fn dims(&self) -> (usize, usize) {
        (self.root.nrows(), self.root.ncols())
    }

    fn cell(&self, row: usize, col: usize) -> CellState {
        match self.root.cell(row, col) {
            Cell::Empty => CellState::Empty,
            Cell::CrossedOut => CellState::CrossedOut,
            Cell::Guess { player, value } => CellState::Guess {
                owner: self.participant(player),
                value,
            },
        }
    }

    fn active_participant(&self) -> Option<Participant> {
        if self.root.is_finished() {
            None
        } else {
            Some(self.participant(self.root.active_player()))
        }
    }

    fn scores(&self) -> Scores {
        let scores = self.root.scores();
        Scores {
            human: scores[self.human.index()],
            agent: scores[self.human.opponent().index()],
        }
    }

    fn is_finished(&self) -> bool {
        self.root.is_finished()
    }

    fn place(&mut self, row: usize, col: usize, value: usize) -> Result<(), IllegalMove> {
        let cell = if value == 0 {
            Cell::CrossedOut
        } else {
            Cell::Guess {
                player: self.root.active_player(),
                value,
            }
        };
        let mut next = self.root.clone();
        next.place(row, col, cell)?;
        self.tree.advance_root(&next);
        self.root = next;
        debug!(tree_nodes = self.tree.len(), board = %self.root, "position advanced");
        Ok(())
    }

    fn advance_search(&mut self) {
        self.tree.playout(&self.root, &mut self.rng);
    }

    fn best_action(&self) -> Option<Recommendation> {
        let (action, visits, score) = self.tree.best_action(&self.root)?;
        let value = match action.cell {
            Cell::CrossedOut => 0,
            Cell::Guess { value, .. } => value,
            Cell::Empty => return None,
        };
        Some(Recommendation {
            row: action.row,
            col: action.col,
            value,
            visits,
            score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(first_mover: Participant) -> MctsEngine {
        MctsEngine::with_seed(4, 4, first_mover, 42).unwrap()
    }

    #[test]
    fn test_invalid_dimensions_are_fatal_at_construction() {
        assert!(MctsEngine::new(0, 4, Participant::Human).is_err());
        assert!(MctsEngine::new(4, 100, Participant::Human).is_err());
    }

    #[test]
    fn test_first_mover_is_active() {
        assert_eq!(
            engine(Participant::Human).active_participant(),
            Some(Participant::Human)
        );
        assert_eq!(
            engine(Participant::Agent).active_participant(),
            Some(Participant::Agent)
        );
    }

    #[test]
    fn test_place_guess_records_owner_and_passes_turn() {
        let mut engine = engine(Participant::Human);
        engine.place(0, 0, 3).unwrap();
        assert_eq!(
            engine.cell(0, 0),
            CellState::Guess {
                owner: Participant::Human,
                value: 3
            }
        );
        assert_eq!(engine.active_participant(), Some(Participant::Agent));
    }

    #[test]
    fn test_zero_value_places_a_cross_out() {
        let mut engine = engine(Participant::Human);
        engine.place(1, 2, 0).unwrap();
        assert_eq!(engine.cell(1, 2), CellState::CrossedOut);
    }

    #[test]
    fn test_rejected_place_leaves_state_unchanged() {
        let mut engine = engine(Participant::Human);
        engine.place(0, 0, 3).unwrap();
        let err = engine.place(0, 0, 1);
        assert!(matches!(err, Err(IllegalMove::Occupied { .. })));
        assert_eq!(
            engine.cell(0, 0),
            CellState::Guess {
                owner: Participant::Human,
                value: 3
            }
        );
        assert_eq!(engine.active_participant(), Some(Participant::Agent));
    }

    #[test]
    fn test_best_action_requires_search_work() {
        let mut engine = engine(Participant::Human);
        assert!(engine.best_action().is_none());
        for _ in 0..50 {
            engine.advance_search();
        }
        let rec = engine.best_action().unwrap();
        assert!(rec.visits > 0);
        assert!(rec.value <= 4);
        // the recommendation must be applicable as-is
        engine.place(rec.row, rec.col, rec.value).unwrap();
    }

    #[test]
    fn test_scores_start_level() {
        let engine = engine(Participant::Agent);
        assert_eq!(engine.scores(), Scores { human: 0, agent: 0 });
    }
}
