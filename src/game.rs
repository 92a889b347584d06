use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Grid dimension bounds
pub const MIN_GRID_DIM: usize = 2;
pub const MAX_GRID_DIM: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Player {
    First,
    Second,
}

impl Player {
    pub fn opponent(&self) -> Player {
        match self {
            Player::First => Player::Second,
            Player::Second => Player::First,
        }
    }

    /// Index into `[usize; 2]` score arrays
    pub fn index(&self) -> usize {
        match self {
            Player::First => 0,
            Player::Second => 1,
        }
    }
}

/// Contents of a single grid cell. A cell leaves `Empty` at most once and
/// never returns to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cell {
    Empty,
    CrossedOut,
    Guess { player: Player, value: usize },
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Empty => write!(f, "   "),
            Cell::CrossedOut => write!(f, " X "),
            Cell::Guess { player, value } => write!(f, "{} {}", player.index(), value),
        }
    }
}

/// One placement: a cell value at a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Action {
    pub row: usize,
    pub col: usize,
    pub cell: Cell,
}

#[derive(Debug, Error)]
pub enum GameError {
    #[error(
        "invalid grid dimensions {nrows}x{ncols} (each side must be {MIN_GRID_DIM}..={MAX_GRID_DIM})"
    )]
    InvalidDimensions { nrows: usize, ncols: usize },
}

/// A rejected placement. Recoverable: the game state is never altered by a
/// rejected move.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IllegalMove {
    #[error("position ({row}, {col}) is outside the {nrows}x{ncols} grid")]
    OutOfBounds {
        row: usize,
        col: usize,
        nrows: usize,
        ncols: usize,
    },
    #[error("cell ({row}, {col}) is already filled")]
    Occupied { row: usize, col: usize },
    #[error("cannot place an empty cell")]
    EmptyPlacement,
    #[error("cannot place a guess for the opponent")]
    WrongPlayer,
    #[error("guess value must be at least 1")]
    ZeroGuess,
    #[error("guess {value} exceeds the longer grid side ({max})")]
    GuessTooLarge { value: usize, max: usize },
    #[error("guess {value} already appears in the same row or column at ({row}, {col})")]
    DuplicateInLine {
        row: usize,
        col: usize,
        value: usize,
    },
}

/// The tally grid game. Players alternate filling one unfilled cell per turn
/// with either a cross-out or a guess; a guess scores its value for its owner
/// when, once its row (or column) is complete, the value equals the number of
/// guesses in that line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GameState {
    cells: Vec<Cell>,
    nrows: usize,
    ncols: usize,
    active: Player,
}

impl GameState {
    pub fn new(nrows: usize, ncols: usize) -> Result<Self, GameError> {
        let valid = (MIN_GRID_DIM..=MAX_GRID_DIM).contains(&nrows)
            && (MIN_GRID_DIM..=MAX_GRID_DIM).contains(&ncols);
        if !valid {
            return Err(GameError::InvalidDimensions { nrows, ncols });
        }
        Ok(GameState {
            cells: vec![Cell::Empty; nrows * ncols],
            nrows,
            ncols,
            active: Player::First,
        })
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn active_player(&self) -> Player {
        self.active
    }

    /// Largest legal guess value
    pub fn max_guess(&self) -> usize {
        self.nrows.max(self.ncols)
    }

    pub fn cell(&self, row: usize, col: usize) -> Cell {
        self.cells[row * self.ncols + col]
    }

    fn set_cell(&mut self, row: usize, col: usize, cell: Cell) {
        self.cells[row * self.ncols + col] = cell;
    }

    fn positions(&self) -> impl Iterator<Item = (usize, usize)> {
        let (nrows, ncols) = (self.nrows, self.ncols);
        (0..nrows).flat_map(move |row| (0..ncols).map(move |col| (row, col)))
    }

    pub fn is_finished(&self) -> bool {
        self.cells.iter().all(|cell| *cell != Cell::Empty)
    }

    pub fn empty_cells(&self) -> usize {
        self.cells.iter().filter(|cell| **cell == Cell::Empty).count()
    }

    /// Check a placement against the rules without applying it
    pub fn check_move(&self, row: usize, col: usize, cell: Cell) -> Result<(), IllegalMove> {
        if row >= self.nrows || col >= self.ncols {
            return Err(IllegalMove::OutOfBounds {
                row,
                col,
                nrows: self.nrows,
                ncols: self.ncols,
            });
        }
        if self.cell(row, col) != Cell::Empty {
            return Err(IllegalMove::Occupied { row, col });
        }
        match cell {
            Cell::Empty => Err(IllegalMove::EmptyPlacement),
            Cell::CrossedOut => Ok(()),
            Cell::Guess { player, value } => {
                if player != self.active {
                    return Err(IllegalMove::WrongPlayer);
                }
                if value == 0 {
                    return Err(IllegalMove::ZeroGuess);
                }
                let max = self.max_guess();
                if value > max {
                    return Err(IllegalMove::GuessTooLarge { value, max });
                }
                for (r, c) in self.positions() {
                    if r != row && c != col {
                        continue;
                    }
                    if let Cell::Guess { value: other, .. } = self.cell(r, c) {
                        if other == value {
                            return Err(IllegalMove::DuplicateInLine { row: r, col: c, value });
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Every placement the active player may make in the current position
    pub fn legal_actions(&self) -> impl Iterator<Item = Action> + '_ {
        let max_guess = self.max_guess();
        self.positions()
            .filter(move |&(row, col)| self.cell(row, col) == Cell::Empty)
            .flat_map(move |(row, col)| {
                std::iter::once(Cell::CrossedOut)
                    .chain((1..=max_guess).map(move |value| Cell::Guess {
                        player: self.active,
                        value,
                    }))
                    .filter(move |&cell| self.check_move(row, col, cell).is_ok())
                    .map(move |cell| Action { row, col, cell })
            })
    }

    /// Apply a placement. Turn passes to the opponent; after a guess, unfilled
    /// cells in the same row or column that can no longer host any guess are
    /// crossed out automatically.
    pub fn place(&mut self, row: usize, col: usize, cell: Cell) -> Result<(), IllegalMove> {
        self.check_move(row, col, cell)?;
        self.set_cell(row, col, cell);
        self.active = self.active.opponent();
        if let Cell::Guess { .. } = cell {
            self.cross_out_dead_cells(row, col);
        }
        Ok(())
    }

    fn cross_out_dead_cells(&mut self, row: usize, col: usize) {
        let max_guess = self.max_guess();
        let dead: Vec<(usize, usize)> = self
            .positions()
            .filter(|&(r, c)| (r == row || c == col) && self.cell(r, c) == Cell::Empty)
            .filter(|&(r, c)| {
                (1..=max_guess).all(|value| {
                    let probe = Cell::Guess {
                        player: self.active,
                        value,
                    };
                    self.check_move(r, c, probe).is_err()
                })
            })
            .collect();
        for (r, c) in dead {
            self.set_cell(r, c, Cell::CrossedOut);
        }
    }

    /// Score both players: for each complete row and column, every guess whose
    /// value equals the number of guesses in that line scores its value.
    pub fn scores(&self) -> [usize; 2] {
        let mut scores = [0, 0];
        for row in 0..self.nrows {
            self.score_line((0..self.ncols).map(|col| self.cell(row, col)), &mut scores);
        }
        for col in 0..self.ncols {
            self.score_line((0..self.nrows).map(|row| self.cell(row, col)), &mut scores);
        }
        scores
    }

    fn score_line(&self, line: impl Iterator<Item = Cell> + Clone, scores: &mut [usize; 2]) {
        let mut tally = 0;
        for cell in line.clone() {
            match cell {
                // incomplete lines never score
                Cell::Empty => return,
                Cell::Guess { .. } => tally += 1,
                Cell::CrossedOut => {}
            }
        }
        for cell in line {
            if let Cell::Guess { player, value } = cell {
                if value == tally {
                    scores[player.index()] += value;
                }
            }
        }
    }
}

impl fmt::Display for GameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in 0..self.nrows {
            write!(f, "|")?;
            for col in 0..self.ncols {
                write!(f, "{}|", self.cell(row, col))?;
            }
            writeln!(f)?;
        }
        let scores = self.scores();
        writeln!(f, "Scores: {}, {}", scores[0], scores[1])?;
        if self.is_finished() {
            match scores[0].cmp(&scores[1]) {
                std::cmp::Ordering::Greater => write!(f, "Player 0 wins."),
                std::cmp::Ordering::Less => write!(f, "Player 1 wins."),
                std::cmp::Ordering::Equal => write!(f, "Draw!"),
            }
        } else {
            write!(f, "Player {} to move.", self.active.index())
        }
    }
}
