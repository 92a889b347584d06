//! The interactive session controller.
//!
//! A session owns one engine exclusively and runs as a single tokio task, so
//! everything that touches the engine (input handling, the agent's turn, the
//! background search) is serialized by construction: the guarantee is
//! ordering, not locking. Input events arrive on a command channel; every
//! state-changing operation rebuilds a full [`Snapshot`] from the engine and
//! publishes it on a watch channel for the presentation layer.
//!
//! While the human is thinking, the controller ponders: it periodically
//! spends a small time budget advancing the engine's search statistics so
//! the agent's eventual move is fast and well-informed, and derives a live
//! win-probability estimate from the engine's current recommendation.
//! Pondering halts permanently once the session finishes or the handle is
//! dropped; dropping the handle also drops the engine, releasing it exactly
//! once.

use crate::engine::{CellState, Engine, MctsEngine, Participant, Scores};
use crate::game::GameError;
use crate::validator;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub nrows: usize,
    pub ncols: usize,
    pub first_mover: Participant,
    /// Minimum search effort invested on the agent's turn before it commits
    /// to a move, even if pondering already accumulated statistics.
    pub agent_budget: Duration,
    /// Gap between background search cycles.
    pub ponder_interval: Duration,
    /// Search time per background cycle. Kept strictly shorter than the
    /// interval so the interactive surface stays responsive.
    pub ponder_budget: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            nrows: 5,
            ncols: 5,
            first_mover: Participant::Human,
            agent_budget: Duration::from_millis(400),
            ponder_interval: Duration::from_millis(1000),
            ponder_budget: Duration::from_millis(150),
        }
    }
}

/// Transient typed text for one cell, not yet committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingInput {
    pub row: usize,
    pub col: usize,
    pub text: String,
}

/// The render-facing view of the session at a point in time. Fully derived:
/// rebuilt from the engine after every state-changing operation, never
/// patched in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub nrows: usize,
    pub ncols: usize,
    pub grid: Vec<Vec<CellState>>,
    /// None once the session is finished
    pub active: Option<Participant>,
    pub scores: Scores,
    /// Present only while it is the human's turn and the session is
    /// unfinished; absent rather than misleading otherwise.
    pub win_probability: Option<f64>,
    pub pending: Vec<PendingInput>,
    pub finished: bool,
}

impl Snapshot {
    /// Mount-time default, before the engine exists
    fn unfilled(nrows: usize, ncols: usize) -> Self {
        Snapshot {
            nrows,
            ncols,
            grid: vec![vec![CellState::Empty; ncols]; nrows],
            active: None,
            scores: Scores { human: 0, agent: 0 },
            win_probability: None,
            pending: Vec::new(),
            finished: false,
        }
    }
}

#[derive(Debug)]
enum Command {
    CellChange { row: usize, col: usize, text: String },
    CellBlur { row: usize, col: usize, text: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    AwaitingHuman,
    AgentActing,
    Finished,
}

/// Owning handle to a running session. Dropping it tears the session down:
/// the task drains, pondering halts, and the engine is disposed.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<Snapshot>,
}

impl SessionHandle {
    pub fn spawn(config: SessionConfig) -> Result<Self, GameError> {
        let engine = MctsEngine::new(config.nrows, config.ncols, config.first_mover)?;
        Ok(Self::spawn_with_engine(Box::new(engine), config))
    }

    /// Run the controller against any engine implementation. This is the
    /// seam the session tests use to substitute a scripted fake.
    pub fn spawn_with_engine(engine: Box<dyn Engine>, config: SessionConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snap_tx, snap_rx) = watch::channel(Snapshot::unfilled(config.nrows, config.ncols));
        let session = Session {
            engine,
            config,
            commands: cmd_rx,
            snapshots: snap_tx,
            pending: HashMap::new(),
            should_ponder: true,
            turn: Turn::AwaitingHuman,
            estimate: None,
        };
        tokio::spawn(session.run());
        SessionHandle {
            commands: cmd_tx,
            snapshots: snap_rx,
        }
    }

    /// Per-keystroke input event. Non-blocking; harmless against filled
    /// cells, the agent's turn, or a finished session.
    pub fn cell_change(&self, row: usize, col: usize, text: impl Into<String>) {
        let _ = self.commands.send(Command::CellChange {
            row,
            col,
            text: text.into(),
        });
    }

    /// Commit event for a cell. Non-blocking; the typed text is cleared
    /// whether or not the move is accepted.
    pub fn cell_blur(&self, row: usize, col: usize, text: impl Into<String>) {
        let _ = self.commands.send(Command::CellBlur {
            row,
            col,
            text: text.into(),
        });
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Wait for the next snapshot publication and return it
    pub async fn changed(&mut self) -> Snapshot {
        let _ = self.snapshots.changed().await;
        self.snapshots.borrow_and_update().clone()
    }
}

struct Session {
    engine: Box<dyn Engine>,
    config: SessionConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshots: watch::Sender<Snapshot>,
    pending: HashMap<(usize, usize), String>,
    /// One-way flag: never set back to true once pondering halts
    should_ponder: bool,
    turn: Turn,
    estimate: Option<f64>,
}

impl Session {
    async fn run(mut self) {
        self.rebuild();
        // the agent may hold the first turn
        self.agent_turns().await;

        let mut next_ponder = tokio::time::Instant::now() + self.config.ponder_interval;
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    // handle dropped: teardown
                    None => break,
                },
                _ = tokio::time::sleep_until(next_ponder), if self.should_ponder => {
                    let started = tokio::time::Instant::now();
                    self.ponder_cycle();
                    next_ponder = started + self.config.ponder_interval;
                }
            }
        }
        self.should_ponder = false;
        info!("session torn down, engine disposed");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::CellChange { row, col, text } => self.cell_change(row, col, text),
            Command::CellBlur { row, col, text } => self.cell_blur(row, col, text).await,
        }
    }

    /// Track typed text for an unfilled cell while the human is to move.
    /// Syntactically illegal tokens are refused, keeping the previous text.
    fn cell_change(&mut self, row: usize, col: usize, text: String) {
        let (nrows, ncols) = self.engine.dims();
        let accept = self.turn == Turn::AwaitingHuman
            && row < nrows
            && col < ncols
            && self.engine.cell(row, col) == CellState::Empty
            && validator::classify(&text).is_some();
        if accept {
            if text.is_empty() {
                self.pending.remove(&(row, col));
            } else {
                self.pending.insert((row, col), text);
            }
        }
        self.rebuild();
    }

    /// Commit a cell. The pending text always clears, accepted or not, so
    /// the field returns to reflecting authoritative engine state.
    async fn cell_blur(&mut self, row: usize, col: usize, text: String) {
        self.pending.remove(&(row, col));
        if self.turn != Turn::AwaitingHuman {
            self.rebuild();
            return;
        }
        let Some(value) = validator::commit_value(&text) else {
            self.rebuild();
            return;
        };
        match self.engine.place(row, col, value) {
            Ok(()) => {
                debug!(row, col, value, "human move accepted");
                self.estimate = None;
                self.rebuild();
                self.agent_turns().await;
            }
            Err(err) => {
                debug!(row, col, value, %err, "human move rejected");
                self.rebuild();
            }
        }
    }

    /// The agent's turn: invest at least the configured search budget, then
    /// commit the engine's recommendation. The recommended move is trusted
    /// and not re-validated. An empty recommendation means the engine has
    /// nothing left to play; the session is treated as finished regardless
    /// of the engine's own flag.
    async fn agent_turns(&mut self) {
        while self.turn == Turn::AgentActing {
            // let the just-published snapshot reach the presentation first
            tokio::task::yield_now().await;

            let steps = self.advance_for(self.config.agent_budget);
            match self.engine.best_action() {
                Some(rec) => {
                    debug!(
                        rec.row,
                        rec.col,
                        rec.value,
                        rec.visits,
                        steps,
                        "agent move selected"
                    );
                    if let Err(err) = self.engine.place(rec.row, rec.col, rec.value) {
                        warn!(%err, "engine rejected its own recommendation");
                        self.turn = Turn::Finished;
                        self.halt_pondering("recommendation rejected");
                        self.rebuild();
                        return;
                    }
                    self.estimate = None;
                    self.rebuild();
                }
                None => {
                    debug!(steps, "search produced no recommendation");
                    self.turn = Turn::Finished;
                    self.halt_pondering("no moves available");
                    self.rebuild();
                    return;
                }
            }
        }
    }

    /// One background search cycle. Checks the halt conditions, spends the
    /// ponder budget, then refreshes the win-probability estimate.
    fn ponder_cycle(&mut self) {
        if !self.should_ponder {
            return;
        }
        if self.engine.is_finished() {
            self.halt_pondering("game finished");
            return;
        }
        let steps = self.advance_for(self.config.ponder_budget);
        debug!(steps, "ponder cycle complete");
        self.estimate = self.win_estimate();
        self.rebuild();
    }

    /// Tight search-advancement loop: not a suspension point. Runs at least
    /// one unit of work, then up to the wall-clock budget.
    fn advance_for(&mut self, budget: Duration) -> u64 {
        let deadline = Instant::now() + budget;
        let mut steps = 0u64;
        loop {
            self.engine.advance_search();
            steps += 1;
            if Instant::now() >= deadline {
                return steps;
            }
        }
    }

    /// Rescale the recommendation's mean outcome (in [-1, 1] by the engine's
    /// convention) to a probability. Absent whenever it would be misleading:
    /// no recommendation yet, agent to move, or session finished.
    fn win_estimate(&self) -> Option<f64> {
        if self.engine.is_finished()
            || self.engine.active_participant() != Some(Participant::Human)
        {
            return None;
        }
        let rec = self.engine.best_action()?;
        if rec.visits == 0 {
            return None;
        }
        let mean = rec.score / rec.visits as f64;
        Some(((1.0 + mean) / 2.0).clamp(0.0, 1.0))
    }

    fn halt_pondering(&mut self, reason: &str) {
        if self.should_ponder {
            self.should_ponder = false;
            info!(reason, "background search halted");
        }
    }

    /// Reconstruct the snapshot from the engine and publish it. Also derives
    /// the next turn state; `Finished` is terminal and halts pondering.
    fn rebuild(&mut self) {
        let (nrows, ncols) = self.engine.dims();
        let grid: Vec<Vec<CellState>> = (0..nrows)
            .map(|row| (0..ncols).map(|col| self.engine.cell(row, col)).collect())
            .collect();
        // an exhausted engine finishes the session even if its own flag
        // disagrees, so `Finished` sticks once entered
        let finished = self.engine.is_finished() || self.turn == Turn::Finished;
        let active = if finished {
            None
        } else {
            self.engine.active_participant()
        };

        if self.turn != Turn::Finished {
            self.turn = if finished {
                Turn::Finished
            } else {
                match active {
                    Some(Participant::Agent) => Turn::AgentActing,
                    _ => Turn::AwaitingHuman,
                }
            };
        }
        if self.turn == Turn::Finished {
            self.halt_pondering("game finished");
        }

        let win_probability = if active == Some(Participant::Human) && !finished {
            self.estimate
        } else {
            None
        };

        let mut pending: Vec<PendingInput> = self
            .pending
            .iter()
            .map(|(&(row, col), text)| PendingInput {
                row,
                col,
                text: text.clone(),
            })
            .collect();
        pending.sort_by_key(|input| (input.row, input.col));

        self.snapshots.send_replace(Snapshot {
            nrows,
            ncols,
            grid,
            active,
            scores: self.engine.scores(),
            win_probability,
            pending,
            finished,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Recommendation;
    use crate::game::IllegalMove;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Observable state shared between a test and its scripted engine
    #[derive(Default)]
    struct FakeShared {
        active: Mutex<Option<Participant>>,
        finished: AtomicBool,
        advances: AtomicUsize,
        places: Mutex<Vec<(usize, usize, usize)>>,
        reject_places: AtomicBool,
        best: Mutex<Option<Recommendation>>,
    }

    /// Scripted engine: records every call, returns configured answers, and
    /// hands the turn to the human after any accepted placement so agent
    /// loops terminate.
    struct FakeEngine {
        shared: Arc<FakeShared>,
    }

    impl FakeEngine {
        fn pair(active: Participant) -> (Arc<FakeShared>, Box<dyn Engine>) {
            let shared = Arc::new(FakeShared::default());
            *shared.active.lock().unwrap() = Some(active);
            let engine = FakeEngine {
                shared: Arc::clone(&shared),
            };
            (shared, Box::new(engine))
        }
    }

    impl Engine for FakeEngine {
        fn dims(&self) -> (usize, usize) {
            (4, 4)
        }

        fn cell(&self, _row: usize, _col: usize) -> CellState {
            CellState::Empty
        }

        fn active_participant(&self) -> Option<Participant> {
            if self.is_finished() {
                None
            } else {
                *self.shared.active.lock().unwrap()
            }
        }

        fn scores(&self) -> Scores {
            Scores { human: 0, agent: 0 }
        }

        fn is_finished(&self) -> bool {
            self.shared.finished.load(Ordering::SeqCst)
        }

        fn place(&mut self, row: usize, col: usize, value: usize) -> Result<(), IllegalMove> {
            if self.shared.reject_places.load(Ordering::SeqCst) {
                return Err(IllegalMove::Occupied { row, col });
            }
            self.shared.places.lock().unwrap().push((row, col, value));
            *self.shared.active.lock().unwrap() = Some(Participant::Human);
            Ok(())
        }

        fn advance_search(&mut self) {
            self.shared.advances.fetch_add(1, Ordering::SeqCst);
        }

        fn best_action(&self) -> Option<Recommendation> {
            *self.shared.best.lock().unwrap()
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            nrows: 4,
            ncols: 4,
            first_mover: Participant::Human,
            agent_budget: Duration::from_millis(10),
            ponder_interval: Duration::from_millis(30),
            ponder_budget: Duration::from_millis(5),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    /// Await snapshot publications until `pred` holds, with a bounded number
    /// of attempts
    async fn wait_for(handle: &mut SessionHandle, pred: impl Fn(&Snapshot) -> bool) -> Snapshot {
        let mut snap = handle.snapshot();
        for _ in 0..25 {
            if pred(&snap) {
                return snap;
            }
            snap = handle.changed().await;
        }
        panic!("snapshot never satisfied the predicate: {snap:?}");
    }

    #[tokio::test]
    async fn test_illegal_text_never_reaches_place() {
        let (shared, engine) = FakeEngine::pair(Participant::Human);
        let handle = SessionHandle::spawn_with_engine(engine, test_config());

        for text in ["abc", "1a", "", "-3", "x9"] {
            handle.cell_blur(0, 0, text);
        }
        settle().await;
        assert!(shared.places.lock().unwrap().is_empty());

        handle.cell_blur(0, 0, "3");
        settle().await;
        assert_eq!(*shared.places.lock().unwrap(), vec![(0, 0, 3)]);
    }

    #[tokio::test]
    async fn test_blank_marker_commits_zero() {
        let (shared, engine) = FakeEngine::pair(Participant::Human);
        let handle = SessionHandle::spawn_with_engine(engine, test_config());

        handle.cell_blur(2, 1, "x");
        settle().await;
        assert_eq!(*shared.places.lock().unwrap(), vec![(2, 1, 0)]);
    }

    #[tokio::test]
    async fn test_rejected_move_is_a_no_op() {
        let (shared, engine) = FakeEngine::pair(Participant::Human);
        shared.reject_places.store(true, Ordering::SeqCst);
        let mut handle = SessionHandle::spawn_with_engine(engine, test_config());

        let before = handle.changed().await;
        handle.cell_blur(1, 1, "2");
        let after = handle.changed().await;

        assert_eq!(before.grid, after.grid);
        assert_eq!(before.scores, after.scores);
        assert_eq!(before.active, after.active);
        assert!(after.pending.is_empty());
    }

    #[tokio::test]
    async fn test_pending_text_tracks_legal_tokens_only() {
        let (_shared, engine) = FakeEngine::pair(Participant::Human);
        let mut handle = SessionHandle::spawn_with_engine(engine, test_config());

        handle.cell_change(0, 1, "3");
        let snap = wait_for(&mut handle, |snap| !snap.pending.is_empty()).await;
        assert_eq!(
            snap.pending,
            vec![PendingInput {
                row: 0,
                col: 1,
                text: "3".to_string()
            }]
        );

        // an illegal keystroke is refused, keeping the previous text
        handle.cell_change(0, 1, "3a");
        settle().await;
        let snap = handle.snapshot();
        assert_eq!(snap.pending[0].text, "3");

        // commit clears the pending text whatever the outcome
        handle.cell_blur(0, 1, "3a");
        settle().await;
        let snap = handle.snapshot();
        assert!(snap.pending.is_empty());
    }

    #[tokio::test]
    async fn test_agent_moves_first_when_it_holds_the_turn() {
        let (shared, engine) = FakeEngine::pair(Participant::Agent);
        *shared.best.lock().unwrap() = Some(Recommendation {
            row: 3,
            col: 2,
            value: 1,
            visits: 8,
            score: 4.0,
        });
        let handle = SessionHandle::spawn_with_engine(engine, test_config());

        settle().await;
        assert_eq!(*shared.places.lock().unwrap(), vec![(3, 2, 1)]);
        assert!(shared.advances.load(Ordering::SeqCst) > 0);
        drop(handle);
    }

    #[tokio::test]
    async fn test_exhausted_engine_finishes_the_session() {
        // agent to move, but the engine has no recommendation
        let (shared, engine) = FakeEngine::pair(Participant::Agent);
        let handle = SessionHandle::spawn_with_engine(engine, test_config());

        settle().await;
        let after_agent = shared.advances.load(Ordering::SeqCst);
        assert!(after_agent > 0);

        // pondering must not run again and the session accepts no input
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(shared.advances.load(Ordering::SeqCst), after_agent);

        handle.cell_blur(0, 0, "1");
        settle().await;
        assert!(shared.places.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pondering_advances_search_on_the_humans_turn() {
        let (shared, engine) = FakeEngine::pair(Participant::Human);
        let _handle = SessionHandle::spawn_with_engine(engine, test_config());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(shared.advances.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_pondering_halts_permanently_once_finished() {
        let (shared, engine) = FakeEngine::pair(Participant::Human);
        let _handle = SessionHandle::spawn_with_engine(engine, test_config());

        tokio::time::sleep(Duration::from_millis(80)).await;
        shared.finished.store(true, Ordering::SeqCst);
        // let the next cycle observe the finish and halt
        tokio::time::sleep(Duration::from_millis(80)).await;
        let halted_at = shared.advances.load(Ordering::SeqCst);

        shared.finished.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(shared.advances.load(Ordering::SeqCst), halted_at);
    }

    #[tokio::test]
    async fn test_teardown_stops_all_search_work() {
        let (shared, engine) = FakeEngine::pair(Participant::Human);
        let handle = SessionHandle::spawn_with_engine(engine, test_config());

        tokio::time::sleep(Duration::from_millis(80)).await;
        drop(handle);
        settle().await;
        let halted_at = shared.advances.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(shared.advances.load(Ordering::SeqCst), halted_at);
    }

    #[tokio::test]
    async fn test_win_probability_present_only_on_humans_turn() {
        let (shared, engine) = FakeEngine::pair(Participant::Human);
        *shared.best.lock().unwrap() = Some(Recommendation {
            row: 0,
            col: 0,
            value: 2,
            visits: 10,
            score: 5.0,
        });
        let mut handle = SessionHandle::spawn_with_engine(engine, test_config());

        // first snapshot precedes any pondering: no estimate yet
        let snap = handle.changed().await;
        assert_eq!(snap.win_probability, None);

        // mean outcome 0.5 rescales to 0.75
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snap = handle.snapshot();
        assert_eq!(snap.win_probability, Some(0.75));

        // once the turn leaves the human the estimate disappears
        *shared.active.lock().unwrap() = Some(Participant::Agent);
        handle.cell_blur(0, 0, "");
        settle().await;
        let snap = handle.snapshot();
        assert_eq!(snap.win_probability, None);
    }

    #[tokio::test]
    async fn test_full_turn_cycle_against_the_real_engine() {
        let engine = MctsEngine::with_seed(4, 4, Participant::Human, 11).unwrap();
        let mut handle = SessionHandle::spawn_with_engine(Box::new(engine), test_config());

        handle.cell_blur(0, 0, "3");
        // the human move is applied, then the agent acts and the turn
        // returns to the human
        let snap = wait_for(&mut handle, |snap| {
            snap.active == Some(Participant::Human) && snap.grid[0][0] != CellState::Empty
        })
        .await;
        let filled: usize = snap
            .grid
            .iter()
            .flatten()
            .filter(|cell| **cell != CellState::Empty)
            .count();
        assert_eq!(filled, 2);
        assert_eq!(
            snap.grid[0][0],
            CellState::Guess {
                owner: Participant::Human,
                value: 3
            }
        );

        // refilling the same cell is rejected and changes nothing
        let before = handle.snapshot();
        handle.cell_blur(0, 0, "2");
        let after = handle.changed().await;
        assert_eq!(before.grid, after.grid);
        assert_eq!(before.active, after.active);
        assert_eq!(before.scores, after.scores);
    }

    #[tokio::test]
    async fn test_session_reaches_finished_when_the_grid_fills() {
        // 2x2 fills quickly; alternate human cross-outs with agent moves
        let engine = MctsEngine::with_seed(2, 2, Participant::Human, 5).unwrap();
        let config = SessionConfig {
            nrows: 2,
            ncols: 2,
            ..test_config()
        };
        let mut handle = SessionHandle::spawn_with_engine(Box::new(engine), config);

        let mut guard = 0;
        loop {
            let snap = handle.snapshot();
            if snap.finished {
                assert!(snap.active.is_none());
                break;
            }
            if snap.active == Some(Participant::Human) {
                let (row, col) = snap
                    .grid
                    .iter()
                    .enumerate()
                    .flat_map(|(r, cells)| {
                        cells.iter().enumerate().map(move |(c, cell)| (r, c, *cell))
                    })
                    .find(|&(_, _, cell)| cell == CellState::Empty)
                    .map(|(r, c, _)| (r, c))
                    .expect("unfinished grid has an empty cell");
                handle.cell_blur(row, col, "x");
            }
            let _ = handle.changed().await;
            guard += 1;
            assert!(guard < 50, "session never finished");
        }
    }
}
