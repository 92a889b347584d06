//! Monte Carlo tree search over [`GameState`].
//!
//! The tree is keyed by full game positions; each node stores per-action
//! visit counts and accumulated rewards. Rewards are from the perspective of
//! the player to move at the visited node: +1 win, 0 draw, -1 loss.

use crate::game::{Action, GameState};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Per-node statistics: visit count and accumulated reward for each action
/// tried from this position, plus the cached legal action set.
struct ActionStats {
    visits: HashMap<Action, (u64, f64)>,
    available: Vec<Action>,
}

impl ActionStats {
    fn new(state: &GameState) -> Self {
        ActionStats {
            visits: HashMap::new(),
            available: state.legal_actions().collect(),
        }
    }

    fn record(&mut self, action: Action, reward: f64) {
        let entry = self.visits.entry(action).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += reward;
    }

    fn stats(&self, action: Action) -> (u64, f64) {
        self.visits.get(&action).copied().unwrap_or((0, 0.0))
    }
}

pub struct SearchTree {
    nodes: HashMap<GameState, ActionStats>,
}

impl SearchTree {
    pub fn new() -> Self {
        SearchTree {
            nodes: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// One playout: UCB selection down the known tree, expansion of one leaf,
    /// uniform random rollout to the end, then backpropagation along the path.
    pub fn playout(&mut self, root: &GameState, rng: &mut StdRng) {
        if root.is_finished() {
            return;
        }

        let mut path = Vec::new();
        let mut node = root.clone();
        while let Some(stats) = self.nodes.get(&node) {
            if stats.available.is_empty() {
                break;
            }
            let action = select_ucb(stats, rng);
            path.push((node.clone(), action));
            apply(&mut node, action);
        }

        self.nodes
            .entry(node.clone())
            .or_insert_with(|| ActionStats::new(&node));

        loop {
            let moves: Vec<Action> = node.legal_actions().collect();
            let Some(&action) = moves.choose(rng) else {
                break;
            };
            path.push((node.clone(), action));
            apply(&mut node, action);
        }

        let scores = node.scores();
        for (visited, action) in path {
            let Some(stats) = self.nodes.get_mut(&visited) else {
                // below the expansion frontier
                break;
            };
            let me = visited.active_player().index();
            let reward = match scores[me].cmp(&scores[1 - me]) {
                Ordering::Greater => 1.0,
                Ordering::Equal => 0.0,
                Ordering::Less => -1.0,
            };
            stats.record(action, reward);
        }
    }

    /// Current top recommendation from the root: the visited action with the
    /// highest mean reward. None before any playout has reached the root.
    pub fn best_action(&self, root: &GameState) -> Option<(Action, u64, f64)> {
        if root.is_finished() {
            return None;
        }
        let stats = self.nodes.get(root)?;
        stats
            .visits
            .iter()
            .max_by(|&(_, &(v1, s1)), &(_, &(v2, s2))| {
                (s1 / v1 as f64)
                    .partial_cmp(&(s2 / v2 as f64))
                    .unwrap_or(Ordering::Equal)
            })
            .map(|(&action, &(visits, score))| (action, visits, score))
    }

    /// Drop nodes that can no longer be reached once play has advanced to
    /// `root`, keeping memory bounded across a session.
    pub fn advance_root(&mut self, root: &GameState) {
        let remaining = root.empty_cells();
        self.nodes.retain(|state, _| state.empty_cells() <= remaining);
    }
}

impl Default for SearchTree {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(state: &mut GameState, action: Action) {
    state
        .place(action.row, action.col, action.cell)
        .expect("tree holds only legal actions");
}

/// UCB1 over the node's actions; unvisited actions are tried first, exact
/// ties are broken uniformly at random.
fn select_ucb(stats: &ActionStats, rng: &mut StdRng) -> Action {
    let total: u64 = stats
        .available
        .iter()
        .map(|&action| stats.stats(action).0)
        .sum();

    let mut choice = None;
    let mut num_best = 0u32;
    let mut best = f64::NEG_INFINITY;
    for &action in &stats.available {
        let (visits, reward) = stats.stats(action);
        let score = if visits == 0 {
            f64::INFINITY
        } else {
            let explore = (2.0 * (total as f64).ln() / visits as f64).sqrt();
            let exploit = (reward + 1.0) / (visits as f64 + 2.0);
            explore + exploit
        };
        if score > best {
            best = score;
            choice = Some(action);
            num_best = 1;
        } else if (score - best).abs() < f64::EPSILON {
            num_best += 1;
            if rng.gen_bool(1.0 / f64::from(num_best)) {
                choice = Some(action);
            }
        }
    }
    choice.expect("selection over a node with no actions")
}
