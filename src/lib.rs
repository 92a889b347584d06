pub mod engine;
pub mod game;
pub mod mcts;
pub mod session;
pub mod validator;
pub mod web;

pub use engine::*;
pub use game::*;
pub use session::*;
