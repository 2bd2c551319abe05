pub mod arb;
pub mod clv;
pub mod detector;
pub mod execution;
pub mod matching;
pub mod quotes;
pub mod scanner;
pub mod settlement;
pub mod signals;
pub mod staking;
pub mod state;

pub use scanner::ArbEngine;
pub use state::{EngineState, Settings};
