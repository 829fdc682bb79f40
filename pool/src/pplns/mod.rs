pub mod calculator;

pub use calculator::{compute_block_rewards, PplnsCalculator};
