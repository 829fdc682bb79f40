/// PPLNS (Pay Per Last N Shares) distribution
///
/// ## Algorithm
/// 1. Sum each user's pool difficulty over accepted shares with
///    `block_height > height - N`
/// 2. Pool fee = reward × fee%, credited to the operator account
/// 3. Each user gets (reward - fee) × user_sum / total_sum, rounded to 8 places
///
/// The found block and every reward record go to the store in one call.

use std::sync::Arc;

use anyhow::Result;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::store::{coins, FoundBlock, PoolStore, RewardRecord, ADMIN_ACCOUNT};

/// Split `reward` (in coins) over `window` of (username, summed difficulty).
pub fn compute_block_rewards(height: u64, reward: Decimal, fee_percent: Decimal, window: &[(String, f64)]) -> Vec<RewardRecord> {
    let total: f64 = window.iter().map(|(_, d)| *d).sum();
    let total = Decimal::from_f64(total).filter(|t| *t > Decimal::ZERO);

    let Some(total) = total else {
        tracing::warn!("PPLNS window empty at height {} - whole reward goes to {}", height, ADMIN_ACCOUNT);
        return vec![RewardRecord {
            height,
            username: ADMIN_ACCOUNT.to_string(),
            contribution: Decimal::ZERO,
            reward: reward.round_dp(8),
        }];
    };

    let fee = (reward * fee_percent / Decimal::ONE_HUNDRED).round_dp(8);
    let distributable = reward - fee;

    let mut records = Vec::with_capacity(window.len() + 1);
    for (username, difficulty) in window {
        let Some(sum) = Decimal::from_f64(*difficulty) else {
            continue;
        };
        let contribution = sum / total;
        records.push(RewardRecord {
            height,
            username: username.clone(),
            contribution,
            reward: (distributable * contribution).round_dp(8),
        });
    }
    records.push(RewardRecord {
        height,
        username: ADMIN_ACCOUNT.to_string(),
        contribution: Decimal::ZERO,
        reward: fee,
    });
    records
}

/// PPLNS calculator bound to a store
pub struct PplnsCalculator {
    store: Arc<dyn PoolStore>,
    window_length: u64,
    fee_percent: Decimal,
}

impl PplnsCalculator {
    pub fn new(store: Arc<dyn PoolStore>, window_length: u64, fee_percent: Decimal) -> Self {
        Self { store, window_length, fee_percent }
    }

    pub fn window_length(&self) -> u64 {
        self.window_length
    }

    /// Record a found block and its reward split.
    pub async fn distribute(&self, height: u64, hash: &str, reward_units: u64, finder: &str) -> Result<Vec<RewardRecord>> {
        let window = self
            .store
            .window_difficulty(height.saturating_sub(self.window_length))
            .await?;
        let reward = coins(reward_units);
        let records = compute_block_rewards(height, reward, self.fee_percent, &window);

        let found = FoundBlock {
            height,
            hash: hash.to_string(),
            username: finder.to_string(),
            reward,
        };
        self.store.record_found_block(&found, &records).await?;

        tracing::info!(
            "PPLNS block {} ({}): {} coins over {} users",
            height,
            hash,
            reward,
            window.len()
        );
        Ok(records)
    }
}
