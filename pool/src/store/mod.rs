/// Pool persistence - users, wallets, shares, blocks, rewards, payouts
///
/// `PoolStore` is the seam between the engine and its database. Every
/// method is one logical unit: implementations apply all records a call
/// touches atomically before returning.
///
/// Callers hold the pool state lock while talking to the store, so
/// read-modify-write sequences inside one call never interleave.

pub mod memory;
pub mod redis_store;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Operator account credited with the pool fee.
pub const ADMIN_ACCOUNT: &str = "admin";

/// Network fee of the shielded-to-transparent sweep, charged to the operator.
pub const SHIELD_SWEEP_FEE: Decimal = dec!(0.0001);

/// Default auto payout threshold for accounts created from an address.
pub const DEFAULT_PAYOUT_THRESHOLD: Decimal = dec!(0.1);

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Coin amount from base units (1e-8).
pub fn coins(base_units: u64) -> Decimal {
    Decimal::from(base_units) / Decimal::from(100_000_000u64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub username: String,
    pub worker: Option<String>,
    /// Met the pool difficulty
    pub pool_result: bool,
    /// Met the network difficulty (block found)
    pub share_result: bool,
    pub block_height: u64,
    pub share_difficulty: f64,
    pub pool_difficulty: f64,
    pub block_hash: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub height: u64,
    pub hash: Option<String>,
    pub mined: bool,
    pub username: Option<String>,
    pub reward: Decimal,
    pub difficulty: f64,
    pub net_hashrate: f64,
    pub confirmations: i64,
    pub created_at: i64,
}

impl BlockRecord {
    pub fn unmined(height: u64) -> Self {
        Self {
            height,
            hash: None,
            mined: false,
            username: None,
            reward: Decimal::ZERO,
            difficulty: 0.0,
            net_hashrate: 0.0,
            confirmations: 0,
            created_at: now_ts(),
        }
    }

    /// Mark as found by the pool.
    pub fn apply_found(&mut self, found: &FoundBlock) {
        self.mined = true;
        self.reward = found.reward;
        self.username = Some(found.username.clone());
        self.hash = Some(found.hash.clone());
        self.confirmations = 0;
    }

    /// Refresh from `getmininginfo`; the reward only moves while unmined.
    pub fn apply_info(&mut self, info: &BlockInfo) {
        if !self.mined {
            self.reward = info.reward;
        }
        self.difficulty = info.difficulty;
        self.net_hashrate = info.net_hashrate;
    }
}

/// A block the pool just found.
#[derive(Debug, Clone, PartialEq)]
pub struct FoundBlock {
    pub height: u64,
    pub hash: String,
    pub username: String,
    /// In coins
    pub reward: Decimal,
}

/// Network snapshot recorded on every new block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfo {
    pub height: u64,
    pub difficulty: f64,
    pub net_hashrate: f64,
    /// Pool output of the current coinbase, in coins
    pub reward: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardRecord {
    pub height: u64,
    pub username: String,
    pub contribution: Decimal,
    pub reward: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub username: String,
    pub address: Option<String>,
    pub balance: Decimal,
    /// Sent but not yet confirmed
    pub lock_balance: Decimal,
    /// Auto payout threshold, zero disables auto payout
    pub payout: Decimal,
}

impl Wallet {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            address: None,
            balance: Decimal::ZERO,
            lock_balance: Decimal::ZERO,
            payout: Decimal::ZERO,
        }
    }

    pub fn for_address(address: &str) -> Self {
        Self {
            address: Some(address.to_string()),
            payout: DEFAULT_PAYOUT_THRESHOLD,
            ..Self::new(address)
        }
    }

    pub fn is_auto_payable(&self) -> bool {
        !self.payout.is_zero() && self.balance >= self.payout && self.address.is_some()
    }

    pub fn credit(&mut self, amount: Decimal) {
        self.balance += amount;
    }

    /// Move `amount` from the spendable to the locked balance.
    pub fn lock(&mut self, amount: Decimal) {
        self.balance = (self.balance - amount).round_dp(8);
        self.lock_balance = (self.lock_balance + amount).round_dp(8);
    }

    /// Give a locked `amount` back to the spendable balance.
    pub fn refund(&mut self, amount: Decimal) {
        self.balance = (self.balance + amount).round_dp(8);
        self.lock_balance = (self.lock_balance - amount).round_dp(8);
    }

    /// Drop a locked `amount` once its transaction is confirmed.
    pub fn release(&mut self, amount: Decimal) {
        self.lock_balance = (self.lock_balance - amount).round_dp(8);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Auto,
    Manual,
    Shield,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub txid: Option<String>,
    pub op_id: Option<String>,
    pub username: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: Option<Decimal>,
    pub fee: Decimal,
    pub kind: TransactionKind,
    pub confirmations: i64,
    pub block_hash: Option<String>,
    pub created_at: i64,
}

impl TransactionRecord {
    pub const POOL_SOURCE: &'static str = "pool";

    pub fn payout(txid: Option<&str>, username: &str, to: &str, amount: Decimal, fee: Decimal, kind: TransactionKind) -> Self {
        Self {
            txid: txid.map(String::from),
            op_id: None,
            username: username.to_string(),
            from_address: Self::POOL_SOURCE.to_string(),
            to_address: to.to_string(),
            amount: Some(amount),
            fee: fee.abs(),
            kind,
            confirmations: 0,
            block_hash: None,
            created_at: now_ts(),
        }
    }

    fn amount_or_zero(&self) -> Decimal {
        self.amount.unwrap_or(Decimal::ZERO)
    }
}

/// Per-wallet lock releases and the operator fee correction for one
/// confirmed payout transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct LockRelease {
    pub releases: Vec<(String, Decimal)>,
    /// Fees charged to users minus the fee the network actually took
    pub admin_delta: Decimal,
}

pub fn plan_lock_release(rows: &[TransactionRecord], real_fee: Decimal) -> LockRelease {
    let mut releases = Vec::new();
    let mut user_fees = Decimal::ZERO;
    for tx in rows {
        if tx.username == ADMIN_ACCOUNT && tx.amount.is_some() {
            continue;
        }
        if tx.username != ADMIN_ACCOUNT {
            user_fees += tx.fee.abs();
        }
        releases.push((tx.username.clone(), tx.amount_or_zero() + tx.fee.abs()));
    }
    LockRelease { releases, admin_delta: user_fees - real_fee.abs() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationMethod {
    #[serde(rename = "z_shieldcoinbase")]
    ShieldCoinbase,
    #[serde(rename = "to_t_address")]
    ToTransparent,
}

impl OperationMethod {
    pub fn from_rpc(method: &str) -> Self {
        if method == "z_shieldcoinbase" {
            Self::ShieldCoinbase
        } else {
            Self::ToTransparent
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Executing,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub op_id: String,
    pub method: OperationMethod,
    pub status: OperationStatus,
    pub txid: Option<String>,
    pub message: Option<String>,
    pub created_at: i64,
}

impl OperationRecord {
    pub fn executing(op_id: &str, method: OperationMethod) -> Self {
        Self {
            op_id: op_id.to_string(),
            method,
            status: OperationStatus::Executing,
            txid: None,
            message: None,
            created_at: now_ts(),
        }
    }
}

/// Addresses and fee reported by a finished `z_shieldcoinbase`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShieldDetails {
    pub from_address: String,
    pub to_address: String,
    pub fee: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub username: String,
    pub worker: String,
    pub host: String,
    pub miner: Option<String>,
    pub connected_at: i64,
    pub disconnected_at: Option<i64>,
}

/// Disconnected worker rows older than this are pruned.
pub const WORKER_RETENTION_SECS: i64 = 86_400;

#[async_trait]
pub trait PoolStore: Send + Sync {
    async fn user_exists(&self, username: &str) -> Result<bool>;
    /// Create an account named after its payout address, with a wallet.
    async fn create_address_user(&self, address: &str) -> Result<()>;

    async fn worker_connected(&self, worker: &WorkerRecord) -> Result<()>;
    async fn worker_disconnected(&self, username: &str, worker: &str, host: &str) -> Result<()>;
    async fn disconnect_all_workers(&self) -> Result<()>;

    async fn insert_share(&self, share: &ShareRecord) -> Result<()>;
    /// Summed pool difficulty per user over accepted shares with
    /// `block_height > after_height`.
    async fn window_difficulty(&self, after_height: u64) -> Result<Vec<(String, f64)>>;
    /// Upsert the found block and insert its reward records.
    async fn record_found_block(&self, block: &FoundBlock, rewards: &[RewardRecord]) -> Result<()>;
    /// Upsert network info, then prune unmined blocks and non-block shares
    /// older than `window` blocks.
    async fn insert_block_info(&self, info: &BlockInfo, window: u64) -> Result<()>;

    async fn block(&self, height: u64) -> Result<Option<BlockRecord>>;
    async fn rewards(&self, height: u64) -> Result<Vec<RewardRecord>>;
    /// Mined, not orphaned blocks with fewer than `below` confirmations.
    async fn blocks_needing_confirmation(&self, below: i64) -> Result<Vec<BlockRecord>>;
    async fn set_block_confirmations(&self, height: u64, confirmations: i64, hash: Option<&str>) -> Result<()>;
    /// Zero the block's reward and every reward record for it.
    async fn orphan_block(&self, height: u64) -> Result<()>;
    /// Add each reward record of a matured block to its user's wallet.
    async fn credit_block_rewards(&self, height: u64) -> Result<()>;

    async fn wallet(&self, username: &str) -> Result<Option<Wallet>>;
    async fn payable_wallets(&self) -> Result<Vec<Wallet>>;
    /// Save one transaction per wallet and lock their whole balances.
    async fn record_auto_payout(&self, txid: &str, wallets: &[Wallet]) -> Result<()>;
    /// Save the transaction and lock `amount + fee` on the user's wallet.
    async fn record_manual_payout(&self, txid: &str, username: &str, address: &str, amount: Decimal, fee: Decimal) -> Result<()>;
    /// Distinct txids with `0..=max_confirmations` confirmations.
    async fn unconfirmed_txids(&self, max_confirmations: i64) -> Result<Vec<String>>;
    async fn update_transaction_confirmations(&self, txid: &str, confirmations: i64, block_hash: Option<&str>) -> Result<()>;
    async fn release_locked_balance(&self, txid: &str, real_fee: Decimal) -> Result<()>;
    async fn transactions(&self) -> Result<Vec<TransactionRecord>>;

    async fn operations(&self, method: Option<OperationMethod>, status: OperationStatus) -> Result<Vec<OperationRecord>>;
    async fn start_operation(&self, op: &OperationRecord, tx: Option<&TransactionRecord>) -> Result<()>;
    async fn complete_operation(&self, op_id: &str, txid: &str, shield: Option<&ShieldDetails>) -> Result<()>;
    /// Mark failed and refund the locked amount of its transaction.
    async fn fail_operation(&self, op_id: &str, message: Option<&str>) -> Result<()>;
    /// Operations the daemon no longer knows about.
    async fn lose_operations(&self, op_ids: &[String]) -> Result<()>;
}
