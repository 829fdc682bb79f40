/// In-process store for tests and dry runs. Every call holds one mutex
/// for its whole body, so multi-record updates are atomic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;

use super::{
    now_ts, plan_lock_release, BlockInfo, BlockRecord, FoundBlock, OperationMethod,
    OperationRecord, OperationStatus, PoolStore, RewardRecord, ShareRecord, ShieldDetails,
    TransactionKind, TransactionRecord, Wallet, WorkerRecord, ADMIN_ACCOUNT, SHIELD_SWEEP_FEE,
    WORKER_RETENTION_SECS,
};

#[derive(Default)]
struct Inner {
    users: HashSet<String>,
    wallets: HashMap<String, Wallet>,
    workers: Vec<WorkerRecord>,
    shares: Vec<ShareRecord>,
    blocks: BTreeMap<u64, BlockRecord>,
    rewards: BTreeMap<u64, Vec<RewardRecord>>,
    transactions: Vec<TransactionRecord>,
    operations: Vec<OperationRecord>,
}

impl Inner {
    fn wallet_mut(&mut self, username: &str) -> &mut Wallet {
        self.wallets
            .entry(username.to_string())
            .or_insert_with(|| Wallet::new(username))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a user with a prepared wallet.
    pub fn put_wallet(&self, wallet: Wallet) {
        let mut inner = self.lock();
        inner.users.insert(wallet.username.clone());
        inner.wallets.insert(wallet.username.clone(), wallet);
    }

    pub fn shares(&self) -> Vec<ShareRecord> {
        self.lock().shares.clone()
    }

    pub fn workers(&self) -> Vec<WorkerRecord> {
        self.lock().workers.clone()
    }
}

#[async_trait]
impl PoolStore for MemoryStore {
    async fn user_exists(&self, username: &str) -> Result<bool> {
        Ok(self.lock().users.contains(username))
    }

    async fn create_address_user(&self, address: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.users.insert(address.to_string());
        inner
            .wallets
            .entry(address.to_string())
            .or_insert_with(|| Wallet::for_address(address));
        Ok(())
    }

    async fn worker_connected(&self, worker: &WorkerRecord) -> Result<()> {
        let mut inner = self.lock();
        inner.workers.push(worker.clone());
        inner.wallet_mut(&worker.username);
        Ok(())
    }

    async fn worker_disconnected(&self, username: &str, worker: &str, host: &str) -> Result<()> {
        let now = now_ts();
        let mut inner = self.lock();
        let open: Vec<&mut WorkerRecord> = inner
            .workers
            .iter_mut()
            .filter(|w| {
                w.username == username
                    && w.worker == worker
                    && w.host == host
                    && w.disconnected_at.is_none()
            })
            .collect();
        if open.len() > 1 {
            tracing::error!("Duplicated worker {}.{} from {}", username, worker, host);
        }
        for w in open {
            w.disconnected_at = Some(now);
        }
        Ok(())
    }

    async fn disconnect_all_workers(&self) -> Result<()> {
        let now = now_ts();
        for w in self.lock().workers.iter_mut().filter(|w| w.disconnected_at.is_none()) {
            w.disconnected_at = Some(now);
        }
        Ok(())
    }

    async fn insert_share(&self, share: &ShareRecord) -> Result<()> {
        self.lock().shares.push(share.clone());
        Ok(())
    }

    async fn window_difficulty(&self, after_height: u64) -> Result<Vec<(String, f64)>> {
        let inner = self.lock();
        let mut sums: BTreeMap<&str, f64> = BTreeMap::new();
        for s in inner
            .shares
            .iter()
            .filter(|s| s.pool_result && s.block_height > after_height)
        {
            *sums.entry(s.username.as_str()).or_insert(0.0) += s.pool_difficulty;
        }
        Ok(sums.into_iter().map(|(u, d)| (u.to_string(), d)).collect())
    }

    async fn record_found_block(&self, block: &FoundBlock, rewards: &[RewardRecord]) -> Result<()> {
        let mut inner = self.lock();
        inner
            .blocks
            .entry(block.height)
            .or_insert_with(|| BlockRecord::unmined(block.height))
            .apply_found(block);
        inner.rewards.insert(block.height, rewards.to_vec());
        Ok(())
    }

    async fn insert_block_info(&self, info: &BlockInfo, window: u64) -> Result<()> {
        let mut inner = self.lock();
        inner
            .blocks
            .entry(info.height)
            .or_insert_with(|| BlockRecord::unmined(info.height))
            .apply_info(info);

        if let Some(cutoff) = info.height.checked_sub(window) {
            inner.blocks.retain(|h, b| b.mined || *h >= cutoff);
            inner.shares.retain(|s| s.share_result || s.block_height >= cutoff);
        }
        let stale = now_ts() - WORKER_RETENTION_SECS;
        inner
            .workers
            .retain(|w| w.disconnected_at.map_or(true, |t| t >= stale));
        Ok(())
    }

    async fn block(&self, height: u64) -> Result<Option<BlockRecord>> {
        Ok(self.lock().blocks.get(&height).cloned())
    }

    async fn rewards(&self, height: u64) -> Result<Vec<RewardRecord>> {
        Ok(self.lock().rewards.get(&height).cloned().unwrap_or_default())
    }

    async fn blocks_needing_confirmation(&self, below: i64) -> Result<Vec<BlockRecord>> {
        Ok(self
            .lock()
            .blocks
            .values()
            .filter(|b| b.mined && b.confirmations < below && b.confirmations != -1)
            .cloned()
            .collect())
    }

    async fn set_block_confirmations(&self, height: u64, confirmations: i64, hash: Option<&str>) -> Result<()> {
        let mut inner = self.lock();
        let block = inner
            .blocks
            .get_mut(&height)
            .ok_or_else(|| anyhow!("block {} not found", height))?;
        block.confirmations = confirmations;
        if let Some(hash) = hash {
            block.hash = Some(hash.to_string());
        }
        Ok(())
    }

    async fn orphan_block(&self, height: u64) -> Result<()> {
        let mut inner = self.lock();
        if let Some(rewards) = inner.rewards.get_mut(&height) {
            for r in rewards.iter_mut() {
                r.reward = Decimal::ZERO;
            }
        }
        if let Some(block) = inner.blocks.get_mut(&height) {
            block.reward = Decimal::ZERO;
        }
        Ok(())
    }

    async fn credit_block_rewards(&self, height: u64) -> Result<()> {
        let mut inner = self.lock();
        let rewards = inner.rewards.get(&height).cloned().unwrap_or_default();
        for r in rewards {
            inner.wallet_mut(&r.username).credit(r.reward);
        }
        Ok(())
    }

    async fn wallet(&self, username: &str) -> Result<Option<Wallet>> {
        Ok(self.lock().wallets.get(username).cloned())
    }

    async fn payable_wallets(&self) -> Result<Vec<Wallet>> {
        let mut wallets: Vec<Wallet> = self
            .lock()
            .wallets
            .values()
            .filter(|w| w.is_auto_payable())
            .cloned()
            .collect();
        wallets.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(wallets)
    }

    async fn record_auto_payout(&self, txid: &str, wallets: &[Wallet]) -> Result<()> {
        let mut inner = self.lock();
        for w in wallets {
            let to = w.address.as_deref().unwrap_or(&w.username);
            inner.transactions.push(TransactionRecord::payout(
                Some(txid),
                &w.username,
                to,
                w.balance,
                Decimal::ZERO,
                TransactionKind::Auto,
            ));
            inner.wallet_mut(&w.username).lock(w.balance);
        }
        Ok(())
    }

    async fn record_manual_payout(&self, txid: &str, username: &str, address: &str, amount: Decimal, fee: Decimal) -> Result<()> {
        let mut inner = self.lock();
        inner.transactions.push(TransactionRecord::payout(
            Some(txid),
            username,
            address,
            amount,
            fee,
            TransactionKind::Manual,
        ));
        inner.wallet_mut(username).lock(amount + fee);
        Ok(())
    }

    async fn unconfirmed_txids(&self, max_confirmations: i64) -> Result<Vec<String>> {
        let inner = self.lock();
        let mut seen = HashSet::new();
        Ok(inner
            .transactions
            .iter()
            .filter(|t| (0..=max_confirmations).contains(&t.confirmations))
            .filter_map(|t| t.txid.clone())
            .filter(|id| seen.insert(id.clone()))
            .collect())
    }

    async fn update_transaction_confirmations(&self, txid: &str, confirmations: i64, block_hash: Option<&str>) -> Result<()> {
        for t in self
            .lock()
            .transactions
            .iter_mut()
            .filter(|t| t.txid.as_deref() == Some(txid))
        {
            t.confirmations = confirmations;
            t.block_hash = block_hash.map(String::from);
        }
        Ok(())
    }

    async fn release_locked_balance(&self, txid: &str, real_fee: Decimal) -> Result<()> {
        let mut inner = self.lock();
        let rows: Vec<TransactionRecord> = inner
            .transactions
            .iter()
            .filter(|t| t.txid.as_deref() == Some(txid))
            .cloned()
            .collect();
        let plan = plan_lock_release(&rows, real_fee);
        for (username, amount) in &plan.releases {
            inner.wallet_mut(username).release(*amount);
        }
        if !plan.admin_delta.is_zero() {
            tracing::info!("Payout {} fee correction {} to {}", txid, plan.admin_delta, ADMIN_ACCOUNT);
            inner.wallet_mut(ADMIN_ACCOUNT).credit(plan.admin_delta);
        }
        Ok(())
    }

    async fn transactions(&self) -> Result<Vec<TransactionRecord>> {
        Ok(self.lock().transactions.clone())
    }

    async fn operations(&self, method: Option<OperationMethod>, status: OperationStatus) -> Result<Vec<OperationRecord>> {
        Ok(self
            .lock()
            .operations
            .iter()
            .filter(|o| o.status == status && method.map_or(true, |m| o.method == m))
            .cloned()
            .collect())
    }

    async fn start_operation(&self, op: &OperationRecord, tx: Option<&TransactionRecord>) -> Result<()> {
        let mut inner = self.lock();
        inner.operations.push(op.clone());
        if let Some(tx) = tx {
            inner.transactions.push(tx.clone());
        }
        Ok(())
    }

    async fn complete_operation(&self, op_id: &str, txid: &str, shield: Option<&ShieldDetails>) -> Result<()> {
        let mut inner = self.lock();
        let op = inner
            .operations
            .iter_mut()
            .find(|o| o.op_id == op_id)
            .ok_or_else(|| anyhow!("operation {} not found", op_id))?;
        op.status = OperationStatus::Success;
        op.txid = Some(txid.to_string());
        let method = op.method;

        match method {
            OperationMethod::ShieldCoinbase => {
                if let Some(details) = shield {
                    inner.transactions.push(TransactionRecord {
                        txid: Some(txid.to_string()),
                        op_id: Some(op_id.to_string()),
                        username: ADMIN_ACCOUNT.to_string(),
                        from_address: details.from_address.clone(),
                        to_address: details.to_address.clone(),
                        amount: None,
                        fee: details.fee.abs(),
                        kind: TransactionKind::Shield,
                        confirmations: 0,
                        block_hash: None,
                        created_at: now_ts(),
                    });
                }
            }
            OperationMethod::ToTransparent => {
                for t in inner
                    .transactions
                    .iter_mut()
                    .filter(|t| t.op_id.as_deref() == Some(op_id))
                {
                    t.txid = Some(txid.to_string());
                }
                let admin = inner.wallet_mut(ADMIN_ACCOUNT);
                admin.balance -= SHIELD_SWEEP_FEE;
            }
        }
        Ok(())
    }

    async fn fail_operation(&self, op_id: &str, message: Option<&str>) -> Result<()> {
        let mut inner = self.lock();
        if let Some(op) = inner.operations.iter_mut().find(|o| o.op_id == op_id) {
            op.status = OperationStatus::Failed;
            op.message = message.map(String::from);
        }
        let refund = inner
            .transactions
            .iter_mut()
            .find(|t| t.op_id.as_deref() == Some(op_id))
            .map(|t| {
                t.confirmations = -1;
                t.block_hash = message.map(String::from);
                (t.username.clone(), t.amount_or_zero() + t.fee)
            });
        if let Some((username, amount)) = refund {
            inner.wallet_mut(&username).refund(amount);
        }
        Ok(())
    }

    async fn lose_operations(&self, op_ids: &[String]) -> Result<()> {
        let mut inner = self.lock();
        for op_id in op_ids {
            if let Some(op) = inner.operations.iter_mut().find(|o| &o.op_id == op_id) {
                op.status = OperationStatus::Failed;
            }
            let refund = inner
                .transactions
                .iter_mut()
                .find(|t| t.op_id.as_deref() == Some(op_id.as_str()))
                .and_then(|t| {
                    t.confirmations = -1;
                    t.amount.filter(|a| *a > Decimal::ZERO).map(|a| (t.username.clone(), a))
                });
            if let Some((username, amount)) = refund {
                inner.wallet_mut(&username).refund(amount);
            }
        }
        Ok(())
    }
}
