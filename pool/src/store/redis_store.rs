/// Redis store
///
/// Layout, all keys under `minepool:<coin>`:
/// - `users` (set) and `wallets` (hash username -> JSON)
/// - `workers` (hash user:worker:host:connected -> JSON)
/// - `shares` (sorted set scored by block height), `found_shares` (list)
/// - `blocks` (hash height -> JSON), `rewards:<height>` (hash username -> JSON)
/// - `transactions` (hash id -> JSON), `operations` (hash op_id -> JSON)
///
/// Reads happen first, then every write of a call goes out in one
/// MULTI/EXEC pipeline.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    now_ts, plan_lock_release, BlockInfo, BlockRecord, FoundBlock, OperationMethod,
    OperationRecord, OperationStatus, PoolStore, RewardRecord, ShareRecord, ShieldDetails,
    TransactionKind, TransactionRecord, Wallet, WorkerRecord, ADMIN_ACCOUNT, SHIELD_SWEEP_FEE,
    WORKER_RETENTION_SECS,
};

pub struct RedisStore {
    client: redis::Client,
    connection: Arc<RwLock<Option<ConnectionManager>>>,
    prefix: String,
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| anyhow!("Failed to serialize record: {}", e))
}

fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| anyhow!("Corrupt record {}: {}", raw, e))
}

fn worker_field(w: &WorkerRecord) -> String {
    format!("{}:{}:{}:{}", w.username, w.worker, w.host, w.connected_at)
}

impl RedisStore {
    pub fn new(redis_url: &str, coin: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(None)),
            prefix: format!("minepool:{}", coin),
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    fn rewards_key(&self, height: u64) -> String {
        self.key(&format!("rewards:{}", height))
    }

    /// Lazily created, shared connection manager.
    async fn conn(&self) -> Result<ConnectionManager> {
        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let manager = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow!("Failed to get connection manager: {}", e))?;
        *guard = Some(manager.clone());
        Ok(manager)
    }

    async fn load_map<T: DeserializeOwned>(&self, conn: &mut ConnectionManager, key: &str) -> Result<HashMap<String, T>> {
        let raw: HashMap<String, String> = conn
            .hgetall(key)
            .await
            .map_err(|e| anyhow!("Failed to read {}: {}", key, e))?;
        raw.into_iter()
            .map(|(field, value)| Ok((field, from_json(&value)?)))
            .collect()
    }

    async fn load_one<T: DeserializeOwned>(&self, conn: &mut ConnectionManager, key: &str, field: &str) -> Result<Option<T>> {
        let raw: Option<String> = conn
            .hget(key, field)
            .await
            .map_err(|e| anyhow!("Failed to read {} {}: {}", key, field, e))?;
        raw.as_deref().map(from_json).transpose()
    }

    async fn load_wallet(&self, conn: &mut ConnectionManager, username: &str) -> Result<Wallet> {
        Ok(self
            .load_one(conn, &self.key("wallets"), username)
            .await?
            .unwrap_or_else(|| Wallet::new(username)))
    }

    async fn commit(&self, conn: &mut ConnectionManager, pipe: &redis::Pipeline) -> Result<()> {
        pipe.query_async::<_, ()>(conn)
            .await
            .map_err(|e| anyhow!("Redis transaction failed: {}", e))
    }

    fn put_wallet(&self, pipe: &mut redis::Pipeline, wallet: &Wallet) -> Result<()> {
        pipe.hset(self.key("wallets"), &wallet.username, to_json(wallet)?).ignore();
        Ok(())
    }

    /// Apply `f` to each wallet named in `changes`, loading missing ones fresh.
    async fn stage_wallets<F>(&self, conn: &mut ConnectionManager, pipe: &mut redis::Pipeline, changes: &[(String, Decimal)], f: F) -> Result<()>
    where
        F: Fn(&mut Wallet, Decimal),
    {
        let mut staged: BTreeMap<String, Wallet> = BTreeMap::new();
        for (username, amount) in changes {
            if !staged.contains_key(username) {
                let wallet = self.load_wallet(conn, username).await?;
                staged.insert(username.clone(), wallet);
            }
            if let Some(wallet) = staged.get_mut(username) {
                f(wallet, *amount);
            }
        }
        for wallet in staged.values() {
            self.put_wallet(pipe, wallet)?;
        }
        Ok(())
    }

    async fn transactions_where<F>(&self, conn: &mut ConnectionManager, pred: F) -> Result<Vec<(String, TransactionRecord)>>
    where
        F: Fn(&TransactionRecord) -> bool,
    {
        let all: HashMap<String, TransactionRecord> = self.load_map(conn, &self.key("transactions")).await?;
        let mut rows: Vec<(String, TransactionRecord)> = all.into_iter().filter(|(_, t)| pred(t)).collect();
        rows.sort_by_key(|(_, t)| t.created_at);
        Ok(rows)
    }

    fn put_transaction(&self, pipe: &mut redis::Pipeline, id: &str, tx: &TransactionRecord) -> Result<()> {
        pipe.hset(self.key("transactions"), id, to_json(tx)?).ignore();
        Ok(())
    }

    fn put_operation(&self, pipe: &mut redis::Pipeline, op: &OperationRecord) -> Result<()> {
        pipe.hset(self.key("operations"), &op.op_id, to_json(op)?).ignore();
        Ok(())
    }
}

#[async_trait]
impl PoolStore for RedisStore {
    async fn user_exists(&self, username: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        conn.sismember(self.key("users"), username)
            .await
            .map_err(|e| anyhow!("Failed to check user: {}", e))
    }

    async fn create_address_user(&self, address: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let existing: Option<Wallet> = self.load_one(&mut conn, &self.key("wallets"), address).await?;
        let mut pipe = redis::pipe();
        pipe.atomic().sadd(self.key("users"), address).ignore();
        if existing.is_none() {
            self.put_wallet(&mut pipe, &Wallet::for_address(address))?;
        }
        self.commit(&mut conn, &pipe).await
    }

    async fn worker_connected(&self, worker: &WorkerRecord) -> Result<()> {
        let mut conn = self.conn().await?;
        let existing: Option<Wallet> = self.load_one(&mut conn, &self.key("wallets"), &worker.username).await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(self.key("workers"), worker_field(worker), to_json(worker)?)
            .ignore();
        if existing.is_none() {
            self.put_wallet(&mut pipe, &Wallet::new(&worker.username))?;
        }
        self.commit(&mut conn, &pipe).await
    }

    async fn worker_disconnected(&self, username: &str, worker: &str, host: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let workers: HashMap<String, WorkerRecord> = self.load_map(&mut conn, &self.key("workers")).await?;
        let now = now_ts();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, mut w) in workers {
            if w.username == username && w.worker == worker && w.host == host && w.disconnected_at.is_none() {
                w.disconnected_at = Some(now);
                pipe.hset(self.key("workers"), field, to_json(&w)?).ignore();
            }
        }
        self.commit(&mut conn, &pipe).await
    }

    async fn disconnect_all_workers(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let workers: HashMap<String, WorkerRecord> = self.load_map(&mut conn, &self.key("workers")).await?;
        let now = now_ts();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, mut w) in workers.into_iter().filter(|(_, w)| w.disconnected_at.is_none()) {
            w.disconnected_at = Some(now);
            pipe.hset(self.key("workers"), field, to_json(&w)?).ignore();
        }
        self.commit(&mut conn, &pipe).await
    }

    async fn insert_share(&self, share: &ShareRecord) -> Result<()> {
        let mut conn = self.conn().await?;
        // the id keeps identical shares distinct inside the sorted set
        let member = json!({ "id": Uuid::new_v4().simple().to_string(), "share": share }).to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(self.key("shares"), &member, share.block_height)
            .ignore();
        if share.share_result {
            pipe.rpush(self.key("found_shares"), to_json(share)?).ignore();
        }
        self.commit(&mut conn, &pipe).await
    }

    async fn window_difficulty(&self, after_height: u64) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn
            .zrangebyscore(self.key("shares"), format!("({}", after_height), "+inf")
            .await
            .map_err(|e| anyhow!("Failed to read share window: {}", e))?;

        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        for raw in members {
            let wrapped: serde_json::Value = from_json(&raw)?;
            let share: ShareRecord = serde_json::from_value(wrapped["share"].clone())
                .map_err(|e| anyhow!("Corrupt share {}: {}", raw, e))?;
            if share.pool_result {
                *sums.entry(share.username).or_insert(0.0) += share.pool_difficulty;
            }
        }
        Ok(sums.into_iter().collect())
    }

    async fn record_found_block(&self, block: &FoundBlock, rewards: &[RewardRecord]) -> Result<()> {
        let mut conn = self.conn().await?;
        let field = block.height.to_string();
        let mut record: BlockRecord = self
            .load_one(&mut conn, &self.key("blocks"), &field)
            .await?
            .unwrap_or_else(|| BlockRecord::unmined(block.height));
        record.apply_found(block);

        let rewards_key = self.rewards_key(block.height);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(self.key("blocks"), &field, to_json(&record)?)
            .ignore()
            .del(&rewards_key)
            .ignore();
        for r in rewards {
            pipe.hset(&rewards_key, &r.username, to_json(r)?).ignore();
        }
        self.commit(&mut conn, &pipe).await
    }

    async fn insert_block_info(&self, info: &BlockInfo, window: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        let blocks: HashMap<String, BlockRecord> = self.load_map(&mut conn, &self.key("blocks")).await?;
        let workers: HashMap<String, WorkerRecord> = self.load_map(&mut conn, &self.key("workers")).await?;

        let field = info.height.to_string();
        let mut record = blocks
            .get(&field)
            .cloned()
            .unwrap_or_else(|| BlockRecord::unmined(info.height));
        record.apply_info(info);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(self.key("blocks"), &field, to_json(&record)?)
            .ignore();

        if let Some(cutoff) = info.height.checked_sub(window) {
            for (f, b) in &blocks {
                if !b.mined && b.height < cutoff {
                    pipe.hdel(self.key("blocks"), f).ignore();
                }
            }
            pipe.cmd("ZREMRANGEBYSCORE")
                .arg(self.key("shares"))
                .arg("-inf")
                .arg(format!("({}", cutoff))
                .ignore();
        }

        let stale = now_ts() - WORKER_RETENTION_SECS;
        for (f, w) in &workers {
            if w.disconnected_at.map_or(false, |t| t < stale) {
                pipe.hdel(self.key("workers"), f).ignore();
            }
        }
        self.commit(&mut conn, &pipe).await
    }

    async fn block(&self, height: u64) -> Result<Option<BlockRecord>> {
        let mut conn = self.conn().await?;
        self.load_one(&mut conn, &self.key("blocks"), &height.to_string()).await
    }

    async fn rewards(&self, height: u64) -> Result<Vec<RewardRecord>> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, RewardRecord> = self.load_map(&mut conn, &self.rewards_key(height)).await?;
        let mut rewards: Vec<RewardRecord> = map.into_values().collect();
        rewards.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(rewards)
    }

    async fn blocks_needing_confirmation(&self, below: i64) -> Result<Vec<BlockRecord>> {
        let mut conn = self.conn().await?;
        let blocks: HashMap<String, BlockRecord> = self.load_map(&mut conn, &self.key("blocks")).await?;
        let mut pending: Vec<BlockRecord> = blocks
            .into_values()
            .filter(|b| b.mined && b.confirmations < below && b.confirmations != -1)
            .collect();
        pending.sort_by_key(|b| b.height);
        Ok(pending)
    }

    async fn set_block_confirmations(&self, height: u64, confirmations: i64, hash: Option<&str>) -> Result<()> {
        let mut conn = self.conn().await?;
        let field = height.to_string();
        let mut block: BlockRecord = self
            .load_one(&mut conn, &self.key("blocks"), &field)
            .await?
            .ok_or_else(|| anyhow!("block {} not found", height))?;
        block.confirmations = confirmations;
        if let Some(hash) = hash {
            block.hash = Some(hash.to_string());
        }
        let mut pipe = redis::pipe();
        pipe.atomic().hset(self.key("blocks"), &field, to_json(&block)?).ignore();
        self.commit(&mut conn, &pipe).await
    }

    async fn orphan_block(&self, height: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        let field = height.to_string();
        let rewards_key = self.rewards_key(height);
        let rewards: HashMap<String, RewardRecord> = self.load_map(&mut conn, &rewards_key).await?;
        let block: Option<BlockRecord> = self.load_one(&mut conn, &self.key("blocks"), &field).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (user, mut r) in rewards {
            r.reward = Decimal::ZERO;
            pipe.hset(&rewards_key, user, to_json(&r)?).ignore();
        }
        if let Some(mut block) = block {
            block.reward = Decimal::ZERO;
            pipe.hset(self.key("blocks"), &field, to_json(&block)?).ignore();
        }
        self.commit(&mut conn, &pipe).await
    }

    async fn credit_block_rewards(&self, height: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        let rewards: HashMap<String, RewardRecord> = self.load_map(&mut conn, &self.rewards_key(height)).await?;
        let changes: Vec<(String, Decimal)> = rewards.into_values().map(|r| (r.username, r.reward)).collect();
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.stage_wallets(&mut conn, &mut pipe, &changes, |w, amount| w.credit(amount))
            .await?;
        self.commit(&mut conn, &pipe).await
    }

    async fn wallet(&self, username: &str) -> Result<Option<Wallet>> {
        let mut conn = self.conn().await?;
        self.load_one(&mut conn, &self.key("wallets"), username).await
    }

    async fn payable_wallets(&self) -> Result<Vec<Wallet>> {
        let mut conn = self.conn().await?;
        let wallets: HashMap<String, Wallet> = self.load_map(&mut conn, &self.key("wallets")).await?;
        let mut payable: Vec<Wallet> = wallets.into_values().filter(Wallet::is_auto_payable).collect();
        payable.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(payable)
    }

    async fn record_auto_payout(&self, txid: &str, wallets: &[Wallet]) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for w in wallets {
            let to = w.address.as_deref().unwrap_or(&w.username);
            let tx = TransactionRecord::payout(Some(txid), &w.username, to, w.balance, Decimal::ZERO, TransactionKind::Auto);
            self.put_transaction(&mut pipe, &Uuid::new_v4().simple().to_string(), &tx)?;
        }
        let changes: Vec<(String, Decimal)> = wallets.iter().map(|w| (w.username.clone(), w.balance)).collect();
        self.stage_wallets(&mut conn, &mut pipe, &changes, |w, amount| w.lock(amount))
            .await?;
        self.commit(&mut conn, &pipe).await
    }

    async fn record_manual_payout(&self, txid: &str, username: &str, address: &str, amount: Decimal, fee: Decimal) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        let tx = TransactionRecord::payout(Some(txid), username, address, amount, fee, TransactionKind::Manual);
        self.put_transaction(&mut pipe, &Uuid::new_v4().simple().to_string(), &tx)?;
        let changes = [(username.to_string(), amount + fee)];
        self.stage_wallets(&mut conn, &mut pipe, &changes, |w, a| w.lock(a)).await?;
        self.commit(&mut conn, &pipe).await
    }

    async fn unconfirmed_txids(&self, max_confirmations: i64) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let rows = self
            .transactions_where(&mut conn, |t| {
                t.txid.is_some() && (0..=max_confirmations).contains(&t.confirmations)
            })
            .await?;
        let mut seen = HashSet::new();
        Ok(rows
            .into_iter()
            .filter_map(|(_, t)| t.txid)
            .filter(|id| seen.insert(id.clone()))
            .collect())
    }

    async fn update_transaction_confirmations(&self, txid: &str, confirmations: i64, block_hash: Option<&str>) -> Result<()> {
        let mut conn = self.conn().await?;
        let rows = self
            .transactions_where(&mut conn, |t| t.txid.as_deref() == Some(txid))
            .await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (id, mut t) in rows {
            t.confirmations = confirmations;
            t.block_hash = block_hash.map(String::from);
            self.put_transaction(&mut pipe, &id, &t)?;
        }
        self.commit(&mut conn, &pipe).await
    }

    async fn release_locked_balance(&self, txid: &str, real_fee: Decimal) -> Result<()> {
        let mut conn = self.conn().await?;
        let rows: Vec<TransactionRecord> = self
            .transactions_where(&mut conn, |t| t.txid.as_deref() == Some(txid))
            .await?
            .into_iter()
            .map(|(_, t)| t)
            .collect();
        let plan = plan_lock_release(&rows, real_fee);

        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut staged: BTreeMap<String, Wallet> = BTreeMap::new();
        for (username, amount) in &plan.releases {
            if !staged.contains_key(username) {
                let wallet = self.load_wallet(&mut conn, username).await?;
                staged.insert(username.clone(), wallet);
            }
            if let Some(wallet) = staged.get_mut(username) {
                wallet.release(*amount);
            }
        }
        if !staged.contains_key(ADMIN_ACCOUNT) {
            let admin = self.load_wallet(&mut conn, ADMIN_ACCOUNT).await?;
            staged.insert(ADMIN_ACCOUNT.to_string(), admin);
        }
        if let Some(admin) = staged.get_mut(ADMIN_ACCOUNT) {
            admin.credit(plan.admin_delta);
        }
        for wallet in staged.values() {
            self.put_wallet(&mut pipe, wallet)?;
        }
        self.commit(&mut conn, &pipe).await
    }

    async fn transactions(&self) -> Result<Vec<TransactionRecord>> {
        let mut conn = self.conn().await?;
        Ok(self
            .transactions_where(&mut conn, |_| true)
            .await?
            .into_iter()
            .map(|(_, t)| t)
            .collect())
    }

    async fn operations(&self, method: Option<OperationMethod>, status: OperationStatus) -> Result<Vec<OperationRecord>> {
        let mut conn = self.conn().await?;
        let ops: HashMap<String, OperationRecord> = self.load_map(&mut conn, &self.key("operations")).await?;
        let mut matching: Vec<OperationRecord> = ops
            .into_values()
            .filter(|o| o.status == status && method.map_or(true, |m| o.method == m))
            .collect();
        matching.sort_by_key(|o| o.created_at);
        Ok(matching)
    }

    async fn start_operation(&self, op: &OperationRecord, tx: Option<&TransactionRecord>) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.put_operation(&mut pipe, op)?;
        if let Some(tx) = tx {
            self.put_transaction(&mut pipe, &Uuid::new_v4().simple().to_string(), tx)?;
        }
        self.commit(&mut conn, &pipe).await
    }

    async fn complete_operation(&self, op_id: &str, txid: &str, shield: Option<&ShieldDetails>) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut op: OperationRecord = self
            .load_one(&mut conn, &self.key("operations"), op_id)
            .await?
            .ok_or_else(|| anyhow!("operation {} not found", op_id))?;
        op.status = OperationStatus::Success;
        op.txid = Some(txid.to_string());

        let mut pipe = redis::pipe();
        pipe.atomic();
        self.put_operation(&mut pipe, &op)?;
        match op.method {
            OperationMethod::ShieldCoinbase => {
                if let Some(details) = shield {
                    let tx = TransactionRecord {
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
                    };
                    self.put_transaction(&mut pipe, &Uuid::new_v4().simple().to_string(), &tx)?;
                }
            }
            OperationMethod::ToTransparent => {
                let rows = self
                    .transactions_where(&mut conn, |t| t.op_id.as_deref() == Some(op_id))
                    .await?;
                for (id, mut t) in rows {
                    t.txid = Some(txid.to_string());
                    self.put_transaction(&mut pipe, &id, &t)?;
                }
                let changes = [(ADMIN_ACCOUNT.to_string(), SHIELD_SWEEP_FEE)];
                self.stage_wallets(&mut conn, &mut pipe, &changes, |w, fee| w.balance -= fee)
                    .await?;
            }
        }
        self.commit(&mut conn, &pipe).await
    }

    async fn fail_operation(&self, op_id: &str, message: Option<&str>) -> Result<()> {
        let mut conn = self.conn().await?;
        let op: Option<OperationRecord> = self.load_one(&mut conn, &self.key("operations"), op_id).await?;
        let rows = self
            .transactions_where(&mut conn, |t| t.op_id.as_deref() == Some(op_id))
            .await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(mut op) = op {
            op.status = OperationStatus::Failed;
            op.message = message.map(String::from);
            self.put_operation(&mut pipe, &op)?;
        }
        if let Some((id, mut t)) = rows.into_iter().next() {
            t.confirmations = -1;
            t.block_hash = message.map(String::from);
            self.put_transaction(&mut pipe, &id, &t)?;
            let changes = [(t.username.clone(), t.amount_or_zero() + t.fee)];
            self.stage_wallets(&mut conn, &mut pipe, &changes, |w, a| w.refund(a)).await?;
        }
        self.commit(&mut conn, &pipe).await
    }

    async fn lose_operations(&self, op_ids: &[String]) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut changes = Vec::new();
        for op_id in op_ids {
            let op: Option<OperationRecord> = self.load_one(&mut conn, &self.key("operations"), op_id).await?;
            if let Some(mut op) = op {
                op.status = OperationStatus::Failed;
                self.put_operation(&mut pipe, &op)?;
            }
            let rows = self
                .transactions_where(&mut conn, |t| t.op_id.as_deref() == Some(op_id.as_str()))
                .await?;
            if let Some((id, mut t)) = rows.into_iter().next() {
                t.confirmations = -1;
                self.put_transaction(&mut pipe, &id, &t)?;
                if let Some(amount) = t.amount.filter(|a| *a > Decimal::ZERO) {
                    changes.push((t.username.clone(), amount));
                }
            }
        }
        self.stage_wallets(&mut conn, &mut pipe, &changes, |w, a| w.refund(a)).await?;
        self.commit(&mut conn, &pipe).await
    }
}
