/// Block template updater
///
/// Polls `getblocktemplate` every `block_update_ms`. A new previous hash
/// rebuilds the template and notifies every authorized session, then runs
/// the per-block bookkeeping: network info, confirmations, auto payouts,
/// payout transaction tracking and (zcash family) shielding. An unchanged
/// tip only refreshes the Merkle structure once `merkle_update_ms` elapsed.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use super::rpc_client::{decimal_of, BlockSubsidy, OperationStatus as DaemonOperation, RpcError};
use crate::metrics::prometheus as metrics;
use crate::state::{Pool, PoolState};
use crate::store::{
    coins, BlockInfo, BlockRecord, OperationMethod, OperationRecord, OperationStatus, ShieldDetails,
    TransactionKind, TransactionRecord, ADMIN_ACCOUNT, SHIELD_SWEEP_FEE,
};

/// Startup: apply the subsidy override, then load the first template.
pub async fn init(pool: &Pool, state: &mut PoolState) -> Result<()> {
    update_coin_reward(pool, state).await;
    update_block(pool, state, None).await?;
    Ok(())
}

/// Poll loop. The first template was loaded by `init`.
pub fn spawn(pool: Arc<Pool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(pool.config.block_update_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;
            pool.bans.sweep();
            let mut state = pool.state.lock().await;
            if let Err(e) = update_block(&pool, &mut state, None).await {
                tracing::error!("update_block failed: {}", e);
            }
        }
    })
}

/// `getblocksubsidy` overrides `coinbasevalue` when the daemon has it.
pub async fn update_coin_reward(pool: &Pool, state: &mut PoolState) {
    match pool.daemon.get_block_subsidy().await {
        Ok(subsidy) => {
            let units = subsidy_units(&subsidy, pool.profile.subsidy_in_base_units);
            tracing::info!("Block subsidy {} from getblocksubsidy", units);
            Arc::make_mut(&mut state.template).subsidy = Some(units);
        }
        Err(RpcError::MethodNotFound(_)) => {
            tracing::debug!("getblocksubsidy not supported, using coinbasevalue");
        }
        Err(e) => tracing::debug!("getblocksubsidy unavailable: {}", e),
    }
}

fn subsidy_units(subsidy: &BlockSubsidy, in_base_units: bool) -> u64 {
    match subsidy.founders {
        Some(founders) if in_base_units => (subsidy.miner + founders).round() as u64,
        Some(founders) => ((subsidy.miner + founders) * 1e8).round() as u64,
        None => (subsidy.miner * 1e8).round() as u64,
    }
}

/// One poll tick. With `found_hash` set (right after a successful
/// `submitblock`) returns the daemon's new tip when it differs from the
/// hash the pool computed.
pub async fn update_block(
    pool: &Pool,
    state: &mut PoolState,
    found_hash: Option<&str>,
) -> Result<Option<String>> {
    tracing::debug!("Check new block");
    let data = pool.daemon.get_block_template().await?;

    if state.template.prev_hash != data.previousblockhash {
        tracing::info!("Found New Block, previous hash is {}", data.previousblockhash);
        // committed only once both halves succeed
        let mut next = (*state.template).clone();
        next.block_update(&data)?;
        next.merkle_update(&data)?;
        state.template = Arc::new(next);
        state.notify_all();
        state.merkle_countdown_ms = pool.config.merkle_update_ms as i64;
        metrics::inc_template_updates();
        metrics::set_template_height(state.template.height);

        if let Err(e) = record_mining_info(pool, state).await {
            tracing::warn!("Mining info not recorded: {}", e);
        }
        if let Err(e) = update_confirmations(pool).await {
            metrics::inc_store_errors();
            tracing::error!("Confirmation update failed: {}", e);
        }
        if let Err(e) = send_auto_payout(pool).await {
            tracing::error!("Auto payout failed: {}", e);
        }
        if let Err(e) = check_unconfirmed_transactions(pool).await {
            tracing::error!("Transaction tracking failed: {}", e);
        }
        if let Some(shield) = zcash_shield_address(pool) {
            if let Err(e) = shield_to_transparent(pool, shield).await {
                tracing::error!("Shield to transparent failed: {}", e);
            }
        }

        if found_hash.is_some_and(|hash| hash != data.previousblockhash) {
            return Ok(Some(data.previousblockhash));
        }
    } else if state.merkle_countdown_ms <= 0 {
        tracing::debug!("Check new merkle");
        let mut next = (*state.template).clone();
        if next.merkle_update(&data)? {
            state.template = Arc::new(next);
            state.notify_all();
        }
        state.merkle_countdown_ms = pool.config.merkle_update_ms as i64;
    } else {
        state.merkle_countdown_ms -= pool.config.block_update_ms as i64;
    }

    Ok(None)
}

fn zcash_shield_address(pool: &Pool) -> Option<&str> {
    if pool.profile.is_zcash() {
        pool.profile.shield_address.as_deref()
    } else {
        None
    }
}

async fn record_mining_info(pool: &Pool, state: &PoolState) -> Result<()> {
    let info = pool.daemon.get_mining_info().await?;
    let net_hashrate = info
        .network_hashrate()
        .ok_or_else(|| anyhow::anyhow!("net hashrate not found"))?;
    let block_info = BlockInfo {
        height: info.blocks,
        difficulty: info.network_difficulty().unwrap_or_default(),
        net_hashrate,
        reward: coins(state.template.coinbase.pool_reward),
    };
    pool.store.insert_block_info(&block_info, pool.config.pplns_length).await
}

/// Re-query mined blocks until they mature or turn out orphaned. For the
/// zcash family this also drives the shielding operations.
pub async fn update_confirmations(pool: &Pool) -> Result<()> {
    let mature = pool.config.confirmation_count + 1;
    for block in pool.store.blocks_needing_confirmation(mature).await? {
        let Some(hash) = block.hash.clone() else {
            continue;
        };
        match pool.daemon.get_block(&hash).await {
            Ok(status) => settle_block(pool, &block, status.confirmations, None).await?,
            // header hash and block id differ on some chains
            Err(_) if block.confirmations == 0 => {
                if let Err(e) = resolve_block_hash(pool, &block).await {
                    tracing::error!("NotFound Block {}, message: {}", hash, e);
                }
            }
            Err(e) => tracing::error!("NotFound Block {}, message: {}", hash, e),
        }
    }

    if let Some(shield) = zcash_shield_address(pool) {
        if let Err(e) = track_shield_operations(pool, shield).await {
            tracing::error!("Shield operation tracking failed: {}", e);
        }
    }
    Ok(())
}

async fn resolve_block_hash(pool: &Pool, block: &BlockRecord) -> Result<()> {
    let hash = pool.daemon.get_block_hash(block.height).await?;
    let status = pool.daemon.get_block(&hash).await?;
    tracing::info!("Block {} resolved to hash {}", block.height, hash);
    settle_block(pool, block, status.confirmations, Some(&hash)).await
}

async fn settle_block(pool: &Pool, block: &BlockRecord, confirmations: i64, hash: Option<&str>) -> Result<()> {
    pool.store
        .set_block_confirmations(block.height, confirmations, hash)
        .await?;
    if confirmations == -1 {
        tracing::warn!("Block {} orphaned, rewards zeroed", block.height);
        pool.store.orphan_block(block.height).await?;
    } else if confirmations >= pool.config.confirmation_count + 1 {
        tracing::info!("Block {} matured with {} confirmations", block.height, confirmations);
        pool.store.credit_block_rewards(block.height).await?;
    }
    Ok(())
}

/// Pay every wallet over its threshold in a single `sendmany`.
pub async fn send_auto_payout(pool: &Pool) -> Result<()> {
    let wallets = pool.store.payable_wallets().await?;
    if wallets.is_empty() {
        return Ok(());
    }
    tracing::info!("New auto payout transaction {}", wallets.len());

    let mut amounts: BTreeMap<String, Decimal> = BTreeMap::new();
    for wallet in &wallets {
        if let Some(address) = &wallet.address {
            *amounts.entry(address.clone()).or_default() += wallet.balance;
        }
    }

    let txid = pool.daemon.send_many(&amounts).await?;
    pool.store.record_auto_payout(&txid, &wallets).await?;
    tracing::info!("Auto payout Transaction ID : {}, data {:?}", txid, amounts);
    Ok(())
}

/// Track payout transactions until they pass the confirmation threshold,
/// then release the locked balances.
pub async fn check_unconfirmed_transactions(pool: &Pool) -> Result<()> {
    let threshold = pool.config.unconfirmed_tx_confirmations;
    for txid in pool.store.unconfirmed_txids(threshold).await? {
        let tx = match pool.daemon.get_transaction(&txid).await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!("gettransaction {} failed: {}", txid, e);
                continue;
            }
        };
        pool.store
            .update_transaction_confirmations(&tx.txid, tx.confirmations, tx.block_hash.as_deref())
            .await?;
        if tx.confirmations > threshold {
            tracing::info!("Transaction {} confirmed, releasing locked balance", tx.txid);
            pool.store.release_locked_balance(&tx.txid, tx.fee).await?;
        }
    }
    Ok(())
}

/// Keep one `z_shieldcoinbase` running and settle finished operations.
pub async fn track_shield_operations(pool: &Pool, shield_address: &str) -> Result<()> {
    let running = pool
        .store
        .operations(Some(OperationMethod::ShieldCoinbase), OperationStatus::Executing)
        .await?;
    if running.is_empty() {
        match pool.daemon.z_shield_coinbase(shield_address).await {
            Ok(shield) => {
                let op = OperationRecord::executing(&shield.opid, OperationMethod::ShieldCoinbase);
                pool.store.start_operation(&op, None).await?;
                tracing::info!("New Shield Coinbase, Operation : {}", shield.opid);
            }
            Err(e) => tracing::debug!("z_shieldcoinbase skipped: {}", e),
        }
    }

    let unfinished = pool.store.operations(None, OperationStatus::Executing).await?;
    if unfinished.is_empty() {
        return Ok(());
    }
    let mut lost: Vec<String> = unfinished.iter().map(|op| op.op_id.clone()).collect();
    let statuses = pool.daemon.z_get_operation_status(&lost).await?;

    for status in statuses {
        lost.retain(|id| *id != status.id);
        let method = status
            .method
            .as_deref()
            .map(OperationMethod::from_rpc)
            .or_else(|| unfinished.iter().find(|op| op.op_id == status.id).map(|op| op.method));

        match status.status.as_str() {
            "success" => {
                let Some(txid) = status.txid() else {
                    tracing::warn!("Operation {} succeeded without a txid", status.id);
                    continue;
                };
                let details = match method {
                    Some(OperationMethod::ShieldCoinbase) => shield_details(&status),
                    _ => None,
                };
                pool.store
                    .complete_operation(&status.id, &txid, details.as_ref())
                    .await?;
                if method == Some(OperationMethod::ShieldCoinbase) {
                    tracing::info!("New Shield Coinbase Transaction : {}", txid);
                } else {
                    tracing::info!("New Operation {}, Transaction : {}", status.id, txid);
                }
            }
            "failed" => {
                let message = status.error_message();
                tracing::warn!("Failed Operation {}: {:?}", status.id, message);
                pool.store.fail_operation(&status.id, message.as_deref()).await?;
            }
            _ => {}
        }
    }

    if !lost.is_empty() {
        tracing::info!("Lost Operations : {:?}", lost);
        pool.store.lose_operations(&lost).await?;
    }
    Ok(())
}

fn shield_details(status: &DaemonOperation) -> Option<ShieldDetails> {
    let params = status.params.as_ref()?;
    Some(ShieldDetails {
        from_address: params.get("fromaddress")?.as_str()?.to_string(),
        to_address: params.get("toaddress")?.as_str()?.to_string(),
        fee: params.get("fee").and_then(decimal_of).unwrap_or_default(),
    })
}

/// Move the shielded balance back to the pool's transparent address.
pub async fn shield_to_transparent(pool: &Pool, shield_address: &str) -> Result<()> {
    let running = pool
        .store
        .operations(Some(OperationMethod::ToTransparent), OperationStatus::Executing)
        .await?;
    if !running.is_empty() {
        return Ok(());
    }

    let balance = pool.daemon.get_total_balance().await?;
    let amount = (balance.private - SHIELD_SWEEP_FEE).round_dp(8);
    if amount <= Decimal::ZERO {
        return Ok(());
    }

    let to = pool.profile.pool_address.clone();
    tracing::info!("Shield to T address, Try amount {} to {}", amount, to);
    let op_id = pool
        .daemon
        .z_send_many(shield_address, &[(to.clone(), amount)])
        .await?;

    let op = OperationRecord::executing(&op_id, OperationMethod::ToTransparent);
    let tx = TransactionRecord {
        op_id: Some(op_id.clone()),
        ..TransactionRecord::payout(None, ADMIN_ACCOUNT, &to, amount, Decimal::ZERO, TransactionKind::Shield)
    };
    pool.store.start_operation(&op, Some(&tx)).await?;
    tracing::info!("Shield to T address operation : {}, amount {}", op_id, amount);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::rpc_client::scripted::ScriptedDaemon;
    use crate::config::Config;
    use crate::state::tests::{authorized_session, test_pool};
    use crate::store::{FoundBlock, MemoryStore, PoolStore, RewardRecord, Wallet};
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};

    const PREV: &str = "00000000000000000001111111111111111111111111111111111111111111aa";

    fn template_json(prev: &str) -> Value {
        json!({
            "version": 0x2000_0000u32,
            "previousblockhash": prev,
            "target": "00000000ffff0000000000000000000000000000000000000000000000000000",
            "curtime": 1_600_000_000u32,
            "bits": "1d00ffff",
            "height": 500_000,
            "coinbasevalue": 5_000_000_000u64,
        })
    }

    fn setup(config: Config) -> (Arc<ScriptedDaemon>, Arc<MemoryStore>, Arc<Pool>) {
        let daemon = Arc::new(ScriptedDaemon::default());
        let store = Arc::new(MemoryStore::new());
        let pool = test_pool(config, daemon.clone(), store.clone());
        (daemon, store, pool)
    }

    async fn found(store: &MemoryStore, height: u64, hash: &str) {
        let block = FoundBlock { height, hash: hash.into(), username: "alice".into(), reward: dec!(10) };
        let rewards = vec![RewardRecord {
            height,
            username: "alice".into(),
            contribution: dec!(1),
            reward: dec!(9.8),
        }];
        store.record_found_block(&block, &rewards).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_rebuild_leaves_template_for_next_tick() {
        let (daemon, _store, pool) = setup(Config::default());
        let mut broken = template_json(PREV);
        broken["transactions"] = json!([{"data": "00", "txid": "zz", "hash": "zz", "fee": 0}]);
        daemon.once("getblocktemplate", Ok(broken));
        daemon.always("getblocktemplate", Ok(template_json(PREV)));

        let mut state = pool.state.lock().await;
        let (_id, mut rx) = authorized_session(&mut state, "alice");
        assert!(update_block(&pool, &mut state, None).await.is_err());
        assert_ne!(state.template.prev_hash, PREV);
        assert!(rx.try_recv().is_err());

        update_block(&pool, &mut state, None).await.unwrap();
        assert_eq!(state.template.prev_hash, PREV);
        assert_eq!(state.template.height, 500_000);
        let notify: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(notify["method"], json!("mining.notify"));
        assert_eq!(notify["params"][8], json!(true));
    }

    #[tokio::test]
    async fn test_new_block_rebuilds_and_notifies() {
        let (daemon, store, pool) = setup(Config::default());
        daemon.always("getblocktemplate", Ok(template_json(PREV)));
        daemon.always("getmininginfo", Ok(json!({"blocks": 499_999, "difficulty": 2.5, "networkhashps": 1e12})));

        let mut state = pool.state.lock().await;
        let (_id, mut rx) = authorized_session(&mut state, "alice");
        assert_eq!(update_block(&pool, &mut state, None).await.unwrap(), None);

        assert_eq!(state.template.height, 500_000);
        assert_eq!(state.template.prev_hash, PREV);
        let notify: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(notify["method"], json!("mining.notify"));

        let info = store.block(499_999).await.unwrap().unwrap();
        assert_eq!(info.difficulty, 2.5);
        assert_eq!(info.reward, dec!(50));
    }

    #[tokio::test]
    async fn test_found_hash_reports_new_tip() {
        let (daemon, _store, pool) = setup(Config::default());
        daemon.once("getblocktemplate", Ok(template_json(PREV)));
        let mut state = pool.state.lock().await;
        let tip = update_block(&pool, &mut state, Some("ours")).await.unwrap();
        assert_eq!(tip.as_deref(), Some(PREV));

        let next = "00000000000000000001111111111111111111111111111111111111111111bb";
        daemon.once("getblocktemplate", Ok(template_json(next)));
        assert_eq!(update_block(&pool, &mut state, Some(next)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_merkle_countdown() {
        let config = Config { block_update_ms: 1_000, merkle_update_ms: 2_000, ..Config::default() };
        let (daemon, _store, pool) = setup(config);
        daemon.always("getblocktemplate", Ok(template_json(PREV)));

        let mut state = pool.state.lock().await;
        update_block(&pool, &mut state, None).await.unwrap();
        assert_eq!(state.merkle_countdown_ms, 2_000);
        update_block(&pool, &mut state, None).await.unwrap();
        update_block(&pool, &mut state, None).await.unwrap();
        assert_eq!(state.merkle_countdown_ms, 0);
        update_block(&pool, &mut state, None).await.unwrap();
        assert_eq!(state.merkle_countdown_ms, 2_000);
    }

    #[tokio::test]
    async fn test_template_failure_is_error() {
        let (daemon, _store, pool) = setup(Config::default());
        daemon.always("getblocktemplate", Err(RpcError::Timeout));
        let mut state = pool.state.lock().await;
        assert!(update_block(&pool, &mut state, None).await.is_err());
        assert_eq!(state.template.height, 0);
    }

    #[tokio::test]
    async fn test_coin_reward_from_subsidy() {
        let (daemon, _store, pool) = setup(Config::default());
        daemon.always("getblocksubsidy", Ok(json!({"miner": 10.0, "founders": 2.5})));
        let mut state = pool.state.lock().await;
        update_coin_reward(&pool, &mut state).await;
        assert_eq!(state.template.subsidy, Some(1_250_000_000));
    }

    #[test]
    fn test_subsidy_units() {
        let s = BlockSubsidy { miner: 12.5, founders: None };
        assert_eq!(subsidy_units(&s, false), 1_250_000_000);
        let s = BlockSubsidy { miner: 1_000.0, founders: Some(250.0) };
        assert_eq!(subsidy_units(&s, true), 1_250);
    }

    #[tokio::test]
    async fn test_confirmations_orphan_and_credit() {
        let (daemon, store, pool) = setup(Config { confirmation_count: 100, ..Config::default() });
        found(&store, 10, "h10").await;
        found(&store, 11, "h11").await;
        daemon.once("getblock", Ok(json!({"confirmations": -1})));
        daemon.once("getblock", Ok(json!({"confirmations": 101})));

        update_confirmations(&pool).await.unwrap();

        assert_eq!(daemon.calls_to("getblock"), vec![json!(["h10"]), json!(["h11"])]);
        let orphan = store.block(10).await.unwrap().unwrap();
        assert_eq!(orphan.confirmations, -1);
        assert_eq!(orphan.reward, Decimal::ZERO);
        assert_eq!(store.rewards(10).await.unwrap()[0].reward, Decimal::ZERO);
        assert_eq!(store.wallet("alice").await.unwrap().unwrap().balance, dec!(9.8));
    }

    #[tokio::test]
    async fn test_unknown_block_hash_is_resolved_by_height() {
        let (daemon, store, pool) = setup(Config::default());
        found(&store, 12, "header-hash").await;
        daemon.once("getblock", Err(RpcError::Remote { code: -5, message: "Block not found".into() }));
        daemon.always("getblockhash", Ok(json!("block-id")));
        daemon.always("getblock", Ok(json!({"confirmations": 3})));

        update_confirmations(&pool).await.unwrap();

        let block = store.block(12).await.unwrap().unwrap();
        assert_eq!(block.hash.as_deref(), Some("block-id"));
        assert_eq!(block.confirmations, 3);
    }

    #[tokio::test]
    async fn test_auto_payout_then_release() {
        let (daemon, store, pool) = setup(Config { unconfirmed_tx_confirmations: 10, ..Config::default() });
        let mut wallet = Wallet::for_address("addr1");
        wallet.credit(dec!(0.5));
        store.put_wallet(wallet);
        daemon.always("sendmany", Ok(json!("tx1")));

        send_auto_payout(&pool).await.unwrap();
        assert_eq!(daemon.calls_to("sendmany")[0], json!(["", {"addr1": 0.5}]));
        let w = store.wallet("addr1").await.unwrap().unwrap();
        assert_eq!((w.balance, w.lock_balance), (Decimal::ZERO, dec!(0.5)));

        daemon.once("gettransaction", Ok(json!({"txid": "tx1", "confirmations": 4})));
        check_unconfirmed_transactions(&pool).await.unwrap();
        assert_eq!(store.wallet("addr1").await.unwrap().unwrap().lock_balance, dec!(0.5));

        daemon.once("gettransaction", Ok(json!({"txid": "tx1", "confirmations": 11, "fee": 0.0})));
        check_unconfirmed_transactions(&pool).await.unwrap();
        assert_eq!(store.wallet("addr1").await.unwrap().unwrap().lock_balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_no_payable_wallets_sends_nothing() {
        let (daemon, _store, pool) = setup(Config::default());
        send_auto_payout(&pool).await.unwrap();
        assert!(daemon.calls_to("sendmany").is_empty());
    }

    #[tokio::test]
    async fn test_shield_operations() {
        let (daemon, store, pool) = setup(Config::default());
        store
            .start_operation(&OperationRecord::executing("gone", OperationMethod::ToTransparent), None)
            .await
            .unwrap();
        daemon.always("z_shieldcoinbase", Ok(json!({"opid": "op1"})));
        daemon.always(
            "z_getoperationstatus",
            Ok(json!([{
                "id": "op1",
                "status": "success",
                "method": "z_shieldcoinbase",
                "result": {"txid": "t1"},
                "params": {"fromaddress": "*", "toaddress": "zs1", "fee": 0.0001}
            }])),
        );

        track_shield_operations(&pool, "zs1").await.unwrap();

        let done = store.operations(None, OperationStatus::Success).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].txid.as_deref(), Some("t1"));
        let failed = store.operations(None, OperationStatus::Failed).await.unwrap();
        assert_eq!(failed[0].op_id, "gone");

        let txs = store.transactions().await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].kind, TransactionKind::Shield);
        assert_eq!(txs[0].to_address, "zs1");
    }

    #[tokio::test]
    async fn test_shield_to_transparent() {
        let (daemon, store, pool) = setup(Config::default());
        daemon.always("z_gettotalbalance", Ok(json!({"transparent": "0", "private": "1.5", "total": "1.5"})));
        daemon.always("z_sendmany", Ok(json!("op-t")));

        shield_to_transparent(&pool, "zs1").await.unwrap();
        shield_to_transparent(&pool, "zs1").await.unwrap();

        assert_eq!(daemon.calls_to("z_sendmany").len(), 1);
        let txs = store.transactions().await.unwrap();
        assert_eq!(txs[0].amount, Some(dec!(1.4999)));
        assert_eq!(txs[0].op_id.as_deref(), Some("op-t"));
    }
}
