/// Share Processing Pipeline
///
/// Complete flow for one `mining.submit`:
/// 1. Resolve the session, its extranonce1 and the job's template snapshot
/// 2. Rebuild the candidate and compute its share difficulty
/// 3. Reject low difficulty (recorded) and duplicate (not recorded) shares
/// 4. At 99% of the network difficulty, submit the block; a null daemon
///    result is the only success, anything else fails closed
/// 5. Record the share; on a found block refresh the template at once and
///    run the PPLNS split

use serde_json::Value;

use super::validator::{build_candidate, ShareRejection, Submission, BLOCK_CANDIDATE_RATIO};
use crate::blockchain::updater;
use crate::metrics::prometheus as metrics;
use crate::state::{Pool, PoolState, SessionState};
use crate::store::{now_ts, ShareRecord};

/// An accepted share; `block_hash` is set when it found a block.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedShare {
    pub share_difficulty: f64,
    pub block_hash: Option<String>,
}

pub async fn process_submit(
    pool: &Pool,
    state: &mut PoolState,
    session_id: &str,
    params: &[Value],
) -> Result<AcceptedShare, ShareRejection> {
    let session = state.sessions.get(session_id).ok_or(ShareRejection::NotSubscribed)?;
    let username = match (session.state, session.username.as_ref()) {
        (SessionState::Connected, _) => return Err(ShareRejection::NotSubscribed),
        (SessionState::Authorized, Some(username)) => username.clone(),
        _ => return Err(ShareRejection::Unauthorized),
    };
    let session_worker = session.worker.clone();

    let sub = Submission::parse(pool.profile.family, params)?;
    let worker = sub.worker_name().map(String::from).or(session_worker);
    let extranonce1 = state
        .jobs
        .nonce(session_id)
        .ok_or(ShareRejection::NotSubscribed)?
        .to_string();

    let Some(template) = state.jobs.lookup_job(&sub.job_id) else {
        tracing::info!("rejected share, worker: {}, reason: job {} not found", sub.worker, sub.job_id);
        return Err(ShareRejection::JobNotFound);
    };

    let candidate = build_candidate(&template, pool.hasher.as_ref(), &extranonce1, &sub).map_err(|e| {
        tracing::info!("rejected share, worker: {}, reason: {}", sub.worker, e);
        e
    })?;
    let share_diff = candidate.share_difficulty;
    tracing::debug!("share diff: {:.8}", share_diff);

    let pool_diff = state.difficulty_of(&username).unwrap_or(pool.config.pool_difficulty);
    let record = |pool_result: bool, share_result: bool, block_hash: Option<String>| ShareRecord {
        username: username.clone(),
        worker: worker.clone(),
        pool_result,
        share_result,
        block_height: template.height,
        share_difficulty: share_diff,
        pool_difficulty: pool_diff,
        block_hash,
        created_at: now_ts(),
    };

    if share_diff < pool_diff {
        tracing::info!("rejected share, worker: {}, reason: low difficulty share", sub.worker);
        insert_share(pool, &record(false, false, None)).await;
        metrics::inc_rejected();
        metrics::inc_user_share(&username, false);
        return Err(ShareRejection::LowDifficulty(share_diff));
    }

    if !state
        .jobs
        .register_submission(&extranonce1, &sub.extranonce2, &candidate.nonce, &sub.ntime)
    {
        tracing::info!("rejected share, worker: {}, reason: duplicate share", sub.worker);
        metrics::inc_rejected();
        return Err(ShareRejection::Duplicate);
    }

    if share_diff < template.difficulty * BLOCK_CANDIDATE_RATIO {
        tracing::info!("accepted share, worker: {}, share diff: {:.8}", sub.worker, share_diff);
        insert_share(pool, &record(true, false, None)).await;
        metrics::inc_accepted();
        metrics::inc_user_share(&username, true);
        return Ok(AcceptedShare { share_difficulty: share_diff, block_hash: None });
    }

    let mut block_hash = candidate.block_hash(pool.profile.sha256d_block_id);
    tracing::info!("Try new block share, worker: {}, share diff: {}", sub.worker, share_diff);

    match pool.daemon.submit_block(&hex::encode(&candidate.block)).await {
        Ok(Value::Null) => {
            tracing::info!("🎉 Found block {} at height {}", block_hash, template.height);
            metrics::inc_blocks_found();
            metrics::inc_accepted();
            metrics::inc_user_share(&username, true);

            match updater::update_block(pool, state, Some(&block_hash)).await {
                Ok(Some(tip)) => block_hash = tip,
                Ok(None) => {}
                Err(e) => tracing::warn!("Template refresh after found block failed: {}", e),
            }

            insert_share(pool, &record(true, true, Some(block_hash.clone()))).await;
            if let Err(e) = pool
                .pplns
                .distribute(template.height, &block_hash, template.coinbase.pool_reward, &username)
                .await
            {
                metrics::inc_store_errors();
                tracing::error!("Failed to record rewards for block {}: {}", template.height, e);
            }
            Ok(AcceptedShare { share_difficulty: share_diff, block_hash: Some(block_hash) })
        }
        outcome => {
            match outcome {
                Ok(other) => tracing::error!(
                    "undefined submitblock result {}, block hash {}, coinbase tx {}",
                    other,
                    block_hash,
                    hex::encode(&template.coinbase.bytes)
                ),
                Err(e) => tracing::error!("submitblock failed for {}: {}", block_hash, e),
            }
            tracing::error!("Header: {}", hex::encode(&candidate.pow_input));
            metrics::inc_block_submit_rejected();
            metrics::inc_rejected();
            insert_share(pool, &record(false, false, None)).await;
            Err(ShareRejection::InvalidSolution)
        }
    }
}

async fn insert_share(pool: &Pool, share: &ShareRecord) {
    if let Err(e) = pool.store.insert_share(share).await {
        metrics::inc_store_errors();
        tracing::error!("Failed to store share of {}: {}", share.username, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::store::PoolStore;

    use num_bigint::BigUint;
    use serde_json::json;

    use crate::blockchain::rpc_client::scripted::ScriptedDaemon;
    use crate::blockchain::template::tests::bitcoin_template;
    use crate::codec::ser_uint256;
    use crate::coin::tests::bitcoin_config;
    use crate::coin::CoinProfile;
    use crate::config::Config;
    use crate::shares::hasher::ProofOfWorkHasher;
    use crate::state::tests::authorized_session;
    use crate::store::MemoryStore;

    struct Fixed([u8; 32]);

    impl ProofOfWorkHasher for Fixed {
        fn hash(&self, _data: &[u8]) -> [u8; 32] {
            self.0
        }
    }

    /// Pool whose hasher always yields share difficulty `share_diff`.
    fn pool_at(share_diff: u32) -> (Arc<Pool>, Arc<ScriptedDaemon>, Arc<MemoryStore>) {
        let config = Config { coin: bitcoin_config(), pool_difficulty: 1.0, ..Config::default() };
        let profile = Arc::new(CoinProfile::resolve(&config.coin).unwrap());
        let digest = ser_uint256(&(&profile.pow_limit / BigUint::from(share_diff)));
        let daemon = Arc::new(ScriptedDaemon::default());
        let store = Arc::new(MemoryStore::new());
        let pool = Pool::new(Arc::new(config), profile, daemon.clone(), store.clone(), Arc::new(Fixed(digest)));
        (pool, daemon, store)
    }

    fn submit_params(job_id: &str, extranonce2: &str) -> Vec<Value> {
        vec![json!("alice.rig"), json!(job_id), json!(extranonce2), json!("5f5e1000"), json!("00000000")]
    }

    #[tokio::test]
    async fn test_accepted_share_then_duplicate() {
        let (pool, daemon, store) = pool_at(8);
        let mut state = pool.state.lock().await;
        let mut template = bitcoin_template(vec![]);
        template.difficulty = 1000.0;
        state.template = Arc::new(template);
        let (sid, _rx) = authorized_session(&mut state, "alice");
        state.notify(&sid, false);

        let accepted = process_submit(&pool, &mut state, &sid, &submit_params("1", "00000001")).await.unwrap();
        assert_eq!(accepted.block_hash, None);
        assert!((accepted.share_difficulty - 8.0).abs() < 1e-9);

        let dup = process_submit(&pool, &mut state, &sid, &submit_params("1", "00000001")).await;
        assert_eq!(dup, Err(ShareRejection::Duplicate));

        // duplicates are not recorded
        let shares = store.shares();
        assert_eq!(shares.len(), 1);
        assert!(shares[0].pool_result);
        assert_eq!(shares[0].worker.as_deref(), Some("rig"));
        assert!(daemon.calls_to("submitblock").is_empty());
    }

    #[tokio::test]
    async fn test_non_null_submitblock_result_fails_closed() {
        let (pool, daemon, store) = pool_at(4);
        daemon.always("submitblock", Ok(json!("high-hash")));
        let mut state = pool.state.lock().await;
        state.template = Arc::new(bitcoin_template(vec![]));
        let (sid, _rx) = authorized_session(&mut state, "alice");
        state.notify(&sid, false);

        let outcome = process_submit(&pool, &mut state, &sid, &submit_params("1", "00000002")).await;
        assert_eq!(outcome, Err(ShareRejection::InvalidSolution));
        assert_eq!(daemon.calls_to("submitblock").len(), 1);
        assert!(daemon.calls_to("getblocktemplate").is_empty());

        let shares = store.shares();
        assert_eq!(shares.len(), 1);
        assert!(!shares[0].pool_result);
        assert!(store.block(500_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submit_before_subscribe() {
        let (pool, _daemon, _store) = pool_at(4);
        let mut state = pool.state.lock().await;
        let outcome = process_submit(&pool, &mut state, "missing", &submit_params("1", "00000003")).await;
        assert_eq!(outcome, Err(ShareRejection::NotSubscribed));
    }
}
