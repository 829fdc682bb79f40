/// Stratum request handler
///
/// One call per received line. The pool state lock is held from parsing
/// to the reply (and the first notify after a successful authorize), so a
/// line is always answered against a consistent template and job cache.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::ban::BAN_MESSAGE;
use super::protocol::*;
use crate::blockchain::rpc_client::{decimal_of, RpcError};
use crate::coin::CoinFamily;
use crate::coinbase::EXTRANONCE2_SIZE;
use crate::metrics::prometheus as metrics;
use crate::shares::processor::process_submit;
use crate::shares::validator::ShareRejection;
use crate::state::{Pool, PoolState, Session, SessionState};
use crate::store::{now_ts, WorkerRecord};

/// Worker name used when the login has no `.worker` part.
pub const DEFAULT_WORKER: &str = "default";

#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("invalid params: {0}")]
    InvalidParams(&'static str),

    #[error("daemon error: {0}")]
    Daemon(#[from] RpcError),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl RequestError {
    /// Counts toward the peer's ban threshold.
    fn is_failure(&self) -> bool {
        matches!(self, RequestError::UnknownMethod(_) | RequestError::InvalidParams(_))
    }

    fn to_response(&self, id: Value) -> StratumResponse {
        let message = match self {
            RequestError::Daemon(_) | RequestError::Store(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        StratumResponse::error(id, Value::Null, StratumResponse::error_array(20, &message))
    }
}

/// Message sent once to a banned peer before its connection is closed.
pub fn ban_notice() -> Value {
    json!({ "id": 0, "result": null, "error": [BAN_MESSAGE] })
}

/// Register a new connection and return its session id.
pub async fn open_session(pool: &Pool, peer: SocketAddr, outbound: mpsc::Sender<String>) -> String {
    let session = Session::new(peer, outbound);
    let session_id = session.id.clone();
    let mut state = pool.state.lock().await;
    state.jobs.connect(&session_id);
    state.sessions.insert(session_id.clone(), session);
    metrics::inc_connections();
    tracing::debug!("📝 Session {} opened for {}", session_id, peer);
    session_id
}

/// Forget the session and record the worker's disconnect.
pub async fn close_session(pool: &Pool, session_id: &str) {
    let mut state = pool.state.lock().await;
    state.jobs.disconnect(session_id);
    let Some(session) = state.sessions.remove(session_id) else {
        return;
    };
    metrics::dec_connections();
    metrics::set_authorized_workers(state.authorized_count());

    if let Some(username) = &session.username {
        let worker = session.worker.as_deref().unwrap_or(DEFAULT_WORKER);
        if let Err(e) = pool.store.worker_disconnected(username, worker, &session.host()).await {
            metrics::inc_store_errors();
            tracing::error!("Failed to record disconnect of {}.{}: {}", username, worker, e);
        }
    }
    tracing::info!("🔌 Disconnected {}", session.host());
}

/// Handle one complete line from the session's connection.
pub async fn handle_line(pool: &Pool, session_id: &str, line: &[u8]) {
    let mut state = pool.state.lock().await;
    let Some(peer) = state.sessions.get(session_id).map(|s| s.peer) else {
        return;
    };

    let request = match StratumRequest::parse(line) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!("json decode fail from {}: {}", peer, e);
            metrics::inc_malformed_lines();
            pool.bans.record_failure(peer.ip());
            return;
        }
    };
    tracing::debug!("📨 {} -> {}", peer, String::from_utf8_lossy(line));

    let method = request.method.clone().unwrap_or_default();
    let id = request.id.clone();
    let outcome = match method.as_str() {
        METHOD_SUBSCRIBE => subscribe(pool, &mut state, session_id, &request),
        METHOD_AUTHORIZE => authorize(pool, &mut state, session_id, &request).await,
        METHOD_EXTRANONCE_SUBSCRIBE | METHOD_STATUS => Ok(StratumResponse::success(id.clone(), json!(true))),
        METHOD_SUBMIT => Ok(submit(pool, &mut state, session_id, &request).await),
        METHOD_VALIDATE_ADDRESS => validate_address(pool, &request).await,
        METHOD_PAYOUT => payout(pool, &request).await,
        other => Err(RequestError::UnknownMethod(other.to_string())),
    };

    let response = match outcome {
        Ok(response) => response,
        Err(e) => {
            if e.is_failure() {
                pool.bans.record_failure(peer.ip());
            }
            tracing::warn!("{} from {} failed: {}", method, peer, e);
            e.to_response(id)
        }
    };

    state.send(session_id, &response.to_value());
    if method == METHOD_AUTHORIZE && response.result == Value::Bool(true) {
        state.notify(session_id, true);
    }
}

fn subscribe(
    pool: &Pool,
    state: &mut PoolState,
    session_id: &str,
    request: &StratumRequest,
) -> Result<StratumResponse, RequestError> {
    let nonce1 = state.jobs.issue_nonce(session_id);
    if let Some(session) = state.sessions.get_mut(session_id) {
        session.miner_program = request.str_param(0).map(String::from);
        if session.state == SessionState::Connected {
            session.state = SessionState::Subscribed;
        }
    }

    let result = match pool.profile.family {
        CoinFamily::Zcash => json!([session_id, nonce1]),
        CoinFamily::Bitcoin => json!([[METHOD_NOTIFY, session_id], nonce1, EXTRANONCE2_SIZE]),
    };
    Ok(StratumResponse::success(request.id.clone(), result))
}

/// `user[.worker]`; anything but exactly one dot uses the default worker.
fn split_login(login: &str) -> (&str, &str) {
    let mut parts = login.split('.');
    let username = parts.next().unwrap_or(login);
    match (parts.next(), parts.next()) {
        (Some(worker), None) if !worker.is_empty() => (username, worker),
        _ => (username, DEFAULT_WORKER),
    }
}

/// `d=<difficulty>` anywhere in the comma separated password.
fn password_difficulty(password: &str) -> Option<f64> {
    password
        .split(',')
        .filter_map(|part| part.trim().strip_prefix("d="))
        .filter_map(|d| d.parse::<f64>().ok())
        .find(|d| d.is_finite() && *d > 0.0)
}

async fn authorize(
    pool: &Pool,
    state: &mut PoolState,
    session_id: &str,
    request: &StratumRequest,
) -> Result<StratumResponse, RequestError> {
    let login = request
        .str_param(0)
        .map(str::trim)
        .ok_or(RequestError::InvalidParams("missing username"))?;
    let (username, worker) = split_login(login);
    if username.is_empty() {
        return Err(RequestError::InvalidParams("empty username"));
    }

    if !pool.store.user_exists(username).await? {
        let validation = pool.daemon.validate_address(username).await?;
        if validation.get("isvalid").and_then(Value::as_bool) == Some(true) {
            pool.store.create_address_user(username).await?;
            tracing::info!("New address user {}", username);
        } else {
            tracing::info!("Unknown user {}", login);
            return Ok(StratumResponse::success(request.id.clone(), json!(false)));
        }
    }

    let difficulty = request
        .str_param(1)
        .and_then(password_difficulty)
        .unwrap_or(pool.config.pool_difficulty);
    state.user_diffs.insert(username.to_string(), difficulty);

    let Some(session) = state.sessions.get_mut(session_id) else {
        return Ok(StratumResponse::success(request.id.clone(), json!(false)));
    };
    session.username = Some(username.to_string());
    session.worker = Some(worker.to_string());
    session.state = SessionState::Authorized;

    let record = WorkerRecord {
        username: username.to_string(),
        worker: worker.to_string(),
        host: session.host(),
        miner: session.miner_program.clone(),
        connected_at: now_ts(),
        disconnected_at: None,
    };
    if let Err(e) = pool.store.worker_connected(&record).await {
        metrics::inc_store_errors();
        tracing::error!("Failed to record worker {}: {}", login, e);
    }

    metrics::set_authorized_workers(state.authorized_count());
    tracing::info!("✅ New worker Connected {} (difficulty {})", login, difficulty);
    Ok(StratumResponse::success(request.id.clone(), json!(true)))
}

async fn submit(pool: &Pool, state: &mut PoolState, session_id: &str, request: &StratumRequest) -> StratumResponse {
    match process_submit(pool, state, session_id, request.params()).await {
        Ok(_) => StratumResponse::success(request.id.clone(), json!(true)),
        Err(rejection) => {
            if matches!(rejection, ShareRejection::InvalidParams(_)) {
                if let Some(session) = state.sessions.get(session_id) {
                    pool.bans.record_failure(session.peer.ip());
                }
            }
            rejection.to_response(request.id.clone())
        }
    }
}

async fn validate_address(pool: &Pool, request: &StratumRequest) -> Result<StratumResponse, RequestError> {
    let address = request
        .str_param(0)
        .ok_or(RequestError::InvalidParams("missing address"))?;
    let result = pool.daemon.validate_address(address).await?;
    Ok(StratumResponse::success(request.id.clone(), result))
}

/// `[address, amount, username, secret]`
async fn payout(pool: &Pool, request: &StratumRequest) -> Result<StratumResponse, RequestError> {
    let params = request.params();
    let (Some(address), Some(amount), Some(username), Some(secret)) = (
        request.str_param(0),
        params.get(1).and_then(decimal_of),
        request.str_param(2),
        request.str_param(3),
    ) else {
        return Err(RequestError::InvalidParams("expected [address, amount, username, secret]"));
    };
    let denied = || Ok(StratumResponse::success(request.id.clone(), json!(false)));

    if pool.config.payout_secret.is_empty() || secret != pool.config.payout_secret {
        tracing::warn!("Manual payout for {} with a wrong secret", username);
        return denied();
    }
    let fee = pool.config.tx_fee;
    let balance = pool
        .store
        .wallet(username)
        .await?
        .map(|w| w.balance)
        .unwrap_or(Decimal::ZERO);
    if amount <= Decimal::ZERO || balance < amount + fee {
        tracing::info!("Manual payout of {} for {} exceeds balance {}", amount, username, balance);
        return denied();
    }

    let mut send = BTreeMap::new();
    send.insert(address.to_string(), amount);
    match pool.daemon.send_many(&send).await {
        Ok(txid) => {
            pool.store
                .record_manual_payout(&txid, username, address, amount, fee)
                .await?;
            tracing::info!("Manual payout Transaction ID : {}, data {:?}", txid, send);
            Ok(StratumResponse::success(request.id.clone(), json!(txid)))
        }
        Err(e) => {
            tracing::error!("Manual payout for {} failed: {}", username, e);
            Ok(StratumResponse::error(
                request.id.clone(),
                Value::Null,
                StratumResponse::error_array(PAYOUT_FAILURE, "Make Transaction Failure"),
            ))
        }
    }
}
