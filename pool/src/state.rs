/// Shared pool state
///
/// `Pool` bundles the long-lived collaborators (daemon, store, hasher)
/// with the mutable `PoolState`. Every protocol line and every updater
/// tick runs to completion while holding the state lock, so template
/// rebuilds, job issuance and share checks never interleave.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::blockchain::rpc_client::CoinDaemon;
use crate::blockchain::template::BlockTemplate;
use crate::codec::{target_for_difficulty, target_hex64};
use crate::coin::{CoinFamily, CoinProfile};
use crate::config::Config;
use crate::jobs::JobManager;
use crate::metrics::prometheus as metrics;
use crate::pplns::PplnsCalculator;
use crate::shares::hasher::ProofOfWorkHasher;
use crate::store::PoolStore;
use crate::stratum::ban::BanList;
use crate::stratum::protocol::{notification, METHOD_NOTIFY, METHOD_SET_DIFFICULTY, METHOD_SET_TARGET};

/// Outbound messages queued per connection before new ones are dropped.
pub const OUTBOUND_BACKLOG: usize = 256;

/// Queue between a session and its connection's writer task.
pub fn outbound_channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    mpsc::channel(OUTBOUND_BACKLOG)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Subscribed,
    Authorized,
}

/// One miner connection.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub peer: SocketAddr,
    pub state: SessionState,
    pub username: Option<String>,
    pub worker: Option<String>,
    pub miner_program: Option<String>,
    outbound: mpsc::Sender<String>,
}

impl Session {
    pub fn new(peer: SocketAddr, outbound: mpsc::Sender<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            peer,
            state: SessionState::Connected,
            username: None,
            worker: None,
            miner_program: None,
            outbound,
        }
    }

    /// `ip:port` as stored with worker records.
    pub fn host(&self) -> String {
        self.peer.to_string()
    }

    pub fn is_authorized(&self) -> bool {
        self.state == SessionState::Authorized
    }

    /// Queue one JSON message for the connection's writer task.
    pub fn send(&self, message: &Value) {
        tracing::debug!("📤 {} <- {}", self.peer, message);
        match self.outbound.try_send(message.to_string()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Outbound queue full for {}, dropping message", self.peer);
            }
            // a closed writer means the connection is already going away
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

pub struct PoolState {
    pub template: Arc<BlockTemplate>,
    pub jobs: JobManager,
    pub sessions: HashMap<String, Session>,
    /// Pool difficulty per username
    pub user_diffs: HashMap<String, f64>,
    /// Time left until the next Merkle-only refresh
    pub merkle_countdown_ms: i64,
}

impl PoolState {
    pub fn new(template: BlockTemplate, merkle_update_ms: u64) -> Self {
        Self {
            template: Arc::new(template),
            jobs: JobManager::new(),
            sessions: HashMap::new(),
            user_diffs: HashMap::new(),
            merkle_countdown_ms: merkle_update_ms as i64,
        }
    }

    pub fn send(&self, session_id: &str, message: &Value) {
        if let Some(session) = self.sessions.get(session_id) {
            session.send(message);
        }
    }

    pub fn difficulty_of(&self, username: &str) -> Option<f64> {
        self.user_diffs.get(username).copied()
    }

    pub fn authorized_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_authorized()).count()
    }

    /// `mining.set_target` (zcash family) or `mining.set_difficulty`.
    pub fn set_target(&self, session_id: &str) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        let Some(diff) = session.username.as_deref().and_then(|u| self.difficulty_of(u)) else {
            return;
        };
        let profile = self.template.profile();
        let message = match profile.family {
            CoinFamily::Zcash => {
                let target = target_for_difficulty(&profile.pow_limit, diff);
                notification(METHOD_SET_TARGET, json!([target_hex64(&target)]))
            }
            CoinFamily::Bitcoin => {
                notification(METHOD_SET_DIFFICULTY, json!([diff * profile.difficulty_multiplier]))
            }
        };
        session.send(&message);
    }

    /// Issue a job on the current template and push it to one session.
    pub fn notify(&mut self, session_id: &str, first: bool) {
        if first {
            self.set_target(session_id);
        }
        let job_id = self.jobs.issue_job(session_id, self.template.clone());
        match self.template.notify_params(&job_id) {
            Ok(params) => self.send(session_id, &notification(METHOD_NOTIFY, Value::Array(params))),
            Err(e) => tracing::error!("Cannot build notify for job {}: {}", job_id, e),
        }
    }

    /// Notify every authorized session, then forget the submissions of the
    /// previous job generation.
    pub fn notify_all(&mut self) {
        let ids: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.is_authorized())
            .map(|s| s.id.clone())
            .collect();
        for id in &ids {
            self.notify(id, false);
        }
        self.jobs.clear_submissions();
        metrics::inc_notify_broadcasts();
        tracing::debug!("Notified {} sessions", ids.len());
    }
}

pub struct Pool {
    pub config: Arc<Config>,
    pub profile: Arc<CoinProfile>,
    pub daemon: Arc<dyn CoinDaemon>,
    pub store: Arc<dyn PoolStore>,
    pub hasher: Arc<dyn ProofOfWorkHasher>,
    pub pplns: PplnsCalculator,
    pub bans: BanList,
    pub state: Mutex<PoolState>,
}

impl Pool {
    pub fn new(
        config: Arc<Config>,
        profile: Arc<CoinProfile>,
        daemon: Arc<dyn CoinDaemon>,
        store: Arc<dyn PoolStore>,
        hasher: Arc<dyn ProofOfWorkHasher>,
    ) -> Arc<Self> {
        let template = BlockTemplate::new(profile.clone());
        let pplns = PplnsCalculator::new(store.clone(), config.pplns_length, config.pool_fee_percent);
        Arc::new(Self {
            state: Mutex::new(PoolState::new(template, config.merkle_update_ms)),
            bans: BanList::default(),
            config,
            profile,
            daemon,
            store,
            hasher,
            pplns,
        })
    }
}
