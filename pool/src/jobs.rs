/// Job Manager
///
/// Hands out per-session extranonces and per-notify job ids, and keeps a
/// bounded, insertion-ordered cache of job id -> template snapshot so that
/// late submissions can still be judged against the template they were
/// issued for.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use rand::Rng;

use crate::blockchain::template::BlockTemplate;

/// Cached jobs per connected session.
const JOBS_PER_CONNECTION: usize = 3;

/// The job counter restarts at 1 when it reaches a multiple of this.
const JOB_ID_WRAP: u64 = 0xffff;

/// (extranonce1, extranonce2, nonce, time) as submitted.
pub type Submission = (String, String, String, String);

#[derive(Debug, Default)]
pub struct JobManager {
    nonces: HashMap<String, String>,
    connections: HashSet<String>,
    counter: u64,
    jobs: HashMap<String, Arc<BlockTemplate>>,
    order: VecDeque<String>,
    submissions: HashSet<Submission>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, session_id: &str) {
        self.connections.insert(session_id.to_string());
    }

    pub fn disconnect(&mut self, session_id: &str) {
        self.connections.remove(session_id);
        self.nonces.remove(session_id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Random 4-byte extranonce1 for the session, hex encoded.
    pub fn issue_nonce(&mut self, session_id: &str) -> String {
        let nonce = format!("{:08x}", rand::thread_rng().gen::<u32>());
        self.nonces.insert(session_id.to_string(), nonce.clone());
        nonce
    }

    pub fn nonce(&self, session_id: &str) -> Option<&str> {
        self.nonces.get(session_id).map(String::as_str)
    }

    /// Bind a new job id to `template` and evict the oldest jobs beyond
    /// three per connection.
    pub fn issue_job(&mut self, session_id: &str, template: Arc<BlockTemplate>) -> String {
        self.counter += 1;
        if self.counter % JOB_ID_WRAP == 0 {
            self.counter = 1;
        }
        let job_id = format!("{:x}", self.counter);

        // a reused id replaces its old entry in place
        if self.jobs.insert(job_id.clone(), template).is_some() {
            self.order.retain(|id| id != &job_id);
        }
        self.order.push_back(job_id.clone());

        let capacity = JOBS_PER_CONNECTION * self.connections.len();
        while self.order.len() > capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.jobs.remove(&oldest);
                }
                None => break,
            }
        }
        tracing::debug!("Job {} issued to {}", job_id, session_id);
        job_id
    }

    pub fn lookup_job(&self, job_id: &str) -> Option<Arc<BlockTemplate>> {
        self.jobs.get(job_id).cloned()
    }

    pub fn cached_jobs(&self) -> usize {
        self.order.len()
    }

    /// False when the exact submission was already seen since the last notify.
    pub fn register_submission(&mut self, extranonce1: &str, extranonce2: &str, nonce: &str, time: &str) -> bool {
        self.submissions.insert((
            extranonce1.to_string(),
            extranonce2.to_string(),
            nonce.to_string(),
            time.to_string(),
        ))
    }

    pub fn clear_submissions(&mut self) {
        self.submissions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::template::tests::bitcoin_template;

    fn template() -> Arc<BlockTemplate> {
        Arc::new(bitcoin_template(vec![]))
    }

    #[test]
    fn test_nonce_is_eight_hex_chars() {
        let mut jm = JobManager::new();
        let n = jm.issue_nonce("s1");
        assert_eq!(n.len(), 8);
        assert!(hex::decode(&n).is_ok());
        assert_eq!(jm.nonce("s1"), Some(n.as_str()));
        jm.disconnect("s1");
        assert_eq!(jm.nonce("s1"), None);
    }

    #[test]
    fn test_job_ids_are_hex_counters() {
        let mut jm = JobManager::new();
        jm.connect("s1");
        assert_eq!(jm.issue_job("s1", template()), "1");
        assert_eq!(jm.issue_job("s1", template()), "2");
        assert_eq!(jm.issue_job("s1", template()), "3");
    }

    #[test]
    fn test_counter_wraps_to_one() {
        let mut jm = JobManager::new();
        jm.connect("s1");
        jm.counter = JOB_ID_WRAP - 2;
        assert_eq!(jm.issue_job("s1", template()), "fffe");
        assert_eq!(jm.issue_job("s1", template()), "1");
        assert_eq!(jm.issue_job("s1", template()), "2");
    }

    #[test]
    fn test_cache_bounded_and_oldest_first() {
        let mut jm = JobManager::new();
        jm.connect("s1");
        jm.connect("s2");
        let ids: Vec<String> = (0..10).map(|_| jm.issue_job("s1", template())).collect();
        assert_eq!(jm.cached_jobs(), 6);
        assert!(jm.lookup_job(&ids[3]).is_none());
        assert!(jm.lookup_job(&ids[4]).is_some());
        assert!(jm.lookup_job(&ids[9]).is_some());

        jm.disconnect("s2");
        jm.issue_job("s1", template());
        assert_eq!(jm.cached_jobs(), 3);
        assert!(jm.lookup_job(&ids[7]).is_none());
        assert!(jm.lookup_job(&ids[8]).is_some());
    }

    #[test]
    fn test_no_connections_caches_nothing() {
        let mut jm = JobManager::new();
        let id = jm.issue_job("s1", template());
        assert!(jm.lookup_job(&id).is_none());
    }

    #[test]
    fn test_snapshot_survives_template_change() {
        let mut jm = JobManager::new();
        jm.connect("s1");
        let mut current = template();
        let id = jm.issue_job("s1", current.clone());
        Arc::make_mut(&mut current).height += 1;
        assert_eq!(jm.lookup_job(&id).unwrap().height, 500_000);
        assert_eq!(current.height, 500_001);
    }

    #[test]
    fn test_register_submission_once_until_cleared() {
        let mut jm = JobManager::new();
        assert!(jm.register_submission("aa", "bb", "cc", "dd"));
        assert!(!jm.register_submission("aa", "bb", "cc", "dd"));
        assert!(jm.register_submission("aa", "bb", "cc", "de"));
        jm.clear_submissions();
        assert!(jm.register_submission("aa", "bb", "cc", "dd"));
    }
}
