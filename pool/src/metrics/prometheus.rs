use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use std::sync::OnceLock;

static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_FOUND: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMIT_REJECTED: OnceLock<IntCounter> = OnceLock::new();
static NOTIFY_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_UPDATES: OnceLock<IntCounter> = OnceLock::new();

static MALFORMED_LINES: OnceLock<IntCounter> = OnceLock::new();
static BANS: OnceLock<IntCounter> = OnceLock::new();
static STORE_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static AUTHORIZED_WORKERS: OnceLock<IntGauge> = OnceLock::new();
static TEMPLATE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();

// ── Per-user labeled metrics ───────────────────────────────────────
static USER_SHARES: OnceLock<IntCounterVec> = OnceLock::new();

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("static metric definition")
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("static metric definition")
}

fn accepted() -> &'static IntCounter {
    ACCEPTED.get_or_init(|| counter("shares_accepted_total", "Total accepted shares"))
}

fn rejected() -> &'static IntCounter {
    REJECTED.get_or_init(|| counter("shares_rejected_total", "Total rejected shares"))
}

fn blocks_found() -> &'static IntCounter {
    BLOCKS_FOUND.get_or_init(|| counter("blocks_found_total", "Total blocks accepted by the daemon"))
}

fn block_submit_rejected() -> &'static IntCounter {
    BLOCK_SUBMIT_REJECTED.get_or_init(|| {
        counter(
            "block_submit_rejected_total",
            "Total block candidates the daemon did not accept",
        )
    })
}

fn notify_broadcasts() -> &'static IntCounter {
    NOTIFY_BROADCASTS.get_or_init(|| counter("notify_broadcasts_total", "Total mining.notify fan-outs"))
}

fn rpc_requests() -> &'static IntCounter {
    RPC_REQUESTS.get_or_init(|| counter("rpc_requests_total", "Total RPC requests to the coin daemon"))
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS.get_or_init(|| counter("rpc_errors_total", "Total coin daemon RPC errors"))
}

fn template_updates() -> &'static IntCounter {
    TEMPLATE_UPDATES.get_or_init(|| counter("block_template_updates_total", "Total new-block template rebuilds"))
}

fn malformed_lines() -> &'static IntCounter {
    MALFORMED_LINES.get_or_init(|| counter("stratum_malformed_lines_total", "Stratum lines that failed to parse"))
}

fn bans() -> &'static IntCounter {
    BANS.get_or_init(|| counter("stratum_bans_total", "Connections refused for a temporarily banned IP"))
}

fn store_errors() -> &'static IntCounter {
    STORE_ERRORS.get_or_init(|| counter("store_errors_total", "Failed persistence calls"))
}

fn active_connections() -> &'static IntGauge {
    ACTIVE_CONNECTIONS.get_or_init(|| gauge("stratum_active_connections", "Active Stratum connections"))
}

fn authorized_workers() -> &'static IntGauge {
    AUTHORIZED_WORKERS.get_or_init(|| gauge("stratum_authorized_workers", "Authorized Stratum sessions"))
}

fn template_height() -> &'static IntGauge {
    TEMPLATE_HEIGHT.get_or_init(|| gauge("block_template_height", "Current block template height"))
}

fn user_shares() -> &'static IntCounterVec {
    USER_SHARES.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("user_shares_total", "Shares per user by outcome"),
            &["username", "status"],
        )
        .expect("static metric definition")
    })
}

pub fn inc_accepted() {
    accepted().inc();
}

pub fn inc_rejected() {
    rejected().inc();
}

pub fn inc_blocks_found() {
    blocks_found().inc();
}

pub fn inc_block_submit_rejected() {
    block_submit_rejected().inc();
}

pub fn inc_notify_broadcasts() {
    notify_broadcasts().inc();
}

pub fn inc_rpc_requests() {
    rpc_requests().inc();
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn inc_template_updates() {
    template_updates().inc();
}

pub fn inc_malformed_lines() {
    malformed_lines().inc();
}

pub fn inc_bans() {
    bans().inc();
}

pub fn inc_store_errors() {
    store_errors().inc();
}

pub fn inc_connections() {
    active_connections().inc();
}

pub fn dec_connections() {
    active_connections().dec();
}

pub fn set_authorized_workers(n: usize) {
    authorized_workers().set(n as i64);
}

pub fn set_template_height(height: u64) {
    template_height().set(height as i64);
}

pub fn inc_user_share(username: &str, valid: bool) {
    let status = if valid { "valid" } else { "invalid" };
    user_shares().with_label_values(&[username, status]).inc();
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(accepted().collect());
    mfs.extend(rejected().collect());
    mfs.extend(blocks_found().collect());
    mfs.extend(block_submit_rejected().collect());
    mfs.extend(notify_broadcasts().collect());
    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(template_updates().collect());
    mfs.extend(malformed_lines().collect());
    mfs.extend(bans().collect());
    mfs.extend(store_errors().collect());
    mfs.extend(active_connections().collect());
    mfs.extend(authorized_workers().collect());
    mfs.extend(template_height().collect());
    mfs.extend(user_shares().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        inc_accepted();
        inc_user_share("alice", true);
        set_template_height(42);
        let text = render();
        assert!(text.contains("shares_accepted_total"));
        assert!(text.contains("user_shares_total"));
        assert!(text.contains("username=\"alice\""));
        assert!(text.contains("block_template_height"));
    }
}
