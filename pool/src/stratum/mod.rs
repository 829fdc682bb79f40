/// Stratum line protocol: framing, request handling, bans and the TCP server.

pub mod ban;
pub mod framing;
pub mod handler;
pub mod protocol;
pub mod server;

pub use ban::BanList;
pub use protocol::{StratumRequest, StratumResponse};
pub use server::StratumServer;
