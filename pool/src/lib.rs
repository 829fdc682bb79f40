pub mod blockchain;
pub mod codec;
pub mod coin;
pub mod coinbase;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod pplns;
pub mod shares;
pub mod state;
pub mod store;
pub mod stratum;
