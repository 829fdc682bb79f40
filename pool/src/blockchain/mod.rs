/// Blockchain side of the pool: daemon RPC, block template and the
/// polling updater that keeps the template current.

pub mod rpc_client;
pub mod template;
pub mod updater;

pub use rpc_client::{CoinDaemon, HttpCoinDaemon, RpcError};
pub use template::{BlockTemplate, TemplateResponse};
