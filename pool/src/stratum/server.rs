/// Stratum TCP server
///
/// Accepts miner connections and runs one reader task plus one writer
/// task per connection. The reader frames newline-delimited lines and
/// hands each one to the handler; the writer drains the session's
/// outbound queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::framing::LineBuffer;
use super::handler::{ban_notice, close_session, handle_line, open_session};
use crate::state::{outbound_channel, Pool, OUTBOUND_BACKLOG};

const READ_CHUNK: usize = 4096;
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

pub struct StratumServer {
    pool: Arc<Pool>,
}

impl StratumServer {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }

    /// Bind with SO_REUSEADDR so a restart does not hit "address in use".
    pub fn bind(addr: &str) -> Result<TcpListener> {
        let sock_addr: SocketAddr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", addr, e))?;
        let domain = if sock_addr.is_ipv6() { socket2::Domain::IPV6 } else { socket2::Domain::IPV4 };
        let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket2::SockAddr::from(sock_addr))?;
        socket.listen(1024)?;
        let std_listener: std::net::TcpListener = socket.into();
        Ok(TcpListener::from_std(std_listener)?)
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    tracing::debug!("🔌 New connection from {}", peer_addr);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(socket, peer_addr).await {
                            tracing::error!("Connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Handle single miner connection
    async fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
        if let Err(e) = socket2::SockRef::from(&socket).set_tcp_keepalive(&keepalive) {
            tracing::debug!("TCP keepalive unavailable for {}: {}", peer_addr, e);
        }
        let (mut reader, mut writer) = socket.into_split();
        let (tx, mut rx) = outbound_channel();

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() || writer.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
            let _ = writer.shutdown().await;
        });

        let session_id = open_session(&self.pool, peer_addr, tx.clone()).await;
        let result = self.read_loop(&session_id, &mut reader, &tx, peer_addr).await;
        close_session(&self.pool, &session_id).await;

        // the session held the other sender; the writer finishes once the queue drains
        drop(tx);
        let _ = writer_task.await;
        result
    }

    async fn read_loop(
        &self,
        session_id: &str,
        reader: &mut tokio::net::tcp::OwnedReadHalf,
        tx: &mpsc::Sender<String>,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let mut lines = LineBuffer::new(self.pool.config.max_line_bytes);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                tracing::debug!("📥 Connection closed by client: {}", peer_addr);
                return Ok(());
            }

            if self.pool.bans.is_banned(peer_addr.ip()) {
                tracing::info!("Seems like DDoS Attack, {}", peer_addr.ip());
                let _ = tx.try_send(ban_notice().to_string());
                return Ok(());
            }

            let complete = match lines.push(&chunk[..n]) {
                Ok(complete) => complete,
                Err(e) => {
                    tracing::warn!("Closing {}: {}", peer_addr, e);
                    self.pool.bans.record_failure(peer_addr.ip());
                    return Ok(());
                }
            };
            for line in complete {
                handle_line(&self.pool, session_id, &line).await;
            }
            if tx.capacity() == 0 {
                tracing::warn!("Closing {}: outbound backlog of {} messages not drained", peer_addr, OUTBOUND_BACKLOG);
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::rpc_client::scripted::ScriptedDaemon;
    use crate::blockchain::template::tests::bitcoin_template;
    use crate::config::Config;
    use crate::state::tests::test_pool;
    use crate::store::MemoryStore;
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, BufReader};

    async fn running_server() -> (Arc<Pool>, SocketAddr) {
        let pool = test_pool(Config::default(), Arc::new(ScriptedDaemon::default()), Arc::new(MemoryStore::new()));
        pool.state.lock().await.template = Arc::new(bitcoin_template(vec![]));
        let listener = StratumServer::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(StratumServer::new(pool.clone()));
        tokio::spawn(server.serve(listener));
        (pool, addr)
    }

    #[tokio::test]
    async fn test_subscribe_over_tcp_with_split_writes() {
        let (_pool, addr) = running_server().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut read = BufReader::new(read);

        write.write_all(br#"{"id":1,"method":"mining.sub"#).await.unwrap();
        write.write_all(b"scribe\",\"params\":[\"test\"]}\n{\"id\":2,\"method\":\"web.status\"}\n").await.unwrap();

        let mut line = String::new();
        read.read_line(&mut line).await.unwrap();
        let reply: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["result"][2], json!(4));

        line.clear();
        read.read_line(&mut line).await.unwrap();
        let reply: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply, json!({"id": 2, "result": true, "error": null}));
    }

    #[tokio::test]
    async fn test_banned_peer_gets_notice_and_close() {
        let (pool, addr) = running_server().await;
        for _ in 0..51 {
            pool.bans.record_failure("127.0.0.1".parse().unwrap());
        }
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut read = BufReader::new(read);
        write.write_all(b"{\"id\":1,\"method\":\"web.status\"}\n").await.unwrap();

        let mut line = String::new();
        read.read_line(&mut line).await.unwrap();
        let reply: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["id"], json!(0));
        assert_eq!(reply["error"][0], json!(crate::stratum::ban::BAN_MESSAGE));

        line.clear();
        assert_eq!(read.read_line(&mut line).await.unwrap(), 0);
    }
}
