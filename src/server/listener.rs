//! TCP accept loop for the NBD server.
//!
//! One logical task per accepted connection (§5 "Scheduling model"); the
//! listener itself holds the shutdown broadcast and the shared object
//! client, lease manager, and export configuration that every session binds
//! against.

use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::nbd::session::{Session, SessionContext};

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_PROBES: u32 = 6;

/// How long the listener waits for in-flight sessions to drain after a
/// shutdown signal before returning anyway (§5 "Cancellation and timeouts").
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

pub struct Listener {
    tcp: TcpListener,
    ctx: Arc<SessionContext>,
}

impl Listener {
    pub async fn bind(bind_addr: &str, ctx: Arc<SessionContext>) -> std::io::Result<Self> {
        let tcp = TcpListener::bind(bind_addr).await?;
        Ok(Self { tcp, ctx })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.tcp.local_addr()
    }

    /// Accept connections until `shutdown` is signalled, then stop
    /// accepting, tell all live sessions to close, and wait (bounded) for
    /// them to drain (§4.6).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut sessions = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("shutdown signal received, no longer accepting connections");
                        break;
                    }
                }
                accepted = self.tcp.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = configure_keepalive(&stream) {
                                log::warn!("failed to set keepalive for {peer_addr}: {e}");
                            }
                            log::info!("accepted connection from {peer_addr}");
                            let session = Session::new(
                                stream,
                                peer_addr,
                                Arc::clone(&self.ctx),
                                shutdown.clone(),
                            );
                            sessions.spawn(session.run());
                        }
                        Err(e) => log::error!("accept error: {e}"),
                    }
                }
            }
        }

        let drain = tokio::time::timeout(SHUTDOWN_DRAIN, async {
            while sessions.join_next().await.is_some() {}
        });
        if drain.await.is_err() {
            log::warn!(
                "{} session(s) did not drain within {:?}, forcing close",
                sessions.len(),
                SHUTDOWN_DRAIN
            );
            sessions.shutdown().await;
        }
    }
}

fn configure_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_PROBES);
    sock_ref.set_tcp_keepalive(&keepalive)
}
