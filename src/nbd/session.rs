//! Per-connection session state machine (§4.5): handshake, option
//! negotiation, and serial command dispatch against a per-session
//! [`BlockEngine`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::lease::{LeaseError, LeaseHandle, LeaseManager};
use crate::nbd::protocol::{self, CommandType, ProtocolError};
use crate::object_client::ObjectClient;
use crate::storage::{BlockEngine, StorageError};

/// A session closes itself after this many consecutive `StorageUnavailable`
/// replies in a row (§7 `StorageUnavailable`).
const MAX_CONSECUTIVE_STORAGE_FAILURES: u32 = 3;

/// Bound on the best-effort lease release attempted during teardown (§5).
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("lease error: {0}")]
    Lease(#[from] LeaseError),

    #[error("client disconnected during option negotiation")]
    Aborted,

    #[error("server is shutting down")]
    ShuttingDown,
}

/// Everything a session needs that outlives any single connection.
pub struct SessionContext {
    pub object_client: Arc<dyn ObjectClient>,
    pub lease_manager: Arc<LeaseManager>,
    pub export_size_bytes: u64,
    pub flush_parallelism: usize,
}

pub struct Session {
    stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: Arc<SessionContext>,
    shutdown: watch::Receiver<bool>,
    /// Sequence number of the next command to be handled, for logging only
    /// (§3 Session).
    seq: u64,
}

impl Session {
    pub fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        ctx: Arc<SessionContext>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            peer_addr,
            ctx,
            shutdown,
            seq: 0,
        }
    }

    pub async fn run(mut self) {
        match self.run_inner().await {
            Ok(()) => log::info!("session with {} closed cleanly", self.peer_addr),
            Err(e) => log::warn!("session with {} closed: {e}", self.peer_addr),
        }
    }

    async fn run_inner(&mut self) -> Result<(), SessionError> {
        self.handshake().await?;
        let Some((export_name, lease)) = self.negotiate_options().await? else {
            return Ok(()); // client aborted cleanly during option phase
        };

        log::info!(
            "session with {} bound to export '{export_name}' as holder {}",
            self.peer_addr,
            lease.holder_id()
        );

        let engine = BlockEngine::new(
            export_name.clone(),
            self.ctx.export_size_bytes,
            self.ctx.flush_parallelism,
            Arc::clone(&self.ctx.object_client),
        );

        let result = self.transmission_loop(&engine, &lease).await;

        // §4.5 Closing: no best-effort flush of remaining dirty data; only
        // client-issued FLUSHes are durable. Release is best-effort and
        // bounded (§5 "Cancellation and timeouts"): if it doesn't land within
        // 2s we move on, since the lease will simply expire on its own.
        let release = tokio::time::timeout(
            RELEASE_TIMEOUT,
            self.ctx.lease_manager.release(lease),
        );
        if release.await.is_err() {
            log::warn!(
                "lease release for export '{export_name}' did not complete within {RELEASE_TIMEOUT:?}, abandoning"
            );
        } else {
            log::info!("lease for export '{export_name}' released");
        }

        result
    }

    async fn handshake(&mut self) -> Result<(), SessionError> {
        self.stream
            .write_all(&protocol::encode_handshake_preface())
            .await?;
        self.stream.flush().await?;

        let mut flags_buf = [0u8; 4];
        self.stream.read_exact(&mut flags_buf).await?;
        protocol::decode_client_flags(&flags_buf)?;
        Ok(())
    }

    /// Runs the `Option` state until `NBD_OPT_GO` succeeds (returning the
    /// bound export and lease) or the client aborts/disconnects (returning
    /// `None`).
    async fn negotiate_options(
        &mut self,
    ) -> Result<Option<(String, LeaseHandle)>, SessionError> {
        loop {
            let mut header_buf = [0u8; 16];
            match self.stream.read_exact(&mut header_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            let header = protocol::decode_option_header(&header_buf)?;

            let mut data = vec![0u8; header.length as usize];
            self.stream.read_exact(&mut data).await?;

            match header.option {
                protocol::NBD_OPT_GO => {
                    let export_name = protocol::decode_go_export_name(&data)?;
                    match self.ctx.lease_manager.acquire(&export_name).await {
                        Ok(lease) => {
                            let info = protocol::encode_option_reply(
                                header.option,
                                protocol::NBD_REP_INFO,
                                &protocol::encode_info_export_payload(self.ctx.export_size_bytes),
                            );
                            let ack = protocol::encode_option_reply(
                                header.option,
                                protocol::NBD_REP_ACK,
                                &[],
                            );
                            self.stream.write_all(&info).await?;
                            self.stream.write_all(&ack).await?;
                            self.stream.flush().await?;
                            return Ok(Some((export_name, lease)));
                        }
                        Err(LeaseError::Conflict) => {
                            log::info!(
                                "export '{export_name}' busy, rejecting {}",
                                self.peer_addr
                            );
                            let reply = protocol::encode_option_reply(
                                header.option,
                                protocol::NBD_REP_ERR_POLICY,
                                &[],
                            );
                            self.stream.write_all(&reply).await?;
                            self.stream.flush().await?;
                            return Err(SessionError::Lease(LeaseError::Conflict));
                        }
                        Err(e) => {
                            let reply = protocol::encode_option_reply(
                                header.option,
                                protocol::NBD_REP_ERR_UNKNOWN,
                                &[],
                            );
                            self.stream.write_all(&reply).await?;
                            self.stream.flush().await?;
                            return Err(SessionError::Lease(e));
                        }
                    }
                }
                protocol::NBD_OPT_ABORT => {
                    let reply = protocol::encode_option_reply(
                        header.option,
                        protocol::NBD_REP_ACK,
                        &[],
                    );
                    self.stream.write_all(&reply).await?;
                    self.stream.flush().await?;
                    return Ok(None);
                }
                _ => {
                    let reply = protocol::encode_option_reply(
                        header.option,
                        protocol::NBD_REP_ERR_UNSUP,
                        &[],
                    );
                    self.stream.write_all(&reply).await?;
                    self.stream.flush().await?;
                }
            }
        }
    }

    async fn transmission_loop(
        &mut self,
        engine: &BlockEngine,
        lease: &LeaseHandle,
    ) -> Result<(), SessionError> {
        let mut consecutive_failures = 0u32;

        loop {
            if *self.shutdown.borrow() {
                return Err(SessionError::ShuttingDown);
            }

            let mut header_buf = [0u8; protocol::COMMAND_HEADER_LEN];
            let header = tokio::select! {
                biased;

                _ = lease.wait_until_lost() => {
                    log::warn!("lease lost mid-session for {}", self.peer_addr);
                    return Err(SessionError::Lease(LeaseError::Lost(
                        "heartbeat reported loss".to_string(),
                    )));
                }
                _ = self.shutdown.changed() => {
                    return Err(SessionError::ShuttingDown);
                }
                result = self.stream.read_exact(&mut header_buf) => {
                    match result {
                        Ok(_) => protocol::decode_command_header(&header_buf)?,
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                        Err(e) => return Err(e.into()),
                    }
                }
            };

            self.seq += 1;
            let seq = self.seq;

            match header.command_type() {
                Some(CommandType::Read) => {
                    self.handle_read(engine, &header, &mut consecutive_failures, seq)
                        .await?;
                }
                Some(CommandType::Write) => {
                    self.handle_write(engine, &header, &mut consecutive_failures, seq)
                        .await?;
                }
                Some(CommandType::Flush) => {
                    self.handle_flush(engine, &header, &mut consecutive_failures, seq)
                        .await?;
                }
                Some(CommandType::Disc) => {
                    log::debug!("session {} received DISC (seq {seq})", self.peer_addr);
                    return Ok(());
                }
                None => {
                    log::debug!(
                        "session {} received unsupported command type {} (seq {seq})",
                        self.peer_addr,
                        header.raw_type
                    );
                    self.send_reply(header.handle, protocol::EINVAL, None).await?;
                }
            }

            if consecutive_failures >= MAX_CONSECUTIVE_STORAGE_FAILURES {
                log::warn!(
                    "session {} closing after {consecutive_failures} consecutive storage failures",
                    self.peer_addr
                );
                return Ok(());
            }
        }
    }

    async fn send_reply(
        &mut self,
        handle: u64,
        error: u32,
        payload: Option<Bytes>,
    ) -> Result<(), SessionError> {
        self.stream
            .write_all(&protocol::encode_simple_reply(handle, error))
            .await?;
        if let Some(payload) = payload {
            self.stream.write_all(&payload).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn handle_read(
        &mut self,
        engine: &BlockEngine,
        header: &protocol::CommandHeader,
        consecutive_failures: &mut u32,
        seq: u64,
    ) -> Result<(), SessionError> {
        match engine.read(header.offset, header.length).await {
            Ok(data) => {
                *consecutive_failures = 0;
                self.send_reply(header.handle, 0, Some(data)).await
            }
            Err(StorageError::RangeError { .. }) => {
                log::debug!(
                    "session {} READ seq {seq} out of range: offset={} length={}",
                    self.peer_addr,
                    header.offset,
                    header.length
                );
                self.send_reply(header.handle, protocol::EINVAL, None).await
            }
            Err(StorageError::Unavailable(e)) => {
                *consecutive_failures += 1;
                log::warn!("session {} READ seq {seq} storage error: {e}", self.peer_addr);
                self.send_reply(header.handle, protocol::EIO, None).await
            }
        }
    }

    async fn handle_write(
        &mut self,
        engine: &BlockEngine,
        header: &protocol::CommandHeader,
        consecutive_failures: &mut u32,
        seq: u64,
    ) -> Result<(), SessionError> {
        let mut data = vec![0u8; header.length as usize];
        self.stream.read_exact(&mut data).await?;

        match engine.write(header.offset, Bytes::from(data)).await {
            Ok(()) => {
                *consecutive_failures = 0;
                self.send_reply(header.handle, 0, None).await
            }
            Err(StorageError::RangeError { .. }) => {
                log::debug!(
                    "session {} WRITE seq {seq} out of range: offset={} length={}",
                    self.peer_addr,
                    header.offset,
                    header.length
                );
                self.send_reply(header.handle, protocol::EINVAL, None).await
            }
            Err(StorageError::Unavailable(e)) => {
                *consecutive_failures += 1;
                log::warn!("session {} WRITE seq {seq} storage error: {e}", self.peer_addr);
                self.send_reply(header.handle, protocol::EIO, None).await
            }
        }
    }

    async fn handle_flush(
        &mut self,
        engine: &BlockEngine,
        header: &protocol::CommandHeader,
        consecutive_failures: &mut u32,
        seq: u64,
    ) -> Result<(), SessionError> {
        match engine.flush().await {
            Ok(()) => {
                *consecutive_failures = 0;
                self.send_reply(header.handle, 0, None).await
            }
            Err(StorageError::Unavailable(e)) => {
                *consecutive_failures += 1;
                log::warn!("session {} FLUSH seq {seq} storage error: {e}", self.peer_addr);
                self.send_reply(header.handle, protocol::EIO, None).await
            }
            Err(StorageError::RangeError { .. }) => unreachable!("flush takes no range"),
        }
    }
}
