//! Per-connection request processing.
//!
//! A connection carries a sequence of keep-alive requests. Each one is framed,
//! authenticated, fully decoded, and then dispatched:
//!
//! 1. `packet{session id}` selects the session key.
//! 2. A keyed packet validated with that key holds the last event id seen,
//!    the caller id and the command batch.
//! 3. Every command's system is resolved before any handler runs, so a batch
//!    naming an unknown system is rejected without side effects.
//! 4. Handlers run concurrently and are all joined. A failed handler is
//!    logged; its siblings are neither cancelled nor rolled back.
//! 5. Every registered system is asked for a state snapshot concurrently;
//!    non-empty snapshots are appended under the response lock.
//! 6. The response packet is closed with the complemented key and sent
//!    behind a `200 OK` head.

use crate::config::LimitsConfig;
use crate::error::{Rejection, ServerError};
use crate::registry::{Command, System, SystemError, SystemRegistry};
use crate::server::ServerStats;
use crate::session::{Session, SessionState};
use burrow_net::SocketOp;
use burrow_protocol::tunnel::{ok_response_head, BAD_REQUEST};
use burrow_protocol::{
    Id, IdGenerator, ProtocolError, SessionKey, SessionKeyResolver, TunnelFramer, WireBuffer,
    WireReader,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// State shared by every connection of a server.
pub struct ProcessorContext {
    pub registry: SystemRegistry,
    pub id_generator: Arc<dyn IdGenerator>,
    pub key_resolver: Arc<dyn SessionKeyResolver>,
    pub limits: LimitsConfig,
    pub idle_timeout: Option<Duration>,
    pub stats: Arc<ServerStats>,
}

impl std::fmt::Debug for ProcessorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorContext")
            .field("registry", &self.registry)
            .field("limits", &self.limits)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

/// A command whose system has been resolved but not yet dispatched.
struct PendingCommand {
    system: Arc<dyn System>,
    system_number: u32,
    request_number: u32,
    payload: WireReader,
}

/// A fully decoded request.
struct DecodedRequest {
    key: SessionKey,
    session_id: Id,
    last_event_seen: Id,
    caller_id: Id,
    commands: Vec<PendingCommand>,
}

/// Serves one connection.
pub struct RequestProcessor {
    ctx: Arc<ProcessorContext>,
    session: Session,
    framer: TunnelFramer,
    response: Arc<Mutex<WireBuffer>>,
    receive_op: SocketOp,
    send_op: SocketOp,
    cancel: CancellationToken,
}

impl RequestProcessor {
    /// Creates a processor whose socket operations stop when `cancel` fires.
    pub fn new(
        ctx: Arc<ProcessorContext>,
        remote_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Self {
        let framer = TunnelFramer::with_capacity(
            ctx.limits.framer_limits(),
            ctx.limits.receive_buffer_size,
        );
        Self {
            session: Session::new(remote_addr),
            framer,
            response: Arc::new(Mutex::new(WireBuffer::new())),
            receive_op: SocketOp::new(cancel.clone()),
            send_op: SocketOp::new(cancel.clone()),
            cancel,
            ctx,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Processes requests until the peer closes, the connection idles out,
    /// a request is rejected, or cancellation fires.
    pub async fn run<S>(&mut self, stream: S) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let addr = self.session.remote_addr;
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = vec![0u8; self.ctx.limits.receive_buffer_size];

        loop {
            if self.cancel.is_cancelled() {
                self.session.set_state(SessionState::Closing);
                return Err(ServerError::ShuttingDown);
            }

            // Drain every complete request before reading again.
            loop {
                let body = match self.framer.next_message() {
                    Ok(Some(message)) => message.body,
                    Ok(None) => break,
                    Err(e) => return self.reject(e.into(), &mut writer).await,
                };

                match self.process(body).await {
                    Ok(response) => {
                        self.send_op.send(&mut writer, &response).await?;
                    }
                    Err(e) => return self.reject(e, &mut writer).await,
                }
            }

            let n = match self.ctx.idle_timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, self.receive_op.receive(&mut reader, &mut buf))
                        .await
                    {
                        Ok(result) => result?,
                        Err(_) => {
                            tracing::debug!("[{}] Idle timeout", addr);
                            self.session.set_state(SessionState::Closing);
                            return Ok(());
                        }
                    }
                }
                None => self.receive_op.receive(&mut reader, &mut buf).await?,
            };

            if n == 0 {
                tracing::debug!("[{}] Connection closed by client", addr);
                self.session.set_state(SessionState::Closing);
                return Ok(());
            }

            tracing::trace!("[{}] Received {} bytes", addr, n);
            self.session.touch();
            self.framer.extend(&buf[..n]);
        }
    }

    /// Answers a failed request according to its rejection policy.
    async fn reject<W>(&mut self, err: ServerError, writer: &mut W) -> Result<(), ServerError>
    where
        W: AsyncWrite + Unpin,
    {
        let addr = self.session.remote_addr;
        self.session.set_state(SessionState::Closing);
        self.ctx.stats.requests_rejected.fetch_add(1, Ordering::Relaxed);

        match err.rejection() {
            Rejection::BadRequest => {
                tracing::warn!("[{}] Bad request ({}): {}", addr, err.error_code(), err);
                if let Err(e) = self.send_op.send(writer, BAD_REQUEST).await {
                    tracing::debug!("[{}] Failed to send rejection: {}", addr, e);
                }
                let _ = writer.shutdown().await;
            }
            Rejection::Silent => {
                tracing::debug!("[{}] Dropping request: {}", addr, err);
            }
            Rejection::Abort => {}
        }
        Err(err)
    }

    /// Handles one framed request body and returns the complete response.
    async fn process(&mut self, body: Bytes) -> Result<Vec<u8>, ServerError> {
        let request = self.decode(body)?;
        self.session.record_request(request.caller_id);
        self.ctx.stats.requests_total.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            "[{}] Request from caller {}: {} command(s)",
            self.session.remote_addr,
            request.caller_id,
            request.commands.len()
        );

        let mark = {
            let mut response = self.response.lock();
            response.reset();
            let mark = response.open_keyed_packet();
            response.write_u32(request.commands.len() as u32);
            mark
        };

        self.dispatch(&request).await;
        self.collect_state(request.last_event_seen, request.caller_id)
            .await;

        let body = {
            let mut response = self.response.lock();
            response.close_keyed_packet(mark, request.key.response_key())?;
            response.write_commit();
            let body = response.committed().to_vec();
            response.reset();
            body
        };

        let max = self.ctx.limits.max_response_size;
        if body.len() > max {
            return Err(ServerError::ResponseTooLarge {
                size: body.len(),
                max,
            });
        }

        let head = ok_response_head(body.len());
        let mut out = Vec::with_capacity(head.len() + body.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Authenticates and decodes a request, resolving every system.
    fn decode(&mut self, body: Bytes) -> Result<DecodedRequest, ServerError> {
        let mut reader = WireReader::new(body);

        let session_end = reader.enter_packet()?;
        let session_id = reader.read_id()?;
        reader.exit_packet(session_end)?;

        let key = self
            .session
            .key_for(session_id, self.ctx.key_resolver.as_ref())?;

        let envelope_end = reader.enter_keyed_packet(key).map_err(|e| match e {
            ProtocolError::TagMismatch { .. } => ServerError::Authentication(e.to_string()),
            other => ServerError::Protocol(other),
        })?;

        let last_event_seen = reader.read_id()?;
        let caller_id = reader.read_id()?;
        let count = reader.read_u32()?;

        let max = self.ctx.limits.max_batch_commands;
        if max > 0 && count > max {
            return Err(ServerError::BatchTooLarge { count, max });
        }

        // Every command needs at least its two numbers and a length prefix.
        let min_size = 12usize.saturating_mul(count as usize);
        if min_size > reader.remaining() {
            return Err(ProtocolError::Truncated {
                needed: min_size,
                available: reader.remaining(),
            }
            .into());
        }

        let mut commands = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let system_number = reader.read_u32()?;
            let request_number = reader.read_u32()?;
            let system = self.ctx.registry.resolve(system_number)?;
            let payload = reader.peel_packet()?;
            commands.push(PendingCommand {
                system,
                system_number,
                request_number,
                payload,
            });
        }

        reader.exit_packet(envelope_end)?;
        reader.read_commit();

        Ok(DecodedRequest {
            key,
            session_id,
            last_event_seen,
            caller_id,
            commands,
        })
    }

    /// Issues command-instance ids, echoes them into the response, and runs
    /// every handler to completion.
    async fn dispatch(&self, request: &DecodedRequest) {
        let mut handlers = JoinSet::new();

        for pending in &request.commands {
            let command_instance_id = self.ctx.id_generator.next_id();
            {
                let mut response = self.response.lock();
                response.write_u32(pending.system_number);
                response.write_u32(pending.request_number);
                response.write_id(command_instance_id);
            }

            let system = pending.system.clone();
            let system_number = pending.system_number;
            let command = Command {
                caller_id: request.caller_id,
                session_id: request.session_id,
                command_instance_id,
                request_number: pending.request_number,
                payload: pending.payload.clone(),
                cancel: self.cancel.clone(),
            };
            handlers.spawn(async move {
                let result = system.process_command(command).await;
                (system_number, command_instance_id, result)
            });
        }

        while let Some(joined) = handlers.join_next().await {
            match joined {
                Ok((_, _, Ok(()))) => {}
                Ok((number, id, Err(e))) => {
                    self.ctx.stats.commands_failed.fetch_add(1, Ordering::Relaxed);
                    let err = ServerError::System { number, source: e };
                    tracing::warn!(
                        "[{}] Command {} failed: {}",
                        self.session.remote_addr,
                        id,
                        err
                    );
                }
                Err(e) => {
                    self.ctx.stats.commands_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "[{}] Command handler aborted: {}",
                        self.session.remote_addr,
                        e
                    );
                }
            }
        }
    }

    /// Asks every system for its state and appends the non-empty snapshots.
    async fn collect_state(&self, last_event_seen: Id, caller_id: Id) {
        let mut writers = JoinSet::new();

        for (number, system) in self.ctx.registry.iter() {
            let system = system.clone();
            let response = self.response.clone();
            writers.spawn(async move {
                let writer = match system.state_writer(last_event_seen, caller_id).await {
                    Ok(Some(writer)) => writer,
                    Ok(None) => return Ok(()),
                    Err(e) => return Err((number, e)),
                };

                // A writer that panics only loses its own block.
                let mut block = WireBuffer::new();
                writer(&mut block);
                block.write_commit();

                let mut response = response.lock();
                let start = response.write_position();
                response.write_u32(number);
                response.write_packet(block.committed()).map_err(|e| {
                    response.truncate(start);
                    (number, SystemError::Payload(e))
                })
            });
        }

        while let Some(joined) = writers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err((number, source))) => {
                    let err = ServerError::System { number, source };
                    tracing::warn!(
                        "[{}] State snapshot skipped: {}",
                        self.session.remote_addr,
                        err
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "[{}] State writer aborted: {}",
                        self.session.remote_addr,
                        e
                    );
                }
            }
        }
    }
}
