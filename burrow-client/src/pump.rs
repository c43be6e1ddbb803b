//! Poll-driven client connection.
//!
//! [`NetClient`] owns no driving task. Every call to [`NetClient::pump`]
//! collects whatever socket operations finished since the last call and
//! starts the next ones:
//!
//! - unconnected with queued sends: start connecting
//! - connected with queued sends, or after a failed send: encode the whole
//!   queue as one request and start sending it
//! - connected with no receive outstanding: start a receive
//! - connected with received data: dispatch complete responses to the
//!   registered system clients, then receive again
//!
//! Socket operations run on the supplied runtime through [`SocketOp`]
//! descriptors and hand their results back over one-shot channels.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::response::Response;
use crate::system::SystemClient;
use burrow_net::{NetError, OpKind, SocketOp};
use burrow_protocol::tunnel::request_head;
use burrow_protocol::{
    Id, PacketWriter, ResponseFramer, SessionKey, TunnelResponse, WireBuffer,
};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio_util::sync::CancellationToken;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
}

/// State of the send or receive direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    InProgress,
    Failed,
    Completed,
}

/// A command queued until the next flush.
struct DeferredSend {
    system_number: u32,
    request_number: u32,
    writer: PacketWriter,
}

type ConnectResult = Result<TcpStream, NetError>;
type SendResult = (OwnedWriteHalf, Result<usize, NetError>);
type ReceiveResult = (OwnedReadHalf, Vec<u8>, Result<usize, NetError>);

/// Live socket state; dropped as a whole on disconnect.
struct Link {
    cancel: CancellationToken,
    send_op: Arc<SocketOp>,
    receive_op: Arc<SocketOp>,
    writer: Option<OwnedWriteHalf>,
    reader: Option<OwnedReadHalf>,
    send_rx: Option<oneshot::Receiver<SendResult>>,
    receive_rx: Option<oneshot::Receiver<ReceiveResult>>,
    framer: ResponseFramer,
}

/// Counters for one client.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    pub connects: u64,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub updates_applied: u64,
}

/// Poll-driven connection to a burrow server.
pub struct NetClient {
    config: ClientConfig,
    runtime: Handle,
    systems: HashMap<u32, Arc<dyn SystemClient>>,
    key: SessionKey,
    last_event_seen: Id,
    deferred: Vec<DeferredSend>,
    /// Flush even with an empty queue, to fetch state.
    state_requested: bool,
    connection: ConnectionState,
    send_state: TransferState,
    receive_state: TransferState,
    idle_pumps: u32,
    connect_cancel: Option<CancellationToken>,
    connect_rx: Option<oneshot::Receiver<ConnectResult>>,
    link: Option<Link>,
    stats: ClientStats,
}

impl NetClient {
    /// Creates an unconnected client.
    ///
    /// Fails if two system clients share a number or the configured session
    /// has no key.
    pub fn new(
        config: ClientConfig,
        system_clients: impl IntoIterator<Item = Arc<dyn SystemClient>>,
        runtime: Handle,
    ) -> Result<Self, ClientError> {
        let mut systems = HashMap::new();
        for client in system_clients {
            let number = client.number();
            if systems.insert(number, client).is_some() {
                return Err(ClientError::DuplicateSystemClient(number));
            }
        }

        let key = config
            .key_resolver
            .resolve(config.session_id)
            .ok_or(ClientError::UnknownSession(config.session_id))?;

        Ok(Self {
            config,
            runtime,
            systems,
            key,
            last_event_seen: Id::NIL,
            deferred: Vec::new(),
            state_requested: false,
            connection: ConnectionState::Unconnected,
            send_state: TransferState::Idle,
            receive_state: TransferState::Idle,
            idle_pumps: 0,
            connect_cancel: None,
            connect_rx: None,
            link: None,
            stats: ClientStats::default(),
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn send_state(&self) -> TransferState {
        self.send_state
    }

    pub fn receive_state(&self) -> TransferState {
        self.receive_state
    }

    /// Returns the number of consecutive pumps that did nothing.
    pub fn idle_pumps(&self) -> u32 {
        self.idle_pumps
    }

    /// Returns the number of queued commands.
    pub fn pending(&self) -> usize {
        self.deferred.len()
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sets the last event id reported to the server with each request.
    pub fn set_last_event_seen(&mut self, id: Id) {
        self.last_event_seen = id;
    }

    /// Queues a command for the next flush. Queue order is request order.
    pub fn schedule_send(&mut self, system_number: u32, request_number: u32, writer: PacketWriter) {
        self.deferred.push(DeferredSend {
            system_number,
            request_number,
            writer,
        });
    }

    /// Requests a flush at the next opportunity even if nothing is queued.
    /// The server answers an empty batch with its current state.
    pub fn request_state(&mut self) {
        self.state_requested = true;
    }

    fn has_work(&self) -> bool {
        self.state_requested || !self.deferred.is_empty()
    }

    /// Advances the connection by one step without blocking.
    pub fn pump(&mut self) -> Result<(), ClientError> {
        self.poll_connect()?;

        if self.connection != ConnectionState::Connected {
            if self.has_work() && self.connection != ConnectionState::Connecting {
                self.start_connect();
            }
            return Ok(());
        }

        self.poll_send()?;
        self.poll_receive()?;

        let mut did_anything = false;

        let send_ready = matches!(
            self.send_state,
            TransferState::Idle | TransferState::Completed
        ) && self.has_work();
        if send_ready {
            self.start_send()?;
            did_anything = true;
        }

        if self.receive_state == TransferState::Idle {
            self.start_receive();
        }

        if self.receive_state == TransferState::Completed {
            if self.process_received()? {
                did_anything = true;
            }
            self.start_receive();
        }

        if did_anything {
            self.idle_pumps = 0;
        } else {
            self.idle_pumps += 1;
            if self.idle_pumps >= self.config.auto_disconnect_pumps {
                tracing::debug!(
                    "Auto-disconnecting from {} after {} idle pumps",
                    self.config.addr,
                    self.idle_pumps
                );
                self.disconnect();
            }
        }

        Ok(())
    }

    /// Pumps every `interval` until a new response has been dispatched.
    pub async fn pump_until_response(
        &mut self,
        interval: Duration,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let target = self.stats.responses_received + 1;
        let deadline = tokio::time::Instant::now() + timeout;

        while self.stats.responses_received < target {
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            self.pump()?;
            if self.connection == ConnectionState::Unconnected && !self.has_work() {
                return Err(ClientError::ConnectionClosed);
            }
            tokio::time::sleep(interval).await;
        }
        Ok(())
    }

    /// Tears the connection down. Calling it again has no effect.
    pub fn disconnect(&mut self) {
        if let Some(cancel) = self.connect_cancel.take() {
            cancel.cancel();
        }
        self.connect_rx = None;

        if let Some(link) = self.link.take() {
            link.cancel.cancel();
            tracing::debug!("Disconnected from {}", self.config.addr);
        }

        self.connection = ConnectionState::Unconnected;
        self.send_state = TransferState::Idle;
        self.receive_state = TransferState::Idle;
        self.idle_pumps = 0;
    }

    fn start_connect(&mut self) {
        let addr = self.config.addr;
        let timeout = self.config.connect_timeout;
        let cancel = CancellationToken::new();
        let op = SocketOp::new(cancel.clone());
        let (tx, rx) = oneshot::channel();

        tracing::debug!("Connecting to {}...", addr);
        self.runtime.spawn(async move {
            let result = match tokio::time::timeout(timeout, op.connect(addr)).await {
                Ok(result) => result,
                Err(_) => Err(NetError::Transport {
                    op: OpKind::Connect,
                    code: None,
                    source: io::Error::from(io::ErrorKind::TimedOut),
                }),
            };
            let _ = tx.send(result);
        });

        self.connect_cancel = Some(cancel);
        self.connect_rx = Some(rx);
        self.connection = ConnectionState::Connecting;
    }

    fn poll_connect(&mut self) -> Result<(), ClientError> {
        let Some(rx) = self.connect_rx.as_mut() else {
            return Ok(());
        };

        let result = match rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return Ok(()),
            Err(TryRecvError::Closed) => Err(NetError::Cancelled {
                op: OpKind::Connect,
            }),
        };
        self.connect_rx = None;

        let cancel = self
            .connect_cancel
            .take()
            .unwrap_or_else(CancellationToken::new);
        match result {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("Failed to set TCP_NODELAY: {}", e);
                }
                let (reader, writer) = stream.into_split();
                self.link = Some(Link {
                    send_op: Arc::new(SocketOp::new(cancel.clone())),
                    receive_op: Arc::new(SocketOp::new(cancel.clone())),
                    cancel,
                    writer: Some(writer),
                    reader: Some(reader),
                    send_rx: None,
                    receive_rx: None,
                    framer: ResponseFramer::new(self.config.max_response_size),
                });
                self.connection = ConnectionState::Connected;
                self.send_state = TransferState::Idle;
                self.receive_state = TransferState::Idle;
                self.idle_pumps = 0;
                self.stats.connects += 1;
                tracing::debug!("Connected to {}", self.config.addr);
                Ok(())
            }
            Err(e) => {
                tracing::debug!("Connection to {} failed: {}", self.config.addr, e);
                self.connection = ConnectionState::Unconnected;
                Err(ClientError::Net(e))
            }
        }
    }

    /// Encodes the queued commands as one request, head included.
    fn encode_request(&mut self) -> Result<Vec<u8>, ClientError> {
        self.state_requested = false;
        let mut buf = WireBuffer::new();

        let session = buf.open_packet();
        buf.write_id(self.config.session_id);
        buf.close_packet(session)?;

        let envelope = buf.open_keyed_packet();
        buf.write_id(self.last_event_seen);
        buf.write_id(self.config.caller_id);
        buf.write_u32(self.deferred.len() as u32);
        for send in self.deferred.drain(..) {
            buf.write_u32(send.system_number);
            buf.write_u32(send.request_number);
            let payload = buf.open_packet();
            (send.writer)(&mut buf);
            buf.close_packet(payload)?;
        }
        buf.close_keyed_packet(envelope, self.key)?;
        buf.write_commit();

        let body = buf.committed();
        let head = request_head(&self.config.host, body.len());
        let mut out = Vec::with_capacity(head.len() + body.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(body);
        Ok(out)
    }

    fn start_send(&mut self) -> Result<(), ClientError> {
        let link = self.link.as_mut().ok_or(ClientError::NotConnected)?;
        let Some(mut writer) = link.writer.take() else {
            // The previous send still owns the writer.
            return Ok(());
        };

        let request = match self.encode_request() {
            Ok(request) => request,
            Err(e) => {
                if let Some(link) = self.link.as_mut() {
                    link.writer = Some(writer);
                }
                return Err(e);
            }
        };

        let link = self.link.as_mut().ok_or(ClientError::NotConnected)?;
        let op = link.send_op.clone();
        let (tx, rx) = oneshot::channel();
        self.runtime.spawn(async move {
            let result = op.send(&mut writer, &request).await;
            let _ = tx.send((writer, result));
        });

        link.send_rx = Some(rx);
        self.send_state = TransferState::InProgress;
        self.stats.requests_sent += 1;
        Ok(())
    }

    /// A failed send drops the connection. Its commands are not resent.
    fn poll_send(&mut self) -> Result<(), ClientError> {
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        let Some(rx) = link.send_rx.as_mut() else {
            return Ok(());
        };

        let outcome = match rx.try_recv() {
            Ok((writer, result)) => {
                link.writer = Some(writer);
                link.send_rx = None;
                match result {
                    Ok(n) => {
                        tracing::trace!("Sent {} bytes", n);
                        Ok(())
                    }
                    Err(e) => Err(ClientError::Net(e)),
                }
            }
            Err(TryRecvError::Empty) => return Ok(()),
            Err(TryRecvError::Closed) => Err(ClientError::ConnectionClosed),
        };

        match outcome {
            Ok(()) => {
                self.send_state = TransferState::Completed;
                Ok(())
            }
            Err(e) => {
                tracing::debug!("Send failed: {}", e);
                self.send_state = TransferState::Failed;
                self.disconnect();
                Err(e)
            }
        }
    }

    fn start_receive(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let Some(mut reader) = link.reader.take() else {
            return;
        };

        let op = link.receive_op.clone();
        let size = self.config.read_buffer_size;
        let (tx, rx) = oneshot::channel();
        self.runtime.spawn(async move {
            let mut buf = vec![0u8; size];
            let result = op.receive(&mut reader, &mut buf).await;
            let _ = tx.send((reader, buf, result));
        });

        link.receive_rx = Some(rx);
        self.receive_state = TransferState::InProgress;
    }

    fn poll_receive(&mut self) -> Result<(), ClientError> {
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        let Some(rx) = link.receive_rx.as_mut() else {
            return Ok(());
        };

        let outcome = match rx.try_recv() {
            Ok((reader, buf, result)) => {
                link.reader = Some(reader);
                link.receive_rx = None;
                match result {
                    Ok(0) => Err(ClientError::ConnectionClosed),
                    Ok(n) => {
                        link.framer.extend(&buf[..n]);
                        Ok(())
                    }
                    Err(e) => Err(ClientError::Net(e)),
                }
            }
            Err(TryRecvError::Empty) => return Ok(()),
            Err(TryRecvError::Closed) => Err(ClientError::ConnectionClosed),
        };

        match outcome {
            Ok(()) => {
                self.receive_state = TransferState::Completed;
                Ok(())
            }
            Err(e) => {
                tracing::debug!("Receive failed: {}", e);
                self.receive_state = TransferState::Failed;
                self.disconnect();
                Err(e)
            }
        }
    }

    /// Dispatches every complete response. Returns whether any was found.
    fn process_received(&mut self) -> Result<bool, ClientError> {
        let Some(link) = self.link.as_mut() else {
            return Ok(false);
        };

        let mut responses = Vec::new();
        loop {
            match link.framer.next_response() {
                Ok(Some(TunnelResponse::Ok(body))) => responses.push(body),
                Ok(Some(TunnelResponse::BadRequest)) => {
                    tracing::warn!("Server rejected request");
                    self.disconnect();
                    return Err(ClientError::BadRequest);
                }
                Ok(None) => break,
                Err(e) => {
                    self.disconnect();
                    return Err(e.into());
                }
            }
        }

        let response_key = self.key.response_key();
        let found = !responses.is_empty();
        for body in responses {
            let response = match Response::decode(body, response_key) {
                Ok(response) => response,
                Err(e) => {
                    self.disconnect();
                    return Err(e.into());
                }
            };
            self.dispatch(response);
        }
        Ok(found)
    }

    fn dispatch(&mut self, response: Response) {
        self.stats.responses_received += 1;

        for accepted in &response.accepted {
            if let Some(client) = self.systems.get(&accepted.system_number) {
                client.command_accepted(accepted.request_number, accepted.command_instance_id);
            }
        }

        for (system_number, update) in response.updates {
            match self.systems.get(&system_number) {
                Some(client) => {
                    client.apply_update(update);
                    self.stats.updates_applied += 1;
                }
                None => {
                    tracing::debug!("No client for system {}, update dropped", system_number);
                }
            }
        }
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::RecordingClient;
    use burrow_protocol::tunnel::ok_response_head;
    use burrow_protocol::{SessionKeyResolver, TunnelFramer, FramerLimits, WireReader, XorKeyResolver};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn pump_until<F>(client: &mut NetClient, mut done: F)
    where
        F: FnMut(&NetClient) -> bool,
    {
        for _ in 0..500 {
            client.pump().unwrap();
            if done(client) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    fn client(addr: std::net::SocketAddr, pumps: u32) -> (NetClient, Arc<RecordingClient>) {
        let recording = Arc::new(RecordingClient::new(1));
        let config = ClientConfig::new(addr)
            .with_session_id(Id::new(0xAA, 0x0F))
            .with_caller_id(Id::new(1, 2))
            .with_auto_disconnect_pumps(pumps);
        let client = NetClient::new(
            config,
            [recording.clone() as Arc<dyn SystemClient>],
            Handle::current(),
        )
        .unwrap();
        (client, recording)
    }

    #[tokio::test]
    async fn test_idle_without_work_stays_unconnected() {
        let (mut client, _) = client("127.0.0.1:9".parse().unwrap(), 3);
        for _ in 0..10 {
            client.pump().unwrap();
        }
        assert_eq!(client.connection_state(), ConnectionState::Unconnected);
        assert_eq!(client.stats().connects, 0);
    }

    #[tokio::test]
    async fn test_idle_pumps_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let (mut client, _) = client(addr, 3);
        client.schedule_send(1, 1, Box::new(|buf: &mut WireBuffer| buf.write_u32(5)));
        pump_until(&mut client, |c| {
            c.connection_state() == ConnectionState::Connected
        })
        .await;
        let _server_side = accept.await.unwrap();

        // The pump that connected also flushed the queue.
        assert_eq!(client.pending(), 0);
        assert_eq!(client.idle_pumps(), 0);

        client.pump().unwrap();
        client.pump().unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Connected);
        client.pump().unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Unconnected);

        client.disconnect();
        client.disconnect();
        assert_eq!(client.connection_state(), ConnectionState::Unconnected);
    }

    #[tokio::test]
    async fn test_failed_send_disconnects_without_resend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });

        let (mut client, _) = client(addr, 1000);
        client.schedule_send(1, 1, Box::new(|buf: &mut WireBuffer| buf.write_u32(5)));
        pump_until(&mut client, |c| c.send_state() == TransferState::Completed).await;

        // Stand in a send that failed on the wire.
        let link = client.link.as_mut().unwrap();
        let writer = link.writer.take().unwrap();
        let (tx, rx) = oneshot::channel();
        tx.send((
            writer,
            Err(NetError::Transport {
                op: OpKind::Send,
                code: None,
                source: io::Error::from(io::ErrorKind::BrokenPipe),
            }),
        ))
        .unwrap();
        link.send_rx = Some(rx);
        client.send_state = TransferState::InProgress;

        client.schedule_send(1, 2, Box::new(|buf: &mut WireBuffer| buf.write_u32(6)));
        let err = client.pump().unwrap_err();
        assert!(matches!(err, ClientError::Net(NetError::Transport { .. })));
        assert_eq!(client.connection_state(), ConnectionState::Unconnected);
        assert_eq!(client.stats().requests_sent, 1);
        assert_eq!(client.pending(), 1);

        // The server saw exactly the first request, then EOF.
        let received = server.await.unwrap();
        let mut framer = TunnelFramer::new(FramerLimits::default());
        framer.extend(&received);
        assert!(framer.next_message().unwrap().is_some());
        assert!(framer.next_message().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mut client, _) = client(addr, 100);
        client.schedule_send(1, 1, Box::new(|_: &mut WireBuffer| {}));

        let mut failed = false;
        for _ in 0..500 {
            if let Err(e) = client.pump() {
                assert!(matches!(e, ClientError::Net(NetError::Transport { .. })));
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(failed);
        assert_eq!(client.connection_state(), ConnectionState::Unconnected);
        assert_eq!(client.pending(), 1);
    }

    #[tokio::test]
    async fn test_request_encoding_and_update_dispatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let session_id = Id::new(0xAA, 0x0F);
        let key = XorKeyResolver.resolve(session_id).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut framer = TunnelFramer::new(FramerLimits::default());
            let mut buf = [0u8; 4096];
            let message = loop {
                let n = stream.read(&mut buf).await.unwrap();
                framer.extend(&buf[..n]);
                if let Some(message) = framer.next_message().unwrap() {
                    break message;
                }
            };

            let mut reader = WireReader::new(message.body);
            let session = reader.enter_packet().unwrap();
            assert_eq!(reader.read_id().unwrap(), session_id);
            reader.exit_packet(session).unwrap();
            let envelope = reader.enter_keyed_packet(key).unwrap();
            assert_eq!(reader.read_id().unwrap(), Id::NIL);
            assert_eq!(reader.read_id().unwrap(), Id::new(1, 2));
            assert_eq!(reader.read_u32().unwrap(), 2);
            let mut requests = Vec::new();
            for _ in 0..2 {
                assert_eq!(reader.read_u32().unwrap(), 1);
                requests.push(reader.read_u32().unwrap());
                reader.peel_packet().unwrap();
            }
            reader.exit_packet(envelope).unwrap();
            assert_eq!(requests, vec![10, 11]);

            let mut response = WireBuffer::new();
            let mark = response.open_keyed_packet();
            response.write_u32(2);
            for request in requests {
                response.write_u32(1);
                response.write_u32(request);
                response.write_id(Id::new(9, request as u64));
            }
            response.write_u32(1);
            response.write_packet(b"snapshot").unwrap();
            response.close_keyed_packet(mark, key.response_key()).unwrap();
            response.write_commit();

            let body = response.committed().to_vec();
            stream
                .write_all(ok_response_head(body.len()).as_bytes())
                .await
                .unwrap();
            stream.write_all(&body).await.unwrap();
            stream
        });

        let (mut client, recording) = client(addr, 1000);
        client.schedule_send(1, 10, Box::new(|buf: &mut WireBuffer| buf.write_u32(1)));
        client.schedule_send(1, 11, Box::new(|buf: &mut WireBuffer| buf.write_u32(2)));

        client
            .pump_until_response(Duration::from_millis(2), Duration::from_secs(5))
            .await
            .unwrap();
        let _stream = server.await.unwrap();

        assert_eq!(
            recording.accepted(),
            vec![(10, Id::new(9, 10)), (11, Id::new(9, 11))]
        );
        assert_eq!(recording.last_update().unwrap().as_ref(), b"snapshot");
        assert_eq!(client.stats().updates_applied, 1);
        assert_eq!(client.stats().requests_sent, 1);
    }

    #[tokio::test]
    async fn test_bad_request_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"400 BAD REQUEST\r\n").await.unwrap();
            stream
        });

        let (mut client, _) = client(addr, 1000);
        client.schedule_send(1, 1, Box::new(|_: &mut WireBuffer| {}));

        let mut rejected = false;
        for _ in 0..500 {
            match client.pump() {
                Ok(()) => {}
                Err(ClientError::BadRequest) => {
                    rejected = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let _stream = server.await.unwrap();
        assert!(rejected);
        assert_eq!(client.connection_state(), ConnectionState::Unconnected);
    }

    #[test]
    fn test_duplicate_system_clients_rejected() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let result = NetClient::new(
            ClientConfig::new("127.0.0.1:1".parse().unwrap()),
            [
                Arc::new(RecordingClient::new(2)) as Arc<dyn SystemClient>,
                Arc::new(RecordingClient::new(2)) as Arc<dyn SystemClient>,
            ],
            runtime.handle().clone(),
        );
        assert!(matches!(
            result,
            Err(ClientError::DuplicateSystemClient(2))
        ));
    }
}
