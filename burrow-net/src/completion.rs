//! Single-shot socket operations raced against cancellation.
//!
//! A [`SocketOp`] is armed by one of [`SocketOp::accept`],
//! [`SocketOp::connect`], [`SocketOp::send`] or [`SocketOp::receive`]. The
//! returned future is the only place the result surfaces. Whichever of the
//! socket completion or the cancellation signal arrives first moves the phase
//! out of `Armed`. The loser never observes the descriptor.
//!
//! A completed descriptor can be armed again directly. Only a cancelled one
//! is spent.

use crate::error::NetError;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const IDLE: u8 = 0;
const ARMED: u8 = 1;
const COMPLETED: u8 = 2;
const CANCELLED: u8 = 3;

/// Kind of socket operation, used in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Accept,
    Connect,
    Send,
    Receive,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Accept => write!(f, "accept"),
            OpKind::Connect => write!(f, "connect"),
            OpKind::Send => write!(f, "send"),
            OpKind::Receive => write!(f, "receive"),
        }
    }
}

/// Descriptor phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Never armed, or reset.
    Idle,
    /// An operation is outstanding.
    Armed,
    /// The last operation finished, successfully or with a transport error.
    Completed,
    /// Cancellation won the race. Only a fresh descriptor can be used.
    Cancelled,
}

impl Phase {
    fn from_raw(raw: u8) -> Self {
        match raw {
            IDLE => Phase::Idle,
            ARMED => Phase::Armed,
            COMPLETED => Phase::Completed,
            _ => Phase::Cancelled,
        }
    }
}

/// Reusable descriptor for one outstanding socket operation.
#[derive(Debug)]
pub struct SocketOp {
    phase: AtomicU8,
    cancel: CancellationToken,
}

/// Marks the descriptor cancelled if the operation future is dropped while
/// still armed.
struct ArmedGuard<'a> {
    phase: &'a AtomicU8,
}

impl Drop for ArmedGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .phase
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire);
    }
}

impl SocketOp {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            phase: AtomicU8::new(IDLE),
            cancel,
        }
    }

    /// Returns the cancellation signal this descriptor races against.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn phase(&self) -> Phase {
        Phase::from_raw(self.phase.load(Ordering::Acquire))
    }

    /// Returns a completed descriptor to `Idle`.
    ///
    /// Optional: arming accepts `Completed` as well. This exists to check that
    /// a descriptor is still usable. Fails with [`NetError::Stale`] if the
    /// prior operation was cancelled mid-flight and with [`NetError::Busy`]
    /// while one is outstanding.
    pub fn reset(&self) -> Result<(), NetError> {
        match self.phase.load(Ordering::Acquire) {
            ARMED => Err(NetError::Busy),
            CANCELLED => Err(NetError::Stale),
            _ => {
                self.phase.store(IDLE, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Moves `Idle` or `Completed` to `Armed`.
    fn arm(&self) -> Result<(), NetError> {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            match current {
                ARMED => return Err(NetError::Busy),
                CANCELLED => return Err(NetError::Stale),
                _ => {}
            }
            match self.phase.compare_exchange(
                current,
                ARMED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Transitions out of `Armed`. Returns false if the other side already
    /// claimed the result.
    fn settle(&self, to: u8) -> bool {
        self.phase
            .compare_exchange(ARMED, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Arms the descriptor and runs `op` to completion or cancellation.
    pub async fn run<T, F>(&self, kind: OpKind, op: F) -> Result<T, NetError>
    where
        F: Future<Output = io::Result<T>>,
    {
        self.arm()?;
        let _guard = ArmedGuard { phase: &self.phase };

        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                self.settle(CANCELLED);
                tracing::trace!("{} cancelled", kind);
                Err(NetError::Cancelled { op: kind })
            }

            result = op => {
                if !self.settle(COMPLETED) {
                    return Err(NetError::Cancelled { op: kind });
                }
                result.map_err(|e| NetError::transport(kind, e))
            }
        }
    }

    /// Accepts one connection.
    pub async fn accept(
        &self,
        listener: &TcpListener,
    ) -> Result<(TcpStream, SocketAddr), NetError> {
        self.run(OpKind::Accept, listener.accept()).await
    }

    /// Opens a connection to `addr`.
    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, NetError> {
        self.run(OpKind::Connect, TcpStream::connect(addr)).await
    }

    /// Writes all of `data`, returning the number of bytes sent.
    pub async fn send<W>(&self, writer: &mut W, data: &[u8]) -> Result<usize, NetError>
    where
        W: AsyncWrite + Unpin,
    {
        self.run(OpKind::Send, async {
            writer.write_all(data).await?;
            Ok::<_, io::Error>(data.len())
        })
        .await
    }

    /// Reads once into `buf`. Zero means the peer closed the connection.
    pub async fn receive<R>(&self, reader: &mut R, buf: &mut [u8]) -> Result<usize, NetError>
    where
        R: AsyncRead + Unpin,
    {
        self.run(OpKind::Receive, reader.read(buf)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn test_send_and_receive_complete() {
        let (mut client, mut server) = pair().await;
        let op = SocketOp::new(CancellationToken::new());

        let sent = op.send(&mut client, b"hello").await.unwrap();
        assert_eq!(sent, 5);
        assert_eq!(op.phase(), Phase::Completed);

        let mut buf = [0u8; 16];
        let received = op.receive(&mut server, &mut buf).await.unwrap();
        assert_eq!(&buf[..received], b"hello");
    }

    #[tokio::test]
    async fn test_completed_descriptor_rearms_without_reset() {
        let (mut client, mut server) = pair().await;
        let op = SocketOp::new(CancellationToken::new());

        for round in 0..3u8 {
            op.send(&mut client, &[round]).await.unwrap();
            assert_eq!(op.phase(), Phase::Completed);
        }

        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0, 1, 2]);
    }

    #[tokio::test]
    async fn test_receive_reports_os_error_code() {
        let mut mock = tokio_test::io::Builder::new()
            .read(b"ok")
            .read_error(io::Error::from_raw_os_error(104))
            .build();
        let op = SocketOp::new(CancellationToken::new());
        let mut buf = [0u8; 8];

        assert_eq!(op.receive(&mut mock, &mut buf).await.unwrap(), 2);
        let err = op.receive(&mut mock, &mut buf).await.unwrap_err();
        assert_eq!(err.os_code(), Some(104));
        assert_eq!(op.phase(), Phase::Completed);
    }

    #[tokio::test]
    async fn test_accept_and_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let accept_op = SocketOp::new(token.clone());
        let connect_op = SocketOp::new(token);

        let (accepted, connected) =
            tokio::join!(accept_op.accept(&listener), connect_op.connect(addr));
        let (_stream, peer) = accepted.unwrap();
        let stream = connected.unwrap();
        assert_eq!(peer, stream.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_zero_byte_receive_on_close() {
        let (client, mut server) = pair().await;
        drop(client);

        let op = SocketOp::new(CancellationToken::new());
        let mut buf = [0u8; 16];
        assert_eq!(op.receive(&mut server, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_wins_pending_receive() {
        let (_client, mut server) = pair().await;
        let token = CancellationToken::new();
        let op = Arc::new(SocketOp::new(token.clone()));

        let task_op = op.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            task_op.receive(&mut server, &mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(op.phase(), Phase::Armed);
        token.cancel();

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(NetError::Cancelled {
                op: OpKind::Receive
            })
        ));
        assert_eq!(op.phase(), Phase::Cancelled);
        assert!(matches!(op.reset(), Err(NetError::Stale)));
    }

    #[tokio::test]
    async fn test_already_cancelled_never_starts() {
        let (mut client, _server) = pair().await;
        let token = CancellationToken::new();
        token.cancel();

        let op = SocketOp::new(token);
        let result = op.send(&mut client, b"data").await;
        assert!(matches!(result, Err(NetError::Cancelled { op: OpKind::Send })));
    }

    #[tokio::test]
    async fn test_arming_twice_is_busy() {
        let (_client, mut server) = pair().await;
        let (_client2, mut server2) = pair().await;
        let token = CancellationToken::new();
        let op = Arc::new(SocketOp::new(token.clone()));

        let task_op = op.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            task_op.receive(&mut server, &mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut buf = [0u8; 16];
        let second = op.receive(&mut server2, &mut buf).await;
        assert!(matches!(second, Err(NetError::Busy)));
        assert!(matches!(op.reset(), Err(NetError::Busy)));

        token.cancel();
        let _ = task.await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_error_carries_os_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let op = SocketOp::new(CancellationToken::new());
        let err = op.connect(addr).await.unwrap_err();
        assert!(matches!(
            err,
            NetError::Transport {
                op: OpKind::Connect,
                ..
            }
        ));
        assert!(err.os_code().is_some());
        assert_eq!(op.phase(), Phase::Completed);
        op.reset().unwrap();
        assert_eq!(op.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_dropped_operation_marks_cancelled() {
        let (_client, mut server) = pair().await;
        let op = SocketOp::new(CancellationToken::new());

        let mut buf = [0u8; 16];
        let result = tokio::time::timeout(
            Duration::from_millis(20),
            op.receive(&mut server, &mut buf),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(op.phase(), Phase::Cancelled);
    }
}
