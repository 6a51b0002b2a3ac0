use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::DeliveryError;
use crate::protocol::Message;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Identity of a connection as seen by other clients (the `sender_id`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The hub-facing half of one client transport.
///
/// Writes go through a bounded queue drained by the transport's write pump.
/// Closing is a one-shot latch: the first `close` cancels the token that both
/// the write pump and the read loop select on, later calls do nothing.
pub struct Connection {
    id: ConnectionId,
    serial: u64,
    outbound: mpsc::Sender<Message>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Connection {
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Message>) -> Arc<Self> {
        Arc::new(Self {
            id,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            outbound,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Build a connection together with the receiving end of its queue.
    /// A zero capacity is raised to one.
    pub fn channel(
        id: impl Into<ConnectionId>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(id.into(), tx), rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Distinguishes two connections that share an identity.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn is_same(&self, other: &Connection) -> bool {
        self.serial == other.serial
    }

    pub async fn send(&self, msg: Message, deadline: Duration) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        match self.outbound.send_timeout(msg, deadline).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(DeliveryError::Timeout(deadline)),
            Err(SendTimeoutError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Returns true only for the call that actually closed the connection.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once `close` has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("closed", &self.is_closed())
            .finish()
    }
}
