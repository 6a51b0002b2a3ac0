use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::connection::{Connection, ConnectionId};
use crate::error::HubError;
use crate::protocol::Message;

#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Requests that may queue up in front of the hub loop.
    pub command_capacity: usize,
    /// How long a broadcast waits on one connection's full send queue.
    pub send_timeout: Duration,
    /// How long a submitter waits on the hub's full request queue.
    pub submit_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: 256,
            send_timeout: Duration::from_secs(2),
            submit_timeout: Duration::from_secs(5),
        }
    }
}

pub enum HubCommand {
    Register(Arc<Connection>),
    Unregister(Arc<Connection>),
    Broadcast(Message),
    Members(oneshot::Sender<Vec<ConnectionId>>),
    Shutdown,
}

/// The live connection set. Owned by the hub task; nothing else touches it.
pub struct Registry {
    clients: HashMap<ConnectionId, Arc<Connection>>,
    config: HubConfig,
}

impl Registry {
    pub fn new(config: HubConfig) -> Self {
        Self {
            clients: HashMap::new(),
            config,
        }
    }

    /// A second registration under a live identity replaces the old
    /// connection and closes it. Registering the same connection again is a
    /// no-op.
    pub fn register(&mut self, conn: Arc<Connection>) {
        let id = conn.id().clone();
        let serial = conn.serial();
        if let Some(old) = self.clients.insert(id.clone(), conn) {
            if old.serial() == serial {
                return;
            }
            old.close();
            tracing::warn!(conn = %id, old_serial = old.serial(), "replaced duplicate registration");
        }
        tracing::info!(conn = %id, total = self.clients.len(), "+client");
    }

    /// Removes `conn` if it is the registered connection for its identity and
    /// closes it either way. Unknown or stale connections are a no-op for the
    /// registry.
    pub fn unregister(&mut self, conn: &Connection) {
        let current = self
            .clients
            .get(conn.id())
            .is_some_and(|registered| registered.is_same(conn));
        if current {
            self.clients.remove(conn.id());
            tracing::info!(conn = %conn.id(), total = self.clients.len(), "-client");
        }
        conn.close();
    }

    /// Delivers `msg` to every member and prunes those whose send failed.
    ///
    /// Sends run concurrently, each bounded by the configured send timeout, so
    /// one slow client costs at most one timeout per broadcast.
    pub async fn broadcast(&mut self, msg: Message) {
        let deadline = self.config.send_timeout;
        let members: Vec<Arc<Connection>> = self.clients.values().cloned().collect();

        let results = join_all(members.iter().map(|conn| {
            let msg = msg.clone();
            async move { conn.send(msg, deadline).await }
        }))
        .await;

        for (conn, result) in members.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(conn = %conn.id(), error = %e, "dropping client after failed send");
                self.unregister(conn);
            }
        }
    }

    pub fn members(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.clients.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn close_all(&mut self) {
        for (_, conn) in self.clients.drain() {
            conn.close();
        }
    }
}

/// run_hub serializes every registry change and broadcast.
/// It must be spawned as a tokio task and returns after `Shutdown` or once
/// every `HubHandle` is dropped, closing all remaining connections.
pub async fn run_hub(mut rx: mpsc::Receiver<HubCommand>, config: HubConfig) {
    let mut registry = Registry::new(config);

    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::Register(conn) => registry.register(conn),
            HubCommand::Unregister(conn) => registry.unregister(&conn),
            HubCommand::Broadcast(msg) => registry.broadcast(msg).await,
            HubCommand::Members(reply) => {
                reply.send(registry.members()).ok();
            }
            HubCommand::Shutdown => break,
        }
    }

    // Anything still queued will never be served.
    rx.close();
    while let Some(cmd) = rx.recv().await {
        if let HubCommand::Register(conn) | HubCommand::Unregister(conn) = cmd {
            conn.close();
        }
    }

    tracing::info!(remaining = registry.len(), "hub stopped");
    registry.close_all();
}

/// Cloneable submission side of the hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    submit_timeout: Duration,
}

impl HubHandle {
    pub fn new(tx: mpsc::Sender<HubCommand>, submit_timeout: Duration) -> Self {
        Self { tx, submit_timeout }
    }

    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        self.submit(HubCommand::Register(conn)).await
    }

    /// Waits for queue space without a deadline, so a busy hub never leaves a
    /// departed connection registered. Fails only once the hub has stopped.
    pub async fn unregister(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        self.tx
            .send(HubCommand::Unregister(conn))
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Fire-and-forget: delivery failures are handled inside the hub.
    pub async fn broadcast(&self, msg: Message) -> Result<(), HubError> {
        self.submit(HubCommand::Broadcast(msg)).await
    }

    /// Identities registered at the moment the hub handles this request.
    pub async fn members(&self) -> Result<Vec<ConnectionId>, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(HubCommand::Members(reply_tx)).await?;
        reply_rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn shutdown(&self) -> Result<(), HubError> {
        self.submit(HubCommand::Shutdown).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn submit(&self, cmd: HubCommand) -> Result<(), HubError> {
        match self.tx.send_timeout(cmd, self.submit_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(HubError::Busy(self.submit_timeout)),
            Err(SendTimeoutError::Closed(_)) => Err(HubError::Closed),
        }
    }
}

/// Spawn the hub loop on the current runtime. A zero queue capacity is
/// raised to one.
pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
    let handle = HubHandle::new(tx, config.submit_timeout);
    let task = tokio::spawn(run_hub(rx, config));
    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::Rng;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn config() -> HubConfig {
        HubConfig {
            send_timeout: Duration::from_millis(50),
            ..HubConfig::default()
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn register_adds_member() {
        let mut reg = Registry::new(config());
        let (a, _ra) = Connection::channel("a", 8);
        reg.register(a.clone());

        assert!(reg.contains(a.id()));
        assert_eq!(reg.len(), 1);
        assert!(!a.is_closed());
    }

    #[test]
    fn registering_same_connection_twice_keeps_it_open() {
        let mut reg = Registry::new(config());
        let (a, _ra) = Connection::channel("a", 8);
        reg.register(a.clone());
        reg.register(a.clone());

        assert_eq!(reg.len(), 1);
        assert!(!a.is_closed());
    }

    #[test]
    fn unregister_is_idempotent() {
        let mut reg = Registry::new(config());
        let (a, _ra) = Connection::channel("a", 8);
        let (b, _rb) = Connection::channel("b", 8);
        reg.register(a.clone());
        reg.register(b.clone());

        reg.unregister(&a);
        let after_once = reg.members();
        reg.unregister(&a);

        assert_eq!(reg.members(), after_once);
        assert_eq!(reg.members(), vec![ConnectionId::from("b")]);
        assert!(a.is_closed());
        assert!(!b.is_closed());
    }

    #[test]
    fn unregister_of_unknown_connection_only_closes_it() {
        let mut reg = Registry::new(config());
        let (a, _ra) = Connection::channel("a", 8);
        let (stranger, _rs) = Connection::channel("x", 8);
        reg.register(a.clone());

        reg.unregister(&stranger);

        assert_eq!(reg.len(), 1);
        assert!(stranger.is_closed());
    }

    #[test]
    fn duplicate_register_replaces_and_closes_old() {
        let mut reg = Registry::new(config());
        let (old, _ro) = Connection::channel("a", 8);
        let (new, _rn) = Connection::channel("a", 8);
        reg.register(old.clone());
        reg.register(new.clone());

        assert_eq!(reg.len(), 1);
        assert!(old.is_closed());
        assert!(!new.is_closed());

        // the old connection's late unregister must not evict its successor
        reg.unregister(&old);
        assert!(reg.contains(new.id()));
        assert!(!new.is_closed());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_member_once() {
        let mut reg = Registry::new(config());
        let mut receivers = Vec::new();
        for id in ["a", "b", "c", "d"] {
            let (conn, rx) = Connection::channel(id, 8);
            reg.register(conn);
            receivers.push(rx);
        }

        let msg = Message::new("chat", "hello").with_sender("a");
        reg.broadcast(msg.clone()).await;

        for rx in &mut receivers {
            assert_eq!(drain(rx), vec![msg.clone()]);
        }
        assert_eq!(reg.len(), 4);
    }

    #[tokio::test]
    async fn failed_send_prunes_and_closes() {
        let mut reg = Registry::new(config());
        let (a, mut ra) = Connection::channel("a", 8);
        let (b, rb) = Connection::channel("b", 8);
        reg.register(a.clone());
        reg.register(b.clone());
        drop(rb);

        reg.broadcast(Message::new("chat", "x")).await;

        assert_eq!(reg.members(), vec![ConnectionId::from("a")]);
        assert!(b.is_closed());
        assert!(!a.is_closed());
        assert_eq!(drain(&mut ra).len(), 1);
    }

    #[tokio::test]
    async fn slow_consumer_is_pruned_after_deadline() {
        let mut reg = Registry::new(config());
        let (fast, mut rf) = Connection::channel("fast", 8);
        let (slow, _rs) = Connection::channel("slow", 1);
        reg.register(fast);
        reg.register(slow.clone());

        reg.broadcast(Message::new("chat", "1")).await;
        let started = tokio::time::Instant::now();
        reg.broadcast(Message::new("chat", "2")).await;

        assert!(started.elapsed() < WAIT);
        assert!(slow.is_closed());
        assert_eq!(reg.members(), vec![ConnectionId::from("fast")]);
        assert_eq!(drain(&mut rf).len(), 2);
    }

    #[tokio::test]
    async fn absent_member_never_receives() {
        let mut reg = Registry::new(config());
        let (a, mut ra) = Connection::channel("a", 8);
        let (b, mut rb) = Connection::channel("b", 8);
        reg.register(a.clone());
        reg.register(b.clone());

        reg.broadcast(Message::new("chat", "first")).await;
        reg.unregister(&b);
        reg.broadcast(Message::new("chat", "second")).await;

        assert_eq!(drain(&mut ra).len(), 2);
        assert_eq!(drain(&mut rb), vec![Message::new("chat", "first")]);
    }

    #[tokio::test]
    async fn chat_scenario_with_failing_member() {
        let mut reg = Registry::new(config());
        let (a, mut ra) = Connection::channel("A", 8);
        let (b, mut rb) = Connection::channel("B", 8);
        let (c, mut rc) = Connection::channel("C", 8);
        for conn in [&a, &b, &c] {
            reg.register(conn.clone());
        }

        let hi = Message::new("chat", "hi").with_sender("A");
        reg.broadcast(hi.clone()).await;
        assert_eq!(drain(&mut ra), vec![hi.clone()]);
        assert_eq!(drain(&mut rc), vec![hi.clone()]);

        // B's transport dies before the next send
        assert_eq!(drain(&mut rb), vec![hi]);
        drop(rb);

        let bye = Message::new("chat", "bye").with_sender("C");
        reg.broadcast(bye.clone()).await;
        assert_eq!(drain(&mut ra), vec![bye.clone()]);
        assert_eq!(drain(&mut rc), vec![bye]);
        assert!(!reg.contains(b.id()));
        assert!(b.is_closed());

        reg.broadcast(Message::new("chat", "third")).await;
        assert_eq!(reg.members(), vec![ConnectionId::from("A"), ConnectionId::from("C")]);
    }

    #[tokio::test]
    async fn handle_serializes_requests_from_one_submitter() {
        let (hub, _task) = spawn(config());
        let (a, mut ra) = Connection::channel("a", 8);

        hub.register(a.clone()).await.unwrap();
        hub.broadcast(Message::new("chat", "1")).await.unwrap();
        hub.broadcast(Message::new("chat", "2")).await.unwrap();
        hub.unregister(a.clone()).await.unwrap();

        // members() is answered after everything queued before it
        assert!(hub.members().await.unwrap().is_empty());
        assert_eq!(
            drain(&mut ra),
            vec![Message::new("chat", "1"), Message::new("chat", "2")]
        );
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn shutdown_closes_every_connection() {
        let (hub, task) = spawn(config());
        let (a, _ra) = Connection::channel("a", 8);
        let (b, _rb) = Connection::channel("b", 8);
        hub.register(a.clone()).await.unwrap();
        hub.register(b.clone()).await.unwrap();

        hub.shutdown().await.unwrap();
        timeout(WAIT, task).await.unwrap().unwrap();

        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(
            hub.broadcast(Message::new("chat", "late")).await,
            Err(HubError::Closed)
        );
        assert_eq!(hub.members().await, Err(HubError::Closed));
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_hub() {
        let (hub, task) = spawn(config());
        let (a, _ra) = Connection::channel("a", 8);
        hub.register(a.clone()).await.unwrap();

        drop(hub);
        timeout(WAIT, task).await.unwrap().unwrap();
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn full_queue_reports_busy() {
        let (tx, _rx) = mpsc::channel(1);
        let hub = HubHandle::new(tx, Duration::from_millis(20));

        hub.broadcast(Message::new("chat", "1")).await.unwrap();
        assert_eq!(
            hub.broadcast(Message::new("chat", "2")).await,
            Err(HubError::Busy(Duration::from_millis(20)))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_clients_leave_consistent_registry() {
        const CLIENTS: usize = 64;

        let (hub, _task) = spawn(config());
        let mut tasks = Vec::new();

        for i in 0..CLIENTS {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                let (conn, mut rx) = Connection::channel(format!("client-{i}"), 1024);
                hub.register(conn.clone()).await.unwrap();

                let sends = rand::thread_rng().gen_range(1..8);
                for n in 0..sends {
                    let msg = Message::new("chat", n.to_string()).with_sender(conn.id().as_str());
                    hub.broadcast(msg).await.unwrap();
                    while rx.try_recv().is_ok() {}
                }

                // odd clients leave, even clients stay
                if i % 2 == 1 {
                    hub.unregister(conn.clone()).await.unwrap();
                }
                (conn, rx)
            }));
        }

        let mut clients = Vec::new();
        for t in tasks {
            clients.push(t.await.unwrap());
        }

        let members = hub.members().await.unwrap();
        assert_eq!(members.len(), CLIENTS / 2);

        // One copy per registered member, none for those that left.
        hub.broadcast(Message::system("final", "")).await.unwrap();
        hub.members().await.unwrap();

        for (i, (conn, rx)) in clients.iter_mut().enumerate() {
            let stays = i % 2 == 0;
            assert_eq!(members.contains(conn.id()), stays);
            assert_eq!(conn.is_closed(), !stays);

            let finals = drain(rx).iter().filter(|m| m.kind() == "final").count();
            assert_eq!(finals, usize::from(stays), "{}", conn.id());
        }
    }

    #[tokio::test]
    async fn unregister_waits_out_a_busy_hub() {
        let (tx, rx) = mpsc::channel(1);
        let hub = HubHandle::new(tx, Duration::from_millis(20));
        let (a, _ra) = Connection::channel("a", 8);

        // the register fills the queue before the hub loop is running
        hub.register(a.clone()).await.unwrap();
        let leaving = tokio::spawn({
            let hub = hub.clone();
            let a = a.clone();
            async move { hub.unregister(a).await }
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!leaving.is_finished());

        tokio::spawn(run_hub(rx, config()));
        timeout(WAIT, leaving).await.unwrap().unwrap().unwrap();

        assert!(hub.members().await.unwrap().is_empty());
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn zero_capacity_queue_is_usable() {
        let (hub, _task) = spawn(HubConfig {
            command_capacity: 0,
            ..config()
        });
        let (a, mut ra) = Connection::channel("a", 0);

        hub.register(a.clone()).await.unwrap();
        hub.broadcast(Message::new("chat", "hi")).await.unwrap();
        hub.members().await.unwrap();

        assert_eq!(drain(&mut ra), vec![Message::new("chat", "hi")]);
    }
}
