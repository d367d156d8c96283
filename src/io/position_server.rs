//! Position broadcast server
//!
//! Holds exactly one "current position" slot. The control loop writes it with
//! `write_position`, which also pushes the snapshot into a bounded broadcast
//! ring that every subscriber waits on. Subscribers see every id in order; one
//! that falls more than `SUBSCRIBER_BUFFER` snapshots behind skips ahead but
//! never sees an id go backward or repeat. Writers never wait for readers.
//!
//! Protocol: newline-delimited JSON over TCP. Each request line is tagged by
//! `method`:
//! - `{"method":"registerClient","info":"..."}` -> `{"info":"Server invoke count N"}`
//! - `{"method":"subscribePositions","info":"..."}` -> one `PositionSnapshot`
//!   line per publication until either side closes the connection

use crate::domain::types::{ClientInfo, ClientSession, PositionSnapshot, PositionUpdate, ServerInfo};
use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Snapshots a subscriber may fall behind before it skips ahead
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Longest accepted request line in bytes; the rest of a longer line is discarded
pub const MAX_REQUEST_LINE: usize = 64 * 1024;

type RequestLines = FramedRead<OwnedReadHalf, LinesCodec>;

/// One request line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum Request {
    #[serde(rename = "registerClient")]
    RegisterClient(ClientInfo),
    #[serde(rename = "subscribePositions")]
    SubscribePositions(ClientInfo),
}

/// Reply to a request line that could not be parsed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

/// Resolves once shutdown is requested; never resolves if the sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn write_json_line<T: Serialize>(
    writer: &mut OwnedWriteHalf,
    value: &T,
) -> std::io::Result<()> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    writer.write_all(&buf).await
}

/// Current snapshot and the id the next publication gets
struct Slot {
    current: PositionSnapshot,
    next_id: i64,
}

pub struct PositionServer {
    /// Held only while stamping, storing and enqueueing one snapshot
    slot: Mutex<Slot>,
    updates: broadcast::Sender<PositionSnapshot>,
    invoke_count: AtomicU64,
    sessions: Mutex<FxHashMap<Uuid, ClientSession>>,
    stopped: AtomicBool,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
}

impl PositionServer {
    /// Create the server and publish the "no signal" snapshot with `start_id`
    pub fn new(start_id: i64, metrics: Arc<Metrics>, shutdown: watch::Receiver<bool>) -> Self {
        let current = PositionSnapshot::stamp(start_id, PositionUpdate::NO_SIGNAL);
        let (updates, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        metrics.record_position_published();
        info!(id = %start_id, "startup_position_published");

        Self {
            slot: Mutex::new(Slot { current, next_id: start_id + 1 }),
            updates,
            invoke_count: AtomicU64::new(0),
            sessions: Mutex::new(FxHashMap::default()),
            stopped: AtomicBool::new(false),
            shutdown,
            metrics,
        }
    }

    /// Bind the listening socket; failure here is fatal for the process
    pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }

    /// Stamp the next id and replace the current snapshot
    ///
    /// Returns the assigned id, or `None` once the server is stopped.
    pub fn write_position(&self, update: PositionUpdate) -> Option<i64> {
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }

        let snapshot = {
            let mut slot = self.slot.lock();
            let snapshot = PositionSnapshot::stamp(slot.next_id, update);
            slot.current = snapshot;
            slot.next_id += 1;
            // Fails only when nobody is subscribed
            let _ = self.updates.send(snapshot);
            snapshot
        };

        self.metrics.record_position_published();
        debug!(
            id = %snapshot.id,
            in_focus = %snapshot.in_focus,
            mid_offset = %snapshot.mid_offset,
            degrees = ?snapshot.degrees,
            mid_line_cross = %snapshot.mid_line_cross,
            "position_published"
        );
        Some(snapshot.id)
    }

    /// Snapshot currently in the slot
    pub fn current(&self) -> PositionSnapshot {
        self.slot.lock().current
    }

    /// Count the registration and describe the server
    pub fn register_client(&self, peer: &str, client: &ClientInfo) -> ServerInfo {
        let count = self.invoke_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.record_client_registered();
        info!(peer = %peer, client = %client.info, count = %count, "client_registered");
        ServerInfo { info: format!("Server invoke count {count}") }
    }

    /// Open a position stream for one subscriber
    pub fn subscribe(self: &Arc<Self>, peer: &str, client: &ClientInfo) -> Subscription {
        let session = ClientSession::new(peer, client);
        let session_id = session.id;
        {
            let mut sessions = self.sessions.lock();
            sessions.insert(session_id, session);
            self.metrics.set_subscribers_active(sessions.len());
        }
        info!(peer = %peer, client = %client.info, session = %session_id, "subscriber_connected");

        // Taken together so the ring starts right after `current`
        let (current, rx) = {
            let slot = self.slot.lock();
            (slot.current, self.updates.subscribe())
        };

        Subscription {
            server: Arc::clone(self),
            session_id,
            pending: Some(current),
            rx,
            shutdown: self.shutdown.clone(),
            last_id: None,
        }
    }

    fn release(&self, session_id: Uuid) {
        let removed = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(&session_id);
            self.metrics.set_subscribers_active(sessions.len());
            removed
        };
        if let Some(session) = removed {
            info!(peer = %session.peer, session = %session_id, "subscriber_disconnected");
        }
    }

    /// Connected subscribers, oldest first
    pub fn sessions(&self) -> Vec<ClientSession> {
        let mut sessions: Vec<ClientSession> = self.sessions.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.connected_since);
        sessions
    }

    /// Ignore further publications
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!("position_server_stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Accept connections until shutdown
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut shutdown = self.shutdown.clone();
        info!(addr = %listener.local_addr()?, "position_server_started");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_connection(socket, addr).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "position_server_accept_failed");
                        }
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("position_server_shutdown");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream, addr: SocketAddr) {
        let peer = addr.to_string();
        debug!(peer = %peer, "position_connection_accepted");

        let (reader, mut writer) = socket.into_split();
        let mut lines =
            FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_REQUEST_LINE));

        loop {
            let line = match lines.next().await {
                Some(Ok(line)) => line,
                None => break,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(peer = %peer, max = %MAX_REQUEST_LINE, "position_request_too_long");
                    let reply = ErrorReply { error: "request line too long".to_string() };
                    if write_json_line(&mut writer, &reply).await.is_err() {
                        break;
                    }
                    continue;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    debug!(peer = %peer, error = %e, "position_connection_read_failed");
                    break;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<Request>(line) {
                Ok(Request::RegisterClient(client)) => {
                    let reply = self.register_client(&peer, &client);
                    if write_json_line(&mut writer, &reply).await.is_err() {
                        break;
                    }
                }
                Ok(Request::SubscribePositions(client)) => {
                    self.stream_positions(&peer, &client, &mut lines, &mut writer).await;
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "position_request_invalid");
                    let reply = ErrorReply { error: e.to_string() };
                    if write_json_line(&mut writer, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(peer = %peer, "position_connection_closed");
    }

    /// Push snapshots until the subscriber goes away or the server shuts down
    async fn stream_positions(
        self: &Arc<Self>,
        peer: &str,
        client: &ClientInfo,
        lines: &mut RequestLines,
        writer: &mut OwnedWriteHalf,
    ) {
        let mut subscription = self.subscribe(peer, client);

        loop {
            tokio::select! {
                next = subscription.next() => {
                    let Some(snapshot) = next else {
                        break;
                    };
                    if let Err(e) = write_json_line(writer, &snapshot).await {
                        debug!(peer = %peer, error = %e, "subscriber_write_failed");
                        break;
                    }
                }
                line = lines.next() => {
                    // Input after subscribing is ignored; EOF or a read error means the peer left
                    if matches!(line, None | Some(Err(LinesCodecError::Io(_)))) {
                        break;
                    }
                }
            }
        }
    }
}

/// Stream of snapshots for one subscriber; dropping it releases the session
pub struct Subscription {
    server: Arc<PositionServer>,
    session_id: Uuid,
    /// Snapshot current at subscribe time, not yet handed out
    pending: Option<PositionSnapshot>,
    rx: broadcast::Receiver<PositionSnapshot>,
    shutdown: watch::Receiver<bool>,
    last_id: Option<i64>,
}

impl Subscription {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Next snapshot with a higher id than any returned so far
    ///
    /// The first call yields the snapshot current at subscribe time. Returns
    /// `None` once the server shuts down.
    pub async fn next(&mut self) -> Option<PositionSnapshot> {
        if *self.shutdown.borrow() {
            return None;
        }
        if let Some(snapshot) = self.pending.take() {
            self.last_id = Some(snapshot.id);
            return Some(snapshot);
        }

        loop {
            let received = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => return None,
                received = self.rx.recv() => received,
            };

            match received {
                Ok(snapshot) if self.last_id.map_or(true, |last| snapshot.id > last) => {
                    self.last_id = Some(snapshot.id);
                    return Some(snapshot);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session = %self.session_id, skipped = %skipped, "subscriber_lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.server.release(self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn update(mid_offset: i32) -> PositionUpdate {
        PositionUpdate {
            in_focus: true,
            mid_offset,
            degrees: Some(90),
            mid_line_cross: 160,
            frame_width: 400,
            middle_increment: 15,
        }
    }

    fn server(start_id: i64) -> (Arc<PositionServer>, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Arc::new(PositionServer::new(start_id, Arc::new(Metrics::new()), shutdown_rx));
        (server, shutdown_tx)
    }

    async fn next(sub: &mut Subscription) -> Option<PositionSnapshot> {
        timeout(Duration::from_secs(1), sub.next()).await.expect("subscription stalled")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscribe_while_publishing_keeps_ids_increasing() {
        let (server, _tx) = server(0);
        let running = Arc::new(AtomicBool::new(true));

        let producer = {
            let server = Arc::clone(&server);
            let running = Arc::clone(&running);
            std::thread::spawn(move || {
                let mut n = 0u32;
                while running.load(Ordering::Acquire) {
                    n = n.wrapping_add(1);
                    server.write_position(update((n % 1000) as i32));
                }
            })
        };

        let mut readers = Vec::new();
        for i in 0..4 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            let server = Arc::clone(&server);
            readers.push(tokio::spawn(async move {
                let floor = server.current().id;
                let client = ClientInfo { info: format!("reader-{i}") };
                let mut sub = server.subscribe("127.0.0.1:0", &client);

                let first = next(&mut sub).await.expect("stream ended");
                assert!(first.id >= floor, "started at {} before {floor}", first.id);
                let mut last = first.id;
                for _ in 0..500 {
                    let snapshot = next(&mut sub).await.expect("stream ended");
                    assert!(snapshot.id > last, "id {} after {last}", snapshot.id);
                    last = snapshot.id;
                }
            }));
        }

        for reader in readers {
            reader.await.unwrap();
        }
        running.store(false, Ordering::Release);
        producer.join().unwrap();
        assert!(server.current().id > 0);
    }

    #[test]
    fn test_startup_snapshot() {
        let (server, _tx) = server(0);
        assert_eq!(server.current(), PositionSnapshot::stamp(0, PositionUpdate::NO_SIGNAL));
    }

    #[test]
    fn test_ids_increase_by_one_from_start_id() {
        let (server, _tx) = server(100);
        assert_eq!(server.current().id, 100);
        assert_eq!(server.write_position(update(1)), Some(101));
        assert_eq!(server.write_position(update(2)), Some(102));
        assert_eq!(server.current().mid_offset, 2);
    }

    #[test]
    fn test_stopped_server_ignores_writes() {
        let (server, _tx) = server(0);
        server.stop();
        assert!(server.is_stopped());
        assert_eq!(server.write_position(update(1)), None);
        assert_eq!(server.current().id, 0);
    }

    #[test]
    fn test_register_client_counts() {
        let (server, _tx) = server(0);
        let client = ClientInfo { info: "robot".to_string() };
        assert_eq!(server.register_client("peer", &client).info, "Server invoke count 1");
        assert_eq!(server.register_client("peer", &client).info, "Server invoke count 2");
        assert_eq!(server.current().id, 0);
    }

    #[tokio::test]
    async fn test_subscriber_sees_startup_then_updates() {
        let (server, _tx) = server(0);
        let mut sub = server.subscribe("peer", &ClientInfo::default());

        let first = next(&mut sub).await.unwrap();
        assert_eq!(first.id, 0);
        assert_eq!(first.mid_line_cross, -1);

        server.write_position(update(5));
        let second = next(&mut sub).await.unwrap();
        assert_eq!(second.id, 1);
        assert_eq!(second.mid_offset, 5);
    }

    #[tokio::test]
    async fn test_late_subscriber_starts_at_current() {
        let (server, _tx) = server(0);
        server.write_position(update(1));
        server.write_position(update(2));

        let mut sub = server.subscribe("peer", &ClientInfo::default());
        assert_eq!(next(&mut sub).await.unwrap().id, 2);

        server.write_position(update(3));
        assert_eq!(next(&mut sub).await.unwrap().id, 3);
    }

    #[tokio::test]
    async fn test_queued_updates_arrive_without_gaps() {
        let (server, _tx) = server(0);
        let mut sub = server.subscribe("peer", &ClientInfo::default());
        assert_eq!(next(&mut sub).await.unwrap().id, 0);

        for i in 1..=5 {
            server.write_position(update(i));
        }
        for expected in 1..=5 {
            let snapshot = next(&mut sub).await.unwrap();
            assert_eq!(snapshot.id, expected);
            assert_eq!(snapshot.mid_offset, expected as i32);
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ahead_in_order() {
        let (server, _tx) = server(0);
        let mut sub = server.subscribe("peer", &ClientInfo::default());
        assert_eq!(next(&mut sub).await.unwrap().id, 0);

        let total = SUBSCRIBER_BUFFER as i64 + 10;
        for i in 0..total {
            server.write_position(update(i as i32));
        }

        let first = next(&mut sub).await.unwrap().id;
        assert_eq!(first, 11);
        let mut last = first;
        while last < total {
            let id = next(&mut sub).await.unwrap().id;
            assert_eq!(id, last + 1);
            last = id;
        }
    }

    #[tokio::test]
    async fn test_subscribers_agree_on_values() {
        let (server, _tx) = server(0);
        let mut a = server.subscribe("a", &ClientInfo::default());
        next(&mut a).await.unwrap();
        server.write_position(update(7));

        let mut b = server.subscribe("b", &ClientInfo::default());
        let from_a = next(&mut a).await.unwrap();
        let from_b = next(&mut b).await.unwrap();
        assert_eq!(from_a, from_b);
        assert_eq!(from_a.id, 1);
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscription() {
        let (server, tx) = server(0);
        let mut sub = server.subscribe("peer", &ClientInfo::default());
        next(&mut sub).await.unwrap();

        tx.send(true).unwrap();
        assert!(next(&mut sub).await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_subscription_releases_session() {
        let (server, _tx) = server(0);
        let a = server.subscribe("a", &ClientInfo { info: "first".to_string() });
        let b = server.subscribe("b", &ClientInfo::default());
        assert_eq!(server.sessions().len(), 2);

        drop(a);
        let remaining = server.sessions();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, b.session_id());
        drop(b);
        assert!(server.sessions().is_empty());
    }

    #[test]
    fn test_request_wire_format() {
        let request: Request =
            serde_json::from_str(r#"{"method":"registerClient","info":"cam"}"#).unwrap();
        assert_eq!(request, Request::RegisterClient(ClientInfo { info: "cam".to_string() }));

        let request: Request = serde_json::from_str(r#"{"method":"subscribePositions"}"#).unwrap();
        assert_eq!(request, Request::SubscribePositions(ClientInfo::default()));

        assert!(serde_json::from_str::<Request>(r#"{"method":"getPositions"}"#).is_err());
    }
}
