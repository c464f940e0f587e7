use std::sync::Arc;
use std::time::Duration;

use tether_proto::LocationSample;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, Inbound};
use crate::socket::{Connector, RealtimeSocket, SocketEvent};
use crate::state::{ConnectionState, StateCell};

pub const DEFAULT_TOPIC: &str = "realtime:public:locations";

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Gateway endpoint, e.g. `wss://xyz.example.co/realtime/v1/websocket`.
    pub endpoint: String,
    pub api_key: String,
    pub topic: String,
    pub reconnect_delay: Duration,
}

impl RealtimeConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            topic: DEFAULT_TOPIC.to_string(),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Everything the channel reports, on one stream: state transitions and
/// inserted rows.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    State(ConnectionState),
    Insert(LocationSample),
}

#[derive(Debug)]
enum Command {
    Connect,
    Heartbeat,
    Disconnect,
}

/// Handle to the channel driver task. Cheap to clone; all clones address the
/// same connection.
#[derive(Clone)]
pub struct Channel {
    cmd_tx: mpsc::Sender<Command>,
    state: Arc<StateCell>,
}

impl Channel {
    pub fn spawn(
        cfg: RealtimeConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::Receiver<RealtimeEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(64);
        let state = Arc::new(StateCell::new(ConnectionState::Disconnected));

        let driver = Driver {
            cfg,
            connector,
            state: state.clone(),
            cmd_rx,
            event_tx,
            next_ref: 0,
        };
        tokio::spawn(driver.run());

        (Self { cmd_tx, state }, event_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    pub async fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect).await;
    }

    /// Sends a keep-alive envelope when connected, a no-op otherwise. The
    /// channel owns the protocol, not the schedule; callers arm the timer.
    pub async fn send_heartbeat(&self) {
        let _ = self.cmd_tx.send(Command::Heartbeat).await;
    }

    /// Safe to call in any state; never triggers a reconnect.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect).await;
    }
}

enum SessionEnd {
    RemoteClose,
    LocalDisconnect,
    Error(crate::socket::ChannelError),
    HandlesDropped,
}

struct Driver {
    cfg: RealtimeConfig,
    connector: Arc<dyn Connector>,
    state: Arc<StateCell>,
    cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<RealtimeEvent>,
    next_ref: u64,
}

impl Driver {
    // A single task owns every connect, so two opens can never race.
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Connect => self.connected_phase().await,
                Command::Heartbeat => debug!("realtime: heartbeat skipped; not connected"),
                Command::Disconnect => debug!("realtime: already disconnected"),
            }
        }
    }

    /// One `connect()` invocation: the initial open plus any number of
    /// post-drop reconnects. Returns once the channel settles Disconnected.
    async fn connected_phase(&mut self) {
        let mut reconnecting = false;
        loop {
            self.set_state(ConnectionState::Connecting).await;
            let mut socket = match self.open_and_join().await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("realtime: connect failed: {}", e);
                    if reconnecting {
                        self.set_state(ConnectionState::Reconnecting).await;
                        if !self.reconnect_pause().await {
                            return;
                        }
                        continue;
                    }
                    self.set_state(ConnectionState::Disconnected).await;
                    return;
                }
            };
            self.set_state(ConnectionState::Connected).await;

            match self.session(socket.as_mut()).await {
                SessionEnd::RemoteClose => {
                    info!(
                        "realtime: connection dropped by remote; reconnecting in {:?}",
                        self.cfg.reconnect_delay
                    );
                    self.set_state(ConnectionState::Reconnecting).await;
                    if !self.reconnect_pause().await {
                        return;
                    }
                    reconnecting = true;
                }
                SessionEnd::LocalDisconnect => {
                    socket.close().await;
                    self.set_state(ConnectionState::Disconnected).await;
                    info!("realtime: disconnected");
                    return;
                }
                SessionEnd::Error(e) => {
                    warn!("realtime: transport error: {}", e);
                    self.set_state(ConnectionState::Disconnected).await;
                    return;
                }
                SessionEnd::HandlesDropped => {
                    socket.close().await;
                    return;
                }
            }
        }
    }

    /// Sits out the reconnect delay while still honoring commands: a
    /// disconnect settles the channel immediately instead of waiting for the
    /// next attempt. Returns false when reconnection should stop.
    async fn reconnect_pause(&mut self) -> bool {
        let delay = tokio::time::sleep(self.cfg.reconnect_delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return false,
                    Some(Command::Disconnect) => {
                        self.set_state(ConnectionState::Disconnected).await;
                        info!("realtime: disconnected");
                        return false;
                    }
                    Some(Command::Connect) => debug!("realtime: already reconnecting"),
                    Some(Command::Heartbeat) => debug!("realtime: heartbeat skipped; not connected"),
                }
            }
        }
    }

    async fn open_and_join(
        &mut self,
    ) -> Result<Box<dyn RealtimeSocket>, crate::socket::ChannelError> {
        let mut socket = self.connector.connect().await?;
        self.next_ref += 1;
        let join = serde_json::to_string(&Envelope::join(&self.cfg.topic, self.next_ref))?;
        socket.send(join).await?;
        debug!("realtime: join sent for {}", self.cfg.topic);
        Ok(socket)
    }

    async fn session(&mut self, socket: &mut dyn RealtimeSocket) -> SessionEnd {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return SessionEnd::HandlesDropped,
                    Some(Command::Disconnect) => return SessionEnd::LocalDisconnect,
                    Some(Command::Connect) => debug!("realtime: connect ignored; already connected"),
                    Some(Command::Heartbeat) => {
                        self.next_ref += 1;
                        match serde_json::to_string(&Envelope::heartbeat(self.next_ref)) {
                            Ok(text) => {
                                if let Err(e) = socket.send(text).await {
                                    return SessionEnd::Error(e);
                                }
                            }
                            Err(e) => warn!("realtime: heartbeat encode failed: {}", e),
                        }
                    }
                },
                event = socket.recv() => match event {
                    Ok(SocketEvent::Text(text)) => self.dispatch(&text).await,
                    Ok(SocketEvent::Closed { remote }) => {
                        return if remote {
                            SessionEnd::RemoteClose
                        } else {
                            SessionEnd::LocalDisconnect
                        };
                    }
                    Err(e) => return SessionEnd::Error(e),
                },
            }
        }
    }

    // Per-message decode failures never touch connection state.
    async fn dispatch(&self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                warn!("realtime: dropping undecodable message: {}", e);
                return;
            }
        };
        match envelope.classify() {
            Inbound::Insert(sample) => {
                debug!(
                    "realtime: new row at {:.5},{:.5}",
                    sample.latitude, sample.longitude
                );
                let _ = self.event_tx.send(RealtimeEvent::Insert(sample)).await;
            }
            Inbound::BadRow => warn!("realtime: insert payload did not parse as a sample"),
            Inbound::SubscribeAck { ok: true } => info!("realtime: subscription confirmed"),
            Inbound::SubscribeAck { ok: false } => {
                // The connection itself is assumed still usable.
                warn!("realtime: subscription rejected")
            }
            Inbound::Ignored => {}
        }
    }

    async fn set_state(&self, next: ConnectionState) {
        if self.state.load() == next {
            return;
        }
        self.state.store(next);
        let _ = self.event_tx.send(RealtimeEvent::State(next)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::ChannelError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeSocket {
        incoming: mpsc::UnboundedReceiver<Result<SocketEvent, ChannelError>>,
        outgoing: mpsc::UnboundedSender<String>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RealtimeSocket for FakeSocket {
        async fn send(&mut self, text: String) -> Result<(), ChannelError> {
            let _ = self.outgoing.send(text);
            Ok(())
        }

        async fn recv(&mut self) -> Result<SocketEvent, ChannelError> {
            match self.incoming.recv().await {
                Some(event) => event,
                // Script exhausted: behave like a quiet open connection.
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        sockets: Mutex<VecDeque<FakeSocket>>,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self) -> Result<Box<dyn RealtimeSocket>, ChannelError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.sockets.lock().unwrap().pop_front() {
                Some(socket) => Ok(Box::new(socket)),
                None => Err(ChannelError::Open("gateway unreachable".into())),
            }
        }
    }

    struct SocketScript {
        push: mpsc::UnboundedSender<Result<SocketEvent, ChannelError>>,
        sent: mpsc::UnboundedReceiver<String>,
        closed: Arc<AtomicBool>,
    }

    fn scripted(count: usize) -> (Arc<FakeConnector>, Vec<SocketScript>) {
        let mut sockets = VecDeque::new();
        let mut scripts = Vec::new();
        for _ in 0..count {
            let (push, incoming) = mpsc::unbounded_channel();
            let (outgoing, sent) = mpsc::unbounded_channel();
            let closed = Arc::new(AtomicBool::new(false));
            sockets.push_back(FakeSocket { incoming, outgoing, closed: closed.clone() });
            scripts.push(SocketScript { push, sent, closed });
        }
        let connector =
            Arc::new(FakeConnector { sockets: Mutex::new(sockets), connects: AtomicUsize::new(0) });
        (connector, scripts)
    }

    fn test_config() -> RealtimeConfig {
        let mut cfg = RealtimeConfig::new("wss://example.invalid/realtime/v1/websocket", "key");
        cfg.reconnect_delay = Duration::from_millis(10);
        cfg
    }

    async fn next_event(rx: &mut mpsc::Receiver<RealtimeEvent>) -> RealtimeEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    async fn next_sent(script: &mut SocketScript) -> Envelope {
        let text = tokio::time::timeout(Duration::from_secs(2), script.sent.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("socket dropped");
        serde_json::from_str(&text).unwrap()
    }

    fn assert_state(event: RealtimeEvent, expected: ConnectionState) {
        match event {
            RealtimeEvent::State(state) => assert_eq!(state, expected),
            other => panic!("expected state {expected:?}, got {other:?}"),
        }
    }

    fn insert_message(lat: f64, lon: f64) -> String {
        serde_json::json!({
            "topic": DEFAULT_TOPIC,
            "event": "postgres_changes",
            "payload": {
                "eventType": "INSERT",
                "new": {
                    "child_id": "c1",
                    "latitude": lat,
                    "longitude": lon,
                    "location_timestamp": "2024-01-01T00:00:00.000Z"
                }
            }
        })
        .to_string()
    }

    fn update_message() -> String {
        insert_message(1.0, 1.0).replace("INSERT", "UPDATE")
    }

    #[tokio::test]
    async fn connect_joins_topic_and_reaches_connected() {
        let (connector, mut scripts) = scripted(1);
        let (channel, mut events) = Channel::spawn(test_config(), connector.clone());

        channel.connect().await;
        assert_state(next_event(&mut events).await, ConnectionState::Connecting);
        assert_state(next_event(&mut events).await, ConnectionState::Connected);

        let join = next_sent(&mut scripts[0]).await;
        assert_eq!(join.event, "phx_join");
        assert_eq!(join.topic, DEFAULT_TOPIC);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn insert_rows_are_forwarded_and_other_changes_are_not() {
        let (connector, mut scripts) = scripted(1);
        let (channel, mut events) = Channel::spawn(test_config(), connector);

        channel.connect().await;
        assert_state(next_event(&mut events).await, ConnectionState::Connecting);
        assert_state(next_event(&mut events).await, ConnectionState::Connected);

        scripts[0].push.send(Ok(SocketEvent::Text(update_message()))).unwrap();
        scripts[0].push.send(Ok(SocketEvent::Text(insert_message(37.0, -122.0)))).unwrap();

        // The update produced nothing; the first event must be the insert.
        match next_event(&mut events).await {
            RealtimeEvent::Insert(sample) => {
                assert_eq!(sample.latitude, 37.0);
                assert_eq!(sample.longitude, -122.0);
            }
            other => panic!("expected insert event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_messages_are_swallowed_without_state_change() {
        let (connector, mut scripts) = scripted(1);
        let (channel, mut events) = Channel::spawn(test_config(), connector);

        channel.connect().await;
        assert_state(next_event(&mut events).await, ConnectionState::Connecting);
        assert_state(next_event(&mut events).await, ConnectionState::Connected);

        scripts[0].push.send(Ok(SocketEvent::Text("{not json".into()))).unwrap();
        scripts[0].push.send(Ok(SocketEvent::Text(insert_message(5.0, 6.0)))).unwrap();

        match next_event(&mut events).await {
            RealtimeEvent::Insert(sample) => assert_eq!(sample.latitude, 5.0),
            other => panic!("expected insert event, got {other:?}"),
        }
        assert_eq!(channel.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn remote_close_reconnects_after_delay() {
        let (connector, mut scripts) = scripted(2);
        let (channel, mut events) = Channel::spawn(test_config(), connector.clone());

        channel.connect().await;
        assert_state(next_event(&mut events).await, ConnectionState::Connecting);
        assert_state(next_event(&mut events).await, ConnectionState::Connected);
        let _ = next_sent(&mut scripts[0]).await;

        scripts[0].push.send(Ok(SocketEvent::Closed { remote: true })).unwrap();
        assert_state(next_event(&mut events).await, ConnectionState::Reconnecting);
        assert_state(next_event(&mut events).await, ConnectionState::Connecting);
        assert_state(next_event(&mut events).await, ConnectionState::Connected);

        let rejoin = next_sent(&mut scripts[1]).await;
        assert_eq!(rejoin.event, "phx_join");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_reconnect_attempts_keep_retrying() {
        let (connector, mut scripts) = scripted(1);
        let (channel, mut events) = Channel::spawn(test_config(), connector.clone());

        channel.connect().await;
        assert_state(next_event(&mut events).await, ConnectionState::Connecting);
        assert_state(next_event(&mut events).await, ConnectionState::Connected);

        scripts[0].push.send(Ok(SocketEvent::Closed { remote: true })).unwrap();
        assert_state(next_event(&mut events).await, ConnectionState::Reconnecting);

        // No more scripted sockets: every attempt fails, and the driver keeps
        // cycling Connecting -> Reconnecting at the fixed delay.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(connector.connects.load(Ordering::SeqCst) >= 3);
        assert!(matches!(
            channel.state(),
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ));
    }

    #[tokio::test]
    async fn local_disconnect_closes_and_stays_down() {
        let (connector, mut scripts) = scripted(1);
        let (channel, mut events) = Channel::spawn(test_config(), connector.clone());

        channel.connect().await;
        assert_state(next_event(&mut events).await, ConnectionState::Connecting);
        assert_state(next_event(&mut events).await, ConnectionState::Connected);

        channel.disconnect().await;
        assert_state(next_event(&mut events).await, ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scripts[0].closed.load(Ordering::SeqCst));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ConnectionState::Disconnected);

        // Idempotent in any state.
        channel.disconnect().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_during_reconnect_stops_retrying() {
        let (connector, mut scripts) = scripted(1);
        let mut cfg = test_config();
        cfg.reconnect_delay = Duration::from_millis(200);
        let (channel, mut events) = Channel::spawn(cfg, connector.clone());

        channel.connect().await;
        assert_state(next_event(&mut events).await, ConnectionState::Connecting);
        assert_state(next_event(&mut events).await, ConnectionState::Connected);

        scripts[0].push.send(Ok(SocketEvent::Closed { remote: true })).unwrap();
        assert_state(next_event(&mut events).await, ConnectionState::Reconnecting);

        channel.disconnect().await;
        assert_state(next_event(&mut events).await, ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn heartbeat_sends_keepalive_envelope_when_connected() {
        let (connector, mut scripts) = scripted(1);
        let (channel, mut events) = Channel::spawn(test_config(), connector);

        // Ignored while disconnected.
        channel.send_heartbeat().await;

        channel.connect().await;
        assert_state(next_event(&mut events).await, ConnectionState::Connecting);
        assert_state(next_event(&mut events).await, ConnectionState::Connected);
        let join = next_sent(&mut scripts[0]).await;
        assert_eq!(join.event, "phx_join");

        channel.send_heartbeat().await;
        let heartbeat = next_sent(&mut scripts[0]).await;
        assert_eq!(heartbeat.event, "heartbeat");
        assert_eq!(heartbeat.topic, "phoenix");
        assert!(heartbeat.reference.is_some());
    }

    #[tokio::test]
    async fn initial_connect_failure_settles_disconnected() {
        let (connector, _scripts) = scripted(0);
        let (channel, mut events) = Channel::spawn(test_config(), connector.clone());

        channel.connect().await;
        assert_state(next_event(&mut events).await, ConnectionState::Connecting);
        assert_state(next_event(&mut events).await, ConnectionState::Disconnected);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }
}
