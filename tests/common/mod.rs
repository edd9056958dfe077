#![allow(dead_code)]

use async_trait::async_trait;
use pointlink::mqtt::{
    BrokerConfig, Connection, ConnectionId, InboundMessage, QosLevel, Transport, TransportEvent,
};
use pointlink::point::PointTable;
use pointlink::{
    BridgeError, BrokerStatus, LinkState, PointConfig, PointHost, PointId, PointValue, Quality,
    SessionHandle,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One recorded PUBLISH
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
    pub retain: bool,
}

struct LiveLink {
    connection: ConnectionId,
    events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
}

#[derive(Default)]
struct MockState {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    /// Number of upcoming connects that fail
    failing_connects: AtomicUsize,
    close_during_connect: AtomicBool,
    failing_topic: Mutex<Option<String>>,
    /// Delivered inside connect, before it returns
    retained: Mutex<Vec<(String, String)>>,
    subscribed: Mutex<Vec<(ConnectionId, String, QosLevel)>>,
    published: Mutex<Vec<Published>>,
    live: Mutex<Option<LiveLink>>,
}

/// In-memory transport with failure and event injection
#[derive(Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn close_during_next_connect(&self) {
        self.state.close_during_connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, topic: Option<&str>) {
        *self.state.failing_topic.lock().unwrap() = topic.map(str::to_string);
    }

    pub fn retain(&self, topic: &str, payload: &str) {
        self.state
            .retained
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Topics subscribed on the newest connection
    pub fn subscribed_topics(&self) -> Vec<String> {
        let subscribed = self.state.subscribed.lock().unwrap();
        let newest = subscribed.iter().map(|(id, _, _)| *id).max();
        subscribed
            .iter()
            .filter(|(id, _, _)| Some(*id) == newest)
            .map(|(_, topic, _)| topic.clone())
            .collect()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.published.lock().unwrap().clone()
    }

    fn live(&self) -> (ConnectionId, mpsc::Sender<TransportEvent>, Arc<AtomicBool>) {
        let live = self.state.live.lock().unwrap();
        let link = live.as_ref().expect("no live connection");
        (link.connection, link.events.clone(), link.connected.clone())
    }

    /// Simulates a PUBLISH from the broker on the live connection.
    pub async fn deliver(&self, topic: &str, payload: &[u8]) {
        let (connection, events, _) = self.live();
        events
            .send(TransportEvent::MessageReceived {
                connection,
                message: InboundMessage::new(topic, payload.to_vec()),
            })
            .await
            .expect("session gone");
    }

    /// Id of the newest established connection
    pub fn live_connection(&self) -> ConnectionId {
        self.live().0
    }

    /// Sends a closure tagged with `connection`, which need not be the live one.
    pub async fn close_from(&self, connection: ConnectionId, reason: &str) {
        let (_, events, _) = self.live();
        events
            .send(TransportEvent::ConnectionClosed {
                connection,
                reason: reason.to_string(),
            })
            .await
            .expect("session gone");
    }

    /// Sends a PUBLISH tagged with `connection`, which need not be the live one.
    pub async fn deliver_from(&self, connection: ConnectionId, topic: &str, payload: &[u8]) {
        let (_, events, _) = self.live();
        events
            .send(TransportEvent::MessageReceived {
                connection,
                message: InboundMessage::new(topic, payload.to_vec()),
            })
            .await
            .expect("session gone");
    }

    /// Simulates the broker dropping the live connection.
    pub async fn drop_connection(&self, reason: &str) {
        let (connection, events, connected) = self.live();
        connected.store(false, Ordering::SeqCst);
        events
            .send(TransportEvent::ConnectionClosed {
                connection,
                reason: reason.to_string(),
            })
            .await
            .expect("session gone");
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        _config: &BrokerConfig,
        connection: ConnectionId,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Connection>, BridgeError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        if self.state.close_during_connect.swap(false, Ordering::SeqCst) {
            let _ = events
                .send(TransportEvent::ConnectionClosed {
                    connection,
                    reason: "rejected by broker".to_string(),
                })
                .await;
        }

        let failing = self.state.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(BridgeError::Connect("refused".to_string()));
        }

        let retained: Vec<_> = self.state.retained.lock().unwrap().clone();
        for (topic, payload) in retained {
            let _ = events
                .send(TransportEvent::MessageReceived {
                    connection,
                    message: InboundMessage::new(topic, payload),
                })
                .await;
        }

        let connected = Arc::new(AtomicBool::new(true));
        *self.state.live.lock().unwrap() = Some(LiveLink {
            connection,
            events,
            connected: connected.clone(),
        });

        Ok(Arc::new(MockConnection {
            id: connection,
            state: self.state.clone(),
            connected,
        }))
    }
}

struct MockConnection {
    id: ConnectionId,
    state: Arc<MockState>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), BridgeError> {
        if self.state.failing_topic.lock().unwrap().as_deref() == Some(topic) {
            return Err(BridgeError::Subscribe {
                topic: topic.to_string(),
                reason: "not authorized".to_string(),
            });
        }
        self.state
            .subscribed
            .lock()
            .unwrap()
            .push((self.id, topic.to_string(), qos));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), BridgeError> {
        self.state.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        self.connected.store(false, Ordering::SeqCst);
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Host that records everything the bridge pushes into it
#[derive(Default)]
pub struct RecordingHost {
    writes: Mutex<Vec<(PointId, PointValue, Quality)>>,
    flushes: AtomicUsize,
    statuses: Mutex<Vec<(String, BrokerStatus)>>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn writes(&self) -> Vec<(PointId, PointValue, Quality)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn writes_for(&self, point: PointId) -> Vec<PointValue> {
        self.writes()
            .into_iter()
            .filter(|(id, _, _)| *id == point)
            .map(|(_, value, _)| value)
            .collect()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn status_texts(&self) -> Vec<String> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .map(|(_, status)| status.last_error.clone())
            .collect()
    }

    pub fn alarms_raised(&self) -> usize {
        let statuses = self.statuses.lock().unwrap();
        let mut raised = 0;
        let mut active = false;
        for (_, status) in statuses.iter() {
            if status.alarm.is_some() && !active {
                raised += 1;
            }
            active = status.alarm.is_some();
        }
        raised
    }
}

impl PointHost for RecordingHost {
    fn write_value(&self, point: PointId, value: &PointValue, quality: Quality) {
        self.writes
            .lock()
            .unwrap()
            .push((point, value.clone(), quality));
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn status_changed(&self, broker: &str, status: &BrokerStatus) {
        self.statuses
            .lock()
            .unwrap()
            .push((broker.to_string(), status.clone()));
    }
}

pub fn broker() -> BrokerConfig {
    BrokerConfig::new("plant", "broker.example", 1883)
}

pub fn spawn_session(
    points: Vec<PointConfig>,
    transport: &Arc<MockTransport>,
    host: &Arc<RecordingHost>,
) -> SessionHandle {
    SessionHandle::spawn(
        broker(),
        PointTable::from_configs(points),
        transport.clone(),
        host.clone(),
    )
}

/// Waits (on the test clock) until the session reaches `state`.
pub async fn wait_for_state(handle: &SessionHandle, state: LinkState) -> BrokerStatus {
    let mut status = handle.subscribe_status();
    let reached = tokio::time::timeout(
        Duration::from_secs(120),
        status.wait_for(|status| status.state == state),
    )
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
    .expect("status channel closed");
    reached.clone()
}
