//! rumqttc implementation of the transport adapter
//!
//! `connect` drives a fresh `EventLoop` until CONNACK, then hands the loop to a
//! pump task. The pump forwards PUBLISH packets and reports the first loop
//! error (or broker DISCONNECT) as `ConnectionClosed`, after which it stops
//! polling; rumqttc's own reconnect is never used, the session decides when to
//! reconnect. SUBACKs go back to the connection so `subscribe` only succeeds
//! once the broker has granted the topic.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, SubAck,
    SubscribeReasonCode, TlsConfiguration, Transport as MqttTransport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::config::{BrokerConfig, ProtocolVersion, QosLevel};
use super::tls;
use super::transport::{Connection, ConnectionId, InboundMessage, Transport, TransportEvent};
use crate::error::BridgeError;

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Transport backed by rumqttc's `AsyncClient`
#[derive(Debug, Clone)]
pub struct RumqttTransport {
    /// Capacity of the client request queue
    request_capacity: usize,
}

impl Default for RumqttTransport {
    fn default() -> Self {
        Self {
            request_capacity: 100,
        }
    }
}

impl RumqttTransport {
    pub fn new(request_capacity: usize) -> Self {
        Self { request_capacity }
    }

    fn options(&self, config: &BrokerConfig) -> Result<MqttOptions, BridgeError> {
        // MqttOptions::new panics on these
        if config.client_id.is_empty() || config.client_id.starts_with(' ') {
            return Err(BridgeError::Connect(format!(
                "Invalid client id '{}'",
                config.client_id
            )));
        }
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options
            .set_keep_alive(config.keep_alive())
            .set_clean_session(true);

        match config.protocol {
            ProtocolVersion::V311 => debug!("Protocol version 3.1.1"),
            ProtocolVersion::V31 => warn!(
                "Protocol version 3.1 requested for {}, connecting with 3.1.1",
                config.name
            ),
        }

        match config.credentials() {
            Some((user, password)) => {
                info!("Connecting with user: {}", user);
                options.set_credentials(user, password);
            }
            None => info!("Connecting with no user"),
        }

        if config.security.uses_tls() {
            let tls = tls::client_config(config)?;
            options.set_transport(MqttTransport::tls_with_config(TlsConfiguration::Rustls(tls)));
        }

        Ok(options)
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(
        &self,
        config: &BrokerConfig,
        connection: ConnectionId,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Connection>, BridgeError> {
        let options = self.options(config)?;
        let (client, mut event_loop) = AsyncClient::new(options, self.request_capacity);

        info!("Attempting connection to {}", config);
        match tokio::time::timeout(config.connect_timeout(), await_connack(&mut event_loop)).await {
            Ok(Ok(())) => info!("Connected to MQTT server: {}", config.host),
            Ok(Err(e)) => {
                error!("Exception (Connect client): {}", e);
                return Err(e);
            }
            Err(_) => {
                error!("Connect to {} timed out", config.host);
                return Err(BridgeError::Connect(format!(
                    "No CONNACK from {} within {}s",
                    config.host, config.connect_timeout_secs
                )));
            }
        }

        let connected = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (subacks_tx, subacks_rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(pump_events(
            event_loop,
            connection,
            events,
            subacks_tx,
            connected.clone(),
            closing.clone(),
            cancel.clone(),
        ));

        Ok(Arc::new(RumqttConnection {
            id: connection,
            client,
            connected,
            closing,
            cancel,
            ack_timeout: config.connect_timeout(),
            subacks: Mutex::new(subacks_rx),
            pump: Mutex::new(Some(pump)),
        }))
    }
}

async fn await_connack(event_loop: &mut EventLoop) -> Result<(), BridgeError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(BridgeError::Connect(format!("Broker refused connection: {:?}", ack.code)))
                };
            }
            Ok(event) => trace!("Pre-CONNACK event: {:?}", event),
            Err(e) => return Err(BridgeError::Connect(e.to_string())),
        }
    }
}

async fn pump_events(
    mut event_loop: EventLoop,
    connection: ConnectionId,
    events: mpsc::Sender<TransportEvent>,
    subacks: mpsc::UnboundedSender<SubAck>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    debug!("Event pump started for connection {}", connection);
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Event pump for connection {} cancelled", connection);
                break None;
            }
            polled = event_loop.poll() => match polled {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                    trace!("Received from {}: {}", message.topic, message.preview());
                    if events
                        .send(TransportEvent::MessageReceived { connection, message })
                        .await
                        .is_err()
                    {
                        break None;
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        warn!("Broker rejected subscription (pkid {})", ack.pkid);
                    }
                    if subacks.send(ack).is_err() {
                        trace!("SUBACK on connection {} with nobody waiting", connection);
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Disconnected by broker");
                    break Some("Disconnected by broker".to_string());
                }
                Ok(_) => {}
                Err(e) => break Some(e.to_string()),
            }
        }
    };

    connected.store(false, Ordering::Release);
    if let Some(reason) = reason {
        if closing.load(Ordering::Acquire) {
            debug!("Connection {} closed after disconnect request", connection);
        } else {
            warn!("Connection {} closed: {}", connection, reason);
            let _ = events
                .send(TransportEvent::ConnectionClosed { connection, reason })
                .await;
        }
    }
}

struct RumqttConnection {
    id: ConnectionId,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    cancel: CancellationToken,
    /// How long `subscribe` waits for the broker's SUBACK
    ack_timeout: Duration,
    /// Locked for a whole subscribe, so the next SUBACK belongs to the caller
    subacks: Mutex<mpsc::UnboundedReceiver<SubAck>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Connection for RumqttConnection {
    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), BridgeError> {
        let failed = |reason: String| BridgeError::Subscribe {
            topic: topic.to_string(),
            reason,
        };

        let mut subacks = self.subacks.lock().await;
        while let Ok(stale) = subacks.try_recv() {
            debug!("Discarding unclaimed SUBACK (pkid {})", stale.pkid);
        }
        self.client
            .subscribe(topic, qos.into())
            .await
            .map_err(|e| failed(e.to_string()))?;

        let ack = match tokio::time::timeout(self.ack_timeout, subacks.recv()).await {
            Ok(Some(ack)) => ack,
            Ok(None) => return Err(failed("Connection closed before SUBACK".to_string())),
            Err(_) => {
                return Err(failed(format!(
                    "No SUBACK within {}s",
                    self.ack_timeout.as_secs()
                )))
            }
        };
        match ack.return_codes.first() {
            Some(SubscribeReasonCode::Success(granted)) => {
                trace!("Subscribed {} with {:?}", topic, granted);
                Ok(())
            }
            Some(SubscribeReasonCode::Failure) => {
                Err(failed("Broker rejected subscription".to_string()))
            }
            None => Err(failed("SUBACK carried no return code".to_string())),
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), BridgeError> {
        self.client
            .publish(topic, qos.into(), retain, payload)
            .await
            .map_err(|e| BridgeError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        self.closing.store(true, Ordering::Release);
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| BridgeError::Connect(format!("Error disconnecting: {}", e)));

        if let Some(mut pump) = self.pump.lock().await.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut pump).await.is_err() {
                debug!("Event pump for connection {} did not stop, aborting", self.id);
                self.cancel.cancel();
                pump.abort();
            }
        }
        self.connected.store(false, Ordering::Release);
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Drop for RumqttConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
