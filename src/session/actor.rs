//! Broker session actor with statum lifecycle
//!
//! Every broker runs in one tokio task. Control requests, queries, adapter
//! events, connect completion and the retry timer all arrive in the same
//! `select!` loop, so the link state, the connect guard and the topic registry
//! are only ever touched from one place.
//!
//! # Lifecycle
//!
//! ```text
//! Defined ──► Running ──► Stopping ──► Stopped
//! ```
//!
//! # Link state while Running
//!
//! ```text
//!        start / retry              all subscribed
//! Idle ───────────────► Connecting ───────────────► Online
//!                          │   ▲                      │
//!               failure    │   │ timer (10 s)         │ ConnectionClosed
//!                          ▼   │                      │
//!                        Offline ◄────────────────────┘
//! ```

use chrono::Local;
use statum::{machine, state};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::dispatch::{self, Delivery};
use super::handle::SessionCommand;
use super::registry::TopicRegistry;
use super::state::{BrokerStatus, ClosureAttribution, ConnectGuard};
use crate::error::BridgeError;
use crate::host::PointHost;
use crate::mqtt::{BrokerConfig, Connection, ConnectionId, InboundMessage, Transport, TransportEvent};
use crate::point::{PointId, PointTable, PointValue, Subscription};

const EVENT_CAPACITY: usize = 256;

/// Most messages held back while a connect attempt is in flight
pub const PENDING_LIMIT: usize = 1024;

/// States for the session lifecycle
#[state]
#[derive(Debug, Clone)]
pub enum SessionPhase {
    Defined,  // Configuration bound, nothing started
    Running,  // Actor loop owns the link
    Stopping, // Tearing down the link
    Stopped,  // Terminal
}

/// One broker session
#[machine]
pub struct BrokerSession<S: SessionPhase> {
    broker: Arc<BrokerConfig>,
    points: PointTable,
    transport: Arc<dyn Transport>,
    host: Arc<dyn PointHost>,
    link: SessionLink,
    commands: mpsc::Receiver<SessionCommand>,
    status: watch::Sender<BrokerStatus>,
    cancel: CancellationToken,
}

/// Mutable link state owned by the running actor
pub struct SessionLink {
    registry: TopicRegistry,
    guard: ConnectGuard,
    /// Id of the newest connect attempt; events tagged otherwise are stale
    generation: ConnectionId,
    /// Present only while Online
    connection: Option<Arc<dyn Connection>>,
    attempt: Option<JoinHandle<Result<Established, BridgeError>>>,
    /// Attempt was started by the retry path rather than the initial start
    retrying: bool,
    retry_deadline: Option<Instant>,
    /// Messages received while connecting, oldest first
    pending: VecDeque<InboundMessage>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: mpsc::Receiver<TransportEvent>,
}

impl SessionLink {
    fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            registry: TopicRegistry::new(),
            guard: ConnectGuard::default(),
            generation: 0,
            connection: None,
            attempt: None,
            retrying: false,
            retry_deadline: None,
            pending: VecDeque::new(),
            events_tx,
            events_rx,
        }
    }
}

/// Result of a successful connect attempt
pub struct Established {
    connection: Arc<dyn Connection>,
    registry: TopicRegistry,
}

impl<S: SessionPhase> BrokerSession<S> {
    fn update_status(&self, change: impl FnOnce(&mut BrokerStatus)) {
        self.status.send_modify(change);
        self.host
            .status_changed(&self.broker.name, &self.status.borrow());
    }
}

impl BrokerSession<Defined> {
    pub fn create(
        broker: Arc<BrokerConfig>,
        points: PointTable,
        transport: Arc<dyn Transport>,
        host: Arc<dyn PointHost>,
        commands: mpsc::Receiver<SessionCommand>,
        status: watch::Sender<BrokerStatus>,
        cancel: CancellationToken,
    ) -> Self {
        info!(
            "Defining broker session {} with {} points",
            broker.name,
            points.len()
        );
        Self::new(
            broker,
            points,
            transport,
            host,
            SessionLink::new(),
            commands,
            status,
            cancel,
        )
    }

    /// Transitions to Running and starts the first connect attempt.
    pub fn start(self) -> BrokerSession<Running> {
        info!("Starting broker session: {}", self.broker);
        let mut running: BrokerSession<Running> = self.transition();
        running.begin_connect(false);
        running
    }
}

impl BrokerSession<Running> {
    /// Actor loop; returns once cancelled or every handle is gone.
    pub async fn run_until_shutdown(mut self) -> BrokerSession<Stopping> {
        loop {
            tokio::select! {
                // Adapter events ahead of attempt completion, so a closure raised
                // during the handshake is seen while the guard is still set.
                biased;

                _ = self.cancel.cancelled() => {
                    info!("Shutdown signal received for: {}", self.broker.name);
                    break;
                }

                Some(event) = self.link.events_rx.recv() => self.handle_event(event),

                outcome = wait_attempt(&mut self.link.attempt) => {
                    self.link.attempt = None;
                    self.finish_connect(outcome);
                }

                _ = wait_deadline(self.link.retry_deadline) => {
                    self.link.retry_deadline = None;
                    self.reconnect("retry timer");
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        info!("All handles dropped for: {}", self.broker.name);
                        break;
                    }
                },
            }
        }

        debug!("Transitioning to Stopping: {}", self.broker.name);
        self.transition()
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Control {
                point,
                value,
                respond_to,
            } => {
                let result = self.control(point, value).await;
                let _ = respond_to.send(result);
            }
            SessionCommand::Point { point, respond_to } => {
                let entry = self
                    .points
                    .get(point)
                    .cloned()
                    .ok_or(BridgeError::UnknownPoint(point));
                let _ = respond_to.send(entry);
            }
            SessionCommand::Topics { respond_to } => {
                let _ = respond_to.send(self.link.registry.snapshot());
            }
            SessionCommand::RetryNow => self.reconnect("operator request"),
        }
    }

    async fn control(&mut self, point: PointId, value: PointValue) -> Result<(), BridgeError> {
        let request = dispatch::prepare_control(&self.points, point, &value).map_err(|e| {
            warn!("Control rejected for point {}: {}", point, e);
            e
        })?;
        let connection = self
            .link
            .connection
            .clone()
            .ok_or_else(|| BridgeError::NotConnected(self.broker.name.clone()))?;

        info!("Control {} -> {} = {}", point, request.topic, value);
        connection
            .publish(&request.topic, request.payload, request.qos, false)
            .await
            .map_err(|e| {
                error!("Failed to publish control for point {}: {}", point, e);
                e
            })
    }

    fn handle_event(&mut self, event: TransportEvent) {
        if event.connection() != self.link.generation {
            trace!("Ignoring event from stale connection {}", event.connection());
            return;
        }
        match event {
            TransportEvent::MessageReceived { message, .. } => self.on_message(message),
            TransportEvent::ConnectionClosed { reason, .. } => self.on_closed(reason),
        }
    }

    fn on_message(&mut self, message: InboundMessage) {
        if self.link.guard.in_progress() {
            if self.link.pending.len() >= PENDING_LIMIT {
                if let Some(dropped) = self.link.pending.pop_front() {
                    debug!("Connect buffer full, dropping message on {}", dropped.topic);
                }
            }
            trace!("Buffering message on {} until connected", message.topic);
            self.link.pending.push_back(message);
        } else if self.link.connection.is_none() {
            debug!("Dropping message on {} while offline", message.topic);
        } else {
            self.dispatch(message);
        }
    }

    fn dispatch(&mut self, message: InboundMessage) {
        let delivery = dispatch::deliver(
            &mut self.points,
            &self.link.registry,
            self.host.as_ref(),
            &message,
        );
        self.status.send_modify(|status| {
            status.messages_received += 1;
            if matches!(delivery, Delivery::Updated(_)) {
                status.updates_written += 1;
            }
            status.last_activity = Some(Local::now());
        });
    }

    fn on_closed(&mut self, reason: String) {
        match self.link.guard.observe_closure() {
            ClosureAttribution::ConnectAttempt => {
                debug!("Connection closed while connecting: {}", reason);
            }
            ClosureAttribution::Unsolicited => {
                if self.link.connection.take().is_none() {
                    debug!("Closure of {} already handled", self.broker.name);
                    return;
                }
                warn!("Connection to {} lost: {}", self.broker.name, reason);
                self.go_offline("Connection Closed".to_string());
            }
        }
    }

    /// Shared by the retry timer and operator retries.
    fn reconnect(&mut self, trigger: &str) {
        if self.link.guard.in_progress() {
            debug!("Connect already in progress for {}, ignoring {}", self.broker.name, trigger);
            return;
        }
        if let Some(connection) = &self.link.connection {
            if connection.is_connected() {
                debug!("{} already connected, ignoring {}", self.broker.name, trigger);
                return;
            }
        }
        info!("Reconnecting to {} ({})", self.broker.name, trigger);
        self.begin_connect(true);
    }

    fn begin_connect(&mut self, retrying: bool) {
        self.link.generation += 1;
        self.link.guard.begin();
        self.link.registry.clear();
        self.link.pending.clear();
        self.link.connection = None;
        self.link.retry_deadline = None;
        self.link.retrying = retrying;
        self.update_status(|status| {
            status.connecting();
            status.retry_armed = false;
        });

        let attempt = establish(
            self.transport.clone(),
            self.broker.clone(),
            self.points.subscriptions(),
            self.link.generation,
            self.link.events_tx.clone(),
        );
        self.link.attempt = Some(tokio::spawn(attempt));
    }

    fn finish_connect(&mut self, outcome: Result<Result<Established, BridgeError>, JoinError>) {
        let closed_during_connect = self.link.guard.finish();
        let result = outcome.unwrap_or_else(|e| {
            Err(BridgeError::Connect(format!("Connect task failed: {}", e)))
        });

        match result {
            Ok(established) if closed_during_connect => {
                release(established.connection);
                self.connect_failed(BridgeError::Connect(
                    "Connection closed during connect".to_string(),
                ));
            }
            Ok(established) => self.go_online(established),
            Err(e) => self.connect_failed(e),
        }
    }

    fn go_online(&mut self, established: Established) {
        let subscriptions = established.registry.len();
        self.link.connection = Some(established.connection);
        self.link.registry = established.registry;
        info!(
            "Connected to {}: {} topics subscribed",
            self.broker.name, subscriptions
        );
        self.update_status(|status| status.connected(subscriptions));

        for message in std::mem::take(&mut self.link.pending) {
            self.dispatch(message);
        }
    }

    fn connect_failed(&mut self, cause: BridgeError) {
        error!("Connect to {} failed: {}", self.broker.name, cause);
        if !self.link.pending.is_empty() {
            debug!("Dropping {} buffered messages", self.link.pending.len());
            self.link.pending.clear();
        }
        let reason = if self.link.retrying {
            format!("Timed retry failed to connect. {}", cause)
        } else {
            cause.to_string()
        };
        self.go_offline(reason);
    }

    fn go_offline(&mut self, reason: String) {
        self.link.registry.clear();
        self.link.connection = None;
        let retry_in = self.broker.retry_interval();
        self.link.retry_deadline = Some(Instant::now() + retry_in);
        info!("Retrying {} in {:?}", self.broker.name, retry_in);
        self.update_status(|status| {
            status.not_connected(&reason);
            status.retry_armed = true;
        });
    }
}

impl BrokerSession<Stopping> {
    /// Aborts any attempt, disconnects and clears the registry.
    pub async fn teardown(mut self) -> BrokerSession<Stopped> {
        info!("Tearing down session: {}", self.broker.name);

        if let Some(attempt) = self.link.attempt.take() {
            debug!("Aborting connect attempt in flight");
            attempt.abort();
        }
        self.link.guard.reset();
        self.link.retry_deadline = None;
        self.link.pending.clear();

        if let Some(connection) = self.link.connection.take() {
            if let Err(e) = connection.disconnect().await {
                warn!("Error disconnecting from {}: {}", self.broker.name, e);
            }
        }
        self.link.registry.clear();
        self.update_status(BrokerStatus::stopped);

        self.transition()
    }
}

impl BrokerSession<Stopped> {
    pub fn finish(self) {
        info!("Session stopped: {}", self.broker.name);
    }
}

/// Drives a defined session through its whole lifecycle.
pub async fn run_session(session: BrokerSession<Defined>) {
    session
        .start()
        .run_until_shutdown()
        .await
        .teardown()
        .await
        .finish();
}

/// Connects and subscribes every topic; any failure abandons the attempt.
async fn establish(
    transport: Arc<dyn Transport>,
    broker: Arc<BrokerConfig>,
    subscriptions: Vec<Subscription>,
    connection_id: ConnectionId,
    events: mpsc::Sender<TransportEvent>,
) -> Result<Established, BridgeError> {
    let connection = transport.connect(&broker, connection_id, events).await?;

    let mut registry = TopicRegistry::new();
    for sub in &subscriptions {
        let subscribed = match registry.register(&sub.topic, sub.point) {
            Ok(()) => connection.subscribe(&sub.topic, sub.qos).await,
            Err(e) => Err(e),
        };
        if let Err(e) = subscribed {
            error!("Subscribe failed for point {}: {}", sub.point, e);
            if let Err(e) = connection.disconnect().await {
                debug!("Error disconnecting after failed subscribe: {}", e);
            }
            return Err(e);
        }
        debug!("Subscribed {} for point {}", sub.topic, sub.point);
    }

    Ok(Established {
        connection,
        registry,
    })
}

fn release(connection: Arc<dyn Connection>) {
    tokio::spawn(async move {
        if let Err(e) = connection.disconnect().await {
            debug!("Error releasing connection: {}", e);
        }
    });
}

async fn wait_attempt(
    attempt: &mut Option<JoinHandle<Result<Established, BridgeError>>>,
) -> Result<Result<Established, BridgeError>, JoinError> {
    match attempt {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
