//! Public handle to a running broker session

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::actor::{run_session, BrokerSession};
use super::state::BrokerStatus;
use crate::error::BridgeError;
use crate::host::PointHost;
use crate::mqtt::{BrokerConfig, Transport};
use crate::point::{PointEntry, PointId, PointTable, PointValue};

const COMMAND_CAPACITY: usize = 32;

/// Requests served by the session actor
#[derive(Debug)]
pub enum SessionCommand {
    Control {
        point: PointId,
        value: PointValue,
        respond_to: oneshot::Sender<Result<(), BridgeError>>,
    },
    Point {
        point: PointId,
        respond_to: oneshot::Sender<Result<PointEntry, BridgeError>>,
    },
    Topics {
        respond_to: oneshot::Sender<Vec<(String, PointId)>>,
    },
    RetryNow,
}

/// Handle for a broker session running in a tokio task
///
/// Dropping the handle stops the session once the actor notices its command
/// channel closed; [`SessionHandle::shutdown`] waits for the teardown.
#[derive(Debug)]
pub struct SessionHandle {
    name: String,
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<BrokerStatus>,
    cancel: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Defines the session and spawns its actor; connecting starts immediately.
    pub fn spawn(
        broker: BrokerConfig,
        points: PointTable,
        transport: Arc<dyn Transport>,
        host: Arc<dyn PointHost>,
    ) -> Self {
        let name = broker.name.clone();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (status_tx, status_rx) = watch::channel(BrokerStatus::default());
        let cancel = CancellationToken::new();

        let session = BrokerSession::create(
            Arc::new(broker),
            points,
            transport,
            host,
            command_rx,
            status_tx,
            cancel.clone(),
        );

        let task_name = name.clone();
        let task_handle = tokio::spawn(async move {
            debug!("Spawning session task: {}", task_name);
            run_session(session).await;
        });

        info!("Broker session spawned: {}", name);
        Self {
            name,
            commands: command_tx,
            status: status_rx,
            cancel,
            task_handle: Some(task_handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes a control value for one of this session's points.
    pub async fn control(&self, point: PointId, value: PointValue) -> Result<(), BridgeError> {
        let (respond_to, response) = oneshot::channel();
        self.send(SessionCommand::Control {
            point,
            value,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| self.closed())?
    }

    /// Snapshot of a point's configuration and last written value
    pub async fn point(&self, point: PointId) -> Result<PointEntry, BridgeError> {
        let (respond_to, response) = oneshot::channel();
        self.send(SessionCommand::Point { point, respond_to }).await?;
        response.await.map_err(|_| self.closed())?
    }

    /// Current topic registry, sorted by topic
    pub async fn topics(&self) -> Result<Vec<(String, PointId)>, BridgeError> {
        let (respond_to, response) = oneshot::channel();
        self.send(SessionCommand::Topics { respond_to }).await?;
        response.await.map_err(|_| self.closed())
    }

    /// Asks for an immediate reconnect; ignored while connected or connecting.
    pub async fn retry_now(&self) -> Result<(), BridgeError> {
        self.send(SessionCommand::RetryNow).await
    }

    pub fn status(&self) -> BrokerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<BrokerStatus> {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stops the session and waits for teardown. Safe to call repeatedly.
    pub async fn shutdown(&mut self) -> Result<(), BridgeError> {
        self.cancel.cancel();
        let Some(task_handle) = self.task_handle.take() else {
            debug!("Session {} already shut down", self.name);
            return Ok(());
        };

        info!("Shutting down session: {}", self.name);
        task_handle.await.map_err(|e| {
            error!("Session task {} failed: {}", self.name, e);
            BridgeError::SessionClosed(format!("{}: {}", self.name, e))
        })
    }

    async fn send(&self, command: SessionCommand) -> Result<(), BridgeError> {
        self.commands.send(command).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> BridgeError {
        BridgeError::SessionClosed(self.name.clone())
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
