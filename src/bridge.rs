//! Manager for broker sessions
//!
//! Owns one [`SessionHandle`] per in-service broker and routes control
//! requests to the session scanning the point.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, ConfigError};
use crate::host::PointHost;
use crate::mqtt::{BrokerConfig, Transport};
use crate::point::{PointConfig, PointId, PointTable, PointValue};
use crate::session::{BrokerStatus, SessionHandle, TopicRegistry};

struct ActiveSession {
    broker: BrokerConfig,
    points: Vec<PointConfig>,
    /// None for brokers that are out of service
    handle: Option<SessionHandle>,
}

pub struct Bridge {
    transport: Arc<dyn Transport>,
    host: Arc<dyn PointHost>,
    sessions: HashMap<String, ActiveSession>,
    /// Point id to the broker name scanning it
    routes: HashMap<PointId, String>,
}

impl Bridge {
    pub fn new(transport: Arc<dyn Transport>, host: Arc<dyn PointHost>) -> Self {
        info!("Creating new Bridge");
        Self {
            transport,
            host,
            sessions: HashMap::new(),
            routes: HashMap::new(),
        }
    }

    /// Validates `config` and brings the running sessions in line with it.
    ///
    /// Sessions whose broker or point set changed are torn down and defined
    /// again; untouched sessions keep running.
    pub async fn apply(&mut self, config: BridgeConfig) -> Result<(), ConfigError> {
        let config = config.validated()?;

        let mut desired: HashMap<String, (BrokerConfig, Vec<PointConfig>)> = config
            .brokers
            .iter()
            .map(|broker| {
                let mut points = config.points_for(&broker.name);
                points.sort_by_key(|point| point.id);
                (broker.name.clone(), (broker.clone(), points))
            })
            .collect();

        let current: Vec<String> = self.sessions.keys().cloned().collect();
        for name in current {
            let unchanged = match (self.sessions.get(&name), desired.get(&name)) {
                (Some(active), Some((broker, points))) => {
                    active.broker == *broker && active.points == *points
                }
                _ => false,
            };
            if unchanged {
                debug!("Session {} unchanged", name);
                desired.remove(&name);
            } else if let Err(e) = self.undefine(&name).await {
                error!("Error undefining session {}: {}", name, e);
            }
        }

        for (name, (broker, points)) in desired {
            if let Err(e) = self.define(broker, points).await {
                error!("Failed to define session {}: {}", name, e);
            }
        }
        Ok(())
    }

    /// Starts a session for `broker`, replacing any session of the same name.
    pub async fn define(
        &mut self,
        broker: BrokerConfig,
        points: Vec<PointConfig>,
    ) -> Result<(), BridgeError> {
        let mut registry = TopicRegistry::new();
        for point in &points {
            registry.register(&point.topic, point.id).map_err(|e| {
                error!("Rejecting session {}: {}", broker.name, e);
                e
            })?;
        }

        if self.sessions.contains_key(&broker.name) {
            info!("Redefining session: {}", broker.name);
            self.undefine(&broker.name).await?;
        }

        for point in &points {
            self.routes.insert(point.id, broker.name.clone());
        }

        let handle = if broker.in_service {
            Some(SessionHandle::spawn(
                broker.clone(),
                PointTable::from_configs(points.clone()),
                self.transport.clone(),
                self.host.clone(),
            ))
        } else {
            warn!("Broker {} is out of service, not connecting", broker.name);
            None
        };

        self.sessions.insert(
            broker.name.clone(),
            ActiveSession {
                broker,
                points,
                handle,
            },
        );
        Ok(())
    }

    /// Tears the named session down; unknown names are not an error.
    pub async fn undefine(&mut self, name: &str) -> Result<(), BridgeError> {
        let Some(mut active) = self.sessions.remove(name) else {
            debug!("No session named {}", name);
            return Ok(());
        };
        self.routes.retain(|_, broker| *broker != name);

        if let Some(handle) = active.handle.as_mut() {
            handle.shutdown().await?;
        }
        info!("Session undefined: {}", name);
        Ok(())
    }

    /// Publishes a control value through the session owning `point`.
    pub async fn control(&self, point: PointId, value: PointValue) -> Result<(), BridgeError> {
        let broker = self
            .routes
            .get(&point)
            .ok_or(BridgeError::UnknownPoint(point))?;
        match self.session(broker) {
            Some(handle) => handle.control(point, value).await,
            None => Err(BridgeError::NotConnected(broker.clone())),
        }
    }

    pub fn status(&self, name: &str) -> Option<BrokerStatus> {
        self.session(name).map(SessionHandle::status)
    }

    pub fn session(&self, name: &str) -> Option<&SessionHandle> {
        self.sessions
            .get(name)
            .and_then(|active| active.handle.as_ref())
    }

    /// Names of all defined sessions, sorted
    pub fn sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn shutdown(&mut self) {
        info!("Shutting down all sessions");
        for name in self.sessions() {
            if let Err(e) = self.undefine(&name).await {
                error!("Error shutting down session {}: {}", name, e);
            }
        }
        info!("All sessions shut down");
    }
}
