//! Starting and stopping the backend unit through the service supervisor

use crate::error::SupervisorError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use zbus::zvariant::OwnedObjectPath;
use zbus::{proxy, Connection};

/// Job mode passed to systemd: queue the job, replacing conflicting ones
pub const JOB_MODE_REPLACE: &str = "replace";

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1",
    gen_blocking = false
)]
trait SystemdManager {
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;
    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;
}

/// Capability to start and stop a named unit
#[async_trait]
pub trait UnitControl: Send + Sync {
    async fn start(&self, unit: &str) -> Result<(), SupervisorError>;
    async fn stop(&self, unit: &str) -> Result<(), SupervisorError>;
}

/// `UnitControl` backed by the systemd manager on D-Bus
pub struct SystemdUnitControl {
    connection: Connection,
}

impl SystemdUnitControl {
    /// Connect to the system bus, or the session bus for the per-user manager
    pub async fn connect(user: bool) -> Result<Self, SupervisorError> {
        let (bus, result) = if user {
            ("session", Connection::session().await)
        } else {
            ("system", Connection::system().await)
        };
        let connection = result.map_err(|source| SupervisorError::Connect { bus, source })?;
        debug!(bus, "Connected to service manager");
        Ok(Self { connection })
    }

    async fn manager(&self) -> zbus::Result<SystemdManagerProxy<'_>> {
        SystemdManagerProxy::new(&self.connection).await
    }
}

#[async_trait]
impl UnitControl for SystemdUnitControl {
    async fn start(&self, unit: &str) -> Result<(), SupervisorError> {
        let to_error = |e: zbus::Error| SupervisorError::Start {
            unit: unit.to_string(),
            reason: e.to_string(),
        };
        let job = self
            .manager()
            .await
            .map_err(to_error)?
            .start_unit(unit, JOB_MODE_REPLACE)
            .await
            .map_err(to_error)?;
        debug!(unit, job = %job.as_str(), "Start job queued");
        Ok(())
    }

    async fn stop(&self, unit: &str) -> Result<(), SupervisorError> {
        let to_error = |e: zbus::Error| SupervisorError::Stop {
            unit: unit.to_string(),
            reason: e.to_string(),
        };
        let job = self
            .manager()
            .await
            .map_err(to_error)?
            .stop_unit(unit, JOB_MODE_REPLACE)
            .await
            .map_err(to_error)?;
        debug!(unit, job = %job.as_str(), "Stop job queued");
        Ok(())
    }
}

/// Last state this process asked the supervisor for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Nothing requested yet
    Unknown,
    Started,
    Stopped,
}

/// Binds a `UnitControl` to the configured unit.
///
/// Requests are serialised. The state only becomes `Stopped` once a stop
/// request has succeeded; after that no further start or stop requests are
/// sent. A stop that failed or was dropped mid-flight is sent again by the
/// next caller.
#[derive(Clone)]
pub struct ServiceController {
    unit: Arc<str>,
    control: Arc<dyn UnitControl>,
    state: Arc<Mutex<UnitState>>,
    requests: Arc<AsyncMutex<()>>,
}

impl ServiceController {
    pub fn new(unit: impl Into<Arc<str>>, control: Arc<dyn UnitControl>) -> Self {
        Self {
            unit: unit.into(),
            control,
            state: Arc::new(Mutex::new(UnitState::Unknown)),
            requests: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn state(&self) -> UnitState {
        *self.state.lock()
    }

    /// Start the unit. Called once, before the first accept.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let _request = self.requests.lock().await;
        if self.state() == UnitState::Stopped {
            warn!(unit = %self.unit, "Refusing to restart a unit stopped for idleness");
            return Err(SupervisorError::AlreadyStopped {
                unit: self.unit.to_string(),
            });
        }
        info!(unit = %self.unit, "Starting unit");
        self.control.start(&self.unit).await?;
        *self.state.lock() = UnitState::Started;
        Ok(())
    }

    /// Stop the unit. A call after a successful stop is a no-op.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let _request = self.requests.lock().await;
        if self.state() == UnitState::Stopped {
            debug!(unit = %self.unit, "Unit already stopped");
            return Ok(());
        }
        info!(unit = %self.unit, "Stopping unit");
        self.control.stop(&self.unit).await?;
        *self.state.lock() = UnitState::Stopped;
        Ok(())
    }
}
