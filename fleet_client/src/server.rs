//! Server Manager: owns at most one console connection to a single
//! game server, reconnecting on abnormal close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::console::{self, ConsoleConnection};
use crate::logging::LogSink;
use crate::model::ServerInfo;
use crate::rest::RestGateway;
use crate::Result;

/// Where a [`ServerManager`] currently stands in its connection
/// lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Disconnected,
    Connecting,
    Connected,
}

struct Descriptor {
    name: String,
    fleet: String,
    online: bool,
}

/// Owns the console connection lifecycle for one game server.
pub struct ServerManager {
    id: String,
    #[allow(dead_code)]
    group_id: String,
    rest: Arc<RestGateway>,
    recovery_delay: Duration,
    log: LogSink,
    descriptor: Mutex<Descriptor>,
    status: Mutex<ServerStatus>,
    connection: Mutex<Option<ConsoleConnection>>,
    should_connect: AtomicBool,
    notify: Notify,
    reconnect_loop_started: AtomicBool,
}

impl ServerManager {
    pub(crate) fn new(info: ServerInfo, rest: Arc<RestGateway>, recovery_delay: Duration, log: LogSink) -> Arc<Self> {
        let log = log.with_suffix(format!("server-{}", info.id));
        Arc::new(Self {
            id: info.id,
            group_id: info.group_id,
            rest,
            recovery_delay,
            log,
            descriptor: Mutex::new(Descriptor {
                name: info.name,
                fleet: info.fleet,
                online: info.online,
            }),
            status: Mutex::new(ServerStatus::Disconnected),
            connection: Mutex::new(None),
            should_connect: AtomicBool::new(false),
            notify: Notify::new(),
            reconnect_loop_started: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn status(&self) -> ServerStatus {
        *self.status.lock().await
    }

    pub async fn connection(&self) -> Option<ConsoleConnection> {
        self.connection.lock().await.clone()
    }

    /// Returns this server's fleet tag, fetching it via REST on first
    /// use when the manager was created from a bare server-id stub
    /// (e.g. a group's initial `servers` descriptor) and has not yet
    /// learned it.
    pub(crate) async fn fleet(&self) -> Result<String> {
        {
            let descriptor = self.descriptor.lock().await;
            if !descriptor.fleet.is_empty() {
                return Ok(descriptor.fleet.clone());
            }
        }
        let info = self.rest.get_server_info(&self.id).await?;
        let mut descriptor = self.descriptor.lock().await;
        descriptor.fleet = info.fleet.clone();
        descriptor.name = info.name.clone();
        Ok(descriptor.fleet.clone())
    }

    /// Refreshes descriptor fields from an inbound status/heartbeat
    /// event. Called unconditionally from `manageServerConnection`,
    /// independent of whether the event also triggered a connect or
    /// disconnect.
    pub(crate) async fn update(&self, is_online: bool) {
        self.descriptor.lock().await.online = is_online;
    }

    /// Requests connection details from the REST gateway and opens a
    /// console connection. Refused (`allowed: false`) or missing
    /// connection/token data fails with `Error::ConsoleRefused`; any
    /// other failure is left for the caller's reconnect loop — this
    /// method performs one attempt only.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<ConsoleConnection> {
        *self.status.lock().await = ServerStatus::Connecting;
        let details = self.rest.get_server_connection_details(&self.id).await?;

        if !details.allowed {
            *self.status.lock().await = ServerStatus::Disconnected;
            return Err(crate::error::Error::ConsoleRefused(format!(
                "server {} refused a console connection",
                self.id
            )));
        }
        let Some(connection) = details.connection else {
            *self.status.lock().await = ServerStatus::Disconnected;
            return Err(crate::error::Error::ConsoleRefused(format!(
                "server {} returned no connection details despite allowed=true",
                self.id
            )));
        };
        let Some(token) = details.token else {
            *self.status.lock().await = ServerStatus::Disconnected;
            return Err(crate::error::Error::ConsoleRefused(format!(
                "server {} returned no console token despite allowed=true",
                self.id
            )));
        };

        let conn = console::connect(
            self.id.clone(),
            &connection.address,
            connection.websocket_port,
            &token,
            self.log.clone(),
        )
        .await?;
        *self.connection.lock().await = Some(conn.clone());
        *self.status.lock().await = ServerStatus::Connected;
        Ok(conn)
    }

    /// Sets whether this server should have an open console connection.
    /// `true` (re-)arms the reconnect loop and wakes it; `false` tears
    /// down any live connection immediately. Idempotent in both
    /// directions.
    pub(crate) async fn set_desired(
        self: &Arc<Self>,
        desired: bool,
        on_connect: Arc<dyn Fn(ConsoleConnection) + Send + Sync>,
    ) {
        self.should_connect.store(desired, Ordering::SeqCst);
        if desired {
            self.ensure_reconnect_loop(on_connect);
            self.notify.notify_one();
        } else if self.status().await != ServerStatus::Disconnected {
            self.disconnect().await;
        }
    }

    /// Starts the background reconnect loop exactly once: parks on
    /// `notify` whenever a connection isn't currently wanted, and
    /// otherwise retries [`Self::connect`] at `recovery_delay` forever,
    /// matching the specification's indefinite-retry rule for anything
    /// but an explicit disconnect.
    fn ensure_reconnect_loop(self: &Arc<Self>, on_connect: Arc<dyn Fn(ConsoleConnection) + Send + Sync>) {
        if self.reconnect_loop_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if !manager.should_connect.load(Ordering::SeqCst) {
                    manager.notify.notified().await;
                    continue;
                }
                if manager.connection().await.is_some() {
                    manager.notify.notified().await;
                    continue;
                }
                match manager.connect().await {
                    Ok(conn) => on_connect(conn),
                    Err(e) => {
                        manager.log.warn(&format!("console connect failed, retrying: {e}"));
                    }
                }
                tokio::time::sleep(manager.recovery_delay).await;
            }
        });
    }

    /// Called when a heartbeat timeout or an abnormal console close is
    /// observed: tears down the live connection without touching
    /// `should_connect`, and wakes the reconnect loop so it notices
    /// the connection is gone.
    pub(crate) async fn mark_disconnected(&self) {
        *self.connection.lock().await = None;
        *self.status.lock().await = ServerStatus::Disconnected;
        self.notify.notify_one();
    }

    pub(crate) async fn disconnect(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.dispose().await;
        }
        *self.status.lock().await = ServerStatus::Disconnected;
        self.notify.notify_one();
    }
}
