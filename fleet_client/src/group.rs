//! Group Manager: owns the Server Managers for one group account and
//! the account-socket subscriptions that keep them up to date.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::event::Event;
use crate::logging::LogSink;
use crate::model::{Group, Member, Role, ServerStatusEvent};
use crate::rest::RestGateway;
use crate::server::{ServerManager, ServerStatus};
use crate::ws::router::SubscriptionRouter;
use crate::Result;

const CONSOLE_PERMISSION: &str = "Console";

/// Tracks a fixed-period liveness timer for one server. Armed whenever
/// a heartbeat reports `isOnline=true`; each tick increments `missed`
/// regardless of whether further heartbeats arrive, and at
/// `maxMissedServerHeartbeats` the console connection is torn down.
struct HeartbeatTracker {
    missed: AtomicU32,
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HeartbeatTracker {
    fn new() -> Self {
        Self {
            missed: AtomicU32::new(0),
            timer: Mutex::new(None),
        }
    }

    async fn clear_timer(&self) {
        if let Some(handle) = self.timer.lock().await.take() {
            handle.abort();
        }
    }
}

/// Owns every [`ServerManager`] that belongs to one group account,
/// plus the account-socket subscriptions (`group-update`,
/// `group-member-update`, `group-server-status`,
/// `group-server-heartbeat`, `group-server-create`,
/// `group-server-delete`) that keep that set current.
pub struct GroupManager {
    group_id: String,
    user_id: String,
    config: Arc<Config>,
    rest: Arc<RestGateway>,
    router: Arc<SubscriptionRouter>,
    log: LogSink,
    name: Mutex<String>,
    description: Mutex<String>,
    roles: Mutex<Vec<Role>>,
    permissions: Mutex<Vec<String>>,
    servers: Mutex<HashMap<String, Arc<ServerManager>>>,
    heartbeats: Mutex<HashMap<String, Arc<HeartbeatTracker>>>,
    on_connect: Arc<dyn Fn(Event) + Send + Sync>,
}

impl GroupManager {
    /// Constructed from the `{group, member}` pair the platform hands
    /// over on join (REST `listJoinedGroups`, or the `me-group-create`
    /// account channel): records identity and roles, computes this
    /// member's effective permissions, warns if Console permission is
    /// absent, and synchronously adds a Server Manager for every
    /// server in the group's initial descriptor.
    pub(crate) fn new(
        group: Group,
        member: Member,
        config: Arc<Config>,
        rest: Arc<RestGateway>,
        router: Arc<SubscriptionRouter>,
        log: LogSink,
        on_connect: Arc<dyn Fn(Event) + Send + Sync>,
    ) -> Arc<Self> {
        let log = log.with_suffix(format!("group-{}", group.id));
        let permissions = effective_permissions(&group.roles, &member.role_id);
        if !permissions.iter().any(|p| p == CONSOLE_PERMISSION) {
            log.warn(&format!(
                "group {} member {} has no Console permission",
                group.id, member.user_id
            ));
        }

        let mut servers = HashMap::new();
        for stub in &group.servers {
            let info = crate::model::ServerInfo {
                id: stub.id.clone(),
                group_id: group.id.clone(),
                name: String::new(),
                fleet: String::new(),
                online: false,
            };
            let manager = ServerManager::new(
                info,
                Arc::clone(&rest),
                config.server_connection_recovery_delay,
                log.clone(),
            );
            servers.insert(stub.id.clone(), manager);
        }

        Arc::new(Self {
            group_id: group.id,
            user_id: member.user_id,
            config,
            rest,
            router,
            log,
            name: Mutex::new(group.name),
            description: Mutex::new(group.description),
            roles: Mutex::new(group.roles),
            permissions: Mutex::new(permissions),
            servers: Mutex::new(servers),
            heartbeats: Mutex::new(HashMap::new()),
            on_connect,
        })
    }

    pub fn id(&self) -> &str {
        &self.group_id
    }

    /// Subscribes to every account-socket channel this group needs.
    /// Server data is already known from construction; nothing further
    /// needs fetching here.
    pub(crate) async fn init(self: &Arc<Self>) -> Result<()> {
        self.subscribe_account_channels().await
    }

    async fn subscribe_account_channels(self: &Arc<Self>) -> Result<()> {
        let channels = [
            "group-update",
            "group-member-update",
            "group-server-status",
            "group-server-heartbeat",
            "group-server-create",
            "group-server-delete",
        ];
        for channel in channels {
            let manager = Arc::clone(self);
            let channel_owned = channel.to_string();
            let result = self
                .router
                .subscribe(
                    channel,
                    Some(self.group_id.clone()),
                    Box::new(move |content| {
                        let manager = Arc::clone(&manager);
                        let channel = channel_owned.clone();
                        tokio::spawn(async move {
                            manager.handle_channel_event(&channel, content).await;
                        });
                    }),
                )
                .await;
            // Already-subscribed is not an error here: `init` may run
            // again after Recovery re-establishes the account socket.
            match result {
                Ok(()) | Err(crate::error::Error::AlreadySubscribed(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn handle_channel_event(self: &Arc<Self>, channel: &str, content: serde_json::Value) {
        match channel {
            "group-server-heartbeat" | "group-server-status" => self.handle_status(content).await,
            "group-server-create" => self.handle_server_create(content).await,
            "group-server-delete" => self.handle_server_delete(content).await,
            "group-update" => self.handle_group_update(content).await,
            "group-member-update" => self.handle_member_update(content).await,
            other => {
                self.log.warn(&format!("unhandled account channel {other}, accepting with a warning"));
            }
        }
    }

    async fn handle_group_update(self: &Arc<Self>, content: serde_json::Value) {
        match serde_json::from_value::<Group>(content) {
            Ok(update) => {
                *self.name.lock().await = update.name;
                *self.description.lock().await = update.description;
                *self.roles.lock().await = update.roles;
            }
            Err(e) => self.log.warn(&format!("malformed group-update payload: {e}")),
        }
    }

    async fn handle_member_update(self: &Arc<Self>, content: serde_json::Value) {
        let user_id = content.get("user_id").and_then(|v| v.as_str()).map(str::to_owned);
        if user_id.as_deref() == Some(self.user_id.as_str()) {
            self.refresh_permissions().await;
        }
    }

    /// Refetches group roles and this member's role assignment, then
    /// recomputes effective permissions. `group-update` refreshes
    /// roles directly; this path exists because `group-member-update`
    /// only tells us a membership changed, not what it changed to.
    async fn refresh_permissions(self: &Arc<Self>) {
        let group = match self.rest.get_group_info(&self.group_id).await {
            Ok(g) => g,
            Err(e) => {
                self.log.error(&format!("could not refresh group {} after a member update: {e}", self.group_id));
                return;
            }
        };
        let member = match self.rest.get_group_member(&self.group_id, &self.user_id).await {
            Ok(m) => m,
            Err(e) => {
                self.log.error(&format!("could not refresh membership in group {}: {e}", self.group_id));
                return;
            }
        };
        let permissions = effective_permissions(&group.roles, &member.role_id);
        if !permissions.iter().any(|p| p == CONSOLE_PERMISSION) {
            self.log.warn(&format!(
                "group {} member {} lost Console permission",
                self.group_id, self.user_id
            ));
        }
        *self.roles.lock().await = group.roles;
        *self.permissions.lock().await = permissions;
    }

    async fn has_console_permission(&self) -> bool {
        self.permissions.lock().await.iter().any(|p| p == CONSOLE_PERMISSION)
    }

    /// Returns the [`ServerManager`] for `server_id`, creating a stub
    /// (fleet unknown until first use) if this is the first event
    /// mentioning it.
    pub(crate) async fn server_for(self: &Arc<Self>, server_id: &str) -> Arc<ServerManager> {
        let mut servers = self.servers.lock().await;
        if let Some(existing) = servers.get(server_id) {
            return Arc::clone(existing);
        }
        let info = crate::model::ServerInfo {
            id: server_id.to_string(),
            group_id: self.group_id.clone(),
            name: String::new(),
            fleet: String::new(),
            online: false,
        };
        let manager = ServerManager::new(
            info,
            Arc::clone(&self.rest),
            self.config.server_connection_recovery_delay,
            self.log.clone(),
        );
        servers.insert(server_id.to_string(), Arc::clone(&manager));
        manager
    }

    async fn tracker_for(self: &Arc<Self>, server_id: &str) -> Arc<HeartbeatTracker> {
        let mut heartbeats = self.heartbeats.lock().await;
        Arc::clone(
            heartbeats
                .entry(server_id.to_string())
                .or_insert_with(|| Arc::new(HeartbeatTracker::new())),
        )
    }

    async fn handle_status(self: &Arc<Self>, content: serde_json::Value) {
        let status: ServerStatusEvent = match serde_json::from_value(content) {
            Ok(s) => s,
            Err(e) => {
                self.log.warn(&format!("malformed server status/heartbeat payload: {e}"));
                return;
            }
        };

        if status.is_online {
            self.arm_heartbeat_timer(status.id.clone()).await;
        }
        self.manage_server_connection(&status).await;
    }

    /// Arms (or re-arms) the fixed-period liveness timer for a server:
    /// clears any existing timer, resets the missed count, and spawns
    /// a ticker independent of further inbound messages — this is what
    /// lets a server be torn down after N silent intervals even though
    /// nothing else arrives to trigger it.
    async fn arm_heartbeat_timer(self: &Arc<Self>, server_id: String) {
        let tracker = self.tracker_for(&server_id).await;
        tracker.clear_timer().await;
        tracker.missed.store(0, Ordering::SeqCst);

        let manager = Arc::clone(self);
        let interval = self.config.server_heartbeat_interval;
        let max_missed = self.config.max_missed_server_heartbeats;
        let tracker_for_task = Arc::clone(&tracker);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // consume the immediate first tick
            loop {
                ticker.tick().await;
                let missed = tracker_for_task.missed.fetch_add(1, Ordering::SeqCst) + 1;
                if missed >= max_missed {
                    manager.log.warn(&format!(
                        "server {server_id} missed {missed} heartbeats, tearing down its connection"
                    ));
                    if let Some(server) = manager.servers.lock().await.get(&server_id) {
                        server.mark_disconnected().await;
                    }
                    break;
                }
            }
        });
        *tracker.timer.lock().await = Some(handle);
    }

    /// `mayConnect = hasConsolePermission AND fleet ∈ supportedServerFleets`.
    /// If the server is Disconnected and `mayConnect` and the status
    /// reports online with players present, connects. If the server is
    /// not Disconnected and either `mayConnect` is false or the status
    /// reports offline, disconnects (clearing its heartbeat timer
    /// first). Either way, always refreshes the server's descriptor.
    async fn manage_server_connection(self: &Arc<Self>, status: &ServerStatusEvent) {
        let server = self.server_for(&status.id).await;
        let fleet = match server.fleet().await {
            Ok(f) => f,
            Err(e) => {
                self.log.error(&format!("could not fetch fleet for server {}: {e}", status.id));
                return;
            }
        };
        let may_connect = self.has_console_permission().await && self.config.supported_server_fleets.contains(&fleet);
        let current_status = server.status().await;

        if current_status == ServerStatus::Disconnected
            && may_connect
            && status.is_online
            && !status.online_players.is_empty()
        {
            server.set_desired(true, Arc::clone(&self.console_connect_sink())).await;
        } else if current_status != ServerStatus::Disconnected && (!may_connect || !status.is_online) {
            if let Some(tracker) = self.heartbeats.lock().await.get(&status.id) {
                tracker.clear_timer().await;
            }
            server.set_desired(false, Arc::clone(&self.console_connect_sink())).await;
        }

        server.update(status.is_online).await;
    }

    fn console_connect_sink(self: &Arc<Self>) -> Arc<dyn Fn(crate::console::ConsoleConnection) + Send + Sync> {
        let on_connect = Arc::clone(&self.on_connect);
        Arc::new(move |conn| on_connect(Event::Connect(conn)))
    }

    async fn handle_server_create(self: &Arc<Self>, content: serde_json::Value) {
        let server_id = content
            .get("id")
            .or_else(|| content.get("server_id"))
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        match server_id {
            Some(id) => {
                self.server_for(&id).await;
            }
            None => self.log.warn("group-server-create event missing a server id, accepting with a warning"),
        }
    }

    async fn handle_server_delete(self: &Arc<Self>, content: serde_json::Value) {
        let server_id = content
            .get("id")
            .or_else(|| content.get("server_id"))
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        match server_id {
            Some(id) => {
                if let Some(server) = self.servers.lock().await.remove(&id) {
                    server.disconnect().await;
                }
                if let Some(tracker) = self.heartbeats.lock().await.remove(&id) {
                    tracker.clear_timer().await;
                }
            }
            None => self.log.warn("group-server-delete event missing a server id, accepting with a warning"),
        }
    }

    /// Tears down every server connection owned by this group and
    /// unsubscribes from its account-socket channels.
    pub(crate) async fn dispose(self: &Arc<Self>) {
        for (_, tracker) in self.heartbeats.lock().await.drain() {
            tracker.clear_timer().await;
        }
        for (_, server) in self.servers.lock().await.drain() {
            server.disconnect().await;
        }
        let channels = [
            "group-update",
            "group-member-update",
            "group-server-status",
            "group-server-heartbeat",
            "group-server-create",
            "group-server-delete",
        ];
        for channel in channels {
            let _ = self.router.unsubscribe(channel, Some(self.group_id.clone())).await;
        }
    }
}

fn effective_permissions(roles: &[Role], role_id: &str) -> Vec<String> {
    roles
        .iter()
        .find(|r| r.role_id == role_id)
        .map(|r| r.permissions.clone())
        .unwrap_or_default()
}
