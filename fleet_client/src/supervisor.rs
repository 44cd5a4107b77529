//! Client Supervisor: bootstraps the session, reconciles Group
//! Managers against the allow/deny lists, and exposes the public API
//! surface of this crate.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{watch, Mutex};

use crate::config::{Config, Credentials};
use crate::console::ConsoleConnection;
use crate::error::Error;
use crate::event::Event;
use crate::group::GroupManager;
use crate::logging::LogSink;
use crate::model::GroupMembership;
use crate::rest::RestGateway;
use crate::token::{Principal, TokenManager};
use crate::worker_pool::WorkerPool;
use crate::ws::router::SubscriptionRouter;
use crate::Result;

/// The three account-level channels a bot principal subscribes to for
/// its own identity (keyed by its `client_sub`), independent of any
/// particular group.
const ACCOUNT_CHANNELS: [&str; 3] = ["me-group-invite-create", "me-group-create", "me-group-delete"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadyState {
    Stopped,
    Starting,
    Ready,
}

/// Builds a [`Client`] from a [`Config`] and an event sink.
///
/// The event sink and the `log` crate facade are the only two
/// capability surfaces this crate needs from its host; everything
/// else (REST, WebSockets, timers) is internal plumbing.
pub struct ClientBuilder {
    config: Config,
    on_event: Option<Arc<dyn Fn(Event) + Send + Sync>>,
}

impl ClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            on_event: None,
        }
    }

    /// Registers the callback invoked for every [`Event`] this client
    /// emits (`Ready`, `Connect`).
    pub fn on_event(mut self, callback: impl Fn(Event) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<Arc<Client>> {
        if self.config.max_worker_concurrency == 0 {
            return Err(Error::config("maxWorkerConcurrency must be at least 1"));
        }
        if self.config.worker_concurrency_is_high() {
            log::warn!(
                "maxWorkerConcurrency={} is unusually high; the platform may throttle bursts this large",
                self.config.max_worker_concurrency
            );
        }

        let config = Arc::new(self.config);
        let log = LogSink::new(config.log_verbosity, config.log_prefix.clone());
        let on_event = self
            .on_event
            .unwrap_or_else(|| Arc::new(|_event: Event| {}));

        let (token_manager, session_rx) = TokenManager::new(
            config.token_url.clone(),
            config.sessions_url.clone(),
            config.x_api_key.clone(),
            config.user_agent.clone(),
            config.credentials.clone(),
            log.with_suffix("token"),
        );

        let worker_pool = Arc::new(WorkerPool::new(config.max_worker_concurrency));

        let rest = Arc::new(RestGateway::new(
            config.rest_base_url.clone(),
            config.x_api_key.clone(),
            config.user_agent.clone(),
            config.api_request_attempts,
            config.api_request_timeout,
            session_rx.clone(),
            log.with_suffix("rest"),
        ));

        let router = Arc::new(SubscriptionRouter::new(
            Arc::clone(&config),
            session_rx.clone(),
            Arc::clone(&worker_pool),
            log.with_suffix("router"),
        ));

        Ok(Arc::new(Client {
            config,
            log,
            token_manager,
            session_rx,
            rest,
            router,
            worker_pool,
            on_event,
            ready_state: Mutex::new(ReadyState::Stopped),
            started: AtomicBool::new(false),
            groups: Mutex::new(HashMap::new()),
            allow_list: Mutex::new(HashSet::new()),
            deny_list: Mutex::new(HashSet::new()),
        }))
    }
}

/// The federated connection-management client.
///
/// One `Client` owns one authenticated session, its account-socket
/// pool, and every [`GroupManager`] it has been allowed to join.
pub struct Client {
    config: Arc<Config>,
    log: LogSink,
    token_manager: Arc<TokenManager>,
    session_rx: watch::Receiver<Option<crate::token::Session>>,
    rest: Arc<RestGateway>,
    router: Arc<SubscriptionRouter>,
    worker_pool: Arc<WorkerPool>,
    on_event: Arc<dyn Fn(Event) + Send + Sync>,
    ready_state: Mutex<ReadyState>,
    started: AtomicBool,
    groups: Mutex<HashMap<String, Arc<GroupManager>>>,
    allow_list: Mutex<HashSet<String>>,
    deny_list: Mutex<HashSet<String>>,
}

impl Client {
    /// Transitions `Stopped -> Starting`, authenticates, and dispatches
    /// by principal type. A no-op if the client has already started.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.ready_state.lock().await = ReadyState::Starting;

        {
            let allow_list = self.config.included_groups.iter().cloned().collect();
            let deny_list = self.config.excluded_groups.iter().cloned().collect();
            *self.allow_list.lock().await = allow_list;
            *self.deny_list.lock().await = deny_list;
        }

        self.token_manager.start().await;

        let principal = self
            .session_rx
            .borrow()
            .as_ref()
            .map(|s| s.principal.clone());

        match principal {
            Some(Principal::Bot { .. }) => self.bootstrap_bot().await?,
            Some(Principal::User { .. }) => {
                self.log.info("user principal: automation limited to openServerConnection");
            }
            None => return Err(Error::config("authentication did not complete")),
        }

        *self.ready_state.lock().await = ReadyState::Ready;
        (self.on_event)(Event::Ready);
        Ok(())
    }

    /// This identity's own account id: the bot's `client_id`, or the
    /// user's `user_id`. Used both as the `member.user_id` identity a
    /// Group Manager tracks and as the subscription key for this
    /// client's account-level channels.
    fn self_id(&self) -> Option<String> {
        self.session_rx.borrow().as_ref().map(|s| match &s.principal {
            Principal::Bot { client_id } => client_id.clone(),
            Principal::User { user_id } => user_id.clone(),
        })
    }

    async fn bootstrap_bot(self: &Arc<Self>) -> Result<()> {
        self.subscribe_account_channels().await;

        let joined = self.rest.list_joined_groups().await?;
        let invites = self.rest.list_pending_group_invites().await?;

        let add_jobs: Vec<_> = joined
            .into_iter()
            .map(|membership| {
                let client = Arc::clone(self);
                move || async move {
                    client.add_group(membership).await;
                }
            })
            .collect();
        self.worker_pool.run_all(add_jobs).await;

        let accept_jobs: Vec<_> = invites
            .into_iter()
            .map(|invite| {
                let rest = Arc::clone(&self.rest);
                let log = self.log.clone();
                move || async move {
                    if let Err(e) = rest.accept_group_invite(&invite.group_id).await {
                        log.warn(&format!("could not accept invite to group {}: {e}", invite.group_id));
                    }
                }
            })
            .collect();
        self.worker_pool.run_all(accept_jobs).await;

        Ok(())
    }

    /// Subscribes to this identity's three mandatory account-level
    /// channels, keyed by its own id: `me-group-invite-create` accepts
    /// the invite, `me-group-create` instantiates a [`GroupManager`]
    /// from the event's `{group, member}` payload, and
    /// `me-group-delete` disposes and removes it.
    async fn subscribe_account_channels(self: &Arc<Self>) {
        let Some(self_id) = self.self_id() else {
            self.log.warn("no authenticated identity yet, skipping account-channel subscriptions");
            return;
        };

        for channel in ACCOUNT_CHANNELS {
            let client = Arc::clone(self);
            let channel_owned = channel.to_string();
            let result = self
                .router
                .subscribe(
                    channel,
                    Some(self_id.clone()),
                    Box::new(move |content| {
                        let client = Arc::clone(&client);
                        let channel = channel_owned.clone();
                        tokio::spawn(async move {
                            client.handle_account_event(&channel, content).await;
                        });
                    }),
                )
                .await;
            if let Err(e) = result {
                self.log.warn(&format!("could not subscribe to {channel}: {e}"));
            }
        }
    }

    async fn handle_account_event(self: &Arc<Self>, channel: &str, content: Value) {
        match channel {
            "me-group-invite-create" => self.handle_invite_create(content).await,
            "me-group-create" => self.handle_group_create(content).await,
            "me-group-delete" => self.handle_group_delete(content).await,
            other => self.log.warn(&format!("unhandled account channel {other}, accepting with a warning")),
        }
    }

    async fn handle_invite_create(self: &Arc<Self>, content: Value) {
        let group_id = content.get("group_id").or_else(|| content.get("id")).and_then(|v| v.as_str());
        match group_id {
            Some(group_id) => {
                if let Err(e) = self.rest.accept_group_invite(group_id).await {
                    self.log.warn(&format!("could not accept invite to group {group_id}: {e}"));
                }
            }
            None => self.log.warn("me-group-invite-create event missing a group id, accepting with a warning"),
        }
    }

    async fn handle_group_create(self: &Arc<Self>, content: Value) {
        match serde_json::from_value::<GroupMembership>(content) {
            Ok(membership) => self.add_group(membership).await,
            Err(e) => self.log.warn(&format!("malformed me-group-create payload: {e}")),
        }
    }

    async fn handle_group_delete(self: &Arc<Self>, content: Value) {
        let group_id = content.get("group_id").or_else(|| content.get("id")).and_then(|v| v.as_str());
        match group_id {
            Some(group_id) => self.remove_group(group_id).await,
            None => self.log.warn("me-group-delete event missing a group id, accepting with a warning"),
        }
    }

    /// Enforces uniqueness and the allow/deny policy, then initialises
    /// the [`GroupManager`] if accepted.
    async fn add_group(self: &Arc<Self>, membership: GroupMembership) {
        let group_id = membership.group.id.clone();
        if self.groups.lock().await.contains_key(&group_id) {
            return;
        }
        if !self.is_allowed(&group_id).await {
            self.log.debug(&format!("group {group_id} excluded by allow/deny policy"));
            return;
        }

        let manager = GroupManager::new(
            membership.group,
            membership.member,
            Arc::clone(&self.config),
            Arc::clone(&self.rest),
            Arc::clone(&self.router),
            self.log.clone(),
            Arc::clone(&self.on_event),
        );
        if let Err(e) = manager.init().await {
            self.log.error(&format!("group {group_id} failed to initialise: {e}"));
            return;
        }
        self.groups.lock().await.insert(group_id, manager);
    }

    async fn is_allowed(&self, group_id: &str) -> bool {
        let allow_list = self.allow_list.lock().await.clone();
        let deny_list = self.deny_list.lock().await.clone();
        allow_decision(&allow_list, &deny_list, group_id)
    }

    /// Removes and disposes a group this client had joined.
    pub async fn remove_group(&self, group_id: &str) {
        if let Some(manager) = self.groups.lock().await.remove(group_id) {
            manager.dispose().await;
        }
    }

    /// Allows a group, optionally forcing it onto a non-empty
    /// allowlist even when the allowlist was empty (and thus meant
    /// "allow everything") beforehand.
    pub async fn allow_group(self: &Arc<Self>, group_id: impl Into<String>, force: bool) {
        let group_id = group_id.into();
        self.deny_list.lock().await.remove(&group_id);
        let should_allow_list = {
            let allow_list = self.allow_list.lock().await;
            !allow_list.is_empty() || force
        };
        if should_allow_list {
            self.allow_list.lock().await.insert(group_id.clone());
        }
        if !self.is_allowed(&group_id).await {
            return;
        }
        let Some(self_id) = self.self_id() else {
            return;
        };
        if let (Ok(group), Ok(member)) = (
            self.rest.get_group_info(&group_id).await,
            self.rest.get_group_member(&group_id, &self_id).await,
        ) {
            self.add_group(GroupMembership { group, member }).await;
        }
    }

    /// Denies a group: removes it from the allowlist and adds it to
    /// the denylist, then disposes any running manager for it.
    pub async fn deny_group(&self, group_id: impl Into<String>) {
        let group_id = group_id.into();
        self.allow_list.lock().await.remove(&group_id);
        self.deny_list.lock().await.insert(group_id.clone());
        self.remove_group(&group_id).await;
    }

    /// User-principal path: opens a console connection to a single
    /// server by id, outside of any group bootstrap. Requires the
    /// client to be `Ready`. Fetches the server's owning group and this
    /// identity's membership in it, builds a transient [`GroupManager`]
    /// from that pair, and connects through the [`crate::server::ServerManager`]
    /// it already holds for the target server — deduping against any
    /// connection that manager already owns rather than always opening
    /// a fresh one.
    pub async fn open_server_connection(self: &Arc<Self>, server_id: &str) -> Result<ConsoleConnection> {
        if *self.ready_state.lock().await != ReadyState::Ready {
            return Err(Error::invalid_usage("client is not ready"));
        }
        let self_id = self.self_id().ok_or_else(|| Error::config("no authenticated principal"))?;

        let info = self.rest.get_server_info(server_id).await?;
        let group = self.rest.get_group_info(&info.group_id).await?;
        let member = self.rest.get_group_member(&info.group_id, &self_id).await?;

        let group_manager = GroupManager::new(
            group,
            member,
            Arc::clone(&self.config),
            Arc::clone(&self.rest),
            Arc::clone(&self.router),
            self.log.clone(),
            Arc::clone(&self.on_event),
        );

        let server = group_manager.server_for(server_id).await;
        if let Some(conn) = server.connection().await {
            return Ok(conn);
        }
        server.connect().await
    }
}

/// A non-empty allowlist wins: membership in it is the sole criterion.
/// An empty allowlist means "allow everything except the denylist".
fn allow_decision(allow_list: &HashSet<String>, deny_list: &HashSet<String>, group_id: &str) -> bool {
    if !allow_list.is_empty() {
        return allow_list.contains(group_id);
    }
    !deny_list.contains(group_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_lists_allow_everything() {
        let allow = HashSet::new();
        let deny = HashSet::new();
        assert!(allow_decision(&allow, &deny, "42"));
    }

    #[test]
    fn deny_list_overrides_when_allow_list_is_empty() {
        let allow = HashSet::new();
        let deny: HashSet<String> = ["42".to_string()].into_iter().collect();
        assert!(!allow_decision(&allow, &deny, "42"));
        assert!(allow_decision(&allow, &deny, "43"));
    }

    #[test]
    fn non_empty_allow_list_excludes_unlisted_groups() {
        let allow: HashSet<String> = ["42".to_string()].into_iter().collect();
        let deny = HashSet::new();
        assert!(allow_decision(&allow, &deny, "42"));
        assert!(!allow_decision(&allow, &deny, "43"));
    }
}
