//! Account-Socket Instance: the actor owning one live account
//! WebSocket, its pending RPCs, and its routed subscriptions.
//!
//! Structured the way the teacher's `yahoo_logic::upstream::run` owns
//! its socket — a single long-lived task, a `tokio::select!` loop, and
//! an `Option<Sink>` that gets invalidated to force a reconnect —
//! generalized with the correlation-id RPC table the console and
//! account protocols both need, and the migration/recovery behaviour
//! neither the teacher nor the console protocol has to deal with.
//!
//! Only this task ever touches `pending_rpc_table` or
//! `subscription_table`; every other caller goes through `Handle`'s
//! mpsc channel. That single-owner design is what lets the tables be
//! plain `HashMap`s instead of `Mutex<HashMap>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::Config;
use crate::error::Error;
use crate::logging::LogSink;
use crate::token::Session;
use crate::worker_pool::WorkerPool;
use crate::ws::frame::{parse_inbound, Inbound, Outbound};
use crate::Result;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_MIGRATION_COMPLETE: u16 = 3000;
const CLOSE_MIGRATION_ABORTED: u16 = 3001;

/// A callback fired with an event's decoded content whenever a frame
/// for its `(event, key)` arrives.
pub(crate) type EventCallback = Box<dyn Fn(Value) + Send + Sync>;

enum Command {
    Send {
        method: &'static str,
        path: String,
        payload: Option<Value>,
        responder: oneshot::Sender<Result<Value>>,
    },
    Subscribe {
        event: String,
        key: Option<String>,
        callback: EventCallback,
        responder: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        event: String,
        key: Option<String>,
        responder: oneshot::Sender<Result<()>>,
    },
    SubscriptionCount {
        responder: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// A cheap, cloneable front-end to one Instance actor task.
#[derive(Clone)]
pub(crate) struct Handle {
    pub instance_id: u64,
    tx: mpsc::Sender<Command>,
}

impl Handle {
    pub(crate) async fn send_rpc(
        &self,
        method: &'static str,
        path: impl Into<String>,
        payload: Option<Value>,
    ) -> Result<Value> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(Command::Send {
                method,
                path: path.into(),
                payload,
                responder,
            })
            .await
            .map_err(|_| Error::RetriesExhausted("account socket instance is gone".into()))?;
        rx.await
            .map_err(|_| Error::RetriesExhausted("account socket instance dropped the request".into()))?
    }

    pub(crate) async fn subscribe(
        &self,
        event: impl Into<String>,
        key: Option<String>,
        callback: EventCallback,
    ) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(Command::Subscribe {
                event: event.into(),
                key,
                callback,
                responder,
            })
            .await
            .map_err(|_| Error::RetriesExhausted("account socket instance is gone".into()))?;
        rx.await
            .map_err(|_| Error::RetriesExhausted("account socket instance dropped the request".into()))?
    }

    pub(crate) async fn unsubscribe(&self, event: impl Into<String>, key: Option<String>) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(Command::Unsubscribe {
                event: event.into(),
                key,
                responder,
            })
            .await
            .map_err(|_| Error::RetriesExhausted("account socket instance is gone".into()))?;
        rx.await
            .map_err(|_| Error::RetriesExhausted("account socket instance dropped the request".into()))?
    }

    pub(crate) async fn subscription_count(&self) -> usize {
        let (responder, rx) = oneshot::channel();
        if self.tx.send(Command::SubscriptionCount { responder }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub(crate) async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

struct PendingRpc {
    responder: oneshot::Sender<Result<Value>>,
}

static MIGRATION_ID: AtomicU64 = AtomicU64::new(1);

/// Spawns a new Account-Socket Instance actor and returns a [`Handle`]
/// to it. `instance_id` is assigned by the [`crate::ws::router::SubscriptionRouter`],
/// which keeps the monotone counter across every Instance it creates.
pub(crate) fn spawn(
    instance_id: u64,
    config: Arc<Config>,
    session_rx: watch::Receiver<Option<Session>>,
    worker_pool: Arc<WorkerPool>,
    log: LogSink,
) -> Handle {
    let (tx, rx) = mpsc::channel(64);
    let log = log.with_suffix(format!("instance-{instance_id}"));
    tokio::spawn(run(instance_id, config, session_rx, worker_pool, log, rx));
    Handle { instance_id, tx }
}

struct ActorState {
    instance_id: u64,
    next_message_id: u64,
    pending_rpc: HashMap<u64, PendingRpc>,
    subscriptions: HashMap<(String, Option<String>), EventCallback>,
    /// The id of the most recently dispatched `POST /ws/migrate` RPC,
    /// if its response hasn't resolved yet. The platform sometimes
    /// confirms migration on an uncorrelated `id == 0` frame instead of
    /// echoing this id, so the same pending slot must be reachable from
    /// either path.
    pending_migrate_id: Option<u64>,
}

impl ActorState {
    fn new(instance_id: u64) -> Self {
        Self {
            instance_id,
            next_message_id: 1,
            pending_rpc: HashMap::new(),
            subscriptions: HashMap::new(),
            pending_migrate_id: None,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_message_id;
        self.next_message_id += 1;
        id
    }
}

async fn run(
    instance_id: u64,
    config: Arc<Config>,
    session_rx: watch::Receiver<Option<Session>>,
    worker_pool: Arc<WorkerPool>,
    log: LogSink,
    mut commands: mpsc::Receiver<Command>,
) {
    // `halted` latches shut while a migration or recovery is in flight;
    // `send_rpc` waits on it except for the migration RPC itself.
    let (halted_tx, halted_rx) = watch::channel(true);
    let mut state = ActorState::new(instance_id);

    let mut socket = match open_socket(&config, &session_rx, &log).await {
        Some(s) => s,
        None => {
            log.error("instance could not open its socket and will not run");
            return;
        }
    };
    let _ = halted_tx.send(false);

    'connection: loop {
        let mut ping_interval = interval(config.web_socket_ping_interval);
        let mut migration_deadline = Instant::now() + config.web_socket_migration_interval;

        loop {
            let sleep_until_migration =
                tokio::time::sleep_until(migration_deadline);
            tokio::pin!(sleep_until_migration);

            tokio::select! {
                maybe_cmd = commands.recv() => {
                    match maybe_cmd {
                        Some(Command::Shutdown) | None => {
                            let _ = socket.close(None).await;
                            return;
                        }
                        Some(cmd) => {
                            handle_command(
                                cmd,
                                &mut state,
                                &mut socket,
                                &session_rx,
                                &halted_rx,
                                &config,
                                &log,
                            ).await;
                        }
                    }
                }
                frame = socket.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            handle_inbound_text(&text, &mut state, &log);
                        }
                        Some(Ok(WsMessage::Binary(_))) => {
                            log.warn("dropping unexpected binary frame on account socket");
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            let _ = socket.send(WsMessage::Pong(payload)).await;
                        }
                        Some(Ok(WsMessage::Pong(_))) => {}
                        Some(Ok(WsMessage::Close(frame))) => {
                            let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(CLOSE_NORMAL);
                            log.warn(&format!("account socket closed with code {code}"));
                            if code == CLOSE_MIGRATION_COMPLETE || code == CLOSE_MIGRATION_ABORTED {
                                return;
                            }
                            let _ = halted_tx.send(true);
                            recover(
                                &mut state,
                                &mut socket,
                                &halted_tx,
                                &config,
                                &session_rx,
                                &worker_pool,
                                &log,
                            ).await;
                            continue 'connection;
                        }
                        Some(Ok(WsMessage::Frame(_))) => {}
                        Some(Err(e)) => {
                            log.error(&format!("account socket error: {e}"));
                            let _ = halted_tx.send(true);
                            recover(
                                &mut state,
                                &mut socket,
                                &halted_tx,
                                &config,
                                &session_rx,
                                &worker_pool,
                                &log,
                            ).await;
                            continue 'connection;
                        }
                        None => {
                            let _ = halted_tx.send(true);
                            recover(
                                &mut state,
                                &mut socket,
                                &halted_tx,
                                &config,
                                &session_rx,
                                &worker_pool,
                                &log,
                            ).await;
                            continue 'connection;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    let _ = socket.send(WsMessage::Ping(Vec::new().into())).await;
                }
                _ = &mut sleep_until_migration => {
                    match migrate(&mut state, &mut socket, &halted_tx, &config, &session_rx, &log).await {
                        Ok(new_socket) => {
                            socket = new_socket;
                            migration_deadline = Instant::now() + config.web_socket_migration_interval;
                            continue;
                        }
                        Err(e) => {
                            log.warn(&format!("migration failed, retrying later: {e}"));
                            migration_deadline = Instant::now() + config.web_socket_migration_retry_delay;
                            continue;
                        }
                    }
                }
            }
        }
    }
}

async fn handle_command(
    cmd: Command,
    state: &mut ActorState,
    socket: &mut Socket,
    session_rx: &watch::Receiver<Option<Session>>,
    halted_rx: &watch::Receiver<bool>,
    config: &Config,
    log: &LogSink,
) {
    match cmd {
        Command::Send {
            method,
            path,
            payload,
            responder,
        } => {
            let result = send_rpc(state, socket, session_rx, halted_rx, config, log, method, &path, payload).await;
            let _ = responder.send(result);
        }
        Command::Subscribe {
            event,
            key,
            callback,
            responder,
        } => {
            let dedupe_key = (event.clone(), key.clone());
            if state.subscriptions.contains_key(&dedupe_key) {
                let _ = responder.send(Err(Error::AlreadySubscribed(format!(
                    "{event}/{}",
                    key.unwrap_or_default()
                ))));
                return;
            }
            let path = match &key {
                Some(k) => format!("subscribe/{event}/{k}"),
                None => format!("subscribe/{event}"),
            };
            let result = send_rpc(state, socket, session_rx, halted_rx, config, log, "POST", &path, None).await;
            match result {
                Ok(_) => {
                    state.subscriptions.insert(dedupe_key, callback);
                    let _ = responder.send(Ok(()));
                }
                Err(e) => {
                    let _ = responder.send(Err(e));
                }
            }
        }
        Command::Unsubscribe { event, key, responder } => {
            let dedupe_key = (event.clone(), key.clone());
            if !state.subscriptions.contains_key(&dedupe_key) {
                let _ = responder.send(Err(Error::NotSubscribed(format!(
                    "{event}/{}",
                    key.unwrap_or_default()
                ))));
                return;
            }
            let path = match &key {
                Some(k) => format!("unsubscribe/{event}/{k}"),
                None => format!("unsubscribe/{event}"),
            };
            let result = send_rpc(state, socket, session_rx, halted_rx, config, log, "POST", &path, None).await;
            if result.is_ok() {
                state.subscriptions.remove(&dedupe_key);
            }
            let _ = responder.send(result.map(|_| ()));
        }
        Command::SubscriptionCount { responder } => {
            let _ = responder.send(state.subscriptions.len());
        }
        Command::Shutdown => {}
    }
}

/// Writes one outbound frame and registers its response slot. Returns
/// the `oneshot::Receiver` the caller awaits for the result — kept
/// separate from awaiting so a batch of RPCs can be dispatched
/// sequentially (the only way to touch `&mut Socket`) and then awaited
/// concurrently, without holding the mutable borrow across the await.
async fn dispatch_rpc(
    state: &mut ActorState,
    socket: &mut Socket,
    session_rx: &watch::Receiver<Option<Session>>,
    method: &'static str,
    path: &str,
    payload: Option<&Value>,
) -> Result<oneshot::Receiver<Result<Value>>> {
    let token = session_rx
        .borrow()
        .as_ref()
        .map(|s| s.access_token.to_string())
        .ok_or_else(|| Error::TransientNetwork("no session token available".into()))?;
    let id = state.next_id();
    let outbound = Outbound::new(method, path, id, &token, payload);
    let text = serde_json::to_string(&outbound).expect("Outbound always serializes");

    let (responder, rx) = oneshot::channel();
    state.pending_rpc.insert(id, PendingRpc { responder });
    if method == "POST" && path == "migrate" {
        state.pending_migrate_id = Some(id);
    }

    if let Err(e) = socket.send(WsMessage::Text(text.into())).await {
        state.pending_rpc.remove(&id);
        if state.pending_migrate_id == Some(id) {
            state.pending_migrate_id = None;
        }
        return Err(Error::TransientNetwork(format!("{method} {path}: {e}")));
    }
    Ok(rx)
}

#[allow(clippy::too_many_arguments)]
async fn send_rpc(
    state: &mut ActorState,
    socket: &mut Socket,
    session_rx: &watch::Receiver<Option<Session>>,
    halted_rx: &watch::Receiver<bool>,
    config: &Config,
    log: &LogSink,
    method: &'static str,
    path: &str,
    payload: Option<Value>,
) -> Result<Value> {
    if path != "migrate" {
        wait_for_gate_open(halted_rx).await;
    }

    let mut attempts = 0;
    loop {
        attempts += 1;
        let rx = match dispatch_rpc(state, socket, session_rx, method, path, payload.as_ref()).await {
            Ok(rx) => rx,
            Err(e) => {
                if attempts >= config.web_socket_request_attempts {
                    return Err(Error::RetriesExhausted(format!(
                        "{method} {path} failed after {attempts} attempts: {e}"
                    )));
                }
                log.warn(&format!("send failed on attempt {attempts}, retrying: {e}"));
                tokio::time::sleep(config.web_socket_request_retry_delay).await;
                continue;
            }
        };

        match rx.await {
            Ok(result) => return result,
            Err(_) => {
                if attempts >= config.web_socket_request_attempts {
                    return Err(Error::RetriesExhausted(format!(
                        "{method} {path} was dropped after {attempts} attempts"
                    )));
                }
                tokio::time::sleep(config.web_socket_request_retry_delay).await;
                continue;
            }
        }
    }
}

async fn wait_for_gate_open(halted_rx: &watch::Receiver<bool>) {
    let mut rx = halted_rx.clone();
    while *rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn handle_inbound_text(text: &str, state: &mut ActorState, log: &LogSink) {
    match parse_inbound(text) {
        Ok(Inbound::Event { event, key, content }) => {
            if let Some(cb) = state.subscriptions.get(&(event.clone(), key.clone())) {
                cb(content);
            } else if let Some(cb) = state.subscriptions.get(&(event, None)) {
                cb(content);
            }
        }
        Ok(Inbound::Response { id, response_code, content }) => {
            if state.pending_migrate_id == Some(id) {
                state.pending_migrate_id = None;
            }
            if let Some(pending) = state.pending_rpc.remove(&id) {
                let result = if (200..300).contains(&response_code) {
                    Ok(content)
                } else {
                    Err(Error::RetriesExhausted(format!(
                        "rpc {id} returned response code {response_code}"
                    )))
                };
                let _ = pending.responder.send(result);
            }
        }
        Ok(Inbound::MigrateConfirmation { response_code, content }) => {
            match state.pending_migrate_id.take() {
                Some(id) => {
                    if let Some(pending) = state.pending_rpc.remove(&id) {
                        let result = if (200..300).contains(&response_code) {
                            Ok(content)
                        } else {
                            Err(Error::RetriesExhausted(format!(
                                "migrate confirmation returned response code {response_code}"
                            )))
                        };
                        let _ = pending.responder.send(result);
                    }
                }
                None => {
                    log.warn("received an uncorrelated migrate confirmation frame with no pending migrate RPC");
                }
            }
        }
        Err(e) => {
            log.warn(&format!("dropping unparseable account-socket frame: {e}"));
        }
    }
}

async fn open_socket(
    config: &Config,
    session_rx: &watch::Receiver<Option<Session>>,
    log: &LogSink,
) -> Option<Socket> {
    loop {
        let token = match session_rx.borrow().as_ref() {
            Some(s) => s.access_token.to_string(),
            None => {
                tokio::time::sleep(Duration::from_millis(250)).await;
                continue;
            }
        };
        let request = match build_connect_request(&config.web_socket_url, &token, &config.x_api_key, &config.user_agent) {
            Ok(r) => r,
            Err(e) => {
                log.error(&format!("invalid websocket url: {e}"));
                return None;
            }
        };
        match connect_async(request).await {
            Ok((socket, _)) => return Some(socket),
            Err(e) => {
                log.warn(&format!(
                    "account socket open failed, retrying in {:?}: {e}",
                    config.web_socket_recovery_retry_delay
                ));
                tokio::time::sleep(config.web_socket_recovery_retry_delay).await;
            }
        }
    }
}

fn build_connect_request(
    url: &str,
    token: &str,
    api_key: &str,
    user_agent: &str,
) -> std::result::Result<tokio_tungstenite::tungstenite::handshake::client::Request, String> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let mut request = url.into_client_request().map_err(|e| e.to_string())?;
    let headers = request.headers_mut();
    headers.insert(
        "authorization",
        format!("Bearer {token}").parse().map_err(|_| "bad token header".to_string())?,
    );
    headers.insert(
        "x-api-key",
        api_key.parse().map_err(|_| "bad api key header".to_string())?,
    );
    headers.insert(
        "user-agent",
        user_agent.parse().map_err(|_| "bad user-agent header".to_string())?,
    );
    Ok(request)
}

/// Re-posts every `(event, key)` in `snapshot` in chunks of
/// `maxWorkerConcurrency`: each chunk is dispatched onto the socket
/// sequentially (the socket has exactly one owner) and then awaited
/// concurrently, bounding how many resubscribe RPCs are in flight at
/// once without requiring the socket to be shared across tasks.
async fn resubscribe_snapshot(
    state: &mut ActorState,
    socket: &mut Socket,
    session_rx: &watch::Receiver<Option<Session>>,
    config: &Config,
    snapshot: &[(String, Option<String>)],
) -> Result<()> {
    for chunk in snapshot.chunks(config.max_worker_concurrency.max(1)) {
        let mut pending = Vec::with_capacity(chunk.len());
        for (event, key) in chunk {
            let path = match key {
                Some(k) => format!("subscribe/{event}/{k}"),
                None => format!("subscribe/{event}"),
            };
            let rx = dispatch_rpc(state, socket, session_rx, "POST", &path, None).await?;
            pending.push(rx);
        }
        let results = futures_util::future::join_all(pending).await;
        for result in results {
            match result {
                Ok(Ok(_)) => {}
                _ => {
                    return Err(Error::RecoveryFailed(
                        "one or more subscriptions were rejected during recovery".into(),
                    ))
                }
            }
        }
    }
    Ok(())
}

/// Implements the migration protocol from the specification: fetch a
/// migration token over the current socket, open a new socket, hand
/// the token to `POST /ws/migrate` over the new socket, then let the
/// old one linger for the handover period before closing it with 3000.
/// On any failure past step 3 the new socket is closed with 3001 and
/// Recovery takes over instead of retrying migration directly —
/// experience elsewhere in the ecosystem is that server-side
/// subscription state can't be trusted after a half-finished handover.
async fn migrate(
    state: &mut ActorState,
    socket: &mut Socket,
    halted_tx: &watch::Sender<bool>,
    config: &Config,
    session_rx: &watch::Receiver<Option<Session>>,
    log: &LogSink,
) -> Result<Socket> {
    let halted_rx = halted_tx.subscribe();
    wait_for_gate_open(&halted_rx).await;

    let migrate_token = send_rpc(state, socket, session_rx, &halted_rx, config, log, "GET", "migrate", None).await?;

    let _ = halted_tx.send(true);

    let mut new_socket = match open_socket(config, session_rx, log).await {
        Some(s) => s,
        None => {
            let _ = halted_tx.send(false);
            return Err(Error::RetriesExhausted("could not open socket for migration".into()));
        }
    };

    let migration_id = MIGRATION_ID.fetch_add(1, Ordering::SeqCst);
    log.debug(&format!("migration {migration_id} handing over"));

    let new_halted = watch::channel(false).1;
    let confirm = send_rpc(
        state,
        &mut new_socket,
        session_rx,
        &new_halted,
        config,
        log,
        "POST",
        "migrate",
        Some(migrate_token),
    )
    .await;

    if confirm.is_err() {
        let close = CloseFrame {
            code: CloseCode::from(CLOSE_MIGRATION_ABORTED),
            reason: "migration aborted".into(),
        };
        let _ = new_socket.close(Some(close)).await;
        let _ = halted_tx.send(false);
        return Err(Error::RecoveryFailed("migration handshake was refused".into()));
    }

    let _ = halted_tx.send(false);

    let handover = config.web_socket_migration_handover_period;
    let old_close = async move {
        tokio::time::sleep(handover).await;
        let close = CloseFrame {
            code: CloseCode::from(CLOSE_MIGRATION_COMPLETE),
            reason: "migration complete".into(),
        };
        let _ = socket.close(Some(close)).await;
    };
    tokio::spawn(old_close);

    Ok(new_socket)
}

/// Recovery: snapshot the current subscription table, reopen a socket,
/// and re-post every subscription, racing the aggregate against
/// `webSocketRecoveryTimeout`. Restores the snapshot and retries from
/// the top on any failure, per the specification.
///
/// Resubscribe frames are dispatched in chunks of `maxWorkerConcurrency`
/// — sent sequentially within a chunk (cheap, just socket writes), then
/// awaited concurrently — which keeps resubscription bounded the way
/// the Worker Pool bounds any other fan-out in this crate, without
/// needing the socket itself to be shared across spawned tasks; only
/// this actor ever touches it.
async fn recover(
    state: &mut ActorState,
    socket: &mut Socket,
    halted_tx: &watch::Sender<bool>,
    config: &Config,
    session_rx: &watch::Receiver<Option<Session>>,
    _worker_pool: &Arc<WorkerPool>,
    log: &LogSink,
) {
    loop {
        let _ = halted_tx.send(true);
        let snapshot: Vec<(String, Option<String>)> = state.subscriptions.keys().cloned().collect();

        let new_socket = match open_socket(config, session_rx, log).await {
            Some(s) => s,
            None => {
                tokio::time::sleep(config.web_socket_recovery_retry_delay).await;
                continue;
            }
        };
        *socket = new_socket;
        let _ = halted_tx.send(false);

        if snapshot.is_empty() {
            return;
        }

        let outcome = tokio::time::timeout(
            config.web_socket_recovery_timeout,
            resubscribe_snapshot(state, socket, session_rx, config, &snapshot),
        )
        .await;

        match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                log.warn(&format!("recovery resubscribe failed, retrying: {e}"));
            }
            Err(_) => {
                log.warn("recovery timed out re-posting subscriptions, retrying");
            }
        }
        tokio::time::sleep(config.web_socket_recovery_retry_delay).await;
    }
}
