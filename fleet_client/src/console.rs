//! Console WebSocket: one connection per online game server.
//!
//! Structurally the lightweight cousin of the Account-Socket Instance —
//! same actor task, same correlation-id pending-command table idiom —
//! without migration or a halted gate, since the platform's console
//! sockets are tied to the server process rather than an account
//! session. Grounded the same way the account Instance is: a `select!`
//! loop over socket/I-O and a command channel, matching
//! `yahoo_logic::upstream::run`'s shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::error::Error;
use crate::logging::LogSink;
use crate::Result;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Guard against subscribe/unsubscribe-shaped commands being sent
/// through the plain command channel — those go through
/// [`ConsoleConnection::subscribe`]/[`ConsoleConnection::unsubscribe`]
/// instead, matching the specification's invalid-usage rule.
fn looks_like_subscription_command(command: &str) -> bool {
    Regex::new(r"(?i)^(websocket )?(un)?subscribe")
        .unwrap()
        .is_match(command.trim())
}

#[derive(Debug, Clone, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, rename = "eventType")]
    event_type: Option<String>,
    #[serde(default, rename = "commandId")]
    command_id: Option<u64>,
    #[serde(default)]
    data: Value,
    #[serde(default, rename = "timeStamp")]
    #[allow(dead_code)]
    time_stamp: Option<i64>,
}

enum Command {
    Send {
        command: String,
        responder: oneshot::Sender<Result<Value>>,
    },
    Subscribe {
        event: String,
        callback: Box<dyn Fn(Value) + Send + Sync>,
        responder: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        event: String,
        responder: oneshot::Sender<Result<()>>,
    },
    Dispose,
}

/// What a pending command id resolves to once its `CommandResult`
/// arrives. `Send` just forwards the raw payload; `Subscribe`/
/// `Unsubscribe` additionally mutate `event_callbacks` on success,
/// since the wire command must round-trip before the local callback
/// table is considered authoritative.
enum PendingKind {
    Send(oneshot::Sender<Result<Value>>),
    Subscribe {
        event: String,
        callback: Box<dyn Fn(Value) + Send + Sync>,
        responder: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        event: String,
        responder: oneshot::Sender<Result<()>>,
    },
}

/// A live connection to one game server's console.
///
/// Cheap to clone: every clone shares the same underlying actor task
/// via an `mpsc::Sender`.
#[derive(Clone)]
pub struct ConsoleConnection {
    server_id: String,
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for ConsoleConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleConnection")
            .field("server_id", &self.server_id)
            .finish()
    }
}

impl ConsoleConnection {
    /// The id of the game server this connection is attached to.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Sends a command string and waits for its `CommandResult`.
    ///
    /// Returns `Error::InvalidUsage` for a subscribe/unsubscribe-shaped
    /// command string; use [`Self::subscribe`]/[`Self::unsubscribe`]
    /// for those instead.
    pub async fn send(&self, command: impl Into<String>) -> Result<Value> {
        let command = command.into();
        if looks_like_subscription_command(&command) {
            return Err(Error::invalid_usage(
                "use ConsoleConnection::subscribe/unsubscribe for subscription commands",
            ));
        }
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(Command::Send { command, responder })
            .await
            .map_err(|_| Error::RetriesExhausted("console connection is gone".into()))?;
        rx.await
            .map_err(|_| Error::RetriesExhausted("console connection dropped the request".into()))?
    }

    /// Subscribes to a named console event, invoking `callback` with
    /// its decoded `data` payload on every occurrence.
    pub async fn subscribe(
        &self,
        event: impl Into<String>,
        callback: impl Fn(Value) + Send + Sync + 'static,
    ) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(Command::Subscribe {
                event: event.into(),
                callback: Box::new(callback),
                responder,
            })
            .await
            .map_err(|_| Error::RetriesExhausted("console connection is gone".into()))?;
        rx.await
            .map_err(|_| Error::RetriesExhausted("console connection dropped the request".into()))?
    }

    pub async fn unsubscribe(&self, event: impl Into<String>) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(Command::Unsubscribe {
                event: event.into(),
                responder,
            })
            .await
            .map_err(|_| Error::RetriesExhausted("console connection is gone".into()))?;
        rx.await
            .map_err(|_| Error::RetriesExhausted("console connection dropped the request".into()))?
    }

    /// Tears the connection down without waiting for the server to
    /// acknowledge anything.
    pub async fn dispose(&self) {
        let _ = self.tx.send(Command::Dispose).await;
    }
}

static COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Opens a console connection to `address:port`, authenticating with
/// `token` as the raw first outbound frame, and waits for the
/// `"Connection Succeeded"` info log before returning. The caller
/// (the owning [`crate::server::ServerManager`]) is responsible for
/// reconnect-on-abnormal-close; this function only performs one
/// attempt.
pub(crate) async fn connect(
    server_id: String,
    address: &str,
    port: u16,
    token: &str,
    log: LogSink,
) -> Result<ConsoleConnection> {
    let url = format!("ws://{address}:{port}");
    let (mut socket, _) = connect_async(url.as_str())
        .await
        .map_err(|e| Error::ConsoleRefused(format!("{url}: {e}")))?;

    socket
        .send(WsMessage::Text(token.to_owned().into()))
        .await
        .map_err(|e| Error::ConsoleRefused(format!("sending auth token: {e}")))?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(Error::ConsoleRefused(
                "console did not confirm authentication".into(),
            ));
        }
        let next = tokio::time::timeout(remaining, socket.next()).await;
        match next {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                if let Ok(frame) = serde_json::from_str::<InboundFrame>(&text) {
                    if frame.kind == "SystemMessage"
                        && frame.event_type.as_deref() == Some("InfoLog")
                        && frame
                            .data
                            .as_str()
                            .map(|s| s.starts_with("Connection Succeeded"))
                            .unwrap_or(false)
                    {
                        break;
                    }
                }
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => return Err(Error::ConsoleRefused(e.to_string())),
            Ok(None) => return Err(Error::ConsoleRefused("console closed before authenticating".into())),
            Err(_) => return Err(Error::ConsoleRefused("timed out waiting for authentication".into())),
        }
    }

    let (tx, rx) = mpsc::channel(32);
    log.info(&format!("console connection open for server {server_id}"));
    tokio::spawn(run(server_id.clone(), socket, rx, log));

    Ok(ConsoleConnection { server_id, tx })
}

async fn run(server_id: String, mut socket: Socket, mut commands: mpsc::Receiver<Command>, log: LogSink) {
    let mut pending: HashMap<u64, PendingKind> = HashMap::new();
    let mut event_callbacks: HashMap<String, Box<dyn Fn(Value) + Send + Sync>> = HashMap::new();

    loop {
        tokio::select! {
            maybe_cmd = commands.recv() => {
                match maybe_cmd {
                    None | Some(Command::Dispose) => {
                        let _ = socket.close(None).await;
                        return;
                    }
                    Some(Command::Send { command, responder }) => {
                        let id = COMMAND_ID.fetch_add(1, Ordering::SeqCst);
                        let frame = serde_json::json!({ "id": id, "content": command }).to_string();
                        if let Err(e) = socket.send(WsMessage::Text(frame.into())).await {
                            let _ = responder.send(Err(Error::TransientNetwork(e.to_string())));
                            continue;
                        }
                        pending.insert(id, PendingKind::Send(responder));
                    }
                    Some(Command::Subscribe { event, callback, responder }) => {
                        if event_callbacks.contains_key(&subscription_key(&event)) {
                            let _ = responder.send(Err(Error::AlreadySubscribed(event)));
                            continue;
                        }
                        let id = COMMAND_ID.fetch_add(1, Ordering::SeqCst);
                        let command = format!("websocket subscribe {event}");
                        let frame = serde_json::json!({ "id": id, "content": command }).to_string();
                        if let Err(e) = socket.send(WsMessage::Text(frame.into())).await {
                            let _ = responder.send(Err(Error::TransientNetwork(e.to_string())));
                            continue;
                        }
                        pending.insert(id, PendingKind::Subscribe { event, callback, responder });
                    }
                    Some(Command::Unsubscribe { event, responder }) => {
                        if !event_callbacks.contains_key(&subscription_key(&event)) {
                            let _ = responder.send(Err(Error::NotSubscribed(event)));
                            continue;
                        }
                        let id = COMMAND_ID.fetch_add(1, Ordering::SeqCst);
                        let command = format!("websocket unsubscribe {event}");
                        let frame = serde_json::json!({ "id": id, "content": command }).to_string();
                        if let Err(e) = socket.send(WsMessage::Text(frame.into())).await {
                            let _ = responder.send(Err(Error::TransientNetwork(e.to_string())));
                            continue;
                        }
                        pending.insert(id, PendingKind::Unsubscribe { event, responder });
                    }
                }
            }
            frame = socket.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_inbound(&text, &mut pending, &mut event_callbacks, &log);
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log.warn(&format!("console connection for server {server_id} closed"));
                        return;
                    }
                    Some(Err(e)) => {
                        log.error(&format!("console connection error for server {server_id}: {e}"));
                        return;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// The local dispatch key for an event subscribed via
/// `ConsoleConnection::subscribe`, matching the `"<type>/<eventType>"`
/// general dispatch form the platform uses for subscription pushes
/// (`type == "Subscription"`).
fn subscription_key(event: &str) -> String {
    format!("Subscription/{event}")
}

fn handle_inbound(
    text: &str,
    pending: &mut HashMap<u64, PendingKind>,
    event_callbacks: &mut HashMap<String, Box<dyn Fn(Value) + Send + Sync>>,
    log: &LogSink,
) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            log.warn(&format!("dropping unparseable console frame: {e}"));
            return;
        }
    };

    if let Some(id) = frame.command_id {
        if let Some(resolved) = pending.remove(&id) {
            match resolved {
                PendingKind::Send(responder) => {
                    let _ = responder.send(Ok(frame.data));
                }
                PendingKind::Subscribe { event, callback, responder } => {
                    event_callbacks.insert(subscription_key(&event), callback);
                    let _ = responder.send(Ok(()));
                }
                PendingKind::Unsubscribe { event, responder } => {
                    event_callbacks.remove(&subscription_key(&event));
                    let _ = responder.send(Ok(()));
                }
            }
            return;
        }
    }

    // No commandId: dispatch by name, "<type>[/<eventType>]".
    let dispatch_key = match frame.event_type.as_deref() {
        Some(event_type) => format!("{}/{event_type}", frame.kind),
        None => frame.kind.clone(),
    };
    if let Some(cb) = event_callbacks.get(&dispatch_key) {
        cb(frame.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_shaped_commands_are_rejected() {
        assert!(looks_like_subscription_command("subscribe chat"));
        assert!(looks_like_subscription_command("UNSUBSCRIBE chat"));
        assert!(looks_like_subscription_command("websocket subscribe chat"));
        assert!(!looks_like_subscription_command("say hello"));
    }
}
