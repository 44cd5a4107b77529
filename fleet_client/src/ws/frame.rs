//! Account WebSocket wire shapes.
//!
//! Outbound frames are `{method, path, authorization, id, content}`;
//! inbound frames come in two flavours distinguished by `id`: `id == 0`
//! is a streamed event, `id > 0` is an RPC response. Both are folded
//! into one [`Inbound`] enum at the parse boundary so the rest of the
//! Instance actor never matches on raw JSON again.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An outbound account-socket frame.
#[derive(Debug, Serialize)]
pub(crate) struct Outbound {
    pub method: &'static str,
    pub path: String,
    pub authorization: String,
    pub id: u64,
    /// Stringified JSON payload, matching the platform's
    /// content-is-a-string-not-a-nested-object convention.
    pub content: Option<String>,
}

impl Outbound {
    pub(crate) fn new(
        method: &'static str,
        path: impl Into<String>,
        id: u64,
        token: &str,
        payload: Option<&Value>,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            authorization: format!("Bearer {token}"),
            id,
            content: payload.map(|v| v.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawInbound {
    id: u64,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default, rename = "responseCode")]
    response_code: Option<u16>,
    #[serde(default)]
    content: Option<String>,
}

/// The `key` the platform stamps on the uncorrelated migrate
/// confirmation frame — see [`Inbound::MigrateConfirmation`].
const MIGRATE_RESPONSE_KEY: &str = "POST /ws/migrate";

/// A parsed inbound account-socket frame.
#[derive(Debug, Clone)]
pub(crate) enum Inbound {
    /// `id == 0`: a streamed event for `subscriptionTable[event/key]`.
    Event {
        event: String,
        key: Option<String>,
        content: Value,
    },
    /// `id > 0`: the resolution of a previously-sent RPC.
    Response {
        id: u64,
        response_code: u16,
        content: Value,
    },
    /// `id == 0`, but `event == "response"` and
    /// `key == "POST /ws/migrate"`: the platform does not always echo
    /// a correlatable id for the migrate RPC's response, so this case
    /// is split out and resolved out-of-band instead of by id.
    MigrateConfirmation { response_code: u16, content: Value },
}

/// Parses a raw text frame into an [`Inbound`], per the `id == 0` vs.
/// `id > 0` dispatch rule. Frames missing both `event` (for an event
/// frame) and a sensible `content` are rejected and logged by the
/// caller, not here — this function only knows the wire shape.
pub(crate) fn parse_inbound(text: &str) -> Result<Inbound, String> {
    let raw: RawInbound = serde_json::from_str(text).map_err(|e| e.to_string())?;

    let content = match raw.content.as_deref() {
        None | Some("") => Value::Null,
        Some(s) => serde_json::from_str(s).map_err(|e| format!("bad content JSON: {e}"))?,
    };

    if raw.id == 0 {
        if raw.event.as_deref() == Some("response") && raw.key.as_deref() == Some(MIGRATE_RESPONSE_KEY) {
            return Ok(Inbound::MigrateConfirmation {
                response_code: raw.response_code.unwrap_or(200),
                content,
            });
        }
        let event = raw
            .event
            .ok_or_else(|| "event frame missing `event` field".to_string())?;
        Ok(Inbound::Event {
            event,
            key: raw.key,
            content,
        })
    } else {
        Ok(Inbound::Response {
            id: raw.id,
            response_code: raw.response_code.unwrap_or(200),
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_frame() {
        let text = r#"{"id":0,"event":"group-server-heartbeat","key":"42/7","responseCode":200,"content":"{\"isOnline\":true}"}"#;
        match parse_inbound(text).unwrap() {
            Inbound::Event { event, key, content } => {
                assert_eq!(event, "group-server-heartbeat");
                assert_eq!(key.as_deref(), Some("42/7"));
                assert_eq!(content["isOnline"], true);
            }
            other => panic!("expected Event, got {other:?}"),
        }
    }

    #[test]
    fn parses_response_frame_with_empty_content() {
        let text = r#"{"id":7,"event":"response","responseCode":200,"content":""}"#;
        match parse_inbound(text).unwrap() {
            Inbound::Response {
                id,
                response_code,
                content,
            } => {
                assert_eq!(id, 7);
                assert_eq!(response_code, 200);
                assert!(content.is_null());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn rejects_event_frame_without_event_name() {
        let text = r#"{"id":0,"content":""}"#;
        assert!(parse_inbound(text).is_err());
    }

    #[test]
    fn parses_uncorrelated_migrate_confirmation() {
        let text = r#"{"id":0,"event":"response","key":"POST /ws/migrate","responseCode":200,"content":""}"#;
        match parse_inbound(text).unwrap() {
            Inbound::MigrateConfirmation { response_code, content } => {
                assert_eq!(response_code, 200);
                assert!(content.is_null());
            }
            other => panic!("expected MigrateConfirmation, got {other:?}"),
        }
    }
}
