//! Shared REST/WebSocket payload shapes.
//!
//! These mirror the wire shapes the platform returns; this crate treats
//! unknown JSON fields as transparent and only models what it reads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A named role with a permission list, scoped to one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub role_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// A group account this identity has access to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub servers: Vec<ServerStub>,
}

/// A server id reference embedded in a group's initial descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStub {
    pub id: String,
}

/// One identity's membership in a group: which role it holds there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub role_id: String,
}

/// `{group, member}` pair the platform returns for every group an
/// identity has joined, e.g. from `listJoinedGroups` or the
/// `me-group-create` account channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group: Group,
    pub member: Member,
}

/// A pending invite to join a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInvite {
    pub group_id: String,
    #[serde(default)]
    pub inviter_id: Option<String>,
}

/// Metadata about one game server owned by a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub group_id: String,
    #[serde(default)]
    pub name: String,
    /// Fleet tag, e.g. `"att-release"`. Only servers whose fleet is in
    /// `Config::supported_server_fleets` get an automatic console
    /// connection.
    #[serde(default)]
    pub fleet: String,
    #[serde(default)]
    pub online: bool,
}

/// The address/port pair a console connection dials, present only
/// when `ConnectionDetails::allowed` is `true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionAddress {
    pub address: String,
    pub websocket_port: u16,
}

/// The response to `getServerConnectionDetails`. `allowed` gates
/// everything else: when it is `false`, or when `connection`/`token`
/// are missing despite `allowed` being `true`, opening a console
/// connection must fail with `Error::ConsoleRefused` rather than
/// attempting a socket dial with partial data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDetails {
    #[serde(default)]
    pub allowed: bool,
    #[serde(default)]
    pub connection: Option<ConnectionAddress>,
    #[serde(default)]
    pub token: Option<String>,
}

/// A server status or heartbeat payload, delivered over both the
/// `group-server-status` and `group-server-heartbeat` account-socket
/// channels and folded into the same `manageServerConnection` gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatusEvent {
    pub id: String,
    #[serde(default, rename = "isOnline")]
    pub is_online: bool,
    #[serde(default)]
    pub online_players: Vec<serde_json::Value>,
}

/// Arbitrary extra fields carried on a JWT payload beyond the claims
/// this crate reads directly. Kept so a future claim never needs a
/// parser change just to pass through untouched.
pub type ExtraClaims = HashMap<String, serde_json::Value>;
