//! Client configuration.
//!
//! A single struct carries every tunable the connection-management
//! subsystem reads. It is built once by the caller (or via
//! [`Config::default`]) and handed to the [`crate::Client`] as an `Arc`,
//! the same "build once, clone/share into every task" shape
//! `yahoo_logic::config::Config` uses across `upstream::run`,
//! `downstream::run`, and `monitor::run`.
//!
//! Unlike that teacher config there is no `clap::Parser` derive here:
//! this crate is a library embedded in a host application, not a binary
//! with its own argv, so there is nothing to parse from the command
//! line. The host is expected to build a `Config` from whatever source
//! it likes (env vars, a file, hardcoded) and hand it to
//! [`crate::ClientBuilder`].

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The credential set used to authenticate with the platform.
///
/// The two variants are mutually exclusive — a client is either a bot
/// acting under client-credentials, or a user acting under a password.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Credentials {
    /// Client-credentials grant, scoped to a fixed set of [`Scope`]s.
    Bot {
        client_id: String,
        client_secret: String,
        scopes: Vec<Scope>,
    },
    /// Username/password-hash grant. `password_hash` may be a plaintext
    /// password (it will be hashed on first use) or an already-computed
    /// lowercase SHA-512 hex digest.
    User {
        username: String,
        password_hash: String,
    },
}

/// A single permission scope grantable to a bot credential set.
///
/// The concrete member list is owned by the platform; this crate only
/// needs to move scope names through the auth request untouched, so new
/// scopes never require a crate release. A bot-side consumer values
/// passing a closed enum less than the platform adding a scope this
/// crate doesn't yet know about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(pub String);

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log verbosity threshold. Calls below the configured threshold are
/// no-ops; this mirrors `LoggerLocal`'s per-level gating in the teacher
/// crate, minus the TTY/voice/file fan-out (the host owns where log
/// lines actually go — this crate only decides whether to emit one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogVerbosity {
    Quiet,
    Error,
    Warning,
    Info,
    Debug,
}

impl Default for LogVerbosity {
    fn default() -> Self {
        LogVerbosity::Info
    }
}

/// Every tunable recognised by the connection-management subsystem.
///
/// Field defaults reproduce the defaults table from the specification
/// verbatim; see the `config_defaults` test below for the regression
/// check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub credentials: Credentials,

    /// Denylist of group ids. Ignored for any id present in
    /// `included_groups` when that list is non-empty.
    pub excluded_groups: HashSet<String>,
    /// Allowlist of group ids. Non-empty ⇒ allowlist wins over the
    /// denylist for listed ids.
    pub included_groups: HashSet<String>,

    pub log_verbosity: LogVerbosity,
    pub log_prefix: String,

    /// Bound on the Worker Pool. A value above 10 is accepted but logs
    /// a warning at `Client` construction.
    pub max_worker_concurrency: usize,
    /// Account-socket fan-out cap: the maximum number of subscriptions
    /// routed onto one Account-Socket Instance before the Router opens
    /// a new one.
    pub max_subscriptions_per_websocket: usize,
    /// Consecutive missed heartbeats before a server's console
    /// connection is considered dead.
    pub max_missed_server_heartbeats: u32,

    pub server_heartbeat_interval: Duration,
    pub server_connection_recovery_delay: Duration,

    /// Fleet tags eligible for an automatic console connection.
    pub supported_server_fleets: HashSet<String>,

    pub web_socket_ping_interval: Duration,
    pub web_socket_migration_interval: Duration,
    pub web_socket_migration_handover_period: Duration,
    pub web_socket_migration_retry_delay: Duration,
    pub web_socket_recovery_retry_delay: Duration,
    pub web_socket_recovery_timeout: Duration,
    pub web_socket_request_attempts: u32,
    pub web_socket_request_retry_delay: Duration,

    pub api_request_attempts: u32,
    pub api_request_retry_delay: Duration,
    pub api_request_timeout: Duration,

    pub rest_base_url: String,
    /// Bot (client-credentials) token endpoint.
    pub token_url: String,
    /// User (username/password-hash) sessions endpoint — distinct from
    /// `token_url`, since the two credential kinds authenticate against
    /// different endpoints with different wire shapes.
    pub sessions_url: String,
    pub web_socket_url: String,
    pub x_api_key: String,

    /// `User-Agent` header value sent on every REST request and socket
    /// upgrade: `"<agent-name>/<version>"`.
    pub user_agent: String,
}

impl Config {
    /// Builds a `Config` with every default from the specification,
    /// given only the fields that have no sensible default:
    /// credentials and the endpoint/key values.
    pub fn new(
        credentials: Credentials,
        rest_base_url: impl Into<String>,
        token_url: impl Into<String>,
        sessions_url: impl Into<String>,
        web_socket_url: impl Into<String>,
        x_api_key: impl Into<String>,
    ) -> Self {
        Self {
            credentials,
            excluded_groups: HashSet::new(),
            included_groups: HashSet::new(),
            log_verbosity: LogVerbosity::default(),
            log_prefix: String::new(),
            max_worker_concurrency: 5,
            max_subscriptions_per_websocket: 500,
            max_missed_server_heartbeats: 3,
            server_heartbeat_interval: Duration::from_secs(20),
            server_connection_recovery_delay: Duration::from_secs(10),
            supported_server_fleets: ["att-release", "att-quest"]
                .into_iter()
                .map(String::from)
                .collect(),
            web_socket_ping_interval: Duration::from_secs(5 * 60),
            web_socket_migration_interval: Duration::from_secs(110 * 60),
            web_socket_migration_handover_period: Duration::from_secs(10),
            web_socket_migration_retry_delay: Duration::from_secs(10),
            web_socket_recovery_retry_delay: Duration::from_secs(5),
            web_socket_recovery_timeout: Duration::from_secs(2 * 60),
            web_socket_request_attempts: 3,
            web_socket_request_retry_delay: Duration::from_secs(3),
            api_request_attempts: 3,
            api_request_retry_delay: Duration::from_secs(3),
            api_request_timeout: Duration::from_secs(5),
            rest_base_url: rest_base_url.into(),
            token_url: token_url.into(),
            sessions_url: sessions_url.into(),
            web_socket_url: web_socket_url.into(),
            x_api_key: x_api_key.into(),
            user_agent: format!("fleet_client/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// `true` if `max_worker_concurrency` exceeds the warning threshold
    /// named in the specification (10).
    pub fn worker_concurrency_is_high(&self) -> bool {
        self.max_worker_concurrency > 10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_credentials() -> Credentials {
        Credentials::Bot {
            client_id: "id".into(),
            client_secret: "secret".into(),
            scopes: vec![],
        }
    }

    #[test]
    fn config_defaults_match_specification() {
        let cfg = Config::new(sample_credentials(), "https://rest", "https://token", "https://sessions", "wss://ws", "key");
        assert_eq!(cfg.max_worker_concurrency, 5);
        assert_eq!(cfg.max_subscriptions_per_websocket, 500);
        assert_eq!(cfg.max_missed_server_heartbeats, 3);
        assert_eq!(cfg.server_heartbeat_interval, Duration::from_secs(20));
        assert_eq!(cfg.server_connection_recovery_delay, Duration::from_secs(10));
        assert!(cfg.supported_server_fleets.contains("att-release"));
        assert!(cfg.supported_server_fleets.contains("att-quest"));
        assert_eq!(cfg.web_socket_ping_interval, Duration::from_secs(300));
        assert_eq!(cfg.web_socket_migration_interval, Duration::from_secs(6600));
        assert_eq!(cfg.web_socket_migration_handover_period, Duration::from_secs(10));
        assert_eq!(cfg.web_socket_migration_retry_delay, Duration::from_secs(10));
        assert_eq!(cfg.web_socket_recovery_retry_delay, Duration::from_secs(5));
        assert_eq!(cfg.web_socket_recovery_timeout, Duration::from_secs(120));
        assert_eq!(cfg.web_socket_request_attempts, 3);
        assert_eq!(cfg.web_socket_request_retry_delay, Duration::from_secs(3));
        assert_eq!(cfg.api_request_attempts, 3);
        assert_eq!(cfg.api_request_retry_delay, Duration::from_secs(3));
        assert_eq!(cfg.api_request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn worker_concurrency_warns_above_ten() {
        let mut cfg = Config::new(sample_credentials(), "https://rest", "https://token", "https://sessions", "wss://ws", "key");
        assert!(!cfg.worker_concurrency_is_high());
        cfg.max_worker_concurrency = 11;
        assert!(cfg.worker_concurrency_is_high());
    }
}
