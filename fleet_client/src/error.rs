//! Error kinds surfaced by this crate.
//!
//! Most network and protocol errors inside the streaming pipeline are
//! caught locally, logged, and retried — they never reach this enum's
//! callers. What does surface are construction-time misconfiguration,
//! synchronous usage mistakes, and the final resolution of a
//! caller-initiated request (see `Client::open_server_connection`).

use thiserror::Error;

/// The error type returned by fallible `fleet_client` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Credentials were missing or ambiguous at construction time.
    #[error("invalid client configuration: {0}")]
    Config(String),

    /// A network operation (HTTP request, socket open, socket send)
    /// failed and the configured retry budget was exhausted.
    #[error("network request failed after retries: {0}")]
    RetriesExhausted(String),

    /// A single transient network failure, before any retry has been
    /// attempted. Internal call sites usually convert this into
    /// `RetriesExhausted` once the retry budget runs out.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The caller invoked an API in a way the protocol disallows, e.g.
    /// sending a subscribe-shaped command through `ConsoleConnection::send`.
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// `subscribe` was called for an `(event, key)` pair that is already
    /// registered.
    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),

    /// `unsubscribe` was called for an `(event, key)` pair that has no
    /// active subscription.
    #[error("not subscribed to {0}")]
    NotSubscribed(String),

    /// A console connection could not be established because the
    /// platform refused it (`allowed=false`) or returned no connection
    /// details.
    #[error("console connection refused: {0}")]
    ConsoleRefused(String),

    /// The account-socket Instance could not recover its subscriptions
    /// after an abnormal close within the configured timeout. Internal
    /// callers retry this indefinitely; it is exposed for observability
    /// in tests and logs, not normally returned to crate consumers.
    #[error("recovery failed: {0}")]
    RecoveryFailed(String),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn invalid_usage(msg: impl Into<String>) -> Self {
        Error::InvalidUsage(msg.into())
    }
}
