//! # fleet_client
//!
//! A long-running client library that federates a fleet of game-server
//! group accounts managed by a single identity against a remote platform.
//!
//! The platform exposes a REST API for group/server/member metadata, an
//! authenticated account WebSocket that streams account-level events and
//! carries request/response RPCs, and per-game-server console WebSockets
//! reached via short-lived connection tokens.
//!
//! This crate is the connection-management subsystem: the authenticated
//! session lifecycle, the account-WebSocket pool with periodic migration
//! and abnormal-close recovery, the per-subscription routing layer, the
//! RPC request/response engine, and the downstream group/server/console
//! lifecycle. The REST wire format, console command grammar, and the
//! application's own configuration/logging transport are external
//! collaborators — this crate only defines the shape it needs from them.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

mod config;
mod console;
mod error;
mod event;
mod group;
mod logging;
mod model;
mod rest;
mod server;
mod supervisor;
mod token;
mod worker_pool;
mod ws;

pub use config::{Config, Credentials, LogVerbosity, Scope};
pub use console::ConsoleConnection;
pub use error::Error;
pub use event::Event;
pub use group::GroupManager;
pub use server::{ServerManager, ServerStatus};
pub use supervisor::{Client, ClientBuilder};
pub use token::Principal;

/// Convenience alias for this crate's fallible results.
pub type Result<T> = std::result::Result<T, Error>;
