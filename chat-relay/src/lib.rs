//! Text-chat relay with challenge-response login.
//!
//! Clients register a unique login with the relay, then exchange routed
//! messages and manage contact lists. One task multiplexes every connection;
//! each module focuses on a concrete responsibility:
//!
//! - [`codec`] frames JSON objects with a 4-byte length prefix.
//! - [`protocol`] is the typed request/response model on top of the codec.
//! - [`auth`] derives password hashes and computes challenge digests.
//! - [`store`] is the credential store the relay consumes, plus an
//!   in-memory implementation.
//! - [`session`] tracks which login is online on which connection.
//! - [`handshake`] drives a connection from PRESENCE to authenticated.
//! - [`router`] answers or queues requests from authenticated clients.
//! - [`engine`] ties the above together without touching sockets.
//! - [`connection`] and [`relay`] own the sockets and run the event loop,
//!   reachable from other tasks through a [`relay::RelayHandle`].
//! - [`config`], [`cli`], [`client`] and [`console`] make up the binary.
//!
//! Unit tests drive the engine directly; the integration tests under
//! `tests/` talk to a real relay over TCP.

pub mod auth;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod console;
pub mod engine;
pub mod handshake;
pub mod protocol;
pub mod relay;
pub mod router;
pub mod session;
pub mod store;
