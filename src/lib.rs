//! A minimal multi-client chat relay over TCP.
//!
//! See `README.md` for usage and the JSON line protocol. Each module covers
//! one responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`relay`] is the distribution engine: the client registry, the shared
//!   history, broadcast with self-exclusion, and the blocking poll.
//! - [`queue`] provides the bounded per-client delivery queue the engine
//!   pushes into and polls drain.
//! - [`server`] accepts TCP connections and maps wire requests onto the
//!   relay operations.
//! - [`client`] is the terminal client: stdin lines out, a long-polling
//!   connection in.
//! - [`message`] defines the message and request/response types plus the
//!   JSON line framing helpers.
//!
//! Integration tests drive the relay engine directly as well as over real
//! sockets and spawned binaries.

pub mod cli;
pub mod client;
pub mod message;
pub mod queue;
pub mod relay;
pub mod server;
