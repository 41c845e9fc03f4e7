//! A low-level object-messaging network server: one endpoint multiplexes many
//!  client sessions over TCP, with an optional parallel UDP channel per session
//!  for unreliable delivery. Applications send and receive *objects* (opaque to
//!  this crate, encoded by a pluggable [Serialization] collaborator); the server
//!  dispatches inbound objects to registered listeners and relays outbound
//!  objects to one, many, or all clients.
//!
//! ## Design goals
//!
//! * A single task performs all readiness selection, framing, dispatch and timer
//!   work. Listener callbacks run on that task and must not block; other tasks
//!   may concurrently bind, close, stop, or send.
//! * TCP carries a stream of frames `<varint length><payload>`; the varint is
//!   little-endian base-128, 1-5 bytes, covering `0..2^31-1`. UDP carries one
//!   serialized object per datagram with no length prefix.
//! * Back-pressure is a finite per-connection write buffer: when a serialized
//!   object does not fit into the free space, the sender has lost
//!   synchronization with the wire and the connection is closed.
//! * A UDP-enabled connection becomes visible to the application only after the
//!   client has bound its datagram source address via the `RegisterUDP`
//!   handshake; until then it is *pending*.
//!
//! ## Connection lifecycle
//!
//! ```ascii
//! accept --> Pending -----> Established --> Closed      (UDP enabled)
//! accept -----------------> Established --> Closed      (TCP only)
//! ```
//!
//! `connected` fires exactly once on the transition to `Established`;
//! `disconnected` fires exactly once on close for every connection that was
//! observed connected. All transitions are irreversible.
//!
//! ## Control messages
//!
//! A handful of framework messages travel in-band as ordinary serialized
//! objects: `RegisterTCP` (server-assigned id, sent right after accept),
//! `RegisterUDP` (datagram address binding and its TCP acknowledgement),
//! `KeepAlive` (filler on an otherwise idle connection), `Ping` (latency probe)
//! and `DiscoverHost` (broadcast discovery, answered by a pluggable handler).

pub mod buffers;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod framework;
pub mod listener;
pub mod serialization;
pub mod server;
pub mod udp_channel;

mod convert;
mod tcp_framer;

pub use config::ServerConfig;
pub use connection::Connection;
pub use discovery::{DefaultDiscoveryHandler, ServerDiscoveryHandler};
pub use error::{NetError, Result};
pub use framework::FrameworkMessage;
pub use listener::Listener;
pub use serialization::{ObjectBox, Serialization};
pub use server::Server;
pub use udp_channel::UdpChannel;
