//! Line-oriented broadcast relay.
//!
//! Every line a connected client sends is relayed to all other connected
//! clients, prefixed with the sender's name. Each module focuses on a concrete
//! responsibility:
//!
//! - [`hub`] owns the client registry and fans messages out. It is the only
//!   place membership changes, and it runs as a single task fed by a channel.
//! - [`session`] drives one connection: username handshake, inbound lines,
//!   join and leave announcements.
//! - [`outbound`] writes a client's queued lines onto its connection.
//! - [`idle`] closes connections that stay silent for too long.
//! - [`relay`] accepts TCP connections and spawns sessions.
//! - [`config`] and [`cli`] describe the knobs: identity prompt, idle timeout,
//!   headcount reports, queue sizes and the overflow policy.
//!
//! Integration tests in `tests/` drive the relay over real TCP sockets, the
//! way `nc` clients would.

pub mod cli;
pub mod config;
pub mod hub;
pub mod idle;
pub mod outbound;
pub mod relay;
pub mod session;
