//! # Dark Colony Relay Server Library
//!
//! Server-side implementation of the *Dark Colony* (1997) multiplayer lobby.
//! Original game binaries connect over plain TCP, get placed into an
//! eight-slot room, mutate the shared lobby state (names, races, colors,
//! teams, readiness) and, once everyone has begun battle, have their gameplay
//! commands relayed between peers. The server holds no game-logic authority:
//! it frames, it routes, it keeps two heartbeats alive.
//!
//! ## Module Organization
//!
//! - [`network`]: the event loop that owns all state, plus the accept,
//!   reader and writer tasks and the periodic tickers
//! - [`session`]: per-connection state (frame accumulator, sequence nibble,
//!   room binding) and the session registry
//! - [`rooms`]: the room/slot state machine and its invariants
//! - [`lobby`]: composition of the greeting, snapshot and map packets
//! - [`battle`]: the per-client battle-ping echo state machine
//!
//! The wire format itself (framing, opcodes, command parsing) lives in the
//! sibling `darkcolony-protocol` crate so test harnesses can speak the
//! protocol without linking the server.
//!
//! ## Architecture
//!
//! A single task owns sessions, rooms and the RNG; every socket and timer
//! event funnels into it over one channel. That serializes all lobby
//! mutation without locks, keeps broadcast fan-out deterministic per
//! connection, and makes the handlers directly testable: unit tests drive
//! the same event handlers the sockets do.

pub mod battle;
pub mod lobby;
pub mod network;
pub mod rooms;
pub mod session;
