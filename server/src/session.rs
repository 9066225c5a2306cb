//! Per-connection session state and the session registry
//!
//! A [`Session`] is the server-side shadow of one TCP connection: its inbound
//! frame accumulator, the outbound sequence nibble, the room/slot binding and
//! the in-battle bookkeeping. Sessions never touch the socket directly;
//! encoded frames go out through an unbounded channel drained by the
//! connection's writer task, so a slow peer back-pressures only itself.

use crate::battle::BattlePing;
use darkcolony_protocol::{encode_frame, FrameReader, MAX_PAYLOAD_LEN};
use log::{info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Outbound channel: fully encoded frames, ready for `write_all`.
pub type FrameSender = mpsc::UnboundedSender<Vec<u8>>;

/// State for one connected client.
#[derive(Debug)]
pub struct Session {
    pub id: u32,
    pub addr: SocketAddr,
    sender: FrameSender,
    pub reader: FrameReader,
    pub last_activity: Instant,
    counter: u8,
    pub room_id: u32,
    pub slot: usize,
    pub battle_initiated: bool,
    pub map_sent: bool,
    pub battle_ping: Option<BattlePing>,
}

impl Session {
    pub fn new(id: u32, addr: SocketAddr, sender: FrameSender) -> Self {
        Self {
            id,
            addr,
            sender,
            reader: FrameReader::new(),
            last_activity: Instant::now(),
            counter: 0,
            room_id: 0,
            slot: 0,
            battle_initiated: false,
            map_sent: false,
            battle_ping: None,
        }
    }

    /// Record inbound activity; the idle reaper measures from here.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Current outbound sequence nibble (the one the next frame will carry).
    pub fn counter(&self) -> u8 {
        self.counter
    }

    /// Frame `payload` with this connection's sequence nibble and hand it to
    /// the writer task. The nibble advances once per frame, wrapping 15 → 0.
    ///
    /// An overlong payload is a server bug: asserted in debug builds, dropped
    /// with a log line in release. A closed channel means the writer task is
    /// already gone; the close event is in flight, so the frame is dropped
    /// silently.
    pub fn send(&mut self, payload: &[u8]) {
        debug_assert!(
            payload.len() <= MAX_PAYLOAD_LEN,
            "outbound payload of {} bytes cannot be framed",
            payload.len()
        );
        match encode_frame(payload, self.counter) {
            Ok(frame) => {
                self.counter = (self.counter + 1) & 0x0f;
                let _ = self.sender.send(frame);
            }
            Err(e) => warn!("client {}: dropping outbound packet: {}", self.id, e),
        }
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }
}

/// Registry of live sessions, keyed by client id.
///
/// Ids start at 1 and increase monotonically for the lifetime of the
/// process; they are never reused.
#[derive(Debug)]
pub struct SessionManager {
    sessions: HashMap<u32, Session>,
    next_id: u32,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 1,
        }
    }

    /// Register a connection and return its freshly allocated client id.
    pub fn insert(&mut self, addr: SocketAddr, sender: FrameSender) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        info!("client {} connected from {}", id, addr);
        self.sessions.insert(id, Session::new(id, addr, sender));
        id
    }

    pub fn get(&self, id: u32) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Drop a session. The returned value keeps the room binding readable
    /// for teardown; the outbound channel closes when it is dropped, which
    /// ends the writer task and closes the socket.
    pub fn remove(&mut self, id: u32) -> Option<Session> {
        self.sessions.remove(&id)
    }

    /// Clients with no inbound bytes for longer than `timeout`.
    pub fn idle_ids(&self, timeout: Duration) -> Vec<u32> {
        self.sessions
            .values()
            .filter(|s| s.is_idle(timeout))
            .map(|s| s.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
