//! Battle-ping state for one in-battle client
//!
//! Once a client has begun battle the server keeps a ~30 Hz ping/echo stream
//! alive towards it: send `battle_ping1`, wait for the echo, schedule the
//! next ping 33 ms after the previous send, or give up waiting after 5 s and
//! push the next ping anyway. The timers behind this live as fire-and-forget
//! tokio tasks; each one captures the [`generation`](BattlePing::generation)
//! current when it was armed and its event is ignored unless that generation
//! is still current. Dropping the whole state (disconnect) therefore cancels
//! everything in flight without any handle juggling.

use darkcolony_protocol::opcode;
use std::time::Instant;

/// Ping/echo bookkeeping for a single client.
#[derive(Debug)]
pub struct BattlePing {
    /// Sequence number of the next ping, starting at 0.
    pub sequence: u32,
    /// The connection's outbound nibble, captured when `begin_battle`
    /// arrived. The second payload word is `initial_counter + sequence`.
    pub initial_counter: u32,
    pub waiting_echo: bool,
    /// Advances on every transition; stale timer events compare unequal.
    pub generation: u64,
    /// When the previous ping left; the next fires 33 ms after this.
    pub last_send: Instant,
}

impl BattlePing {
    pub fn new(counter_snapshot: u8) -> Self {
        Self {
            sequence: 0,
            initial_counter: counter_snapshot as u32,
            waiting_echo: false,
            generation: 0,
            last_send: Instant::now(),
        }
    }

    /// Payload of the next `battle_ping1`: opcode, then two little-endian
    /// u32 words: the sequence and the counter snapshot plus sequence.
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(9);
        payload.push(opcode::BATTLE_PING1);
        payload.extend_from_slice(&self.sequence.to_le_bytes());
        payload.extend_from_slice(&self.initial_counter.wrapping_add(self.sequence).to_le_bytes());
        payload
    }

    /// Enter a new state; anything armed before this call is now stale.
    pub fn bump(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}
