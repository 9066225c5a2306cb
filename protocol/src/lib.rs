//! # Dark Colony Wire Protocol
//!
//! This crate defines the on-wire protocol spoken by original *Dark Colony*
//! (1997) game clients, reconstructed from packet captures. It is shared by
//! the relay server and by test harnesses so that both sides agree on every
//! byte. Nothing in here touches sockets; it is pure framing and parsing.
//!
//! ## Framing
//!
//! Every packet on the wire has the layout
//!
//! ```text
//! L_low | (counter << 4 | L_high) | payload | 0x00
//! ```
//!
//! where `L_low | L_high` is a 12-bit little-endian length covering the whole
//! packet (both header bytes and the trailing terminator included), and
//! `counter` is a per-connection rolling sequence nibble that advances by one
//! for every packet the sender emits, wrapping 15 → 0. The maximum encodable
//! packet is [`MAX_FRAME_LEN`] bytes.
//!
//! Inbound framing is handled by [`FrameReader`], a streaming accumulator:
//! feed it whatever the socket produced and drain complete frames from it.
//! A single TCP chunk may carry several frames back-to-back, and a frame may
//! arrive split across chunks; the reader handles both. The inbound counter
//! nibble is surfaced on [`Frame`] for logging but never validated; the
//! original clients are trusted to keep it correct.
//!
//! ## Commands
//!
//! A frame body holds one or more commands, each an opcode byte followed by
//! opcode-specific data (see [`opcode`]). [`parse_commands`] splits a body
//! into [`Command`] values; opcodes outside the table come back as
//! [`Command::Unknown`] so the caller can log them without dropping the
//! connection.

use thiserror::Error;

/// Largest packet the 12-bit length field can describe, in bytes.
pub const MAX_FRAME_LEN: usize = 4095;

/// Header bytes plus trailing terminator.
pub const FRAME_OVERHEAD: usize = 3;

/// Largest payload that still fits in a frame.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - FRAME_OVERHEAD;

/// Display names are clamped to this many printable ASCII characters.
pub const MAX_NAME_LEN: usize = 32;

/// Chat lines are clamped to this many bytes.
pub const MAX_CHAT_LEN: usize = 120;

/// Slots per room: slot 0 is reserved for the AI, 1..7 hold humans.
pub const SLOT_COUNT: usize = 8;

/// Command opcodes as they appear on the wire.
///
/// The lobby opcodes (0x64..0x76) were recovered verbatim from captures.
/// The in-battle opcodes 0x09..0x15 are relayed opaquely; the server never
/// interprets their data beyond the `unit_move` trailing-zero quirk.
pub mod opcode {
    pub const BATTLE_PING1: u8 = 0x02;
    pub const BATTLE_PING2: u8 = 0x08;

    pub const UNIT_ATTACK: u8 = 0x09;
    pub const UNIT_MOVE: u8 = 0x0a;
    pub const UNIT_SELECT: u8 = 0x0b;
    pub const UNIT_SELECT_DATA: u8 = 0x0c;
    pub const UNIT_DESTINATION: u8 = 0x0d;
    pub const UNIT_DESTINATION_DATA: u8 = 0x0e;
    pub const UNIT_INSPIRE: u8 = 0x0f;
    pub const BUTTON_UNIT: u8 = 0x10;
    pub const BUTTON_BUILDING: u8 = 0x11;
    pub const BUTTON_UPGRADE: u8 = 0x12;
    pub const GAME_SPEED: u8 = 0x13;
    pub const BUTTON_SUPERWEAPON: u8 = 0x14;
    pub const BATTLE_CHAT: u8 = 0x15;

    pub const INITIAL_PACKET: u8 = 0x64;
    pub const PLAYER_CHAT: u8 = 0x65;
    pub const PLAYER_RACE: u8 = 0x66;
    pub const PLAYER_NAME: u8 = 0x67;
    pub const PLAYER_READY: u8 = 0x68;
    pub const ROOM_MAP: u8 = 0x69;
    pub const PLAYER_TYPE: u8 = 0x6a;
    pub const PLAYER_COLOR: u8 = 0x6b;
    pub const PLAYER_INIT: u8 = 0x6c;
    pub const PLAYER_TEAM: u8 = 0x6d;
    pub const PLAYER_TEAM2: u8 = 0x6e;
    pub const ROOM_PARAM: u8 = 0x6f;
    pub const PING: u8 = 0x71;
    pub const BEGIN_BATTLE: u8 = 0x76;

    /// Opcodes forwarded byte-for-byte between peers once a battle runs.
    pub fn is_relay(op: u8) -> bool {
        (UNIT_ATTACK..=BATTLE_CHAT).contains(&op)
    }
}

/// `player_ready` status bytes.
pub mod ready {
    pub const READY: u8 = 0x00;
    pub const NOT_READY: u8 = 0x01;
    pub const READY_FOR_BATTLE: u8 = 0x02;
}

/// Player race as carried by `player_race`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Race {
    Aliens = 0,
    Humans = 1,
}

impl Race {
    /// Captures show 0x01 for humans and anything else treated as aliens.
    pub fn from_wire(byte: u8) -> Self {
        if byte == 0x01 {
            Race::Humans
        } else {
            Race::Aliens
        }
    }

    pub fn wire_byte(self) -> u8 {
        self as u8
    }
}

/// Occupancy kind of a room slot, as carried by `player_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotKind {
    AiEasy = 0,
    AiHard = 1,
    Gamer = 2,
    Open = 3,
}

impl SlotKind {
    pub fn wire_byte(self) -> u8 {
        self as u8
    }

    /// An active slot takes part in the game and therefore owns a color.
    pub fn is_active(self) -> bool {
        !matches!(self, SlotKind::Open)
    }
}

/// Errors raised by the codec. Both are local to a single connection and
/// never fatal to the process.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The encoded packet would not fit the 12-bit length field.
    #[error("packet of {0} bytes exceeds the {MAX_FRAME_LEN}-byte frame limit")]
    OverlongPacket(usize),

    /// An inbound header declared a length below the framing overhead.
    #[error("frame header declares impossible length {0}")]
    BadLength(usize),
}

/// Encode one outbound frame.
///
/// `counter` is the connection's current sequence nibble; only its low four
/// bits are used. The caller advances the nibble after a successful encode.
pub fn encode_frame(payload: &[u8], counter: u8) -> Result<Vec<u8>, ProtocolError> {
    let total = payload.len() + FRAME_OVERHEAD;
    if total > MAX_FRAME_LEN {
        return Err(ProtocolError::OverlongPacket(total));
    }
    let mut frame = Vec::with_capacity(total);
    frame.push((total & 0xff) as u8);
    frame.push(((counter & 0x0f) << 4) | ((total >> 8) as u8));
    frame.extend_from_slice(payload);
    frame.push(0x00);
    Ok(frame)
}

/// One complete inbound frame: the sender's counter nibble and the body
/// (payload without header or terminator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub counter: u8,
    pub body: Vec<u8>,
}

/// Streaming decoder for the inbound byte stream of one connection.
///
/// Bytes go in via [`extend`](Self::extend); complete frames come out via
/// [`next_frame`](Self::next_frame) until it yields `Ok(None)`. Partial
/// frames stay buffered. A header with an impossible length is consumed
/// whole and reported as [`ProtocolError::BadLength`] so the caller can log
/// it and resume at the next frame boundary.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered but not yet framed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let declared = self.buf[0] as usize | ((self.buf[1] as usize & 0x0f) << 8);
        if declared < FRAME_OVERHEAD {
            self.buf.drain(..2);
            return Err(ProtocolError::BadLength(declared));
        }
        if self.buf.len() < declared {
            return Ok(None);
        }
        let counter = self.buf[1] >> 4;
        let frame: Vec<u8> = self.buf.drain(..declared).collect();
        Ok(Some(Frame {
            counter,
            body: frame[2..declared - 1].to_vec(),
        }))
    }
}

/// A parsed inbound command.
///
/// Variants carry raw bytes where the server either sanitizes on dispatch
/// (`PlayerName`, `PlayerChat`) or forwards opaquely (`Relay`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    PlayerName { slot: u8, name: Vec<u8> },
    PlayerChat { text: Vec<u8> },
    PlayerRace { race: u8, slot: u8 },
    PlayerColor { color: u8, slot: u8 },
    PlayerTeam { team: u8, slot: u8 },
    /// No ordinal on the wire; applies to the sender's own slot.
    PlayerReady,
    BeginBattle,
    /// Client echo of an outstanding `battle_ping1`.
    BattlePingEcho { data: Vec<u8> },
    /// `battle_ping2`: sent by clients, never answered.
    BattlePingReport,
    Ping,
    /// Clients echo the `room_param` bytes of the snapshot back; no-op.
    RoomParamEcho,
    /// One of the opaque in-battle commands, forwarded to peers verbatim.
    Relay { opcode: u8, data: Vec<u8> },
    Unknown { opcode: u8, data: Vec<u8> },
}

/// Split a frame body into commands.
///
/// Lobby mutation commands have per-opcode length rules (a fixed data size
/// or a 0x00-terminated string) so several can share one frame; control and
/// relay commands consume the remainder of the frame, which matches what the
/// original clients emit. An unknown opcode also consumes the remainder
/// (its length is unknowable) and the frame is not rejected.
pub fn parse_commands(body: &[u8]) -> Vec<Command> {
    let mut commands = Vec::new();
    let mut cursor = 0usize;
    while cursor < body.len() {
        let op = body[cursor];
        cursor += 1;
        let rest = &body[cursor..];
        match op {
            opcode::PLAYER_NAME => {
                // [slot] [0x00] [ascii name] [0x00]
                if rest.is_empty() {
                    commands.push(Command::Unknown {
                        opcode: op,
                        data: Vec::new(),
                    });
                    break;
                }
                let slot = rest[0];
                let mut idx = 1;
                if rest.get(idx) == Some(&0x00) {
                    idx += 1;
                }
                let start = idx;
                while idx < rest.len() && rest[idx] != 0x00 {
                    idx += 1;
                }
                let name = rest[start..idx].to_vec();
                if idx < rest.len() {
                    idx += 1; // command terminator
                }
                cursor += idx;
                commands.push(Command::PlayerName { slot, name });
            }
            opcode::PLAYER_CHAT => {
                let mut idx = 0;
                while idx < rest.len() && rest[idx] != 0x00 {
                    idx += 1;
                }
                let text = rest[..idx].to_vec();
                if idx < rest.len() {
                    idx += 1;
                }
                cursor += idx;
                commands.push(Command::PlayerChat { text });
            }
            opcode::PLAYER_RACE | opcode::PLAYER_COLOR | opcode::PLAYER_TEAM => {
                if rest.len() < 2 {
                    commands.push(Command::Unknown {
                        opcode: op,
                        data: rest.to_vec(),
                    });
                    break;
                }
                let value = rest[0];
                let slot = rest[1];
                let mut idx = 2;
                if rest.get(idx) == Some(&0x00) {
                    idx += 1; // command terminator
                }
                cursor += idx;
                commands.push(match op {
                    opcode::PLAYER_RACE => Command::PlayerRace { race: value, slot },
                    opcode::PLAYER_COLOR => Command::PlayerColor { color: value, slot },
                    _ => Command::PlayerTeam { team: value, slot },
                });
            }
            opcode::PLAYER_READY => {
                cursor = body.len();
                commands.push(Command::PlayerReady);
            }
            opcode::BEGIN_BATTLE => {
                cursor = body.len();
                commands.push(Command::BeginBattle);
            }
            opcode::BATTLE_PING1 => {
                let data = rest.to_vec();
                cursor = body.len();
                commands.push(Command::BattlePingEcho { data });
            }
            opcode::BATTLE_PING2 => {
                cursor = body.len();
                commands.push(Command::BattlePingReport);
            }
            opcode::PING => {
                cursor = body.len();
                commands.push(Command::Ping);
            }
            opcode::ROOM_PARAM => {
                cursor = body.len();
                commands.push(Command::RoomParamEcho);
            }
            op if opcode::is_relay(op) => {
                let data = rest.to_vec();
                cursor = body.len();
                commands.push(Command::Relay { opcode: op, data });
            }
            _ => {
                let data = rest.to_vec();
                cursor = body.len();
                commands.push(Command::Unknown { opcode: op, data });
            }
        }
    }
    commands
}

/// Sanitize a display name: printable ASCII only, at most [`MAX_NAME_LEN`]
/// characters. The result is always valid single-byte ASCII, so re-encoding
/// it onto the wire is byte-for-byte.
pub fn sanitize_name(raw: &[u8]) -> String {
    raw.iter()
        .copied()
        .filter(|b| (0x20..=0x7e).contains(b))
        .take(MAX_NAME_LEN)
        .map(|b| b as char)
        .collect()
}

/// Sanitize a chat line: strip CR/LF, clamp to [`MAX_CHAT_LEN`] bytes.
/// Returned as bytes because clients may send their OEM code page.
pub fn sanitize_chat(raw: &[u8]) -> Vec<u8> {
    raw.iter()
        .copied()
        .filter(|&b| b != b'\r' && b != b'\n')
        .take(MAX_CHAT_LEN)
        .collect()
}
