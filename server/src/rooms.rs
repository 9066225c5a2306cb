//! Room and slot management for the lobby
//!
//! This module owns the server-side lobby state machine:
//! - Fixed eight-slot rooms (slot 0 reserved for the AI, 1..7 for humans)
//! - Room allocation ("join the lowest-numbered joinable room"), teardown
//!   and reset-on-empty
//! - Slot binding with random placement and lowest-free-color assignment
//!
//! Rooms reference clients only by id; sessions reference rooms only by id.
//! Both lookups go through the [`Server`](crate::network::Server) owner, so
//! either side can be destroyed independently.

use darkcolony_protocol::{Race, SlotKind, SLOT_COUNT};
use log::info;
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};

/// Index of the slot reserved for the AI player.
pub const AI_SLOT: usize = 0;

/// The sixteen `room_param` values sent in every snapshot, by index.
/// Index 0 is erupting vents (on), index 1 renewable vents (off); the rest
/// were lifted from captures of a stock room.
pub const ROOM_PARAM_DEFAULTS: [u16; 16] =
    [1, 0, 0, 0, 4, 4, 0, 0xb8, 1, 0, 0, 0, 0, 0, 0, 0];

/// One position in a room.
///
/// A slot is *active* when its kind is gamer or AI; only active slots hold a
/// color claim (no two active slots in a room may share one).
#[derive(Debug, Clone)]
pub struct PlayerSlot {
    pub client_id: Option<u32>,
    pub name: String,
    pub race: Race,
    pub kind: SlotKind,
    pub team: u8,
    pub color: u8,
    pub ready: bool,
}

impl PlayerSlot {
    pub fn is_active(&self) -> bool {
        self.kind.is_active()
    }

    /// Return the slot to the unbound state after its client departs.
    pub fn release(&mut self) {
        self.client_id = None;
        self.kind = SlotKind::Open;
        self.ready = true;
    }
}

/// The map a room will play, as advertised in the map packet.
#[derive(Debug, Clone)]
pub struct MapInfo {
    pub kind: u8,
    pub player_count: u8,
    pub filename: String,
    pub display_name: String,
}

impl Default for MapInfo {
    fn default() -> Self {
        Self {
            kind: b'D',
            player_count: b'8',
            filename: "PLAY01.SCN".to_string(),
            display_name: format!("Armageddon\n{}(8 Player Desert Map )", " ".repeat(33)),
        }
    }
}

/// A lobby room: up to seven humans plus the AI slot, sharing one map.
#[derive(Debug)]
pub struct Room {
    pub id: u32,
    pub clients: BTreeSet<u32>,
    pub in_battle: bool,
    pub slots: [PlayerSlot; SLOT_COUNT],
    pub map: MapInfo,
    pub lobby_ping_count: u32,
}

impl Room {
    /// A freshly created room. Slot 0 starts as the "spectator" placeholder;
    /// a battle reset replaces it with the `battle_bot` AI (see [`reset`]).
    ///
    /// [`reset`]: Room::reset
    pub fn new(id: u32, rng: &mut StdRng) -> Self {
        Self {
            id,
            clients: BTreeSet::new(),
            in_battle: false,
            slots: Self::fresh_slots(rng, false),
            map: MapInfo::default(),
            lobby_ping_count: 0,
        }
    }

    fn fresh_slots(rng: &mut StdRng, recycled: bool) -> [PlayerSlot; SLOT_COUNT] {
        std::array::from_fn(|i| {
            if i == AI_SLOT {
                let (name, kind) = if recycled {
                    ("battle_bot", SlotKind::AiHard)
                } else {
                    ("spectator", SlotKind::Gamer)
                };
                PlayerSlot {
                    client_id: None,
                    name: name.to_string(),
                    race: random_race(rng),
                    kind,
                    team: 0,
                    color: 0,
                    ready: false,
                }
            } else {
                PlayerSlot {
                    client_id: None,
                    name: format!("Player{}", i),
                    race: random_race(rng),
                    kind: SlotKind::Open,
                    team: i as u8,
                    color: i as u8,
                    ready: true,
                }
            }
        })
    }

    /// Return the room to its initial state once the last client leaves.
    pub fn reset(&mut self, rng: &mut StdRng) {
        self.clients.clear();
        self.in_battle = false;
        self.slots = Self::fresh_slots(rng, true);
        self.map = MapInfo::default();
        self.lobby_ping_count = 0;
    }

    /// Indices of unbound human slots.
    pub fn free_slots(&self) -> Vec<usize> {
        (1..SLOT_COUNT)
            .filter(|&i| self.slots[i].kind == SlotKind::Open && self.slots[i].client_id.is_none())
            .collect()
    }

    /// A room accepts new clients while it is out of battle and has at least
    /// one free human slot.
    pub fn is_joinable(&self) -> bool {
        !self.in_battle && !self.free_slots().is_empty()
    }

    pub fn slot_of(&self, client_id: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.client_id == Some(client_id))
    }

    /// Lowest color index 0..7 not claimed by an active slot.
    pub fn lowest_free_color(&self) -> Option<u8> {
        (0..SLOT_COUNT as u8).find(|&c| !self.slots.iter().any(|s| s.is_active() && s.color == c))
    }

    /// True when at least one human slot is occupied and all of them are
    /// ready, which cascades readiness onto the AI slot.
    pub fn occupied_humans_ready(&self) -> bool {
        let mut any = false;
        for slot in self.slots[1..].iter().filter(|s| s.client_id.is_some()) {
            if !slot.ready {
                return false;
            }
            any = true;
        }
        any
    }
}

fn random_race(rng: &mut StdRng) -> Race {
    if rng.gen_range(0..2) == 0 {
        Race::Aliens
    } else {
        Race::Humans
    }
}

/// What became of a room after a client left it.
#[derive(Debug, PartialEq, Eq)]
pub enum Departure {
    /// Other clients remain; the caller should push them a fresh snapshot.
    Remaining,
    /// The room emptied and was reset in place (room 1 only).
    RoomReset,
    /// The room emptied and was deleted (rooms with id > 1).
    RoomDeleted,
}

/// Registry of all rooms, keyed by id in ascending order.
///
/// Room 1 is created at startup and persists for the lifetime of the
/// process; rooms 2..N come and go with demand.
#[derive(Debug)]
pub struct RoomManager {
    rooms: BTreeMap<u32, Room>,
}

impl RoomManager {
    pub fn new(rng: &mut StdRng) -> Self {
        let mut rooms = BTreeMap::new();
        rooms.insert(1, Room::new(1, rng));
        Self { rooms }
    }

    pub fn get(&self, id: u32) -> Option<&Room> {
        self.rooms.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Room> {
        self.rooms.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Room> {
        self.rooms.values_mut()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// The lowest-numbered room a new client may join, creating one with the
    /// lowest unused id >= 2 when every existing room is full or battling.
    pub fn available_room(&mut self, rng: &mut StdRng) -> u32 {
        if let Some(id) = self.rooms.values().find(|r| r.is_joinable()).map(|r| r.id) {
            return id;
        }
        let id = (2..).find(|id| !self.rooms.contains_key(id)).expect("u32 space exhausted");
        info!("creating room {}", id);
        self.rooms.insert(id, Room::new(id, rng));
        id
    }

    /// Bind a client to a uniformly random free slot of `room_id`.
    ///
    /// The slot becomes a not-ready gamer and receives the lowest color not
    /// claimed by any active slot (uniform random fallback if all eight are
    /// somehow taken). Returns the slot index and whether the room already
    /// had members; `None` if the room is battling or full.
    pub fn add_client(
        &mut self,
        room_id: u32,
        client_id: u32,
        rng: &mut StdRng,
    ) -> Option<(usize, bool)> {
        let room = self.rooms.get_mut(&room_id)?;
        if room.in_battle {
            return None;
        }
        let free = room.free_slots();
        if free.is_empty() {
            return None;
        }
        let idx = free[rng.gen_range(0..free.len())];
        let had_peers = !room.clients.is_empty();
        let color = room
            .lowest_free_color()
            .unwrap_or_else(|| rng.gen_range(0..SLOT_COUNT as u8));

        let slot = &mut room.slots[idx];
        slot.client_id = Some(client_id);
        slot.kind = SlotKind::Gamer;
        slot.ready = false;
        slot.color = color;
        room.clients.insert(client_id);
        Some((idx, had_peers))
    }

    /// Unbind a client from its room, releasing the slot.
    pub fn remove_client(&mut self, room_id: u32, client_id: u32, rng: &mut StdRng) -> Departure {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Departure::RoomDeleted;
        };
        room.clients.remove(&client_id);
        if let Some(idx) = room.slot_of(client_id) {
            room.slots[idx].release();
        }
        if !room.clients.is_empty() {
            return Departure::Remaining;
        }
        if room_id > 1 {
            self.rooms.remove(&room_id);
            info!("room {} emptied, deleted", room_id);
            Departure::RoomDeleted
        } else {
            room.reset(rng);
            info!("room 1 emptied, reset");
            Departure::RoomReset
        }
    }
}
