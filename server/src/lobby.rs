//! Composition of the server-initiated lobby packets
//!
//! Everything a client sees on join is built here as raw payload bytes; the
//! session layer frames them with the per-connection counter. Layouts are a
//! straight transcription of the capture notes: the greeting, the big room
//! snapshot (placeholder word, eight `player_init` tuples, eight per-slot
//! attribute blocks, sixteen `room_param` tuples) and the map packet.

use crate::rooms::{MapInfo, Room, ROOM_PARAM_DEFAULTS};
use darkcolony_protocol::{opcode, ready, SLOT_COUNT};

/// Chat lines pushed to every client right after its map packet.
pub const WELCOME_LINES: [&str; 3] = [
    "Welcome, commander. This is an open Dark Colony lobby.",
    "Pick your race and color, then signal ready.",
    "The battle starts once every player is ready.",
];

/// `initial_packet`: tells the client which slot it occupies.
pub fn greeting(slot: u8) -> Vec<u8> {
    vec![opcode::INITIAL_PACKET, 0x0f, 0x00, slot, 0x00]
}

/// A chat line as the server speaks it.
pub fn chat_line(text: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(text.len() + 2);
    payload.push(opcode::PLAYER_CHAT);
    payload.extend_from_slice(text.as_bytes());
    payload.push(0x00);
    payload
}

/// The full room snapshot: the complete lobby state in one frame.
pub fn room_snapshot(room: &Room) -> Vec<u8> {
    let mut payload = vec![opcode::ROOM_MAP, 0x00, 0x00];

    for idx in 0..SLOT_COUNT as u8 {
        payload.extend_from_slice(&[opcode::PLAYER_INIT, 0x00, idx]);
    }

    for (idx, slot) in room.slots.iter().enumerate() {
        let idx = idx as u8;
        payload.extend_from_slice(&[opcode::PLAYER_NAME, idx, 0x00]);
        payload.extend_from_slice(slot.name.as_bytes());
        payload.push(0x00);
        payload.extend_from_slice(&[opcode::PLAYER_RACE, slot.race.wire_byte(), idx]);
        payload.extend_from_slice(&[opcode::PLAYER_TYPE, slot.kind.wire_byte(), idx]);
        payload.extend_from_slice(&[opcode::PLAYER_COLOR, slot.color, idx]);
        payload.extend_from_slice(&[opcode::PLAYER_TEAM2, slot.team, idx]);
        payload.extend_from_slice(&[opcode::PLAYER_READY, ready_byte(slot.ready), idx]);
    }

    for (idx, value) in ROOM_PARAM_DEFAULTS.iter().enumerate() {
        let [lo, hi] = value.to_le_bytes();
        payload.extend_from_slice(&[opcode::ROOM_PARAM, idx as u8, 0x00, lo, hi]);
    }

    payload
}

/// The map packet: map type and size chars, the scenario filename and the
/// display name the client prints in its lobby screen.
pub fn map_packet(map: &MapInfo) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + map.filename.len() + map.display_name.len());
    payload.push(opcode::ROOM_MAP);
    payload.push(map.kind);
    payload.push(map.player_count);
    payload.extend_from_slice(map.filename.as_bytes());
    payload.push(0x00);
    payload.extend_from_slice(map.display_name.as_bytes());
    payload
}

fn ready_byte(is_ready: bool) -> u8 {
    if is_ready {
        ready::READY
    } else {
        ready::NOT_READY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_greeting_layout() {
        assert_eq!(greeting(3), vec![0x64, 0x0f, 0x00, 0x03, 0x00]);
    }

    #[test]
    fn test_chat_line_layout() {
        assert_eq!(chat_line("hi"), vec![0x65, b'h', b'i', 0x00]);
    }

    #[test]
    fn test_map_packet_default_layout() {
        let payload = map_packet(&MapInfo::default());
        assert_eq!(payload[0], opcode::ROOM_MAP);
        // 'D', '8', "PLAY01.SCN\0", then the display name.
        let expected_head: &[u8] = &[
            0x44, 0x38, 0x50, 0x4c, 0x41, 0x59, 0x30, 0x31, 0x2e, 0x53, 0x43, 0x4e, 0x00, 0x41,
            0x72, 0x6d, 0x61, 0x67, 0x65, 0x64, 0x64, 0x6f, 0x6e, 0x0a,
        ];
        assert_eq!(&payload[1..1 + expected_head.len()], expected_head);
        assert!(payload.ends_with(b"(8 Player Desert Map )"));
    }

    #[test]
    fn test_snapshot_structure() {
        let mut rng = StdRng::seed_from_u64(7);
        let room = Room::new(1, &mut rng);
        let payload = room_snapshot(&room);

        assert_eq!(&payload[..3], &[opcode::ROOM_MAP, 0x00, 0x00]);

        // Eight player_init tuples follow the placeholder word.
        for idx in 0..SLOT_COUNT {
            let at = 3 + idx * 3;
            assert_eq!(
                &payload[at..at + 3],
                &[opcode::PLAYER_INIT, 0x00, idx as u8]
            );
        }

        // Slot 0's block starts right after: name "spectator".
        let at = 3 + SLOT_COUNT * 3;
        assert_eq!(&payload[at..at + 3], &[opcode::PLAYER_NAME, 0, 0x00]);
        assert_eq!(&payload[at + 3..at + 12], b"spectator");
        assert_eq!(payload[at + 12], 0x00);

        // Sixteen room_param tuples close the snapshot.
        let params_len = 16 * 5;
        let params = &payload[payload.len() - params_len..];
        assert_eq!(&params[..5], &[opcode::ROOM_PARAM, 0, 0x00, 1, 0]);
        assert_eq!(&params[5..10], &[opcode::ROOM_PARAM, 1, 0x00, 0, 0]);
        assert_eq!(&params[4 * 5..4 * 5 + 5], &[opcode::ROOM_PARAM, 4, 0x00, 4, 0]);
        assert_eq!(
            &params[7 * 5..7 * 5 + 5],
            &[opcode::ROOM_PARAM, 7, 0x00, 0xb8, 0]
        );
        assert_eq!(&params[8 * 5..8 * 5 + 5], &[opcode::ROOM_PARAM, 8, 0x00, 1, 0]);
    }

    #[test]
    fn test_snapshot_marks_unready_slots() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut room = Room::new(1, &mut rng);
        room.slots[2].ready = false;
        let payload = room_snapshot(&room);

        // player_ready tuple for slot 2 carries NOT_READY.
        let needle = [opcode::PLAYER_READY, ready::NOT_READY, 2];
        assert!(payload
            .windows(3)
            .any(|w| w == needle));
    }
}
