//! End-to-end tests against a live relay on a real TCP socket
//!
//! Each test binds an ephemeral listener, runs the server task against it
//! with a seeded RNG and compressed timings, and speaks the wire protocol
//! exactly as a 1997 client would.

use darkcolony_protocol::{encode_frame, opcode, Frame, FrameReader};
use darkcolony_server::network::{Server, ServerConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Timings compressed for tests; lobby pings parked so they cannot
/// interleave with the frames under inspection.
fn fast_config() -> ServerConfig {
    ServerConfig {
        greeting_delay: Duration::from_millis(150),
        lobby_ping_interval: Duration::from_secs(600),
        reap_interval: Duration::from_secs(600),
        ..ServerConfig::default()
    }
}

async fn start(config: ServerConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(config, StdRng::seed_from_u64(7));
    tokio::spawn(server.run(listener));
    addr
}

struct TestClient {
    stream: TcpStream,
    reader: FrameReader,
    counter: u8,
    received: u32,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            reader: FrameReader::new(),
            counter: 0,
            received: 0,
        }
    }

    async fn send(&mut self, payload: &[u8]) {
        let frame = encode_frame(payload, self.counter).unwrap();
        self.counter = (self.counter + 1) & 0x0f;
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn read_frame(&mut self) -> Frame {
        loop {
            if let Ok(Some(frame)) = self.reader.next_frame() {
                self.received += 1;
                return frame;
            }
            let mut buf = [0u8; 2048];
            let n = timeout(READ_TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for a frame")
                .expect("read failed");
            assert!(n > 0, "server closed the connection mid-read");
            self.reader.extend(&buf[..n]);
        }
    }

    /// Consume the six-frame greeting sequence; returns the assigned slot.
    async fn expect_greeting(&mut self) -> u8 {
        let greeting = self.read_frame().await;
        assert_eq!(greeting.body[0], opcode::INITIAL_PACKET);
        let slot = greeting.body[3];

        let snapshot = self.read_frame().await;
        assert_eq!(snapshot.body[0], opcode::ROOM_MAP);
        let map = self.read_frame().await;
        assert_eq!(map.body[0], opcode::ROOM_MAP);
        for _ in 0..3 {
            let chat = self.read_frame().await;
            assert_eq!(chat.body[0], opcode::PLAYER_CHAT);
        }
        slot
    }

    async fn expect_no_frame(&mut self, window: Duration) {
        if let Ok(Some(frame)) = self.reader.next_frame() {
            panic!("unexpected frame: {:02x?}", frame.body);
        }
        let mut buf = [0u8; 2048];
        match timeout(window, self.stream.read(&mut buf)).await {
            Err(_) => {}
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => panic!("unexpected {} bytes: {:02x?}", n, &buf[..n]),
            Ok(Err(e)) => panic!("read failed: {}", e),
        }
    }
}

/// S1: the greeting sequence, byte for byte, on a fresh connection.
#[tokio::test]
async fn greeting_shape() {
    let addr = start(fast_config()).await;
    let mut client = TestClient::connect(addr).await;

    // The first frame arrives whole: read its raw eight bytes.
    let mut raw = [0u8; 8];
    timeout(READ_TIMEOUT, client.stream.read_exact(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let slot = raw[5];
    assert!((1..8).contains(&slot));
    assert_eq!(raw, [0x08, 0x00, 0x64, 0x0f, 0x00, slot, 0x00, 0x00]);
    client.received += 1;

    // Snapshot next, counter nibble 1.
    let snapshot = client.read_frame().await;
    assert_eq!(snapshot.counter, 1);
    assert_eq!(snapshot.body[0], opcode::ROOM_MAP);
    assert_eq!(&snapshot.body[1..3], &[0x00, 0x00]);
    // Eight player_init tuples open the roster.
    for idx in 0..8u8 {
        let at = 3 + idx as usize * 3;
        assert_eq!(&snapshot.body[at..at + 3], &[opcode::PLAYER_INIT, 0x00, idx]);
    }

    // Map packet: 'D' '8' "PLAY01.SCN\0" "Armageddon\n"...
    let map = client.read_frame().await;
    assert_eq!(map.counter, 2);
    assert_eq!(map.body[0], opcode::ROOM_MAP);
    let expected: &[u8] = &[
        0x44, 0x38, 0x50, 0x4c, 0x41, 0x59, 0x30, 0x31, 0x2e, 0x53, 0x43, 0x4e, 0x00, 0x41, 0x72,
        0x6d, 0x61, 0x67, 0x65, 0x64, 0x64, 0x6f, 0x6e, 0x0a,
    ];
    assert_eq!(&map.body[1..1 + expected.len()], expected);

    // Three chat lines close the sequence, counters 3..5.
    for counter in 3..6u8 {
        let chat = client.read_frame().await;
        assert_eq!(chat.counter, counter);
        assert_eq!(chat.body[0], opcode::PLAYER_CHAT);
        assert_eq!(*chat.body.last().unwrap(), 0x00);
    }
}

/// S2: a name change comes back to the sender and to its peer, identically.
#[tokio::test]
async fn name_change_broadcast() {
    let addr = start(fast_config()).await;
    let mut alice = TestClient::connect(addr).await;
    let alice_slot = alice.expect_greeting().await;

    let mut bob = TestClient::connect(addr).await;
    bob.expect_greeting().await;
    // Alice sees the roster refresh from Bob's join.
    let refresh = alice.read_frame().await;
    assert_eq!(refresh.body[0], opcode::ROOM_MAP);

    let rename = [opcode::PLAYER_NAME, alice_slot, 0x00, b'F', b'o', b'o', 0x00];
    alice.send(&rename).await;

    let echoed = alice.read_frame().await;
    assert_eq!(echoed.body, rename.to_vec());
    let relayed = bob.read_frame().await;
    assert_eq!(relayed.body, rename.to_vec());
}

/// S3: readiness cascades onto the AI slot once every human is ready.
#[tokio::test]
async fn ready_cascade() {
    let addr = start(fast_config()).await;
    let mut alice = TestClient::connect(addr).await;
    let slot_a = alice.expect_greeting().await;
    let mut bob = TestClient::connect(addr).await;
    let slot_b = bob.expect_greeting().await;
    alice.read_frame().await; // roster refresh

    alice.send(&[opcode::PLAYER_READY, 0x00]).await;
    let first = bob.read_frame().await;
    assert_eq!(first.body, vec![opcode::PLAYER_READY, 0x02, slot_a]);

    bob.send(&[opcode::PLAYER_READY, 0x00]).await;
    let second = bob.read_frame().await;
    assert_eq!(second.body, vec![opcode::PLAYER_READY, 0x02, slot_b]);
    let cascade = bob.read_frame().await;
    assert_eq!(cascade.body, vec![opcode::PLAYER_READY, 0x02, 0x00]);
}

/// S4: both clients begin battle; game_speed goes out and each ping stream
/// starts from that client's own counter snapshot.
#[tokio::test]
async fn battle_start() {
    let addr = start(fast_config()).await;
    let mut alice = TestClient::connect(addr).await;
    alice.expect_greeting().await;
    let mut bob = TestClient::connect(addr).await;
    bob.expect_greeting().await;
    alice.read_frame().await; // roster refresh

    // Alice begins: her ping stream starts, nothing for Bob yet.
    let alice_snapshot = alice.received % 16;
    alice.send(&[opcode::BEGIN_BATTLE, 0x06, 0x00, 0x02]).await;
    let ping = alice.read_frame().await;
    assert_eq!(ping.body[0], opcode::BATTLE_PING1);
    assert_eq!(&ping.body[1..5], &0u32.to_le_bytes());
    assert_eq!(&ping.body[5..9], &alice_snapshot.to_le_bytes());
    bob.expect_no_frame(Duration::from_millis(200)).await;

    // Bob begins: game_speed reaches both, Bob's stream starts.
    let bob_snapshot = bob.received % 16;
    bob.send(&[opcode::BEGIN_BATTLE, 0x06, 0x00, 0x02]).await;

    let speed = alice.read_frame().await;
    assert_eq!(speed.body, vec![0x13, 0x21, 0x00, 0x00, 0x00]);
    let speed = bob.read_frame().await;
    assert_eq!(speed.body, vec![0x13, 0x21, 0x00, 0x00, 0x00]);

    let ping = bob.read_frame().await;
    assert_eq!(ping.body[0], opcode::BATTLE_PING1);
    assert_eq!(&ping.body[1..5], &0u32.to_le_bytes());
    assert_eq!(&ping.body[5..9], &bob_snapshot.to_le_bytes());

    // Echoing advances the stream: ping 1 arrives ~33 ms later.
    bob.send(&ping.body).await;
    let next = bob.read_frame().await;
    assert_eq!(next.body[0], opcode::BATTLE_PING1);
    assert_eq!(&next.body[1..5], &1u32.to_le_bytes());
}

/// S5: a silent client is reaped within the idle window and the socket
/// closes from the server side.
#[tokio::test]
async fn idle_reap() {
    let config = ServerConfig {
        greeting_delay: Duration::from_millis(50),
        idle_timeout: Duration::from_millis(300),
        reap_interval: Duration::from_millis(100),
        lobby_ping_interval: Duration::from_secs(600),
        ..ServerConfig::default()
    };
    let addr = start(config).await;
    let mut client = TestClient::connect(addr).await;
    client.expect_greeting().await;

    // Send nothing; the server must close on us.
    let deadline = Duration::from_secs(2);
    let mut buf = [0u8; 2048];
    let closed = timeout(deadline, async {
        loop {
            match client.stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server never closed the idle connection");
}

/// S6: a frame split across two TCP segments dispatches exactly once.
#[tokio::test]
async fn frame_fragmentation() {
    let addr = start(fast_config()).await;
    let mut client = TestClient::connect(addr).await;
    let slot = client.expect_greeting().await;

    let payload = [
        opcode::PLAYER_NAME,
        slot,
        0x00,
        b'F',
        b'o',
        b'o',
        b'b',
        b'a',
        b'r',
        0x00,
        0x21,
    ];
    let frame = encode_frame(&payload, 0).unwrap();
    assert_eq!(frame.len(), 14);

    client.stream.write_all(&frame[..5]).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    client.stream.write_all(&frame[5..]).await.unwrap();

    let broadcast = client.read_frame().await;
    assert_eq!(broadcast.body[0], opcode::PLAYER_NAME);
    assert_eq!(broadcast.body[1], slot);
    client.expect_no_frame(Duration::from_millis(300)).await;
}

/// Two frames written in one TCP segment both dispatch, in order.
#[tokio::test]
async fn back_to_back_frames_in_one_segment() {
    let addr = start(fast_config()).await;
    let mut client = TestClient::connect(addr).await;
    let slot = client.expect_greeting().await;

    let mut bytes = encode_frame(&[opcode::PLAYER_RACE, 0x01, slot], 0).unwrap();
    bytes.extend(encode_frame(&[opcode::PLAYER_COLOR, 0x05, slot], 1).unwrap());
    client.stream.write_all(&bytes).await.unwrap();

    let race = client.read_frame().await;
    assert_eq!(race.body, vec![opcode::PLAYER_RACE, 0x01, slot]);
    let color = client.read_frame().await;
    assert_eq!(color.body, vec![opcode::PLAYER_COLOR, 0x05, slot]);
}

/// The lobby ping reaches greeted clients while their room is out of battle.
#[tokio::test]
async fn lobby_ping_flows() {
    let config = ServerConfig {
        greeting_delay: Duration::from_millis(50),
        lobby_ping_interval: Duration::from_millis(100),
        reap_interval: Duration::from_secs(600),
        ..ServerConfig::default()
    };
    let addr = start(config).await;
    let mut client = TestClient::connect(addr).await;
    client.expect_greeting().await;

    let ping = client.read_frame().await;
    assert_eq!(ping.body, vec![opcode::PING]);
    let ping = client.read_frame().await;
    assert_eq!(ping.body, vec![opcode::PING]);
}
