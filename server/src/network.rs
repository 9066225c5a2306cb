//! The relay event loop and all socket plumbing
//!
//! One task owns the whole server state ([`Server`]) and serializes every
//! mutation: accepted sockets, inbound bytes, connection closures and timer
//! events all arrive as [`ServerEvent`]s over one channel and are handled in
//! order by `tokio::select!` alongside the two periodic tickers (lobby ping,
//! idle reaper). Each connection gets a reader task (socket → events) and a
//! writer task (frame channel → socket) so that a back-pressured peer never
//! stalls anyone else.

use crate::battle::BattlePing;
use crate::lobby;
use crate::rooms::{Departure, RoomManager};
use crate::session::{FrameSender, SessionManager};
use darkcolony_protocol::{
    opcode, parse_commands, ready, sanitize_chat, sanitize_name, Command, Race, SLOT_COUNT,
};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, sleep_until, Instant as TokioInstant};

/// Runtime configuration. `PORT` and `IDLE_TIMEOUT_MS` come from the
/// environment; everything else is protocol-mandated and only varied by
/// tests that compress timings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub idle_timeout: Duration,
    pub greeting_delay: Duration,
    pub lobby_ping_interval: Duration,
    pub reap_interval: Duration,
    pub battle_ping_interval: Duration,
    pub battle_echo_timeout: Duration,
    pub keepalive_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8888,
            idle_timeout: Duration::from_millis(5000),
            greeting_delay: Duration::from_secs(2),
            lobby_ping_interval: Duration::from_millis(300),
            reap_interval: Duration::from_secs(10),
            battle_ping_interval: Duration::from_millis(33),
            battle_echo_timeout: Duration::from_secs(5),
            keepalive_delay: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_u16("PORT", defaults.port),
            idle_timeout: Duration::from_millis(env_u64(
                "IDLE_TIMEOUT_MS",
                defaults.idle_timeout.as_millis() as u64,
            )),
            ..defaults
        }
    }
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Everything the event loop reacts to.
#[derive(Debug)]
pub enum ServerEvent {
    Accepted { stream: TcpStream, addr: SocketAddr },
    Inbound { id: u32, bytes: Vec<u8> },
    Closed { id: u32, reason: &'static str },
    /// The post-accept greeting delay expired.
    GreetingDue { id: u32 },
    /// A scheduled battle ping should go out, if `generation` is current.
    BattlePingDue { id: u32, generation: u64 },
    /// A battle-ping echo was not heard in time, if `generation` is current.
    BattleEchoTimeout { id: u32, generation: u64 },
}

/// Machine-readable lifecycle line, one JSON object per log line.
#[derive(Serialize)]
struct LifecycleEvent<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    reason: &'a str,
}

/// The relay server: owns sessions, rooms and the RNG; runs the event loop.
pub struct Server {
    config: ServerConfig,
    sessions: SessionManager,
    rooms: RoomManager,
    rng: StdRng,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Server {
    pub fn new(config: ServerConfig, mut rng: StdRng) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let rooms = RoomManager::new(&mut rng);
        Self {
            config,
            sessions: SessionManager::new(),
            rooms,
            rng,
            event_tx,
            event_rx,
        }
    }

    /// Run the event loop on an already-bound listener. Never returns under
    /// normal operation.
    pub async fn run(mut self, listener: TcpListener) {
        self.spawn_acceptor(listener);

        let mut lobby_tick = interval(self.config.lobby_ping_interval);
        let mut reap_tick = interval(self.config.reap_interval);
        info!("relay running");

        loop {
            tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = lobby_tick.tick() => self.lobby_ping(),
                _ = reap_tick.tick() => self.reap_idle(),
            }
        }
    }

    fn spawn_acceptor(&self, listener: TcpListener) {
        let event_tx = self.event_tx.clone();
        let keepalive_delay = self.config.keepalive_delay;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if let Err(e) = tune_socket(&stream, keepalive_delay) {
                            warn!("could not tune socket for {}: {}", addr, e);
                        }
                        if event_tx.send(ServerEvent::Accepted { stream, addr }).is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("accept failed: {}", e),
                }
            }
        });
    }

    fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Accepted { stream, addr } => self.handle_accepted(stream, addr),
            ServerEvent::Inbound { id, bytes } => self.handle_inbound(id, &bytes),
            ServerEvent::Closed { id, reason } => self.drop_client(id, reason),
            ServerEvent::GreetingDue { id } => self.handle_greeting_due(id),
            ServerEvent::BattlePingDue { id, generation } => {
                self.handle_battle_ping_due(id, generation)
            }
            ServerEvent::BattleEchoTimeout { id, generation } => {
                self.handle_echo_timeout(id, generation)
            }
        }
    }

    // ---- connection lifecycle ----------------------------------------------

    fn handle_accepted(&mut self, stream: TcpStream, addr: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        // If admission fails the halves are dropped here, closing the socket.
        if let Some(id) = self.admit(addr, frame_tx) {
            self.spawn_reader(id, read_half);
            self.spawn_writer(id, write_half, frame_rx);
        }
    }

    /// Register a session, place it in a room and start its greeting timer.
    fn admit(&mut self, addr: SocketAddr, sender: FrameSender) -> Option<u32> {
        let id = self.sessions.insert(addr, sender);
        let room_id = self.rooms.available_room(&mut self.rng);
        match self.rooms.add_client(room_id, id, &mut self.rng) {
            Some((slot, _had_peers)) => {
                if let Some(session) = self.sessions.get_mut(id) {
                    session.room_id = room_id;
                    session.slot = slot;
                }
                info!("client {} assigned room {} slot {}", id, room_id, slot);
                let event_tx = self.event_tx.clone();
                let delay = self.config.greeting_delay;
                tokio::spawn(async move {
                    sleep(delay).await;
                    let _ = event_tx.send(ServerEvent::GreetingDue { id });
                });
                Some(id)
            }
            None => {
                // available_room only hands out joinable rooms, so this is
                // a should-not-happen guard.
                warn!("client {}: no free slot in room {}, closing", id, room_id);
                self.log_disconnect("room_full");
                self.sessions.remove(id);
                None
            }
        }
    }

    fn spawn_reader(&self, id: u32, mut read_half: OwnedReadHalf) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        let _ = event_tx.send(ServerEvent::Closed { id, reason: "closed" });
                        break;
                    }
                    Ok(n) => {
                        let bytes = buf[..n].to_vec();
                        if event_tx.send(ServerEvent::Inbound { id, bytes }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("client {}: read error: {}", id, e);
                        let _ = event_tx.send(ServerEvent::Closed { id, reason: "read-error" });
                        break;
                    }
                }
            }
        });
    }

    fn spawn_writer(
        &self,
        id: u32,
        mut write_half: OwnedWriteHalf,
        mut frame_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    warn!("client {}: write failed: {}", id, e);
                    let _ = event_tx.send(ServerEvent::Closed { id, reason: "write-error" });
                    break;
                }
            }
            // Channel closed: the session was dropped, let the FIN go out.
        });
    }

    /// The 2 s post-accept delay expired: send the greeting sequence. Port
    /// scanners that connect and vanish never get this far: their session
    /// is already gone and the timer event falls through.
    fn handle_greeting_due(&mut self, id: u32) {
        let Some(session) = self.sessions.get(id) else {
            debug!("greeting timer fired for departed client {}", id);
            return;
        };
        let room_id = session.room_id;
        let slot = session.slot as u8;
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };
        let snapshot = lobby::room_snapshot(room);
        let map = lobby::map_packet(&room.map);
        let peers: Vec<u32> = room.clients.iter().copied().filter(|&c| c != id).collect();

        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        session.send(&lobby::greeting(slot));
        session.send(&snapshot);
        session.send(&map);
        for line in lobby::WELCOME_LINES {
            session.send(&lobby::chat_line(line));
        }
        session.map_sent = true;
        info!("client {} greeted into room {} slot {}", id, room_id, slot);

        // Everyone already in the lobby gets the refreshed roster.
        for peer in peers {
            if let Some(peer_session) = self.sessions.get_mut(peer) {
                if peer_session.map_sent {
                    peer_session.send(&snapshot);
                }
            }
        }
    }

    /// Tear down one client: room slot, battle-ping timers, socket.
    fn drop_client(&mut self, id: u32, reason: &str) {
        let Some(session) = self.sessions.remove(id) else {
            return;
        };
        info!("client {} ({}) disconnected: {}", id, session.addr, reason);
        self.log_disconnect(reason);

        // Any armed battle-ping timer now finds no session and no-ops.
        let room_id = session.room_id;
        if self.rooms.remove_client(room_id, id, &mut self.rng) == Departure::Remaining {
            let Some(room) = self.rooms.get(room_id) else {
                return;
            };
            let snapshot = lobby::room_snapshot(room);
            let targets: Vec<u32> = room.clients.iter().copied().collect();
            for target in targets {
                if let Some(peer) = self.sessions.get_mut(target) {
                    if peer.map_sent {
                        peer.send(&snapshot);
                    }
                }
            }
        }
        // `session` drops here: its frame channel closes, the writer task
        // drains out and the socket goes down.
    }

    fn log_disconnect(&self, reason: &str) {
        if let Ok(line) = serde_json::to_string(&LifecycleEvent {
            kind: "disconnect",
            reason,
        }) {
            info!("{}", line);
        }
    }

    // ---- inbound dispatch --------------------------------------------------

    fn handle_inbound(&mut self, id: u32, bytes: &[u8]) {
        let mut commands = Vec::new();
        {
            let Some(session) = self.sessions.get_mut(id) else {
                return;
            };
            session.touch();
            session.reader.extend(bytes);
            loop {
                match session.reader.next_frame() {
                    Ok(Some(frame)) => {
                        debug!(
                            "client {}: frame counter 0x{:x}, {} byte body",
                            id,
                            frame.counter,
                            frame.body.len()
                        );
                        commands.extend(parse_commands(&frame.body));
                    }
                    Ok(None) => break,
                    Err(e) => warn!("client {}: framing error: {}", id, e),
                }
            }
        }
        for command in commands {
            self.dispatch(id, command);
        }
    }

    fn dispatch(&mut self, id: u32, command: Command) {
        match command {
            Command::PlayerName { slot, name } => self.on_player_name(id, slot, &name),
            Command::PlayerChat { text } => self.on_player_chat(id, &text),
            Command::PlayerRace { race, slot } => self.on_player_race(id, race, slot),
            Command::PlayerColor { color, slot } => self.on_player_color(id, color, slot),
            Command::PlayerTeam { team, slot } => self.on_player_team(id, team, slot),
            Command::PlayerReady => self.on_player_ready(id),
            Command::BeginBattle => self.on_begin_battle(id),
            Command::BattlePingEcho { .. } => self.on_battle_echo(id),
            Command::BattlePingReport => debug!("client {}: battle status report", id),
            Command::Ping => {}
            Command::RoomParamEcho => {}
            Command::Relay { opcode, data } => self.on_relay(id, opcode, data),
            Command::Unknown { opcode, data } => {
                warn!(
                    "client {}: unknown opcode 0x{:02x}, data {:02x?}",
                    id, opcode, data
                )
            }
        }
    }

    fn locate(&self, id: u32) -> Option<(u32, usize)> {
        self.sessions.get(id).map(|s| (s.room_id, s.slot))
    }

    /// Frame `payload` once per recipient in `room_id` (each on its own
    /// counter) and queue the writes. A dead recipient is skipped; its
    /// close event is already on its way.
    fn broadcast(&mut self, room_id: u32, payload: &[u8], except: Option<u32>) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };
        let targets: Vec<u32> = room
            .clients
            .iter()
            .copied()
            .filter(|&c| Some(c) != except)
            .collect();
        for target in targets {
            if let Some(session) = self.sessions.get_mut(target) {
                session.send(payload);
            }
        }
    }

    fn on_player_name(&mut self, id: u32, slot_byte: u8, raw: &[u8]) {
        let Some((room_id, _)) = self.locate(id) else {
            return;
        };
        if slot_byte as usize >= SLOT_COUNT {
            warn!("client {}: name for bad slot {}", id, slot_byte);
            return;
        }
        let name = sanitize_name(raw);
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.slots[slot_byte as usize].name = name.clone();
        }
        let mut payload = vec![opcode::PLAYER_NAME, slot_byte, 0x00];
        payload.extend_from_slice(name.as_bytes());
        payload.push(0x00);
        self.broadcast(room_id, &payload, None);
    }

    fn on_player_chat(&mut self, id: u32, raw: &[u8]) {
        let Some((room_id, _)) = self.locate(id) else {
            return;
        };
        let text = sanitize_chat(raw);
        let mut payload = Vec::with_capacity(text.len() + 2);
        payload.push(opcode::PLAYER_CHAT);
        payload.extend_from_slice(&text);
        payload.push(0x00);
        self.broadcast(room_id, &payload, None);
    }

    fn on_player_race(&mut self, id: u32, race_byte: u8, slot_byte: u8) {
        let Some((room_id, _)) = self.locate(id) else {
            return;
        };
        if slot_byte as usize >= SLOT_COUNT {
            warn!("client {}: race for bad slot {}", id, slot_byte);
            return;
        }
        let race = Race::from_wire(race_byte);
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.slots[slot_byte as usize].race = race;
        }
        self.broadcast(
            room_id,
            &[opcode::PLAYER_RACE, race.wire_byte(), slot_byte],
            None,
        );
    }

    fn on_player_color(&mut self, id: u32, color: u8, slot_byte: u8) {
        let Some((room_id, _)) = self.locate(id) else {
            return;
        };
        if slot_byte as usize >= SLOT_COUNT {
            warn!("client {}: color for bad slot {}", id, slot_byte);
            return;
        }
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.slots[slot_byte as usize].color = color;
        }
        self.broadcast(room_id, &[opcode::PLAYER_COLOR, color, slot_byte], None);
    }

    fn on_player_team(&mut self, id: u32, team: u8, slot_byte: u8) {
        let Some((room_id, _)) = self.locate(id) else {
            return;
        };
        if slot_byte as usize >= SLOT_COUNT {
            warn!("client {}: team for bad slot {}", id, slot_byte);
            return;
        }
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.slots[slot_byte as usize].team = team;
        }
        self.broadcast(room_id, &[opcode::PLAYER_TEAM, team, slot_byte], None);
    }

    /// `player_ready` carries no ordinal; it readies the sender's own slot.
    /// When that completes the human roster, the AI slot readies too.
    fn on_player_ready(&mut self, id: u32) {
        let Some((room_id, slot)) = self.locate(id) else {
            return;
        };
        let cascade = {
            let Some(room) = self.rooms.get_mut(room_id) else {
                return;
            };
            room.slots[slot].ready = true;
            let cascade = room.occupied_humans_ready();
            if cascade {
                room.slots[crate::rooms::AI_SLOT].ready = true;
            }
            cascade
        };
        self.broadcast(
            room_id,
            &[opcode::PLAYER_READY, ready::READY_FOR_BATTLE, slot as u8],
            None,
        );
        if cascade {
            self.broadcast(
                room_id,
                &[
                    opcode::PLAYER_READY,
                    ready::READY_FOR_BATTLE,
                    crate::rooms::AI_SLOT as u8,
                ],
                None,
            );
        }
    }

    // ---- battle ------------------------------------------------------------

    fn on_begin_battle(&mut self, id: u32) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let room_id = session.room_id;
        session.battle_initiated = true;
        // The counter snapshot is taken now, before anything below sends.
        session.battle_ping = Some(BattlePing::new(session.counter()));

        let all_initiated = {
            let Some(room) = self.rooms.get(room_id) else {
                return;
            };
            !room.in_battle
                && !room.clients.is_empty()
                && room
                    .clients
                    .iter()
                    .all(|&c| self.sessions.get(c).map_or(false, |s| s.battle_initiated))
        };
        if all_initiated {
            if let Some(room) = self.rooms.get_mut(room_id) {
                room.in_battle = true;
                info!(
                    "room {} entering battle with {} clients",
                    room_id,
                    room.clients.len()
                );
            }
            // 200% game speed, the captured default.
            self.broadcast(room_id, &[opcode::GAME_SPEED, 0x21, 0x00, 0x00, 0x00], None);
        }

        self.send_battle_ping(id);
    }

    /// Emit the current battle ping for `id` and arm its echo timeout.
    fn send_battle_ping(&mut self, id: u32) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let Some(ping) = session.battle_ping.as_mut() else {
            return;
        };
        ping.waiting_echo = true;
        ping.last_send = Instant::now();
        let generation = ping.bump();
        let payload = ping.payload();
        session.send(&payload);
        self.arm_echo_timeout(id, generation);
    }

    fn arm_echo_timeout(&self, id: u32, generation: u64) {
        let event_tx = self.event_tx.clone();
        let timeout = self.config.battle_echo_timeout;
        tokio::spawn(async move {
            sleep(timeout).await;
            let _ = event_tx.send(ServerEvent::BattleEchoTimeout { id, generation });
        });
    }

    /// Client echoed a ping: schedule the next one 33 ms after the previous
    /// send (not after now, so the stream keeps its cadence).
    fn on_battle_echo(&mut self, id: u32) {
        let ping_interval = self.config.battle_ping_interval;
        let event_tx = self.event_tx.clone();
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let Some(ping) = session.battle_ping.as_mut() else {
            debug!("client {}: battle echo without battle state", id);
            return;
        };
        if !ping.waiting_echo {
            debug!("client {}: unsolicited battle echo", id);
            return;
        }
        ping.waiting_echo = false;
        ping.sequence += 1;
        let generation = ping.bump();
        let due = ping.last_send + ping_interval;
        tokio::spawn(async move {
            sleep_until(TokioInstant::from_std(due)).await;
            let _ = event_tx.send(ServerEvent::BattlePingDue { id, generation });
        });
    }

    fn handle_battle_ping_due(&mut self, id: u32, generation: u64) {
        let current = self
            .sessions
            .get(id)
            .and_then(|s| s.battle_ping.as_ref())
            .map(|p| p.generation);
        if current != Some(generation) {
            return;
        }
        self.send_battle_ping(id);
    }

    /// No echo within the window: treat it as lost and keep the stream alive.
    fn handle_echo_timeout(&mut self, id: u32, generation: u64) {
        {
            let Some(session) = self.sessions.get_mut(id) else {
                return;
            };
            let Some(ping) = session.battle_ping.as_mut() else {
                return;
            };
            if ping.generation != generation || !ping.waiting_echo {
                return;
            }
            warn!(
                "client {}: battle ping {} echo timed out",
                id, ping.sequence
            );
            ping.sequence += 1;
        }
        self.send_battle_ping(id);
    }

    /// Opaque in-battle command: forward to every peer, never interpret.
    fn on_relay(&mut self, id: u32, op: u8, mut data: Vec<u8>) {
        let Some((room_id, _)) = self.locate(id) else {
            return;
        };
        // unit_move sometimes drags a stray terminator; strip it.
        if op == opcode::UNIT_MOVE && data.last() == Some(&0x00) {
            data.pop();
        }
        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(op);
        payload.extend_from_slice(&data);
        self.broadcast(room_id, &payload, Some(id));
    }

    // ---- tickers -----------------------------------------------------------

    /// Every 300 ms: bare `ping` to every greeted client of every room that
    /// is out of battle, keeping NAT mappings warm.
    fn lobby_ping(&mut self) {
        let mut targets = Vec::new();
        for room in self.rooms.iter_mut() {
            if room.in_battle || room.clients.is_empty() {
                continue;
            }
            room.lobby_ping_count = room.lobby_ping_count.wrapping_add(1);
            targets.extend(room.clients.iter().copied());
        }
        for id in targets {
            if let Some(session) = self.sessions.get_mut(id) {
                if session.map_sent {
                    session.send(&[opcode::PING]);
                }
            }
        }
    }

    /// Every 10 s: disconnect anyone silent past the idle timeout.
    fn reap_idle(&mut self) {
        for id in self.sessions.idle_ids(self.config.idle_timeout) {
            info!("client {}: idle timeout", id);
            self.drop_client(id, "idle");
        }
    }
}

fn tune_socket(stream: &TcpStream, keepalive_delay: Duration) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(keepalive_delay))?;
    Ok(())
}
