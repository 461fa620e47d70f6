//! Integration tests for the server's onboarding and relay behaviour.
//!
//! Players are plain TCP sockets speaking the length-prefixed wire format,
//! except for the last test which drives real client connections.  A
//! current-thread runtime runs everything, so the helpers interleave
//! `Hub::pump` with short sleeps to let socket tasks make progress.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mesa_client::infrastructure::network::{Connection, ConnectionConfig};
use mesa_core::protocol::{decode_notification, frame_notification};
use mesa_core::{Bus, Hub, Kind, Notification, Origin, Receptor, ReceptorId};
use mesa_server::infrastructure::network::{Server, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TryRecvError};

type Seen = Arc<Mutex<Vec<Notification>>>;

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Records local notifications and, when `answer` is set, hands pending
/// players a snapshot whose payload is `b"table"`.
struct Table {
    id: ReceptorId,
    bus: Bus,
    answer: bool,
    seen: Seen,
}

impl Receptor for Table {
    fn receptor_id(&self) -> ReceptorId {
        self.id
    }

    fn handle_local(&mut self, n: &Notification) -> bool {
        if n.kind == Kind::TimerTick {
            return false;
        }
        if self.answer
            && n.kind == Kind::StateSnapshot
            && n.for_pending_clients
            && n.origin == Origin::Local
        {
            self.bus.enqueue(
                Notification::remote(Kind::StateSnapshot)
                    .for_pending_clients()
                    .with_payload(b"table".to_vec()),
            );
        }
        self.seen.lock().unwrap().push(n.clone());
        true
    }
}

/// Builds a started server on a loopback ephemeral port.
fn server_hub(answer: bool) -> (Hub, Seen, SocketAddr) {
    let bus = Bus::new();
    let mut hub = Hub::with_bus(bus.clone());
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    hub.register_local(Box::new(Table {
        id: bus.allocate_id(),
        bus: bus.clone(),
        answer,
        seen: Arc::clone(&seen),
    }));
    let mut server = Server::new(
        bus.clone(),
        ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            game_port: 0,
            announce_port: free_udp_port(),
            tick_interval_ms: 5,
            ..ServerConfig::default()
        },
    );
    server.start();
    let addr = server.local_addr().unwrap();
    hub.attach(Box::new(server));
    (hub, seen, addr)
}

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .and_then(|s| s.local_addr())
        .map(|a| a.port())
        .unwrap()
}

/// Pumps `hub` until `done` holds, giving up after two seconds.
async fn pump_until(hub: &mut Hub, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        hub.pump();
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

async fn pump_for(hub: &mut Hub, rounds: usize) {
    for _ in 0..rounds {
        hub.pump();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn saw(seen: &Seen, pred: impl Fn(&Notification) -> bool) -> bool {
    seen.lock().unwrap().iter().any(pred)
}

/// A player speaking the wire format directly.
struct RawPlayer {
    writer: OwnedWriteHalf,
    inbox: mpsc::UnboundedReceiver<Notification>,
    received: Vec<Notification>,
    closed: bool,
}

impl RawPlayer {
    async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let (tx, inbox) = mpsc::unbounded_channel();
        tokio::spawn(read_frames(reader, tx));
        Self {
            writer,
            inbox,
            received: Vec::new(),
            closed: false,
        }
    }

    async fn send(&mut self, n: &Notification) {
        let frame = frame_notification(n).unwrap();
        self.writer.write_all(&frame).await.unwrap();
    }

    async fn identify(&mut self, id: &str) {
        self.send(&Notification::new(Kind::ConnectResponse).with_client_id(id))
            .await;
    }

    fn poll(&mut self) {
        loop {
            match self.inbox.try_recv() {
                Ok(n) => self.received.push(n),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }

    fn count(&mut self, kind: Kind) -> usize {
        self.poll();
        self.received.iter().filter(|n| n.kind == kind).count()
    }

    fn has(&mut self, kind: Kind) -> bool {
        self.count(kind) > 0
    }

    fn is_closed(&mut self) -> bool {
        self.poll();
        self.closed
    }
}

async fn read_frames(mut reader: OwnedReadHalf, tx: mpsc::UnboundedSender<Notification>) {
    loop {
        let mut header = [0u8; 4];
        if reader.read_exact(&mut header).await.is_err() {
            break;
        }
        let mut payload = vec![0u8; u32::from_le_bytes(header) as usize];
        if reader.read_exact(&mut payload).await.is_err() {
            break;
        }
        match decode_notification(&payload) {
            Ok(n) => {
                if tx.send(n).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_new_player_gets_snapshot_before_joining() {
    // Arrange
    let (mut hub, seen, addr) = server_hub(true);

    // Act
    let mut player = RawPlayer::connect(addr).await;
    let onboarded = pump_until(&mut hub, || player.has(Kind::StateSnapshot)).await;

    // Assert
    assert!(onboarded);
    assert_eq!(player.received[0].payload, b"table");
    assert!(saw(&seen, |n| n.kind == Kind::StateSnapshot
        && n.for_pending_clients
        && n.origin == Origin::Local));
}

#[tokio::test]
async fn test_message_reaches_every_other_player_but_not_the_sender() {
    // Arrange: three onboarded players
    let (mut hub, seen, addr) = server_hub(true);
    let mut a = RawPlayer::connect(addr).await;
    let mut b = RawPlayer::connect(addr).await;
    let mut c = RawPlayer::connect(addr).await;
    assert!(
        pump_until(&mut hub, || {
            a.has(Kind::StateSnapshot) && b.has(Kind::StateSnapshot) && c.has(Kind::StateSnapshot)
        })
        .await
    );

    // Act
    let moved = Notification::remote(Kind::Custom(7)).with_payload(vec![1, 2, 3]);
    a.send(&moved).await;
    let relayed = pump_until(&mut hub, || b.has(Kind::Custom(7)) && c.has(Kind::Custom(7))).await;
    pump_for(&mut hub, 10).await;

    // Assert
    assert!(relayed);
    assert_eq!(b.count(Kind::Custom(7)), 1);
    assert_eq!(c.count(Kind::Custom(7)), 1);
    assert!(!a.has(Kind::Custom(7)), "sender must not get its own message");
    let at_b = b.received.iter().find(|n| n.kind == Kind::Custom(7)).unwrap();
    assert_eq!(at_b.payload, vec![1, 2, 3]);
    assert!(saw(&seen, |n| n.kind == Kind::Custom(7)
        && n.origin == Origin::Remote
        && n.local
        && !n.remote));
}

#[tokio::test]
async fn test_messages_from_one_player_keep_their_order() {
    let (mut hub, _seen, addr) = server_hub(true);
    let mut a = RawPlayer::connect(addr).await;
    let mut b = RawPlayer::connect(addr).await;
    assert!(
        pump_until(&mut hub, || a.has(Kind::StateSnapshot) && b.has(Kind::StateSnapshot)).await
    );

    for i in 0..20u8 {
        a.send(&Notification::remote(Kind::Custom(1)).with_payload(vec![i]))
            .await;
    }
    assert!(pump_until(&mut hub, || b.count(Kind::Custom(1)) == 20).await);

    let order: Vec<u8> = b
        .received
        .iter()
        .filter(|n| n.kind == Kind::Custom(1))
        .map(|n| n.payload[0])
        .collect();
    assert_eq!(order, (0..20).collect::<Vec<u8>>());
}

#[tokio::test]
async fn test_pending_player_is_left_out_of_broadcasts() {
    // Arrange: nobody answers snapshot requests, so players stay pending.
    let (mut hub, seen, addr) = server_hub(false);
    let mut player = RawPlayer::connect(addr).await;
    assert!(pump_until(&mut hub, || saw(&seen, |n| n.kind == Kind::StateSnapshot)).await);

    // Act
    hub.enqueue(Notification::remote(Kind::Custom(3)));
    pump_for(&mut hub, 10).await;

    // Assert
    assert!(!player.has(Kind::Custom(3)));
    assert!(!player.is_closed());
}

#[tokio::test]
async fn test_targeted_send_reaches_only_the_named_player() {
    // Arrange
    let (mut hub, seen, addr) = server_hub(true);
    let mut a = RawPlayer::connect(addr).await;
    let mut b = RawPlayer::connect(addr).await;
    assert!(
        pump_until(&mut hub, || a.has(Kind::StateSnapshot) && b.has(Kind::StateSnapshot)).await
    );
    a.identify("alice").await;
    b.identify("bob").await;
    let identified = |id: &'static str| {
        let seen = Arc::clone(&seen);
        move || {
            saw(&seen, |n| {
                n.kind == Kind::ConnectResponse && n.client_id.as_deref() == Some(id)
            })
        }
    };
    let (alice_known, bob_known) = (identified("alice"), identified("bob"));
    assert!(pump_until(&mut hub, || alice_known() && bob_known()).await);

    // Act
    hub.enqueue(Notification::remote(Kind::Custom(5)).with_client_id("bob"));
    let delivered = pump_until(&mut hub, || b.has(Kind::Custom(5))).await;
    pump_for(&mut hub, 10).await;

    // Assert
    assert!(delivered);
    assert!(!a.has(Kind::Custom(5)));
}

#[tokio::test]
async fn test_duplicate_client_id_drops_the_newcomer() {
    // Arrange
    let (mut hub, seen, addr) = server_hub(true);
    let mut first = RawPlayer::connect(addr).await;
    let mut second = RawPlayer::connect(addr).await;
    assert!(
        pump_until(&mut hub, || first.has(Kind::StateSnapshot)
            && second.has(Kind::StateSnapshot))
        .await
    );
    first.identify("dup").await;
    assert!(
        pump_until(&mut hub, || saw(&seen, |n| n.kind == Kind::ConnectResponse
            && n.client_id.as_deref() == Some("dup")))
        .await
    );

    // Act
    second.identify("dup").await;
    let dropped = pump_until(&mut hub, || second.is_closed()).await;

    // Assert
    assert!(dropped);
    assert!(saw(&seen, |n| n.kind == Kind::Error
        && n.error
            .as_deref()
            .is_some_and(|e| e.contains("duplicate client id 'dup'"))));
    assert!(saw(&seen, |n| n.kind == Kind::Disconnected));
    // The second claim is neither relayed nor published.
    assert_eq!(first.count(Kind::ConnectResponse), 0);
    assert!(!first.is_closed());
}

#[tokio::test]
async fn test_rejected_pending_player_is_closed() {
    // Arrange
    let (mut hub, seen, addr) = server_hub(false);
    let mut player = RawPlayer::connect(addr).await;
    assert!(pump_until(&mut hub, || saw(&seen, |n| n.kind == Kind::StateSnapshot)).await);

    // Act
    hub.enqueue(
        Notification::remote(Kind::Error)
            .with_error("table is full")
            .for_pending_clients(),
    );
    let closed = pump_until(&mut hub, || player.is_closed()).await;

    // Assert
    assert!(closed);
    assert!(!player.has(Kind::Error), "rejection is not sent to the player");
    assert!(saw(&seen, |n| n.kind == Kind::Error
        && n.error.as_deref().is_some_and(|e| e.contains("table is full"))));
    assert!(saw(&seen, |n| n.kind == Kind::Disconnected));
}

#[tokio::test]
async fn test_player_leaving_is_reported_with_its_id() {
    let (mut hub, seen, addr) = server_hub(true);
    let mut player = RawPlayer::connect(addr).await;
    assert!(pump_until(&mut hub, || player.has(Kind::StateSnapshot)).await);
    player.identify("carol").await;
    assert!(
        pump_until(&mut hub, || saw(&seen, |n| n.kind == Kind::ConnectResponse)).await
    );

    drop(player);
    let reported = pump_until(&mut hub, || {
        saw(&seen, |n| {
            n.kind == Kind::Disconnected && n.client_id.as_deref() == Some("carol")
        })
    })
    .await;

    assert!(reported);
}

#[tokio::test]
async fn test_stop_closes_every_player() {
    let (mut hub, _seen, addr) = server_hub(true);
    let mut player = RawPlayer::connect(addr).await;
    assert!(pump_until(&mut hub, || player.has(Kind::StateSnapshot)).await);

    hub.enqueue(Notification::new(Kind::Stop));
    let closed = pump_until(&mut hub, || player.is_closed()).await;

    assert!(closed);
}

#[tokio::test]
async fn test_clients_exchange_notifications_through_the_server() {
    // Arrange: one server hub and two client hubs
    let (mut server, _server_seen, addr) = server_hub(true);
    let mut players = Vec::new();
    for id in ["p1", "p2"] {
        let bus = Bus::new();
        let mut hub = Hub::with_bus(bus.clone());
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        hub.register_local(Box::new(Table {
            id: bus.allocate_id(),
            bus: bus.clone(),
            answer: false,
            seen: Arc::clone(&seen),
        }));
        hub.attach(Box::new(Connection::new(
            bus.clone(),
            ConnectionConfig {
                tick_interval_ms: 5,
                ..ConnectionConfig::default()
            },
        )));
        hub.enqueue(
            Notification::new(Kind::Connect)
                .with_client_id(id)
                .with_address(addr.to_string()),
        );
        players.push((hub, seen));
    }

    let pump_all = |server: &mut Hub, players: &mut Vec<(Hub, Seen)>| {
        server.pump();
        for (hub, _) in players.iter_mut() {
            hub.pump();
        }
    };
    let mut onboarded = false;
    for _ in 0..400 {
        pump_all(&mut server, &mut players);
        onboarded = players
            .iter()
            .all(|(_, seen)| saw(seen, |n| n.kind == Kind::StateSnapshot));
        if onboarded {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(onboarded);

    // Act: p1 publishes a remote-flagged move
    players[0]
        .0
        .enqueue(Notification::remote(Kind::Custom(9)).with_payload(b"move".to_vec()));
    let mut arrived = false;
    for _ in 0..400 {
        pump_all(&mut server, &mut players);
        arrived = saw(&players[1].1, |n| n.kind == Kind::Custom(9));
        if arrived {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Assert
    assert!(arrived);
    let at_p2 = players[1].1.lock().unwrap().clone();
    let moved = at_p2.iter().find(|n| n.kind == Kind::Custom(9)).unwrap();
    assert_eq!(moved.payload, b"move");
    assert_eq!(moved.origin, Origin::Remote);
    assert!(!saw(&players[0].1, |n| n.kind == Kind::Custom(9)));
}

#[tokio::test]
async fn test_frames_sent_while_pending_are_relayed_after_activation() {
    // Arrange: onboard `a` by hand, then let `b` wait in pending.
    let (mut hub, seen, addr) = server_hub(false);
    let snapshot = || {
        Notification::remote(Kind::StateSnapshot)
            .for_pending_clients()
            .with_payload(b"table".to_vec())
    };
    let requests = |seen: &Seen| {
        seen.lock()
            .unwrap()
            .iter()
            .filter(|n| n.kind == Kind::StateSnapshot && n.origin == Origin::Local)
            .count()
    };
    let mut a = RawPlayer::connect(addr).await;
    assert!(pump_until(&mut hub, || requests(&seen) == 1).await);
    hub.enqueue(snapshot());
    assert!(pump_until(&mut hub, || a.has(Kind::StateSnapshot)).await);
    let mut b = RawPlayer::connect(addr).await;
    assert!(pump_until(&mut hub, || requests(&seen) == 2).await);

    // Act
    b.send(&Notification::remote(Kind::Custom(4))).await;
    pump_for(&mut hub, 10).await;
    let early = a.has(Kind::Custom(4));
    hub.enqueue(snapshot());
    let relayed = pump_until(&mut hub, || a.has(Kind::Custom(4)) && b.has(Kind::StateSnapshot)).await;

    // Assert
    assert!(!early, "pending frames must wait for activation");
    assert!(relayed);
    assert!(saw(&seen, |n| n.kind == Kind::Custom(4) && n.origin == Origin::Remote));
}
