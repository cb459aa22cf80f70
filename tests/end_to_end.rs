//! Loopback integration tests driving a real server through a plain
//! std::net client: handshake, ciphered traffic, per-connection handler
//! ordering, and shutdown.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use netgate::{
    encode, try_decode_one, ChannelCipher, CodecError, ConnState, Connection, ConnectionId, Decode,
    NetError, NetServer, OpcodeTable, PacketHandler, PayloadReader, PayloadWriter, ServerConfig,
    HANDSHAKE_OPCODE,
};

const OP_PING: u16 = 0x0001;
const OP_PONG: u16 = 0x0002;
const OP_SLOW: u16 = 0x0010;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-side half of the wire protocol, built on the public codec.
struct Client {
    stream: TcpStream,
    inbound: Vec<u8>,
    rx: Option<ChannelCipher>,
    tx: Option<ChannelCipher>,
}

impl Client {
    fn connect(server: &NetServer) -> Self {
        let stream = TcpStream::connect(server.local_addr()).expect("connect");
        stream
            .set_read_timeout(Some(CLIENT_TIMEOUT))
            .expect("read timeout");
        Self {
            stream,
            inbound: Vec::new(),
            rx: None,
            tx: None,
        }
    }

    fn read_packet(&mut self) -> (u16, Vec<u8>) {
        loop {
            match try_decode_one(&mut self.inbound, &mut self.rx, 64 * 1024) {
                Decode::Packet { opcode, payload } => return (opcode, payload),
                Decode::Malformed(e) => panic!("server sent malformed frame: {e}"),
                Decode::Incomplete => {
                    let mut buf = [0u8; 4096];
                    let n = self.stream.read(&mut buf).expect("read from server");
                    assert!(n > 0, "server closed before a full packet arrived");
                    self.inbound.extend_from_slice(&buf[..n]);
                }
            }
        }
    }

    fn send_packet(&mut self, opcode: u16, payload: &[u8]) {
        let frame = encode(opcode, payload, &mut self.tx).expect("encode");
        self.stream.write_all(&frame).expect("write to server");
    }

    /// Consumes the server's seed packet, replies with the completion, and
    /// engages both cipher halves.
    fn complete_handshake(&mut self) -> u64 {
        let (opcode, payload) = self.read_packet();
        assert_eq!(opcode, HANDSHAKE_OPCODE, "first packet must be the seed");
        let seed = PayloadReader::new(&payload).read_u64().expect("seed");

        self.send_packet(HANDSHAKE_OPCODE, &[]);
        self.rx = Some(ChannelCipher::new(seed));
        self.tx = Some(ChannelCipher::new(seed));
        seed
    }
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

struct Ping {
    nonce: u32,
    seen_thread: Arc<Mutex<Option<String>>>,
}

impl PacketHandler for Ping {
    fn decode(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), CodecError> {
        self.nonce = reader.read_u32()?;
        Ok(())
    }

    fn execute(&mut self, conn: &Arc<Connection>) {
        let name = std::thread::current()
            .name()
            .unwrap_or_default()
            .to_owned();
        *self.seen_thread.lock().unwrap() = Some(name);

        let mut w = PayloadWriter::new();
        w.write_u32(self.nonce);
        conn.send(OP_PONG, &w.into_payload()).expect("pong");
    }
}

fn quiet_config() -> ServerConfig {
    ServerConfig::builder()
        .address("127.0.0.1:0".parse().unwrap())
        .selector_count(2)
        .shutdown_grace(Duration::from_millis(500))
        .disconnection_drain_grace(Duration::from_secs(5))
        .build()
}

#[test]
fn test_handshake_then_ciphered_ping_pong() {
    let seen_thread = Arc::new(Mutex::new(None));
    let seen_clone = Arc::clone(&seen_thread);

    let table = OpcodeTable::builder()
        .register(OP_PING, move || Ping {
            nonce: 0,
            seen_thread: Arc::clone(&seen_clone),
        })
        .build();

    let server = NetServer::start(quiet_config(), table).expect("start");
    let mut client = Client::connect(&server);
    client.complete_handshake();

    let mut w = PayloadWriter::new();
    w.write_u32(42);
    client.send_packet(OP_PING, &w.into_payload());

    let (opcode, payload) = client.read_packet();
    assert_eq!(opcode, OP_PONG);
    assert_eq!(
        PayloadReader::new(&payload).read_u32().unwrap(),
        42,
        "payload must survive the cipher in both directions"
    );

    let thread = seen_thread.lock().unwrap().clone().expect("handler ran");
    assert!(
        thread.contains("inbound-worker"),
        "handlers run on the inbound pool, not the selector (ran on {thread})"
    );

    server.shutdown();
}

struct Slow {
    sequence: u32,
    order: Arc<Mutex<Vec<u32>>>,
}

impl PacketHandler for Slow {
    fn decode(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), CodecError> {
        self.sequence = reader.read_u32()?;
        Ok(())
    }

    fn execute(&mut self, _conn: &Arc<Connection>) {
        // long enough that overlapping execution would interleave sequences
        std::thread::sleep(Duration::from_millis(15));
        self.order.lock().unwrap().push(self.sequence);
    }
}

#[test]
fn test_handlers_for_one_connection_run_in_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let order_clone = Arc::clone(&order);

    let table = OpcodeTable::builder()
        .register(OP_SLOW, move || Slow {
            sequence: 0,
            order: Arc::clone(&order_clone),
        })
        .build();

    // plenty of workers available, so only the per-connection queue can
    // explain strict ordering
    let config = ServerConfig::builder()
        .address("127.0.0.1:0".parse().unwrap())
        .inbound_workers(8)
        .shutdown_grace(Duration::from_millis(500))
        .build();

    let server = NetServer::start(config, table).expect("start");
    let mut client = Client::connect(&server);
    client.complete_handshake();

    const COUNT: u32 = 20;
    for sequence in 0..COUNT {
        let mut w = PayloadWriter::new();
        w.write_u32(sequence);
        client.send_packet(OP_SLOW, &w.into_payload());
    }

    assert!(
        wait_until(CLIENT_TIMEOUT, || order.lock().unwrap().len()
            == COUNT as usize),
        "all handlers should finish"
    );
    let observed = order.lock().unwrap().clone();
    assert_eq!(
        observed,
        (0..COUNT).collect::<Vec<_>>(),
        "handlers for one connection must execute in arrival order"
    );

    server.shutdown();
}

#[test]
fn test_unknown_opcode_closes_only_that_connection() {
    let table = OpcodeTable::builder()
        .register(OP_PING, || Ping {
            nonce: 0,
            seen_thread: Arc::new(Mutex::new(None)),
        })
        .build();

    let server = NetServer::start(quiet_config(), table).expect("start");

    let mut offender = Client::connect(&server);
    offender.complete_handshake();
    let mut bystander = Client::connect(&server);
    bystander.complete_handshake();

    assert!(
        wait_until(CLIENT_TIMEOUT, || server.connection_count() == 2),
        "both connections should be registered"
    );

    offender.send_packet(0x7FFF, b"no such opcode");
    assert!(
        wait_until(CLIENT_TIMEOUT, || server.connection_count() == 1),
        "the offending connection should be dropped"
    );

    // the bystander is untouched and still gets service
    let mut w = PayloadWriter::new();
    w.write_u32(7);
    bystander.send_packet(OP_PING, &w.into_payload());
    let (opcode, _) = bystander.read_packet();
    assert_eq!(opcode, OP_PONG);

    server.shutdown();
}

#[test]
fn test_packet_before_handshake_completion_is_rejected() {
    let table = OpcodeTable::builder()
        .register(OP_PING, || Ping {
            nonce: 0,
            seen_thread: Arc::new(Mutex::new(None)),
        })
        .build();

    let server = NetServer::start(quiet_config(), table).expect("start");
    let mut client = Client::connect(&server);

    // read the seed but skip the completion reply
    let (opcode, _) = client.read_packet();
    assert_eq!(opcode, HANDSHAKE_OPCODE);

    // a session packet out of order is a protocol violation
    client.send_packet(OP_PING, &0u32.to_le_bytes());
    assert!(
        wait_until(CLIENT_TIMEOUT, || server.connection_count() == 0),
        "connection must close on an out-of-order opcode"
    );

    server.shutdown();
}

#[test]
fn test_shutdown_closes_connected_clients() {
    let table = OpcodeTable::builder()
        .register(OP_PING, || Ping {
            nonce: 0,
            seen_thread: Arc::new(Mutex::new(None)),
        })
        .build();

    let server = NetServer::start(quiet_config(), table).expect("start");
    let mut client = Client::connect(&server);
    client.complete_handshake();
    assert!(wait_until(CLIENT_TIMEOUT, || server.connection_count() == 1));

    server.shutdown();
    assert_eq!(server.connection_count(), 0);

    // the socket is really closed: reads drain to EOF
    let mut buf = [0u8; 256];
    let deadline = Instant::now() + CLIENT_TIMEOUT;
    loop {
        match client.stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(_) => break,
        }
        assert!(Instant::now() < deadline, "expected EOF after shutdown");
    }

    // second call is a no-op
    server.shutdown();
}

#[test]
fn test_broadcast_reaches_every_connection() {
    let table = OpcodeTable::builder()
        .register(OP_PING, || Ping {
            nonce: 0,
            seen_thread: Arc::new(Mutex::new(None)),
        })
        .build();

    let server = NetServer::start(quiet_config(), table).expect("start");
    let mut clients: Vec<Client> = (0..3)
        .map(|_| {
            let mut c = Client::connect(&server);
            c.complete_handshake();
            c
        })
        .collect();

    assert!(wait_until(CLIENT_TIMEOUT, || server.connection_count() == 3));

    let mut w = PayloadWriter::new();
    w.write_cstring("server notice");
    server.broadcast(0x0100, w.into_payload());

    for client in clients.iter_mut() {
        let (opcode, payload) = client.read_packet();
        assert_eq!(opcode, 0x0100);
        assert_eq!(
            PayloadReader::new(&payload).read_cstring().unwrap(),
            "server notice"
        );
    }

    server.shutdown();
}

struct Counting {
    hits: Arc<AtomicUsize>,
}

impl PacketHandler for Counting {
    fn decode(&mut self, _reader: &mut PayloadReader<'_>) -> Result<(), CodecError> {
        Ok(())
    }

    fn execute(&mut self, _conn: &Arc<Connection>) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_oversized_header_drops_connection_without_dispatch() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = Arc::clone(&hits);

    let table = OpcodeTable::builder()
        .register(OP_PING, move || Counting {
            hits: Arc::clone(&hits_clone),
        })
        .build();

    let config = ServerConfig::builder()
        .address("127.0.0.1:0".parse().unwrap())
        .max_packet_size(256)
        .shutdown_grace(Duration::from_millis(500))
        .build();

    let server = NetServer::start(config, table).expect("start");
    let mut client = Client::connect(&server);
    client.complete_handshake();
    assert!(wait_until(CLIENT_TIMEOUT, || server.connection_count() == 1));

    // a header declaring more than max_packet_size, followed by an opcode
    let mut raw = Vec::new();
    raw.extend_from_slice(&300u16.to_le_bytes());
    raw.extend_from_slice(&OP_PING.to_le_bytes());
    client.stream.write_all(&raw).expect("write");

    assert!(
        wait_until(CLIENT_TIMEOUT, || server.connection_count() == 0),
        "an oversized declared length must close the connection"
    );
    assert_eq!(
        hits.load(Ordering::SeqCst),
        0,
        "nothing may be dispatched from a malformed frame"
    );

    server.shutdown();
}

#[test]
fn test_server_send_is_refused_until_handshake_completes() {
    let table = OpcodeTable::builder()
        .register(OP_PING, || Ping {
            nonce: 0,
            seen_thread: Arc::new(Mutex::new(None)),
        })
        .build();

    let server = NetServer::start(quiet_config(), table).expect("start");
    let mut client = Client::connect(&server);

    // read the seed but hold off on the completion
    let (opcode, payload) = client.read_packet();
    assert_eq!(opcode, HANDSHAKE_OPCODE);
    let seed = PayloadReader::new(&payload).read_u64().expect("seed");
    assert!(wait_until(CLIENT_TIMEOUT, || server.connection_count() == 1));

    let conn = server
        .context()
        .connection(ConnectionId(1))
        .expect("registered");
    assert_eq!(conn.state(), ConnState::Handshaking);
    assert!(
        matches!(conn.send(OP_PONG, &[]), Err(NetError::NotActive)),
        "sends before the cipher is engaged would reach the peer in the clear"
    );

    // once the completion lands, the same send goes through ciphered
    client.send_packet(HANDSHAKE_OPCODE, &[]);
    client.rx = Some(ChannelCipher::new(seed));
    client.tx = Some(ChannelCipher::new(seed));
    assert!(wait_until(CLIENT_TIMEOUT, || conn.state() == ConnState::Active));

    let mut w = PayloadWriter::new();
    w.write_u32(9);
    conn.send(OP_PONG, &w.into_payload())
        .expect("active session accepts sends");
    let (opcode, payload) = client.read_packet();
    assert_eq!(opcode, OP_PONG);
    assert_eq!(PayloadReader::new(&payload).read_u32().unwrap(), 9);

    server.shutdown();
}

#[test]
fn test_connection_stuck_in_handshake_is_reaped() {
    let table = OpcodeTable::builder()
        .register(OP_PING, || Ping {
            nonce: 0,
            seen_thread: Arc::new(Mutex::new(None)),
        })
        .build();

    let config = ServerConfig::builder()
        .address("127.0.0.1:0".parse().unwrap())
        .idle_timeout(Some(Duration::from_millis(100)))
        .shutdown_grace(Duration::from_millis(500))
        .build();

    let server = NetServer::start(config, table).expect("start");
    let mut client = Client::connect(&server);

    // take the seed and never answer
    let (opcode, _) = client.read_packet();
    assert_eq!(opcode, HANDSHAKE_OPCODE);
    assert!(wait_until(CLIENT_TIMEOUT, || server.connection_count() == 1));

    assert!(
        wait_until(CLIENT_TIMEOUT, || server.connection_count() == 0),
        "a connection that never completes its handshake must be reaped"
    );

    server.shutdown();
}

#[test]
fn test_idle_connection_is_reaped() {
    let table = OpcodeTable::builder()
        .register(OP_PING, || Ping {
            nonce: 0,
            seen_thread: Arc::new(Mutex::new(None)),
        })
        .build();

    let config = ServerConfig::builder()
        .address("127.0.0.1:0".parse().unwrap())
        .idle_timeout(Some(Duration::from_millis(100)))
        .shutdown_grace(Duration::from_millis(500))
        .build();

    let server = NetServer::start(config, table).expect("start");
    let mut client = Client::connect(&server);
    client.complete_handshake();
    assert!(wait_until(CLIENT_TIMEOUT, || server.connection_count() == 1));

    // send nothing; the idle probe should close the session
    assert!(
        wait_until(CLIENT_TIMEOUT, || server.connection_count() == 0),
        "idle connection should be closed"
    );

    server.shutdown();
}

#[test]
fn test_max_connections_rejects_overflow() {
    let table = OpcodeTable::builder()
        .register(OP_PING, || Ping {
            nonce: 0,
            seen_thread: Arc::new(Mutex::new(None)),
        })
        .build();

    let config = ServerConfig::builder()
        .address("127.0.0.1:0".parse().unwrap())
        .max_connections(1)
        .shutdown_grace(Duration::from_millis(500))
        .build();

    let server = NetServer::start(config, table).expect("start");
    let mut first = Client::connect(&server);
    first.complete_handshake();
    assert!(wait_until(CLIENT_TIMEOUT, || server.connection_count() == 1));

    // the second connect is accepted at the OS level but never registered;
    // it sees EOF instead of a handshake
    let second = TcpStream::connect(server.local_addr()).expect("connect");
    second
        .set_read_timeout(Some(CLIENT_TIMEOUT))
        .expect("read timeout");
    let mut buf = [0u8; 64];
    let mut stream = second;
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "overflow connection gets no handshake");

    assert_eq!(server.connection_count(), 1);
    server.shutdown();
}

#[test]
fn test_connection_count_tracks_client_disconnects() {
    let table = OpcodeTable::builder()
        .register(OP_PING, || Ping {
            nonce: 0,
            seen_thread: Arc::new(Mutex::new(None)),
        })
        .build();
    let server = NetServer::start(quiet_config(), table).expect("start");

    let mut client = Client::connect(&server);
    client.complete_handshake();
    assert!(wait_until(CLIENT_TIMEOUT, || server.connection_count() == 1));

    drop(client);
    assert!(
        wait_until(CLIENT_TIMEOUT, || server.connection_count() == 0),
        "client disconnect should unregister the connection"
    );

    server.shutdown();
}
