//! Per-socket connection state machine.
//!
//! A Connection owns everything tied to one accepted socket: the inbound
//! accumulation buffer, the outbound frame queue, both cipher halves, and
//! the serialized execution queue for its decoded packets.
//!
//! Lifecycle:
//!
//! ```text
//! Accepted ──register──▶ Handshaking ──completion──▶ Active
//!     │                       │                        │
//!     └───────────────────────┴── error / half-close / │
//!                                 idle / disconnect ───▶ Closing
//!                                                          │
//!                               outbound drained or grace  ▼
//!                               deadline elapsed ──────▶ Closed
//! ```
//!
//! Threading: the dispatcher thread that owns this connection's registration
//! is the only thread that touches the inbound buffer (on_readable) and the
//! only one that flushes the outbound queue (on_writable). send() may run on
//! any worker thread; it only appends to the queue under the write-half lock
//! and nudges the dispatcher. Handler execution is serialized per connection
//! by the execution queue's in-flight flag.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::{debug, info, trace, warn};
use mio::net::TcpStream;
use mio::Token;

use crate::codec::{self, ChannelCipher, Decode, PayloadReader, PayloadWriter};
use crate::dispatcher::{Command, DispatcherHandle};
use crate::error::{CodecError, NetError, Result};
use crate::opcodes::{PacketHandler, HANDSHAKE_OPCODE};
use crate::pools::TaskHandle;
use crate::server::ServerContext;

/// Unique identifier assigned at accept time, stable for the connection's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    Handshaking,
    Active,
    Closing,
    Closed,
}

impl ConnState {
    fn name(self) -> &'static str {
        match self {
            ConnState::Accepted => "accepted",
            ConnState::Handshaking => "handshaking",
            ConnState::Active => "active",
            ConnState::Closing => "closing",
            ConnState::Closed => "closed",
        }
    }
}

/// What the dispatcher should do after a read pass.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadSignal {
    Continue,
    CloseNow,
}

/// What the dispatcher should do after a write pass.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WriteSignal {
    Drained,
    Partial,
    CloseNow,
}

struct ReadHalf {
    inbound: Vec<u8>,
    cipher: Option<ChannelCipher>,
}

pub(crate) struct WriteHalf {
    queue: VecDeque<Vec<u8>>,
    /// Bytes of the head frame already written to the socket. A frame leaves
    /// the queue only once this reaches its length.
    head_flushed: usize,
    cipher: Option<ChannelCipher>,
    sequence: u64,
}

impl WriteHalf {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            head_flushed: 0,
            cipher: None,
            sequence: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Flushes queued frames into `sink`, preserving the unwritten remainder
    /// of the head frame across calls. Frames are never reordered and no
    /// byte is written twice.
    pub(crate) fn flush_to(&mut self, sink: &mut impl Write) -> io::Result<WriteSignal> {
        loop {
            let (frame_len, written) = {
                let Some(frame) = self.queue.front() else {
                    return Ok(WriteSignal::Drained);
                };
                (frame.len(), sink.write(&frame[self.head_flushed..]))
            };

            match written {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.head_flushed += n;
                    if self.head_flushed == frame_len {
                        self.queue.pop_front();
                        self.head_flushed = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteSignal::Partial)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

struct ExecQueue {
    pending: VecDeque<Box<dyn PacketHandler>>,
    in_flight: bool,
}

pub struct Connection {
    id: ConnectionId,
    token: Token,
    peer: SocketAddr,
    seed: u64,
    state: Mutex<ConnState>,
    stream: Mutex<TcpStream>,
    read_half: Mutex<ReadHalf>,
    write_half: Mutex<WriteHalf>,
    exec: Mutex<ExecQueue>,
    last_traffic: Mutex<Instant>,
    idle_probe: Mutex<Option<TaskHandle>>,
    close_deadline_armed: AtomicBool,
    close_deadline: Mutex<Option<TaskHandle>>,
    dispatcher: DispatcherHandle,
    ctx: Arc<ServerContext>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        token: Token,
        stream: TcpStream,
        peer: SocketAddr,
        seed: u64,
        dispatcher: DispatcherHandle,
        ctx: Arc<ServerContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            token,
            peer,
            seed,
            state: Mutex::new(ConnState::Accepted),
            stream: Mutex::new(stream),
            read_half: Mutex::new(ReadHalf {
                inbound: Vec::new(),
                cipher: None,
            }),
            write_half: Mutex::new(WriteHalf::new()),
            exec: Mutex::new(ExecQueue {
                pending: VecDeque::new(),
                in_flight: false,
            }),
            last_traffic: Mutex::new(Instant::now()),
            idle_probe: Mutex::new(None),
            close_deadline_armed: AtomicBool::new(false),
            close_deadline: Mutex::new(None),
            dispatcher,
            ctx,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    /// The runtime context: pools, opcode table, connection registry.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn stream(&self) -> MutexGuard<'_, TcpStream> {
        self.stream.lock().unwrap()
    }

    /// Encodes a packet and appends it to the outbound queue. Safe to call
    /// from any thread; the owning dispatcher is nudged to flush.
    ///
    /// Only Active sessions accept application packets: before the handshake
    /// completes the write cipher is not engaged, and the peer would receive
    /// a frame it deciphers with the wrong keystream.
    pub fn send(&self, opcode: u16, payload: &[u8]) -> Result<()> {
        match self.state() {
            ConnState::Active => self.enqueue_frame(opcode, payload),
            ConnState::Closing | ConnState::Closed => Err(NetError::ConnectionClosed),
            ConnState::Accepted | ConnState::Handshaking => Err(NetError::NotActive),
        }
    }

    fn enqueue_frame(&self, opcode: u16, payload: &[u8]) -> Result<()> {
        {
            let mut wh = self.write_half.lock().unwrap();
            let frame = codec::encode(opcode, payload, &mut wh.cipher)?;
            wh.sequence += 1;
            trace!(
                "conn {} queued frame {} opcode 0x{:04x} ({} bytes)",
                self.id,
                wh.sequence,
                opcode,
                frame.len()
            );
            wh.queue.push_back(frame);
        }

        self.dispatcher.send(Command::EnableWrite(self.token));
        Ok(())
    }

    /// Requests an orderly close: the outbound queue keeps flushing until it
    /// drains or the close grace elapses.
    pub fn close(&self) {
        self.request_close(false);
    }

    pub(crate) fn request_close(&self, force: bool) {
        self.dispatcher.send(Command::Close {
            token: self.token,
            force,
        });
    }

    /// Sends the initial session-negotiation packet. Called by the acceptor
    /// right after registration; the seed travels in the clear and both
    /// sides derive the same keystream from it. Also arms the idle probe, so
    /// a client that never answers is reaped by the same window as one that
    /// goes quiet later.
    pub(crate) fn send_handshake(self: &Arc<Self>) {
        *self.state.lock().unwrap() = ConnState::Handshaking;
        let mut w = PayloadWriter::new();
        w.write_u64(self.seed);
        if let Err(e) = self.enqueue_frame(HANDSHAKE_OPCODE, &w.into_payload()) {
            warn!("conn {}: failed to queue handshake packet: {e}", self.id);
            self.request_close(true);
            return;
        }
        self.start_idle_probe();
    }

    /// Reads all available bytes (edge-triggered readiness requires draining
    /// the socket) and frames as many complete packets as arrived. Partial
    /// packets stay in the accumulation buffer for the next pass.
    pub(crate) fn on_readable(self: &Arc<Self>) -> ReadSignal {
        match self.state() {
            ConnState::Closing | ConnState::Closed => return ReadSignal::Continue,
            _ => {}
        }

        loop {
            let mut buf = self.ctx.buffers.acquire();
            let read = { self.stream.lock().unwrap().read(&mut buf[..]) };

            match read {
                Ok(0) => {
                    debug!("conn {}: peer closed the read side", self.id);
                    return ReadSignal::CloseNow;
                }
                Ok(n) => {
                    *self.last_traffic.lock().unwrap() = Instant::now();
                    if let Err(violation) = self.ingest(&buf[..n]) {
                        warn!("conn {}: protocol violation: {violation}", self.id);
                        return ReadSignal::CloseNow;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadSignal::Continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("conn {}: read error: {e}", self.id);
                    return ReadSignal::CloseNow;
                }
            }
        }
    }

    /// Appends `bytes` to the accumulation buffer and extracts every packet
    /// that is now complete, submitting each for serialized execution.
    fn ingest(self: &Arc<Self>, bytes: &[u8]) -> std::result::Result<(), CodecError> {
        let mut rh = self.read_half.lock().unwrap();
        let rh = &mut *rh;
        rh.inbound.extend_from_slice(bytes);

        loop {
            let max = self.ctx.config().max_packet_size;
            match codec::try_decode_one(&mut rh.inbound, &mut rh.cipher, max) {
                Decode::Incomplete => return Ok(()),
                Decode::Malformed(e) => return Err(e),
                Decode::Packet { opcode, payload } => {
                    let state = self.state();
                    match state {
                        ConnState::Accepted | ConnState::Handshaking => {
                            if opcode != HANDSHAKE_OPCODE {
                                return Err(CodecError::UnexpectedOpcode {
                                    got: opcode,
                                    state: state.name(),
                                });
                            }
                            // negotiation complete: engage both cipher halves
                            rh.cipher = Some(ChannelCipher::new(self.seed));
                            self.write_half.lock().unwrap().cipher =
                                Some(ChannelCipher::new(self.seed));
                            *self.state.lock().unwrap() = ConnState::Active;
                            info!("conn {}: handshake complete, session active", self.id);
                        }
                        ConnState::Active => {
                            let factory = self
                                .ctx
                                .opcode_table()
                                .resolve(opcode)
                                .ok_or(CodecError::UnknownOpcode(opcode))?;
                            let mut handler = factory();
                            handler.decode(&mut PayloadReader::new(&payload))?;
                            self.enqueue_execution(handler);
                        }
                        ConnState::Closing | ConnState::Closed => return Ok(()),
                    }
                }
            }
        }
    }

    /// Queues a decoded handler and ensures exactly one drain task is in
    /// flight, which serializes handler execution per connection.
    fn enqueue_execution(self: &Arc<Self>, handler: Box<dyn PacketHandler>) {
        let needs_submit = {
            let mut q = self.exec.lock().unwrap();
            q.pending.push_back(handler);
            if q.in_flight {
                false
            } else {
                q.in_flight = true;
                true
            }
        };

        if needs_submit {
            let conn = Arc::clone(self);
            if self
                .ctx
                .pools()
                .execute_inbound(move || conn.run_pending())
                .is_rejected()
            {
                // pool is shutting down; drop the backlog silently
                let mut q = self.exec.lock().unwrap();
                q.in_flight = false;
                q.pending.clear();
            }
        }
    }

    /// Drains this connection's pending handlers in decode order. Runs on an
    /// inbound worker; the in-flight flag guarantees a successor handler
    /// starts only after its predecessor returned.
    fn run_pending(self: &Arc<Self>) {
        loop {
            let mut handler = {
                let mut q = self.exec.lock().unwrap();
                match q.pending.pop_front() {
                    Some(h) => h,
                    None => {
                        q.in_flight = false;
                        return;
                    }
                }
            };
            handler.execute(self);
        }
    }

    /// Flushes the outbound queue into the socket.
    pub(crate) fn on_writable(&self) -> WriteSignal {
        if self.state() == ConnState::Closed {
            return WriteSignal::CloseNow;
        }

        let mut wh = self.write_half.lock().unwrap();
        let mut stream = self.stream.lock().unwrap();
        match wh.flush_to(&mut *stream) {
            Ok(signal) => signal,
            Err(e) => {
                debug!("conn {}: write error: {e}", self.id);
                WriteSignal::CloseNow
            }
        }
    }

    /// Marks the connection Closing. Returns true when it can be finalized
    /// immediately (forced, or nothing left to flush).
    pub(crate) fn ready_to_finalize(&self, force: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            ConnState::Closed => false,
            _ => {
                *state = ConnState::Closing;
                drop(state);
                force || self.write_half.lock().unwrap().is_empty()
            }
        }
    }

    pub(crate) fn outbound_is_empty(&self) -> bool {
        self.write_half.lock().unwrap().is_empty()
    }

    /// Arms the one-shot grace deadline that force-closes a Closing
    /// connection whose outbound queue never drains. The handle is kept so
    /// finalize() can disarm it after a normal drain.
    pub(crate) fn arm_close_deadline(&self) {
        if self.close_deadline_armed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dispatcher = self.dispatcher.clone();
        let token = self.token;
        let grace = self.ctx.config().close_grace;
        let handle = self.ctx.pools().schedule(
            move || {
                dispatcher.send(Command::Close { token, force: true });
            },
            grace,
        );
        *self.close_deadline.lock().unwrap() = handle;
    }

    /// Arms the fixed-rate idle check. Runs from accept onward: a client
    /// that connects and never completes the handshake is reaped by the
    /// same window as an established session that goes quiet.
    fn start_idle_probe(self: &Arc<Self>) {
        let Some(window) = self.ctx.config().idle_timeout else {
            return;
        };

        let weak = Arc::downgrade(self);
        let handle = self.ctx.pools().schedule_at_fixed_rate(
            move || {
                if let Some(conn) = weak.upgrade() {
                    let idle = conn.last_traffic.lock().unwrap().elapsed();
                    let state = conn.state();
                    if idle >= window
                        && !matches!(state, ConnState::Closing | ConnState::Closed)
                    {
                        info!(
                            "conn {}: idle for {idle:?} ({}), closing",
                            conn.id,
                            state.name()
                        );
                        conn.request_close(false);
                    }
                }
            },
            window,
            window,
        );
        *self.idle_probe.lock().unwrap() = handle;
    }

    /// Terminal cleanup, invoked by the owning dispatcher after the socket
    /// was deregistered. Unregisters the connection everywhere and hands the
    /// socket shutdown to the disconnection pool.
    pub(crate) fn finalize(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ConnState::Closed {
                return;
            }
            *state = ConnState::Closed;
        }

        if let Some(probe) = self.idle_probe.lock().unwrap().take() {
            probe.cancel();
        }
        if let Some(deadline) = self.close_deadline.lock().unwrap().take() {
            deadline.cancel();
        }
        self.ctx.unregister_connection(self.id);
        self.exec.lock().unwrap().pending.clear();
        {
            let mut wh = self.write_half.lock().unwrap();
            wh.queue.clear();
            wh.head_flushed = 0;
        }

        let conn = Arc::clone(self);
        let submitted = self.ctx.pools().execute_disconnection(move || {
            let _ = conn.stream.lock().unwrap().shutdown(Shutdown::Both);
            debug!("conn {} finalized ({})", conn.id, conn.peer);
        });
        if submitted.is_rejected() {
            // pools already shutting down; release the socket inline
            let _ = self.stream.lock().unwrap().shutdown(Shutdown::Both);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}
