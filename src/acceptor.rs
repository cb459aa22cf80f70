//! Listening-socket selector.
//!
//! The acceptor runs its own small poll loop over just the listening socket
//! (the original design gives accepts a dedicated dispatcher so a flood of
//! connects never competes with established traffic for selector time). For
//! each pending connection it builds a Connection, assigns it round-robin to
//! a dispatcher, and queues the server-initiated handshake packet.
//!
//! Transient accept failures are logged and the loop continues; only a bind
//! failure (handled at server startup) is fatal.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::connection::{Connection, ConnectionId};
use crate::dispatcher::{Command, DispatcherHandle};
use crate::error::Result;
use crate::server::ServerContext;

const WAKER_TOKEN: Token = Token(usize::MAX);
const LISTENER_TOKEN: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) struct AcceptorThread {
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AcceptorThread {
    pub(crate) fn spawn(
        mut listener: TcpListener,
        ctx: Arc<ServerContext>,
        dispatchers: Vec<DispatcherHandle>,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = Builder::new()
            .name("acceptor".to_owned())
            .spawn(move || {
                AcceptorLoop {
                    poll,
                    listener,
                    ctx,
                    dispatchers,
                    next_dispatcher: 0,
                    stop: stop_flag,
                }
                .run()
            })?;

        Ok(Self {
            waker,
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Stops accepting and releases the listening socket.
    pub(crate) fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

struct AcceptorLoop {
    poll: Poll,
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    dispatchers: Vec<DispatcherHandle>,
    next_dispatcher: usize,
    stop: Arc<AtomicBool>,
}

impl AcceptorLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);

        while !self.stop.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("acceptor: poll failed: {e}");
                break;
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN && event.is_readable() {
                    self.accept_pending();
                }
            }
        }

        debug!("acceptor stopped");
    }

    /// Accepts every pending connection (edge-triggered readiness reports
    /// the listener once per burst).
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Some(max) = self.ctx.config().max_connections {
                        if self.ctx.connection_count() >= max {
                            warn!("max connections reached, rejecting {peer}");
                            continue;
                        }
                    }

                    if let Err(e) = stream.set_nodelay(self.ctx.config().no_delay) {
                        debug!("failed to set TCP_NODELAY for {peer}: {e}");
                    }

                    let id = ConnectionId(self.ctx.next_connection_id());
                    let token = Token(id.as_u64() as usize);
                    let seed: u64 = rand::random();

                    let handle = self.dispatchers[self.next_dispatcher].clone();
                    self.next_dispatcher = (self.next_dispatcher + 1) % self.dispatchers.len();

                    let conn = Connection::new(
                        id,
                        token,
                        stream,
                        peer,
                        seed,
                        handle.clone(),
                        Arc::clone(&self.ctx),
                    );

                    self.ctx.register_connection(Arc::clone(&conn));
                    // Register travels the same channel as the EnableWrite
                    // that send_handshake() emits, so ordering holds
                    handle.send(Command::Register(Arc::clone(&conn)));
                    conn.send_handshake();

                    info!(
                        "accepted {peer} as conn {id} on dispatcher-{}",
                        handle.id()
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // transient resource exhaustion must not kill the loop
                    error!("accept error: {e}");
                    break;
                }
            }
        }
    }
}
