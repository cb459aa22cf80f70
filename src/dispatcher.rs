//! Selector threads.
//!
//! Each Dispatcher owns one mio::Poll and a thread running a readiness loop
//! over the connections assigned to it. All mutations of the poll registry
//! happen on that thread: other threads (acceptor, workers calling send())
//! talk to a dispatcher through its command channel and wake it via the mio
//! Waker. This keeps a connection's buffers owned by exactly one thread per
//! interest, with no locking around the registry itself.
//!
//! The selector thread blocks only inside poll(). Decoding runs here
//! (bounded, allocation-light work); handler execution is always handed off
//! to the inbound pool so application logic can never stall the loop.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{mpsc, Arc};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::connection::{ConnState, Connection, ReadSignal, WriteSignal};
use crate::error::Result;
use crate::server::ServerContext;

const EVENTS_CAPACITY: usize = 1024;
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
/// Reserved for the Waker; connection tokens count up from zero and can
/// never collide with it.
const WAKER_TOKEN: Token = Token(usize::MAX);

pub(crate) enum Command {
    Register(Arc<Connection>),
    EnableWrite(Token),
    Close { token: Token, force: bool },
    Shutdown,
}

/// Cheap handle for submitting commands to a dispatcher from any thread.
#[derive(Clone)]
pub(crate) struct DispatcherHandle {
    id: usize,
    tx: Sender<Command>,
    waker: Arc<Waker>,
}

impl DispatcherHandle {
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn send(&self, command: Command) {
        // a send failure means the dispatcher already exited; the command
        // would only have asked it to do less work
        if self.tx.send(command).is_ok() {
            let _ = self.waker.wake();
        }
    }
}

pub(crate) struct Dispatcher {
    handle: DispatcherHandle,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub(crate) fn spawn(id: usize, ctx: Arc<ServerContext>) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, rx) = mpsc::channel();
        let handle = DispatcherHandle { id, tx, waker };

        let thread = Builder::new()
            .name(format!("dispatcher-{id}"))
            .spawn(move || {
                DispatcherLoop {
                    id,
                    poll,
                    rx,
                    ctx,
                    connections: HashMap::new(),
                    running: true,
                }
                .run()
            })?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub(crate) fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Asks the selector thread to exit and joins it. Remaining connections
    /// are finalized by the thread on its way out.
    pub(crate) fn shutdown(mut self) {
        self.handle.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct RegisteredConn {
    conn: Arc<Connection>,
    interest: Interest,
}

struct DispatcherLoop {
    id: usize,
    poll: Poll,
    rx: Receiver<Command>,
    ctx: Arc<ServerContext>,
    connections: HashMap<Token, RegisteredConn>,
    running: bool,
}

impl DispatcherLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while self.running {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!("dispatcher-{}: poll failed: {e}", self.id);
                break;
            }

            self.drain_commands();

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                if event.is_readable() {
                    self.handle_readable(token);
                }
                if event.is_writable() {
                    self.flush(token);
                }
            }
        }

        // orderly exit: every remaining connection is finalized so its
        // disconnection task still runs before the pools drain
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.finalize(token);
        }
        debug!("dispatcher-{} stopped", self.id);
    }

    fn drain_commands(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(Command::Register(conn)) => self.register(conn),
                Ok(Command::EnableWrite(token)) => self.flush(token),
                Ok(Command::Close { token, force }) => self.close(token, force),
                Ok(Command::Shutdown) => self.running = false,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.running = false;
                    break;
                }
            }
        }
    }

    fn register(&mut self, conn: Arc<Connection>) {
        let token = conn.token();
        let registered = {
            let mut stream = conn.stream();
            self.poll
                .registry()
                .register(&mut *stream, token, Interest::READABLE)
        };

        match registered {
            Ok(()) => {
                debug!(
                    "dispatcher-{}: registered conn {} ({})",
                    self.id,
                    conn.id(),
                    conn.peer_addr()
                );
                self.connections.insert(
                    token,
                    RegisteredConn {
                        conn,
                        interest: Interest::READABLE,
                    },
                );
            }
            Err(e) => {
                warn!(
                    "dispatcher-{}: failed to register conn {}: {e}",
                    self.id,
                    conn.id()
                );
                conn.finalize();
            }
        }
    }

    fn lookup(&self, token: Token) -> Option<Arc<Connection>> {
        self.connections.get(&token).map(|r| Arc::clone(&r.conn))
    }

    fn handle_readable(&mut self, token: Token) {
        let Some(conn) = self.lookup(token) else {
            return;
        };
        match conn.on_readable() {
            ReadSignal::Continue => {}
            ReadSignal::CloseNow => self.close(token, false),
        }
    }

    /// Attempts a write pass immediately; registers write interest only
    /// while the queue has a remainder (edge-triggered polls only report
    /// writability after a short write).
    fn flush(&mut self, token: Token) {
        let Some(conn) = self.lookup(token) else {
            return;
        };
        match conn.on_writable() {
            WriteSignal::Drained => {
                if conn.state() == ConnState::Closing {
                    self.finalize(token);
                } else {
                    self.set_interest(token, Interest::READABLE);
                }
            }
            WriteSignal::Partial => {
                self.set_interest(token, Interest::READABLE | Interest::WRITABLE);
            }
            WriteSignal::CloseNow => self.finalize(token),
        }
    }

    fn close(&mut self, token: Token, force: bool) {
        let Some(conn) = self.lookup(token) else {
            return;
        };
        if conn.ready_to_finalize(force) {
            self.finalize(token);
        } else {
            // keep flushing until drained or the grace deadline fires
            conn.arm_close_deadline();
            self.flush(token);
        }
    }

    fn finalize(&mut self, token: Token) {
        if let Some(registered) = self.connections.remove(&token) {
            {
                let mut stream = registered.conn.stream();
                let _ = self.poll.registry().deregister(&mut *stream);
            }
            registered.conn.finalize();
        }
    }

    fn set_interest(&mut self, token: Token, interest: Interest) {
        let result = {
            let Some(registered) = self.connections.get_mut(&token) else {
                return;
            };
            if registered.interest == interest {
                return;
            }
            let result = {
                let mut stream = registered.conn.stream();
                self.poll.registry().reregister(&mut *stream, token, interest)
            };
            if result.is_ok() {
                registered.interest = interest;
            }
            result
        };

        if let Err(e) = result {
            warn!(
                "dispatcher-{}: reregister failed for token {}: {e}",
                self.id, token.0
            );
            self.finalize(token);
        }
    }
}
