//! Server assembly.
//!
//! NetServer wires the pieces together: it binds the listening socket,
//! spawns the selector threads, starts the acceptor and the watchdog, and
//! owns the shutdown sequence. ServerContext is the explicit runtime
//! context threaded through acceptor, dispatchers, and handler execution.
//! There are no global singletons, so tests construct isolated instances
//! freely.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lockfree::map::Map as LockfreeMap;
use log::{info, warn};
use mio::net::TcpListener;

use crate::acceptor::AcceptorThread;
use crate::buffer::BufferPool;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::dispatcher::Dispatcher;
use crate::error::{NetError, Result};
use crate::opcodes::OpcodeTable;
use crate::pools::ThreadPools;
use crate::watchdog::{exit_process_recovery, RecoveryAction, Watchdog};

/// First token handed to a connection. Token 0 belongs to the acceptor's
/// listener and usize::MAX to the wakers.
const FIRST_CONNECTION_ID: u64 = 1;

/// Shared runtime state handed to every component at startup.
pub struct ServerContext {
    config: ServerConfig,
    pools: Arc<ThreadPools>,
    table: Arc<OpcodeTable>,
    connections: LockfreeMap<u64, Arc<Connection>>,
    pub(crate) buffers: BufferPool,
    next_conn_id: AtomicU64,
}

impl ServerContext {
    pub(crate) fn new(config: ServerConfig, table: Arc<OpcodeTable>) -> Arc<Self> {
        let pools = Arc::new(ThreadPools::new(&config));
        let buffers = BufferPool::new(config.buffer_pool_size, config.read_buffer_size);
        Arc::new(Self {
            config,
            pools,
            table,
            connections: LockfreeMap::new(),
            buffers,
            next_conn_id: AtomicU64::new(FIRST_CONNECTION_ID),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pools(&self) -> &Arc<ThreadPools> {
        &self.pools
    }

    pub fn opcode_table(&self) -> &OpcodeTable {
        &self.table
    }

    pub fn connection_count(&self) -> usize {
        self.connections.iter().count()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id.as_u64()).map(|e| Arc::clone(e.val()))
    }

    /// Queues `opcode`/`payload` to every live connection. Encoding happens
    /// per connection on the outbound pool (each has its own cipher state).
    pub fn broadcast(&self, opcode: u16, payload: Vec<u8>) {
        for entry in self.connections.iter() {
            let conn = Arc::clone(entry.val());
            let payload = payload.clone();
            let submit = self.pools.execute_outbound(move || {
                if let Err(e) = conn.send(opcode, &payload) {
                    log::debug!("broadcast skipped conn {}: {e}", conn.id());
                }
            });
            if submit.is_rejected() {
                break;
            }
        }
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_connection(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.id().as_u64(), conn);
    }

    pub(crate) fn unregister_connection(&self, id: ConnectionId) {
        self.connections.remove(&id.as_u64());
    }
}

/// The running server.
pub struct NetServer {
    ctx: Arc<ServerContext>,
    dispatchers: Mutex<Vec<Dispatcher>>,
    acceptor: AcceptorThread,
    watchdog: Mutex<Watchdog>,
    local_addr: SocketAddr,
    shut_down: AtomicBool,
}

impl NetServer {
    /// Binds, spawns selectors, and starts accepting. Bind failure is the
    /// only fatal startup error.
    pub fn start(config: ServerConfig, table: Arc<OpcodeTable>) -> Result<Self> {
        Self::start_with_recovery(config, table, Box::new(exit_process_recovery))
    }

    /// Like start(), with an injected watchdog recovery action (tests
    /// substitute a no-op or an assertion flag).
    pub fn start_with_recovery(
        config: ServerConfig,
        table: Arc<OpcodeTable>,
        recovery: RecoveryAction,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.address).map_err(|e| NetError::Bind {
            addr: config.address,
            source: e,
        })?;
        let local_addr = listener.local_addr()?;

        let ctx = ServerContext::new(config, table);

        let mut dispatchers = Vec::with_capacity(ctx.config().selector_count);
        for id in 0..ctx.config().selector_count {
            dispatchers.push(Dispatcher::spawn(id, Arc::clone(&ctx))?);
        }
        let handles = dispatchers.iter().map(|d| d.handle()).collect();

        let acceptor = AcceptorThread::spawn(listener, Arc::clone(&ctx), handles)?;

        let watchdog = Watchdog::start(
            Arc::clone(ctx.pools()),
            ctx.config().deadlock_sample_interval,
            ctx.config().deadlock_restart_threshold,
            recovery,
        );

        info!(
            "listening on {local_addr} ({} selector(s), {} inbound worker(s), {} registered opcode(s))",
            ctx.config().selector_count,
            ctx.config().inbound_workers,
            ctx.opcode_table().len(),
        );

        Ok(Self {
            ctx,
            dispatchers: Mutex::new(dispatchers),
            acceptor,
            watchdog: Mutex::new(watchdog),
            local_addr,
            shut_down: AtomicBool::new(false),
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn connection_count(&self) -> usize {
        self.ctx.connection_count()
    }

    pub fn broadcast(&self, opcode: u16, payload: Vec<u8>) {
        self.ctx.broadcast(opcode, payload)
    }

    /// Orderly shutdown: stop accepting, close every connection, stop the
    /// selectors, then drain the pools (disconnection pool fully, so every
    /// socket finishes closing before we return). Idempotent; also invoked
    /// from Drop so a process shutdown hook only needs to drop the server.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down");

        self.acceptor.shutdown();

        for entry in self.ctx.connections.iter() {
            entry.val().request_close(true);
        }

        // Close commands precede Shutdown on each dispatcher's channel, so
        // connections are finalized before the selector threads exit
        let dispatchers: Vec<Dispatcher> = self.dispatchers.lock().unwrap().drain(..).collect();
        for dispatcher in dispatchers {
            dispatcher.shutdown();
        }

        self.watchdog.lock().unwrap().stop();
        self.ctx.pools().shutdown();

        let leftover = self.ctx.connection_count();
        if leftover > 0 {
            warn!("{leftover} connection(s) survived shutdown");
        }
    }
}

impl Drop for NetServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
