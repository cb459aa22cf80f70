//! # netgate
//!
//! A selector-based network runtime for multiplayer servers. netgate
//! accepts TCP connections, multiplexes their I/O over a small set of
//! selector threads built on [`mio`], reassembles a length-prefixed binary
//! packet protocol from the byte stream, and dispatches decoded packets to
//! application handlers on bounded worker pools, with in-order,
//! serialized-per-connection delivery and clean teardown under load.
//!
//! There is no async runtime: the design is a classic reactor, chosen for
//! predictable latency and direct control over threading.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐ accept ┌────────────────┐ readable ┌──────────────────┐
//! │ Acceptor │───────▶│ Dispatcher(s)  │─────────▶│ Connection       │
//! │ (listen  │ round- │ mio::Poll loop │          │ framing + cipher │
//! │  poll)   │ robin  └────────────────┘          └────────┬─────────┘
//! └──────────┘                ▲                            │ decoded
//!                    EnableWrite / Close                   ▼ packet
//!                             │                   ┌──────────────────┐
//!                    ┌────────┴───────┐  execute  │ OpcodeTable      │
//!                    │ ThreadPools    │◀──────────│ handler factory  │
//!                    │ inbound/outbnd │           └──────────────────┘
//!                    │ sched/disconn  │
//!                    └────────────────┘◀─── Watchdog samples progress
//! ```
//!
//! Selector threads block only inside the OS readiness wait. Decoding runs
//! on the selector thread (cheap, bounded); handler execution always hops
//! to the inbound pool, so application logic can never stall I/O. Handlers
//! for one connection run strictly one after another; concurrency comes
//! from overlapping different connections, not reordering one connection's
//! packets.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use netgate::{
//!     CodecError, Connection, NetServer, OpcodeTable, PacketHandler,
//!     PayloadReader, PayloadWriter, ServerConfig,
//! };
//!
//! struct Ping {
//!     nonce: u32,
//! }
//!
//! impl PacketHandler for Ping {
//!     fn decode(&mut self, r: &mut PayloadReader<'_>) -> Result<(), CodecError> {
//!         self.nonce = r.read_u32()?;
//!         Ok(())
//!     }
//!
//!     fn execute(&mut self, conn: &Arc<Connection>) {
//!         let mut w = PayloadWriter::new();
//!         w.write_u32(self.nonce);
//!         let _ = conn.send(0x0002, &w.into_payload());
//!     }
//! }
//!
//! fn main() -> netgate::Result<()> {
//!     let table = OpcodeTable::builder()
//!         .register(0x0001, || Ping { nonce: 0 })
//!         .build();
//!     let config = ServerConfig::builder()
//!         .address("0.0.0.0:7777".parse().unwrap())
//!         .selector_count(2)
//!         .build();
//!     let server = NetServer::start(config, table)?;
//!     // ... run until your shutdown signal, then:
//!     server.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Wire format
//!
//! `[length: u16 LE][opcode: u16 LE][payload]`, where `length` counts the
//! opcode plus payload. Headers travel in the clear; payload bytes pass
//! through the per-connection keystream cipher negotiated by the handshake
//! (the server sends its seed in an opcode-0 packet immediately on accept).

mod acceptor;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod connection;
mod dispatcher;
pub mod error;
pub mod opcodes;
pub mod pools;
pub mod server;
pub mod watchdog;

pub use buffer::{BufferPool, PooledBuffer};
pub use codec::{encode, try_decode_one, ChannelCipher, Decode, PayloadReader, PayloadWriter};
pub use config::{ServerConfig, ServerConfigBuilder};
pub use connection::{ConnState, Connection, ConnectionId};
pub use error::{CodecError, NetError, Result};
pub use opcodes::{OpcodeTable, OpcodeTableBuilder, PacketHandler, HANDSHAKE_OPCODE};
pub use pools::{PoolProgress, Submit, TaskHandle, ThreadPools};
pub use server::{NetServer, ServerContext};
pub use watchdog::{RecoveryAction, Watchdog};
