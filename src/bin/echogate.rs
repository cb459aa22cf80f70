//! Minimal echo server built on the runtime. Registers two opcodes and
//! echoes whatever payload a client sends; useful for smoke-testing the
//! protocol with a handful of telnet-grade clients.

use std::io::BufRead;
use std::sync::Arc;

use clap::Parser;
use log::info;

use netgate::{
    CodecError, Connection, NetServer, OpcodeTable, PacketHandler, PayloadReader, ServerConfig,
};

const OP_ECHO_REQUEST: u16 = 0x0001;
const OP_ECHO_REPLY: u16 = 0x0002;

#[derive(Parser)]
#[command(name = "echogate", about = "Echo server demo for the netgate runtime")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:7777")]
    bind: std::net::SocketAddr,

    /// Selector threads.
    #[arg(long, default_value_t = 2)]
    selectors: usize,

    /// Inbound handler workers.
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

struct Echo {
    payload: Vec<u8>,
}

impl PacketHandler for Echo {
    fn decode(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), CodecError> {
        self.payload = reader.read_bytes(reader.remaining())?.to_vec();
        Ok(())
    }

    fn execute(&mut self, conn: &Arc<Connection>) {
        if let Err(e) = conn.send(OP_ECHO_REPLY, &self.payload) {
            log::debug!("echo reply dropped for conn {}: {e}", conn.id());
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let table = OpcodeTable::builder()
        .register(OP_ECHO_REQUEST, || Echo {
            payload: Vec::new(),
        })
        .build();

    let config = ServerConfig::builder()
        .address(args.bind)
        .selector_count(args.selectors)
        .inbound_workers(args.workers)
        .build();

    let server = NetServer::start(config, table)?;
    info!("echogate ready on {} (press Enter to stop)", server.local_addr());

    // block until the operator hits Enter or stdin closes
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);

    server.shutdown();
    Ok(())
}
