use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::PayloadReader;
use crate::connection::Connection;
use crate::error::CodecError;

/// Opcode of the handshake packets exchanged before the cipher engages.
/// The server's initial packet and the client's completion reply both use it.
pub const HANDSHAKE_OPCODE: u16 = 0x0000;

/// A decoded inbound packet's behavior.
///
/// Implementations carry their own fields: decode() populates them from the
/// payload on the selector thread (cheap, bounded work), and execute() runs
/// later on an inbound worker with the owning connection available for
/// responses. The payload view passed to decode() is not retained; copy
/// what you need into the handler's fields.
pub trait PacketHandler: Send {
    /// Populates the handler from the wire payload. A decode error is a
    /// protocol violation for that connection only.
    fn decode(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), CodecError>;

    /// Runs the packet's effects. Invoked on an inbound worker thread, and
    /// for a given connection strictly after the previous handler returned.
    fn execute(&mut self, conn: &Arc<Connection>);
}

/// Constructs a fresh handler instance per received packet.
pub type HandlerFactory = Box<dyn Fn() -> Box<dyn PacketHandler> + Send + Sync>;

/// Immutable opcode → handler-factory table.
///
/// Built once at startup and frozen behind an Arc, so selector threads
/// resolve opcodes without any locking. An unknown opcode is a protocol
/// error for the connection that sent it, never a global fault.
pub struct OpcodeTable {
    handlers: HashMap<u16, HandlerFactory>,
}

impl OpcodeTable {
    pub fn builder() -> OpcodeTableBuilder {
        OpcodeTableBuilder {
            handlers: HashMap::new(),
        }
    }

    pub fn resolve(&self, opcode: u16) -> Option<&HandlerFactory> {
        self.handlers.get(&opcode)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub struct OpcodeTableBuilder {
    handlers: HashMap<u16, HandlerFactory>,
}

impl OpcodeTableBuilder {
    /// Registers a handler factory for `opcode`. Re-registering an opcode
    /// replaces the previous factory; the handshake opcode is reserved for
    /// the runtime itself.
    pub fn register<F, H>(mut self, opcode: u16, factory: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: PacketHandler + 'static,
    {
        debug_assert_ne!(opcode, HANDSHAKE_OPCODE, "handshake opcode is reserved");
        self.handlers
            .insert(opcode, Box::new(move || Box::new(factory())));
        self
    }

    pub fn build(self) -> Arc<OpcodeTable> {
        Arc::new(OpcodeTable {
            handlers: self.handlers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl PacketHandler for Noop {
        fn decode(&mut self, _reader: &mut PayloadReader<'_>) -> Result<(), CodecError> {
            Ok(())
        }

        fn execute(&mut self, _conn: &Arc<Connection>) {}
    }

    #[test]
    fn test_register_and_resolve() {
        let table = OpcodeTable::builder()
            .register(0x0001, || Noop)
            .register(0x0002, || Noop)
            .build();

        assert_eq!(table.len(), 2);
        assert!(table.resolve(0x0001).is_some());
        assert!(table.resolve(0x0002).is_some());
        assert!(table.resolve(0x00FF).is_none());
    }

    struct Counted {
        value: u32,
    }

    impl PacketHandler for Counted {
        fn decode(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), CodecError> {
            self.value = reader.read_u32()?;
            Ok(())
        }

        fn execute(&mut self, _conn: &Arc<Connection>) {}
    }

    #[test]
    fn test_factory_builds_fresh_handlers() {
        let table = OpcodeTable::builder()
            .register(0x0003, || Counted { value: 0 })
            .build();
        let factory = table.resolve(0x0003).unwrap();

        let mut a = factory();
        a.decode(&mut PayloadReader::new(&7u32.to_le_bytes())).unwrap();
        let b = factory();
        // b is a fresh instance, untouched by a's decode
        drop(b);
        drop(a);
    }

    #[test]
    fn test_reregistering_replaces() {
        let table = OpcodeTable::builder()
            .register(0x0005, || Noop)
            .register(0x0005, || Counted { value: 1 })
            .build();
        assert_eq!(table.len(), 1);
    }
}
