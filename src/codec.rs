//! Wire framing and payload codec.
//!
//! Every packet travels as `[length: u16 LE][opcode: u16 LE][payload]`,
//! where `length` counts the opcode field plus the payload (not itself).
//! Header fields are always in the clear so framing never depends on cipher
//! state; payload bytes are transformed by the connection's negotiated
//! ChannelCipher once it is engaged.
//!
//! Decoding is idempotent until a full packet is buffered: try_decode_one
//! consumes input (and advances the cipher) only when the complete declared
//! length is present, so partial reads can be retried without data loss or
//! reprocessing.

use crate::error::CodecError;

/// Bytes occupied by the `length` and `opcode` fields.
pub const HEADER_LEN: usize = 4;
/// Bytes of the header counted by the `length` field (the opcode).
pub const OPCODE_LEN: usize = 2;

/// Per-connection symmetric payload cipher.
///
/// An xorshift64 keystream seeded from the handshake; one keystream byte is
/// consumed per payload byte, so state advances identically on both sides.
/// The algorithm is a stand-in for whatever cipher the session negotiates;
/// the runtime only relies on it being symmetric and strictly sequential.
#[derive(Debug, Clone)]
pub struct ChannelCipher {
    state: u64,
}

impl ChannelCipher {
    pub fn new(seed: u64) -> Self {
        // xorshift has a fixed point at zero
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    fn next_byte(&mut self) -> u8 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x & 0xFF) as u8
    }

    /// Applies the keystream in place. Encode and decode are the same
    /// operation.
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte ^= self.next_byte();
        }
    }
}

/// Outcome of a single framing attempt.
#[derive(Debug)]
pub enum Decode {
    /// A complete packet was extracted and consumed from the buffer.
    Packet { opcode: u16, payload: Vec<u8> },
    /// Not enough bytes buffered yet; nothing was consumed.
    Incomplete,
    /// The header violates the protocol; the connection must close.
    Malformed(CodecError),
}

/// Attempts to frame exactly one packet from the front of `inbound`.
///
/// Consumes buffered bytes only when the full declared length is present.
/// `cipher` is advanced over the payload exactly once per extracted packet;
/// pass `None` while the handshake has not engaged the cipher yet.
pub fn try_decode_one(
    inbound: &mut Vec<u8>,
    cipher: &mut Option<ChannelCipher>,
    max_packet_size: usize,
) -> Decode {
    if inbound.len() < HEADER_LEN {
        return Decode::Incomplete;
    }

    let declared = u16::from_le_bytes([inbound[0], inbound[1]]) as usize;
    if declared < OPCODE_LEN {
        return Decode::Malformed(CodecError::UndersizedPacket { declared });
    }
    if declared > max_packet_size {
        return Decode::Malformed(CodecError::OversizedPacket {
            declared,
            max: max_packet_size,
        });
    }

    let frame_len = 2 + declared;
    if inbound.len() < frame_len {
        return Decode::Incomplete;
    }

    let opcode = u16::from_le_bytes([inbound[2], inbound[3]]);
    let mut payload: Vec<u8> = inbound[HEADER_LEN..frame_len].to_vec();
    inbound.drain(..frame_len);

    if let Some(cipher) = cipher {
        cipher.apply(&mut payload);
    }

    Decode::Packet { opcode, payload }
}

/// Encodes one packet into a ready-to-write frame, advancing `cipher` over
/// the payload when engaged.
pub fn encode(
    opcode: u16,
    payload: &[u8],
    cipher: &mut Option<ChannelCipher>,
) -> Result<Vec<u8>, CodecError> {
    let declared = OPCODE_LEN + payload.len();
    if declared > u16::MAX as usize {
        return Err(CodecError::PayloadTooLarge { len: payload.len() });
    }

    let mut frame = Vec::with_capacity(2 + declared);
    frame.extend_from_slice(&(declared as u16).to_le_bytes());
    frame.extend_from_slice(&opcode.to_le_bytes());
    frame.extend_from_slice(payload);

    if let Some(cipher) = cipher {
        cipher.apply(&mut frame[HEADER_LEN..]);
    }

    Ok(frame)
}

/// Sequential reader over a decoded payload.
///
/// All integers are fixed-width little-endian; strings are null-terminated
/// UTF-8. Reads past the end return CodecError::Truncated rather than
/// panicking; malformed fields are a protocol violation, not a crash.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                offset: self.pos,
                needed: n - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    /// Reads a null-terminated UTF-8 string, consuming the terminator.
    pub fn read_cstring(&mut self) -> Result<String, CodecError> {
        let start = self.pos;
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(CodecError::UnterminatedString { offset: start })?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| CodecError::InvalidString { offset: start })?
            .to_owned();
        self.pos += nul + 1;
        Ok(s)
    }
}

/// Sequential writer building a payload for encode().
#[derive(Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.write_u32(v as u32)
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Writes a UTF-8 string followed by a null terminator.
    pub fn write_cstring(&mut self, s: &str) -> &mut Self {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 4096;

    #[test]
    fn test_roundtrip_plain() {
        let payloads: [&[u8]; 4] = [b"", b"a", b"hello world", &[0u8; 1000]];
        for (i, payload) in payloads.iter().enumerate() {
            let opcode = 0x10 + i as u16;
            let frame = encode(opcode, payload, &mut None).unwrap();
            let mut inbound = frame;
            match try_decode_one(&mut inbound, &mut None, MAX) {
                Decode::Packet { opcode: op, payload: p } => {
                    assert_eq!(op, opcode);
                    assert_eq!(&p[..], *payload);
                }
                other => panic!("expected packet, got {:?}", other),
            }
            assert!(inbound.is_empty());
        }
    }

    #[test]
    fn test_roundtrip_ciphered() {
        let mut tx = Some(ChannelCipher::new(42));
        let mut rx = Some(ChannelCipher::new(42));

        for round in 0..5u16 {
            let payload = format!("packet number {round}");
            let frame = encode(0x0200 + round, payload.as_bytes(), &mut tx).unwrap();
            // header stays in the clear
            assert_eq!(
                u16::from_le_bytes([frame[0], frame[1]]) as usize,
                OPCODE_LEN + payload.len()
            );

            let mut inbound = frame;
            match try_decode_one(&mut inbound, &mut rx, MAX) {
                Decode::Packet { opcode, payload: p } => {
                    assert_eq!(opcode, 0x0200 + round);
                    assert_eq!(p, payload.as_bytes());
                }
                other => panic!("expected packet, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_partial_reassembly_one_byte_at_a_time() {
        let mut tx = Some(ChannelCipher::new(7));
        let mut rx = Some(ChannelCipher::new(7));
        let frame = encode(0x0042, b"split me into pieces", &mut tx).unwrap();

        let mut inbound = Vec::new();
        let mut decoded = Vec::new();
        for &byte in &frame {
            inbound.push(byte);
            loop {
                match try_decode_one(&mut inbound, &mut rx, MAX) {
                    Decode::Packet { opcode, payload } => decoded.push((opcode, payload)),
                    Decode::Incomplete => break,
                    Decode::Malformed(e) => panic!("unexpected malformed: {e}"),
                }
            }
        }

        assert_eq!(decoded.len(), 1, "exactly one packet must come out");
        assert_eq!(decoded[0].0, 0x0042);
        assert_eq!(decoded[0].1, b"split me into pieces");
        assert!(inbound.is_empty());
    }

    #[test]
    fn test_decode_is_idempotent_on_incomplete() {
        let frame = encode(0x0001, b"abcdef", &mut None).unwrap();
        let mut inbound = frame[..frame.len() - 1].to_vec();
        let mut cipher = Some(ChannelCipher::new(99));
        let state_before = cipher.as_ref().unwrap().state;

        for _ in 0..3 {
            assert!(matches!(
                try_decode_one(&mut inbound, &mut cipher, MAX),
                Decode::Incomplete
            ));
        }
        assert_eq!(inbound.len(), frame.len() - 1, "nothing consumed");
        assert_eq!(
            cipher.as_ref().unwrap().state,
            state_before,
            "cipher must not advance until a packet is complete"
        );
    }

    #[test]
    fn test_oversized_declared_length_is_malformed() {
        let mut inbound = ((MAX + 1) as u16).to_le_bytes().to_vec();
        inbound.extend_from_slice(&[0x01, 0x00]);
        match try_decode_one(&mut inbound, &mut None, MAX) {
            Decode::Malformed(CodecError::OversizedPacket { declared, max }) => {
                assert_eq!(declared, MAX + 1);
                assert_eq!(max, MAX);
            }
            other => panic!("expected oversized error, got {:?}", other),
        }
    }

    #[test]
    fn test_undersized_declared_length_is_malformed() {
        let mut inbound = vec![0x01, 0x00, 0x01, 0x00];
        assert!(matches!(
            try_decode_one(&mut inbound, &mut None, MAX),
            Decode::Malformed(CodecError::UndersizedPacket { declared: 1 })
        ));
    }

    #[test]
    fn test_two_packets_in_one_buffer() {
        let mut inbound = encode(0x01, b"first", &mut None).unwrap();
        inbound.extend(encode(0x02, b"second", &mut None).unwrap());

        let Decode::Packet { opcode: a, .. } = try_decode_one(&mut inbound, &mut None, MAX) else {
            panic!("first packet missing");
        };
        let Decode::Packet { opcode: b, .. } = try_decode_one(&mut inbound, &mut None, MAX) else {
            panic!("second packet missing");
        };
        assert_eq!((a, b), (0x01, 0x02));
        assert!(matches!(
            try_decode_one(&mut inbound, &mut None, MAX),
            Decode::Incomplete
        ));
    }

    #[test]
    fn test_reader_fields_and_truncation() {
        let mut w = PayloadWriter::new();
        w.write_u8(7)
            .write_u16(0xBEEF)
            .write_u32(123_456)
            .write_u64(u64::MAX)
            .write_cstring("hero");
        let payload = w.into_payload();

        let mut r = PayloadReader::new(&payload);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u16().unwrap(), 0xBEEF);
        assert_eq!(r.read_u32().unwrap(), 123_456);
        assert_eq!(r.read_u64().unwrap(), u64::MAX);
        assert_eq!(r.read_cstring().unwrap(), "hero");
        assert_eq!(r.remaining(), 0);
        assert!(matches!(r.read_u8(), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_reader_unterminated_string() {
        let mut r = PayloadReader::new(b"no terminator");
        assert!(matches!(
            r.read_cstring(),
            Err(CodecError::UnterminatedString { offset: 0 })
        ));
    }

    #[test]
    fn test_cipher_is_symmetric_and_stateful() {
        let mut a = ChannelCipher::new(1234);
        let mut b = ChannelCipher::new(1234);

        let mut first = *b"some payload bytes";
        let plain = first;
        a.apply(&mut first);
        assert_ne!(first, plain);
        b.apply(&mut first);
        assert_eq!(first, plain);

        // the keystream advanced: a second identical block enciphers differently
        let mut second = plain;
        a.apply(&mut second);
        let mut again = plain;
        let mut fresh = ChannelCipher::new(1234);
        fresh.apply(&mut again);
        assert_ne!(second, again);
    }
}
