use std::mem::size_of;

use bytes::{Buf, BufMut};
use tracing::trace;

use crate::codec::{CheckedBuf, DecodeResult};
use crate::error::TransportError;

/// The unit of exchange on a connection: an opaque payload tagged with a correlation id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramedMessage {
    pub id: u64,
    pub payload: Vec<u8>,
}

impl FramedMessage {
    pub fn new(id: u64, payload: Vec<u8>) -> FramedMessage {
        FramedMessage { id, payload }
    }

    /// header and payload, ready to go on the wire
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WireHeader::SERIALIZED_LEN + self.payload.len());
        WireHeader::for_message(self).ser(&mut buf);
        buf.put_slice(&self.payload);
        buf
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireHeader {
    pub id: u64,
    pub payload_len: u64,
}

impl WireHeader {
    pub const SERIALIZED_LEN: usize = 2 * size_of::<u64>();

    pub fn for_message(message: &FramedMessage) -> WireHeader {
        WireHeader {
            id: message.id,
            payload_len: message.payload.len() as u64,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.id);
        buf.put_u64(self.payload_len);
    }

    pub fn deser(buf: &mut impl Buf) -> DecodeResult<Self> {
        let id = buf.checked_get_u64()?;
        let payload_len = buf.checked_get_u64()?;
        Ok(WireHeader {
            id,
            payload_len,
        })
    }
}

enum ReadPhase {
    Header,
    Payload { id: u64 },
}

/// Reassembles frames from a byte stream that may deliver them in arbitrary fragments.
///
/// The assembler alternates between reading a fixed size header and reading the payload length
///  announced by that header. Callers read into [FrameAssembler::unfilled] and then report the
///  number of bytes read via [FrameAssembler::advance].
pub struct FrameAssembler {
    phase: ReadPhase,
    buf: Vec<u8>,
    cursor: usize,
    max_payload_len: u64,
}

impl FrameAssembler {
    pub fn new(max_payload_len: u64) -> FrameAssembler {
        FrameAssembler {
            phase: ReadPhase::Header,
            buf: vec![0; WireHeader::SERIALIZED_LEN],
            cursor: 0,
            max_payload_len,
        }
    }

    /// The part of the current phase's buffer that is still waiting for data. This is never
    ///  empty, so a read into it returning zero bytes means end of stream.
    pub fn unfilled(&mut self) -> &mut [u8] {
        &mut self.buf[self.cursor..]
    }

    /// Registers `n` bytes that were just read into [FrameAssembler::unfilled], returning the
    ///  message if that completed one.
    pub fn advance(&mut self, n: usize) -> Result<Option<FramedMessage>, TransportError> {
        self.cursor += n;
        if self.cursor < self.buf.len() {
            return Ok(None);
        }

        match self.phase {
            ReadPhase::Header => {
                let header = WireHeader::deser(&mut self.buf.as_slice())
                    .map_err(|e| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
                trace!("received header for message #{} with {} bytes", header.id, header.payload_len);

                if header.payload_len > self.max_payload_len {
                    return Err(TransportError::FrameTooLarge { len: header.payload_len, max: self.max_payload_len });
                }

                if header.payload_len == 0 {
                    self.start_header();
                    return Ok(Some(FramedMessage::new(header.id, Vec::new())));
                }

                self.phase = ReadPhase::Payload { id: header.id };
                self.buf = vec![0; header.payload_len as usize];
                self.cursor = 0;
                Ok(None)
            }
            ReadPhase::Payload { id } => {
                let payload = std::mem::replace(&mut self.buf, vec![0; WireHeader::SERIALIZED_LEN]);
                self.start_header();
                Ok(Some(FramedMessage::new(id, payload)))
            }
        }
    }

    fn start_header(&mut self) {
        self.phase = ReadPhase::Header;
        self.buf.resize(WireHeader::SERIALIZED_LEN, 0);
        self.cursor = 0;
    }
}
