//! Transfer header framing.
//!
//! Every payload on a portal stream is announced by a fixed 24-byte header in network byte order:
//!
//! ```text
//! +-----------+-----------+-------------------+-------------------+
//! | opcode i32| flags i32 |     offset i64    |     length i64    |
//! +-----------+-----------+-------------------+-------------------+
//! ```
//!
//! A `DATA` header is followed by `length` payload bytes. In plaintext mode those bytes follow
//! directly; with encryption the payload is a sequence of sealed chunks, each prefixed by its
//! little-endian `u32` wire length (see [`crate::crypt`]). A `DONE` header ends the stream's
//! sub-transfer and carries no payload.

use bytes::{Buf, BufMut};

use crate::error::TransferError;

/// Encoded size of a [`TransferHeader`].
pub const HEADER_LEN: usize = 24;

pub const DATA_OPR: i32 = 1;
pub const DONE_OPR: i32 = 9999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Opcode {
    Data,
    Done,
}

impl Opcode {
    pub fn code(self) -> i32 {
        match self {
            Opcode::Data => DATA_OPR,
            Opcode::Done => DONE_OPR,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            DATA_OPR => Some(Opcode::Data),
            DONE_OPR => Some(Opcode::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    pub opcode: Opcode,
    pub flags: i32,
    pub offset: i64,
    pub length: i64,
}

impl TransferHeader {
    pub fn data(offset: u64, length: u64) -> Result<Self, TransferError> {
        let to_wire = |value: u64, what: &str| {
            i64::try_from(value).map_err(|_| {
                TransferError::FramingError(format!("{what} {value} does not fit the header"))
            })
        };
        Ok(Self {
            opcode: Opcode::Data,
            flags: 0,
            offset: to_wire(offset, "offset")?,
            length: to_wire(length, "length")?,
        })
    }

    pub fn done() -> Self {
        Self {
            opcode: Opcode::Done,
            flags: 0,
            offset: 0,
            length: 0,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(self.opcode.code());
        buf.put_i32(self.flags);
        buf.put_i64(self.offset);
        buf.put_i64(self.length);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        self.encode(&mut &mut bytes[..]);
        bytes
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, TransferError> {
        if buf.remaining() < HEADER_LEN {
            return Err(TransferError::FramingError(format!(
                "header needs {HEADER_LEN} bytes, got {}",
                buf.remaining()
            )));
        }
        let code = buf.get_i32();
        let opcode = Opcode::from_code(code)
            .ok_or_else(|| TransferError::FramingError(format!("unknown opcode {code}")))?;
        Ok(Self {
            opcode,
            flags: buf.get_i32(),
            offset: buf.get_i64(),
            length: buf.get_i64(),
        })
    }

    /// Check a DATA header against the object it belongs to.
    ///
    /// `already_received` is what this stream has moved so far; a header that would take it, or the
    /// declared range, past `object_size` is rejected. Returns the range as unsigned values.
    pub fn validate(
        &self,
        object_size: u64,
        already_received: u64,
    ) -> Result<(u64, u64), TransferError> {
        let (Ok(offset), Ok(length)) = (u64::try_from(self.offset), u64::try_from(self.length))
        else {
            return Err(TransferError::FramingError(format!(
                "negative offset {} or length {}",
                self.offset, self.length
            )));
        };
        let in_bounds = offset
            .checked_add(length)
            .is_some_and(|end| end <= object_size);
        if !in_bounds {
            return Err(TransferError::FramingError(format!(
                "range {offset}+{length} exceeds object size {object_size}"
            )));
        }
        if already_received.saturating_add(length) > object_size {
            return Err(TransferError::FramingError(format!(
                "{length} more bytes after {already_received} exceeds object size {object_size}"
            )));
        }
        Ok((offset, length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_big_endian_on_the_wire() {
        let header = TransferHeader::data(0x0102_0304_0506, 7).unwrap();
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..16], &[0, 0, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(&bytes[16..24], &[0, 0, 0, 0, 0, 0, 0, 7]);
        let decoded = TransferHeader::decode(&mut &bytes[..]).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn done_header_decodes() {
        let bytes = TransferHeader::done().to_bytes();
        assert_eq!(&bytes[0..4], &9999i32.to_be_bytes());
        let decoded = TransferHeader::decode(&mut &bytes[..]).unwrap();
        assert_eq!(decoded.opcode, Opcode::Done);
    }

    #[test]
    fn rejects_unknown_opcode_and_short_input() {
        let mut bytes = TransferHeader::done().to_bytes();
        bytes[3] = 42;
        bytes[2] = 0;
        assert!(matches!(
            TransferHeader::decode(&mut &bytes[..]),
            Err(TransferError::FramingError(_))
        ));
        assert!(TransferHeader::decode(&mut &bytes[..10]).is_err());
    }

    #[test]
    fn validate_enforces_object_bounds() {
        let header = TransferHeader::data(90, 10).unwrap();
        assert_eq!(header.validate(100, 0).unwrap(), (90, 10));
        assert!(header.validate(99, 0).is_err());
        // cumulative bytes on the stream must stay within the object too
        assert!(header.validate(100, 95).is_err());
        let negative = TransferHeader {
            opcode: Opcode::Data,
            flags: 0,
            offset: -1,
            length: 10,
        };
        assert!(negative.validate(100, 0).is_err());
        assert!(TransferHeader::data(u64::MAX, 1).is_err());
    }
}
