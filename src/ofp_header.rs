use std::convert::TryFrom;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;

use crate::ofp_message::OfpSerializationError;
use crate::openflow::MsgCode;

pub const OFP_HEADER_LENGTH: usize = 8;

pub type Xid = u32;

pub const OPENFLOW_0_01_VERSION: u8 = 1; // 1.0

/// OpenFlow Header
///
/// The first fields of every OpenFlow message, no matter the protocol version.
/// This is parsed to determine version and length of the remaining message, so that
/// it can be properly handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OfpHeader {
    version: u8,
    typ: u8,
    length: u16,
    xid: Xid,
}

impl OfpHeader {
    /// Create an `OfpHeader` out of the arguments.
    pub fn new(version: u8, typ: u8, length: u16, xid: Xid) -> OfpHeader {
        OfpHeader {
            version,
            typ,
            length,
            xid,
        }
    }

    /// Return the byte-size of an `OfpHeader`.
    pub fn size() -> usize {
        OFP_HEADER_LENGTH
    }

    /// Fills a message buffer with the header fields of an `OfpHeader`.
    pub fn marshal(bytes: &mut Vec<u8>, header: OfpHeader) {
        bytes.put_u8(header.version);
        bytes.put_u8(header.typ);
        bytes.put_u16(header.length);
        bytes.put_u32(header.xid);
    }

    /// Takes a message buffer (at least `OFP_HEADER_LENGTH` long) and returns an `OfpHeader`.
    pub fn parse(buf: &[u8]) -> Result<OfpHeader, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        OfpHeader::parse_from_cursor(&mut bytes)
    }

    pub fn parse_from_cursor(
        bytes: &mut Cursor<&[u8]>,
    ) -> Result<OfpHeader, OfpSerializationError> {
        Ok(OfpHeader {
            version: bytes.read_u8()?,
            typ: bytes.read_u8()?,
            length: bytes.read_u16::<BigEndian>()?,
            xid: bytes.read_u32::<BigEndian>()?,
        })
    }

    /// Return the `version` field of a header.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Return the raw message type byte.
    pub fn typ(&self) -> u8 {
        self.typ
    }

    /// Return the OpenFlow message type code of a header.
    pub fn type_code(&self) -> Result<MsgCode, OfpSerializationError> {
        MsgCode::try_from(self.typ).map_err(|code| OfpSerializationError::UnexpectedValueError {
            value: format!("0x{:x}", code),
            field: "type".to_string(),
            message: "header".to_string(),
        })
    }

    /// Return the `length` field of a header. Includes the length of the header itself.
    pub fn length(&self) -> usize {
        self.length as usize
    }

    /// Return the `xid` field of a header, the transaction id associated with this packet.
    ///  Replies use the same id to facilitate pairing.
    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn is_hello(&self) -> bool {
        self.typ == MsgCode::Hello as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_wire_layout() {
        let mut bytes = vec![];
        OfpHeader::marshal(&mut bytes, OfpHeader::new(1, 14, 0x50, 0x12345678));
        assert_eq!(bytes, vec![1, 14, 0, 0x50, 0x12, 0x34, 0x56, 0x78]);

        let header = OfpHeader::parse(&bytes).unwrap();
        assert_eq!(header.version(), OPENFLOW_0_01_VERSION);
        assert_eq!(header.type_code().unwrap(), MsgCode::FlowMod);
        assert_eq!(header.length(), 0x50);
        assert_eq!(header.xid(), 0x12345678);
    }

    #[test]
    fn test_short_header() {
        assert!(OfpHeader::parse(&[1, 0, 0]).is_err());
    }

    #[test]
    fn test_unknown_type() {
        let header = OfpHeader::parse(&[1, 0x7f, 0, 8, 0, 0, 0, 1]).unwrap();
        assert!(header.type_code().is_err());
        assert!(!header.is_hello());
    }
}
