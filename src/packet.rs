//!
//! ## Wire packet anatomy
//!
//! | bytes    | type     | description                                            |
//! | -------- | -------- | ------------------------------------------------------ |
//! | 1        | `u8`     | flags (bit 0: compressed, bit 1: carries a stats section) |
//! | 2,3      | `u16`    | sequence number, assigned at the point of send         |
//! | 4..11    | `u64`    | send timestamp, microseconds                           |
//! | 12..     | sections | each section: `u16` size prefix, then content          |
//!
//! The sequence and timestamp fields hold placeholders until `finalize()`,
//! which is called when the packet is actually handed to the transport. That
//! way retransmitted packets keep their original sequence number while fresh
//! packets are numbered in send order.
use crate::CanopyError;
use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

pub const PACKET_HEADER_SIZE: usize = 11;
pub const INTERNAL_SECTION_SIZE_BYTES: usize = 2;

pub const FLAG_COMPRESSED: u8 = 1 << 0;
pub const FLAG_CONTAINS_STATS: u8 = 1 << 1;

/// A peer's live outbound packet: header placeholder plus accumulated
/// size-prefixed sections, bounded by the configured wire packet size.
#[derive(Debug, Clone)]
pub struct WirePacket {
    buf: Vec<u8>,
    capacity: usize,
    sections: usize,
}

impl WirePacket {
    pub fn new(capacity: usize, flags: u8) -> Self {
        let mut buf = Vec::with_capacity(capacity);
        buf.push(flags);
        buf.extend_from_slice(&[0; PACKET_HEADER_SIZE - 1]);
        Self {
            buf,
            capacity,
            sections: 0,
        }
    }

    /// Truncate back to an empty packet with the same flags.
    pub fn reset(&mut self) {
        self.buf.truncate(PACKET_HEADER_SIZE);
        self.sections = 0;
    }

    /// Room left for section content, size prefixes included.
    pub fn available(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn data_size(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn has_content(&self) -> bool {
        self.sections > 0
    }

    /// Everything after the header; what duplicate suppression compares.
    pub fn payload(&self) -> &[u8] {
        &self.buf[PACKET_HEADER_SIZE..]
    }

    pub fn write_section(&mut self, data: &[u8]) -> Result<(), CanopyError> {
        if INTERNAL_SECTION_SIZE_BYTES + data.len() > self.available()
            || data.len() > u16::MAX as usize
        {
            return Err(CanopyError::SectionTooBig);
        }
        self.buf
            .write_u16::<NetworkEndian>(data.len() as u16)
            .expect("vec write is infallible");
        self.buf.extend_from_slice(data);
        self.sections += 1;
        Ok(())
    }

    /// Append already size-prefixed section bytes from another packet, used to
    /// piggyback tree content onto a stats packet.
    pub fn append_sections(&mut self, payload: &[u8], count: usize) -> Result<(), CanopyError> {
        if payload.len() > self.available() {
            return Err(CanopyError::SectionTooBig);
        }
        self.buf.extend_from_slice(payload);
        self.sections += count;
        Ok(())
    }

    pub fn section_count(&self) -> usize {
        self.sections
    }

    /// Stamp the sequence number and send timestamp and return the bytes to
    /// hand to the transport.
    pub fn finalize(&mut self, sequence: u16, sent_time_usecs: u64) -> &[u8] {
        let mut cursor = Cursor::new(&mut self.buf[1..PACKET_HEADER_SIZE]);
        cursor
            .write_u16::<NetworkEndian>(sequence)
            .expect("header slice is sized for this");
        cursor
            .write_u64::<NetworkEndian>(sent_time_usecs)
            .expect("header slice is sized for this");
        &self.buf
    }
}

/// A fully parsed inbound packet, for the receiving side and for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPacket {
    pub flags: u8,
    pub sequence: u16,
    pub sent_time_usecs: u64,
    pub sections: Vec<Vec<u8>>,
}

pub fn parse_packet(bytes: &[u8]) -> Result<ParsedPacket, CanopyError> {
    let mut reader = Cursor::new(bytes);
    let flags = reader.read_u8()?;
    let sequence = reader.read_u16::<NetworkEndian>()?;
    let sent_time_usecs = reader.read_u64::<NetworkEndian>()?;
    let mut sections = Vec::new();
    while (reader.position() as usize) < bytes.len() {
        let size = reader.read_u16::<NetworkEndian>()? as usize;
        let mut section = vec![0; size];
        reader.read_exact(&mut section)?;
        sections.push(section);
    }
    Ok(ParsedPacket {
        flags,
        sequence,
        sent_time_usecs,
        sections,
    })
}

/// NACK payload: `u16` count followed by that many missing `u16` sequence
/// numbers. Chunking to packet capacity is the caller's job.
pub fn write_nack_packet(missing: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + missing.len() * 2);
    out.write_u16::<NetworkEndian>(missing.len() as u16)
        .expect("vec write is infallible");
    for seq in missing {
        out.write_u16::<NetworkEndian>(*seq)
            .expect("vec write is infallible");
    }
    out
}

pub fn parse_nack_packet(bytes: &[u8]) -> Result<Vec<u16>, CanopyError> {
    let mut reader = Cursor::new(bytes);
    let count = reader.read_u16::<NetworkEndian>().map_err(|_| CanopyError::InvalidNack)?;
    let mut missing = Vec::with_capacity(count as usize);
    for _ in 0..count {
        missing.push(
            reader
                .read_u16::<NetworkEndian>()
                .map_err(|_| CanopyError::InvalidNack)?,
        );
    }
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_sections_roundtrip() {
        let mut packet = WirePacket::new(1400, FLAG_COMPRESSED);
        packet.write_section(b"subtree content").unwrap();
        packet.write_section(b"more").unwrap();
        let bytes = packet.finalize(42, 123_456_789).to_vec();

        let parsed = parse_packet(&bytes).unwrap();
        assert_eq!(parsed.flags, FLAG_COMPRESSED);
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.sent_time_usecs, 123_456_789);
        assert_eq!(parsed.sections.len(), 2);
        assert_eq!(parsed.sections[0], b"subtree content");
        assert_eq!(parsed.sections[1], b"more");
    }

    #[test]
    fn section_refused_when_full() {
        let mut packet = WirePacket::new(PACKET_HEADER_SIZE + 10, 0);
        assert!(packet.write_section(&[0; 8]).is_ok());
        assert!(matches!(
            packet.write_section(&[0; 8]),
            Err(CanopyError::SectionTooBig)
        ));
        // the failed write must not have corrupted the packet
        assert_eq!(packet.section_count(), 1);
        assert_eq!(packet.available(), 0);
    }

    #[test]
    fn reset_restores_capacity() {
        let mut packet = WirePacket::new(100, 0);
        packet.write_section(&[0; 20]).unwrap();
        let before = packet.available();
        packet.reset();
        assert!(!packet.has_content());
        assert_eq!(packet.available(), before + 22);
    }

    #[test]
    fn nack_roundtrip() {
        let missing = vec![5, 7, 65535, 0];
        let bytes = write_nack_packet(&missing);
        assert_eq!(parse_nack_packet(&bytes).unwrap(), missing);
    }
}
