//! Types for processing tables of *Program Specific Information* in a transport stream.
//!
//! # Concepts
//!
//! * There are multiple standard types of Program Specific Information, like the *Program
//!   Association Table* and *Program Map Table*.  Standards derived from mpegts may define their
//!   own table types.
//! * A PSI *Table* can split into *Sections*
//! * A Section can be split across a small number of individual transport stream *Packets*
//! * A Section may use the 'long' syntax common across a number of the standard table types
//!   (versioned, numbered and CRC-protected), or the 'short' syntax, which is just a table id and
//!   an opaque bag of bytes.
//!
//! # Core types
//!
//! * [`Section`](struct.Section.html) is one validated section, shared between the table
//!   assembly logic and any application handlers.
//! * [`validate`](validate/index.html) carves sections from the bytes reassembled out of packet
//!   payloads.
//! * [`table`](table/index.html) groups sections into complete *Tables*.
//!
//! The specific types of table are not interpreted by this crate; only the generic section
//! syntax is.

pub mod eit;
pub mod table;
pub mod validate;

use crate::mpegts_crc;
use crate::packet::Pid;
use std::fmt;

/// Size of the header common to every section: `table_id` and `section_length`.
pub const SHORT_SECTION_HEADER_SIZE: usize = SectionCommonHeader::SIZE;
/// Size of the header of a section using the long syntax, up to `last_section_number`.
pub const LONG_SECTION_HEADER_SIZE: usize = SectionCommonHeader::SIZE + TableSyntaxHeader::SIZE;
/// Size of the trailing `CRC_32` field of long sections.
pub const SECTION_CRC32_SIZE: usize = 4;
/// Largest section allowed for private sections (and therefore any section).
pub const MAX_PRIVATE_SECTION_SIZE: usize = 4096;
/// Smallest possible section.
pub const MIN_SHORT_SECTION_SIZE: usize = SHORT_SECTION_HEADER_SIZE;
/// Smallest possible long section: the header plus the CRC.
pub const MIN_LONG_SECTION_SIZE: usize = LONG_SECTION_HEADER_SIZE + SECTION_CRC32_SIZE;

/// `table_id` of the DVB _Stuffing Table_, whose sections are always short, whatever the value
/// of `section_syntax_indicator`.
pub const TID_STUFFING: u8 = 0x72;
/// `table_id` value which is forbidden, and used to pad the end of packet payloads.
pub const TID_FORBIDDEN: u8 = 0xff;

/// Whether a section is applicable now or only at some later time.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CurrentNext {
    Current,
    Next,
}

impl CurrentNext {
    fn from(v: u8) -> CurrentNext {
        if v & 1 == 0 {
            CurrentNext::Next
        } else {
            CurrentNext::Current
        }
    }
}

/// The 3-byte header present at the start of every section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionCommonHeader {
    pub table_id: u8,
    pub section_syntax_indicator: bool,
    pub private_indicator: bool,
    pub section_length: usize,
}

impl SectionCommonHeader {
    pub const SIZE: usize = 3;

    /// Panics if fewer than `SectionCommonHeader::SIZE` bytes are given.
    pub fn new(buf: &[u8]) -> SectionCommonHeader {
        assert!(buf.len() >= Self::SIZE);
        SectionCommonHeader {
            table_id: buf[0],
            section_syntax_indicator: buf[1] & 0b1000_0000 != 0,
            private_indicator: buf[1] & 0b0100_0000 != 0,
            section_length: ((u16::from(buf[1] & 0b0000_1111) << 8) | u16::from(buf[2])) as usize,
        }
    }

    /// The size of the whole section, header included.
    pub fn total_size(&self) -> usize {
        self.section_length + Self::SIZE
    }

    /// `true` if the long section syntax follows this header.
    ///
    /// The DVB _Stuffing Table_ is always short, regardless of `section_syntax_indicator`.
    pub fn is_long(&self) -> bool {
        self.section_syntax_indicator && self.table_id != TID_STUFFING
    }
}

#[derive(Debug)]
/// Represents the fields that appear within table sections that use the common 'section syntax'.
///
/// This will only be used for a table section if
/// [`SectionCommonHeader::is_long()`](struct.SectionCommonHeader.html#method.is_long) is `true`.
pub struct TableSyntaxHeader<'buf> {
    buf: &'buf [u8],
}

impl<'buf> TableSyntaxHeader<'buf> {
    pub const SIZE: usize = 5;

    /// Panics if fewer than `TableSyntaxHeader::SIZE` bytes are given.
    pub fn new(buf: &'buf [u8]) -> TableSyntaxHeader<'buf> {
        assert!(buf.len() >= Self::SIZE);
        TableSyntaxHeader { buf }
    }
    /// The initial 16-bit field within a 'section syntax' PSI table (which immediately follows the
    /// `section_length` field).
    /// _13818-1_ refers to this field as,
    ///  - `transport_stream_id` when it appears within a Program Association Section
    ///  - part of the `reserved` field when it appears within a Conditional Access Section
    ///  - `program_number` when it appears within a Program Map Section
    ///  - `table_id_extension` when it appears within a Private Section
    pub fn id(&self) -> u16 {
        u16::from(self.buf[0]) << 8 | u16::from(self.buf[1])
    }
    /// A 5-bit value that can be used to quickly check if this table has changed since the last
    /// time it was periodically inserted within the transport stream being read.
    pub fn version(&self) -> u8 {
        (self.buf[2] >> 1) & 0b0001_1111
    }
    /// Is this table applicable now, or will it become applicable at some future time.
    pub fn current_next_indicator(&self) -> CurrentNext {
        CurrentNext::from(self.buf[2])
    }
    /// The number of this section, within a potentially multi-section table.
    pub fn section_number(&self) -> u8 {
        self.buf[3]
    }
    /// Indicates the value of `section_number()` that will appear within the last section within
    /// a table.
    pub fn last_section_number(&self) -> u8 {
        self.buf[4]
    }
}

/// Identifies one table among all those carried on a PID: the `table_id`, and for long sections
/// the `table_id_extension` (e.g. a service or network id).  Short sections always have an
/// extension of `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableIdentity {
    pub table_id: u8,
    pub table_id_extension: u16,
}

impl TableIdentity {
    pub fn new(table_id: u8, table_id_extension: u16) -> TableIdentity {
        TableIdentity {
            table_id,
            table_id_extension,
        }
    }
}

impl fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TID {:#04x}/{:#06x}",
            self.table_id, self.table_id_extension
        )
    }
}

/// Reasons for a byte buffer not being acceptable as a `Section`
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SectionError {
    #[error("section header is missing or malformed")]
    InvalidHeader,
    #[error("section_length announces {declared} bytes, but {actual} bytes are present")]
    InvalidSize { declared: usize, actual: usize },
    #[error("section_number {section_number} is beyond last_section_number {last_section_number}")]
    InvalidSectionNumber {
        section_number: u8,
        last_section_number: u8,
    },
    #[error("section CRC check failed: calculated {calculated:#010x}, stored {stored:#010x}")]
    CrcMismatch { calculated: u32, stored: u32 },
    #[error("section payload of {len} bytes does not fit in a section")]
    PayloadTooLarge { len: usize },
}

/// A complete section, which has passed every structural check and, for long sections, the CRC
/// check.
///
/// Sections are immutable once built, and are usually handled as `Rc<Section>` so that the
/// same section can be held by a table being assembled and passed to application handlers
/// without copying.
#[derive(Clone, PartialEq, Eq)]
pub struct Section {
    data: Vec<u8>,
    source_pid: Pid,
    first_packet: u64,
    last_packet: u64,
}

impl Section {
    /// Validate the given bytes as one whole section, CRC included.
    pub fn new(data: Vec<u8>, source_pid: Pid) -> Result<Section, SectionError> {
        Self::check(&data)?;
        Ok(Section {
            data,
            source_pid,
            first_packet: 0,
            last_packet: 0,
        })
    }

    /// Build a long section from its header fields and payload, computing the CRC.
    #[allow(clippy::too_many_arguments)]
    pub fn new_long(
        table_id: u8,
        is_private: bool,
        table_id_extension: u16,
        version: u8,
        current_next: CurrentNext,
        section_number: u8,
        last_section_number: u8,
        payload: &[u8],
        source_pid: Pid,
    ) -> Result<Section, SectionError> {
        let total = MIN_LONG_SECTION_SIZE + payload.len();
        if total > MAX_PRIVATE_SECTION_SIZE {
            return Err(SectionError::PayloadTooLarge { len: payload.len() });
        }
        let section_length = (total - SectionCommonHeader::SIZE) as u16;
        let mut data = Vec::with_capacity(total);
        data.push(table_id);
        data.push(
            0b1000_0000
                | if is_private { 0b0100_0000 } else { 0 }
                | 0b0011_0000
                | (section_length >> 8) as u8,
        );
        data.push(section_length as u8);
        data.extend_from_slice(&table_id_extension.to_be_bytes());
        data.push(
            0b1100_0000
                | (version & 0b1_1111) << 1
                | if current_next == CurrentNext::Current { 1 } else { 0 },
        );
        data.push(section_number);
        data.push(last_section_number);
        data.extend_from_slice(payload);
        append_crc(&mut data);
        Section::new(data, source_pid)
    }

    /// Wrap data whose structure and CRC have already been checked.
    pub(crate) fn from_checked(data: Vec<u8>, source_pid: Pid) -> Section {
        Section {
            data,
            source_pid,
            first_packet: 0,
            last_packet: 0,
        }
    }

    pub(crate) fn with_packet_indices(mut self, first: u64, last: u64) -> Section {
        self.first_packet = first;
        self.last_packet = last;
        self
    }

    fn check(data: &[u8]) -> Result<(), SectionError> {
        if data.len() < MIN_SHORT_SECTION_SIZE {
            return Err(SectionError::InvalidHeader);
        }
        let header = SectionCommonHeader::new(&data[..SectionCommonHeader::SIZE]);
        let declared = header.total_size();
        if declared > MAX_PRIVATE_SECTION_SIZE {
            return Err(SectionError::InvalidHeader);
        }
        if declared != data.len() {
            return Err(SectionError::InvalidSize {
                declared,
                actual: data.len(),
            });
        }
        if header.is_long() {
            if data.len() < MIN_LONG_SECTION_SIZE {
                return Err(SectionError::InvalidHeader);
            }
            let syntax = TableSyntaxHeader::new(&data[SectionCommonHeader::SIZE..]);
            if syntax.section_number() > syntax.last_section_number() {
                return Err(SectionError::InvalidSectionNumber {
                    section_number: syntax.section_number(),
                    last_section_number: syntax.last_section_number(),
                });
            }
            // don't apply CRC checks when fuzzing, to give more chances of test data triggering
            // parser bugs,
            if !cfg!(fuzzing) && mpegts_crc::sum32(data) != 0 {
                let crc_pos = data.len() - SECTION_CRC32_SIZE;
                return Err(SectionError::CrcMismatch {
                    calculated: mpegts_crc::sum32(&data[..crc_pos]),
                    stored: u32::from_be_bytes([
                        data[crc_pos],
                        data[crc_pos + 1],
                        data[crc_pos + 2],
                        data[crc_pos + 3],
                    ]),
                });
            }
        }
        Ok(())
    }

    /// A copy of this section with a different `section_number` and `last_section_number`, and
    /// a recomputed CRC.  Short sections are returned unchanged.
    pub fn renumbered(&self, section_number: u8, last_section_number: u8) -> Section {
        let mut copy = self.clone();
        if self.is_long() {
            copy.data[6] = section_number;
            copy.data[7] = last_section_number;
            let crc_pos = copy.data.len() - SECTION_CRC32_SIZE;
            copy.data.truncate(crc_pos);
            append_crc(&mut copy.data);
        }
        copy
    }

    pub fn common_header(&self) -> SectionCommonHeader {
        SectionCommonHeader::new(&self.data[..SectionCommonHeader::SIZE])
    }

    /// The long-syntax header fields, or `None` for a short section.
    pub fn table_syntax_header(&self) -> Option<TableSyntaxHeader<'_>> {
        if self.is_long() {
            Some(TableSyntaxHeader::new(&self.data[SectionCommonHeader::SIZE..]))
        } else {
            None
        }
    }

    pub fn table_id(&self) -> u8 {
        self.data[0]
    }

    pub fn is_long(&self) -> bool {
        self.common_header().is_long()
    }

    pub fn is_private(&self) -> bool {
        self.common_header().private_indicator
    }

    /// `0` for short sections.
    pub fn table_id_extension(&self) -> u16 {
        self.table_syntax_header().map(|h| h.id()).unwrap_or(0)
    }

    pub fn identity(&self) -> TableIdentity {
        TableIdentity::new(self.table_id(), self.table_id_extension())
    }

    /// Short sections have no version field, and report `0`.
    pub fn version(&self) -> u8 {
        self.table_syntax_header().map(|h| h.version()).unwrap_or(0)
    }

    /// Short sections are always `CurrentNext::Current`.
    pub fn current_next(&self) -> CurrentNext {
        self.table_syntax_header()
            .map(|h| h.current_next_indicator())
            .unwrap_or(CurrentNext::Current)
    }

    pub fn section_number(&self) -> u8 {
        self.table_syntax_header()
            .map(|h| h.section_number())
            .unwrap_or(0)
    }

    pub fn last_section_number(&self) -> u8 {
        self.table_syntax_header()
            .map(|h| h.last_section_number())
            .unwrap_or(0)
    }

    /// The bytes following the header, and preceding the CRC for long sections.
    pub fn payload(&self) -> &[u8] {
        if self.is_long() {
            &self.data[LONG_SECTION_HEADER_SIZE..self.data.len() - SECTION_CRC32_SIZE]
        } else {
            &self.data[SHORT_SECTION_HEADER_SIZE..]
        }
    }

    /// The whole section as received, headers and CRC included.
    pub fn content(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn source_pid(&self) -> Pid {
        self.source_pid
    }

    /// Index (counted from the first packet given to the demultiplexer) of the packet where this
    /// section started.
    pub fn first_packet_index(&self) -> u64 {
        self.first_packet
    }

    /// Index of the packet where this section ended.
    pub fn last_packet_index(&self) -> u64 {
        self.last_packet
    }
}

impl fmt::Debug for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Section");
        d.field("pid", &self.source_pid)
            .field("table_id", &self.table_id())
            .field("len", &self.data.len());
        if self.is_long() {
            d.field("table_id_extension", &self.table_id_extension())
                .field("version", &self.version())
                .field("current_next", &self.current_next())
                .field("section_number", &self.section_number())
                .field("last_section_number", &self.last_section_number());
        }
        d.finish()
    }
}

fn append_crc(data: &mut Vec<u8>) {
    let crc = mpegts_crc::sum32(&data[..]);
    data.extend_from_slice(&crc.to_be_bytes());
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use assert_matches::assert_matches;
    use bitstream_io::{BigEndian, BitWrite, BitWriter};
    use hex_literal::hex;
    use std::io;

    pub(crate) fn make_test_data<F>(builder: F) -> Vec<u8>
    where
        F: Fn(&mut BitWriter<&mut Vec<u8>, BigEndian>) -> Result<(), io::Error>,
    {
        let mut data: Vec<u8> = Vec::new();
        {
            let mut w = BitWriter::endian(&mut data, BigEndian);
            builder(&mut w).unwrap();
        }
        data
    }

    /// A long section with a correct CRC.
    pub(crate) fn long_section(
        table_id: u8,
        table_id_extension: u16,
        version: u8,
        section_number: u8,
        last_section_number: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let section_length = (TableSyntaxHeader::SIZE + payload.len() + SECTION_CRC32_SIZE) as u16;
        let mut data = make_test_data(|w| {
            w.write(8, table_id)?;
            w.write_bit(true)?; // section_syntax_indicator
            w.write_bit(false)?; // private_indicator
            w.write(2, 3u8)?; // reserved
            w.write(12, section_length)?;
            w.write(16, table_id_extension)?;
            w.write(2, 3u8)?; // reserved
            w.write(5, version)?;
            w.write_bit(true)?; // current_next_indicator
            w.write(8, section_number)?;
            w.write(8, last_section_number)
        });
        data.extend_from_slice(payload);
        append_crc(&mut data);
        data
    }

    /// A short section holding the given payload.
    pub(crate) fn short_section(table_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut data = make_test_data(|w| {
            w.write(8, table_id)?;
            w.write_bit(false)?; // section_syntax_indicator
            w.write_bit(false)?; // private_indicator
            w.write(2, 3u8)?; // reserved
            w.write(12, payload.len() as u16)
        });
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn pat_section() {
        let sect = Section::new(
            hex!("00B00D0001C100000001E1E02D507804").to_vec(),
            Pid::PAT,
        )
        .unwrap();
        assert!(sect.is_long());
        assert_eq!(sect.table_id(), 0);
        assert_eq!(sect.table_id_extension(), 1);
        assert_eq!(sect.version(), 0);
        assert_eq!(sect.current_next(), CurrentNext::Current);
        assert_eq!(sect.section_number(), 0);
        assert_eq!(sect.last_section_number(), 0);
        assert_eq!(sect.payload(), &hex!("0001E1E0")[..]);
        assert_eq!(sect.identity(), TableIdentity::new(0, 1));
    }

    #[test]
    fn bad_crc() {
        let mut data = long_section(0x42, 7, 3, 0, 0, b"abc");
        data[9] ^= 1;
        assert_matches!(
            Section::new(data, Pid::new(0x11)),
            Err(SectionError::CrcMismatch { .. })
        );
    }

    #[test]
    fn size_mismatch() {
        let mut data = short_section(0x70, b"hello");
        data.push(0);
        assert_matches!(
            Section::new(data, Pid::new(0x14)),
            Err(SectionError::InvalidSize {
                declared: 8,
                actual: 9
            })
        );
    }

    #[test]
    fn section_number_beyond_last() {
        let data = long_section(0x42, 7, 3, 2, 1, b"");
        assert_matches!(
            Section::new(data, Pid::new(0x11)),
            Err(SectionError::InvalidSectionNumber {
                section_number: 2,
                last_section_number: 1
            })
        );
    }

    #[test]
    fn short_section_defaults() {
        let sect = Section::new(short_section(0x70, b"hello"), Pid::new(0x14)).unwrap();
        assert!(!sect.is_long());
        assert_eq!(sect.table_id_extension(), 0);
        assert_eq!(sect.version(), 0);
        assert_eq!(sect.payload(), b"hello");
        assert!(sect.table_syntax_header().is_none());
    }

    #[test]
    fn stuffing_table_is_short() {
        let mut data = short_section(TID_STUFFING, b"xx");
        data[1] |= 0b1000_0000;
        let sect = Section::new(data, Pid::new(0x10)).unwrap();
        assert!(!sect.is_long());
    }

    #[test]
    fn new_long_matches_wire_layout() {
        let built = Section::new_long(
            0x4e,
            false,
            0x0102,
            5,
            CurrentNext::Current,
            1,
            3,
            b"payload",
            Pid::new(0x12),
        )
        .unwrap();
        assert_eq!(built.content(), &long_section(0x4e, 0x0102, 5, 1, 3, b"payload")[..]);
    }

    #[test]
    fn renumbering_recomputes_crc() {
        let sect = Section::new(long_section(0x42, 7, 3, 2, 4, b"abc"), Pid::new(0x11)).unwrap();
        let renumbered = sect.renumbered(0, 1);
        assert_eq!(renumbered.section_number(), 0);
        assert_eq!(renumbered.last_section_number(), 1);
        assert_eq!(renumbered.payload(), b"abc");
        assert!(Section::new(renumbered.content().to_vec(), Pid::new(0x11)).is_ok());
    }
}
