//! Carving candidate sections from the bytes reassembled for one PID, and checking them.
//!
//! Extraction works on the front of a buffer which is known to start on a section boundary.  The
//! position of the section announced by the pointer field of the most recent
//! `payload_unit_start_indicator` packet (the _anchor_) is used to recover from malformed
//! data without rescanning byte-by-byte.

use super::{
    CurrentNext, Section, SectionCommonHeader, TableSyntaxHeader, MAX_PRIVATE_SECTION_SIZE,
    MIN_LONG_SECTION_SIZE, MIN_SHORT_SECTION_SIZE, SECTION_CRC32_SIZE, TID_FORBIDDEN,
};
use crate::mpegts_crc;
use crate::packet::Pid;
use std::fmt;

/// Outcome of looking at the front of a section buffer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Extract {
    /// Not enough data yet; the buffer must be kept as-is until more arrives.
    Incomplete,
    /// The buffer starts with stuffing.  Processing resumes at the given offset, or if `None`,
    /// everything buffered is stuffing.
    Stuffing { resume_at: Option<usize> },
    /// The `section_length` field is out of bounds.  Processing resumes at the given offset, or
    /// if `None`, synchronisation on this PID is lost.
    BadLength {
        section_length: usize,
        resume_at: Option<usize>,
    },
    /// The first `length` bytes of the buffer form a candidate section.  If `truncated` is set,
    /// the section was cut short by the start of the next section, and `length` has been reduced
    /// to end at that point.
    Candidate {
        length: usize,
        declared_length: usize,
        truncated: bool,
    },
}

/// Look at the front of `buf` for a section.  `anchor`, if given, is the offset into `buf` at
/// which a section is known to start.
pub(crate) fn next_candidate(buf: &[u8], anchor: Option<usize>) -> Extract {
    if buf.len() < SectionCommonHeader::SIZE {
        return Extract::Incomplete;
    }
    let ahead = anchor.filter(|&a| a > 0);
    if buf[0] == TID_FORBIDDEN {
        return Extract::Stuffing {
            resume_at: ahead.filter(|&a| a < buf.len()),
        };
    }
    let header = SectionCommonHeader::new(&buf[..SectionCommonHeader::SIZE]);
    let section_length = header.total_size();
    if !valid_length(&header) {
        return Extract::BadLength {
            section_length,
            resume_at: ahead,
        };
    }
    if let Some(a) = ahead {
        if a < section_length {
            return Extract::Candidate {
                length: a,
                declared_length: section_length,
                truncated: true,
            };
        }
    }
    if buf.len() < section_length {
        return Extract::Incomplete;
    }
    Extract::Candidate {
        length: section_length,
        declared_length: section_length,
        truncated: false,
    }
}

fn valid_length(header: &SectionCommonHeader) -> bool {
    let len = header.total_size();
    let min = if header.is_long() {
        MIN_LONG_SECTION_SIZE
    } else {
        MIN_SHORT_SECTION_SIZE
    };
    (min..=MAX_PRIVATE_SECTION_SIZE).contains(&len)
}

/// Why some section data was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    /// The section was cut short by the start of the next one, probably because of packet loss.
    Truncated { declared_length: usize },
    /// `section_number` is greater than `last_section_number`.
    SectionNumber {
        section_number: u8,
        last_section_number: u8,
    },
    /// `last_section_number` differs from the one given by earlier sections of the same table
    /// version.
    LastSectionNumber { expected: u8, actual: u8 },
    /// The CRC stored in the section does not match its content.
    Crc { calculated: u32, stored: u32 },
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::Truncated { declared_length } => {
                write!(f, "truncated section (declared {} bytes)", declared_length)
            }
            InvalidReason::SectionNumber {
                section_number,
                last_section_number,
            } => write!(
                f,
                "section number {} greater than last section number {}",
                section_number, last_section_number
            ),
            InvalidReason::LastSectionNumber { expected, actual } => write!(
                f,
                "inconsistent last section number {}, expected {}",
                actual, expected
            ),
            InvalidReason::Crc { calculated, stored } => write!(
                f,
                "CRC error, calculated {:#010x}, stored {:#010x}",
                calculated, stored
            ),
        }
    }
}

/// Outcome of checking a candidate section.
#[derive(Debug)]
pub(crate) enum Validated {
    Valid(Section),
    Invalid(InvalidReason),
    /// The section is well-formed, but of a current/next state that was not asked for.
    Filtered(CurrentNext),
}

/// Checks the structure and CRC of candidate sections, and applies current/next selection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SectionValidator {
    pub get_current: bool,
    pub get_next: bool,
}

impl SectionValidator {
    pub fn check(&self, candidate: &[u8], truncated: Option<usize>, pid: Pid) -> Validated {
        if let Some(declared_length) = truncated {
            return Validated::Invalid(InvalidReason::Truncated { declared_length });
        }
        let header = SectionCommonHeader::new(&candidate[..SectionCommonHeader::SIZE]);
        if header.is_long() {
            let syntax = TableSyntaxHeader::new(&candidate[SectionCommonHeader::SIZE..]);
            if syntax.section_number() > syntax.last_section_number() {
                return Validated::Invalid(InvalidReason::SectionNumber {
                    section_number: syntax.section_number(),
                    last_section_number: syntax.last_section_number(),
                });
            }
            let state = syntax.current_next_indicator();
            let wanted = match state {
                CurrentNext::Current => self.get_current,
                CurrentNext::Next => self.get_next,
            };
            if !wanted {
                return Validated::Filtered(state);
            }
        }
        if header.is_long() && !cfg!(fuzzing) && mpegts_crc::sum32(candidate) != 0 {
            let crc_pos = candidate.len() - SECTION_CRC32_SIZE;
            let mut stored = [0u8; SECTION_CRC32_SIZE];
            stored.copy_from_slice(&candidate[crc_pos..]);
            return Validated::Invalid(InvalidReason::Crc {
                calculated: mpegts_crc::sum32(&candidate[..crc_pos]),
                stored: u32::from_be_bytes(stored),
            });
        }
        Validated::Valid(Section::from_checked(candidate.to_vec(), pid))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::psi::test::{long_section, short_section};
    use assert_matches::assert_matches;

    const ALL: SectionValidator = SectionValidator {
        get_current: true,
        get_next: true,
    };

    #[test]
    fn too_short_for_header() {
        assert_eq!(next_candidate(&[0x00, 0xb0], None), Extract::Incomplete);
    }

    #[test]
    fn incomplete_section() {
        let sect = long_section(0x42, 1, 0, 0, 0, b"payload");
        assert_eq!(next_candidate(&sect[..10], None), Extract::Incomplete);
    }

    #[test]
    fn complete_section() {
        let mut buf = short_section(0x01, b"abcde");
        buf.extend_from_slice(&[0xff; 10]);
        assert_eq!(
            next_candidate(&buf, None),
            Extract::Candidate {
                length: 8,
                declared_length: 8,
                truncated: false
            }
        );
    }

    #[test]
    fn stuffing() {
        let buf = [0xffu8; 20];
        assert_eq!(
            next_candidate(&buf, None),
            Extract::Stuffing { resume_at: None }
        );
        assert_eq!(
            next_candidate(&buf, Some(12)),
            Extract::Stuffing {
                resume_at: Some(12)
            }
        );
        // an anchor at the front is not ahead
        assert_eq!(
            next_candidate(&buf, Some(0)),
            Extract::Stuffing { resume_at: None }
        );
    }

    #[test]
    fn length_bounds() {
        // exactly the minimum short section, and exactly the maximum
        let min = [0x01, 0x30, 0x00];
        assert_matches!(
            next_candidate(&min, None),
            Extract::Candidate { length: 3, .. }
        );
        let max_len = (MAX_PRIVATE_SECTION_SIZE - 3) as u16;
        let max = [0x01, 0x30 | (max_len >> 8) as u8, max_len as u8];
        assert_eq!(next_candidate(&max, None), Extract::Incomplete);

        let over_len = max_len + 1;
        let over = [0x01, 0x30 | (over_len >> 8) as u8, over_len as u8];
        assert_eq!(
            next_candidate(&over, Some(40)),
            Extract::BadLength {
                section_length: MAX_PRIVATE_SECTION_SIZE + 1,
                resume_at: Some(40)
            }
        );
    }

    #[test]
    fn long_section_below_minimum() {
        // section_length of 8 leaves no room for the CRC
        let buf = [0x42, 0xb0, 0x08, 0, 1, 0xc1, 0, 0, 0, 0, 0];
        assert_eq!(
            next_candidate(&buf, None),
            Extract::BadLength {
                section_length: 11,
                resume_at: None
            }
        );
        // 9 is the smallest long section_length
        let buf = [0x42, 0xb0, 0x09];
        assert_eq!(next_candidate(&buf, None), Extract::Incomplete);
    }

    #[test]
    fn truncated_by_anchor() {
        let mut buf = long_section(0x42, 1, 0, 0, 0, b"0123456789");
        buf.truncate(9);
        buf.extend_from_slice(&short_section(0x01, b"x"));
        assert_eq!(
            next_candidate(&buf, Some(9)),
            Extract::Candidate {
                length: 9,
                declared_length: 22,
                truncated: true
            }
        );
    }

    #[test]
    fn check_valid_long() {
        let sect = long_section(0x42, 1, 3, 0, 1, b"abc");
        let v = ALL.check(&sect, None, Pid::new(0x11));
        assert_matches!(v, Validated::Valid(s) => {
            assert_eq!(s.version(), 3);
            assert_eq!(s.source_pid(), Pid::new(0x11));
        });
    }

    #[test]
    fn check_crc() {
        let mut sect = long_section(0x42, 1, 3, 0, 1, b"abc");
        sect[8] ^= 0x10;
        assert_matches!(
            ALL.check(&sect, None, Pid::new(0x11)),
            Validated::Invalid(InvalidReason::Crc { .. })
        );
    }

    #[test]
    fn check_section_number() {
        let sect = long_section(0x42, 1, 3, 4, 1, b"abc");
        assert_matches!(
            ALL.check(&sect, None, Pid::new(0x11)),
            Validated::Invalid(InvalidReason::SectionNumber {
                section_number: 4,
                last_section_number: 1
            })
        );
    }

    #[test]
    fn check_current_next() {
        let mut sect = long_section(0x42, 1, 3, 0, 0, b"abc");
        let defaults = SectionValidator {
            get_current: true,
            get_next: false,
        };
        assert_matches!(
            defaults.check(&sect, None, Pid::new(0x11)),
            Validated::Valid(_)
        );
        sect[5] &= 0xfe;
        assert_matches!(
            defaults.check(&sect, None, Pid::new(0x11)),
            Validated::Filtered(CurrentNext::Next)
        );
        let next_only = SectionValidator {
            get_current: false,
            get_next: true,
        };
        // the CRC was not updated after the flag change
        assert_matches!(
            next_only.check(&sect, None, Pid::new(0x11)),
            Validated::Invalid(InvalidReason::Crc { .. })
        );
    }

    #[test]
    fn check_truncated() {
        let sect = short_section(0x01, b"abc");
        assert_matches!(
            ALL.check(&sect, Some(30), Pid::new(0x11)),
            Validated::Invalid(InvalidReason::Truncated {
                declared_length: 30
            })
        );
    }
}
