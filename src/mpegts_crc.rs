//! The CRC-32 variant used to protect PSI sections (_ISO/IEC 13818-1, Annex A_).

use crc::{Crc, CRC_32_MPEG_2};

const MPEG_2: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// CRC of the given bytes.  Calculated over the whole of a section *including* its trailing
/// `CRC_32` field, the result is `0` when the section is intact.
pub fn sum32(data: &[u8]) -> u32 {
    MPEG_2.checksum(data)
}
