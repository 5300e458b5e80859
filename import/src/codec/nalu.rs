//! NAL-unit plumbing shared by the H.264 and H.265 parsers: Annex B
//! start-code scanning and the parameter-set entries kept inside decoder
//! configuration records.

use crate::stream::ByteStream;

pub const SHORT_START_CODE_LENGTH: usize = 3;
pub const LONG_START_CODE_LENGTH: usize = 4;
/// Samples carry NAL units behind 4-byte big-endian lengths.
pub const NALU_LENGTH_SIZE: usize = 4;

/// One parameter set held by a decoder configuration record, raw NAL
/// header included.
///
/// Once referenced by a delivered access unit, an entry's identifier slot
/// and bytes are fixed; a superseding set with the same identifier marks
/// it `unused` rather than removing it, so list positions stay stable.
#[derive(Clone, Debug)]
pub struct ParameterSet {
    pub nal_unit: Vec<u8>,
    pub unused: bool,
}

impl ParameterSet {
    pub fn new(nal_unit: &[u8]) -> ParameterSet {
        ParameterSet {
            nal_unit: nal_unit.to_vec(),
            unused: false,
        }
    }
}

/// Whether a byte-identical active entry already exists.
pub fn same_ps_exists(list: &[ParameterSet], data: &[u8]) -> bool {
    list.iter()
        .any(|ps| !ps.unused && ps.nal_unit[..] == data[..])
}

/// Number of active (not superseded) entries.
pub fn active_ps_count(list: &[ParameterSet]) -> usize {
    list.iter().filter(|ps| !ps.unused).count()
}

/// The result of scanning for the NAL unit at the current stream
/// position.
pub struct NaluScan {
    /// Length of this NALU (header included, start code excluded).
    pub nalu_length: u64,
    pub start_code_length: usize,
    /// Zero bytes between this NALU and the next start code. The last
    /// one, if any, is counted as part of the next (long) start code
    /// instead.
    pub trailing_zero_bytes: u64,
}

/// Classifies the start code at the current position: long, short, or
/// absent.
pub fn current_start_code(bs: &mut ByteStream) -> Option<usize> {
    if !bs.is_end(LONG_START_CODE_LENGTH) && bs.show_be32(0) == 0x0000_0001 {
        Some(LONG_START_CODE_LENGTH)
    } else if !bs.is_end(SHORT_START_CODE_LENGTH) && bs.show_be24(0) == 0x00_0001 {
        Some(SHORT_START_CODE_LENGTH)
    } else {
        None
    }
}

/// Measures the NALU that begins at the current start code, whose header
/// occupies `header_length` bytes, by finding the next start code.
pub fn measure_nalu(bs: &mut ByteStream, start_code_length: usize, header_length: usize) -> NaluScan {
    let mut distance = (start_code_length + header_length) as u64;
    if !bs.is_end(distance as usize + SHORT_START_CODE_LENGTH) {
        let mut sync_bytes = bs.show_be24(distance as usize);
        while sync_bytes != 0x00_0001 {
            distance += 1;
            if bs.is_end(distance as usize + SHORT_START_CODE_LENGTH) {
                distance = bs.remaining() as u64;
                break;
            }
            sync_bytes <<= 8;
            sync_bytes |= u32::from(bs.show_byte(distance as usize + SHORT_START_CODE_LENGTH - 1));
            sync_bytes &= 0xFF_FFFF;
        }
    } else {
        distance = bs.remaining() as u64;
    }
    // A NALU never ends in zero bytes; strip them off.
    let mut count = 0;
    while distance > start_code_length as u64 && bs.show_byte(distance as usize - 1) == 0x00 {
        distance -= 1;
        count += 1;
    }
    // One trailing zero byte, if present, becomes part of the next start
    // code, promoting it to the long form.
    if count > 0 {
        count -= 1;
    }
    NaluScan {
        nalu_length: distance - start_code_length as u64,
        start_code_length,
        trailing_zero_bytes: count,
    }
}

/// Finds the offset of the first long start code, requiring nothing but
/// zero bytes before it. Returns `None` for non-Annex-B data.
pub fn find_first_start_code(bs: &mut ByteStream) -> Option<u64> {
    let mut first_sc_head_pos = 0u64;
    loop {
        if bs.is_end(first_sc_head_pos as usize + LONG_START_CODE_LENGTH) {
            return None;
        }
        // Invalid if any non-zero value appears before the first start code.
        if bs.show_byte(first_sc_head_pos as usize) != 0 {
            return None;
        }
        // The first NALU of an AU in decoding order must have a long
        // start code.
        if bs.show_be32(first_sc_head_pos as usize) == 0x0000_0001 {
            return Some(first_sc_head_pos);
        }
        first_sc_head_pos += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ByteStream;
    use std::io::Cursor;

    #[test]
    fn first_start_code_skips_leading_zeros() {
        let mut bs = ByteStream::new(Cursor::new(vec![0, 0, 0, 0, 0, 1, 0x65, 0x88]));
        assert_eq!(find_first_start_code(&mut bs), Some(2));
    }

    #[test]
    fn garbage_before_start_code_is_rejected() {
        let mut bs = ByteStream::new(Cursor::new(vec![0x42, 0, 0, 0, 1, 0x65]));
        assert_eq!(find_first_start_code(&mut bs), None);
    }

    #[test]
    fn measures_to_next_start_code() {
        // Long start code, 5-byte NALU, short start code, 3-byte NALU.
        let data = vec![0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21, 0xA0, 0, 0, 1, 0x41, 0x9A, 0x10];
        let mut bs = ByteStream::new(Cursor::new(data));
        assert_eq!(current_start_code(&mut bs), Some(4));
        let scan = measure_nalu(&mut bs, 4, 1);
        assert_eq!(scan.nalu_length, 5);
        assert_eq!(scan.trailing_zero_bytes, 0);
    }

    #[test]
    fn trailing_zeros_promote_next_start_code() {
        // NALU followed by two zero bytes and then a short start code:
        // one zero is trailing, the other joins the start code.
        let data = vec![0, 0, 0, 1, 0x65, 0x88, 0x84, 0, 0, 0, 0, 1, 0x41, 0x9A];
        let mut bs = ByteStream::new(Cursor::new(data));
        let scan = measure_nalu(&mut bs, 4, 1);
        assert_eq!(scan.nalu_length, 3);
        assert_eq!(scan.trailing_zero_bytes, 1);
    }

    #[test]
    fn last_nalu_sheds_trailing_zeros_silently() {
        let data = vec![0, 0, 0, 1, 0x65, 0x88, 0, 0];
        let mut bs = ByteStream::new(Cursor::new(data));
        let scan = measure_nalu(&mut bs, 4, 1);
        assert_eq!(scan.nalu_length, 2);
        // Both zeros stripped; one would have joined a next start code.
        assert_eq!(scan.trailing_zero_bytes, 1);
    }
}
