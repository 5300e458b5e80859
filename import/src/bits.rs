//! Bit-level parsing helpers for NAL payloads.
//!
//! H.264/H.265 RBSPs and the various audio headers are parsed from
//! self-contained buffers with [bitreader::BitReader]; this module layers
//! the Exp-Golomb codes (H.264 section 9.1), emulation-prevention removal
//! (section 7.4.1.1), and the `more_rbsp_data()` test on top of it.

use bitreader::BitReader;
use failure::Error;

/// A bit reader over one RBSP with the NAL-specific extras.
pub struct NalBits<'a> {
    reader: BitReader<'a>,
    data: &'a [u8],
}

impl<'a> NalBits<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        NalBits {
            reader: BitReader::new(data),
            data,
        }
    }

    pub fn get(&mut self, bit_count: u8) -> Result<u64, Error> {
        Ok(self.reader.read_u64(bit_count)?)
    }

    pub fn get_u32(&mut self, bit_count: u8) -> Result<u32, Error> {
        Ok(self.reader.read_u32(bit_count)?)
    }

    pub fn get_u8(&mut self, bit_count: u8) -> Result<u8, Error> {
        Ok(self.reader.read_u8(bit_count)?)
    }

    pub fn flag(&mut self) -> Result<bool, Error> {
        Ok(self.reader.read_bool()?)
    }

    pub fn skip(&mut self, bit_count: u64) -> Result<(), Error> {
        Ok(self.reader.skip(bit_count)?)
    }

    /// Unsigned Exp-Golomb: count leading zeros, then read that many more
    /// bits; `codeNum = (1 << zeros) - 1 + tail`.
    pub fn ue(&mut self) -> Result<u64, Error> {
        let mut leading_zeros = 0u8;
        while !self.reader.read_bool()? {
            leading_zeros += 1;
            if leading_zeros > 63 {
                failure::bail!("Exp-Golomb code too long");
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let tail = self.reader.read_u64(leading_zeros)?;
        Ok((1u64 << leading_zeros) - 1 + tail)
    }

    /// Signed Exp-Golomb mapping of `ue`.
    pub fn se(&mut self) -> Result<i64, Error> {
        let code_num = self.ue()?;
        if code_num & 1 != 0 {
            Ok(((code_num >> 1) + 1) as i64)
        } else {
            Ok(-((code_num >> 1) as i64))
        }
    }

    /// Bits consumed so far.
    pub fn position(&self) -> u64 {
        self.reader.position()
    }

    /// Discards bits up to the next byte boundary.
    pub fn align(&mut self) -> Result<(), Error> {
        let rem = self.reader.position() % 8;
        if rem != 0 {
            self.reader.skip(8 - rem)?;
        }
        Ok(())
    }

    /// Whether syntax elements remain before `rbsp_trailing_bits()`.
    ///
    /// The remainder holds more data exactly when some bit after the
    /// current position, other than the final stop bit, is set; a
    /// remainder of one 1 bit followed only by 0 bits is the trailer
    /// itself.
    pub fn more_rbsp_data(&self) -> bool {
        let pos = self.reader.position() as usize;
        let total = self.data.len() * 8;
        if pos >= total {
            return false;
        }
        let bit = |i: usize| (self.data[i / 8] >> (7 - (i % 8))) & 1;
        match (pos..total).rev().find(|&i| bit(i) != 0) {
            None => false, // malformed: no stop bit at all
            Some(last_one) => last_one > pos,
        }
    }

    /// Checks and consumes `rbsp_trailing_bits()`.
    pub fn rbsp_trailing_bits(&mut self) -> Result<(), Error> {
        if !self.reader.read_bool()? {
            failure::bail!("rbsp_stop_one_bit is zero");
        }
        self.align()
    }
}

/// Converts EBSP to RBSP: each `00 00 03` becomes `00 00`, dropping the
/// emulation-prevention byte.
pub fn unescape_rbsp(ebsp: &[u8]) -> Vec<u8> {
    let mut rbsp = Vec::with_capacity(ebsp.len());
    let mut i = 0;
    while i < ebsp.len() {
        if i + 2 < ebsp.len() && ebsp[i] == 0 && ebsp[i + 1] == 0 && ebsp[i + 2] == 3 {
            rbsp.push(0);
            rbsp.push(0);
            i += 3;
        } else {
            rbsp.push(ebsp[i]);
            i += 1;
        }
    }
    rbsp
}

#[cfg(test)]
mod tests {
    use super::{unescape_rbsp, NalBits};

    #[test]
    fn exp_golomb() {
        // 1 | 010 | 011 | 00100 | 00101 -> ue: 0, 1, 2, 3, 4
        let data = [0b1_010_011_0, 0b0100_0010, 0b1_0000000];
        let mut r = NalBits::new(&data);
        for expected in 0..5 {
            assert_eq!(r.ue().unwrap(), expected);
        }
    }

    #[test]
    fn signed_exp_golomb() {
        // codeNum 0,1,2,3,4 -> se: 0, 1, -1, 2, -2
        let data = [0b1_010_011_0, 0b0100_0010, 0b1_0000000];
        let mut r = NalBits::new(&data);
        for &expected in &[0i64, 1, -1, 2, -2] {
            assert_eq!(r.se().unwrap(), expected);
        }
    }

    #[test]
    fn emulation_prevention_removal() {
        assert_eq!(
            unescape_rbsp(&[0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x03]),
            &[0x00, 0x00, 0x01, 0x00, 0x00, 0x03]
        );
        // An 0x03 not preceded by two zeros stays put.
        assert_eq!(unescape_rbsp(&[0x00, 0x03, 0x00]), &[0x00, 0x03, 0x00]);
    }

    #[test]
    fn more_rbsp_data_stops_at_trailer() {
        // One flag bit of payload, then the stop bit aligned out.
        let data = [0b1_1000000];
        let mut r = NalBits::new(&data);
        assert!(r.more_rbsp_data());
        r.flag().unwrap();
        assert!(!r.more_rbsp_data());
        r.rbsp_trailing_bits().unwrap();
        assert_eq!(r.position(), 8);
    }
}
