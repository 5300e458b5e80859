//! AC-3 importer.
//!
//! See ETSI TS 102 366 V1.2.1 (2008-08) for the syncframe syntax and the
//! `dac3` (AC3SpecificBox) layout in its Annex F.

use bytes::{BufMut, Bytes, BytesMut};
use failure::{bail, Error};

use super::{RaFlags, Sample, SampleProperty, Status};
use crate::bits::NalBits;
use crate::stream::ByteStream;
use crate::summary::{AudioSummary, CodecSpecific, FourCc, Summary};

pub(crate) const MAX_SYNCFRAME_LENGTH: usize = 3840;
/// 256 samples per audio block, 6 audio blocks.
const SAMPLE_DURATION: u32 = 1536;

pub(crate) const SAMPLE_RATE_TABLE: [u32; 3] = [48000, 44100, 32000];
pub(crate) const CHANNEL_COUNT_TABLE: [u8; 8] = [2, 1, 2, 3, 3, 4, 4, 5];

/// Syncframe sizes in bytes by `(frmsizecod >> 1, fscod)`.
const FRAME_SIZE_TABLE: [[u32; 3]; 19] = [
    /*  48,  44.1,    32 */
    [128, 138, 192],
    [160, 174, 240],
    [192, 208, 288],
    [224, 242, 336],
    [256, 278, 384],
    [320, 348, 480],
    [384, 416, 576],
    [448, 486, 672],
    [512, 556, 768],
    [640, 696, 960],
    [768, 834, 1152],
    [896, 974, 1344],
    [1024, 1114, 1536],
    [1280, 1392, 1920],
    [1536, 1670, 2304],
    [1792, 1950, 2688],
    [2048, 2228, 3072],
    [2304, 2506, 3456],
    [2560, 2786, 3840],
];

/// The fields of syncinfo() and bsi() that matter to muxing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SyncframeHeader {
    fscod: u8,
    frmsizecod: u8,
    bsid: u8,
    bsmod: u8,
    acmod: u8,
    lfeon: bool,
}

impl SyncframeHeader {
    /// Parses syncinfo() and the head of bsi() from the start of a
    /// syncframe.
    pub(crate) fn parse(head: &[u8]) -> Result<SyncframeHeader, Error> {
        let mut r = NalBits::new(head);
        if r.get(16)? != 0x0B77 {
            bail!("no AC-3 syncword");
        }
        r.skip(16)?; // crc1
        let fscod = r.get_u8(2)?;
        if fscod == 0x3 {
            bail!("reserved fscod");
        }
        let frmsizecod = r.get_u8(6)?;
        if usize::from(frmsizecod >> 1) >= FRAME_SIZE_TABLE.len() {
            bail!("reserved frmsizecod {}", frmsizecod);
        }
        let bsid = r.get_u8(5)?;
        if bsid > 8 {
            // 9 and up belong to other bitstream generations (E-AC-3).
            bail!("bsid {} is not plain AC-3", bsid);
        }
        let bsmod = r.get_u8(3)?;
        let acmod = r.get_u8(3)?;
        if (acmod & 0x1) != 0 && acmod != 0x1 {
            r.skip(2)?; // cmixlev
        }
        if (acmod & 0x4) != 0 {
            r.skip(2)?; // surmixlev
        }
        if acmod == 0x2 {
            r.skip(2)?; // dsurmod
        }
        let lfeon = r.flag()?;
        Ok(SyncframeHeader {
            fscod,
            frmsizecod,
            bsid,
            bsmod,
            acmod,
            lfeon,
        })
    }

    pub(crate) fn frame_size(&self) -> u32 {
        let mut size = FRAME_SIZE_TABLE[usize::from(self.frmsizecod >> 1)][usize::from(self.fscod)];
        // 44.1 kHz frames alternate between two sizes.
        if self.fscod == 0x1 && self.frmsizecod & 0x1 != 0 {
            size += 2;
        }
        size
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE_TABLE[usize::from(self.fscod)]
    }

    fn channel_count(&self) -> u8 {
        CHANNEL_COUNT_TABLE[usize::from(self.acmod)] + u8::from(self.lfeon)
    }

    /// Serializes an AC3SpecificBox payload (`dac3`).
    fn dac3(&self) -> Bytes {
        let mut bits: u32 = u32::from(self.fscod) << 22;
        bits |= u32::from(self.bsid) << 17;
        bits |= u32::from(self.bsmod) << 14;
        bits |= u32::from(self.acmod) << 11;
        bits |= u32::from(self.lfeon) << 10;
        bits |= u32::from(self.frmsizecod >> 1) << 5;
        let mut buf = BytesMut::with_capacity(3);
        buf.put_uint(u64::from(bits), 3);
        buf.freeze()
    }

    /// Whether a header difference forces a new `dac3`.
    fn differs_from(&self, other: &SyncframeHeader) -> bool {
        self.fscod != other.fscod
            || self.bsid != other.bsid
            || self.bsmod != other.bsmod
            || self.acmod != other.acmod
            || self.lfeon != other.lfeon
            || (self.frmsizecod >> 1) != (other.frmsizecod >> 1)
    }
}

fn create_summary(header: &SyncframeHeader) -> Summary {
    Summary::Audio(AudioSummary {
        sample_type: FourCc(*b"ac-3"),
        max_au_length: MAX_SYNCFRAME_LENGTH as u32,
        frequency: header.sample_rate(),
        channels: header.channel_count(),
        sample_size: 16, // no effect
        samples_in_frame: SAMPLE_DURATION,
        codec_specific: vec![CodecSpecific::Unstructured(header.dac3())],
    })
}

/// Peeks enough of the next syncframe to parse its header.
fn show_header(bs: &mut ByteStream) -> [u8; 8] {
    let mut head = [0u8; 8];
    for (i, b) in head.iter_mut().enumerate() {
        *b = bs.show_byte(i);
    }
    head
}

pub(crate) struct Ac3Importer {
    status: Status,
    header: SyncframeHeader,
    au_number: u32,
}

pub(crate) fn probe(bs: &mut ByteStream) -> Result<(Ac3Importer, Summary), Error> {
    if bs.show_byte(0) != 0x0b || bs.show_byte(1) != 0x77 {
        bail!("no AC-3 syncword");
    }
    let header = SyncframeHeader::parse(&show_header(bs))?;
    let summary = create_summary(&header);
    Ok((
        Ac3Importer {
            status: Status::Ok,
            header,
            au_number: 0,
        },
        summary,
    ))
}

impl Ac3Importer {
    pub(crate) fn get_access_unit(
        &mut self,
        bs: &mut ByteStream,
        summary: &mut Summary,
    ) -> Result<Option<Sample>, Error> {
        match self.status {
            Status::Error => bail!("AC-3 importer in error state"),
            Status::Eof => return Ok(None),
            _ => {}
        }
        let mut summary_changed = false;
        if self.status == Status::Change {
            *summary = create_summary(&self.header);
            summary_changed = true;
        }
        let frame_size = self.header.frame_size() as usize;
        let mut data = vec![0u8; frame_size];
        if bs.get(&mut data) != frame_size {
            self.status = Status::Error;
            bail!("truncated AC-3 syncframe");
        }
        let mut prop = SampleProperty::default();
        prop.ra_flags = RaFlags::SYNC;
        prop.pre_roll_distance = 1; // MDCT
        let dts = u64::from(self.au_number) * u64::from(SAMPLE_DURATION);
        self.au_number += 1;
        let sample = Sample {
            data: data.into(),
            dts,
            cts: dts,
            prop,
            summary_changed,
        };

        // Classify the next syncframe, if any.
        if bs.is_end(0) {
            self.status = Status::Eof;
            return Ok(Some(sample));
        }
        if bs.show_byte(0) != 0x0b || bs.show_byte(1) != 0x77 {
            self.status = Status::Error;
            return Ok(Some(sample));
        }
        match SyncframeHeader::parse(&show_header(bs)) {
            Err(_) => self.status = Status::Error,
            Ok(next) => {
                self.status = if next.differs_from(&self.header) {
                    Status::Change
                } else {
                    Status::Ok
                };
                self.header = next;
            }
        }
        Ok(Some(sample))
    }

    pub(crate) fn last_delta(&self, _summary: &Summary) -> u32 {
        if self.status != Status::Eof {
            return 0;
        }
        SAMPLE_DURATION
    }
}

#[cfg(test)]
mod tests {
    use super::SyncframeHeader;
    use crate::import::Importer;
    use crate::summary::Summary;
    use std::io::Cursor;

    /// 48 kHz, 256 kbps (frmsizecod 24), 3/2 + LFE: 1024-byte syncframes.
    fn syncframe() -> Vec<u8> {
        let mut f = vec![0x0B, 0x77, 0x00, 0x00];
        // fscod=0, frmsizecod=24
        f.push(0b00_011000);
        // bsid=8, bsmod=0, acmod=7, cmixlev=0, surmixlev=0, lfeon=1
        f.push(0b01000_000);
        f.push(0b111_00_00_1);
        f.push(0x00);
        f.resize(1024, 0);
        f
    }

    #[test]
    fn header_fields() {
        let f = syncframe();
        let h = SyncframeHeader::parse(&f[0..8]).unwrap();
        assert_eq!(h.frame_size(), 1024);
        assert_eq!(h.sample_rate(), 48000);
        assert_eq!(h.channel_count(), 6);
        let dac3 = h.dac3();
        assert_eq!(dac3.len(), 3);
        // fscod 0, bsid 8, bsmod 0, acmod 7, lfeon 1, bit_rate_code 12.
        assert_eq!(&dac3[..], &[0b00_01000_0, 0b00_111_1_01, 0b100_00000]);
    }

    #[test]
    fn import_one_frame() {
        let mut stream = syncframe();
        stream.extend_from_slice(&syncframe());
        let mut imp = Importer::open(Cursor::new(stream), "ac3").unwrap();
        match imp.summary(1).unwrap() {
            Summary::Audio(a) => {
                assert_eq!(a.frequency, 48000);
                assert_eq!(a.channels, 6);
                assert_eq!(a.samples_in_frame, 1536);
            }
            _ => panic!("expected audio summary"),
        }
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.data.len(), 1024);
        assert_eq!(s.dts, 0);
        assert_eq!(s.prop.pre_roll_distance, 1);
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.dts, 1536);
        assert!(imp.get_access_unit(1).unwrap().is_none());
        assert_eq!(imp.last_delta(1), 1536);
    }
}
