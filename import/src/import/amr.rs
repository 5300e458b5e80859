//! AMR-NB/WB storage format importer.
//!
//! References:
//! *   3GPP TS 26.101 / 26.201 (frame structure)
//! *   3GPP TS 26.244 (3GP storage, `damr` box)
//! *   [RFC 4867](https://www.ietf.org/rfc/rfc4867.txt)

use bytes::{BufMut, BytesMut};
use failure::{bail, Error};
use log::warn;

use super::{RaFlags, Sample, SampleProperty, Status};
use crate::stream::ByteStream;
use crate::summary::{AudioSummary, CodecSpecific, FourCc, Summary};

/// Frame sizes (TOC byte included) by frame type index, AMR-NB then AMR-WB.
/// -1 marks types the file format forbids; 0 marks undefined ones.
const FRAME_SIZE: [[i32; 16]; 2] = [
    [13, 14, 16, 18, 20, 21, 27, 32, 6, -1, -1, -1, 0, 0, 0, 1],
    [18, 24, 33, 37, 41, 47, 51, 59, 61, 6, 0, 0, 0, 0, 1, 1],
];

fn create_damr(wb: bool) -> CodecSpecific {
    let mut buf = BytesMut::with_capacity(9);
    // These fields are specific to each codec vendor, but we're surely not
    // a vendor; write dummy but safe values.
    buf.put_u32(0x20202020); // vendor
    buf.put_u8(0); // decoder_version
    // mode_set covering every frame type that may exist.
    buf.put_u16(if wb { 0xC3FF } else { 0x81FF });
    buf.put_u8(1); // mode_change_period
    buf.put_u8(1); // frames_per_sample
    CodecSpecific::Unstructured(buf.freeze())
}

fn create_summary(wb: bool) -> Summary {
    Summary::Audio(AudioSummary {
        sample_type: FourCc(if wb { *b"sawb" } else { *b"samr" }),
        max_au_length: if wb { 61 } else { 32 },
        frequency: 8000 << u32::from(wb),
        channels: 1, // always single channel
        sample_size: 16,
        samples_in_frame: 160 << u32::from(wb),
        codec_specific: vec![create_damr(wb)],
    })
}

/// Checks the magic for single-channel AMR files: `#!AMR\n` for AMR-NB,
/// `#!AMR-WB\n` for AMR-WB. Returns whether the stream is wideband.
fn check_magic_number(bs: &mut ByteStream) -> Result<bool, Error> {
    let mut magic = [0u8; 6];
    if bs.get(&mut magic) != 6 || &magic[0..5] != b"#!AMR" {
        bail!("no AMR magic number");
    }
    if magic[5] == b'\n' {
        return Ok(false);
    }
    let mut ext = [0u8; 3];
    if magic[5] != b'-' || bs.get(&mut ext) != 3 || &ext != b"WB\n" {
        bail!("malformed AMR magic number");
    }
    Ok(true)
}

pub(crate) struct AmrImporter {
    status: Status,
    wb: bool,
    samples_in_frame: u32,
    au_number: u32,
}

pub(crate) fn probe(bs: &mut ByteStream) -> Result<(AmrImporter, Summary), Error> {
    let wb = check_magic_number(bs)?;
    let summary = create_summary(wb);
    let importer = AmrImporter {
        status: Status::Ok,
        wb,
        samples_in_frame: 160 << u32::from(wb),
        au_number: 0,
    };
    Ok((importer, summary))
}

impl AmrImporter {
    pub(crate) fn get_access_unit(
        &mut self,
        bs: &mut ByteStream,
        _summary: &mut Summary,
    ) -> Result<Option<Sample>, Error> {
        match self.status {
            Status::Error => bail!("AMR importer in error state"),
            Status::Eof => return Ok(None),
            _ => {}
        }
        if bs.is_end(0) {
            self.status = Status::Eof;
            return Ok(None);
        }
        // Each speech frame is one TOC byte `P|FT(4)|Q|P|P` plus the speech
        // data, octet-aligned. FT determines the total size.
        let ft = (bs.show_byte(0) >> 3) & 0x0F;
        let read_size = FRAME_SIZE[usize::from(self.wb)][usize::from(ft)];
        if read_size <= 0 {
            self.status = Status::Error;
            bail!(
                "an {} speech frame is detected",
                if read_size < 0 { "invalid" } else { "unknown" }
            );
        }
        let read_size = read_size as usize;
        let mut data = vec![0u8; read_size];
        if bs.get(&mut data) != read_size {
            warn!("the stream is truncated at the end");
            self.status = Status::Eof;
            bail!("truncated AMR speech frame");
        }
        let mut prop = SampleProperty::default();
        prop.ra_flags = RaFlags::SYNC;
        let dts = u64::from(self.au_number) * u64::from(self.samples_in_frame);
        self.au_number += 1;
        Ok(Some(Sample {
            data: data.into(),
            dts,
            cts: dts,
            prop,
            summary_changed: false,
        }))
    }

    pub(crate) fn last_delta(&self, _summary: &Summary) -> u32 {
        self.samples_in_frame
    }
}

#[cfg(test)]
mod tests {
    use crate::import::Importer;
    use crate::summary::Summary;
    use std::io::Cursor;

    #[test]
    fn narrowband() {
        let mut stream = b"#!AMR\n".to_vec();
        // FT=0 (4.75 kbps): 13 bytes including the TOC byte.
        stream.push(0x04);
        stream.extend(std::iter::repeat(0u8).take(12));
        let mut imp = Importer::open(Cursor::new(stream), "amr").unwrap();
        match imp.summary(1).unwrap() {
            Summary::Audio(a) => {
                assert_eq!(a.frequency, 8000);
                assert_eq!(a.samples_in_frame, 160);
                assert_eq!(a.sample_type.0, *b"samr");
            }
            _ => panic!("expected audio summary"),
        }
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.data.len(), 13);
        assert!(imp.get_access_unit(1).unwrap().is_none());
        assert_eq!(imp.last_delta(1), 160);
    }

    #[test]
    fn wideband_magic() {
        let mut stream = b"#!AMR-WB\n".to_vec();
        stream.push(0x04); // FT=0: 18 bytes
        stream.extend(std::iter::repeat(0u8).take(17));
        let mut imp = Importer::open(Cursor::new(stream), "amr").unwrap();
        match imp.summary(1).unwrap() {
            Summary::Audio(a) => {
                assert_eq!(a.frequency, 16000);
                assert_eq!(a.sample_type.0, *b"sawb");
            }
            _ => panic!("expected audio summary"),
        }
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.data.len(), 18);
    }

    #[test]
    fn forbidden_frame_type() {
        let mut stream = b"#!AMR\n".to_vec();
        stream.push(9 << 3); // FT=9: forbidden in the file format
        stream.push(0);
        let mut imp = Importer::open(Cursor::new(stream), "amr").unwrap();
        assert!(imp.get_access_unit(1).is_err());
    }
}
