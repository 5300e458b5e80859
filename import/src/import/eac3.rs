//! Enhanced AC-3 importer.
//!
//! One E-AC-3 access unit spans several syncframes: an independent
//! substream 0 frame plus every dependent and higher-numbered substream
//! frame sharing its six audio blocks. See ETSI TS 102 366 V1.2.1 Annex E
//! for the bitstream info syntax and Annex F for `dec3`.

use bytes::{BufMut, Bytes, BytesMut};
use failure::{bail, Error};
use log::warn;
use smallvec::SmallVec;

use super::ac3::{CHANNEL_COUNT_TABLE, SAMPLE_RATE_TABLE};
use super::{RaFlags, Sample, SampleProperty, Status};
use crate::bits::NalBits;
use crate::stream::ByteStream;
use crate::summary::{AudioSummary, CodecSpecific, FourCc, Summary};

/// frmsiz is 11 bits of 16-bit words.
const MAX_SYNCFRAME_LENGTH: usize = 4096;
const MIN_SAMPLE_DURATION: u32 = 256;

const AUDIO_BLOCK_TABLE: [u8; 4] = [1, 2, 3, 6];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct IndependentInfo {
    fscod: u8,
    bsid: u8,
    bsmod: u8,
    acmod: u8,
    lfeon: bool,
    num_dep_sub: u8,
    chan_loc: u16,
}

/// One syncframe's bsi() prefix.
#[derive(Clone, Copy, Debug, Default)]
struct SyncframeInfo {
    strmtyp: u8,
    substreamid: u8,
    frame_size: u32,
    fscod: u8,
    fscod2: u8,
    numblkscod: u8,
    acmod: u8,
    lfeon: bool,
    bsid: u8,
    chanmap: u16,
}

impl SyncframeInfo {
    fn parse(head: &[u8]) -> Result<SyncframeInfo, Error> {
        let mut r = NalBits::new(head);
        if r.get(16)? != 0x0B77 {
            bail!("no E-AC-3 syncword");
        }
        let strmtyp = r.get_u8(2)?;
        if strmtyp == 0x3 {
            bail!("reserved strmtyp");
        }
        let substreamid = r.get_u8(3)?;
        let frmsiz = r.get_u32(11)?;
        let fscod = r.get_u8(2)?;
        let (fscod2, numblkscod) = if fscod == 0x3 {
            let fscod2 = r.get_u8(2)?;
            if fscod2 == 0x3 {
                bail!("reserved fscod2");
            }
            (fscod2, 0x3)
        } else {
            (0, r.get_u8(2)?)
        };
        let acmod = r.get_u8(3)?;
        let lfeon = r.flag()?;
        let bsid = r.get_u8(5)?;
        if !(11..=16).contains(&bsid) {
            bail!("bsid {} is not Enhanced AC-3", bsid);
        }
        r.skip(5)?; // dialnorm
        if r.flag()? {
            r.skip(8)?; // compr
        }
        if acmod == 0x0 {
            r.skip(5)?; // dialnorm2
            if r.flag()? {
                r.skip(8)?; // compr2
            }
        }
        let mut chanmap = 0;
        if strmtyp == 0x1 && r.flag()? {
            chanmap = r.get(16)? as u16;
        }
        Ok(SyncframeInfo {
            strmtyp,
            substreamid,
            frame_size: (frmsiz + 1) * 2,
            fscod,
            fscod2,
            numblkscod,
            acmod,
            lfeon,
            bsid,
            chanmap,
        })
    }

    fn is_independent(&self) -> bool {
        self.strmtyp != 0x1
    }

    fn sample_rate(&self) -> u32 {
        if self.fscod == 0x3 {
            SAMPLE_RATE_TABLE[usize::from(self.fscod2)] / 2
        } else {
            SAMPLE_RATE_TABLE[usize::from(self.fscod)]
        }
    }

    /// Maps the 16-bit custom channel map to the 9-bit `chan_loc` of
    /// `dec3`: chan_loc bit i is chanmap bit 10-i (Lc/Rc down to LFE2).
    fn chan_loc(&self) -> u16 {
        let mut loc = 0;
        for i in 0..9u16 {
            if self.chanmap & (1 << (10 - i)) != 0 {
                loc |= 1 << i;
            }
        }
        loc
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Dec3Parameters {
    data_rate: u32,
    independent: SmallVec<[IndependentInfo; 4]>,
}

impl Dec3Parameters {
    fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        let num_ind_sub = self.independent.len().saturating_sub(1) as u16;
        buf.put_u16(((self.data_rate as u16) << 3) | num_ind_sub as u16 & 0x7);
        for info in &self.independent {
            let mut bits: u32 = u32::from(info.fscod) << 22;
            bits |= u32::from(info.bsid) << 17;
            // one reserved bit, asvc = 0
            bits |= u32::from(info.bsmod) << 12;
            bits |= u32::from(info.acmod) << 9;
            bits |= u32::from(info.lfeon) << 8;
            // three reserved bits
            bits |= u32::from(info.num_dep_sub) << 1;
            if info.num_dep_sub == 0 {
                // final reserved bit stays zero
                buf.put_uint(u64::from(bits), 3);
            } else {
                let with_loc = (u64::from(bits) << 8) | u64::from(info.chan_loc & 0x1FF);
                buf.put_uint(with_loc, 4);
            }
        }
        buf.freeze()
    }

    fn max_channel_count(&self) -> u8 {
        self.independent
            .iter()
            .map(|i| {
                CHANNEL_COUNT_TABLE[usize::from(i.acmod)]
                    + u8::from(i.lfeon)
                    + 2 * i.chan_loc.count_ones() as u8
            })
            .max()
            .unwrap_or(2)
    }
}

pub(crate) struct Eac3Importer {
    status: Status,
    /// The AU ready for delivery.
    au: Vec<u8>,
    incomplete_au: Vec<u8>,
    syncframe_count: u32,
    syncframe_count_in_au: u32,
    number_of_audio_blocks: u32,
    sample_rate: u32,
    params: Dec3Parameters,
    /// Parameters gathered while assembling the AU under construction.
    pending: Dec3Parameters,
    /// Parameters of the most recently completed AU.
    completed: Dec3Parameters,
    next_params: Option<Dec3Parameters>,
    au_number: u32,
}

impl Eac3Importer {
    fn new() -> Eac3Importer {
        Eac3Importer {
            status: Status::Ok,
            au: Vec::new(),
            incomplete_au: Vec::new(),
            syncframe_count: 0,
            syncframe_count_in_au: 0,
            number_of_audio_blocks: 0,
            sample_rate: 0,
            params: Dec3Parameters::default(),
            pending: Dec3Parameters::default(),
            completed: Dec3Parameters::default(),
            next_params: None,
            au_number: 0,
        }
    }

    /// Assembles syncframes into `self.au` until one access unit is
    /// complete. Mirrors one access unit's worth of the syncframe loop.
    fn next_access_unit_internal(&mut self, bs: &mut ByteStream) -> Result<(), Error> {
        let mut au_completed = false;
        while !au_completed {
            // The bsi() prefix we parse spans at most ~12 bytes; 5 is
            // enough to learn the frame size.
            if bs.is_end(5) {
                self.status = Status::Eof;
                au_completed = !self.incomplete_au.is_empty();
                if !au_completed {
                    if !bs.is_end(0) {
                        warn!("the stream is truncated at the end");
                        bail!("truncated E-AC-3 stream");
                    }
                    return Ok(());
                }
                self.finish_au();
                return Ok(());
            }
            let mut head = [0u8; 16];
            for (i, b) in head.iter_mut().enumerate() {
                *b = bs.show_byte(i);
            }
            let info = SyncframeInfo::parse(&head)?;
            let independent = info.is_independent();
            if independent && info.substreamid == 0x0 {
                if self.number_of_audio_blocks == 6 {
                    // First syncframe of the next access unit.
                    self.number_of_audio_blocks = 0;
                    au_completed = true;
                } else if self.number_of_audio_blocks > 6 {
                    bail!("greater than 6 consecutive independent substreams");
                }
                self.number_of_audio_blocks +=
                    u32::from(AUDIO_BLOCK_TABLE[usize::from(info.numblkscod)]);
                if au_completed {
                    self.finish_au();
                }
                self.pending.independent.clear();
                self.sample_rate = info.sample_rate();
                self.pending.data_rate = info.frame_size * 8 * info.sample_rate()
                    / (u32::from(AUDIO_BLOCK_TABLE[usize::from(info.numblkscod)]) * 256)
                    / 1000;
            } else if self.syncframe_count == 0 {
                // The first syncframe in an AU must be independent and
                // assigned substream ID 0.
                bail!("the first syncframe is not an independent substream");
            }
            if independent {
                self.pending.independent.push(IndependentInfo {
                    fscod: info.fscod,
                    bsid: info.bsid,
                    bsmod: 0,
                    acmod: info.acmod,
                    lfeon: info.lfeon,
                    num_dep_sub: 0,
                    chan_loc: 0,
                });
            } else if let Some(last) = self.pending.independent.last_mut() {
                last.num_dep_sub += 1;
                last.chan_loc |= info.chan_loc();
            }
            // Append this syncframe to the AU under construction.
            let frame_size = info.frame_size as usize;
            let start = self.incomplete_au.len();
            self.incomplete_au.resize(start + frame_size, 0);
            if bs.get(&mut self.incomplete_au[start..]) != frame_size {
                bail!("a frame is truncated");
            }
            self.syncframe_count += 1;
            if au_completed && self.status == Status::Eof {
                break;
            }
        }
        Ok(())
    }

    fn finish_au(&mut self) {
        self.au = std::mem::replace(&mut self.incomplete_au, Vec::new());
        self.syncframe_count_in_au = self.syncframe_count;
        self.syncframe_count = 0;
        self.completed = self.pending.clone();
    }
}

fn create_summary(imp: &Eac3Importer) -> Summary {
    Summary::Audio(AudioSummary {
        sample_type: FourCc(*b"ec-3"),
        max_au_length: (imp.syncframe_count_in_au as usize * MAX_SYNCFRAME_LENGTH) as u32,
        frequency: imp.sample_rate,
        channels: imp.params.max_channel_count(),
        sample_size: 16, // no effect
        samples_in_frame: MIN_SAMPLE_DURATION * 6,
        codec_specific: vec![CodecSpecific::Unstructured(imp.params.serialize())],
    })
}

pub(crate) fn probe(bs: &mut ByteStream) -> Result<(Eac3Importer, Summary), Error> {
    if bs.show_byte(0) != 0x0b || bs.show_byte(1) != 0x77 {
        bail!("no E-AC-3 syncword");
    }
    let mut imp = Eac3Importer::new();
    imp.next_access_unit_internal(bs)?;
    if imp.au.is_empty() {
        bail!("no complete E-AC-3 access unit");
    }
    imp.params = imp.completed.clone();
    let summary = create_summary(&imp);
    if imp.status != Status::Eof {
        imp.status = Status::Ok;
    }
    Ok((imp, summary))
}

impl Eac3Importer {
    pub(crate) fn get_access_unit(
        &mut self,
        bs: &mut ByteStream,
        summary: &mut Summary,
    ) -> Result<Option<Sample>, Error> {
        match self.status {
            Status::Error => bail!("E-AC-3 importer in error state"),
            Status::Eof if self.au.is_empty() => return Ok(None),
            _ => {}
        }
        let mut summary_changed = false;
        if self.status == Status::Change {
            if let Some(params) = self.next_params.take() {
                self.params = params;
            }
            *summary = create_summary(self);
            summary_changed = true;
        }
        let mut prop = SampleProperty::default();
        prop.ra_flags = RaFlags::SYNC;
        prop.pre_roll_distance = 1; // MDCT
        let dts = u64::from(self.au_number) * u64::from(MIN_SAMPLE_DURATION * 6);
        self.au_number += 1;
        let sample = Sample {
            data: std::mem::replace(&mut self.au, Vec::new()).into(),
            dts,
            cts: dts,
            prop,
            summary_changed,
        };
        if self.status == Status::Eof {
            return Ok(Some(sample));
        }
        let old_syncframe_count_in_au = self.syncframe_count_in_au;
        if let Err(e) = self.next_access_unit_internal(bs) {
            self.status = Status::Error;
            warn!("failed to assemble the next access unit: {}", e);
            return Ok(Some(sample));
        }
        if self.syncframe_count_in_au > 0 {
            // Check for a sample description change.
            if self.syncframe_count_in_au > old_syncframe_count_in_au
                || self.completed.serialize() != self.params.serialize()
            {
                self.next_params = Some(self.completed.clone());
                self.status = Status::Change;
            } else if self.status != Status::Eof {
                self.status = Status::Ok;
            }
        }
        Ok(Some(sample))
    }

    pub(crate) fn last_delta(&self, _summary: &Summary) -> u32 {
        if self.status != Status::Eof || !self.au.is_empty() {
            return 0;
        }
        MIN_SAMPLE_DURATION * self.number_of_audio_blocks
    }
}

#[cfg(test)]
mod tests {
    use crate::import::Importer;
    use crate::summary::Summary;
    use std::io::Cursor;

    /// One independent substream 0 syncframe: 48 kHz, six audio blocks,
    /// acmod 2 (stereo), 512 bytes.
    fn syncframe() -> Vec<u8> {
        let mut f = vec![0x0B, 0x77];
        // strmtyp=0, substreamid=0, frmsiz=255 -> (255+1)*2 = 512 bytes
        // 00 000 00011111111
        f.push(0b00_000_000);
        f.push(0b11111111);
        // fscod=0, numblkscod=3 (6 blocks), acmod=2, lfeon=0, bsid=16,
        // dialnorm=0, compre=0
        // 00 11 010 0 10000 00000 0
        f.push(0b00_11_010_0);
        f.push(0b10000_000);
        f.push(0b00_0_00000);
        f.resize(512, 0);
        f
    }

    #[test]
    fn aggregates_one_independent_substream() {
        let mut stream = syncframe();
        stream.extend_from_slice(&syncframe());
        let mut imp = Importer::open(Cursor::new(stream), "eac3").unwrap();
        match imp.summary(1).unwrap() {
            Summary::Audio(a) => {
                assert_eq!(a.frequency, 48000);
                assert_eq!(a.channels, 2);
                assert_eq!(a.samples_in_frame, 1536);
                assert_eq!(a.sample_type.0, *b"ec-3");
            }
            _ => panic!("expected audio summary"),
        }
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.data.len(), 512);
        assert_eq!(s.dts, 0);
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.dts, 1536);
        assert!(imp.get_access_unit(1).unwrap().is_none());
        assert_eq!(imp.last_delta(1), 1536);
    }

    #[test]
    fn dec3_shape() {
        let f = syncframe();
        let info = super::SyncframeInfo::parse(&f[0..16]).unwrap();
        assert_eq!(info.frame_size, 512);
        assert_eq!(info.acmod, 2);
        assert_eq!(info.bsid, 16);
        let mut params = super::Dec3Parameters::default();
        params.independent.push(super::IndependentInfo {
            fscod: info.fscod,
            bsid: info.bsid,
            bsmod: 0,
            acmod: info.acmod,
            lfeon: info.lfeon,
            num_dep_sub: 0,
            chan_loc: 0,
        });
        let dec3 = params.serialize();
        assert_eq!(dec3.len(), 5);
        // fscod 0, bsid 16, acmod 2, lfeon 0, no dependents.
        assert_eq!(&dec3[2..], &[0b00_10000_0, 0b0_000_010_0, 0b000_0000_0]);
    }
}
