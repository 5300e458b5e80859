//! DTS Coherent Acoustics importer.
//!
//! References:
//! *   ETSI TS 102 114 V1.2.1 (2002-12), V1.3.1 (2011-08), V1.4.1 (2012-09)
//!
//! A DTS access unit is one core substream frame plus the extension
//! substream frames that follow it; the next core frame, or an extension
//! whose index does not increase, starts a new access unit.

use bytes::{BufMut, Bytes, BytesMut};
use failure::{bail, Error};
use log::warn;
use smallvec::SmallVec;

use super::{RaFlags, Sample, SampleProperty, Status};
use crate::bits::NalBits;
use crate::stream::ByteStream;
use crate::summary::{AudioSummary, CodecSpecific, FourCc, Summary};

const SYNC_CORE: u32 = 0x7FFE_8001;
const SYNC_EXSS: u32 = 0x6458_2025;
/// Sync markers of extension assets we care to recognize inside an
/// extension substream.
const SYNC_LBR: u32 = 0x0A80_1921;
const SYNC_XLL: u32 = 0x41A2_9547;

const MAX_CORE_SIZE: u32 = 16384;
const MAX_EXSS_SIZE: u32 = 32768;
const MAX_NUM_EXSS: u32 = 4;

/// Core SFREQ index to sampling frequency; 0 marks invalid codes.
const CORE_FREQUENCY_TABLE: [u32; 16] = [
    0, 8000, 16000, 32000, 0, 0, 11025, 22050, 44100, 0, 0, 12000, 24000, 48000, 0, 0,
];

/// Channel counts by AMODE for the representable modes.
const CHANNEL_COUNT_TABLE: [u8; 10] = [1, 2, 2, 2, 2, 3, 3, 4, 4, 5];

/// `ddts` ChannelLayout masks by AMODE: C, L/R, Ls/Rs bits.
const CHANNEL_LAYOUT_TABLE: [u16; 10] = [
    0x0001, 0x0002, 0x0002, 0x0002, 0x0002, 0x0003, 0x0003, 0x0006, 0x0006, 0x0007,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubstreamType {
    Core,
    Extension,
}

#[derive(Clone, Copy, Debug, Default)]
struct CoreHeader {
    nblks: u8,
    frame_size: u32,
    amode: u8,
    sfreq: u8,
    lff: bool,
    pcmr: u8,
}

impl CoreHeader {
    fn parse(head: &[u8]) -> Result<CoreHeader, Error> {
        let mut r = NalBits::new(head);
        if r.get(32)? != u64::from(SYNC_CORE) {
            bail!("no DTS core syncword");
        }
        r.skip(1)?; // FTYPE
        r.skip(5)?; // SHORT
        let cpf = r.flag()?;
        let nblks = r.get_u8(7)?;
        if nblks < 5 {
            bail!("invalid NBLKS");
        }
        let fsize = r.get_u32(14)?;
        if fsize < 95 {
            bail!("invalid FSIZE");
        }
        let amode = r.get_u8(6)?;
        if usize::from(amode) >= CHANNEL_COUNT_TABLE.len() {
            bail!("unsupported AMODE {}", amode);
        }
        let sfreq = r.get_u8(4)?;
        if CORE_FREQUENCY_TABLE[usize::from(sfreq)] == 0 {
            bail!("invalid SFREQ");
        }
        r.skip(5)?; // RATE
        r.skip(1)?; // FixedBit
        r.skip(1)?; // DYNF
        r.skip(1)?; // TIMEF
        r.skip(1)?; // AUXF
        r.skip(1)?; // HDCD
        r.skip(3)?; // EXT_AUDIO_ID
        r.skip(1)?; // EXT_AUDIO
        r.skip(1)?; // ASPF
        let lff = r.get_u8(2)? != 0;
        r.skip(1)?; // HFLAG
        if cpf {
            r.skip(16)?; // HCRC
        }
        r.skip(1)?; // FILTS
        r.skip(4)?; // VERNUM
        r.skip(2)?; // CHIST
        let pcmr = r.get_u8(3)?;
        Ok(CoreHeader {
            nblks,
            frame_size: fsize + 1,
            amode,
            sfreq,
            lff,
            pcmr,
        })
    }

    fn sample_rate(&self) -> u32 {
        CORE_FREQUENCY_TABLE[usize::from(self.sfreq)]
    }

    /// PCM samples per frame at the core sampling frequency.
    fn frame_duration(&self) -> u32 {
        (u32::from(self.nblks) + 1) * 32
    }

    fn pcm_sample_depth(&self) -> u8 {
        match self.pcmr {
            0 | 1 => 16,
            2 | 3 => 20,
            5 | 6 => 24,
            _ => 16,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ExtensionHeader {
    index: u8,
    frame_size: u32,
}

impl ExtensionHeader {
    fn parse(head: &[u8]) -> Result<ExtensionHeader, Error> {
        let mut r = NalBits::new(head);
        if r.get(32)? != u64::from(SYNC_EXSS) {
            bail!("no DTS extension substream syncword");
        }
        r.skip(8)?; // UserDefinedBits
        let index = r.get_u8(2)?;
        let wide = r.flag()?; // bHeaderSizeType
        let (header_bits, fsize_bits) = if wide { (12, 20) } else { (8, 16) };
        r.skip(header_bits)?; // nuExtSSHeaderSize
        let frame_size = r.get_u32(fsize_bits as u8)? + 1;
        Ok(ExtensionHeader { index, frame_size })
    }
}

fn substream_type(bs: &mut ByteStream) -> Option<SubstreamType> {
    match bs.show_be32(0) {
        SYNC_CORE => Some(SubstreamType::Core),
        SYNC_EXSS => Some(SubstreamType::Extension),
        _ => None,
    }
}

/// Extension-asset flags recovered by scanning a substream's payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct ExtensionFlags {
    lbr: bool,
    xll: bool,
}

fn scan_extension_assets(frame: &[u8]) -> ExtensionFlags {
    let mut flags = ExtensionFlags::default();
    for w in frame.windows(4) {
        match u32::from_be_bytes([w[0], w[1], w[2], w[3]]) {
            SYNC_LBR => flags.lbr = true,
            SYNC_XLL => flags.xll = true,
            _ => {}
        }
    }
    flags
}

pub(crate) struct DtsImporter {
    status: Status,
    core: CoreHeader,
    flags: ExtensionFlags,
    exss_count: u32,
    au: Vec<u8>,
    incomplete_au: Vec<u8>,
    /// Indices of extension substreams seen in the AU under construction.
    exss_indices: SmallVec<[u8; 4]>,
    au_number: u32,
}

impl DtsImporter {
    fn new() -> DtsImporter {
        DtsImporter {
            status: Status::Ok,
            core: CoreHeader::default(),
            flags: ExtensionFlags::default(),
            exss_count: 0,
            au: Vec::new(),
            incomplete_au: Vec::new(),
            exss_indices: SmallVec::new(),
            au_number: 0,
        }
    }

    fn next_access_unit_internal(&mut self, bs: &mut ByteStream) -> Result<(), Error> {
        let mut au_completed = false;
        let mut prev_exss_index: Option<u8> = self.exss_indices.last().copied();
        while !au_completed {
            // 10 bytes are enough to learn any substream's frame size.
            if bs.is_end(10) {
                self.status = Status::Eof;
                au_completed = !self.incomplete_au.is_empty();
                if !au_completed {
                    if !bs.is_end(0) {
                        warn!("the stream is truncated at the end");
                        bail!("truncated DTS stream");
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
            let frame_size;
            match substream_type(bs) {
                Some(SubstreamType::Core) => {
                    if !self.incomplete_au.is_empty() {
                        au_completed = true;
                        self.finish_au();
                    }
                    let core = CoreHeader::parse(&head)?;
                    self.core = core;
                    frame_size = core.frame_size;
                    prev_exss_index = None;
                }
                Some(SubstreamType::Extension) => {
                    let ext = ExtensionHeader::parse(&head)?;
                    if ext.frame_size > MAX_EXSS_SIZE {
                        bail!("oversized extension substream");
                    }
                    if let Some(prev) = prev_exss_index {
                        if ext.index <= prev {
                            // The next AU begins with this substream.
                            au_completed = true;
                            self.finish_au();
                        }
                    }
                    if self.incomplete_au.is_empty() && !au_completed && self.au_number == 0
                        && self.au.is_empty()
                    {
                        // The stream leads with an extension substream;
                        // without a core we can't derive the timing.
                        bail!("extension substream without a preceding core is unsupported");
                    }
                    frame_size = ext.frame_size;
                    prev_exss_index = Some(ext.index);
                    if !self.exss_indices.contains(&ext.index)
                        && self.exss_indices.len() < MAX_NUM_EXSS as usize
                    {
                        self.exss_indices.push(ext.index);
                    }
                }
                None => bail!("unknown substream type is detected"),
            }
            let start = self.incomplete_au.len();
            self.incomplete_au.resize(start + frame_size as usize, 0);
            if bs.get(&mut self.incomplete_au[start..]) != frame_size as usize {
                bail!("failed to read a frame");
            }
            if matches!(substream_type_of(&self.incomplete_au[start..]), Some(SubstreamType::Extension)) {
                let f = scan_extension_assets(&self.incomplete_au[start..]);
                self.flags.lbr |= f.lbr;
                self.flags.xll |= f.xll;
            }
            if au_completed && self.status == Status::Eof {
                break;
            }
        }
        Ok(())
    }

    fn finish_au(&mut self) {
        self.au = std::mem::replace(&mut self.incomplete_au, Vec::new());
        self.exss_count = self.exss_indices.len() as u32;
        self.exss_indices.clear();
    }

    /// Serializes a DTSSpecificBox payload (`ddts`).
    fn ddts(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(20);
        buf.put_u32(self.core.sample_rate()); // DTSSamplingFrequency
        buf.put_u32(0); // maxBitrate: unknown
        buf.put_u32(0); // avgBitrate: variable
        buf.put_u8(self.core.pcm_sample_depth());
        let frame_duration_code: u8 = match self.core.frame_duration() {
            512 => 0,
            1024 => 1,
            2048 => 2,
            4096 => 3,
            _ => 1,
        };
        // StreamConstruction distinguishes which substreams and assets are
        // present; the common shapes are enough here.
        let stream_construction: u8 = if self.exss_count == 0 {
            1 // core substream only
        } else if self.flags.xll {
            10 // core + XLL in extension substream
        } else if self.flags.lbr {
            9 // core + LBR in extension substream
        } else {
            6 // core + extension substream
        };
        let core_layout = self.core.amode;
        let core_size = self.core.frame_size.min((1 << 14) - 1);
        let channel_layout = CHANNEL_LAYOUT_TABLE[usize::from(self.core.amode)]
            | if self.core.lff { 0x0008 } else { 0 };
        let mut bits: u64 = u64::from(frame_duration_code);
        bits = (bits << 5) | u64::from(stream_construction);
        bits = (bits << 1) | u64::from(self.core.lff); // CoreLFEPresent
        bits = (bits << 6) | u64::from(core_layout);
        bits = (bits << 14) | u64::from(core_size);
        bits = (bits << 1) | 0; // StereoDownmix
        bits = (bits << 3) | 0; // RepresentationType
        bits = (bits << 16) | u64::from(channel_layout);
        bits <<= 1; // MultiAssetFlag
        bits <<= 1; // LBRDurationMod
        bits <<= 1; // ReservedBoxPresent
        bits <<= 5; // Reserved
        buf.put_uint(bits, 7);
        buf.freeze()
    }

    fn coding_name(&self) -> FourCc {
        if self.exss_count == 0 {
            FourCc(*b"dtsc")
        } else if self.flags.xll {
            FourCc(*b"dtsl")
        } else if self.flags.lbr {
            FourCc(*b"dtse")
        } else {
            FourCc(*b"dtsh")
        }
    }

    /// The track frequency folds multiples down to the base rates.
    fn summary_frequency(&self) -> u32 {
        match self.core.sample_rate() {
            12000 | 24000 | 48000 | 96000 | 192000 | 384000 => 48000,
            22050 | 44100 | 88200 | 176400 | 352800 => 44100,
            8000 | 16000 | 32000 | 64000 | 128000 => 32000,
            _ => 0,
        }
    }

    fn samples_in_frame(&self) -> u32 {
        self.summary_frequency() * self.core.frame_duration() / self.core.sample_rate()
    }
}

fn substream_type_of(frame: &[u8]) -> Option<SubstreamType> {
    if frame.len() < 4 {
        return None;
    }
    match u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) {
        SYNC_CORE => Some(SubstreamType::Core),
        SYNC_EXSS => Some(SubstreamType::Extension),
        _ => None,
    }
}

fn create_summary(imp: &DtsImporter) -> Summary {
    Summary::Audio(AudioSummary {
        sample_type: imp.coding_name(),
        max_au_length: MAX_CORE_SIZE + MAX_NUM_EXSS * MAX_EXSS_SIZE,
        frequency: imp.summary_frequency(),
        channels: CHANNEL_COUNT_TABLE[usize::from(imp.core.amode)] + u8::from(imp.core.lff),
        sample_size: u16::from(imp.core.pcm_sample_depth()),
        samples_in_frame: imp.samples_in_frame(),
        codec_specific: vec![CodecSpecific::Unstructured(imp.ddts())],
    })
}

pub(crate) fn probe(bs: &mut ByteStream) -> Result<(DtsImporter, Summary), Error> {
    if bs.show_be32(0) != SYNC_CORE {
        bail!("no DTS core syncword");
    }
    let mut imp = DtsImporter::new();
    imp.next_access_unit_internal(bs)?;
    if imp.au.is_empty() {
        bail!("no complete DTS access unit");
    }
    let summary = create_summary(&imp);
    if imp.status != Status::Eof {
        imp.status = Status::Ok;
    }
    Ok((imp, summary))
}

impl DtsImporter {
    pub(crate) fn get_access_unit(
        &mut self,
        bs: &mut ByteStream,
        summary: &mut Summary,
    ) -> Result<Option<Sample>, Error> {
        match self.status {
            Status::Error => bail!("DTS importer in error state"),
            Status::Eof if self.au.is_empty() => return Ok(None),
            _ => {}
        }
        let mut summary_changed = false;
        if self.status == Status::Change {
            *summary = create_summary(self);
            summary_changed = true;
        }
        let samples_in_frame = match &*summary {
            Summary::Audio(a) => a.samples_in_frame,
            _ => unreachable!(),
        };
        let mut prop = SampleProperty::default();
        prop.ra_flags = RaFlags::SYNC;
        if self.flags.lbr {
            prop.pre_roll_distance = 1; // MDCT
        }
        let dts = u64::from(self.au_number) * u64::from(samples_in_frame);
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
        let old_exss_count = self.exss_count;
        let old_name = self.coding_name();
        if let Err(e) = self.next_access_unit_internal(bs) {
            warn!("failed to assemble the next access unit: {}", e);
            self.status = Status::Error;
            return Ok(Some(sample));
        }
        if self.exss_count != old_exss_count || self.coding_name() != old_name {
            self.status = Status::Change;
        } else if self.status != Status::Eof {
            self.status = Status::Ok;
        }
        Ok(Some(sample))
    }

    pub(crate) fn last_delta(&self, summary: &Summary) -> u32 {
        if self.status != Status::Eof || !self.au.is_empty() {
            return 0;
        }
        match summary {
            Summary::Audio(a) => a.samples_in_frame,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::import::Importer;
    use crate::summary::Summary;
    use std::io::Cursor;

    /// One core frame: 48 kHz, 512 samples (NBLKS 15), stereo (AMODE 1),
    /// 512-byte frames, no CRC.
    fn core_frame() -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&0x7FFE_8001u32.to_be_bytes());
        // FTYPE=1 SHORT=11111 CPF=0 NBLKS=0001111
        f.push(0b1_11111_0_0);
        f.push(0b001111_00); // NBLKS low bits, FSIZE high bits
        // FSIZE=511 (0b00000111111111): remaining 12 bits
        f.push(0b00011111);
        f.push(0b1111_0000); // FSIZE done; AMODE=000001 begins (high 4 bits 0000)
        // AMODE low 2 bits = 01, SFREQ=1101 (48 kHz), RATE high 2 bits
        f.push(0b01_1101_00);
        f.resize(512, 0);
        f
    }

    #[test]
    fn core_only_stream() {
        let mut stream = core_frame();
        stream.extend_from_slice(&core_frame());
        let mut imp = Importer::open(Cursor::new(stream), "dts").unwrap();
        match imp.summary(1).unwrap() {
            Summary::Audio(a) => {
                assert_eq!(a.sample_type.0, *b"dtsc");
                assert_eq!(a.frequency, 48000);
                assert_eq!(a.channels, 2);
                assert_eq!(a.samples_in_frame, 512);
            }
            _ => panic!("expected audio summary"),
        }
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.data.len(), 512);
        assert_eq!(s.dts, 0);
        assert_eq!(s.prop.pre_roll_distance, 0);
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.dts, 512);
        assert!(imp.get_access_unit(1).unwrap().is_none());
        assert_eq!(imp.last_delta(1), 512);
    }

    #[test]
    fn ddts_shape() {
        let stream = core_frame();
        let mut imp = Importer::open(Cursor::new(stream), "dts").unwrap();
        let _ = imp.get_access_unit(1).unwrap();
        match imp.summary(1).unwrap() {
            Summary::Audio(a) => {
                let ddts = match &a.codec_specific[0] {
                    crate::summary::CodecSpecific::Unstructured(b) => b,
                    _ => panic!("expected unstructured blob"),
                };
                assert_eq!(ddts.len(), 20);
                assert_eq!(&ddts[0..4], &48000u32.to_be_bytes());
                assert_eq!(ddts[12], 16); // pcmSampleDepth
            }
            _ => panic!("expected audio summary"),
        }
    }
}
