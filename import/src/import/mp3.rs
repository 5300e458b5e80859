//! MPEG-1/2 audio (Layer I/II/III) importer, via the MPEG-4 Systems
//! legacy interface: samples are whole frames, header included.
//!
//! See ISO/IEC 11172-3 and ISO/IEC 13818-3 for the frame syntax.

use failure::{bail, Error};

use super::{RaFlags, Sample, SampleProperty, Status};
use crate::stream::ByteStream;
use crate::summary::{AudioSummary, CodecSpecific, FourCc, Summary};

const HEADER_LENGTH: usize = 4;
const MAX_FRAME_LENGTH: u32 = 1152 * (16 / 8) * 2;

const LAYER_III: u8 = 0x1;
const LAYER_II: u8 = 0x2;
const LAYER_I: u8 = 0x3;

/// Frequencies by `(ID, sampling_frequency)`: MPEG-2 BC then MPEG-1.
const FREQUENCY_TABLE: [[u32; 3]; 2] = [[22050, 24000, 16000], [44100, 48000, 32000]];

const BITRATE_TABLE: [[[u32; 16]; 3]; 2] = [
    [
        // MPEG-2 BC audio
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0], // Layer III
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0], // Layer II
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256, 0], // Layer I
    ],
    [
        // MPEG-1 audio
        [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0], // Layer III
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 0], // Layer II
        [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448, 0], // Layer I
    ],
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Header {
    id: u8,
    layer: u8,
    protection_bit: u8,
    bitrate_index: u8,
    sampling_frequency: u8,
    padding_bit: u8,
    mode: u8,
}

impl Header {
    fn parse(buf: &[u8; 4]) -> Result<Header, Error> {
        let data = u32::from_be_bytes(*buf);
        // The last syncword bit distinguishes what is called MPEG-2.5,
        // which we don't consider.
        let syncword = (data >> 20) & 0xFFF;
        if syncword != 0xFFF {
            bail!("no MPEG audio syncword");
        }
        let header = Header {
            id: ((data >> 19) & 0x1) as u8,
            layer: ((data >> 17) & 0x3) as u8,
            protection_bit: ((data >> 16) & 0x1) as u8,
            bitrate_index: ((data >> 12) & 0xF) as u8,
            sampling_frequency: ((data >> 10) & 0x3) as u8,
            padding_bit: ((data >> 9) & 0x1) as u8,
            mode: ((data >> 6) & 0x3) as u8,
        };
        let emphasis = (data & 0x3) as u8;
        if header.layer == 0 {
            bail!("reserved layer");
        }
        if header.bitrate_index == 0 || header.bitrate_index == 0xF {
            // "free" bitrate needs a frame-size derivation we don't have.
            bail!("unsupported bitrate_index {}", header.bitrate_index);
        }
        if header.sampling_frequency == 0x3 {
            bail!("reserved sampling_frequency");
        }
        if emphasis == 0x2 {
            bail!("reserved emphasis");
        }
        Ok(header)
    }

    fn is_2ch(&self) -> bool {
        self.mode != 3
    }

    fn samples_in_frame(&self) -> u32 {
        if self.layer == LAYER_I {
            384
        } else if self.id == 1 || self.layer == LAYER_II {
            1152
        } else {
            576
        }
    }

    fn frame_size(&self) -> u32 {
        let bitrate =
            BITRATE_TABLE[usize::from(self.id)][usize::from(self.layer - 1)][usize::from(self.bitrate_index)];
        let frequency = FREQUENCY_TABLE[usize::from(self.id)][usize::from(self.sampling_frequency)];
        if self.layer == LAYER_I {
            // Layer I's slot is 4 bytes; see ISO/IEC 11172-3, Audio Sequence General.
            (12 * 1000 * bitrate / frequency + u32::from(self.padding_bit)) * 4
        } else {
            // Layer II/III slots are single bytes.
            let mut div = frequency;
            if self.layer == LAYER_III && self.id == 0 {
                div <<= 1;
            }
            144 * 1000 * bitrate / div + u32::from(self.padding_bit)
        }
    }

    fn side_info_size(&self) -> usize {
        if self.id == 1 {
            if self.is_2ch() {
                32
            } else {
                17
            }
        } else if self.is_2ch() {
            17
        } else {
            9
        }
    }

    /// Offset of side info within a frame: header plus the CRC when present.
    fn side_info_pos(&self) -> usize {
        if self.protection_bit != 0 {
            4
        } else {
            6
        }
    }
}

fn create_summary(header: &Header) -> Summary {
    Summary::Audio(AudioSummary {
        sample_type: FourCc(*b"mp4a"),
        max_au_length: MAX_FRAME_LENGTH,
        frequency: FREQUENCY_TABLE[usize::from(header.id)][usize::from(header.sampling_frequency)],
        channels: if header.is_2ch() { 2 } else { 1 },
        sample_size: 16,
        samples_in_frame: header.samples_in_frame(),
        codec_specific: vec![CodecSpecific::Mp4sysDecoderConfig {
            // The legacy interface signals the codec by objectTypeIndication
            // alone; no DecoderSpecificInfo.
            object_type_indication: if header.id != 0 { 0x6B } else { 0x69 },
            decoder_specific_info: bytes::Bytes::new(),
        }],
    })
}

pub(crate) struct Mp3Importer {
    status: Status,
    header: Header,
    raw_header: [u8; HEADER_LENGTH],
    samples_in_frame: u32,
    au_number: u32,
    /// Sizes of main_data of the last 32 frames, most recent first.
    main_data_size: [u16; 32],
    /// Number of dependent frames of the *previous* frame.
    prev_preroll_count: u16,
    enc_delay: u16,
    padding: u16,
    valid_samples: u64,
}

pub(crate) fn probe(bs: &mut ByteStream) -> Result<(Mp3Importer, Summary), Error> {
    // Skip a leading ID3v2 tag: 7 bits per size byte.
    if bs.show_byte(0) == b'I' && bs.show_byte(1) == b'D' && bs.show_byte(2) == b'3' {
        let mut size = 0u32;
        for i in 6..10 {
            size = (size << 7) | u32::from(bs.show_byte(i) & 0x7F);
        }
        bs.skip(10 + size as usize);
    }
    let mut buf = [0u8; HEADER_LENGTH];
    if bs.get(&mut buf) != HEADER_LENGTH {
        bail!("stream shorter than an MPEG audio header");
    }
    let header = Header::parse(&buf)?;
    let summary = create_summary(&header);
    let importer = Mp3Importer {
        status: Status::Ok,
        header,
        raw_header: buf,
        samples_in_frame: header.samples_in_frame(),
        au_number: 0,
        main_data_size: [0; 32],
        prev_preroll_count: 0,
        enc_delay: 0,
        padding: 0,
        valid_samples: 0,
    };
    Ok((importer, summary))
}

impl Mp3Importer {
    /// Detects a Xing/Info VBR header in the first frame, extracting the
    /// valid-samples count and LAME encoder delay/padding when present.
    fn parse_xing_info_header(&mut self, frame: &[u8]) -> bool {
        let mdp = self.header.side_info_pos() + self.header.side_info_size();
        if frame.len() < mdp + 8 {
            return false;
        }
        if &frame[mdp..mdp + 4] != b"Info" && &frame[mdp..mdp + 4] != b"Xing" {
            return false;
        }
        let flags = u32::from_be_bytes([frame[mdp + 4], frame[mdp + 5], frame[mdp + 6], frame[mdp + 7]]);
        let mut off = mdp + 8;
        let mut frame_count = 0u32;
        if flags & 1 != 0 {
            if frame.len() < off + 4 {
                return true;
            }
            frame_count = u32::from_be_bytes([frame[off], frame[off + 1], frame[off + 2], frame[off + 3]]);
            self.valid_samples = u64::from(frame_count) * u64::from(self.header.samples_in_frame());
            off += 4;
        }
        if flags & 2 != 0 {
            off += 4; // file size
        }
        if flags & 4 != 0 {
            off += 100; // TOC
        }
        if flags & 8 != 0 {
            off += 4; // VBR quality
        }
        if frame.len() > off + 24 && frame[off] == b'L' {
            // LAME header present
            let v = (u32::from(frame[off + 21]) << 16)
                | (u32::from(frame[off + 22]) << 8)
                | u32::from(frame[off + 23]);
            self.enc_delay = (v >> 12) as u16;
            self.padding = (v & 0xfff) as u16;
            if frame_count != 0 {
                self.valid_samples -= u64::from(self.enc_delay) + u64::from(self.padding);
            }
        }
        true
    }

    fn parse_vbri_header(&self, frame: &[u8]) -> bool {
        frame.len() >= 40 && &frame[36..40] == b"VBRI"
    }

    pub(crate) fn get_access_unit(
        &mut self,
        bs: &mut ByteStream,
        summary: &mut Summary,
    ) -> Result<Option<Sample>, Error> {
        loop {
            match self.status {
                Status::Error => bail!("MPEG audio importer in error state"),
                Status::Eof => return Ok(None),
                _ => {}
            }
            let frame_size = self.header.frame_size();
            if frame_size <= 4 {
                bail!("absurd frame size {}", frame_size);
            }
            let mut summary_changed = false;
            if self.status == Status::Change {
                *summary = create_summary(&self.header);
                if let Summary::Audio(a) = &*summary {
                    self.samples_in_frame = a.samples_in_frame;
                }
                summary_changed = true;
            }
            // Read one frame, keeping the 4 header bytes inside the sample.
            let mut data = vec![0u8; frame_size as usize];
            data[..HEADER_LENGTH].copy_from_slice(&self.raw_header);
            let body = frame_size as usize - HEADER_LENGTH;
            if bs.get(&mut data[HEADER_LENGTH..]) != body {
                self.status = Status::Error;
                bail!("truncated MPEG audio frame");
            }
            let mut prop = SampleProperty::default();
            prop.ra_flags = RaFlags::SYNC;
            if self.header.layer == LAYER_III {
                prop.pre_roll_distance = 1; // Layer III uses MDCT
            }
            let dts = u64::from(self.au_number) * u64::from(self.samples_in_frame);
            self.au_number += 1;

            let mut vbr_header_present = false;
            if self.au_number == 1
                && (self.parse_xing_info_header(&data) || self.parse_vbri_header(&data))
            {
                vbr_header_present = true;
                self.au_number -= 1;
            }

            // Track inter-frame dependency introduced by the bit reservoir.
            if !vbr_header_present && self.header.layer == LAYER_III {
                let sip = self.header.side_info_pos();
                let mut main_data_begin = u32::from(data[sip]);
                if self.header.id == 1 {
                    main_data_begin = (main_data_begin << 1) | u32::from(data[sip + 1] >> 7);
                }
                if main_data_begin > 0 {
                    // main_data_begin points back at the start of this
                    // frame's reservoir data; add up history until covered.
                    let mut reservoir_data = 0u32;
                    let mut i = 0;
                    while i < 32 && reservoir_data < main_data_begin {
                        reservoir_data += u32::from(self.main_data_size[i]);
                        if self.main_data_size[i] == 0 {
                            break;
                        }
                        i += 1;
                    }
                    prop.pre_roll_distance += u32::from(self.prev_preroll_count);
                    self.prev_preroll_count = i as u16;
                }
                let side_info_size = self.header.side_info_size();
                // Push this frame's main_data size onto the history.
                self.main_data_size.copy_within(0..31, 1);
                self.main_data_size[0] =
                    body.saturating_sub(sip).saturating_sub(side_info_size) as u16;
            }
            let sample = Sample {
                data: data.into(),
                dts,
                cts: dts,
                prop,
                summary_changed,
            };

            // Pre-parse the next header.
            let mut buf = [0u8; HEADER_LENGTH];
            let n = bs.get(&mut buf);
            if n == 0
                || (n >= 2 && (&buf[0..2] == b"TA" || &buf[0..2] == b"AP")) // ID3v1 or APE tag
                || (n == 1 && buf[0] == 0x00) // SCMPX's Layer I padding quirk
            {
                self.status = Status::Eof;
            } else if n != HEADER_LENGTH {
                self.status = Status::Error;
            } else {
                match Header::parse(&buf) {
                    Err(_) => self.status = Status::Error,
                    Ok(new_header) => {
                        self.raw_header = buf;
                        if self.header.layer != new_header.layer // object_type_indication change
                            || self.header.sampling_frequency != new_header.sampling_frequency
                        {
                            self.status = Status::Error;
                        } else if self.header.is_2ch() != new_header.is_2ch() {
                            self.status = Status::Change;
                        } else {
                            self.status = Status::Ok;
                        }
                        self.header = new_header;
                    }
                }
            }
            if vbr_header_present {
                // The Xing/Info frame itself carries no audio; deliver the
                // following frame instead.
                continue;
            }
            return Ok(Some(sample));
        }
    }

    pub(crate) fn last_delta(&self, _summary: &Summary) -> u32 {
        if self.status != Status::Eof {
            return 0;
        }
        self.samples_in_frame
    }
}

#[cfg(test)]
mod tests {
    use crate::import::Importer;
    use crate::summary::Summary;
    use std::io::Cursor;

    /// Layer III, MPEG-1, 44.1 kHz, 128 kbps, stereo, no padding:
    /// 144 * 128000 / 44100 = 417-byte frames.
    fn frame() -> Vec<u8> {
        let mut f = vec![0xFF, 0xFB, 0x90, 0x00];
        f.resize(417, 0x11);
        // main_data_begin = 0: no reservoir dependency.
        f[6] = 0;
        f
    }

    #[test]
    fn layer3_stereo() {
        let mut stream = frame();
        stream.extend_from_slice(&frame());
        let mut imp = Importer::open(Cursor::new(stream), "mp3").unwrap();
        match imp.summary(1).unwrap() {
            Summary::Audio(a) => {
                assert_eq!(a.frequency, 44_100);
                assert_eq!(a.channels, 2);
                assert_eq!(a.samples_in_frame, 1152);
            }
            _ => panic!("expected audio summary"),
        }
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.data.len(), 417);
        assert_eq!(&s.data[0..4], &[0xFF, 0xFB, 0x90, 0x00]);
        assert_eq!(s.dts, 0);
        assert_eq!(s.prop.pre_roll_distance, 1);
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.dts, 1152);
        assert!(imp.get_access_unit(1).unwrap().is_none());
        assert_eq!(imp.last_delta(1), 1152);
    }

    #[test]
    fn id3v2_is_skipped() {
        let mut stream = b"ID3\x04\x00\x00\x00\x00\x00\x0a".to_vec();
        stream.extend(std::iter::repeat(0u8).take(10));
        stream.extend_from_slice(&frame());
        let imp = Importer::open(Cursor::new(stream), "mp3").unwrap();
        assert_eq!(imp.track_count(), 1);
    }

    #[test]
    fn id3v1_terminates() {
        let mut stream = frame();
        stream.extend_from_slice(b"TAG....");
        let mut imp = Importer::open(Cursor::new(stream), "mp3").unwrap();
        assert!(imp.get_access_unit(1).unwrap().is_some());
        assert!(imp.get_access_unit(1).unwrap().is_none());
    }

    #[test]
    fn xing_frame_is_consumed() {
        // First frame carries a Xing header with a frame count and a LAME
        // tag; it must not be delivered as audio.
        let mut vbr = frame();
        let mdp = 4 + 32; // header + side info, MPEG-1 stereo
        vbr[mdp..mdp + 4].copy_from_slice(b"Xing");
        vbr[mdp + 4..mdp + 8].copy_from_slice(&1u32.to_be_bytes()); // flags: frames
        vbr[mdp + 8..mdp + 12].copy_from_slice(&100u32.to_be_bytes());
        let lame = mdp + 12;
        vbr[lame] = b'L';
        let v: u32 = (576 << 12) | 1105; // enc_delay, padding
        vbr[lame + 21] = (v >> 16) as u8;
        vbr[lame + 22] = (v >> 8) as u8;
        vbr[lame + 23] = v as u8;
        let mut stream = vbr;
        stream.extend_from_slice(&frame());
        let mut bs = crate::stream::ByteStream::new(Cursor::new(stream));
        let (mut imp, mut summary) = super::probe(&mut bs).unwrap();
        let s = imp.get_access_unit(&mut bs, &mut summary).unwrap().unwrap();
        // The delivered frame is the second one, renumbered from zero.
        assert_eq!(s.dts, 0);
        assert_eq!(imp.enc_delay, 576);
        assert_eq!(imp.padding, 1105);
        assert_eq!(imp.valid_samples, 100 * 1152 - 576 - 1105);
    }

    #[test]
    fn bit_reservoir_increases_pre_roll() {
        let mut stream = frame();
        let mut f2 = frame();
        f2[6] = 0x40; // main_data_begin > 0
        stream.extend_from_slice(&f2);
        let mut imp = Importer::open(Cursor::new(stream), "mp3").unwrap();
        let s1 = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s1.prop.pre_roll_distance, 1);
        let s2 = imp.get_access_unit(1).unwrap().unwrap();
        // One frame of reservoir history: the dependency is recorded for
        // the *next* frame, so this one still reports the MDCT overlap.
        assert_eq!(s2.prop.pre_roll_distance, 1);
    }
}
