//! AAC ADTS importer.
//!
//! ADTS (ISO/IEC 13818-7 / 14496-3) frames AAC raw data blocks with a
//! 28-bit fixed header, a variable header, and optional CRCs. Each raw
//! data block becomes one access unit of 1024 PCM samples.

use failure::{bail, Error};

use super::{RaFlags, Sample, SampleProperty, Status};
use crate::stream::ByteStream;
use crate::summary::{
    audio_specific_config, AudioSummary, CodecSpecific, FourCc, Summary, SAMPLING_FREQUENCY_TABLE,
};

const BASIC_HEADER_LENGTH: u32 = 7;
const MAX_FRAME_LENGTH: u32 = (1 << 13) - 1;
const MAX_RAW_DATA_BLOCKS: usize = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct FixedHeader {
    id: u8,
    protection_absent: bool,
    profile_object_type: u8,
    sampling_frequency_index: u8,
    channel_configuration: u8,
}

impl FixedHeader {
    fn parse(buf: &[u8; 7]) -> Result<FixedHeader, Error> {
        let syncword = (u16::from(buf[0]) << 4) | u16::from(buf[1] >> 4);
        if syncword != 0xFFF {
            bail!("no ADTS syncword");
        }
        let layer = (buf[1] >> 1) & 0x3;
        if layer != 0 {
            // layer is 0b00 for any kind of AAC.
            bail!("bad ADTS layer {}", layer);
        }
        let header = FixedHeader {
            id: (buf[1] >> 3) & 0x1,
            protection_absent: buf[1] & 0x1 != 0,
            profile_object_type: buf[2] >> 6,
            sampling_frequency_index: (buf[2] >> 2) & 0xF,
            channel_configuration: ((buf[2] << 2) | (buf[3] >> 6)) & 0x07,
        };
        if header.profile_object_type != 0x1 {
            // TODO: accept Main/SSR/LTP; only LC has seen real testing.
            bail!(
                "unsupported ADTS profile_ObjectType {}",
                header.profile_object_type
            );
        }
        if header.sampling_frequency_index > 0xB {
            bail!(
                "reserved sampling_frequency_index 0x{:x}",
                header.sampling_frequency_index
            );
        }
        if header.channel_configuration == 0 {
            bail!("channel_configuration 0 is unsupported");
        }
        if header.profile_object_type == 0x3 && header.id != 0 {
            bail!("LTP is only valid with MPEG-4 ADTS");
        }
        Ok(header)
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct VariableHeader {
    frame_length: u16,
    number_of_raw_data_blocks_in_frame: u8,
    raw_data_block_size: [u16; MAX_RAW_DATA_BLOCKS],
}

/// Parses the variable header given the 7 header bytes, consuming any
/// `adts_header_error_check()` that follows them from the stream.
fn parse_variable_header(
    bs: &mut ByteStream,
    buf: &[u8; 7],
    protection_absent: bool,
) -> Result<VariableHeader, Error> {
    let mut header = VariableHeader {
        frame_length: ((u16::from(buf[3]) << 11) | (u16::from(buf[4]) << 3) | u16::from(buf[5] >> 5))
            & 0x1FFF,
        number_of_raw_data_blocks_in_frame: buf[6] & 0x3,
        raw_data_block_size: [0; MAX_RAW_DATA_BLOCKS],
    };
    if u32::from(header.frame_length) <= BASIC_HEADER_LENGTH + 2 * u32::from(!protection_absent) {
        bail!("ADTS frame_length {} too short", header.frame_length);
    }
    let number_of_blocks = usize::from(header.number_of_raw_data_blocks_in_frame);
    if number_of_blocks == 0 {
        let mut size = header.frame_length - BASIC_HEADER_LENGTH as u16;
        if !protection_absent {
            // Skip adts_error_check() and subtract it from the block size.
            size -= 2;
            let mut crc = [0u8; 2];
            if bs.get(&mut crc) != 2 {
                bail!("truncated ADTS CRC");
            }
        }
        header.raw_data_block_size[0] = size;
        return Ok(header);
    }
    // With multiple raw_data_block()s, adts_header_error_check() carries the
    // block positions we need to split them.
    if protection_absent {
        // Splitting the blocks would require decoding the AAC bitstream
        // itself; this combination stays unsupported.
        bail!("multiple raw data blocks with protection_absent=1");
    }
    let mut raw_data_block_position = [0u16; MAX_RAW_DATA_BLOCKS + 1];
    for i in 0..number_of_blocks {
        let mut pos = [0u8; 2];
        if bs.get(&mut pos) != 2 {
            bail!("truncated adts_header_error_check");
        }
        raw_data_block_position[i] = u16::from_be_bytes(pos);
    }
    let mut crc = [0u8; 2];
    if bs.get(&mut crc) != 2 {
        bail!("truncated adts_header_error_check crc");
    }
    let first_offset = BASIC_HEADER_LENGTH as u16 + 2 * number_of_blocks as u16 + 2;
    header.raw_data_block_size[0] = raw_data_block_position[0]
        .checked_sub(first_offset)
        .ok_or_else(|| failure::format_err!("bad raw_data_block_position"))?;
    raw_data_block_position[number_of_blocks] = header.frame_length;
    for i in 1..=number_of_blocks {
        header.raw_data_block_size[i] = raw_data_block_position[i]
            .checked_sub(raw_data_block_position[i - 1])
            .ok_or_else(|| failure::format_err!("bad raw_data_block_position"))?;
    }
    // Each block is followed by adts_raw_data_block_error_check().
    for i in 0..=number_of_blocks {
        header.raw_data_block_size[i] = header.raw_data_block_size[i]
            .checked_sub(2)
            .ok_or_else(|| failure::format_err!("raw data block shorter than its CRC"))?;
    }
    Ok(header)
}

fn read_headers(bs: &mut ByteStream, buf: &[u8; 7]) -> Result<(FixedHeader, VariableHeader), Error> {
    let fixed = FixedHeader::parse(buf)?;
    let variable = parse_variable_header(bs, buf, fixed.protection_absent)?;
    Ok((fixed, variable))
}

fn create_summary(header: &FixedHeader) -> Summary {
    let channel_configuration = header.channel_configuration;
    // 0x07 means 7.1ch.
    let channels = channel_configuration + u8::from(channel_configuration == 0x07);
    let frequency = SAMPLING_FREQUENCY_TABLE[usize::from(header.sampling_frequency_index)];
    // MPEG-4 audio object types put AAC Main at 1, so the 2-bit ADTS
    // profile maps directly.
    let aot = header.profile_object_type + 1;
    Summary::Audio(AudioSummary {
        sample_type: FourCc(*b"mp4a"),
        max_au_length: MAX_FRAME_LENGTH,
        frequency,
        channels,
        sample_size: 16,
        samples_in_frame: 1024,
        codec_specific: vec![CodecSpecific::Mp4sysDecoderConfig {
            object_type_indication: 0x40, // Audio ISO/IEC 14496-3
            decoder_specific_info: audio_specific_config(
                aot,
                frequency,
                channel_configuration,
                None,
            ),
        }],
    })
}

pub(crate) struct AdtsImporter {
    status: Status,
    raw_data_block_idx: usize,
    header: FixedHeader,
    variable_header: VariableHeader,
    samples_in_frame: u32,
    au_number: u32,
}

pub(crate) fn probe(bs: &mut ByteStream) -> Result<(AdtsImporter, Summary), Error> {
    let mut buf = [0u8; 7];
    if bs.get(&mut buf) != 7 {
        bail!("stream shorter than an ADTS header");
    }
    let (header, variable_header) = read_headers(bs, &buf)?;
    let summary = create_summary(&header);
    let importer = AdtsImporter {
        status: Status::Ok,
        raw_data_block_idx: 0,
        header,
        variable_header,
        samples_in_frame: 1024,
        au_number: 0,
    };
    Ok((importer, summary))
}

impl AdtsImporter {
    pub(crate) fn get_access_unit(
        &mut self,
        bs: &mut ByteStream,
        summary: &mut Summary,
    ) -> Result<Option<Sample>, Error> {
        match self.status {
            Status::Error => bail!("ADTS importer in error state"),
            Status::Eof => return Ok(None),
            _ => {}
        }
        let mut summary_changed = false;
        if self.status == Status::Change {
            // The header that triggered the change is already active in
            // `self.header`; the caller sees the new summary from now on.
            *summary = create_summary(&self.header);
            if let Summary::Audio(a) = &*summary {
                self.samples_in_frame = a.samples_in_frame;
            }
            summary_changed = true;
        }

        // Read a raw_data_block(), typically the payload of an ADTS frame.
        let raw_data_block_size =
            usize::from(self.variable_header.raw_data_block_size[self.raw_data_block_idx]);
        let mut data = vec![0u8; raw_data_block_size];
        if bs.get(&mut data) != raw_data_block_size {
            self.status = Status::Error;
            bail!("truncated ADTS raw data block");
        }
        let mut prop = SampleProperty::default();
        prop.ra_flags = RaFlags::SYNC;
        prop.pre_roll_distance = 1; // MDCT
        let dts = u64::from(self.au_number) * u64::from(self.samples_in_frame);
        self.au_number += 1;
        let sample = Sample {
            data: data.into(),
            dts,
            cts: dts,
            prop,
            summary_changed,
        };

        // Skip adts_raw_data_block_error_check().
        if !self.header.protection_absent
            && self.variable_header.number_of_raw_data_blocks_in_frame != 0
        {
            let mut crc = [0u8; 2];
            if bs.get(&mut crc) != 2 {
                self.status = Status::Error;
                return Ok(Some(sample));
            }
        }
        // Does the current adts_frame() have more raw_data_block()s?
        if self.raw_data_block_idx
            < usize::from(self.variable_header.number_of_raw_data_blocks_in_frame)
        {
            self.raw_data_block_idx += 1;
            self.status = Status::Ok;
            return Ok(Some(sample));
        }
        self.raw_data_block_idx = 0;

        // Pre-parse the next frame's headers to classify the transition.
        let mut buf = [0u8; 7];
        let n = bs.get(&mut buf);
        if n == 0 {
            self.status = Status::Eof;
            return Ok(Some(sample));
        }
        if n != 7 {
            self.status = Status::Error;
            return Ok(Some(sample));
        }
        let (header, variable_header) = match read_headers(bs, &buf) {
            Ok(h) => h,
            Err(_) => {
                self.status = Status::Error;
                return Ok(Some(sample));
            }
        };
        self.variable_header = variable_header;
        // ADTS forbids fixed-header changes mid-stream, but MP4 allows
        // a track to change its properties mid-stream, so a channel change
        // maps to a new summary rather than an error.
        if self.header.profile_object_type != header.profile_object_type
            || self.header.id != header.id // a change of object_type_indication
            || self.header.sampling_frequency_index != header.sampling_frequency_index
        {
            self.status = Status::Error;
            return Ok(Some(sample));
        }
        if self.header.channel_configuration != header.channel_configuration {
            self.header = header;
            self.status = Status::Change;
        } else {
            self.status = Status::Ok;
        }
        Ok(Some(sample))
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

    fn single_frame() -> Vec<u8> {
        // 7-byte header: LC, 44.1 kHz, stereo, frame_length = 31
        // (7 header + 24 payload), one raw data block, protection absent.
        let mut stream = vec![0xFF, 0xF1, 0x50, 0x80, 0x03, 0xFF, 0xFC];
        stream[4] = (31 >> 3) as u8; // frame_length bits
        stream[5] = ((31 & 0x7) << 5) as u8 | 0x1F;
        stream.extend(std::iter::repeat(0xA5).take(24));
        stream
    }

    #[test]
    fn single_raw_block() {
        let mut imp = Importer::open(Cursor::new(single_frame()), "adts").unwrap();
        match imp.summary(1).unwrap() {
            Summary::Audio(a) => {
                assert_eq!(a.frequency, 44_100);
                assert_eq!(a.channels, 2);
                assert_eq!(a.samples_in_frame, 1024);
            }
            _ => panic!("expected audio summary"),
        }
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.data.len(), 24);
        assert_eq!(s.dts, 0);
        assert_eq!(s.cts, 0);
        assert!(s.prop.ra_flags.contains(crate::import::RaFlags::SYNC));
        assert_eq!(s.prop.pre_roll_distance, 1);
        assert!(imp.get_access_unit(1).unwrap().is_none());
        assert_eq!(imp.last_delta(1), 1024);
    }

    #[test]
    fn channel_change_yields_new_summary() {
        let mut stream = single_frame();
        let mut second = single_frame();
        second[3] = 0x40; // channel_configuration 1
        stream.extend_from_slice(&second);
        let mut imp = Importer::open(Cursor::new(stream), "adts").unwrap();
        let s1 = imp.get_access_unit(1).unwrap().unwrap();
        assert!(!s1.summary_changed);
        let s2 = imp.get_access_unit(1).unwrap().unwrap();
        assert!(s2.summary_changed);
        match imp.summary(1).unwrap() {
            Summary::Audio(a) => assert_eq!(a.channels, 1),
            _ => panic!("expected audio summary"),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(Importer::open(Cursor::new(vec![0u8; 32]), "adts").is_err());
    }
}
