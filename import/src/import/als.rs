//! MPEG-4 ALS importer.
//!
//! See ISO/IEC 14496-3 2009, subpart 11. The ALSSpecificConfig at the
//! head of the stream is captured (through its auxiliary data) into the
//! AudioSpecificConfig; random-access units become samples.

use failure::{bail, Error};
use log::warn;

use super::{RaFlags, Sample, SampleProperty, Status};
use crate::stream::ByteStream;
use crate::summary::{audio_specific_config, AudioSummary, CodecSpecific, FourCc, Summary};

/// Leading fixed-size portion of ALSSpecificConfig.
const ALSSC_TWELVE_LENGTH: usize = 22;

struct SpecificConfig {
    samp_freq: u32,
    samples: u32,
    channels: u16,
    frame_length: u16,
    resolution: u8,
    random_access: u8,
    number_of_ra_units: u32,
    /// Per-unit sizes when `ra_flag == 2` (they live in the config, not
    /// the stream).
    ra_unit_size: Option<Vec<u32>>,
    /// The captured config bytes, with `ra_flag` rewritten to 0.
    sc_data: Vec<u8>,
    /// Whole remaining stream when `random_access == 0`.
    access_unit_size: usize,
}

fn copy_from_stream(sc_data: &mut Vec<u8>, bs: &mut ByteStream, size: usize) -> Result<(), Error> {
    let start = sc_data.len();
    sc_data.resize(start + size, 0);
    if bs.get(&mut sc_data[start..]) != size {
        bail!("truncated ALSSpecificConfig");
    }
    Ok(())
}

fn parse_specific_config(bs: &mut ByteStream) -> Result<SpecificConfig, Error> {
    if bs.show_be32(0) != 0x414C5300 {
        // "ALS\0"
        bail!("no ALS identifier");
    }
    let samp_freq = bs.show_be32(4);
    let samples = bs.show_be32(8);
    if samples == 0xffff_ffff {
        bail!("streams of unknown duration are unsupported");
    }
    let channels = bs.show_be16(12);
    let resolution = (bs.show_byte(14) & 0x1c) >> 2;
    if resolution > 3 {
        bail!("reserved resolution");
    }
    let frame_length = bs.show_be16(15);
    let random_access = bs.show_byte(17);
    let ra_flag = (bs.show_byte(18) & 0xc0) >> 6;
    if ra_flag == 0 {
        // Random-access unit sizes are unrecoverable without them.
        bail!("ra_flag == 0 is unsupported");
    }
    let temp8 = bs.show_byte(20);
    let chan_sort = temp8 & 0x1 != 0;
    if channels == 0 {
        if temp8 & 0x8 != 0 {
            bail!("mono stream with joint_stereo");
        } else if temp8 & 0x4 != 0 {
            bail!("mono stream with mc_coding");
        } else if chan_sort {
            bail!("mono stream with chan_sort");
        }
    }
    let chan_config = temp8 & 0x2 != 0;
    let temp8 = bs.show_byte(21);
    let crc_enabled = temp8 & 0x80 != 0;
    let aux_data_enabled = temp8 & 0x1 != 0;
    let mut sc_data = Vec::new();
    copy_from_stream(&mut sc_data, bs, ALSSC_TWELVE_LENGTH)?;
    if chan_config {
        copy_from_stream(&mut sc_data, bs, 2)?; // chan_config_info
    }
    if chan_sort {
        // ceil(log2(channels + 1)) bits per channel position.
        let n = u32::from(channels) + 1;
        let ch_bits = if n <= 1 { 0 } else { 32 - (n - 1).leading_zeros() };
        let chan_pos_length = u64::from(n) * u64::from(ch_bits);
        let chan_pos_length = ((chan_pos_length + 7) / 8) as usize; // byte_align
        copy_from_stream(&mut sc_data, bs, chan_pos_length)?;
    }
    // orig_header, orig_trailer and crc.
    {
        let header_size = bs.show_be32(0);
        let trailer_size = bs.show_be32(4);
        copy_from_stream(&mut sc_data, bs, 8)?;
        if header_size != 0xffff_ffff {
            copy_from_stream(&mut sc_data, bs, header_size as usize)?;
        }
        if trailer_size != 0xffff_ffff {
            copy_from_stream(&mut sc_data, bs, trailer_size as usize)?;
        }
        if crc_enabled {
            copy_from_stream(&mut sc_data, bs, 4)?;
        }
    }
    // Random-access units.
    let number_of_frames =
        ((u64::from(samples) + u64::from(frame_length)) / (u64::from(frame_length) + 1)) as u32;
    let number_of_ra_units = if random_access != 0 {
        (u64::from(number_of_frames) + u64::from(random_access) - 1) as u32 / u32::from(random_access)
    } else {
        0
    };
    let ra_unit_size = if ra_flag == 2 && random_access != 0 {
        // These don't go into the captured config.
        let mut sizes = Vec::with_capacity(number_of_ra_units as usize);
        for _ in 0..number_of_ra_units {
            sizes.push(bs.get_be32());
        }
        if bs.eob() || bs.error() {
            bail!("truncated ra_unit_size table");
        }
        Some(sizes)
    } else {
        None
    };
    // Auxiliary data.
    if aux_data_enabled {
        let aux_size = bs.show_be32(0);
        copy_from_stream(&mut sc_data, bs, 4)?;
        if aux_size != 0 && aux_size != 0xffff_ffff {
            copy_from_stream(&mut sc_data, bs, aux_size as usize)?;
        }
    }
    // Clear ra_flag in the copy; ra_unit_size won't accompany the samples.
    sc_data[18] &= 0x3f;
    Ok(SpecificConfig {
        samp_freq,
        samples,
        channels,
        frame_length,
        resolution,
        random_access,
        number_of_ra_units,
        ra_unit_size,
        sc_data,
        access_unit_size: 0,
    })
}

fn create_summary(config: &SpecificConfig) -> Summary {
    let channels = (config.channels + 1).min(255) as u8;
    let sample_size = (u16::from(config.resolution) + 1) * 8;
    let (samples_in_frame, max_au_length) = if config.random_access != 0 {
        let sif = (u32::from(config.frame_length) + 1) * u32::from(config.random_access);
        (
            sif,
            u32::from(channels) * u32::from(sample_size / 8) * sif,
        )
    } else {
        // The whole remainder of the stream is one access unit; a zero
        // samples_in_frame routes last_delta to the total sample count.
        (0, config.access_unit_size as u32)
    };
    Summary::Audio(AudioSummary {
        sample_type: FourCc(*b"mp4a"),
        max_au_length,
        frequency: config.samp_freq,
        channels,
        sample_size,
        samples_in_frame,
        codec_specific: vec![CodecSpecific::Mp4sysDecoderConfig {
            object_type_indication: 0x40, // Audio ISO/IEC 14496-3
            decoder_specific_info: audio_specific_config(
                36, // ALS
                config.samp_freq,
                0,
                Some(&config.sc_data),
            ),
        }],
    })
}

pub(crate) struct AlsImporter {
    status: Status,
    config: SpecificConfig,
    samples_in_frame: u32,
    au_number: u32,
}

pub(crate) fn probe(bs: &mut ByteStream) -> Result<(AlsImporter, Summary), Error> {
    let mut config = parse_specific_config(bs)?;
    if config.random_access == 0 {
        // Size the single access unit by reading to the end of stream.
        while !bs.is_end(config.access_unit_size) {
            config.access_unit_size = bs.remaining();
        }
        config.access_unit_size = bs.remaining();
    }
    let summary = create_summary(&config);
    let samples_in_frame = match &summary {
        Summary::Audio(a) => a.samples_in_frame,
        _ => unreachable!(),
    };
    Ok((
        AlsImporter {
            status: Status::Ok,
            config,
            samples_in_frame,
            au_number: 0,
        },
        summary,
    ))
}

impl AlsImporter {
    pub(crate) fn get_access_unit(
        &mut self,
        bs: &mut ByteStream,
        _summary: &mut Summary,
    ) -> Result<Option<Sample>, Error> {
        match self.status {
            Status::Error => bail!("ALS importer in error state"),
            Status::Eof => return Ok(None),
            _ => {}
        }
        let mut prop = SampleProperty::default();
        prop.ra_flags = RaFlags::SYNC;
        if self.config.number_of_ra_units == 0 {
            let mut data = vec![0u8; self.config.access_unit_size];
            if bs.get(&mut data) != data.len() {
                self.status = Status::Error;
                bail!("failed to read the access unit");
            }
            self.status = Status::Eof;
            return Ok(Some(Sample {
                data: data.into(),
                dts: 0,
                cts: 0,
                prop,
                summary_changed: false,
            }));
        }
        let au_length = match &self.config.ra_unit_size {
            Some(sizes) => sizes[self.au_number as usize],
            // ra_flag == 1: a 4-byte size prefixes each unit in the stream
            // and is not exported into the sample.
            None => bs.get_be32(),
        } as usize;
        let mut data = vec![0u8; au_length];
        if bs.get(&mut data) != au_length {
            warn!("failed to read an access unit");
            self.status = Status::Error;
            bail!("truncated random-access unit");
        }
        let dts = u64::from(self.au_number) * u64::from(self.samples_in_frame);
        self.au_number += 1;
        if self.au_number == self.config.number_of_ra_units {
            self.status = Status::Eof;
        }
        Ok(Some(Sample {
            data: data.into(),
            dts,
            cts: dts,
            prop,
            summary_changed: false,
        }))
    }

    pub(crate) fn last_delta(&self, _summary: &Summary) -> u32 {
        if self.status != Status::Eof {
            return 0;
        }
        if self.config.number_of_ra_units == 0 {
            return self.config.samples;
        }
        self.config.samples - (self.config.number_of_ra_units - 1) * self.samples_in_frame
    }
}

#[cfg(test)]
mod tests {
    use crate::import::Importer;
    use crate::summary::Summary;
    use std::io::Cursor;

    /// A minimal ALSSpecificConfig: 48 kHz, 2048 samples, mono, 16-bit,
    /// frame_length 1023, random_access 1, ra_flag 1 (sizes in-stream),
    /// no chan_config/chan_sort, no header/trailer, no CRC, no aux data.
    fn config() -> Vec<u8> {
        let mut c = Vec::new();
        c.extend_from_slice(b"ALS\0");
        c.extend_from_slice(&48000u32.to_be_bytes()); // samp_freq
        c.extend_from_slice(&2048u32.to_be_bytes()); // samples
        c.extend_from_slice(&0u16.to_be_bytes()); // channels (mono)
        c.push(1 << 2); // file_type / resolution 1 (16-bit) / floating / msb_first
        c.extend_from_slice(&1023u16.to_be_bytes()); // frame_length
        c.push(1); // random_access
        c.push(1 << 6); // ra_flag 1: sizes stored at frame start
        c.push(0); // adapt_order etc.
        c.push(0); // no joint_stereo/mc_coding/chan_config/chan_sort
        c.push(0); // no crc, no aux data, RLSLMS bits
        assert_eq!(c.len(), super::ALSSC_TWELVE_LENGTH);
        // orig_header/orig_trailer sizes: none present.
        c.extend_from_slice(&0xffff_ffffu32.to_be_bytes());
        c.extend_from_slice(&0xffff_ffffu32.to_be_bytes());
        c
    }

    #[test]
    fn ra_units_with_inline_sizes() {
        let mut stream = config();
        // Two RA units of 16 and 8 bytes, each preceded by its size.
        stream.extend_from_slice(&16u32.to_be_bytes());
        stream.extend(std::iter::repeat(0xAB).take(16));
        stream.extend_from_slice(&8u32.to_be_bytes());
        stream.extend(std::iter::repeat(0xCD).take(8));
        let mut imp = Importer::open(Cursor::new(stream), "als").unwrap();
        match imp.summary(1).unwrap() {
            Summary::Audio(a) => {
                assert_eq!(a.frequency, 48000);
                assert_eq!(a.channels, 1);
                assert_eq!(a.samples_in_frame, 1024);
                assert_eq!(a.sample_size, 16);
            }
            _ => panic!("expected audio summary"),
        }
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.data.len(), 16);
        assert_eq!(s.dts, 0);
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.data.len(), 8);
        assert_eq!(s.dts, 1024);
        assert!(imp.get_access_unit(1).unwrap().is_none());
        // 2048 total samples, one 1024-sample unit before the last.
        assert_eq!(imp.last_delta(1), 1024);
    }

    #[test]
    fn captured_config_clears_ra_flag() {
        let mut stream = config();
        stream.extend_from_slice(&4u32.to_be_bytes());
        stream.extend_from_slice(&[0; 4]);
        let mut bs = crate::stream::ByteStream::new(Cursor::new(stream));
        let config = super::parse_specific_config(&mut bs).unwrap();
        assert_eq!(config.sc_data[18] & 0xc0, 0);
        assert_eq!(config.number_of_ra_units, 2);
    }
}
