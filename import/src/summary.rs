//! Stream summaries: the per-track description an importer produces, which
//! a muxer turns into an `.mp4` sample entry.
//!
//! References:
//! *   [ISO/IEC 14496-12](https://standards.iso.org/ittf/PubliclyAvailableStandards/c068960_ISO_IEC_14496-12_2015.zip):
//!     ISO base media file format (sample entry shapes).
//! *   ISO/IEC 14496-1: Systems (ES_Descriptor, DecoderConfigDescriptor).
//! *   ISO/IEC 14496-3: Audio (AudioSpecificConfig).

use bytes::{BufMut, Bytes, BytesMut};
use failure::{bail, Error};
use pretty_hex::PrettyHex;

/// A four-character code, as used for sample entry types.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FourCc(pub [u8; 4]);

impl std::fmt::Debug for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl std::fmt::Display for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Overwrites a buffer with a varint length, returning the length of the length.
/// See ISO/IEC 14496-1 section 8.3.3.
pub(crate) fn set_length(len: usize, data: &mut [u8]) -> Result<usize, Error> {
    if len < 1 << 7 {
        data[0] = len as u8;
        Ok(1)
    } else if len < 1 << 14 {
        data[0] = ((len & 0x7F) | 0x80) as u8;
        data[1] = (len >> 7) as u8;
        Ok(2)
    } else if len < 1 << 21 {
        data[0] = ((len & 0x7F) | 0x80) as u8;
        data[1] = (((len >> 7) & 0x7F) | 0x80) as u8;
        data[2] = (len >> 14) as u8;
        Ok(3)
    } else if len < 1 << 28 {
        data[0] = ((len & 0x7F) | 0x80) as u8;
        data[1] = (((len >> 7) & 0x7F) | 0x80) as u8;
        data[2] = (((len >> 14) & 0x7F) | 0x80) as u8;
        data[3] = (len >> 21) as u8;
        Ok(4)
    } else {
        // BaseDescriptor sets a maximum length of 2**28 - 1.
        bail!("length {} too long", len);
    }
}

/// Writes a descriptor tag and length for everything appended in the
/// supplied scope. See ISO/IEC 14496-1 Table 1 for the `tag`.
macro_rules! write_descriptor {
    ($buf:expr, $tag:expr, $b:block) => {{
        let _: &mut BytesMut = $buf; // type-check.
        let _: u8 = $tag;
        let pos_start = $buf.len();

        // Overallocate room for the varint length and append the body.
        $buf.extend_from_slice(&[$tag, 0, 0, 0, 0]);
        let r = {
            $b;
        };
        let pos_end = $buf.len();

        // Then fix it afterward: write the correct varint length and move
        // the body backward.
        let len = pos_end.checked_sub(pos_start + 5).unwrap();
        let len_len = crate::summary::set_length(len, &mut $buf[pos_start + 1..pos_start + 4])?;
        $buf.copy_within(pos_start + 5..pos_end, pos_start + 1 + len_len);
        $buf.truncate(pos_end + len_len - 4);
        r
    }};
}
pub(crate) use write_descriptor;

/// Writes a box length and type (four-character code) for everything
/// appended in the supplied scope.
macro_rules! write_box {
    ($buf:expr, $fourcc:expr, $b:block) => {{
        let _: &mut BytesMut = $buf; // type-check.
        let pos_start = $buf.len();
        let fourcc: &[u8; 4] = $fourcc;
        $buf.extend_from_slice(&[0, 0, 0, 0, fourcc[0], fourcc[1], fourcc[2], fourcc[3]]);
        let r = {
            $b;
        };
        let pos_end = $buf.len();
        let len = pos_end.checked_sub(pos_start).unwrap();
        $buf[pos_start..pos_start + 4]
            .copy_from_slice(&u32::try_from(len)?.to_be_bytes()[..]);
        r
    }};
}
pub(crate) use write_box;


/// Codec-specific configuration attached to a summary.
#[derive(Clone)]
pub enum CodecSpecific {
    /// An MPEG-4 Systems decoder configuration (ADTS/MP3/ALS): the
    /// `objectTypeIndication` plus the DecoderSpecificInfo payload (an
    /// AudioSpecificConfig, possibly empty for the legacy MP3 interface).
    Mp4sysDecoderConfig {
        object_type_indication: u8,
        decoder_specific_info: Bytes,
    },
    /// An already-serialized configuration record (`damr`, `dac3`, `dec3`,
    /// `ddts` box payloads; `avcC`/`hvcC`/`av1C` boxes).
    Unstructured(Bytes),
}

impl CodecSpecific {
    /// Serializes to the on-wire form: `Mp4sysDecoderConfig` becomes a
    /// DecoderConfigDescriptor (ISO/IEC 14496-1 section 7.2.6.6) with a
    /// nested DecSpecificInfo; `Unstructured` is returned as-is.
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        match self {
            CodecSpecific::Unstructured(b) => Ok(b.clone()),
            CodecSpecific::Mp4sysDecoderConfig {
                object_type_indication,
                decoder_specific_info,
            } => {
                let mut buf = BytesMut::new();
                write_descriptor!(&mut buf, 0x04 /* DecoderConfigDescrTag */, {
                    buf.put_u8(*object_type_indication);
                    buf.put_u8(0x15); // streamType = audio, upStream = false, reserved = 1
                    buf.put_uint(0, 3); // bufferSizeDB
                    buf.put_u32(0); // maxBitrate
                    buf.put_u32(0); // avgBitrate
                    if !decoder_specific_info.is_empty() {
                        write_descriptor!(&mut buf, 0x05 /* DecSpecificInfoTag */, {
                            buf.extend_from_slice(decoder_specific_info);
                        });
                    }
                });
                Ok(buf.freeze())
            }
        }
    }
}

impl std::fmt::Debug for CodecSpecific {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecSpecific::Mp4sysDecoderConfig {
                object_type_indication,
                decoder_specific_info,
            } => f
                .debug_struct("Mp4sysDecoderConfig")
                .field("object_type_indication", object_type_indication)
                .field("decoder_specific_info", &decoder_specific_info.hex_dump())
                .finish(),
            CodecSpecific::Unstructured(b) => {
                f.debug_tuple("Unstructured").field(&b.hex_dump()).finish()
            }
        }
    }
}

#[derive(Clone, Debug)]
pub enum Summary {
    Audio(AudioSummary),
    Video(VideoSummary),
}

impl Summary {
    pub fn sample_type(&self) -> FourCc {
        match self {
            Summary::Audio(a) => a.sample_type,
            Summary::Video(v) => v.sample_type,
        }
    }

    pub fn max_au_length(&self) -> u32 {
        match self {
            Summary::Audio(a) => a.max_au_length,
            Summary::Video(v) => v.max_au_length,
        }
    }

    pub fn codec_specific(&self) -> &[CodecSpecific] {
        match self {
            Summary::Audio(a) => &a.codec_specific,
            Summary::Video(v) => &v.codec_specific,
        }
    }

    /// The media timescale implied by the summary: the sampling frequency
    /// for audio, the explicit timescale for video.
    pub fn timescale(&self) -> u32 {
        match self {
            Summary::Audio(a) => a.frequency,
            Summary::Video(v) => v.timescale,
        }
    }
}

#[derive(Clone)]
pub struct AudioSummary {
    pub sample_type: FourCc,
    pub max_au_length: u32,
    pub frequency: u32,
    pub channels: u8,
    pub sample_size: u16,
    /// PCM samples per access unit; the dts/cts step between AUs.
    pub samples_in_frame: u32,
    pub codec_specific: Vec<CodecSpecific>,
}

impl std::fmt::Debug for AudioSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSummary")
            .field("sample_type", &self.sample_type)
            .field("frequency", &self.frequency)
            .field("channels", &self.channels)
            .field("sample_size", &self.sample_size)
            .field("samples_in_frame", &self.samples_in_frame)
            .field("max_au_length", &self.max_au_length)
            .field("codec_specific", &self.codec_specific)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColorInfo {
    pub primaries_index: u8,
    pub transfer_index: u8,
    pub matrix_index: u8,
    pub full_range: bool,
}

#[derive(Clone)]
pub struct VideoSummary {
    pub sample_type: FourCc,
    pub max_au_length: u32,
    /// Media timescale and the duration of one tick pair, straight from
    /// the bitstream's timing info.
    pub timescale: u32,
    pub timebase: u32,
    pub vfr: bool,
    /// Each sample is one coded field rather than a frame.
    pub sample_per_field: bool,
    pub width: u32,
    pub height: u32,
    /// Pixel aspect ratio `(h_spacing, v_spacing)`; `(0, 0)` if unstated.
    pub par: (u32, u32),
    pub color: ColorInfo,
    pub codec_specific: Vec<CodecSpecific>,
}

impl std::fmt::Debug for VideoSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoSummary")
            .field("sample_type", &self.sample_type)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("par", &self.par)
            .field("timescale", &self.timescale)
            .field("timebase", &self.timebase)
            .field("vfr", &self.vfr)
            .field("color", &self.color)
            .field("max_au_length", &self.max_au_length)
            .field("codec_specific", &self.codec_specific)
            .finish()
    }
}

/// ISO/IEC 14496-3 section 1.6.3.4 sampling frequencies by index.
pub(crate) const SAMPLING_FREQUENCY_TABLE: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

/// Builds an AudioSpecificConfig (ISO/IEC 14496-3 section 1.6.2.1) for a
/// GASpecificConfig object type with 1024-sample frames, or for ALS when
/// `als_config` is supplied (object type 36, escape-coded).
pub(crate) fn audio_specific_config(
    audio_object_type: u8,
    frequency: u32,
    channel_configuration: u8,
    als_config: Option<&[u8]>,
) -> Bytes {
    let freq_index = SAMPLING_FREQUENCY_TABLE
        .iter()
        .position(|&f| f == frequency);
    let mut buf = BytesMut::new();
    if let Some(alssc) = als_config {
        // aot escape (5+6 bits), explicit frequency (4+24), channel
        // configuration 0, then byte alignment and the raw ALSSpecificConfig.
        debug_assert_eq!(audio_object_type, 36);
        let mut bits = 0u64;
        bits = (bits << 5) | 31;
        bits = (bits << 6) | u64::from(audio_object_type - 32);
        bits = (bits << 4) | 0xf;
        bits = (bits << 24) | u64::from(frequency & 0xFF_FFFF);
        bits = (bits << 4) | 0; // channelConfiguration: described by ALSSpecificConfig
        bits <<= 5; // byte alignment
        buf.put_uint(bits, 6);
        buf.extend_from_slice(alssc);
    } else {
        let mut bits: u32 = u32::from(audio_object_type) << 11;
        match freq_index {
            Some(i) => {
                bits |= (i as u32) << 7;
                bits |= u32::from(channel_configuration) << 3;
                // GASpecificConfig: frame_length_flag = 0,
                // depends_on_core_coder = 0, extension_flag = 0.
                buf.put_u16(bits as u16);
            }
            None => {
                // Escape to a 24-bit explicit frequency.
                let mut long = (u64::from(audio_object_type) << 4) | 0xf;
                long = (long << 24) | u64::from(frequency & 0xFF_FFFF);
                long = (long << 4) | u64::from(channel_configuration);
                long <<= 3; // GASpecificConfig as above; 40 bits total
                buf.put_uint(long, 5);
            }
        }
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_specific_config_aac_lc() {
        // AAC LC, 48 kHz, mono: the standard 0x11 0x88 two-byte config.
        let asc = audio_specific_config(2, 48_000, 1, None);
        assert_eq!(&asc[..], &[0x11, 0x88]);
        // AAC LC, 44.1 kHz, stereo.
        let asc = audio_specific_config(2, 44_100, 2, None);
        assert_eq!(&asc[..], &[0x12, 0x10]);
    }

    #[test]
    fn decoder_config_descriptor() {
        let cs = CodecSpecific::Mp4sysDecoderConfig {
            object_type_indication: 0x40,
            decoder_specific_info: audio_specific_config(2, 44_100, 2, None),
        };
        let b = cs.to_bytes().unwrap();
        assert_eq!(b[0], 0x04); // DecoderConfigDescrTag
        assert_eq!(b[2], 0x40); // objectTypeIndication
        assert_eq!(b[3], 0x15); // streamType audio
        // Nested DecSpecificInfo holds the ASC.
        let dsi_at = b.len() - 4;
        assert_eq!(&b[dsi_at..], &[0x05, 0x02, 0x12, 0x10]);
    }

    #[test]
    fn descriptor_length_encoding() {
        let mut data = [0u8; 4];
        assert_eq!(set_length(0x7f, &mut data).unwrap(), 1);
        assert_eq!(data[0], 0x7f);
        assert_eq!(set_length(0x80, &mut data).unwrap(), 2);
        assert_eq!(&data[0..2], &[0x80, 0x01]);
    }
}
