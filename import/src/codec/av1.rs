//! AV1 OBU parsing, scoped to what muxing needs: walking open bitstream
//! units, the sequence header, and enough of the uncompressed frame header
//! to learn frame type, show flags, and render dimensions.
//!
//! See the [AV1 bitstream specification](https://aomediacodec.github.io/av1-spec/)
//! section 5, and the AV1-in-ISOBMFF binding for `av1C`.

use bytes::{BufMut, Bytes, BytesMut};
use failure::{bail, Error};

use crate::bits::NalBits;

pub const OBU_SEQUENCE_HEADER: u8 = 1;
pub const OBU_TEMPORAL_DELIMITER: u8 = 2;
pub const OBU_FRAME_HEADER: u8 = 3;
pub const OBU_TILE_GROUP: u8 = 4;
pub const OBU_METADATA: u8 = 5;
pub const OBU_FRAME: u8 = 6;
pub const OBU_REDUNDANT_FRAME_HEADER: u8 = 7;

const NUM_REF_FRAMES: usize = 8;

pub const KEY_FRAME: u8 = 0;
pub const INTRA_ONLY_FRAME: u8 = 2;
pub const SWITCH_FRAME: u8 = 3;

/// One OBU split out of a temporal unit.
pub struct Obu<'a> {
    pub obu_type: u8,
    pub temporal_id: u8,
    pub spatial_id: u8,
    /// Length of the OBU header (+ size field) preceding the payload.
    pub header_len: usize,
    pub payload: &'a [u8],
}

impl<'a> Obu<'a> {
    /// Total encoded length, header included.
    pub fn encoded_len(&self) -> usize {
        self.header_len + self.payload.len()
    }
}

fn leb128(data: &[u8]) -> Result<(u64, usize), Error> {
    let mut value = 0u64;
    for i in 0..8.min(data.len()) {
        value |= u64::from(data[i] & 0x7f) << (i * 7);
        if data[i] & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    bail!("unterminated leb128");
}

/// Splits the next OBU off the front of `data`.
pub fn next_obu(data: &[u8]) -> Result<Obu<'_>, Error> {
    if data.is_empty() {
        bail!("empty OBU");
    }
    let b = data[0];
    if b & 0x80 != 0 {
        bail!("obu_forbidden_bit is set");
    }
    let obu_type = (b >> 3) & 0xf;
    let extension_flag = b & 0x4 != 0;
    let has_size = b & 0x2 != 0;
    let mut pos = 1;
    let (mut temporal_id, mut spatial_id) = (0, 0);
    if extension_flag {
        if data.len() < 2 {
            bail!("truncated OBU extension header");
        }
        temporal_id = data[1] >> 5;
        spatial_id = (data[1] >> 3) & 0x3;
        pos += 1;
    }
    let size = if has_size {
        let (size, n) = leb128(&data[pos..])?;
        pos += n;
        size as usize
    } else {
        data.len() - pos
    };
    if data.len() < pos + size {
        bail!("truncated OBU payload");
    }
    Ok(Obu {
        obu_type,
        temporal_id,
        spatial_id,
        header_len: pos,
        payload: &data[pos..pos + size],
    })
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ColorConfig {
    pub high_bitdepth: bool,
    pub twelve_bit: bool,
    pub mono_chrome: bool,
    pub color_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
    pub color_range: bool,
    pub subsampling_x: u8,
    pub subsampling_y: u8,
    pub chroma_sample_position: u8,
}

#[derive(Clone, Debug, Default)]
pub struct SequenceHeader {
    pub seq_profile: u8,
    pub seq_level_idx_0: u8,
    pub seq_tier_0: bool,
    pub still_picture: bool,
    pub reduced_still_picture_header: bool,
    pub initial_display_delay_present: bool,
    pub initial_display_delay_minus_1_0: u8,
    pub frame_width_bits: u8,
    pub frame_height_bits: u8,
    pub max_frame_width: u32,
    pub max_frame_height: u32,
    pub frame_id_numbers_present: bool,
    pub delta_frame_id_length: u8,
    pub additional_frame_id_length: u8,
    pub enable_order_hint: bool,
    pub order_hint_bits: u8,
    pub seq_force_screen_content_tools: u8,
    pub seq_force_integer_mv: u8,
    pub enable_superres: bool,
    pub decoder_model_info_present: bool,
    pub equal_picture_interval: bool,
    pub buffer_delay_length: u8,
    pub frame_presentation_time_length: u8,
    /// Which operating points carry decoder model parameters.
    pub op_has_decoder_model: [bool; 32],
    pub operating_points_cnt: u8,
    pub color: ColorConfig,
}

const SELECT_SCREEN_CONTENT_TOOLS: u8 = 2;
const SELECT_INTEGER_MV: u8 = 2;

pub fn parse_sequence_header(payload: &[u8]) -> Result<SequenceHeader, Error> {
    let mut r = NalBits::new(payload);
    let mut sh = SequenceHeader::default();
    sh.seq_profile = r.get_u8(3)?;
    if sh.seq_profile > 2 {
        bail!("reserved seq_profile");
    }
    sh.still_picture = r.flag()?;
    sh.reduced_still_picture_header = r.flag()?;
    if sh.reduced_still_picture_header {
        sh.seq_level_idx_0 = r.get_u8(5)?;
        sh.operating_points_cnt = 1;
    } else {
        if r.flag()? {
            // timing_info()
            r.skip(32)?; // num_units_in_display_tick
            r.skip(32)?; // time_scale
            sh.equal_picture_interval = r.flag()?;
            if sh.equal_picture_interval {
                r.ue()?; // num_ticks_per_picture_minus_1 (uvlc)
            }
            sh.decoder_model_info_present = r.flag()?;
            if sh.decoder_model_info_present {
                sh.buffer_delay_length = r.get_u8(5)? + 1;
                r.skip(32)?; // num_units_in_decoding_tick
                r.skip(5)?; // buffer_removal_time_length_minus_1
                sh.frame_presentation_time_length = r.get_u8(5)? + 1;
            }
        }
        sh.initial_display_delay_present = r.flag()?;
        let operating_points_cnt = r.get_u8(5)? + 1;
        sh.operating_points_cnt = operating_points_cnt;
        for i in 0..usize::from(operating_points_cnt) {
            r.skip(12)?; // operating_point_idc
            let seq_level_idx = r.get_u8(5)?;
            let seq_tier = if seq_level_idx > 7 { r.flag()? } else { false };
            if i == 0 {
                sh.seq_level_idx_0 = seq_level_idx;
                sh.seq_tier_0 = seq_tier;
            }
            if sh.decoder_model_info_present {
                let present = r.flag()?;
                sh.op_has_decoder_model[i] = present;
                if present {
                    // operating_parameters_info()
                    r.skip(u64::from(sh.buffer_delay_length))?; // decoder_buffer_delay
                    r.skip(u64::from(sh.buffer_delay_length))?; // encoder_buffer_delay
                    r.skip(1)?; // low_delay_mode_flag
                }
            }
            if sh.initial_display_delay_present && r.flag()? {
                let delay = r.get_u8(4)?;
                if i == 0 {
                    sh.initial_display_delay_minus_1_0 = delay;
                }
            }
        }
    }
    sh.frame_width_bits = r.get_u8(4)? + 1;
    sh.frame_height_bits = r.get_u8(4)? + 1;
    sh.max_frame_width = r.get_u32(sh.frame_width_bits)? + 1;
    sh.max_frame_height = r.get_u32(sh.frame_height_bits)? + 1;
    if !sh.reduced_still_picture_header {
        sh.frame_id_numbers_present = r.flag()?;
    }
    if sh.frame_id_numbers_present {
        sh.delta_frame_id_length = r.get_u8(4)? + 2;
        sh.additional_frame_id_length = r.get_u8(3)? + 1;
    }
    r.skip(1)?; // use_128x128_superblock
    r.skip(1)?; // enable_filter_intra
    r.skip(1)?; // enable_intra_edge_filter
    if sh.reduced_still_picture_header {
        sh.seq_force_screen_content_tools = SELECT_SCREEN_CONTENT_TOOLS;
        sh.seq_force_integer_mv = SELECT_INTEGER_MV;
    } else {
        r.skip(1)?; // enable_interintra_compound
        r.skip(1)?; // enable_masked_compound
        r.skip(1)?; // enable_warped_motion
        r.skip(1)?; // enable_dual_filter
        sh.enable_order_hint = r.flag()?;
        if sh.enable_order_hint {
            r.skip(1)?; // enable_jnt_comp
            r.skip(1)?; // enable_ref_frame_mvs
        }
        sh.seq_force_screen_content_tools = if r.flag()? {
            SELECT_SCREEN_CONTENT_TOOLS
        } else {
            r.get_u8(1)?
        };
        sh.seq_force_integer_mv = if sh.seq_force_screen_content_tools > 0 {
            if r.flag()? {
                SELECT_INTEGER_MV
            } else {
                r.get_u8(1)?
            }
        } else {
            SELECT_INTEGER_MV
        };
        if sh.enable_order_hint {
            sh.order_hint_bits = r.get_u8(3)? + 1;
        }
    }
    sh.enable_superres = r.flag()?;
    r.skip(1)?; // enable_cdef
    r.skip(1)?; // enable_restoration
    // color_config()
    let c = &mut sh.color;
    c.high_bitdepth = r.flag()?;
    if sh.seq_profile == 2 && c.high_bitdepth {
        c.twelve_bit = r.flag()?;
    }
    c.mono_chrome = if sh.seq_profile == 1 { false } else { r.flag()? };
    if r.flag()? {
        // color_description_present_flag
        c.color_primaries = r.get_u8(8)?;
        c.transfer_characteristics = r.get_u8(8)?;
        c.matrix_coefficients = r.get_u8(8)?;
    } else {
        c.color_primaries = 2; // unspecified
        c.transfer_characteristics = 2;
        c.matrix_coefficients = 2;
    }
    if c.mono_chrome {
        c.color_range = r.flag()?;
        c.subsampling_x = 1;
        c.subsampling_y = 1;
    } else if c.color_primaries == 1 && c.transfer_characteristics == 13 && c.matrix_coefficients == 0
    {
        // sRGB
        c.color_range = true;
        c.subsampling_x = 0;
        c.subsampling_y = 0;
    } else {
        c.color_range = r.flag()?;
        match sh.seq_profile {
            0 => {
                c.subsampling_x = 1;
                c.subsampling_y = 1;
            }
            1 => {
                c.subsampling_x = 0;
                c.subsampling_y = 0;
            }
            _ => {
                if c.twelve_bit {
                    c.subsampling_x = r.get_u8(1)?;
                    c.subsampling_y = if c.subsampling_x == 1 { r.get_u8(1)? } else { 0 };
                } else {
                    c.subsampling_x = 1;
                    c.subsampling_y = 0;
                }
            }
        }
        if c.subsampling_x == 1 && c.subsampling_y == 1 {
            c.chroma_sample_position = r.get_u8(2)?;
        }
    }
    if !c.mono_chrome {
        r.skip(1)?; // separate_uv_delta_q
    }
    // film_grain_params_present follows; nothing further matters here.
    Ok(sh)
}

/// Frame-size state of one reference slot, carried between frame headers.
#[derive(Clone, Copy, Debug, Default)]
struct RefInfo {
    valid: bool,
    frame_type: u8,
    showable: bool,
    upscaled_width: u32,
    frame_height: u32,
    render_width: u32,
    render_height: u32,
}

/// Decoder state threaded through a stream's frame headers.
#[derive(Clone, Debug, Default)]
pub struct DecoderState {
    refs: [RefInfo; NUM_REF_FRAMES],
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FrameHeader {
    pub show_existing_frame: bool,
    pub frame_type: u8,
    pub show_frame: bool,
    pub render_width: u32,
    pub render_height: u32,
}

struct FrameSize {
    upscaled_width: u32,
    frame_height: u32,
    render_width: u32,
    render_height: u32,
}

fn parse_frame_size(
    r: &mut NalBits,
    seq: &SequenceHeader,
    frame_size_override: bool,
) -> Result<FrameSize, Error> {
    let (frame_width, frame_height) = if frame_size_override {
        (
            r.get_u32(seq.frame_width_bits)? + 1,
            r.get_u32(seq.frame_height_bits)? + 1,
        )
    } else {
        (seq.max_frame_width, seq.max_frame_height)
    };
    // superres_params(): the upscaled width is the pre-superres width.
    let upscaled_width = frame_width;
    if seq.enable_superres && r.flag()? {
        r.skip(3)?; // coded_denom
    }
    // render_size()
    let (render_width, render_height) = if r.flag()? {
        (r.get_u32(16)? + 1, r.get_u32(16)? + 1)
    } else {
        (upscaled_width, frame_height)
    };
    Ok(FrameSize {
        upscaled_width,
        frame_height,
        render_width,
        render_height,
    })
}

/// Parses an uncompressed frame header far enough to learn the frame type,
/// show flags, and render size, updating the reference slots in `state`.
pub fn parse_frame_header(
    payload: &[u8],
    seq: &SequenceHeader,
    state: &mut DecoderState,
) -> Result<FrameHeader, Error> {
    let mut r = NalBits::new(payload);
    let mut fh = FrameHeader::default();
    if seq.reduced_still_picture_header {
        fh.frame_type = KEY_FRAME;
        fh.show_frame = true;
        let size = parse_frame_size(&mut r, seq, false)?;
        fh.render_width = size.render_width;
        fh.render_height = size.render_height;
        update_refs(state, 0xFF, fh.frame_type, true, &size);
        return Ok(fh);
    }
    fh.show_existing_frame = r.flag()?;
    if fh.show_existing_frame {
        let idx = usize::from(r.get_u8(3)?);
        let rf = &state.refs[idx];
        if !rf.valid {
            bail!("show_existing_frame references an empty slot");
        }
        if !rf.showable {
            bail!("show_existing_frame references a non-showable frame");
        }
        fh.frame_type = rf.frame_type;
        fh.show_frame = true;
        fh.render_width = rf.render_width;
        fh.render_height = rf.render_height;
        return Ok(fh);
    }
    fh.frame_type = r.get_u8(2)?;
    fh.show_frame = r.flag()?;
    if fh.show_frame && seq.decoder_model_info_present && !seq.equal_picture_interval {
        // temporal_point_info()
        r.skip(u64::from(seq.frame_presentation_time_length))?;
    }
    let showable = if fh.show_frame { false } else { r.flag()? };
    let frame_is_intra = fh.frame_type == KEY_FRAME || fh.frame_type == INTRA_ONLY_FRAME;
    let error_resilient_mode = if fh.frame_type == SWITCH_FRAME
        || (fh.frame_type == KEY_FRAME && fh.show_frame)
    {
        true
    } else {
        r.flag()?
    };
    r.skip(1)?; // disable_cdf_update
    let allow_screen_content_tools =
        if seq.seq_force_screen_content_tools == SELECT_SCREEN_CONTENT_TOOLS {
            r.flag()?
        } else {
            seq.seq_force_screen_content_tools != 0
        };
    if allow_screen_content_tools && seq.seq_force_integer_mv == SELECT_INTEGER_MV {
        r.skip(1)?; // force_integer_mv
    }
    if seq.frame_id_numbers_present {
        let bits = seq.delta_frame_id_length + seq.additional_frame_id_length;
        r.skip(u64::from(bits))?; // current_frame_id
    }
    let frame_size_override = if fh.frame_type == SWITCH_FRAME {
        true
    } else {
        r.flag()?
    };
    if seq.enable_order_hint {
        r.skip(u64::from(seq.order_hint_bits))?; // order_hint
    }
    if !frame_is_intra && !error_resilient_mode {
        r.skip(3)?; // primary_ref_frame
    }
    if seq.decoder_model_info_present && r.flag()? {
        // buffer_removal_time_present_flag
        for i in 0..usize::from(seq.operating_points_cnt) {
            if seq.op_has_decoder_model[i] {
                r.skip(u64::from(seq.buffer_delay_length))?; // buffer_removal_time
            }
        }
    }
    let refresh_frame_flags: u8 =
        if fh.frame_type == SWITCH_FRAME || (fh.frame_type == KEY_FRAME && fh.show_frame) {
            0xFF
        } else {
            r.get_u8(8)?
        };
    if (!frame_is_intra || refresh_frame_flags != 0xFF)
        && error_resilient_mode
        && seq.enable_order_hint
    {
        for _ in 0..NUM_REF_FRAMES {
            r.skip(u64::from(seq.order_hint_bits))?; // ref_order_hint
        }
    }
    let size = if frame_is_intra {
        parse_frame_size(&mut r, seq, frame_size_override)?
    } else {
        // Reference frame selection.
        let frame_refs_short_signaling = if seq.enable_order_hint && r.flag()? {
            r.skip(3)?; // last_frame_idx
            r.skip(3)?; // gold_frame_idx
            true
        } else {
            false
        };
        let mut ref_idx = [0usize; 7];
        for slot in ref_idx.iter_mut() {
            if !frame_refs_short_signaling {
                *slot = usize::from(r.get_u8(3)?);
            }
            if seq.frame_id_numbers_present {
                r.skip(u64::from(seq.delta_frame_id_length))?; // delta_frame_id_minus_1
            }
        }
        if frame_refs_short_signaling {
            // The sizes of short-signaled refs come from the decoder's
            // reference ordering, which this parser doesn't reconstruct;
            // fall back to the sequence maximum.
            FrameSize {
                upscaled_width: seq.max_frame_width,
                frame_height: seq.max_frame_height,
                render_width: seq.max_frame_width,
                render_height: seq.max_frame_height,
            }
        } else {
            // frame_size_with_refs()
            let mut found: Option<FrameSize> = None;
            for &idx in &ref_idx {
                if r.flag()? {
                    // found_ref
                    let rf = &state.refs[idx];
                    found = Some(FrameSize {
                        upscaled_width: rf.upscaled_width,
                        frame_height: rf.frame_height,
                        render_width: rf.render_width,
                        render_height: rf.render_height,
                    });
                    break;
                }
            }
            match found {
                Some(size) => {
                    if seq.enable_superres && r.flag()? {
                        r.skip(3)?; // coded_denom
                    }
                    size
                }
                None => parse_frame_size(&mut r, seq, frame_size_override)?,
            }
        }
    };
    fh.render_width = size.render_width;
    fh.render_height = size.render_height;
    update_refs(
        state,
        refresh_frame_flags,
        fh.frame_type,
        fh.show_frame || showable,
        &size,
    );
    Ok(fh)
}

fn update_refs(
    state: &mut DecoderState,
    refresh_frame_flags: u8,
    frame_type: u8,
    showable: bool,
    size: &FrameSize,
) {
    for (i, rf) in state.refs.iter_mut().enumerate() {
        if refresh_frame_flags & (1 << i) != 0 {
            *rf = RefInfo {
                valid: true,
                frame_type,
                showable,
                upscaled_width: size.upscaled_width,
                frame_height: size.frame_height,
                render_width: size.render_width,
                render_height: size.render_height,
            };
        }
    }
}

/// The fields of an `AV1CodecConfigurationRecord` plus the raw configOBUs.
#[derive(Clone, Debug, Default)]
pub struct Av1CodecConfiguration {
    pub seq_profile: u8,
    pub seq_level_idx_0: u8,
    pub seq_tier_0: bool,
    pub high_bitdepth: bool,
    pub twelve_bit: bool,
    pub monochrome: bool,
    pub chroma_subsampling_x: u8,
    pub chroma_subsampling_y: u8,
    pub chroma_sample_position: u8,
    pub initial_presentation_delay_present: bool,
    pub initial_presentation_delay_minus_one: u8,
    pub config_obus: Vec<u8>,
}

impl Av1CodecConfiguration {
    pub fn from_sequence_header(sh: &SequenceHeader) -> Av1CodecConfiguration {
        Av1CodecConfiguration {
            seq_profile: sh.seq_profile,
            seq_level_idx_0: sh.seq_level_idx_0,
            seq_tier_0: sh.seq_tier_0,
            high_bitdepth: sh.color.high_bitdepth,
            twelve_bit: sh.color.twelve_bit,
            monochrome: sh.color.mono_chrome,
            chroma_subsampling_x: sh.color.subsampling_x,
            chroma_subsampling_y: sh.color.subsampling_y,
            chroma_sample_position: sh.color.chroma_sample_position,
            initial_presentation_delay_present: sh.initial_display_delay_present,
            initial_presentation_delay_minus_one: sh.initial_display_delay_minus_1_0,
            config_obus: Vec::new(),
        }
    }

    /// Serializes the `av1C` box payload.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.config_obus.len());
        buf.put_u8(0x81); // marker + version 1
        buf.put_u8((self.seq_profile << 5) | (self.seq_level_idx_0 & 0x1f));
        buf.put_u8(
            (u8::from(self.seq_tier_0) << 7)
                | (u8::from(self.high_bitdepth) << 6)
                | (u8::from(self.twelve_bit) << 5)
                | (u8::from(self.monochrome) << 4)
                | (self.chroma_subsampling_x << 3)
                | (self.chroma_subsampling_y << 2)
                | (self.chroma_sample_position & 0x3),
        );
        if self.initial_presentation_delay_present {
            buf.put_u8(0x10 | (self.initial_presentation_delay_minus_one & 0xf));
        } else {
            buf.put_u8(0);
        }
        buf.extend_from_slice(&self.config_obus);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A hand-assembled minimal sequence header: profile 0, level 8
    /// (3.0), no timing info, one operating point, 1280x720, no frame
    /// ids, order hints on with 7 bits, 8-bit 4:2:0.
    fn sequence_header_bytes() -> Vec<u8> {
        let mut bits: Vec<bool> = Vec::new();
        let mut push = |v: u64, n: u8| {
            for i in (0..n).rev() {
                bits.push(v & (1 << i) != 0);
            }
        };
        push(0, 3); // seq_profile
        push(0, 1); // still_picture
        push(0, 1); // reduced_still_picture_header
        push(0, 1); // timing_info_present_flag
        push(0, 1); // initial_display_delay_present_flag
        push(0, 5); // operating_points_cnt_minus_1
        push(0, 12); // operating_point_idc[0]
        push(8, 5); // seq_level_idx[0]
        push(10, 4); // frame_width_bits_minus_1 (11 bits)
        push(9, 4); // frame_height_bits_minus_1 (10 bits)
        push(1279, 11); // max_frame_width_minus_1
        push(719, 10); // max_frame_height_minus_1
        push(0, 1); // frame_id_numbers_present_flag
        push(1, 1); // use_128x128_superblock
        push(0, 1); // enable_filter_intra
        push(0, 1); // enable_intra_edge_filter
        push(0, 1); // enable_interintra_compound
        push(0, 1); // enable_masked_compound
        push(0, 1); // enable_warped_motion
        push(0, 1); // enable_dual_filter
        push(1, 1); // enable_order_hint
        push(0, 1); // enable_jnt_comp
        push(0, 1); // enable_ref_frame_mvs
        push(1, 1); // seq_choose_screen_content_tools
        push(1, 1); // seq_choose_integer_mv
        push(6, 3); // order_hint_bits_minus_1
        push(0, 1); // enable_superres
        push(0, 1); // enable_cdef
        push(1, 1); // enable_restoration
        push(0, 1); // high_bitdepth
        push(0, 1); // mono_chrome
        push(0, 1); // color_description_present_flag
        push(0, 1); // color_range
        push(0, 2); // chroma_sample_position
        push(0, 1); // separate_uv_delta_q
        push(0, 1); // film_grain_params_present
        push(1, 1); // trailing bit
        let mut bytes = vec![0u8; (bits.len() + 7) / 8];
        for (i, b) in bits.iter().enumerate() {
            if *b {
                bytes[i / 8] |= 1 << (7 - i % 8);
            }
        }
        bytes
    }

    #[test]
    fn sequence_header_dimensions() {
        let sh = parse_sequence_header(&sequence_header_bytes()).unwrap();
        assert_eq!(sh.seq_profile, 0);
        assert_eq!(sh.seq_level_idx_0, 8);
        assert_eq!(sh.max_frame_width, 1280);
        assert_eq!(sh.max_frame_height, 720);
        assert!(sh.enable_order_hint);
        assert_eq!(sh.order_hint_bits, 7);
        assert_eq!(sh.color.subsampling_x, 1);
        assert_eq!(sh.color.subsampling_y, 1);
    }

    #[test]
    fn obu_split() {
        // OBU header: type 1 (sequence header), has_size, 3-byte payload.
        let data = [0b0_0001_010, 3, 0xAA, 0xBB, 0xCC, 0x42];
        let obu = next_obu(&data).unwrap();
        assert_eq!(obu.obu_type, OBU_SEQUENCE_HEADER);
        assert_eq!(obu.header_len, 2);
        assert_eq!(obu.payload, &[0xAA, 0xBB, 0xCC]);
        assert_eq!(obu.encoded_len(), 5);
    }

    #[test]
    fn av1c_layout() {
        let sh = parse_sequence_header(&sequence_header_bytes()).unwrap();
        let mut config = Av1CodecConfiguration::from_sequence_header(&sh);
        config.config_obus = vec![0xDE, 0xAD];
        let b = config.serialize();
        assert_eq!(b[0], 0x81);
        assert_eq!(b[1], 8); // profile 0, level 8
        assert_eq!(b[2], 0b0_0_0_0_1_1_00); // 4:2:0
        assert_eq!(&b[4..], &[0xDE, 0xAD]);
    }
}
