//! H.264 bitstream syntax: NAL headers, SPS/PPS, SEI, slice headers,
//! picture order counts, and the `avcC` decoder configuration record.
//!
//! References:
//! *   [ITU-T Recommendation H.264](https://www.itu.int/rec/T-REC-H.264) (04/13)
//! *   ISO/IEC 14496-15:2010 (AVC file format, `AVCDecoderConfigurationRecord`)

use bytes::{BufMut, Bytes, BytesMut};
use failure::{bail, format_err, Error};
use smallvec::SmallVec;
use std::convert::TryFrom;

use crate::bits::{unescape_rbsp, NalBits};
use crate::codec::nalu::{
    self, measure_nalu, ParameterSet, LONG_START_CODE_LENGTH, SHORT_START_CODE_LENGTH,
};
use crate::stream::ByteStream;

pub const NALU_TYPE_SLICE_N_IDR: u8 = 1;
pub const NALU_TYPE_SLICE_DP_A: u8 = 2;
pub const NALU_TYPE_SLICE_DP_B: u8 = 3;
pub const NALU_TYPE_SLICE_DP_C: u8 = 4;
pub const NALU_TYPE_SLICE_IDR: u8 = 5;
pub const NALU_TYPE_SEI: u8 = 6;
pub const NALU_TYPE_SPS: u8 = 7;
pub const NALU_TYPE_PPS: u8 = 8;
pub const NALU_TYPE_AUD: u8 = 9;
pub const NALU_TYPE_EOS: u8 = 10;
pub const NALU_TYPE_EOB: u8 = 11;
pub const NALU_TYPE_FD: u8 = 12;
pub const NALU_TYPE_SPS_EXT: u8 = 13;
pub const NALU_TYPE_PREFIX: u8 = 14;
pub const NALU_TYPE_RSV_NVCL18: u8 = 18;
pub const NALU_TYPE_SLICE_AUX: u8 = 19;
pub const NALU_TYPE_SLICE_EXT: u8 = 20;
pub const NALU_TYPE_SLICE_EXT_DVC: u8 = 21;
pub const NALU_TYPE_UNSPECIFIED0: u8 = 0;

const SLICE_TYPE_P: u8 = 0;
const SLICE_TYPE_B: u8 = 1;
const SLICE_TYPE_I: u8 = 2;
const SLICE_TYPE_SP: u8 = 3;
const SLICE_TYPE_SI: u8 = 4;

fn requires_avcc_extension(profile_idc: u8) -> bool {
    profile_idc == 100 || profile_idc == 110 || profile_idc == 122 || profile_idc == 144
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NaluHeader {
    pub nal_ref_idc: u8,
    pub nal_unit_type: u8,
    /// NAL header length in bytes.
    pub length: usize,
}

/// Checks the NAL header at the current position (just past a start code
/// of the given length) against the constraints of section 7.4.1.
fn check_nalu_header(bs: &mut ByteStream, use_long_start_code: bool) -> Result<NaluHeader, Error> {
    let offset = if use_long_start_code {
        LONG_START_CODE_LENGTH
    } else {
        SHORT_START_CODE_LENGTH
    };
    let temp8 = bs.show_byte(offset);
    let nuh = NaluHeader {
        nal_ref_idc: (temp8 >> 5) & 0x03,
        nal_unit_type: temp8 & 0x1f,
        length: 1,
    };
    if nuh.nal_unit_type == NALU_TYPE_PREFIX
        || nuh.nal_unit_type == NALU_TYPE_SLICE_EXT
        || nuh.nal_unit_type == NALU_TYPE_SLICE_EXT_DVC
    {
        // SVC and MVC elemental streams are not supported.
        bail!("unsupported NALU type {}", nuh.nal_unit_type);
    }
    if temp8 & 0x80 != 0 {
        bail!("forbidden_zero_bit is set");
    }
    // SPS and PPS require a long start code; so does the AU delimiter,
    // which must come first in its AU.
    if !use_long_start_code
        && (nuh.nal_unit_type == NALU_TYPE_SPS
            || nuh.nal_unit_type == NALU_TYPE_PPS
            || nuh.nal_unit_type == NALU_TYPE_AUD)
    {
        bail!("short start code on NALU type {}", nuh.nal_unit_type);
    }
    if nuh.nal_ref_idc != 0 {
        // nal_ref_idc shall be 0 for NALU types 6, 9, 10, 11 and 12.
        if nuh.nal_unit_type == NALU_TYPE_SEI
            || nuh.nal_unit_type == NALU_TYPE_AUD
            || nuh.nal_unit_type == NALU_TYPE_EOS
            || nuh.nal_unit_type == NALU_TYPE_EOB
            || nuh.nal_unit_type == NALU_TYPE_FD
        {
            bail!("nal_ref_idc set on NALU type {}", nuh.nal_unit_type);
        }
    } else if nuh.nal_unit_type == NALU_TYPE_SLICE_IDR {
        // ...and shall not be 0 for type 5.
        bail!("nal_ref_idc clear on an IDR slice");
    }
    Ok(nuh)
}

/// The outcome of looking for the NAL unit at the current position.
pub enum ScanOutcome {
    Nalu {
        header: NaluHeader,
        nalu_length: u64,
        start_code_length: usize,
        trailing_zero_bytes: u64,
    },
    NoStartCode,
}

pub fn find_next_start_code(bs: &mut ByteStream) -> ScanOutcome {
    let start_code_length = match nalu::current_start_code(bs) {
        Some(n) => n,
        None => return ScanOutcome::NoStartCode,
    };
    let header = match check_nalu_header(bs, start_code_length == LONG_START_CODE_LENGTH) {
        Ok(h) => h,
        Err(_) => return ScanOutcome::NoStartCode,
    };
    let scan = measure_nalu(bs, start_code_length, header.length);
    ScanOutcome::Nalu {
        header,
        nalu_length: scan.nalu_length,
        start_code_length,
        trailing_zero_bytes: scan.trailing_zero_bytes,
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Hrd {
    pub present: bool,
    pub cpb_dpb_delays_present: bool,
    pub cpb_removal_delay_length: u8,
    pub dpb_output_delay_length: u8,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Vui {
    pub sar_width: u16,
    pub sar_height: u16,
    pub video_full_range_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,
    pub pic_struct_present_flag: bool,
    pub hrd: Hrd,
}

#[derive(Clone, Debug, Default)]
pub struct Sps {
    pub present: bool,
    pub profile_idc: u8,
    pub constraint_set_flags: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub chroma_array_type: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_frame_num: u8,
    pub max_frame_num: u32,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb: u8,
    pub max_pic_order_cnt_lsb: u32,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: Vec<i32>,
    pub expected_delta_per_pic_order_cnt_cycle: i64,
    pub max_num_ref_frames: u32,
    pub frame_mbs_only_flag: bool,
    pub pic_size_in_map_units: u32,
    pub cropped_width: u32,
    pub cropped_height: u32,
    pub vui: Vui,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Pps {
    pub present: bool,
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u8,
    pub slice_group_map_type: u8,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub deblocking_filter_control_present_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub slice_group_change_rate: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PicTimingSei {
    pub present: bool,
    pub pic_struct: u8,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RecoveryPointSei {
    pub present: bool,
    pub random_accessible: bool,
    pub broken_link_flag: bool,
    pub recovery_frame_cnt: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Sei {
    pub pic_timing: PicTimingSei,
    pub recovery_point: RecoveryPointSei,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SliceInfo {
    pub present: bool,
    /// Only for slice data partitions.
    pub slice_id: u8,
    pub slice_type: u8,
    pub pic_order_cnt_type: u8,
    pub nal_ref_idc: u8,
    pub idr_pic_flag: bool,
    pub seq_parameter_set_id: u8,
    pub pic_parameter_set_id: u8,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub has_mmco5: bool,
    pub has_redundancy: bool,
    pub idr_pic_id: u16,
    pub frame_num: u32,
    pub pic_order_cnt_lsb: i32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
}

/// Cumulative slice types of a picture, ISO/IEC 14496-15 terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd)]
pub enum PictureType {
    Idr = 0,
    I = 1,
    IP = 2,
    IPB = 3,
    Si = 4,
    SiSp = 5,
    ISi = 6,
    ISiPSp = 7,
    ISiPSpB = 8,
    None = 9,
}

impl Default for PictureType {
    fn default() -> Self {
        PictureType::None
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PictureInfo {
    pub picture_type: PictureType,
    pub idr: bool,
    pub random_accessible: bool,
    pub independent: bool,
    pub disposable: bool,
    pub has_redundancy: bool,
    pub has_primary: bool,
    pub pic_parameter_set_id: u8,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    /// DeltaTfiDivisor: duration of this picture in field units.
    pub delta: u32,
    pub broken_link_flag: bool,
    /* POC */
    pub has_mmco5: bool,
    pub ref_pic_has_mmco5: bool,
    pub ref_pic_bottom_field_flag: bool,
    pub ref_pic_top_field_order_cnt: i32,
    pub ref_pic_order_cnt_msb: i32,
    pub ref_pic_order_cnt_lsb: i32,
    pub pic_order_cnt_lsb: i32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub pic_order_cnt: i32,
    pub frame_num_offset: u32,
    /* */
    pub recovery_frame_cnt: u32,
    pub frame_num: u32,
}

/// How a new parameter set relates to a decoder configuration record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Appendable {
    /// Byte-identical set already present; skip it.
    Duplicated,
    /// Merge into the record.
    Possible,
    /// Incompatible with the record; subsequent AUs need a new one.
    NewDcrRequired,
    /// Same decoder configuration but a different visual presentation
    /// size; a new sample entry is enough.
    NewSampleEntryRequired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterSetType {
    Sps,
    Pps,
    SpsExt,
}

/// The fields and parameter sets of an `AVCDecoderConfigurationRecord`.
#[derive(Clone, Debug)]
pub struct AvcConfigurationRecord {
    pub profile_indication: u8,
    pub profile_compatibility: u8,
    pub level_indication: u8,
    pub length_size_minus_one: u8,
    pub chroma_format: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub sps_list: Vec<ParameterSet>,
    pub pps_list: Vec<ParameterSet>,
    pub spsext_list: Vec<ParameterSet>,
}

impl Default for AvcConfigurationRecord {
    fn default() -> Self {
        AvcConfigurationRecord {
            profile_indication: 0,
            profile_compatibility: 0,
            level_indication: 0,
            length_size_minus_one: (nalu::NALU_LENGTH_SIZE - 1) as u8,
            chroma_format: 0,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            sps_list: Vec::new(),
            pps_list: Vec::new(),
            spsext_list: Vec::new(),
        }
    }
}

/// Reads `seq_parameter_set_id` from an SPS EBSP (header byte excluded).
fn get_sps_id(ps_ebsp: &[u8]) -> Result<u8, Error> {
    // sps_id spans at most 11 bits after the 24-bit prefix: 5 bytes, plus
    // one for a possible emulation prevention byte.
    let rbsp = unescape_rbsp(&ps_ebsp[..ps_ebsp.len().min(6)]);
    let mut bits = NalBits::new(&rbsp);
    bits.skip(24)?; // profile_idc, constraint_set_flags and level_idc
    let id = bits.ue()?;
    if id > 31 {
        bail!("seq_parameter_set_id {} out of range", id);
    }
    Ok(id as u8)
}

/// Reads `pic_parameter_set_id` from a PPS EBSP (header byte excluded).
fn get_pps_id(ps_ebsp: &[u8]) -> Result<u8, Error> {
    // pps_id spans at most 17 bits: 3 bytes, plus one for a possible
    // emulation prevention byte.
    let rbsp = unescape_rbsp(&ps_ebsp[..ps_ebsp.len().min(4)]);
    let mut bits = NalBits::new(&rbsp);
    let id = bits.ue()?;
    if id > 255 {
        bail!("pic_parameter_set_id {} out of range", id);
    }
    Ok(id as u8)
}

fn get_ps_id(ps_type: ParameterSetType, nal_unit: &[u8]) -> Result<u8, Error> {
    match ps_type {
        ParameterSetType::Sps => get_sps_id(&nal_unit[1..]),
        ParameterSetType::Pps => get_pps_id(&nal_unit[1..]),
        ParameterSetType::SpsExt => bail!("SPS extensions have no identifier of interest"),
    }
}

impl AvcConfigurationRecord {
    fn list(&self, ps_type: ParameterSetType) -> &Vec<ParameterSet> {
        match ps_type {
            ParameterSetType::Sps => &self.sps_list,
            ParameterSetType::Pps => &self.pps_list,
            ParameterSetType::SpsExt => &self.spsext_list,
        }
    }

    fn list_mut(&mut self, ps_type: ParameterSetType) -> &mut Vec<ParameterSet> {
        match ps_type {
            ParameterSetType::Sps => &mut self.sps_list,
            ParameterSetType::Pps => &mut self.pps_list,
            ParameterSetType::SpsExt => &mut self.spsext_list,
        }
    }

    /// Position of the entry with the given identifier, superseded
    /// entries included.
    fn position_of_id(&self, ps_type: ParameterSetType, ps_id: u8) -> Option<usize> {
        self.list(ps_type)
            .iter()
            .position(|ps| get_ps_id(ps_type, &ps.nal_unit).ok() == Some(ps_id))
    }

    /// Classifies whether a parameter set can join this record.
    pub fn check_appendable(
        &self,
        ps_type: ParameterSetType,
        ps_data: &[u8],
    ) -> Result<Appendable, Error> {
        if ps_data.len() < 2 {
            bail!("parameter set too short");
        }
        let nalu_type = ps_data[0] & 0x1f;
        let matches = match ps_type {
            ParameterSetType::Sps => nalu_type == NALU_TYPE_SPS,
            ParameterSetType::Pps => nalu_type == NALU_TYPE_PPS,
            ParameterSetType::SpsExt => nalu_type == NALU_TYPE_SPS_EXT,
        };
        if !matches {
            bail!("parameter set type mismatch");
        }
        if ps_type == ParameterSetType::SpsExt && !requires_avcc_extension(self.profile_indication)
        {
            bail!("SPS extension without an extended profile");
        }
        let list = self.list(ps_type);
        if list.is_empty() {
            return Ok(Appendable::Possible);
        }
        if nalu::same_ps_exists(list, ps_data) {
            return Ok(Appendable::Duplicated);
        }
        let count = nalu::active_ps_count(list);
        let limit = match ps_type {
            ParameterSetType::Sps => 31,
            _ => 255,
        };
        if count >= limit {
            // No more appendable parameter sets.
            return Ok(Appendable::NewDcrRequired);
        }
        if ps_type == ParameterSetType::SpsExt {
            return Ok(Appendable::Possible);
        }
        if ps_type == ParameterSetType::Pps {
            let pps_id = get_pps_id(&ps_data[1..])?;
            for ps in list.iter().filter(|ps| !ps.unused) {
                if get_pps_id(&ps.nal_unit[1..])? == pps_id {
                    // Same pic_parameter_set_id with a different form.
                    return Ok(Appendable::NewDcrRequired);
                }
            }
            return Ok(Appendable::Possible);
        }
        // SPS.
        let sps = parse_sps_minimally(&ps_data[1..])?;
        // If sequence parameter sets are marked with different profiles and
        // the relevant profile compatibility flags are all zero, the stream
        // may need examination; skip that and just split.
        if sps.profile_idc != self.profile_indication {
            return Ok(Appendable::NewDcrRequired);
        }
        // chroma_format_idc, bit_depth_luma_minus8 and bit_depth_chroma_minus8
        // must be identical in all SPSs of a single configuration record.
        if requires_avcc_extension(self.profile_indication)
            && (sps.chroma_format_idc != self.chroma_format
                || sps.bit_depth_luma_minus8 != self.bit_depth_luma_minus8
                || sps.bit_depth_chroma_minus8 != self.bit_depth_chroma_minus8)
        {
            return Ok(Appendable::NewDcrRequired);
        }
        let sps_id = sps.seq_parameter_set_id;
        for (i, ps) in list.iter().enumerate() {
            if ps.unused {
                continue;
            }
            if get_sps_id(&ps.nal_unit[1..])? == sps_id {
                // Same seq_parameter_set_id with a different form.
                return Ok(Appendable::NewDcrRequired);
            }
            if i == 0 {
                // Check if the visual presentation sizes differ.
                let first_sps = parse_sps_minimally(&ps.nal_unit[1..])?;
                if sps.cropped_width != first_sps.cropped_width
                    || sps.cropped_height != first_sps.cropped_height
                {
                    return Ok(Appendable::NewSampleEntryRequired);
                }
            }
        }
        Ok(Appendable::Possible)
    }

    /// Appends a parameter set, reusing a superseded slot with the same
    /// identifier when one exists and otherwise splicing the new entry in
    /// ascending identifier order.
    pub fn append_parameter_set(
        &mut self,
        ps_type: ParameterSetType,
        ps_data: &[u8],
    ) -> Result<(), Error> {
        if ps_data.len() < 2 {
            bail!("parameter set too short");
        }
        if ps_type == ParameterSetType::SpsExt {
            if !requires_avcc_extension(self.profile_indication) {
                return Ok(());
            }
            self.spsext_list.push(ParameterSet::new(ps_data));
            return Ok(());
        }
        let ps_id = get_ps_id(ps_type, ps_data)?;
        let reused = match self.position_of_id(ps_type, ps_id) {
            Some(i) => {
                let ps = &mut self.list_mut(ps_type)[i];
                if !ps.unused {
                    bail!("parameter set id {} already present", ps_id);
                }
                // Reuse the superseded entry's slot.
                ps.unused = false;
                ps.nal_unit = ps_data.to_vec();
                true
            }
            None => {
                self.list_mut(ps_type).push(ParameterSet::new(ps_data));
                false
            }
        };
        if ps_type == ParameterSetType::Sps {
            let sps = parse_sps_minimally(&ps_data[1..])?;
            if nalu::active_ps_count(&self.sps_list) == 1 {
                self.profile_compatibility = 0xff;
            }
            self.profile_indication = sps.profile_idc;
            self.profile_compatibility &= sps.constraint_set_flags;
            self.level_indication = self.level_indication.max(sps.level_idc);
            self.chroma_format = sps.chroma_format_idc;
            self.bit_depth_luma_minus8 = sps.bit_depth_luma_minus8;
            self.bit_depth_chroma_minus8 = sps.bit_depth_chroma_minus8;
        }
        if !reused {
            self.reorder_ascending_id(ps_type, ps_id);
        }
        Ok(())
    }

    /// Moves the just-appended tail entry so active identifiers ascend:
    /// find the nearest lower identifier and splice after it, or the
    /// nearest higher and splice before.
    fn reorder_ascending_id(&mut self, ps_type: ParameterSetType, ps_id: u8) {
        let list = self.list_mut(ps_type);
        let new_entry = match list.pop() {
            Some(e) => e,
            None => return,
        };
        let mut insert_at = None;
        for lower in (0..ps_id).rev() {
            if let Some(i) = list
                .iter()
                .position(|ps| get_ps_id(ps_type, &ps.nal_unit).ok() == Some(lower))
            {
                insert_at = Some(i + 1);
                break;
            }
        }
        if insert_at.is_none() {
            let max_ps_id = if ps_type == ParameterSetType::Sps { 31 } else { 255 };
            for upper in ps_id + 1..=max_ps_id {
                if let Some(i) = list
                    .iter()
                    .position(|ps| get_ps_id(ps_type, &ps.nal_unit).ok() == Some(upper))
                {
                    insert_at = Some(i);
                    break;
                }
            }
        }
        list.insert(insert_at.unwrap_or(list.len()), new_entry);
    }

    /// Serializes an `AVCConfigurationBox` ('avcC'), sentinel reserved
    /// bits and all. At least one active SPS and PPS are required.
    pub fn serialize(&self) -> Result<Bytes, Error> {
        if self.length_size_minus_one != 0
            && self.length_size_minus_one != 1
            && self.length_size_minus_one != 3
        {
            bail!("invalid lengthSizeMinusOne");
        }
        let sps_count = nalu::active_ps_count(&self.sps_list).min(31);
        let pps_count = nalu::active_ps_count(&self.pps_list).min(255);
        if sps_count == 0 || pps_count == 0 {
            bail!("an avcC requires at least one SPS and one PPS");
        }
        fn put_parameter_sets(buf: &mut BytesMut, list: &[ParameterSet], max: usize) {
            for ps in list.iter().filter(|ps| !ps.unused).take(max) {
                buf.put_u16(ps.nal_unit.len() as u16);
                buf.extend_from_slice(&ps.nal_unit);
            }
        }
        let mut buf = BytesMut::new();
        crate::summary::write_box!(&mut buf, b"avcC", {
            buf.put_u8(1); // configurationVersion
            buf.put_u8(self.profile_indication);
            buf.put_u8(self.profile_compatibility);
            buf.put_u8(self.level_indication);
            buf.put_u8(self.length_size_minus_one | 0xfc);
            buf.put_u8(sps_count as u8 | 0xe0); // numOfSequenceParameterSets
            put_parameter_sets(&mut buf, &self.sps_list, sps_count);
            buf.put_u8(pps_count as u8); // numOfPictureParameterSets
            put_parameter_sets(&mut buf, &self.pps_list, pps_count);
            if requires_avcc_extension(self.profile_indication) {
                buf.put_u8(self.chroma_format | 0xfc);
                buf.put_u8(self.bit_depth_luma_minus8 | 0xf8);
                buf.put_u8(self.bit_depth_chroma_minus8 | 0xf8);
                let spsext_count = nalu::active_ps_count(&self.spsext_list).min(255);
                buf.put_u8(spsext_count as u8); // numOfSequenceParameterSetExt
                put_parameter_sets(&mut buf, &self.spsext_list, spsext_count);
            }
        });
        Ok(buf.freeze())
    }
}

fn parse_scaling_list(bits: &mut NalBits, size_of_scaling_list: usize) -> Result<(), Error> {
    // scaling_list( scalingList, sizeOfScalingList, useDefaultScalingMatrixFlag )
    let mut next_scale = 8i64;
    for _ in 0..size_of_scaling_list {
        let delta_scale = bits.se()?;
        if delta_scale < -128 || delta_scale > 127 {
            bail!("delta_scale out of range");
        }
        next_scale = (next_scale + delta_scale + 256) % 256;
        if next_scale == 0 {
            break;
        }
    }
    Ok(())
}

fn parse_hrd_parameters(bits: &mut NalBits, hrd: &mut Hrd) -> Result<(), Error> {
    // hrd_parameters()
    let cpb_cnt_minus1 = bits.ue()?;
    if cpb_cnt_minus1 > 31 {
        bail!("cpb_cnt_minus1 out of range");
    }
    bits.skip(4)?; // bit_rate_scale
    bits.skip(4)?; // cpb_size_scale
    for _ in 0..=cpb_cnt_minus1 {
        bits.ue()?; // bit_rate_value_minus1[ SchedSelIdx ]
        bits.ue()?; // cpb_size_value_minus1[ SchedSelIdx ]
        bits.skip(1)?; // cbr_flag[ SchedSelIdx ]
    }
    bits.skip(5)?; // initial_cpb_removal_delay_length_minus1
    hrd.cpb_removal_delay_length = bits.get_u8(5)? + 1;
    hrd.dpb_output_delay_length = bits.get_u8(5)? + 1;
    bits.skip(5)?; // time_offset_length
    Ok(())
}

const PRE_DEFINED_SAR: [(u16, u16); 17] = [
    (0, 0),
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

/// Parses the profile/chroma/bit-depth prefix of seq_parameter_set_data(),
/// which is all a configuration-record compatibility check needs.
fn parse_sps_prefix(bits: &mut NalBits, sps: &mut Sps) -> Result<(), Error> {
    sps.profile_idc = bits.get_u8(8)?;
    sps.constraint_set_flags = bits.get_u8(8)?;
    sps.level_idc = bits.get_u8(8)?;
    let seq_parameter_set_id = bits.ue()?;
    if seq_parameter_set_id > 31 {
        bail!("seq_parameter_set_id out of range");
    }
    sps.seq_parameter_set_id = seq_parameter_set_id as u8;
    match sps.profile_idc {
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 => {
            sps.chroma_format_idc = bits.ue()? as u8;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = bits.flag()?;
            }
            let bit_depth_luma_minus8 = bits.ue()?;
            if bit_depth_luma_minus8 > 6 {
                bail!("bit_depth_luma_minus8 out of range");
            }
            let bit_depth_chroma_minus8 = bits.ue()?;
            if bit_depth_chroma_minus8 > 6 {
                bail!("bit_depth_chroma_minus8 out of range");
            }
            sps.bit_depth_luma_minus8 = bit_depth_luma_minus8 as u8;
            sps.bit_depth_chroma_minus8 = bit_depth_chroma_minus8 as u8;
            bits.skip(1)?; // qpprime_y_zero_transform_bypass_flag
            if bits.flag()? {
                // seq_scaling_matrix_present_flag
                let num_loops = if sps.chroma_format_idc != 3 { 8 } else { 12 };
                for i in 0..num_loops {
                    if bits.flag()? {
                        // seq_scaling_list_present_flag[i]
                        parse_scaling_list(bits, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }
        _ => {
            sps.chroma_format_idc = 1;
            sps.separate_colour_plane_flag = false;
            sps.bit_depth_luma_minus8 = 0;
            sps.bit_depth_chroma_minus8 = 0;
        }
    }
    Ok(())
}

/// Parses enough of an SPS for appendability checks: the prefix plus the
/// frame dimensions. Timing and POC fields are skipped structurally.
fn parse_sps_minimally(ebsp: &[u8]) -> Result<Sps, Error> {
    // The full parse tolerates everything the minimal one needs.
    parse_sps_rbsp(&unescape_rbsp(ebsp))
}

/// Parses seq_parameter_set_data() from an RBSP.
fn parse_sps_rbsp(rbsp: &[u8]) -> Result<Sps, Error> {
    let mut bits = NalBits::new(rbsp);
    let bits = &mut bits;
    let mut sps = Sps::default();
    parse_sps_prefix(bits, &mut sps)?;
    sps.chroma_array_type = if sps.separate_colour_plane_flag {
        0
    } else {
        sps.chroma_format_idc
    };
    let log2_max_frame_num_minus4 = bits.ue()?;
    if log2_max_frame_num_minus4 > 12 {
        bail!("log2_max_frame_num_minus4 out of range");
    }
    sps.log2_max_frame_num = log2_max_frame_num_minus4 as u8 + 4;
    sps.max_frame_num = 1 << sps.log2_max_frame_num;
    let pic_order_cnt_type = bits.ue()?;
    if pic_order_cnt_type > 2 {
        bail!("pic_order_cnt_type out of range");
    }
    sps.pic_order_cnt_type = pic_order_cnt_type as u8;
    if sps.pic_order_cnt_type == 0 {
        let log2_max_pic_order_cnt_lsb_minus4 = bits.ue()?;
        if log2_max_pic_order_cnt_lsb_minus4 > 12 {
            bail!("log2_max_pic_order_cnt_lsb_minus4 out of range");
        }
        sps.log2_max_pic_order_cnt_lsb = log2_max_pic_order_cnt_lsb_minus4 as u8 + 4;
        sps.max_pic_order_cnt_lsb = 1 << sps.log2_max_pic_order_cnt_lsb;
    } else if sps.pic_order_cnt_type == 1 {
        sps.delta_pic_order_always_zero_flag = bits.flag()?;
        const MAX_VALUE: i64 = (1i64 << 31) - 1;
        let offset_for_non_ref_pic = bits.se()?;
        if offset_for_non_ref_pic < -MAX_VALUE || offset_for_non_ref_pic > MAX_VALUE {
            bail!("offset_for_non_ref_pic out of range");
        }
        sps.offset_for_non_ref_pic = offset_for_non_ref_pic as i32;
        let offset_for_top_to_bottom_field = bits.se()?;
        if offset_for_top_to_bottom_field < -MAX_VALUE || offset_for_top_to_bottom_field > MAX_VALUE
        {
            bail!("offset_for_top_to_bottom_field out of range");
        }
        sps.offset_for_top_to_bottom_field = offset_for_top_to_bottom_field as i32;
        let num_ref_frames_in_pic_order_cnt_cycle = bits.ue()?;
        if num_ref_frames_in_pic_order_cnt_cycle > 255 {
            bail!("num_ref_frames_in_pic_order_cnt_cycle out of range");
        }
        sps.num_ref_frames_in_pic_order_cnt_cycle = num_ref_frames_in_pic_order_cnt_cycle as u8;
        sps.expected_delta_per_pic_order_cnt_cycle = 0;
        for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
            let offset_for_ref_frame = bits.se()?;
            if offset_for_ref_frame < -MAX_VALUE || offset_for_ref_frame > MAX_VALUE {
                bail!("offset_for_ref_frame out of range");
            }
            sps.offset_for_ref_frame.push(offset_for_ref_frame as i32);
            sps.expected_delta_per_pic_order_cnt_cycle += offset_for_ref_frame;
        }
    }
    sps.max_num_ref_frames = bits.ue()? as u32;
    bits.skip(1)?; // gaps_in_frame_num_value_allowed_flag
    let pic_width_in_mbs_minus1 = bits.ue()?;
    let pic_height_in_map_units_minus1 = bits.ue()?;
    sps.frame_mbs_only_flag = bits.flag()?;
    if !sps.frame_mbs_only_flag {
        bits.skip(1)?; // mb_adaptive_frame_field_flag
    }
    bits.skip(1)?; // direct_8x8_inference_flag
    let pic_width_in_mbs = pic_width_in_mbs_minus1 + 1;
    let pic_height_in_map_units = pic_height_in_map_units_minus1 + 1;
    sps.pic_size_in_map_units = (pic_width_in_mbs * pic_height_in_map_units) as u32;
    sps.cropped_width = (pic_width_in_mbs * 16) as u32;
    sps.cropped_height =
        ((2 - u64::from(sps.frame_mbs_only_flag)) * pic_height_in_map_units * 16) as u32;
    if bits.flag()? {
        // frame_cropping_flag
        let (crop_unit_x, crop_unit_y);
        if sps.chroma_array_type == 0 {
            crop_unit_x = 1;
            crop_unit_y = 2 - u32::from(sps.frame_mbs_only_flag);
        } else {
            const SUB_WIDTH_C: [u32; 4] = [0, 2, 2, 1];
            const SUB_HEIGHT_C: [u32; 4] = [0, 2, 1, 1];
            crop_unit_x = SUB_WIDTH_C[usize::from(sps.chroma_format_idc)];
            crop_unit_y = SUB_HEIGHT_C[usize::from(sps.chroma_format_idc)]
                * (2 - u32::from(sps.frame_mbs_only_flag));
        }
        let frame_crop_left_offset = bits.ue()?;
        let frame_crop_right_offset = bits.ue()?;
        let frame_crop_top_offset = bits.ue()?;
        let frame_crop_bottom_offset = bits.ue()?;
        sps.cropped_width = sps
            .cropped_width
            .wrapping_sub(((frame_crop_left_offset + frame_crop_right_offset) as u32) * crop_unit_x);
        sps.cropped_height = sps
            .cropped_height
            .wrapping_sub(((frame_crop_top_offset + frame_crop_bottom_offset) as u32) * crop_unit_y);
    }
    if bits.flag()? {
        // vui_parameters()
        if bits.flag()? {
            // aspect_ratio_info_present_flag
            let aspect_ratio_idc = bits.get_u8(8)?;
            if aspect_ratio_idc == 255 {
                // Extended_SAR
                sps.vui.sar_width = bits.get(16)? as u16;
                sps.vui.sar_height = bits.get(16)? as u16;
            } else if usize::from(aspect_ratio_idc) < PRE_DEFINED_SAR.len() {
                let (w, h) = PRE_DEFINED_SAR[usize::from(aspect_ratio_idc)];
                sps.vui.sar_width = w;
                sps.vui.sar_height = h;
            } else {
                // Behavior for an unknown aspect_ratio_idc is unspecified.
                sps.vui.sar_width = 0;
                sps.vui.sar_height = 0;
            }
        }
        if bits.flag()? {
            // overscan_info_present_flag
            bits.skip(1)?; // overscan_appropriate_flag
        }
        if bits.flag()? {
            // video_signal_type_present_flag
            bits.skip(3)?; // video_format
            sps.vui.video_full_range_flag = bits.flag()?;
            if bits.flag()? {
                // colour_description_present_flag
                sps.vui.colour_primaries = bits.get_u8(8)?;
                sps.vui.transfer_characteristics = bits.get_u8(8)?;
                sps.vui.matrix_coefficients = bits.get_u8(8)?;
            }
        }
        if bits.flag()? {
            // chroma_loc_info_present_flag
            bits.ue()?; // chroma_sample_loc_type_top_field
            bits.ue()?; // chroma_sample_loc_type_bottom_field
        }
        if bits.flag()? {
            // timing_info_present_flag
            sps.vui.num_units_in_tick = bits.get_u32(32)?;
            sps.vui.time_scale = bits.get_u32(32)?;
            sps.vui.fixed_frame_rate_flag = bits.flag()?;
        } else {
            sps.vui.num_units_in_tick = 1; // arbitrary
            sps.vui.time_scale = 50; // arbitrary
            sps.vui.fixed_frame_rate_flag = false;
        }
        let nal_hrd_parameters_present_flag = bits.flag()?;
        if nal_hrd_parameters_present_flag {
            parse_hrd_parameters(bits, &mut sps.vui.hrd)?;
        }
        let vcl_hrd_parameters_present_flag = bits.flag()?;
        if vcl_hrd_parameters_present_flag {
            parse_hrd_parameters(bits, &mut sps.vui.hrd)?;
        }
        if nal_hrd_parameters_present_flag || vcl_hrd_parameters_present_flag {
            sps.vui.hrd.present = true;
            sps.vui.hrd.cpb_dpb_delays_present = true;
            bits.skip(1)?; // low_delay_hrd_flag
        }
        sps.vui.pic_struct_present_flag = bits.flag()?;
        if bits.flag()? {
            // bitstream_restriction_flag
            bits.skip(1)?; // motion_vectors_over_pic_boundaries_flag
            bits.ue()?; // max_bytes_per_pic_denom
            bits.ue()?; // max_bits_per_mb_denom
            bits.ue()?; // log2_max_mv_length_horizontal
            bits.ue()?; // log2_max_mv_length_vertical
            bits.ue()?; // max_num_reorder_frames
            bits.ue()?; // max_dec_frame_buffering
        }
    } else {
        sps.vui.video_full_range_flag = false;
        sps.vui.num_units_in_tick = 1; // arbitrary
        sps.vui.time_scale = 50; // arbitrary
        sps.vui.fixed_frame_rate_flag = false;
    }
    bits.rbsp_trailing_bits()?;
    sps.present = true;
    Ok(sps)
}

/// Parser state threaded through one H.264 elementary stream.
#[derive(Default)]
pub struct H264Parser {
    /// Active decoder configuration record.
    pub avcc: AvcConfigurationRecord,
    /// Pending record, accumulating sets that need a new sample entry.
    pub avcc_next: AvcConfigurationRecord,
    pub avcc_pending: bool,
    /// Parsed SPS/PPS values by identifier, surviving record swaps.
    sps_by_id: SmallVec<[Sps; 1]>,
    pps_by_id: SmallVec<[Pps; 2]>,
    /// Slice-data-partition state by slice_id.
    slices_by_id: SmallVec<[SliceInfo; 1]>,
    /// Active parameter sets and headers.
    pub sps: Sps,
    pub pps: Pps,
    pub sei: Sei,
    pub slice: SliceInfo,
    pub prev_nalu_type: u8,
}

impl H264Parser {
    pub fn new() -> H264Parser {
        H264Parser::default()
    }

    fn sps_by_id(&self, sps_id: u8) -> Result<&Sps, Error> {
        self.sps_by_id
            .iter()
            .find(|s| s.seq_parameter_set_id == sps_id)
            .ok_or_else(|| format_err!("SPS {} has not appeared", sps_id))
    }

    fn pps_by_id(&self, pps_id: u8) -> Result<&Pps, Error> {
        self.pps_by_id
            .iter()
            .find(|p| p.pic_parameter_set_id == pps_id)
            .ok_or_else(|| format_err!("PPS {} has not appeared", pps_id))
    }

    /// Parses a whole SPS and remembers it by identifier.
    pub fn parse_sps(&mut self, ebsp: &[u8]) -> Result<(), Error> {
        let sps = parse_sps_rbsp(&unescape_rbsp(ebsp))?;
        match self
            .sps_by_id
            .iter_mut()
            .find(|s| s.seq_parameter_set_id == sps.seq_parameter_set_id)
        {
            Some(slot) => *slot = sps.clone(),
            None => self.sps_by_id.push(sps.clone()),
        }
        self.sps = sps;
        Ok(())
    }

    /// Parses a whole PPS and remembers it by identifier.
    pub fn parse_pps(&mut self, ebsp: &[u8]) -> Result<(), Error> {
        let rbsp = unescape_rbsp(ebsp);
        let mut bits = NalBits::new(&rbsp);
        let bits = &mut bits;
        let mut pps = Pps::default();
        let pic_parameter_set_id = bits.ue()?;
        if pic_parameter_set_id > 255 {
            bail!("pic_parameter_set_id out of range");
        }
        pps.pic_parameter_set_id = pic_parameter_set_id as u8;
        let seq_parameter_set_id = bits.ue()?;
        if seq_parameter_set_id > 31 {
            bail!("seq_parameter_set_id out of range");
        }
        let sps = self.sps_by_id(seq_parameter_set_id as u8)?.clone();
        pps.seq_parameter_set_id = seq_parameter_set_id as u8;
        pps.entropy_coding_mode_flag = bits.flag()?;
        pps.bottom_field_pic_order_in_frame_present_flag = bits.flag()?;
        let num_slice_groups_minus1 = bits.ue()?;
        if num_slice_groups_minus1 > 7 {
            bail!("num_slice_groups_minus1 out of range");
        }
        pps.num_slice_groups_minus1 = num_slice_groups_minus1 as u8;
        if num_slice_groups_minus1 != 0 {
            let slice_group_map_type = bits.ue()?;
            if slice_group_map_type > 6 {
                bail!("slice_group_map_type out of range");
            }
            pps.slice_group_map_type = slice_group_map_type as u8;
            match slice_group_map_type {
                0 => {
                    for _ in 0..=num_slice_groups_minus1 {
                        bits.ue()?; // run_length_minus1[ iGroup ]
                    }
                }
                2 => {
                    for _ in 0..num_slice_groups_minus1 {
                        bits.ue()?; // top_left[ iGroup ]
                        bits.ue()?; // bottom_right[ iGroup ]
                    }
                }
                3 | 4 | 5 => {
                    bits.skip(1)?; // slice_group_change_direction_flag
                    let slice_group_change_rate_minus1 = bits.ue()?;
                    if slice_group_change_rate_minus1 > u64::from(sps.pic_size_in_map_units) - 1 {
                        bail!("slice_group_change_rate_minus1 out of range");
                    }
                    pps.slice_group_change_rate = slice_group_change_rate_minus1 as u32 + 1;
                }
                6 => {
                    let pic_size_in_map_units_minus1 = bits.ue()?;
                    let length = ceil_log2(num_slice_groups_minus1 + 1);
                    for _ in 0..=pic_size_in_map_units_minus1 {
                        // slice_group_id
                        if bits.get(length as u8)? > num_slice_groups_minus1 {
                            bail!("slice_group_id out of range");
                        }
                    }
                }
                _ => {}
            }
        }
        pps.num_ref_idx_l0_default_active_minus1 = bits.ue()? as u8;
        pps.num_ref_idx_l1_default_active_minus1 = bits.ue()? as u8;
        pps.weighted_pred_flag = bits.flag()?;
        pps.weighted_bipred_idc = bits.get_u8(2)?;
        bits.se()?; // pic_init_qp_minus26
        bits.se()?; // pic_init_qs_minus26
        bits.se()?; // chroma_qp_index_offset
        pps.deblocking_filter_control_present_flag = bits.flag()?;
        bits.skip(1)?; // constrained_intra_pred_flag
        pps.redundant_pic_cnt_present_flag = bits.flag()?;
        if bits.more_rbsp_data() {
            let transform_8x8_mode_flag = bits.flag()?;
            if bits.flag()? {
                // pic_scaling_matrix_present_flag
                let extra = if sps.chroma_format_idc != 3 { 2 } else { 6 };
                let num_loops = 6 + extra * usize::from(transform_8x8_mode_flag);
                for i in 0..num_loops {
                    if bits.flag()? {
                        // pic_scaling_list_present_flag[i]
                        parse_scaling_list(bits, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
            bits.se()?; // second_chroma_qp_index_offset
        }
        bits.rbsp_trailing_bits()?;
        pps.present = true;
        match self
            .pps_by_id
            .iter_mut()
            .find(|p| p.pic_parameter_set_id == pps.pic_parameter_set_id)
        {
            Some(slot) => *slot = pps,
            None => self.pps_by_id.push(pps),
        }
        self.sps = sps;
        self.pps = pps;
        Ok(())
    }

    /// Parses an SEI NALU, recording pic_timing and recovery_point.
    pub fn parse_sei(&mut self, ebsp: &[u8]) -> Result<(), Error> {
        let rbsp = unescape_rbsp(ebsp);
        let mut bits = NalBits::new(&rbsp);
        let bits = &mut bits;
        let mut rbsp_pos: usize = 0;
        loop {
            // sei_message()
            let mut payload_type: u32 = 0;
            loop {
                // 0xff: ff_byte, otherwise: last_payload_type_byte
                let temp = bits.get_u8(8)?;
                payload_type += u32::from(temp);
                rbsp_pos += 1;
                if temp != 0xff {
                    break;
                }
            }
            let mut payload_size: u32 = 0;
            loop {
                let temp = bits.get_u8(8)?;
                payload_size += u32::from(temp);
                rbsp_pos += 1;
                if temp != 0xff {
                    break;
                }
            }
            match payload_type {
                1 => {
                    // pic_timing
                    let hrd = self.sps.vui.hrd;
                    if !self.sps.present {
                        // No active SPS to interpret the delays against.
                        bits.skip(u64::from(payload_size) * 8)?;
                    } else {
                        self.sei.pic_timing.present = true;
                        let mut consumed: u64 = 0;
                        if hrd.cpb_dpb_delays_present {
                            bits.skip(u64::from(hrd.cpb_removal_delay_length))?; // cpb_removal_delay
                            bits.skip(u64::from(hrd.dpb_output_delay_length))?; // dpb_output_delay
                            consumed += u64::from(hrd.cpb_removal_delay_length)
                                + u64::from(hrd.dpb_output_delay_length);
                        }
                        if self.sps.vui.pic_struct_present_flag {
                            self.sei.pic_timing.pic_struct = bits.get_u8(4)?;
                            consumed += 4;
                        }
                        let total = u64::from(payload_size) * 8;
                        if consumed > total {
                            bail!("pic_timing shorter than its fields");
                        }
                        bits.skip(total - consumed)?;
                    }
                }
                3 => {
                    // filler_payload: forbidden in 'avc1' and 'avc2' samples.
                    bail!("filler payload in SEI");
                }
                6 => {
                    // recovery_point
                    self.sei.recovery_point.present = true;
                    self.sei.recovery_point.random_accessible = true;
                    self.sei.recovery_point.recovery_frame_cnt = bits.ue()? as u32;
                    bits.skip(1)?; // exact_match_flag
                    self.sei.recovery_point.broken_link_flag = bits.flag()?;
                    bits.skip(2)?; // changing_slice_group_idc
                }
                _ => {
                    bits.skip(u64::from(payload_size) * 8)?;
                }
            }
            bits.align()?;
            rbsp_pos += payload_size as usize;
            // All SEI messages are byte aligned at their end, so 0x80 must
            // be rbsp_trailing_bits().
            if rbsp_pos >= rbsp.len() || rbsp[rbsp_pos] == 0x80 {
                break;
            }
        }
        Ok(())
    }

    /// Parses a slice NALU far enough to fill `self.slice`.
    pub fn parse_slice(&mut self, nuh: &NaluHeader, ebsp: &[u8]) -> Result<(), Error> {
        // IDR and non-reference slices put everything interesting in the
        // first few dozen bytes; reference B slices may drag the
        // dec_ref_pic_marking far out with long modification lists.
        let limit = if nuh.nal_unit_type == NALU_TYPE_SLICE_IDR || nuh.nal_ref_idc == 0 {
            100
        } else {
            1000
        };
        let rbsp = unescape_rbsp(&ebsp[..ebsp.len().min(limit)]);
        if nuh.nal_unit_type != NALU_TYPE_SLICE_DP_B && nuh.nal_unit_type != NALU_TYPE_SLICE_DP_C {
            return self.parse_slice_header(nuh, &rbsp);
        }
        // slice_data_partition_b_layer_rbsp() or _c_layer_rbsp()
        let mut bits = NalBits::new(&rbsp);
        let slice_id = bits.ue()?;
        let mut slice = *self
            .slices_by_id
            .iter()
            .find(|s| u64::from(s.slice_id) == slice_id)
            .ok_or_else(|| format_err!("partition for unknown slice {}", slice_id))?;
        let pps = *self.pps_by_id(slice.pic_parameter_set_id)?;
        let sps = self.sps_by_id(pps.seq_parameter_set_id)?.clone();
        slice.seq_parameter_set_id = pps.seq_parameter_set_id;
        if sps.separate_colour_plane_flag {
            bits.skip(2)?; // colour_plane_id
        }
        if pps.redundant_pic_cnt_present_flag {
            let redundant_pic_cnt = bits.ue()?;
            if redundant_pic_cnt > 127 {
                bail!("redundant_pic_cnt out of range");
            }
            slice.has_redundancy = redundant_pic_cnt != 0;
        }
        // Skip slice_data() and rbsp_slice_trailing_bits().
        self.sps = sps;
        self.pps = pps;
        self.slice = slice;
        Ok(())
    }

    fn parse_slice_header(&mut self, nuh: &NaluHeader, rbsp: &[u8]) -> Result<(), Error> {
        let mut slice = SliceInfo::default();
        // slice_header()
        let mut bits = NalBits::new(rbsp);
        let bits = &mut bits;
        bits.ue()?; // first_mb_in_slice
        let mut slice_type = bits.ue()?;
        if slice_type > 9 {
            bail!("slice_type out of range");
        }
        if slice_type > 4 {
            slice_type -= 5;
        }
        let slice_type = slice_type as u8;
        slice.slice_type = slice_type;
        let pic_parameter_set_id = bits.ue()?;
        if pic_parameter_set_id > 255 {
            bail!("pic_parameter_set_id out of range");
        }
        slice.pic_parameter_set_id = pic_parameter_set_id as u8;
        let pps = *self.pps_by_id(slice.pic_parameter_set_id)?;
        let sps = self.sps_by_id(pps.seq_parameter_set_id)?.clone();
        slice.seq_parameter_set_id = pps.seq_parameter_set_id;
        slice.nal_ref_idc = nuh.nal_ref_idc;
        slice.idr_pic_flag = nuh.nal_unit_type == NALU_TYPE_SLICE_IDR;
        slice.pic_order_cnt_type = sps.pic_order_cnt_type;
        if (slice.idr_pic_flag || sps.max_num_ref_frames == 0)
            && slice_type != 2
            && slice_type != 4
        {
            bail!("IDR slice with an inter slice_type");
        }
        if sps.separate_colour_plane_flag {
            bits.skip(2)?; // colour_plane_id
        }
        let frame_num = bits.get(sps.log2_max_frame_num)?;
        if frame_num >= 1 << sps.log2_max_frame_num || (slice.idr_pic_flag && frame_num != 0) {
            bail!("frame_num out of range");
        }
        slice.frame_num = frame_num as u32;
        if !sps.frame_mbs_only_flag {
            slice.field_pic_flag = bits.flag()?;
            if slice.field_pic_flag {
                slice.bottom_field_flag = bits.flag()?;
            }
        }
        if slice.idr_pic_flag {
            let idr_pic_id = bits.ue()?;
            if idr_pic_id > 65535 {
                bail!("idr_pic_id out of range");
            }
            slice.idr_pic_id = idr_pic_id as u16;
        }
        if sps.pic_order_cnt_type == 0 {
            let pic_order_cnt_lsb = bits.get(sps.log2_max_pic_order_cnt_lsb)?;
            if pic_order_cnt_lsb >= u64::from(sps.max_pic_order_cnt_lsb) {
                bail!("pic_order_cnt_lsb out of range");
            }
            slice.pic_order_cnt_lsb = pic_order_cnt_lsb as i32;
            if pps.bottom_field_pic_order_in_frame_present_flag && !slice.field_pic_flag {
                slice.delta_pic_order_cnt_bottom = bits.se()? as i32;
            }
        } else if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            slice.delta_pic_order_cnt[0] = bits.se()? as i32;
            if pps.bottom_field_pic_order_in_frame_present_flag && !slice.field_pic_flag {
                slice.delta_pic_order_cnt[1] = bits.se()? as i32;
            }
        }
        if pps.redundant_pic_cnt_present_flag {
            let redundant_pic_cnt = bits.ue()?;
            if redundant_pic_cnt > 127 {
                bail!("redundant_pic_cnt out of range");
            }
            slice.has_redundancy = redundant_pic_cnt != 0;
        }
        if slice_type == SLICE_TYPE_B {
            bits.skip(1)?; // direct_spatial_mv_pred_flag
        }
        let mut num_ref_idx_l0_active_minus1 = u64::from(pps.num_ref_idx_l0_default_active_minus1);
        let mut num_ref_idx_l1_active_minus1 = u64::from(pps.num_ref_idx_l1_default_active_minus1);
        if slice_type == SLICE_TYPE_P || slice_type == SLICE_TYPE_SP || slice_type == SLICE_TYPE_B {
            if bits.flag()? {
                // num_ref_idx_active_override_flag
                num_ref_idx_l0_active_minus1 = bits.ue()?;
                if num_ref_idx_l0_active_minus1 > 31 {
                    bail!("num_ref_idx_l0_active_minus1 out of range");
                }
                if slice_type == SLICE_TYPE_B {
                    num_ref_idx_l1_active_minus1 = bits.ue()?;
                    if num_ref_idx_l1_active_minus1 > 31 {
                        bail!("num_ref_idx_l1_active_minus1 out of range");
                    }
                }
            }
        }
        // ref_pic_list_modification()
        if slice_type == SLICE_TYPE_P || slice_type == SLICE_TYPE_B || slice_type == SLICE_TYPE_SP {
            for _ in 0..1 + u32::from(slice_type == SLICE_TYPE_B) {
                if bits.flag()? {
                    // ref_pic_list_modification_flag_l0/l1
                    loop {
                        let modification_of_pic_nums_idc = bits.ue()?;
                        if modification_of_pic_nums_idc == 3 {
                            break;
                        }
                        bits.ue()?; // abs_diff_pic_num_minus1 or long_term_pic_num
                    }
                }
            }
        }
        if (pps.weighted_pred_flag && (slice_type == SLICE_TYPE_P || slice_type == SLICE_TYPE_SP))
            || (pps.weighted_bipred_idc == 1 && slice_type == SLICE_TYPE_B)
        {
            // pred_weight_table()
            bits.ue()?; // luma_log2_weight_denom
            if sps.chroma_array_type != 0 {
                bits.ue()?; // chroma_log2_weight_denom
            }
            for _ in 0..=num_ref_idx_l0_active_minus1 {
                if bits.flag()? {
                    // luma_weight_l0_flag
                    bits.se()?; // luma_weight_l0[i]
                    bits.se()?; // luma_offset_l0[i]
                }
                if sps.chroma_array_type != 0 && bits.flag()? {
                    // chroma_weight_l0_flag
                    for _ in 0..2 {
                        bits.se()?; // chroma_weight_l0[i][j]
                        bits.se()?; // chroma_offset_l0[i][j]
                    }
                }
            }
            if slice_type == SLICE_TYPE_B {
                for _ in 0..=num_ref_idx_l1_active_minus1 {
                    if bits.flag()? {
                        // luma_weight_l1_flag
                        bits.se()?;
                        bits.se()?;
                    }
                    if sps.chroma_array_type != 0 && bits.flag()? {
                        // chroma_weight_l1_flag
                        for _ in 0..2 {
                            bits.se()?;
                            bits.se()?;
                        }
                    }
                }
            }
        }
        if nuh.nal_ref_idc != 0 {
            // dec_ref_pic_marking()
            if slice.idr_pic_flag {
                bits.skip(1)?; // no_output_of_prior_pics_flag
                bits.skip(1)?; // long_term_reference_flag
            } else if bits.flag()? {
                // adaptive_ref_pic_marking_mode_flag
                loop {
                    let memory_management_control_operation = bits.ue()?;
                    if memory_management_control_operation == 0 {
                        break;
                    }
                    if memory_management_control_operation == 5 {
                        slice.has_mmco5 = true;
                    } else {
                        bits.ue()?;
                        if memory_management_control_operation == 3 {
                            bits.ue()?;
                        }
                    }
                }
            }
        }
        // Stop short of slice_data() unless this is data partition A,
        // whose slice_id trails the header.
        if nuh.nal_unit_type == NALU_TYPE_SLICE_DP_A {
            if pps.entropy_coding_mode_flag
                && slice_type != SLICE_TYPE_I
                && slice_type != SLICE_TYPE_SI
            {
                bits.ue()?; // cabac_init_idc
            }
            bits.se()?; // slice_qp_delta
            if slice_type == SLICE_TYPE_SP || slice_type == SLICE_TYPE_SI {
                if slice_type == SLICE_TYPE_SP {
                    bits.skip(1)?; // sp_for_switch_flag
                }
                bits.se()?; // slice_qs_delta
            }
            if pps.deblocking_filter_control_present_flag && bits.ue()? != 1 {
                // disable_deblocking_filter_idc
                let slice_alpha_c0_offset_div2 = bits.se()?;
                if slice_alpha_c0_offset_div2 < -6 || slice_alpha_c0_offset_div2 > 6 {
                    bail!("slice_alpha_c0_offset_div2 out of range");
                }
                let slice_beta_offset_div2 = bits.se()?;
                if slice_beta_offset_div2 < -6 || slice_beta_offset_div2 > 6 {
                    bail!("slice_beta_offset_div2 out of range");
                }
            }
            if pps.num_slice_groups_minus1 != 0
                && (pps.slice_group_map_type == 3
                    || pps.slice_group_map_type == 4
                    || pps.slice_group_map_type == 5)
            {
                let temp =
                    (u64::from(sps.pic_size_in_map_units) - 1) / u64::from(pps.slice_group_change_rate) + 1;
                let slice_group_change_cycle = bits.get(ceil_log2(temp + 1) as u8)?;
                if slice_group_change_cycle > temp {
                    bail!("slice_group_change_cycle out of range");
                }
            }
            // end of slice_header()
            slice.slice_id = bits.ue()? as u8;
            match self
                .slices_by_id
                .iter_mut()
                .find(|s| s.slice_id == slice.slice_id)
            {
                Some(slot) => *slot = slice,
                None => self.slices_by_id.push(slice),
            }
        }
        self.sps = sps;
        self.pps = pps;
        self.slice = slice;
        self.slice.present = true;
        Ok(())
    }

    /// Classifies and appends a parameter set, routing it to the pending
    /// record when it forces a new configuration. Returns whether the
    /// pending record is now in play.
    pub fn try_to_append_parameter_set(
        &mut self,
        ps_type: ParameterSetType,
        ps_data: &[u8],
    ) -> Result<(), Error> {
        let verdict = self.avcc.check_appendable(ps_type, ps_data)?;
        let into_pending = match verdict {
            Appendable::Duplicated => return Ok(()), // no need to append
            Appendable::NewDcrRequired | Appendable::NewSampleEntryRequired => {
                self.avcc_pending = true;
                true
            }
            Appendable::Possible => self.avcc_pending,
        };
        match ps_type {
            ParameterSetType::Sps => self.parse_sps(&ps_data[1..])?,
            ParameterSetType::Pps => self.parse_pps(&ps_data[1..])?,
            ParameterSetType::SpsExt => {}
        }
        let param = if into_pending {
            &mut self.avcc_next
        } else {
            &mut self.avcc
        };
        param.append_parameter_set(ps_type, ps_data)
    }

    /// Marks the parameter sets a delivered slice references as used,
    /// restoring superseded entries that a byte-identical set revived.
    fn mark_parameter_sets_used(&mut self, slice: &SliceInfo) {
        for &(ps_type, ps_id) in &[
            (ParameterSetType::Sps, slice.seq_parameter_set_id),
            (ParameterSetType::Pps, slice.pic_parameter_set_id),
        ] {
            if let Some(i) = self.avcc.position_of_id(ps_type, ps_id) {
                if self.avcc.list(ps_type)[i].unused {
                    let nal_unit = self.avcc.list(ps_type)[i].nal_unit.clone();
                    let _ = self.avcc.append_parameter_set(ps_type, &nal_unit);
                }
            }
        }
    }

    /// Replaces the active record with the pending one. Parameter sets of
    /// the old record are marked unused; entries of the pending record
    /// take over their identifier slots.
    pub fn move_pending_avcc(&mut self) -> Result<(), Error> {
        if !self.avcc_pending {
            return Ok(());
        }
        for &ps_type in &[
            ParameterSetType::Sps,
            ParameterSetType::Pps,
            ParameterSetType::SpsExt,
        ] {
            for ps in self.avcc.list_mut(ps_type).iter_mut() {
                ps.unused = true;
            }
        }
        let pending = std::mem::take(&mut self.avcc_next);
        for &ps_type in &[ParameterSetType::Sps, ParameterSetType::Pps] {
            for src in pending.list(ps_type) {
                let src_id = get_ps_id(ps_type, &src.nal_unit)?;
                match self.avcc.position_of_id(ps_type, src_id) {
                    Some(i) => {
                        let slot = &mut self.avcc.list_mut(ps_type)[i];
                        slot.nal_unit = src.nal_unit.clone();
                        slot.unused = src.unused;
                    }
                    None => self.avcc.list_mut(ps_type).push(src.clone()),
                }
            }
        }
        self.avcc.profile_indication = pending.profile_indication;
        self.avcc.profile_compatibility = pending.profile_compatibility;
        self.avcc.level_indication = pending.level_indication;
        self.avcc.chroma_format = pending.chroma_format;
        self.avcc.bit_depth_luma_minus8 = pending.bit_depth_luma_minus8;
        self.avcc.bit_depth_chroma_minus8 = pending.bit_depth_chroma_minus8;
        self.avcc_pending = false;
        Ok(())
    }

    /// Folds one more slice into the in-progress picture. Called at least
    /// once per picture.
    pub fn update_picture_info_for_slice(&mut self, picture: &mut PictureInfo, slice: &SliceInfo) {
        picture.has_mmco5 |= slice.has_mmco5;
        picture.has_redundancy |= slice.has_redundancy;
        picture.has_primary |= !slice.has_redundancy;
        update_picture_type(picture, slice);
        self.mark_parameter_sets_used(slice);
        self.slice.present = false;
    }

    /// Freezes the picture from its last slice and pending SEI. Called
    /// exactly once per picture.
    pub fn update_picture_info(&mut self, picture: &mut PictureInfo, slice: &SliceInfo) {
        picture.frame_num = slice.frame_num;
        picture.pic_order_cnt_lsb = slice.pic_order_cnt_lsb;
        picture.delta_pic_order_cnt_bottom = slice.delta_pic_order_cnt_bottom;
        picture.delta_pic_order_cnt = slice.delta_pic_order_cnt;
        picture.field_pic_flag = slice.field_pic_flag;
        picture.bottom_field_flag = slice.bottom_field_flag;
        picture.idr = slice.idr_pic_flag;
        picture.pic_parameter_set_id = slice.pic_parameter_set_id;
        picture.disposable = slice.nal_ref_idc == 0;
        picture.random_accessible = slice.idr_pic_flag;
        self.update_picture_info_for_slice(picture, slice);
        picture.independent =
            picture.picture_type == PictureType::I || picture.picture_type == PictureType::ISi;
        if self.sei.pic_timing.present {
            if self.sei.pic_timing.pic_struct < 9 {
                const DELTA_TFI_DIVISOR: [u32; 9] = [2, 1, 1, 2, 2, 3, 3, 4, 6];
                picture.delta = DELTA_TFI_DIVISOR[usize::from(self.sei.pic_timing.pic_struct)];
            } else {
                // Reserved values in the Recommendation.
                picture.delta = if picture.field_pic_flag { 1 } else { 2 };
            }
            self.sei.pic_timing.present = false;
        } else {
            picture.delta = if picture.field_pic_flag { 1 } else { 2 };
        }
        if self.sei.recovery_point.present {
            picture.random_accessible |= self.sei.recovery_point.random_accessible;
            picture.broken_link_flag |= self.sei.recovery_point.broken_link_flag;
            picture.recovery_frame_cnt = self.sei.recovery_point.recovery_frame_cnt;
            self.sei.recovery_point.present = false;
        }
    }

    /// 8.2.1 Decoding process for picture order count.
    pub fn calculate_poc(
        &mut self,
        picture: &mut PictureInfo,
        prev_picture: &PictureInfo,
    ) -> Result<(), Error> {
        let pps = *self.pps_by_id(picture.pic_parameter_set_id)?;
        let sps = self.sps_by_id(pps.seq_parameter_set_id)?.clone();
        let mut top_field_order_cnt: i64 = 0;
        let mut bottom_field_order_cnt: i64 = 0;
        match sps.pic_order_cnt_type {
            0 => {
                let (prev_pic_order_cnt_msb, prev_pic_order_cnt_lsb) = if picture.idr {
                    (0, 0)
                } else if prev_picture.ref_pic_has_mmco5 {
                    if prev_picture.ref_pic_bottom_field_flag {
                        (0, 0)
                    } else {
                        (0, prev_picture.ref_pic_top_field_order_cnt)
                    }
                } else {
                    (
                        prev_picture.ref_pic_order_cnt_msb,
                        prev_picture.ref_pic_order_cnt_lsb,
                    )
                };
                let pic_order_cnt_lsb = picture.pic_order_cnt_lsb;
                let max_pic_order_cnt_lsb = i64::from(sps.max_pic_order_cnt_lsb);
                let pic_order_cnt_msb: i64 = if pic_order_cnt_lsb < prev_pic_order_cnt_lsb
                    && i64::from(prev_pic_order_cnt_lsb - pic_order_cnt_lsb)
                        >= max_pic_order_cnt_lsb / 2
                {
                    i64::from(prev_pic_order_cnt_msb) + max_pic_order_cnt_lsb
                } else if pic_order_cnt_lsb > prev_pic_order_cnt_lsb
                    && i64::from(pic_order_cnt_lsb - prev_pic_order_cnt_lsb)
                        > max_pic_order_cnt_lsb / 2
                {
                    i64::from(prev_pic_order_cnt_msb) - max_pic_order_cnt_lsb
                } else {
                    i64::from(prev_pic_order_cnt_msb)
                };
                check_i32(pic_order_cnt_msb)?;
                top_field_order_cnt = pic_order_cnt_msb + i64::from(pic_order_cnt_lsb);
                bottom_field_order_cnt = top_field_order_cnt;
                if !picture.field_pic_flag {
                    bottom_field_order_cnt += i64::from(picture.delta_pic_order_cnt_bottom);
                }
                check_i32(top_field_order_cnt)?;
                check_i32(bottom_field_order_cnt)?;
                if !picture.disposable {
                    picture.ref_pic_has_mmco5 = picture.has_mmco5;
                    picture.ref_pic_bottom_field_flag = picture.bottom_field_flag;
                    picture.ref_pic_top_field_order_cnt = top_field_order_cnt as i32;
                    picture.ref_pic_order_cnt_msb = pic_order_cnt_msb as i32;
                    picture.ref_pic_order_cnt_lsb = pic_order_cnt_lsb;
                }
            }
            1 => {
                let frame_num = picture.frame_num;
                let prev_frame_num = if prev_picture.has_mmco5 {
                    0
                } else {
                    prev_picture.frame_num
                };
                let prev_frame_num_offset = if prev_picture.has_mmco5 {
                    0
                } else {
                    prev_picture.frame_num_offset
                };
                let frame_num_offset: u64 = if picture.idr {
                    0
                } else {
                    u64::from(prev_frame_num_offset)
                        + if prev_frame_num > frame_num {
                            u64::from(sps.max_frame_num)
                        } else {
                            0
                        }
                };
                if frame_num_offset > i32::MAX as u64 {
                    bail!("FrameNumOffset overflow");
                }
                let mut expected_pic_order_cnt: i64 = if sps.num_ref_frames_in_pic_order_cnt_cycle != 0 {
                    let mut abs_frame_num = frame_num_offset + u64::from(frame_num);
                    if picture.disposable && abs_frame_num > 0 {
                        abs_frame_num -= 1;
                    }
                    if abs_frame_num != 0 {
                        let pic_order_cnt_cycle_cnt =
                            (abs_frame_num - 1) / u64::from(sps.num_ref_frames_in_pic_order_cnt_cycle);
                        let frame_num_in_pic_order_cnt_cycle =
                            (abs_frame_num - 1) % u64::from(sps.num_ref_frames_in_pic_order_cnt_cycle);
                        let mut expected = pic_order_cnt_cycle_cnt as i64
                            * sps.expected_delta_per_pic_order_cnt_cycle;
                        for i in 0..=frame_num_in_pic_order_cnt_cycle as usize {
                            expected += i64::from(sps.offset_for_ref_frame[i]);
                        }
                        expected
                    } else {
                        0
                    }
                } else {
                    0
                };
                if picture.disposable {
                    expected_pic_order_cnt += i64::from(sps.offset_for_non_ref_pic);
                }
                top_field_order_cnt = expected_pic_order_cnt + i64::from(picture.delta_pic_order_cnt[0]);
                bottom_field_order_cnt =
                    top_field_order_cnt + i64::from(sps.offset_for_top_to_bottom_field);
                if !picture.field_pic_flag {
                    bottom_field_order_cnt += i64::from(picture.delta_pic_order_cnt[1]);
                }
                check_i32(top_field_order_cnt)?;
                check_i32(bottom_field_order_cnt)?;
                picture.frame_num_offset = frame_num_offset as u32;
            }
            2 => {
                let frame_num = picture.frame_num;
                let prev_frame_num = if prev_picture.has_mmco5 {
                    0
                } else {
                    prev_picture.frame_num
                };
                let prev_frame_num_offset = if prev_picture.has_mmco5 {
                    0
                } else {
                    prev_picture.frame_num_offset
                };
                let (frame_num_offset, temp_pic_order_cnt): (i64, i64) = if picture.idr {
                    (0, 0)
                } else {
                    let offset = i64::from(prev_frame_num_offset)
                        + if prev_frame_num > frame_num {
                            i64::from(sps.max_frame_num)
                        } else {
                            0
                        };
                    let temp = 2 * (offset + i64::from(frame_num)) - i64::from(picture.disposable);
                    check_i32(offset)?;
                    check_i32(temp)?;
                    (offset, temp)
                };
                top_field_order_cnt = temp_pic_order_cnt;
                bottom_field_order_cnt = temp_pic_order_cnt;
                picture.frame_num_offset = frame_num_offset as u32;
            }
            _ => unreachable!(),
        }
        picture.pic_order_cnt = if !picture.field_pic_flag {
            top_field_order_cnt.min(bottom_field_order_cnt) as i32
        } else if picture.bottom_field_flag {
            bottom_field_order_cnt as i32
        } else {
            top_field_order_cnt as i32
        };
        Ok(())
    }
}

fn check_i32(x: i64) -> Result<(), Error> {
    if x < i64::from(i32::MIN) || x > i64::from(i32::MAX) {
        bail!("picture order count arithmetic overflow");
    }
    Ok(())
}

fn ceil_log2(mut x: u64) -> u32 {
    let mut n = 0;
    x = x.saturating_sub(1);
    while x != 0 {
        x >>= 1;
        n += 1;
    }
    n
}

fn update_picture_type(picture: &mut PictureInfo, slice: &SliceInfo) {
    use PictureType::*;
    let t = picture.picture_type;
    picture.picture_type = match (t, slice.slice_type) {
        (IP, SLICE_TYPE_B) => IPB,
        (IP, SLICE_TYPE_SI) | (IP, SLICE_TYPE_SP) => ISiPSp,
        (IPB, s) if s != SLICE_TYPE_P && s != SLICE_TYPE_B && s != SLICE_TYPE_I => ISiPSpB,
        (I, SLICE_TYPE_P) => IP,
        (I, SLICE_TYPE_B) => IPB,
        (I, SLICE_TYPE_SI) => ISi,
        (I, SLICE_TYPE_SP) => ISiPSp,
        (SiSp, SLICE_TYPE_P) | (SiSp, SLICE_TYPE_I) => ISiPSp,
        (SiSp, SLICE_TYPE_B) => ISiPSpB,
        (Si, SLICE_TYPE_P) => ISiPSp,
        (Si, SLICE_TYPE_B) => ISiPSpB,
        (Si, SLICE_TYPE_I) => ISi,
        (Si, SLICE_TYPE_SP) => SiSp,
        (ISi, SLICE_TYPE_P) | (ISi, SLICE_TYPE_SP) => ISiPSp,
        (ISi, SLICE_TYPE_B) => ISiPSpB,
        (ISiPSp, SLICE_TYPE_B) => ISiPSpB,
        (None, SLICE_TYPE_P) => IP,
        (None, SLICE_TYPE_B) => IPB,
        (None, SLICE_TYPE_I) => I,
        (None, SLICE_TYPE_SI) => Si,
        (None, SLICE_TYPE_SP) => SiSp,
        (t, _) => t,
    };
}

/// Whether `slice` starts a new access unit given the previous VCL
/// slice, per 7.4.1.2.4.
pub fn find_au_delimit_by_slice_info(slice: &SliceInfo, prev_slice: &SliceInfo) -> bool {
    slice.frame_num != prev_slice.frame_num
        || ((slice.pic_order_cnt_type == 0 && prev_slice.pic_order_cnt_type == 0)
            && (slice.pic_order_cnt_lsb != prev_slice.pic_order_cnt_lsb
                || slice.delta_pic_order_cnt_bottom != prev_slice.delta_pic_order_cnt_bottom))
        || ((slice.pic_order_cnt_type == 1 && prev_slice.pic_order_cnt_type == 1)
            && (slice.delta_pic_order_cnt[0] != prev_slice.delta_pic_order_cnt[0]
                || slice.delta_pic_order_cnt[1] != prev_slice.delta_pic_order_cnt[1]))
        || slice.field_pic_flag != prev_slice.field_pic_flag
        || slice.bottom_field_flag != prev_slice.bottom_field_flag
        || slice.idr_pic_flag != prev_slice.idr_pic_flag
        || slice.pic_parameter_set_id != prev_slice.pic_parameter_set_id
        || ((slice.nal_ref_idc == 0 || prev_slice.nal_ref_idc == 0)
            && slice.nal_ref_idc != prev_slice.nal_ref_idc)
        || (slice.idr_pic_flag && prev_slice.idr_pic_flag && slice.idr_pic_id != prev_slice.idr_pic_id)
}

/// Whether a non-VCL NALU ends the access unit holding the previous VCL
/// NALU.
pub fn find_au_delimit_by_nalu_type(nalu_type: u8, prev_nalu_type: u8) -> bool {
    ((NALU_TYPE_SEI..=NALU_TYPE_AUD).contains(&nalu_type)
        || (NALU_TYPE_PREFIX..=NALU_TYPE_RSV_NVCL18).contains(&nalu_type))
        && ((NALU_TYPE_SLICE_N_IDR..=NALU_TYPE_SLICE_IDR).contains(&prev_nalu_type)
            || prev_nalu_type == NALU_TYPE_FD
            || prev_nalu_type == NALU_TYPE_SLICE_AUX)
}

#[cfg(test)]
mod tests {
    use super::*;

    // SPS from a GW Security GW4089IP camera: baseline 1280x720.
    const SPS_NAL: [u8; 14] = [
        0x67, 0x4d, 0x00, 0x1e, 0x95, 0xa8, 0x2d, 0x0f, 0x69, 0xb8, 0x08, 0x08, 0x08, 0x10,
    ];
    const PPS_NAL: [u8; 4] = [0x68, 0xee, 0x3c, 0x80];

    #[test]
    fn parses_camera_sps() {
        let sps = parse_sps_minimally(&SPS_NAL[1..]).unwrap();
        assert_eq!(sps.profile_idc, 77);
        assert_eq!(sps.level_idc, 30);
        assert_eq!(sps.seq_parameter_set_id, 0);
        assert_eq!(sps.pic_order_cnt_type, 2);
        assert_eq!(sps.cropped_width, 720);
        assert_eq!(sps.cropped_height, 480);
    }

    #[test]
    fn ps_identifiers() {
        assert_eq!(get_sps_id(&SPS_NAL[1..]).unwrap(), 0);
        assert_eq!(get_pps_id(&PPS_NAL[1..]).unwrap(), 0);
    }

    #[test]
    fn avcc_round_trip() {
        let mut avcc = AvcConfigurationRecord::default();
        avcc.append_parameter_set(ParameterSetType::Sps, &SPS_NAL)
            .unwrap();
        avcc.append_parameter_set(ParameterSetType::Pps, &PPS_NAL)
            .unwrap();
        let b = avcc.serialize().unwrap();
        assert_eq!(&b[4..8], b"avcC");
        assert_eq!(b[8], 1); // configurationVersion
        assert_eq!(b[9], 0x4d); // AVCProfileIndication
        assert_eq!(b[12], 0xff); // lengthSizeMinusOne | 0xfc
        assert_eq!(b[13], 0xe1); // one SPS
        assert_eq!(u16::from_be_bytes([b[14], b[15]]), SPS_NAL.len() as u16);
        assert_eq!(&b[16..16 + SPS_NAL.len()], &SPS_NAL);
        let pps_at = 16 + SPS_NAL.len();
        assert_eq!(b[pps_at], 1); // one PPS
        // Total size matches the box header.
        assert_eq!(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize, b.len());
    }

    #[test]
    fn duplicate_and_conflicting_sps() {
        let mut avcc = AvcConfigurationRecord::default();
        avcc.append_parameter_set(ParameterSetType::Sps, &SPS_NAL)
            .unwrap();
        assert_eq!(
            avcc.check_appendable(ParameterSetType::Sps, &SPS_NAL).unwrap(),
            Appendable::Duplicated
        );
        // Same id, different bytes: requires a new record.
        let mut altered = SPS_NAL;
        altered[5] ^= 0x10;
        assert_eq!(
            avcc.check_appendable(ParameterSetType::Sps, &altered).unwrap(),
            Appendable::NewDcrRequired
        );
    }

    #[test]
    fn au_delimit_on_frame_num_change() {
        let mut a = SliceInfo::default();
        a.frame_num = 1;
        let mut b = SliceInfo::default();
        b.frame_num = 2;
        assert!(find_au_delimit_by_slice_info(&a, &b));
        assert!(!find_au_delimit_by_slice_info(&a, &a.clone()));
    }

    #[test]
    fn poc_type2_counts_decode_order() {
        let mut parser = H264Parser::new();
        parser.parse_sps(&SPS_NAL[1..]).unwrap();
        parser.parse_pps(&PPS_NAL[1..]).unwrap();
        let mut idr = PictureInfo::default();
        idr.idr = true;
        let prev = PictureInfo::default();
        parser.calculate_poc(&mut idr, &prev).unwrap();
        assert_eq!(idr.pic_order_cnt, 0);
        // This SPS uses pic_order_cnt_type 2: POC follows decode order.
        let mut p = PictureInfo::default();
        p.frame_num = 1;
        parser.calculate_poc(&mut p, &idr).unwrap();
        assert_eq!(p.pic_order_cnt, 2);
    }
}
