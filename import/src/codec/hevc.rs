//! H.265/HEVC bitstream syntax: NAL headers, VPS/SPS/PPS, SEI, slice
//! segment headers, picture order counts, and the `hvcC` decoder
//! configuration record.
//!
//! References:
//! *   [ITU-T Recommendation H.265](https://www.itu.int/rec/T-REC-H.265) (04/13)
//! *   ISO/IEC 14496-15:2014 (`HEVCDecoderConfigurationRecord`)

use bytes::{BufMut, Bytes, BytesMut};
use failure::{bail, format_err, Error};
use smallvec::SmallVec;
use std::convert::TryFrom;

use crate::bits::{unescape_rbsp, NalBits};
use crate::codec::nalu::{
    self, measure_nalu, ParameterSet, LONG_START_CODE_LENGTH, SHORT_START_CODE_LENGTH,
};
use crate::stream::ByteStream;

pub const NALU_TYPE_TRAIL_N: u8 = 0;
pub const NALU_TYPE_TRAIL_R: u8 = 1;
pub const NALU_TYPE_TSA_N: u8 = 2;
pub const NALU_TYPE_STSA_R: u8 = 5;
pub const NALU_TYPE_RADL_N: u8 = 6;
pub const NALU_TYPE_RADL_R: u8 = 7;
pub const NALU_TYPE_RASL_N: u8 = 8;
pub const NALU_TYPE_RASL_R: u8 = 9;
pub const NALU_TYPE_RSV_VCL_R15: u8 = 15;
pub const NALU_TYPE_BLA_W_LP: u8 = 16;
pub const NALU_TYPE_BLA_W_RADL: u8 = 17;
pub const NALU_TYPE_BLA_N_LP: u8 = 18;
pub const NALU_TYPE_IDR_W_RADL: u8 = 19;
pub const NALU_TYPE_IDR_N_LP: u8 = 20;
pub const NALU_TYPE_CRA: u8 = 21;
pub const NALU_TYPE_RSV_IRAP_VCL23: u8 = 23;
pub const NALU_TYPE_RSV_VCL31: u8 = 31;
pub const NALU_TYPE_VPS: u8 = 32;
pub const NALU_TYPE_SPS: u8 = 33;
pub const NALU_TYPE_PPS: u8 = 34;
pub const NALU_TYPE_AUD: u8 = 35;
pub const NALU_TYPE_EOS: u8 = 36;
pub const NALU_TYPE_EOB: u8 = 37;
pub const NALU_TYPE_FD: u8 = 38;
pub const NALU_TYPE_PREFIX_SEI: u8 = 39;
pub const NALU_TYPE_SUFFIX_SEI: u8 = 40;
pub const NALU_TYPE_RSV_NVCL41: u8 = 41;
pub const NALU_TYPE_RSV_NVCL44: u8 = 44;
pub const NALU_TYPE_UNSPEC48: u8 = 48;
pub const NALU_TYPE_UNSPEC55: u8 = 55;
pub const NALU_TYPE_UNKNOWN: u8 = 64;

pub const MIN_NALU_HEADER_LENGTH: usize = 2;
const MAX_VPS_ID: u8 = 15;
const MAX_SPS_ID: u8 = 15;
const MAX_PPS_ID: u8 = 63;
const MAX_DPB_SIZE: u64 = 16;

const SLICE_TYPE_B: u8 = 0;
const SLICE_TYPE_P: u8 = 1;
const SLICE_TYPE_I: u8 = 2;

const SUB_WIDTH_C: [u32; 4] = [1, 2, 2, 1];
const SUB_HEIGHT_C: [u32; 4] = [1, 2, 1, 1];

#[derive(Clone, Copy, Debug, Default)]
pub struct NaluHeader {
    pub nal_unit_type: u8,
    pub temporal_id: u8,
    /// NAL header length in bytes.
    pub length: usize,
}

fn check_nalu_header(bs: &mut ByteStream, use_long_start_code: bool) -> Result<NaluHeader, Error> {
    let start_code_length = if use_long_start_code {
        LONG_START_CODE_LENGTH
    } else {
        SHORT_START_CODE_LENGTH
    };
    if bs.is_end(start_code_length + 1) {
        bail!("stream ends inside a NAL header");
    }
    let temp16 = bs.show_be16(start_code_length);
    if temp16 & 0x8000 != 0 {
        bail!("forbidden_zero_bit is set");
    }
    let nal_unit_type = ((temp16 >> 9) & 0x3f) as u8;
    let nuh_layer_id = ((temp16 >> 3) & 0x3f) as u8;
    let nuh_temporal_id_plus1 = (temp16 & 0x07) as u8;
    if nuh_temporal_id_plus1 == 0 {
        bail!("nuh_temporal_id_plus1 is zero");
    }
    // nuh_layer_id shall be 0 in the specification we refer to.
    if nuh_layer_id != 0 {
        bail!("multi-layer streams are unsupported");
    }
    let nuh = NaluHeader {
        nal_unit_type,
        temporal_id: nuh_temporal_id_plus1 - 1,
        length: MIN_NALU_HEADER_LENGTH,
    };
    if nuh.temporal_id == 0 {
        // For TSA_N, TSA_R, STSA_N and STSA_R, TemporalId shall not be 0.
        if (NALU_TYPE_TSA_N..=NALU_TYPE_STSA_R).contains(&nal_unit_type) {
            bail!("TSA/STSA with TemporalId 0");
        }
    } else {
        // For BLA_W_LP..RSV_IRAP_VCL23, and for VPS, SPS, EOS and EOB,
        // TemporalId shall be 0.
        if (NALU_TYPE_BLA_W_LP..=NALU_TYPE_RSV_IRAP_VCL23).contains(&nal_unit_type) {
            bail!("IRAP with non-zero TemporalId");
        }
        if (NALU_TYPE_VPS..=NALU_TYPE_EOB).contains(&nal_unit_type)
            && nal_unit_type != NALU_TYPE_PPS
            && nal_unit_type != NALU_TYPE_AUD
        {
            bail!("non-zero TemporalId on NALU type {}", nal_unit_type);
        }
    }
    // VPS, SPS and PPS require a long start code, as does the AU
    // delimiter.
    if !use_long_start_code && (NALU_TYPE_VPS..=NALU_TYPE_AUD).contains(&nal_unit_type) {
        bail!("short start code on NALU type {}", nal_unit_type);
    }
    Ok(nuh)
}

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

/// profile_tier_level() of one layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PtlCommon {
    pub profile_space: u8,
    pub tier_flag: bool,
    pub profile_idc: u8,
    pub profile_compatibility_flags: u32,
    pub progressive_source_flag: bool,
    pub interlaced_source_flag: bool,
    pub non_packed_constraint_flag: bool,
    pub frame_only_constraint_flag: bool,
    pub reserved_zero_44bits: u64,
    pub level_idc: u8,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Ptl {
    pub general: PtlCommon,
}

fn parse_profile_tier_level_common(
    bits: &mut NalBits,
    ptlc: &mut PtlCommon,
    profile_present: bool,
    level_present: bool,
) -> Result<(), Error> {
    if profile_present {
        ptlc.profile_space = bits.get_u8(2)?;
        ptlc.tier_flag = bits.flag()?;
        ptlc.profile_idc = bits.get_u8(5)?;
        ptlc.profile_compatibility_flags = bits.get_u32(32)?;
        ptlc.progressive_source_flag = bits.flag()?;
        ptlc.interlaced_source_flag = bits.flag()?;
        ptlc.non_packed_constraint_flag = bits.flag()?;
        ptlc.frame_only_constraint_flag = bits.flag()?;
        ptlc.reserved_zero_44bits = bits.get(44)?;
    }
    if level_present {
        ptlc.level_idc = bits.get_u8(8)?;
    }
    Ok(())
}

fn parse_profile_tier_level(
    bits: &mut NalBits,
    ptl: &mut Ptl,
    max_num_sub_layers_minus1: u8,
) -> Result<(), Error> {
    parse_profile_tier_level_common(bits, &mut ptl.general, true, true)?;
    if max_num_sub_layers_minus1 == 0 {
        return Ok(());
    }
    let mut sub_layer_profile_present = [false; 6];
    let mut sub_layer_level_present = [false; 6];
    for i in 0..usize::from(max_num_sub_layers_minus1).min(6) {
        sub_layer_profile_present[i] = bits.flag()?;
        sub_layer_level_present[i] = bits.flag()?;
    }
    for _ in usize::from(max_num_sub_layers_minus1)..8 {
        bits.skip(2)?; // reserved_zero_2bits[i]
    }
    for i in 0..usize::from(max_num_sub_layers_minus1).min(6) {
        let mut sub = PtlCommon::default();
        parse_profile_tier_level_common(
            bits,
            &mut sub,
            sub_layer_profile_present[i],
            sub_layer_level_present[i],
        )?;
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Hrd {
    pub present: bool,
    pub cpb_dpb_delays_present: bool,
    pub sub_pic_hrd_params_present: bool,
    pub du_cpb_removal_delay_increment_length: u8,
    pub sub_pic_cpb_params_in_pic_timing_sei: bool,
    pub dpb_output_delay_du_length: u8,
    pub au_cpb_removal_delay_length: u8,
    pub dpb_output_delay_length: u8,
    pub fixed_pic_rate_general_flag: [bool; 7],
}

fn parse_sub_layer_hrd_parameters(
    bits: &mut NalBits,
    cpb_cnt: u64,
    sub_pic_hrd_params_present: bool,
) -> Result<(), Error> {
    for _ in 0..=cpb_cnt {
        bits.ue()?; // bit_rate_value_minus1[i]
        bits.ue()?; // cpb_size_value_minus1[i]
        if sub_pic_hrd_params_present {
            bits.ue()?; // cpb_size_du_value_minus1[i]
            bits.ue()?; // bit_rate_du_value_minus1[i]
        }
        bits.skip(1)?; // cbr_flag[i]
    }
    Ok(())
}

fn parse_hrd_parameters(
    bits: &mut NalBits,
    hrd: &mut Hrd,
    common_inf_present: bool,
    max_num_sub_layers_minus1: u8,
) -> Result<(), Error> {
    // The implicit values of nal/vcl_hrd_parameters_present_flag are 0
    // per the JCTVC-HM reference software.
    let mut nal_hrd_parameters_present = false;
    let mut vcl_hrd_parameters_present = false;
    *hrd = Hrd::default();
    if common_inf_present {
        nal_hrd_parameters_present = bits.flag()?;
        vcl_hrd_parameters_present = bits.flag()?;
        if nal_hrd_parameters_present || vcl_hrd_parameters_present {
            hrd.cpb_dpb_delays_present = true;
            hrd.sub_pic_hrd_params_present = bits.flag()?;
            if hrd.sub_pic_hrd_params_present {
                bits.skip(8)?; // tick_divisor_minus2
                hrd.du_cpb_removal_delay_increment_length = bits.get_u8(5)? + 1;
                hrd.sub_pic_cpb_params_in_pic_timing_sei = bits.flag()?;
                hrd.dpb_output_delay_du_length = bits.get_u8(5)? + 1;
            }
            bits.skip(4)?; // bit_rate_scale
            bits.skip(4)?; // cpb_size_scale
            if hrd.sub_pic_hrd_params_present {
                bits.skip(4)?; // cpb_size_du_scale
            }
            bits.skip(5)?; // initial_cpb_removal_delay_length_minus1
            hrd.au_cpb_removal_delay_length = bits.get_u8(5)? + 1;
            hrd.dpb_output_delay_length = bits.get_u8(5)? + 1;
        }
    }
    for i in 0..=usize::from(max_num_sub_layers_minus1).min(6) {
        hrd.fixed_pic_rate_general_flag[i] = bits.flag()?;
        let fixed_pic_rate_within_cvs = if !hrd.fixed_pic_rate_general_flag[i] {
            bits.flag()?
        } else {
            true
        };
        let low_delay_hrd = if !fixed_pic_rate_within_cvs {
            bits.flag()?
        } else {
            false
        };
        if fixed_pic_rate_within_cvs {
            bits.ue()?; // elemental_duration_in_tc_minus1[i]
        }
        let cpb_cnt_minus1 = if !low_delay_hrd { bits.ue()? } else { 0 };
        if nal_hrd_parameters_present {
            parse_sub_layer_hrd_parameters(bits, cpb_cnt_minus1, hrd.sub_pic_hrd_params_present)?;
        }
        if vcl_hrd_parameters_present {
            parse_sub_layer_hrd_parameters(bits, cpb_cnt_minus1, hrd.sub_pic_hrd_params_present)?;
        }
    }
    hrd.present = true;
    Ok(())
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Vps {
    pub present: bool,
    pub video_parameter_set_id: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub frame_field_info_present: bool,
    pub ptl: Ptl,
    pub hrd: [Hrd; 2],
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Vui {
    pub sar_width: u16,
    pub sar_height: u16,
    pub video_full_range_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coeffs: u8,
    pub field_seq_flag: bool,
    pub frame_field_info_present: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub min_spatial_segmentation_idc: u16,
    /// Default display window offsets (left, right, top, bottom).
    pub def_disp_win_offset: [u32; 4],
    pub hrd: Hrd,
}

/// One short-term reference picture set.
#[derive(Clone, Copy, Debug, Default)]
pub struct StRps {
    pub num_negative_pics: u8,
    pub num_positive_pics: u8,
    pub num_delta_pocs: u8,
    pub used_by_curr_pic_s0: [bool; 16],
    pub used_by_curr_pic_s1: [bool; 16],
    pub delta_poc_s0: [i32; 16],
    pub delta_poc_s1: [i32; 16],
}

#[derive(Clone, Debug, Default)]
pub struct Sps {
    pub present: bool,
    pub video_parameter_set_id: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub ptl: Ptl,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_pic_order_cnt_lsb: u8,
    pub num_short_term_ref_pic_sets: u8,
    pub long_term_ref_pics_present_flag: bool,
    pub num_long_term_ref_pics_sps: u8,
    pub temporal_mvp_enabled_flag: bool,
    pub cropped_width: u32,
    pub cropped_height: u32,
    pub pic_width_in_ctbs: u32,
    pub pic_height_in_ctbs: u32,
    pub pic_size_in_ctbs: u64,
    pub st_rps: Vec<StRps>,
    pub vui: Vui,
}

#[derive(Clone, Debug, Default)]
pub struct Pps {
    pub present: bool,
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_extra_slice_header_bits: u8,
    pub tiles_enabled_flag: bool,
    pub entropy_coding_sync_enabled_flag: bool,
    pub num_tile_columns_minus1: u32,
    pub num_tile_rows_minus1: u32,
    pub col_width: Vec<u32>,
    pub col_bd: Vec<u32>,
    pub row_height: Vec<u32>,
    pub row_bd: Vec<u32>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PicTimingSei {
    pub present: bool,
    pub pic_struct: u8,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RecoveryPointSei {
    pub present: bool,
    pub broken_link_flag: bool,
    pub recovery_poc_cnt: i32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Sei {
    pub pic_timing: PicTimingSei,
    pub recovery_point: RecoveryPointSei,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SliceInfo {
    pub present: bool,
    pub nalu_type: u8,
    pub temporal_id: u8,
    pub slice_type: u8,
    pub video_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub pic_parameter_set_id: u8,
    pub first_slice_segment_in_pic_flag: bool,
    pub dependent_slice_segment_flag: bool,
    pub segment_address: u64,
    pub pic_order_cnt_lsb: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PictureType {
    I = 0,
    IP = 1,
    IPB = 2,
    Idr = 3,
    Cra = 4,
    Bla = 5,
    None = 6,
}

impl Default for PictureType {
    fn default() -> Self {
        PictureType::None
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PictureInfo {
    pub picture_type: PictureType,
    /// IDR, CRA or BLA picture.
    pub irap: bool,
    pub idr: bool,
    /// BLA picture or one with the broken-link flag.
    pub broken_link: bool,
    pub radl: bool,
    pub rasl: bool,
    pub sublayer_nonref: bool,
    /// No undecodable leading picture in this CVS.
    pub closed_rap: bool,
    pub random_accessible: bool,
    pub temporal_id: u8,
    pub independent: bool,
    pub field_coded: bool,
    pub pic_parameter_set_id: u8,
    pub has_primary: bool,
    pub delta: u32,
    /* POC */
    pub poc_lsb: i32,
    pub poc: i32,
    pub tid0_poc_msb: i32,
    pub tid0_poc_lsb: i32,
    /* */
    pub recovery_poc_cnt: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Appendable {
    Duplicated,
    Possible,
    NewDcrRequired,
    NewSampleEntryRequired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DcrNaluType {
    Vps,
    Sps,
    Pps,
    PrefixSei,
    SuffixSei,
}

const DCR_NALU_TYPES: [DcrNaluType; 5] = [
    DcrNaluType::Vps,
    DcrNaluType::Sps,
    DcrNaluType::Pps,
    DcrNaluType::PrefixSei,
    DcrNaluType::SuffixSei,
];

/// The fields and parameter arrays of an `HEVCDecoderConfigurationRecord`.
#[derive(Clone, Debug)]
pub struct HevcConfigurationRecord {
    pub general_profile_space: u8,
    pub general_tier_flag: bool,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    pub general_constraint_indicator_flags: u64,
    pub general_level_idc: u8,
    pub min_spatial_segmentation_idc: u16,
    pub parallelism_type: u8,
    pub chroma_format: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub avg_frame_rate: u16,
    pub constant_frame_rate: u8,
    pub num_temporal_layers: u8,
    pub temporal_id_nested: bool,
    pub length_size_minus_one: u8,
    ready: bool,
    pub vps_list: Vec<ParameterSet>,
    pub sps_list: Vec<ParameterSet>,
    pub pps_list: Vec<ParameterSet>,
    pub prefix_sei_list: Vec<ParameterSet>,
    pub suffix_sei_list: Vec<ParameterSet>,
}

impl Default for HevcConfigurationRecord {
    fn default() -> Self {
        HevcConfigurationRecord {
            general_profile_space: 0,
            general_tier_flag: false,
            general_profile_idc: 0,
            general_profile_compatibility_flags: 0,
            general_constraint_indicator_flags: 0,
            general_level_idc: 0,
            min_spatial_segmentation_idc: 0,
            parallelism_type: 0,
            chroma_format: 0,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            avg_frame_rate: 0,
            constant_frame_rate: 0,
            num_temporal_layers: 0,
            temporal_id_nested: false,
            length_size_minus_one: (nalu::NALU_LENGTH_SIZE - 1) as u8,
            ready: false,
            vps_list: Vec::new(),
            sps_list: Vec::new(),
            pps_list: Vec::new(),
            prefix_sei_list: Vec::new(),
            suffix_sei_list: Vec::new(),
        }
    }
}

fn get_vps_id(ps_ebsp: &[u8]) -> Result<u8, Error> {
    if ps_ebsp.is_empty() {
        bail!("empty VPS");
    }
    Ok((ps_ebsp[0] >> 4) & 0x0F)
}

fn get_sps_id(ps_ebsp: &[u8]) -> Result<u8, Error> {
    // profile_tier_level() costs at most 688 bits, so the identifier is
    // within the first ~89 bytes plus emulation prevention.
    let rbsp = unescape_rbsp(&ps_ebsp[..ps_ebsp.len().min(128)]);
    let mut bits = NalBits::new(&rbsp);
    // sps_video_parameter_set_id, sps_max_sub_layers_minus1 and
    // sps_temporal_id_nesting_flag.
    let max_sub_layers_minus1 = (bits.get_u8(8)? >> 1) & 0x07;
    let mut ptl = Ptl::default();
    parse_profile_tier_level(&mut bits, &mut ptl, max_sub_layers_minus1)?;
    let id = bits.ue()?;
    if id > u64::from(MAX_SPS_ID) {
        bail!("seq_parameter_set_id out of range");
    }
    Ok(id as u8)
}

fn get_pps_id(ps_ebsp: &[u8]) -> Result<u8, Error> {
    let rbsp = unescape_rbsp(&ps_ebsp[..ps_ebsp.len().min(3)]);
    let mut bits = NalBits::new(&rbsp);
    let id = bits.ue()?;
    if id > u64::from(MAX_PPS_ID) {
        bail!("pic_parameter_set_id out of range");
    }
    Ok(id as u8)
}

fn get_ps_id(ps_type: DcrNaluType, nal_unit: &[u8]) -> Result<u8, Error> {
    let payload = &nal_unit[MIN_NALU_HEADER_LENGTH..];
    match ps_type {
        DcrNaluType::Vps => get_vps_id(payload),
        DcrNaluType::Sps => get_sps_id(payload),
        DcrNaluType::Pps => get_pps_id(payload),
        _ => bail!("SEI has no identifier of interest"),
    }
}

impl HevcConfigurationRecord {
    fn list(&self, ps_type: DcrNaluType) -> &Vec<ParameterSet> {
        match ps_type {
            DcrNaluType::Vps => &self.vps_list,
            DcrNaluType::Sps => &self.sps_list,
            DcrNaluType::Pps => &self.pps_list,
            DcrNaluType::PrefixSei => &self.prefix_sei_list,
            DcrNaluType::SuffixSei => &self.suffix_sei_list,
        }
    }

    fn list_mut(&mut self, ps_type: DcrNaluType) -> &mut Vec<ParameterSet> {
        match ps_type {
            DcrNaluType::Vps => &mut self.vps_list,
            DcrNaluType::Sps => &mut self.sps_list,
            DcrNaluType::Pps => &mut self.pps_list,
            DcrNaluType::PrefixSei => &mut self.prefix_sei_list,
            DcrNaluType::SuffixSei => &mut self.suffix_sei_list,
        }
    }

    fn position_of_id(&self, ps_type: DcrNaluType, ps_id: u8) -> Option<usize> {
        self.list(ps_type)
            .iter()
            .position(|ps| get_ps_id(ps_type, &ps.nal_unit).ok() == Some(ps_id))
    }

    /// Baseline field values before the first parameter set lands.
    fn make_ready(&mut self) {
        self.general_profile_compatibility_flags = !0u32;
        self.general_constraint_indicator_flags = 0x0000_FFFF_FFFF_FFFF;
        self.min_spatial_segmentation_idc = 0x0FFF;
        self.avg_frame_rate = 0; // unspecified
        self.constant_frame_rate = 2;
        self.num_temporal_layers = 0;
        self.temporal_id_nested = true;
        self.ready = true;
    }

    fn update_ptl(&mut self, ptl: &Ptl) {
        self.general_profile_space = ptl.general.profile_space;
        self.general_tier_flag = self.general_tier_flag || ptl.general.tier_flag;
        self.general_profile_idc = ptl.general.profile_idc;
        self.general_profile_compatibility_flags &= ptl.general.profile_compatibility_flags;
        self.general_constraint_indicator_flags &=
            (u64::from(ptl.general.progressive_source_flag) << 47)
                | (u64::from(ptl.general.interlaced_source_flag) << 46)
                | (u64::from(ptl.general.non_packed_constraint_flag) << 45)
                | (u64::from(ptl.general.frame_only_constraint_flag) << 44)
                | ptl.general.reserved_zero_44bits;
        self.general_level_idc = self.general_level_idc.max(ptl.general.level_idc);
    }

    pub fn check_appendable(
        &self,
        ps_type: DcrNaluType,
        ps_data: &[u8],
    ) -> Result<Appendable, Error> {
        if ps_data.len() < 3 {
            bail!("parameter set too short");
        }
        let nalu_type = (ps_data[0] >> 1) & 0x3f;
        let expected = match ps_type {
            DcrNaluType::Vps => NALU_TYPE_VPS,
            DcrNaluType::Sps => NALU_TYPE_SPS,
            DcrNaluType::Pps => NALU_TYPE_PPS,
            DcrNaluType::PrefixSei => NALU_TYPE_PREFIX_SEI,
            DcrNaluType::SuffixSei => NALU_TYPE_SUFFIX_SEI,
        };
        if nalu_type != expected {
            bail!("parameter set type mismatch");
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
            DcrNaluType::Vps => usize::from(MAX_VPS_ID),
            DcrNaluType::Sps => usize::from(MAX_SPS_ID),
            DcrNaluType::Pps => usize::from(MAX_PPS_ID),
            _ => usize::from(u16::MAX),
        };
        if count >= limit {
            return Ok(Appendable::NewDcrRequired);
        }
        let payload = &ps_data[MIN_NALU_HEADER_LENGTH..];
        match ps_type {
            DcrNaluType::PrefixSei | DcrNaluType::SuffixSei => Ok(Appendable::Possible),
            DcrNaluType::Pps => {
                let pps_id = get_pps_id(payload)?;
                for ps in list.iter().filter(|ps| !ps.unused) {
                    if get_pps_id(&ps.nal_unit[MIN_NALU_HEADER_LENGTH..])? == pps_id {
                        return Ok(Appendable::NewDcrRequired);
                    }
                }
                Ok(Appendable::Possible)
            }
            DcrNaluType::Vps => {
                let vps = parse_vps_minimally(payload)?;
                // profile_space must agree across every set in a record.
                if vps.ptl.general.profile_space != self.general_profile_space
                    || vps.ptl.general.profile_idc != self.general_profile_idc
                {
                    return Ok(Appendable::NewDcrRequired);
                }
                for ps in list.iter().filter(|ps| !ps.unused) {
                    if get_vps_id(&ps.nal_unit[MIN_NALU_HEADER_LENGTH..])?
                        == vps.video_parameter_set_id
                    {
                        return Ok(Appendable::NewDcrRequired);
                    }
                }
                Ok(Appendable::Possible)
            }
            DcrNaluType::Sps => {
                let sps = parse_sps_minimally(payload)?;
                if sps.ptl.general.profile_space != self.general_profile_space
                    || sps.chroma_format_idc != self.chroma_format
                    || sps.bit_depth_luma_minus8 != self.bit_depth_luma_minus8
                    || sps.bit_depth_chroma_minus8 != self.bit_depth_chroma_minus8
                {
                    return Ok(Appendable::NewDcrRequired);
                }
                if sps.ptl.general.profile_idc != self.general_profile_idc {
                    return Ok(Appendable::NewDcrRequired);
                }
                for (i, ps) in list.iter().enumerate() {
                    if ps.unused {
                        continue;
                    }
                    if get_sps_id(&ps.nal_unit[MIN_NALU_HEADER_LENGTH..])?
                        == sps.seq_parameter_set_id
                    {
                        return Ok(Appendable::NewDcrRequired);
                    }
                    if i == 0 {
                        // Cropped size, sample aspect ratio, color, and the
                        // default display window decide the sample entry.
                        let first_sps =
                            parse_sps_minimally(&ps.nal_unit[MIN_NALU_HEADER_LENGTH..])?;
                        if sps.cropped_width != first_sps.cropped_width
                            || sps.cropped_height != first_sps.cropped_height
                            || sps.vui.sar_width != first_sps.vui.sar_width
                            || sps.vui.sar_height != first_sps.vui.sar_height
                            || sps.vui.colour_primaries != first_sps.vui.colour_primaries
                            || sps.vui.transfer_characteristics
                                != first_sps.vui.transfer_characteristics
                            || sps.vui.matrix_coeffs != first_sps.vui.matrix_coeffs
                            || sps.vui.video_full_range_flag != first_sps.vui.video_full_range_flag
                            || sps.vui.def_disp_win_offset != first_sps.vui.def_disp_win_offset
                        {
                            return Ok(Appendable::NewSampleEntryRequired);
                        }
                    }
                }
                Ok(Appendable::Possible)
            }
        }
    }

    pub fn append_parameter_set(
        &mut self,
        ps_type: DcrNaluType,
        ps_data: &[u8],
    ) -> Result<(), Error> {
        if ps_data.len() < 3 {
            bail!("parameter set too short");
        }
        if ps_type == DcrNaluType::PrefixSei || ps_type == DcrNaluType::SuffixSei {
            // SEIs append unconditionally.
            self.list_mut(ps_type).push(ParameterSet::new(ps_data));
            return Ok(());
        }
        let ps_id = get_ps_id(ps_type, ps_data)?;
        let reused = match self.position_of_id(ps_type, ps_id) {
            Some(i) => {
                let ps = &mut self.list_mut(ps_type)[i];
                if !ps.unused {
                    bail!("parameter set id {} already present", ps_id);
                }
                ps.unused = false;
                ps.nal_unit = ps_data.to_vec();
                true
            }
            None => {
                self.list_mut(ps_type).push(ParameterSet::new(ps_data));
                false
            }
        };
        let payload = &ps_data[MIN_NALU_HEADER_LENGTH..];
        match ps_type {
            DcrNaluType::Vps => {
                let vps = parse_vps_minimally(payload)?;
                if !self.ready {
                    self.make_ready();
                }
                self.update_ptl(&vps.ptl);
                self.num_temporal_layers =
                    self.num_temporal_layers.max(vps.max_sub_layers_minus1 + 1);
            }
            DcrNaluType::Sps => {
                let sps = parse_sps_minimally(payload)?;
                if !self.ready {
                    self.make_ready();
                }
                self.update_ptl(&sps.ptl);
                self.min_spatial_segmentation_idc = self
                    .min_spatial_segmentation_idc
                    .min(sps.vui.min_spatial_segmentation_idc);
                self.chroma_format = sps.chroma_format_idc;
                self.bit_depth_luma_minus8 = sps.bit_depth_luma_minus8;
                self.bit_depth_chroma_minus8 = sps.bit_depth_chroma_minus8;
                self.num_temporal_layers =
                    self.num_temporal_layers.max(sps.max_sub_layers_minus1 + 1);
                self.temporal_id_nested =
                    self.temporal_id_nested && sps.temporal_id_nesting_flag;
                // Track the constant-frame-rate class across SPSs.
                if self.constant_frame_rate != 0 {
                    let mut cfr = if self.constant_frame_rate == 2 {
                        let mut all = true;
                        for i in 0..=usize::from(sps.max_sub_layers_minus1).min(6) {
                            all &= sps.vui.hrd.fixed_pic_rate_general_flag[i];
                        }
                        all
                    } else {
                        false
                    };
                    if cfr {
                        self.constant_frame_rate = 2;
                    } else {
                        for i in 0..=usize::from(sps.max_sub_layers_minus1).min(6) {
                            cfr |= sps.vui.hrd.fixed_pic_rate_general_flag[i];
                        }
                        self.constant_frame_rate = u8::from(cfr);
                    }
                }
            }
            DcrNaluType::Pps => {
                let pps = parse_pps_minimally(payload)?;
                let parallelism_type = if pps.entropy_coding_sync_enabled_flag {
                    if pps.tiles_enabled_flag {
                        0
                    } else {
                        3
                    }
                } else if pps.tiles_enabled_flag {
                    2
                } else {
                    1
                };
                if nalu::active_ps_count(&self.pps_list) == 1 {
                    self.parallelism_type = parallelism_type;
                } else if self.parallelism_type != parallelism_type {
                    // 0 means mixed or unknown.
                    self.parallelism_type = 0;
                }
            }
            _ => {}
        }
        if !reused {
            self.reorder_ascending_id(ps_type, ps_id);
        }
        Ok(())
    }

    fn reorder_ascending_id(&mut self, ps_type: DcrNaluType, ps_id: u8) {
        let max_ps_id = match ps_type {
            DcrNaluType::Vps => MAX_VPS_ID,
            DcrNaluType::Sps => MAX_SPS_ID,
            _ => MAX_PPS_ID,
        };
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

    /// Serializes an `HEVCConfigurationBox` ('hvcC'). VPS, SPS and PPS
    /// are all mandatory.
    pub fn serialize(&self) -> Result<Bytes, Error> {
        if self.length_size_minus_one != 0
            && self.length_size_minus_one != 1
            && self.length_size_minus_one != 3
        {
            bail!("invalid lengthSizeMinusOne");
        }
        if nalu::active_ps_count(&self.vps_list) == 0
            || nalu::active_ps_count(&self.sps_list) == 0
            || nalu::active_ps_count(&self.pps_list) == 0
        {
            bail!("an hvcC requires at least one VPS, SPS and PPS");
        }
        let mut buf = BytesMut::new();
        crate::summary::write_box!(&mut buf, b"hvcC", {
            buf.put_u8(1); // configurationVersion
            buf.put_u8(
                (self.general_profile_space << 6)
                    | (u8::from(self.general_tier_flag) << 5)
                    | self.general_profile_idc,
            );
            buf.put_u32(self.general_profile_compatibility_flags);
            buf.put_u32((self.general_constraint_indicator_flags >> 16) as u32);
            buf.put_u16(self.general_constraint_indicator_flags as u16);
            buf.put_u8(self.general_level_idc);
            buf.put_u16(self.min_spatial_segmentation_idc | 0xF000);
            buf.put_u8(self.parallelism_type | 0xFC);
            buf.put_u8(self.chroma_format | 0xFC);
            buf.put_u8(self.bit_depth_luma_minus8 | 0xF8);
            buf.put_u8(self.bit_depth_chroma_minus8 | 0xF8);
            buf.put_u16(self.avg_frame_rate);
            buf.put_u8(
                (self.constant_frame_rate << 6)
                    | (self.num_temporal_layers << 3)
                    | (u8::from(self.temporal_id_nested) << 2)
                    | self.length_size_minus_one,
            );
            let arrays: [(u8, &Vec<ParameterSet>, bool); 5] = [
                (NALU_TYPE_VPS, &self.vps_list, true),
                (NALU_TYPE_SPS, &self.sps_list, true),
                (NALU_TYPE_PPS, &self.pps_list, true),
                (NALU_TYPE_PREFIX_SEI, &self.prefix_sei_list, false),
                (NALU_TYPE_SUFFIX_SEI, &self.suffix_sei_list, false),
            ];
            let num_of_arrays = arrays
                .iter()
                .filter(|(_, list, _)| nalu::active_ps_count(list) > 0)
                .count() as u8;
            buf.put_u8(num_of_arrays);
            for (nal_unit_type, list, array_completeness) in &arrays {
                let count = nalu::active_ps_count(list);
                if count == 0 {
                    continue;
                }
                buf.put_u8((u8::from(*array_completeness) << 7) | nal_unit_type);
                buf.put_u16(count as u16);
                for ps in list.iter().filter(|ps| !ps.unused) {
                    buf.put_u16(ps.nal_unit.len() as u16);
                    buf.extend_from_slice(&ps.nal_unit);
                }
            }
        });
        Ok(buf.freeze())
    }
}

fn parse_scaling_list_data(bits: &mut NalBits) -> Result<(), Error> {
    for size_id in 0..4 {
        let matrices = if size_id == 3 { 2 } else { 6 };
        for _ in 0..matrices {
            if !bits.flag()? {
                // scaling_list_pred_mode_flag
                bits.ue()?; // scaling_list_pred_matrix_id_delta
            } else {
                let coef_num = std::cmp::min(64, 1usize << (4 + (size_id << 1)));
                if size_id > 1 {
                    bits.se()?; // scaling_list_dc_coef_minus8
                }
                for _ in 0..coef_num {
                    bits.se()?; // scaling_list_delta_coef
                }
            }
        }
    }
    Ok(())
}

/// short_term_ref_pic_set() at index `st_rps_idx`, which may predict
/// from an earlier set.
fn parse_short_term_ref_pic_set(
    bits: &mut NalBits,
    sps: &mut Sps,
    st_rps_idx: usize,
) -> Result<(), Error> {
    let inter_rps_prediction = if st_rps_idx != 0 { bits.flag()? } else { false };
    if inter_rps_prediction {
        // delta_idx_minus1 appears only in slice headers, where
        // st_rps_idx equals num_short_term_ref_pic_sets.
        let delta_idx_minus1 = if st_rps_idx == usize::from(sps.num_short_term_ref_pic_sets) {
            bits.ue()?
        } else {
            0
        };
        let delta_rps_sign = bits.flag()?;
        let abs_delta_rps_minus1 = bits.ue()?;
        let ref_rps_idx = st_rps_idx
            .checked_sub(delta_idx_minus1 as usize + 1)
            .ok_or_else(|| format_err!("delta_idx_minus1 out of range"))?;
        let delta_rps = if delta_rps_sign { -1i64 } else { 1 } * (abs_delta_rps_minus1 as i64 + 1);
        let ref_rps = sps.st_rps[ref_rps_idx];
        let mut used_by_curr_pic = [false; 33];
        let mut use_delta = [true; 33];
        for j in 0..=usize::from(ref_rps.num_delta_pocs) {
            used_by_curr_pic[j] = bits.flag()?;
            if !used_by_curr_pic[j] {
                use_delta[j] = bits.flag()?;
            }
        }
        let mut st_rps = StRps::default();
        // NumNegativePics
        let mut i = 0;
        for j in (0..usize::from(ref_rps.num_positive_pics)).rev() {
            let d_poc = i64::from(ref_rps.delta_poc_s1[j]) + delta_rps;
            if d_poc < 0 && use_delta[usize::from(ref_rps.num_negative_pics) + j] {
                st_rps.delta_poc_s0[i] = d_poc as i32;
                st_rps.used_by_curr_pic_s0[i] =
                    used_by_curr_pic[usize::from(ref_rps.num_negative_pics) + j];
                i += 1;
            }
        }
        if delta_rps < 0 && use_delta[usize::from(ref_rps.num_delta_pocs)] {
            st_rps.delta_poc_s0[i] = delta_rps as i32;
            st_rps.used_by_curr_pic_s0[i] = used_by_curr_pic[usize::from(ref_rps.num_delta_pocs)];
            i += 1;
        }
        for j in 0..usize::from(ref_rps.num_negative_pics) {
            let d_poc = i64::from(ref_rps.delta_poc_s0[j]) + delta_rps;
            if d_poc < 0 && use_delta[j] {
                st_rps.delta_poc_s0[i] = d_poc as i32;
                st_rps.used_by_curr_pic_s0[i] = used_by_curr_pic[j];
                i += 1;
            }
        }
        st_rps.num_negative_pics = i as u8;
        // NumPositivePics
        i = 0;
        for j in (0..usize::from(ref_rps.num_negative_pics)).rev() {
            let d_poc = i64::from(ref_rps.delta_poc_s0[j]) + delta_rps;
            if d_poc > 0 && use_delta[j] {
                st_rps.delta_poc_s1[i] = d_poc as i32;
                st_rps.used_by_curr_pic_s1[i] = used_by_curr_pic[j];
                i += 1;
            }
        }
        if delta_rps > 0 && use_delta[usize::from(ref_rps.num_delta_pocs)] {
            st_rps.delta_poc_s1[i] = delta_rps as i32;
            st_rps.used_by_curr_pic_s1[i] = used_by_curr_pic[usize::from(ref_rps.num_delta_pocs)];
            i += 1;
        }
        for j in 0..usize::from(ref_rps.num_positive_pics) {
            let d_poc = i64::from(ref_rps.delta_poc_s1[j]) + delta_rps;
            if d_poc > 0 && use_delta[usize::from(ref_rps.num_negative_pics) + j] {
                st_rps.delta_poc_s1[i] = d_poc as i32;
                st_rps.used_by_curr_pic_s1[i] =
                    used_by_curr_pic[usize::from(ref_rps.num_negative_pics) + j];
                i += 1;
            }
        }
        st_rps.num_positive_pics = i as u8;
        st_rps.num_delta_pocs = st_rps.num_negative_pics + st_rps.num_positive_pics;
        sps.st_rps[st_rps_idx] = st_rps;
    } else {
        let num_negative_pics = bits.ue()?;
        let num_positive_pics = bits.ue()?;
        if num_negative_pics >= MAX_DPB_SIZE || num_positive_pics >= MAX_DPB_SIZE {
            bail!("short-term RPS larger than the DPB");
        }
        let st_rps = &mut sps.st_rps[st_rps_idx];
        st_rps.num_negative_pics = num_negative_pics as u8;
        st_rps.num_positive_pics = num_positive_pics as u8;
        st_rps.num_delta_pocs = st_rps.num_negative_pics + st_rps.num_positive_pics;
        for i in 0..num_negative_pics as usize {
            let delta_poc_s0_minus1 = bits.ue()? as i64;
            st_rps.delta_poc_s0[i] = if i == 0 {
                -(delta_poc_s0_minus1 as i32 + 1)
            } else {
                st_rps.delta_poc_s0[i - 1] - (delta_poc_s0_minus1 as i32 + 1)
            };
            st_rps.used_by_curr_pic_s0[i] = bits.flag()?;
        }
        for i in 0..num_positive_pics as usize {
            let delta_poc_s1_minus1 = bits.ue()? as i64;
            st_rps.delta_poc_s1[i] = if i == 0 {
                delta_poc_s1_minus1 as i32 + 1
            } else {
                st_rps.delta_poc_s1[i - 1] + (delta_poc_s1_minus1 as i32 + 1)
            };
            st_rps.used_by_curr_pic_s1[i] = bits.flag()?;
        }
    }
    Ok(())
}

fn parse_vps_minimally(ebsp: &[u8]) -> Result<Vps, Error> {
    let rbsp = unescape_rbsp(ebsp);
    let mut bits = NalBits::new(&rbsp);
    let bits = &mut bits;
    let mut vps = Vps::default();
    vps.video_parameter_set_id = bits.get_u8(4)?;
    // vps_reserved_three_2bits
    if bits.get_u8(2)? != 3 {
        bail!("vps_reserved_three_2bits is not 3");
    }
    // vps_max_layers_minus1 shall be 0 in the specification we refer to.
    if bits.get_u8(6)? != 0 {
        bail!("multi-layer VPS");
    }
    vps.max_sub_layers_minus1 = bits.get_u8(3)?;
    vps.temporal_id_nesting_flag = bits.flag()?;
    // When vps_max_sub_layers_minus1 is 0, nesting shall be 1.
    if vps.max_sub_layers_minus1 == 0 && !vps.temporal_id_nesting_flag {
        bail!("vps_temporal_id_nesting_flag contradiction");
    }
    if bits.get(16)? != 0xFFFF {
        bail!("vps_reserved_0xffff_16bits mismatch");
    }
    parse_profile_tier_level(bits, &mut vps.ptl, vps.max_sub_layers_minus1)?;
    vps.frame_field_info_present =
        vps.ptl.general.progressive_source_flag && vps.ptl.general.interlaced_source_flag;
    let sub_layer_ordering_info_present = bits.flag()?;
    let start = if sub_layer_ordering_info_present {
        0
    } else {
        vps.max_sub_layers_minus1
    };
    for _ in start..=vps.max_sub_layers_minus1 {
        bits.ue()?; // max_dec_pic_buffering_minus1[i]
        bits.ue()?; // max_num_reorder_pics[i]
        bits.ue()?; // max_latency_increase_plus1[i]
    }
    let max_layer_id = bits.get_u8(6)?;
    let num_layer_sets_minus1 = bits.ue()?;
    for _ in 1..=num_layer_sets_minus1 {
        for _ in 0..=max_layer_id {
            bits.skip(1)?; // layer_id_included_flag[i][j]
        }
    }
    Ok(vps)
}

/// Full VPS parse: the minimal fields plus timing/HRD.
fn parse_vps_rbsp(ebsp: &[u8]) -> Result<Vps, Error> {
    let rbsp = unescape_rbsp(ebsp);
    let mut bits = NalBits::new(&rbsp);
    let bits = &mut bits;
    let mut vps = {
        // Re-parse the minimal prefix in place to keep one reader.
        let mut v = Vps::default();
        v.video_parameter_set_id = bits.get_u8(4)?;
        if bits.get_u8(2)? != 3 {
            bail!("vps_reserved_three_2bits is not 3");
        }
        if bits.get_u8(6)? != 0 {
            bail!("multi-layer VPS");
        }
        v.max_sub_layers_minus1 = bits.get_u8(3)?;
        v.temporal_id_nesting_flag = bits.flag()?;
        if v.max_sub_layers_minus1 == 0 && !v.temporal_id_nesting_flag {
            bail!("vps_temporal_id_nesting_flag contradiction");
        }
        if bits.get(16)? != 0xFFFF {
            bail!("vps_reserved_0xffff_16bits mismatch");
        }
        parse_profile_tier_level(bits, &mut v.ptl, v.max_sub_layers_minus1)?;
        v.frame_field_info_present =
            v.ptl.general.progressive_source_flag && v.ptl.general.interlaced_source_flag;
        let sub_layer_ordering_info_present = bits.flag()?;
        let start = if sub_layer_ordering_info_present {
            0
        } else {
            v.max_sub_layers_minus1
        };
        for _ in start..=v.max_sub_layers_minus1 {
            bits.ue()?;
            bits.ue()?;
            bits.ue()?;
        }
        let max_layer_id = bits.get_u8(6)?;
        let num_layer_sets_minus1 = bits.ue()?;
        for _ in 1..=num_layer_sets_minus1 {
            for _ in 0..=max_layer_id {
                bits.skip(1)?;
            }
        }
        v
    };
    if bits.flag()? {
        // vps_timing_info_present_flag
        bits.skip(32)?; // num_units_in_tick
        bits.skip(32)?; // time_scale
        if bits.flag()? {
            bits.ue()?; // num_ticks_poc_diff_one_minus1
        }
        let num_hrd_parameters = bits.ue()?;
        for i in 0..num_hrd_parameters {
            bits.ue()?; // hrd_layer_set_idx[i]
            let cprms_present = if i > 0 { bits.flag()? } else { true };
            // Only the first two sets are kept.
            let mut dummy = Hrd::default();
            let hrd = if i <= 1 {
                &mut vps.hrd[i as usize]
            } else {
                &mut dummy
            };
            parse_hrd_parameters(bits, hrd, cprms_present, vps.max_sub_layers_minus1)?;
        }
    }
    // Skip the VPS extension.
    vps.present = true;
    Ok(vps)
}

fn parse_sps_minimally(ebsp: &[u8]) -> Result<Sps, Error> {
    let rbsp = unescape_rbsp(ebsp);
    let mut bits = NalBits::new(&rbsp);
    let bits = &mut bits;
    let mut sps = Sps::default();
    sps.st_rps = vec![StRps::default(); 66];
    sps.video_parameter_set_id = bits.get_u8(4)?;
    sps.max_sub_layers_minus1 = bits.get_u8(3)?;
    sps.temporal_id_nesting_flag = bits.flag()?;
    parse_profile_tier_level(bits, &mut sps.ptl, sps.max_sub_layers_minus1)?;
    let seq_parameter_set_id = bits.ue()?;
    if seq_parameter_set_id > u64::from(MAX_SPS_ID) {
        bail!("seq_parameter_set_id out of range");
    }
    sps.seq_parameter_set_id = seq_parameter_set_id as u8;
    let chroma_format_idc = bits.ue()?;
    if chroma_format_idc > 3 {
        bail!("chroma_format_idc out of range");
    }
    sps.chroma_format_idc = chroma_format_idc as u8;
    if sps.chroma_format_idc == 3 {
        sps.separate_colour_plane_flag = bits.flag()?;
    }
    let pic_width_in_luma_samples = bits.ue()?;
    let pic_height_in_luma_samples = bits.ue()?;
    sps.cropped_width = pic_width_in_luma_samples as u32;
    sps.cropped_height = pic_height_in_luma_samples as u32;
    if bits.flag()? {
        // conformance_window_flag
        let conf_win_left_offset = bits.ue()?;
        let conf_win_right_offset = bits.ue()?;
        let conf_win_top_offset = bits.ue()?;
        let conf_win_bottom_offset = bits.ue()?;
        sps.cropped_width = sps.cropped_width.wrapping_sub(
            ((conf_win_left_offset + conf_win_right_offset) as u32)
                * SUB_WIDTH_C[usize::from(sps.chroma_format_idc)],
        );
        sps.cropped_height = sps.cropped_height.wrapping_sub(
            ((conf_win_top_offset + conf_win_bottom_offset) as u32)
                * SUB_HEIGHT_C[usize::from(sps.chroma_format_idc)],
        );
    }
    sps.bit_depth_luma_minus8 = bits.ue()? as u8;
    sps.bit_depth_chroma_minus8 = bits.ue()? as u8;
    let log2_max_pic_order_cnt_lsb_minus4 = bits.ue()?;
    if log2_max_pic_order_cnt_lsb_minus4 > 12 {
        bail!("log2_max_pic_order_cnt_lsb_minus4 out of range");
    }
    sps.log2_max_pic_order_cnt_lsb = log2_max_pic_order_cnt_lsb_minus4 as u8 + 4;
    let sub_layer_ordering_info_present = bits.flag()?;
    let start = if sub_layer_ordering_info_present {
        0
    } else {
        sps.max_sub_layers_minus1
    };
    for _ in start..=sps.max_sub_layers_minus1 {
        bits.ue()?; // max_dec_pic_buffering_minus1[i]
        bits.ue()?; // max_num_reorder_pics[i]
        bits.ue()?; // max_latency_increase_plus1[i]
    }
    let log2_min_luma_coding_block_size_minus3 = bits.ue()?;
    let log2_diff_max_min_luma_coding_block_size = bits.ue()?;
    bits.ue()?; // log2_min_transform_block_size_minus2
    bits.ue()?; // log2_diff_max_min_transform_block_size
    bits.ue()?; // max_transform_hierarchy_depth_inter
    bits.ue()?; // max_transform_hierarchy_depth_intra
    {
        let min_cb_log2_size = log2_min_luma_coding_block_size_minus3 + 3;
        let min_cb_size = 1u64 << min_cb_log2_size.min(31);
        if pic_width_in_luma_samples == 0
            || pic_width_in_luma_samples % min_cb_size != 0
            || pic_height_in_luma_samples == 0
            || pic_height_in_luma_samples % min_cb_size != 0
        {
            // Both must be an integer multiple of MinCbSizeY.
            bail!("picture size is not a multiple of MinCbSizeY");
        }
        let ctb_log2_size = min_cb_log2_size + log2_diff_max_min_luma_coding_block_size;
        let ctb_size = 1u64 << ctb_log2_size.min(31);
        sps.pic_width_in_ctbs = ((pic_width_in_luma_samples - 1) / ctb_size + 1) as u32;
        sps.pic_height_in_ctbs = ((pic_height_in_luma_samples - 1) / ctb_size + 1) as u32;
        sps.pic_size_in_ctbs = u64::from(sps.pic_width_in_ctbs) * u64::from(sps.pic_height_in_ctbs);
    }
    if bits.flag()? && bits.flag()? {
        // scaling_list_enabled_flag && sps_scaling_list_data_present_flag
        parse_scaling_list_data(bits)?;
    }
    bits.skip(1)?; // amp_enabled_flag
    bits.skip(1)?; // sample_adaptive_offset_enabled_flag
    if bits.flag()? {
        // pcm_enabled_flag
        bits.skip(4)?; // pcm_sample_bit_depth_luma_minus1
        bits.skip(4)?; // pcm_sample_bit_depth_chroma_minus1
        bits.ue()?; // log2_min_pcm_luma_coding_block_size_minus3
        bits.ue()?; // log2_diff_max_min_pcm_luma_coding_block_size
        bits.skip(1)?; // pcm_loop_filter_disabled_flag
    }
    let num_short_term_ref_pic_sets = bits.ue()?;
    if num_short_term_ref_pic_sets > 64 {
        bail!("num_short_term_ref_pic_sets out of range");
    }
    sps.num_short_term_ref_pic_sets = num_short_term_ref_pic_sets as u8;
    for i in 0..num_short_term_ref_pic_sets as usize {
        parse_short_term_ref_pic_set(bits, &mut sps, i)?;
    }
    sps.long_term_ref_pics_present_flag = bits.flag()?;
    if sps.long_term_ref_pics_present_flag {
        let num_long_term_ref_pics_sps = bits.ue()?;
        sps.num_long_term_ref_pics_sps = num_long_term_ref_pics_sps as u8;
        for _ in 0..num_long_term_ref_pics_sps {
            bits.skip(u64::from(sps.log2_max_pic_order_cnt_lsb))?; // lt_ref_pic_poc_lsb_sps[i]
            bits.skip(1)?; // used_by_curr_pic_lt_sps_flag[i]
        }
    }
    sps.temporal_mvp_enabled_flag = bits.flag()?;
    bits.skip(1)?; // strong_intra_smoothing_enabled_flag
    if bits.flag()? {
        // vui_parameters()
        if bits.flag()? {
            // aspect_ratio_info_present_flag
            let aspect_ratio_idc = bits.get_u8(8)?;
            if aspect_ratio_idc == 255 {
                sps.vui.sar_width = bits.get(16)? as u16;
                sps.vui.sar_height = bits.get(16)? as u16;
            } else if usize::from(aspect_ratio_idc) < PRE_DEFINED_SAR.len() {
                let (w, h) = PRE_DEFINED_SAR[usize::from(aspect_ratio_idc)];
                sps.vui.sar_width = w;
                sps.vui.sar_height = h;
            }
        }
        if bits.flag()? {
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
                sps.vui.matrix_coeffs = bits.get_u8(8)?;
            } else {
                sps.vui.colour_primaries = 2;
                sps.vui.transfer_characteristics = 2;
                sps.vui.matrix_coeffs = 2;
            }
        } else {
            sps.vui.colour_primaries = 2;
            sps.vui.transfer_characteristics = 2;
            sps.vui.matrix_coeffs = 2;
        }
        if bits.flag()? {
            // chroma_loc_info_present_flag
            bits.ue()?;
            bits.ue()?;
        }
        bits.skip(1)?; // neutral_chroma_indication_flag
        sps.vui.field_seq_flag = bits.flag()?;
        sps.vui.frame_field_info_present = bits.flag()?;
        if sps.vui.field_seq_flag {
            // cropped_height indicates a frame.
            sps.cropped_height *= 2;
        }
        if bits.flag()? {
            // default_display_window_flag; offsets in chroma units.
            for offset in sps.vui.def_disp_win_offset.iter_mut() {
                *offset = bits.ue()? as u32;
            }
            sps.vui.def_disp_win_offset[0] *= SUB_WIDTH_C[usize::from(sps.chroma_format_idc)];
            sps.vui.def_disp_win_offset[1] *= SUB_WIDTH_C[usize::from(sps.chroma_format_idc)];
            sps.vui.def_disp_win_offset[2] *= SUB_HEIGHT_C[usize::from(sps.chroma_format_idc)];
            sps.vui.def_disp_win_offset[3] *= SUB_HEIGHT_C[usize::from(sps.chroma_format_idc)];
        }
        if bits.flag()? {
            // vui_timing_info_present_flag
            sps.vui.num_units_in_tick = bits.get_u32(32)?;
            sps.vui.time_scale = bits.get_u32(32)?;
            if bits.flag()? {
                bits.ue()?; // vui_num_ticks_poc_diff_one_minus1
            }
            if bits.flag()? {
                // vui_hrd_parameters_present_flag
                let mut hrd = Hrd::default();
                parse_hrd_parameters(bits, &mut hrd, true, sps.max_sub_layers_minus1)?;
                sps.vui.hrd = hrd;
            }
        } else {
            sps.vui.num_units_in_tick = 1; // arbitrary
            sps.vui.time_scale = 25; // arbitrary
        }
        if bits.flag()? {
            // bitstream_restriction_flag
            bits.skip(1)?; // tiles_fixed_structure_flag
            bits.skip(1)?; // motion_vectors_over_pic_boundaries_flag
            bits.skip(1)?; // restricted_ref_pic_lists_flag
            sps.vui.min_spatial_segmentation_idc = bits.ue()? as u16;
            bits.ue()?; // max_bytes_per_pic_denom
            bits.ue()?; // max_bits_per_min_cu_denom
            bits.ue()?; // log2_max_mv_length_horizontal
            bits.ue()?; // log2_max_mv_length_vertical
        }
    } else {
        sps.vui.colour_primaries = 2;
        sps.vui.transfer_characteristics = 2;
        sps.vui.matrix_coeffs = 2;
        sps.vui.frame_field_info_present =
            sps.ptl.general.progressive_source_flag && sps.ptl.general.interlaced_source_flag;
        sps.vui.num_units_in_tick = 1; // arbitrary
        sps.vui.time_scale = 25; // arbitrary
    }
    sps.present = true;
    Ok(sps)
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

fn parse_pps_prefix(bits: &mut NalBits) -> Result<Pps, Error> {
    let mut pps = Pps::default();
    let pic_parameter_set_id = bits.ue()?;
    if pic_parameter_set_id > u64::from(MAX_PPS_ID) {
        bail!("pic_parameter_set_id out of range");
    }
    pps.pic_parameter_set_id = pic_parameter_set_id as u8;
    let seq_parameter_set_id = bits.ue()?;
    if seq_parameter_set_id > u64::from(MAX_SPS_ID) {
        bail!("seq_parameter_set_id out of range");
    }
    pps.seq_parameter_set_id = seq_parameter_set_id as u8;
    pps.dependent_slice_segments_enabled_flag = bits.flag()?;
    pps.output_flag_present_flag = bits.flag()?;
    pps.num_extra_slice_header_bits = bits.get_u8(3)?;
    bits.skip(1)?; // sign_data_hiding_enabled_flag
    bits.skip(1)?; // cabac_init_present_flag
    bits.ue()?; // num_ref_idx_l0_default_active_minus1
    bits.ue()?; // num_ref_idx_l1_default_active_minus1
    bits.se()?; // init_qp_minus26
    bits.skip(1)?; // constrained_intra_pred_flag
    bits.skip(1)?; // transform_skip_enabled_flag
    if bits.flag()? {
        // cu_qp_delta_enabled_flag
        bits.ue()?; // diff_cu_qp_delta_depth
    }
    bits.se()?; // pps_cb_qp_offset
    bits.se()?; // pps_cr_qp_offset
    bits.skip(1)?; // pps_slice_chroma_qp_offsets_present_flag
    bits.skip(1)?; // weighted_pred_flag
    bits.skip(1)?; // weighted_bipred_flag
    bits.skip(1)?; // transquant_bypass_enabled_flag
    pps.tiles_enabled_flag = bits.flag()?;
    pps.entropy_coding_sync_enabled_flag = bits.flag()?;
    Ok(pps)
}

/// The prefix is enough for `hvcC` aggregation (parallelismType).
fn parse_pps_minimally(ebsp: &[u8]) -> Result<Pps, Error> {
    let rbsp = unescape_rbsp(&ebsp[..ebsp.len().min(64)]);
    let mut bits = NalBits::new(&rbsp);
    parse_pps_prefix(&mut bits)
}

/// Parser state threaded through one H.265 elementary stream.
#[derive(Default)]
pub struct HevcParser {
    pub hvcc: HevcConfigurationRecord,
    pub hvcc_next: HevcConfigurationRecord,
    pub hvcc_pending: bool,
    vps_by_id: SmallVec<[Vps; 1]>,
    sps_by_id: SmallVec<[Sps; 1]>,
    pps_by_id: SmallVec<[Pps; 2]>,
    pub vps: Vps,
    pub sps: Sps,
    pub pps: Pps,
    pub sei: Sei,
    pub slice: SliceInfo,
    pub prev_nalu_type: u8,
    /// An EOS or EOB NALU has appeared; the next IRAP resets POC.
    pub eos: bool,
}

impl HevcParser {
    pub fn new() -> HevcParser {
        let mut parser = HevcParser::default();
        parser.prev_nalu_type = NALU_TYPE_UNKNOWN;
        // The first picture of the stream behaves as after an end of
        // sequence.
        parser.eos = true;
        parser
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

    pub fn parse_vps(&mut self, ebsp: &[u8]) -> Result<(), Error> {
        let vps = parse_vps_rbsp(ebsp)?;
        match self
            .vps_by_id
            .iter_mut()
            .find(|v| v.video_parameter_set_id == vps.video_parameter_set_id)
        {
            Some(slot) => *slot = vps,
            None => self.vps_by_id.push(vps),
        }
        self.vps = vps;
        Ok(())
    }

    pub fn parse_sps(&mut self, ebsp: &[u8]) -> Result<(), Error> {
        let sps = parse_sps_minimally(ebsp)?;
        match self
            .sps_by_id
            .iter_mut()
            .find(|s| s.seq_parameter_set_id == sps.seq_parameter_set_id)
        {
            Some(slot) => *slot = sps.clone(),
            None => self.sps_by_id.push(sps.clone()),
        }
        self.sps = sps;
        self.activate_vps(self.sps.video_parameter_set_id);
        Ok(())
    }

    fn activate_vps(&mut self, vps_id: u8) {
        if let Some(vps) = self
            .vps_by_id
            .iter()
            .find(|v| v.video_parameter_set_id == vps_id)
        {
            self.vps = *vps;
        }
    }

    pub fn parse_pps(&mut self, ebsp: &[u8]) -> Result<(), Error> {
        let rbsp = unescape_rbsp(ebsp);
        let mut bits = NalBits::new(&rbsp);
        let bits = &mut bits;
        let mut pps = parse_pps_prefix(bits)?;
        let sps = self.sps_by_id(pps.seq_parameter_set_id)?.clone();
        if pps.tiles_enabled_flag {
            let num_tile_columns_minus1 = bits.ue()?;
            let num_tile_rows_minus1 = bits.ue()?;
            if num_tile_columns_minus1 >= u64::from(sps.pic_width_in_ctbs)
                || num_tile_rows_minus1 >= u64::from(sps.pic_height_in_ctbs)
            {
                bail!("more tiles than coding tree blocks");
            }
            pps.num_tile_columns_minus1 = num_tile_columns_minus1 as u32;
            pps.num_tile_rows_minus1 = num_tile_rows_minus1 as u32;
            let cols = pps.num_tile_columns_minus1 as usize + 1;
            let rows = pps.num_tile_rows_minus1 as usize + 1;
            pps.col_width = vec![0; cols];
            pps.row_height = vec![0; rows];
            if bits.flag()? {
                // uniform_spacing_flag
                for (i, w) in pps.col_width.iter_mut().enumerate() {
                    let i = i as u64;
                    *w = (((i + 1) * u64::from(sps.pic_width_in_ctbs)) / cols as u64
                        - (i * u64::from(sps.pic_width_in_ctbs)) / cols as u64)
                        as u32;
                }
                for (j, h) in pps.row_height.iter_mut().enumerate() {
                    let j = j as u64;
                    *h = (((j + 1) * u64::from(sps.pic_height_in_ctbs)) / rows as u64
                        - (j * u64::from(sps.pic_height_in_ctbs)) / rows as u64)
                        as u32;
                }
            } else {
                let mut last_width = sps.pic_width_in_ctbs;
                for i in 0..cols - 1 {
                    pps.col_width[i] = bits.ue()? as u32 + 1; // column_width_minus1[i]
                    last_width = last_width.saturating_sub(pps.col_width[i]);
                }
                pps.col_width[cols - 1] = last_width;
                let mut last_height = sps.pic_height_in_ctbs;
                for j in 0..rows - 1 {
                    pps.row_height[j] = bits.ue()? as u32 + 1; // row_height_minus1[j]
                    last_height = last_height.saturating_sub(pps.row_height[j]);
                }
                pps.row_height[rows - 1] = last_height;
            }
            pps.col_bd = vec![0; cols];
            for i in 1..cols {
                pps.col_bd[i] = pps.col_bd[i - 1] + pps.col_width[i - 1];
            }
            pps.row_bd = vec![0; rows];
            for j in 1..rows {
                pps.row_bd[j] = pps.row_bd[j - 1] + pps.row_height[j - 1];
            }
            bits.skip(1)?; // loop_filter_across_tiles_enabled_flag
        } else {
            pps.num_tile_columns_minus1 = 0;
            pps.num_tile_rows_minus1 = 0;
            pps.col_width = vec![sps.pic_width_in_ctbs];
            pps.row_height = vec![sps.pic_height_in_ctbs];
            pps.col_bd = vec![0];
            pps.row_bd = vec![0];
        }
        // Skip the PPS extension.
        pps.present = true;
        match self
            .pps_by_id
            .iter_mut()
            .find(|p| p.pic_parameter_set_id == pps.pic_parameter_set_id)
        {
            Some(slot) => *slot = pps.clone(),
            None => self.pps_by_id.push(pps.clone()),
        }
        self.sps = sps;
        self.pps = pps;
        self.activate_vps(self.sps.video_parameter_set_id);
        Ok(())
    }

    pub fn parse_sei(&mut self, nuh: &NaluHeader, ebsp: &[u8]) -> Result<(), Error> {
        let rbsp = unescape_rbsp(ebsp);
        let mut bits = NalBits::new(&rbsp);
        let bits = &mut bits;
        let mut rbsp_pos: usize = 0;
        loop {
            // sei_message()
            let mut payload_type: u32 = 0;
            loop {
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
            let total = u64::from(payload_size) * 8;
            let mut consumed: u64 = 0;
            if nuh.nal_unit_type == NALU_TYPE_PREFIX_SEI {
                match payload_type {
                    1 => {
                        // pic_timing
                        let hrd = if self.sps.present {
                            self.sps.vui.hrd
                        } else if self.vps.present {
                            self.vps.hrd[0]
                        } else {
                            // No active VPS or SPS is found.
                            bits.skip(total)?;
                            bits.align()?;
                            rbsp_pos += payload_size as usize;
                            if rbsp_pos >= rbsp.len() || rbsp[rbsp_pos] == 0x80 {
                                break;
                            }
                            continue;
                        };
                        self.sei.pic_timing.present = true;
                        if (self.sps.present && self.sps.vui.frame_field_info_present)
                            || self.vps.frame_field_info_present
                        {
                            self.sei.pic_timing.pic_struct = bits.get_u8(4)?;
                            bits.skip(2)?; // source_scan_type
                            bits.skip(1)?; // duplicate_flag
                            consumed += 7;
                        }
                        if hrd.cpb_dpb_delays_present {
                            bits.skip(u64::from(hrd.au_cpb_removal_delay_length))?;
                            bits.skip(u64::from(hrd.dpb_output_delay_length))?;
                            consumed += u64::from(hrd.au_cpb_removal_delay_length)
                                + u64::from(hrd.dpb_output_delay_length);
                            if hrd.sub_pic_hrd_params_present {
                                bits.skip(u64::from(hrd.dpb_output_delay_du_length))?;
                                consumed += u64::from(hrd.dpb_output_delay_du_length);
                                if hrd.sub_pic_cpb_params_in_pic_timing_sei {
                                    // Walk the decoding-unit info rather
                                    // than modeling it.
                                    let before = bits.position();
                                    let num_decoding_units_minus1 = bits.ue()?;
                                    let du_common = bits.flag()?;
                                    if du_common {
                                        bits.skip(u64::from(
                                            hrd.du_cpb_removal_delay_increment_length,
                                        ))?;
                                    }
                                    for i in 0..=num_decoding_units_minus1 {
                                        bits.ue()?; // num_nalus_in_du_minus1
                                        if !du_common && i < num_decoding_units_minus1 {
                                            bits.ue()?; // du_cpb_removal_delay_increment_minus1
                                        }
                                    }
                                    consumed += bits.position() - before;
                                }
                            }
                        }
                        if consumed > total {
                            bail!("pic_timing shorter than its fields");
                        }
                        bits.skip(total - consumed)?;
                    }
                    3 => bail!("filler payload in SEI"),
                    6 => {
                        // recovery_point
                        let before = bits.position();
                        self.sei.recovery_point.present = true;
                        self.sei.recovery_point.recovery_poc_cnt = bits.se()? as i32;
                        bits.skip(1)?; // exact_match_flag
                        self.sei.recovery_point.broken_link_flag = bits.flag()?;
                        let used = bits.position() - before;
                        if used > total {
                            bail!("recovery_point shorter than its fields");
                        }
                        bits.skip(total - used)?;
                    }
                    _ => bits.skip(total)?,
                }
            } else if payload_type == 3 {
                bail!("filler payload in SEI");
            } else {
                bits.skip(total)?;
            }
            bits.align()?;
            rbsp_pos += payload_size as usize;
            if rbsp_pos >= rbsp.len() || rbsp[rbsp_pos] == 0x80 {
                break;
            }
        }
        Ok(())
    }

    /// Parses a slice segment header far enough for AU delimiting and POC.
    pub fn parse_slice_segment_header(
        &mut self,
        nuh: &NaluHeader,
        ebsp: &[u8],
    ) -> Result<(), Error> {
        let rbsp = unescape_rbsp(&ebsp[..ebsp.len().min(50)]);
        let mut bits = NalBits::new(&rbsp);
        let bits = &mut bits;
        let mut slice = SliceInfo::default();
        slice.nalu_type = nuh.nal_unit_type;
        slice.temporal_id = nuh.temporal_id;
        slice.first_slice_segment_in_pic_flag = bits.flag()?;
        if (NALU_TYPE_BLA_W_LP..=NALU_TYPE_RSV_IRAP_VCL23).contains(&nuh.nal_unit_type) {
            bits.skip(1)?; // no_output_of_prior_pics_flag
        }
        let pic_parameter_set_id = bits.ue()?;
        if pic_parameter_set_id > u64::from(MAX_PPS_ID) {
            bail!("slice_pic_parameter_set_id out of range");
        }
        slice.pic_parameter_set_id = pic_parameter_set_id as u8;
        let pps = self.pps_by_id(slice.pic_parameter_set_id)?.clone();
        let sps = self.sps_by_id(pps.seq_parameter_set_id)?.clone();
        slice.video_parameter_set_id = sps.video_parameter_set_id;
        slice.seq_parameter_set_id = pps.seq_parameter_set_id;
        if !slice.first_slice_segment_in_pic_flag {
            slice.dependent_slice_segment_flag = if pps.dependent_slice_segments_enabled_flag {
                bits.flag()?
            } else {
                false
            };
            slice.segment_address = bits.get(ceil_log2(sps.pic_size_in_ctbs) as u8)?;
        }
        if !slice.dependent_slice_segment_flag {
            // Values of a dependent slice segment's header are inferred
            // from the preceding independent one.
            for _ in 0..pps.num_extra_slice_header_bits {
                bits.skip(1)?; // slice_reserved_flag[i]
            }
            slice.slice_type = bits.ue()? as u8;
            if pps.output_flag_present_flag {
                bits.skip(1)?; // pic_output_flag
            }
            if sps.separate_colour_plane_flag {
                bits.skip(1)?; // colour_plane_id
            }
            if nuh.nal_unit_type != NALU_TYPE_IDR_W_RADL && nuh.nal_unit_type != NALU_TYPE_IDR_N_LP
            {
                slice.pic_order_cnt_lsb =
                    bits.get(sps.log2_max_pic_order_cnt_lsb)? as i32;
                let mut sps_for_rps = sps.clone();
                if !bits.flag()? {
                    // short_term_ref_pic_set_sps_flag
                    parse_short_term_ref_pic_set(
                        bits,
                        &mut sps_for_rps,
                        usize::from(sps.num_short_term_ref_pic_sets),
                    )?;
                } else {
                    let length = ceil_log2(u64::from(sps.num_short_term_ref_pic_sets));
                    if length > 0 {
                        bits.skip(u64::from(length))?; // short_term_ref_pic_set_idx
                    }
                }
                if sps.long_term_ref_pics_present_flag {
                    let num_long_term_sps = if sps.num_long_term_ref_pics_sps > 0 {
                        bits.ue()?
                    } else {
                        0
                    };
                    let num_long_term_pics = bits.ue()?;
                    for i in 0..num_long_term_sps + num_long_term_pics {
                        if i < num_long_term_sps {
                            let length = ceil_log2(u64::from(sps.num_long_term_ref_pics_sps));
                            if length > 0 {
                                bits.skip(u64::from(length))?; // lt_idx_sps[i]
                            }
                        } else {
                            bits.skip(u64::from(sps.log2_max_pic_order_cnt_lsb))?; // poc_lsb_lt[i]
                            bits.skip(1)?; // used_by_curr_pic_lt_flag[i]
                        }
                        if bits.flag()? {
                            // delta_poc_msb_present_flag[i]
                            bits.ue()?; // delta_poc_msb_cycle_lt[i]
                        }
                    }
                }
                if sps.temporal_mvp_enabled_flag {
                    bits.skip(1)?; // slice_temporal_mvp_enabled_flag
                }
            } else {
                // For IDR pictures, slice_pic_order_cnt_lsb is inferred 0.
                slice.pic_order_cnt_lsb = 0;
            }
        }
        self.sps = sps;
        self.pps = pps;
        self.slice = slice;
        self.slice.present = true;
        Ok(())
    }

    pub fn try_to_append_dcr_nalu(
        &mut self,
        ps_type: DcrNaluType,
        ps_data: &[u8],
    ) -> Result<(), Error> {
        let verdict = self.hvcc.check_appendable(ps_type, ps_data)?;
        let into_pending = match verdict {
            Appendable::Duplicated => return Ok(()),
            Appendable::NewDcrRequired | Appendable::NewSampleEntryRequired => {
                self.hvcc_pending = true;
                true
            }
            Appendable::Possible => self.hvcc_pending,
        };
        let payload = &ps_data[MIN_NALU_HEADER_LENGTH..];
        match ps_type {
            DcrNaluType::Vps => self.parse_vps(payload)?,
            DcrNaluType::Sps => self.parse_sps(payload)?,
            DcrNaluType::Pps => self.parse_pps(payload)?,
            _ => {}
        }
        let param = if into_pending {
            &mut self.hvcc_next
        } else {
            &mut self.hvcc
        };
        param.append_parameter_set(ps_type, ps_data)
    }

    fn mark_parameter_sets_used(&mut self, slice: &SliceInfo) {
        for &(ps_type, ps_id) in &[
            (DcrNaluType::Vps, slice.video_parameter_set_id),
            (DcrNaluType::Sps, slice.seq_parameter_set_id),
            (DcrNaluType::Pps, slice.pic_parameter_set_id),
        ] {
            if let Some(i) = self.hvcc.position_of_id(ps_type, ps_id) {
                if self.hvcc.list(ps_type)[i].unused {
                    let nal_unit = self.hvcc.list(ps_type)[i].nal_unit.clone();
                    let _ = self.hvcc.append_parameter_set(ps_type, &nal_unit);
                }
            }
        }
    }

    pub fn move_pending_hvcc(&mut self) -> Result<(), Error> {
        if !self.hvcc_pending {
            return Ok(());
        }
        for &ps_type in &DCR_NALU_TYPES {
            for ps in self.hvcc.list_mut(ps_type).iter_mut() {
                ps.unused = true;
            }
        }
        let pending = std::mem::take(&mut self.hvcc_next);
        for &ps_type in &[DcrNaluType::Vps, DcrNaluType::Sps, DcrNaluType::Pps] {
            for src in pending.list(ps_type) {
                let src_id = get_ps_id(ps_type, &src.nal_unit)?;
                match self.hvcc.position_of_id(ps_type, src_id) {
                    Some(i) => {
                        let slot = &mut self.hvcc.list_mut(ps_type)[i];
                        slot.nal_unit = src.nal_unit.clone();
                        slot.unused = src.unused;
                    }
                    None => self.hvcc.list_mut(ps_type).push(src.clone()),
                }
            }
        }
        for &ps_type in &[DcrNaluType::PrefixSei, DcrNaluType::SuffixSei] {
            for src in pending.list(ps_type) {
                self.hvcc.list_mut(ps_type).push(src.clone());
            }
        }
        self.hvcc.general_profile_space = pending.general_profile_space;
        self.hvcc.general_tier_flag = pending.general_tier_flag;
        self.hvcc.general_profile_idc = pending.general_profile_idc;
        self.hvcc.general_profile_compatibility_flags =
            pending.general_profile_compatibility_flags;
        self.hvcc.general_constraint_indicator_flags =
            pending.general_constraint_indicator_flags;
        self.hvcc.general_level_idc = pending.general_level_idc;
        self.hvcc.min_spatial_segmentation_idc = pending.min_spatial_segmentation_idc;
        self.hvcc.parallelism_type = pending.parallelism_type;
        self.hvcc.chroma_format = pending.chroma_format;
        self.hvcc.bit_depth_luma_minus8 = pending.bit_depth_luma_minus8;
        self.hvcc.bit_depth_chroma_minus8 = pending.bit_depth_chroma_minus8;
        self.hvcc.constant_frame_rate = pending.constant_frame_rate;
        self.hvcc.num_temporal_layers = pending.num_temporal_layers;
        self.hvcc.temporal_id_nested = pending.temporal_id_nested;
        self.hvcc.ready = pending.ready;
        self.hvcc_pending = false;
        Ok(())
    }

    pub fn update_picture_info_for_slice(&mut self, picture: &mut PictureInfo, slice: &SliceInfo) {
        picture.has_primary |= !slice.dependent_slice_segment_flag;
        update_picture_type(picture, slice);
        self.mark_parameter_sets_used(slice);
        self.slice.present = false;
    }

    pub fn update_picture_info(&mut self, picture: &mut PictureInfo, slice: &SliceInfo) {
        picture.irap =
            (NALU_TYPE_BLA_W_LP..=NALU_TYPE_CRA).contains(&slice.nalu_type);
        picture.idr = slice.nalu_type == NALU_TYPE_IDR_W_RADL
            || slice.nalu_type == NALU_TYPE_IDR_N_LP;
        picture.broken_link =
            (NALU_TYPE_BLA_W_LP..=NALU_TYPE_BLA_N_LP).contains(&slice.nalu_type);
        picture.radl = slice.nalu_type == NALU_TYPE_RADL_N || slice.nalu_type == NALU_TYPE_RADL_R;
        picture.rasl = slice.nalu_type == NALU_TYPE_RASL_N || slice.nalu_type == NALU_TYPE_RASL_R;
        picture.sublayer_nonref =
            slice.nalu_type <= NALU_TYPE_RSV_VCL_R15 && (slice.nalu_type & 0x01) == 0;
        picture.closed_rap =
            (NALU_TYPE_BLA_W_RADL..=NALU_TYPE_IDR_N_LP).contains(&slice.nalu_type);
        picture.random_accessible = picture.irap;
        picture.temporal_id = slice.temporal_id;
        picture.pic_parameter_set_id = slice.pic_parameter_set_id;
        picture.poc_lsb = slice.pic_order_cnt_lsb;
        self.update_picture_info_for_slice(picture, slice);
        picture.independent = picture.picture_type == PictureType::I;
        picture.field_coded = self.sps.vui.field_seq_flag;
        if self.sei.pic_timing.present {
            if self.sei.pic_timing.pic_struct < 13 {
                const DELTA: [u32; 13] = [2, 1, 1, 2, 2, 3, 3, 4, 6, 1, 1, 1, 1];
                picture.delta = DELTA[usize::from(self.sei.pic_timing.pic_struct)];
            } else {
                // Reserved values in the Recommendation.
                picture.delta = if picture.field_coded { 1 } else { 2 };
            }
            self.sei.pic_timing.present = false;
        } else {
            picture.delta = if picture.field_coded { 1 } else { 2 };
        }
        if self.sei.recovery_point.present {
            picture.random_accessible = true;
            picture.recovery_poc_cnt = self.sei.recovery_point.recovery_poc_cnt;
            picture.broken_link |= self.sei.recovery_point.broken_link_flag;
            self.sei.recovery_point.present = false;
        } else {
            picture.recovery_poc_cnt = 0;
        }
    }

    /// 8.3.1 Decoding process for picture order count. Invoked once per
    /// picture, for its first slice segment.
    pub fn calculate_poc(
        &mut self,
        picture: &mut PictureInfo,
        prev_picture: &PictureInfo,
    ) -> Result<(), Error> {
        let pps = self.pps_by_id(picture.pic_parameter_set_id)?.clone();
        let sps = self.sps_by_id(pps.seq_parameter_set_id)?.clone();
        // The variable NoRaslOutputFlag is 1 for an IDR or BLA picture,
        // the first picture in the stream, or the first to follow an end
        // of sequence NAL unit.
        let no_rasl_output_flag = if picture.irap {
            let flag = picture.idr || picture.broken_link || self.eos;
            if self.eos {
                self.eos = false;
            }
            flag
        } else {
            false
        };
        let poc_lsb = picture.poc_lsb;
        let poc_msb: i64 = if picture.irap && no_rasl_output_flag {
            0
        } else {
            let prev_poc_msb = if picture.idr {
                0
            } else {
                prev_picture.tid0_poc_msb
            };
            let prev_poc_lsb = if picture.idr {
                0
            } else {
                prev_picture.tid0_poc_lsb
            };
            let max_poc_lsb = 1i64 << sps.log2_max_pic_order_cnt_lsb;
            if poc_lsb < prev_poc_lsb && i64::from(prev_poc_lsb - poc_lsb) >= max_poc_lsb / 2 {
                i64::from(prev_poc_msb) + max_poc_lsb
            } else if poc_lsb > prev_poc_lsb && i64::from(poc_lsb - prev_poc_lsb) > max_poc_lsb / 2
            {
                i64::from(prev_poc_msb) - max_poc_lsb
            } else {
                i64::from(prev_poc_msb)
            }
        };
        picture.poc = (poc_msb + i64::from(poc_lsb)) as i32;
        // POC anchors follow the last TemporalId-0 picture that is not
        // leading or sub-layer non-reference.
        picture.tid0_poc_msb = prev_picture.tid0_poc_msb;
        picture.tid0_poc_lsb = prev_picture.tid0_poc_lsb;
        if picture.temporal_id == 0 && !(picture.radl || picture.rasl || picture.sublayer_nonref) {
            picture.tid0_poc_msb = poc_msb as i32;
            picture.tid0_poc_lsb = poc_lsb;
        }
        Ok(())
    }
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
    picture.picture_type = match (picture.picture_type, slice.slice_type) {
        (IP, SLICE_TYPE_B) => IPB,
        (I, SLICE_TYPE_P) => IP,
        (I, SLICE_TYPE_B) => IPB,
        (None, SLICE_TYPE_P) => IP,
        (None, SLICE_TYPE_B) => IPB,
        (None, SLICE_TYPE_I) => I,
        (t, _) => t,
    };
}

/// Raster-scan slice segment address to tile-scan CTB address, with the
/// owning tile's id.
fn ctb_address_in_tile_scan(sps: &Sps, pps: &Pps, segment_address: u64) -> (u64, u64) {
    let tb_x = segment_address % u64::from(sps.pic_width_in_ctbs);
    let tb_y = segment_address / u64::from(sps.pic_width_in_ctbs);
    let mut tile_x = pps.num_tile_columns_minus1 as usize;
    for i in 0..=pps.num_tile_columns_minus1 as usize {
        if pps.col_bd.get(i).copied().unwrap_or(0) as u64 <= tb_x {
            tile_x = i;
        }
    }
    let mut tile_y = pps.num_tile_rows_minus1 as usize;
    for j in 0..=pps.num_tile_rows_minus1 as usize {
        if pps.row_bd.get(j).copied().unwrap_or(0) as u64 <= tb_y {
            tile_y = j;
        }
    }
    let mut ctb_addr_in_ts: u64 = 0;
    for i in 0..tile_x {
        ctb_addr_in_ts += u64::from(pps.row_height[tile_y]) * u64::from(pps.col_width[i]);
    }
    for j in 0..tile_y {
        ctb_addr_in_ts += u64::from(sps.pic_width_in_ctbs) * u64::from(pps.row_height[j]);
    }
    ctb_addr_in_ts += (tb_y - u64::from(pps.row_bd[tile_y])) * u64::from(pps.col_width[tile_x])
        + tb_x
        - u64::from(pps.col_bd[tile_x]);
    let tile_id = tile_y as u64 * (u64::from(pps.num_tile_columns_minus1) + 1) + tile_x as u64;
    (ctb_addr_in_ts, tile_id)
}

/// Whether `slice` starts a new access unit, per 7.4.2.4.5: an explicit
/// first-segment flag, a TemporalId switch, or a tile-scan position that
/// does not strictly follow the previous slice segment.
pub fn find_au_delimit_by_slice_info(
    parser: &HevcParser,
    slice: &SliceInfo,
    prev_slice: &SliceInfo,
) -> bool {
    if slice.first_slice_segment_in_pic_flag {
        return true;
    }
    if slice.temporal_id != prev_slice.temporal_id {
        return true;
    }
    let prev_pps = match parser.pps_by_id(prev_slice.pic_parameter_set_id) {
        Ok(pps) => pps,
        Err(_) => return false,
    };
    let prev_sps = match parser.sps_by_id(prev_pps.seq_parameter_set_id) {
        Ok(sps) => sps,
        Err(_) => return false,
    };
    let (curr_ctb, curr_tile) =
        ctb_address_in_tile_scan(&parser.sps, &parser.pps, slice.segment_address);
    let (prev_ctb, prev_tile) = ctb_address_in_tile_scan(prev_sps, prev_pps, prev_slice.segment_address);
    curr_tile <= prev_tile || curr_ctb <= prev_ctb
}

/// Whether a non-VCL NALU ends the access unit holding the previous VCL
/// NALU, per 7.4.2.4.4.
pub fn find_au_delimit_by_nalu_type(nalu_type: u8, prev_nalu_type: u8) -> bool {
    if prev_nalu_type <= NALU_TYPE_RSV_VCL31 {
        (NALU_TYPE_VPS..=NALU_TYPE_AUD).contains(&nalu_type)
            || nalu_type == NALU_TYPE_PREFIX_SEI
            || (NALU_TYPE_RSV_NVCL41..=NALU_TYPE_RSV_NVCL44).contains(&nalu_type)
            || (NALU_TYPE_UNSPEC48..=NALU_TYPE_UNSPEC55).contains(&nalu_type)
    } else if prev_nalu_type == NALU_TYPE_EOS {
        // An end of sequence NAL unit is last in its AU unless an end of
        // bitstream follows.
        nalu_type != NALU_TYPE_EOB
    } else {
        // An end of bitstream NAL unit is always last.
        prev_nalu_type == NALU_TYPE_EOB
    }
}

/// Test-stream builders shared with the importer tests.
#[cfg(test)]
pub(crate) mod test_streams {
    pub(crate) struct BitSink(pub Vec<bool>);

    impl BitSink {
        pub(crate) fn new() -> BitSink {
            BitSink(Vec::new())
        }

        pub(crate) fn push(&mut self, v: u64, n: u8) {
            for i in (0..n).rev() {
                self.0.push(v & (1 << i) != 0);
            }
        }

        pub(crate) fn ue(&mut self, v: u64) {
            let code_num = v + 1;
            let bits = 64 - code_num.leading_zeros() as u8;
            self.push(0, bits - 1);
            self.push(code_num, bits);
        }

        /// rbsp_trailing_bits() and byte packing.
        pub(crate) fn finish(mut self) -> Vec<u8> {
            self.push(1, 1);
            let mut bytes = vec![0u8; (self.0.len() + 7) / 8];
            for (i, b) in self.0.iter().enumerate() {
                if *b {
                    bytes[i / 8] |= 1 << (7 - i % 8);
                }
            }
            bytes
        }
    }

    fn profile_tier_level(s: &mut BitSink) {
        s.push(0, 2); // general_profile_space
        s.push(0, 1); // general_tier_flag
        s.push(1, 5); // general_profile_idc: Main
        s.push(0x6000_0000, 32); // general_profile_compatibility_flags
        s.push(1, 1); // general_progressive_source_flag
        s.push(0, 1); // general_interlaced_source_flag
        s.push(0, 1); // general_non_packed_constraint_flag
        s.push(1, 1); // general_frame_only_constraint_flag
        s.push(0, 44); // general_reserved_zero_44bits
        s.push(93, 8); // general_level_idc: 3.1
    }

    /// A single-layer VPS payload (NAL header excluded).
    pub(crate) fn vps_payload() -> Vec<u8> {
        let mut s = BitSink::new();
        s.push(0, 4); // vps_video_parameter_set_id
        s.push(3, 2); // vps_reserved_three_2bits
        s.push(0, 6); // vps_max_layers_minus1
        s.push(0, 3); // vps_max_sub_layers_minus1
        s.push(1, 1); // vps_temporal_id_nesting_flag
        s.push(0xFFFF, 16); // vps_reserved_0xffff_16bits
        profile_tier_level(&mut s);
        s.push(1, 1); // vps_sub_layer_ordering_info_present_flag
        s.ue(3); // vps_max_dec_pic_buffering_minus1[0]
        s.ue(0); // vps_max_num_reorder_pics[0]
        s.ue(0); // vps_max_latency_increase_plus1[0]
        s.push(0, 6); // vps_max_layer_id
        s.ue(0); // vps_num_layer_sets_minus1
        s.push(0, 1); // vps_timing_info_present_flag
        s.push(0, 1); // vps_extension_flag
        s.finish()
    }

    /// A 1280x720 8-bit 4:2:0 SPS payload (NAL header excluded).
    pub(crate) fn sps_payload() -> Vec<u8> {
        sps_payload_with(1280, 720)
    }

    pub(crate) fn sps_payload_with(width: u64, height: u64) -> Vec<u8> {
        let mut s = BitSink::new();
        s.push(0, 4); // sps_video_parameter_set_id
        s.push(0, 3); // sps_max_sub_layers_minus1
        s.push(1, 1); // sps_temporal_id_nesting_flag
        profile_tier_level(&mut s);
        s.ue(0); // sps_seq_parameter_set_id
        s.ue(1); // chroma_format_idc
        s.ue(width); // pic_width_in_luma_samples
        s.ue(height); // pic_height_in_luma_samples
        s.push(0, 1); // conformance_window_flag
        s.ue(0); // bit_depth_luma_minus8
        s.ue(0); // bit_depth_chroma_minus8
        s.ue(4); // log2_max_pic_order_cnt_lsb_minus4
        s.push(1, 1); // sps_sub_layer_ordering_info_present_flag
        s.ue(3); // sps_max_dec_pic_buffering_minus1[0]
        s.ue(0); // sps_max_num_reorder_pics[0]
        s.ue(0); // sps_max_latency_increase_plus1[0]
        s.ue(0); // log2_min_luma_coding_block_size_minus3
        s.ue(3); // log2_diff_max_min_luma_coding_block_size
        s.ue(0); // log2_min_transform_block_size_minus2
        s.ue(3); // log2_diff_max_min_transform_block_size
        s.ue(0); // max_transform_hierarchy_depth_inter
        s.ue(0); // max_transform_hierarchy_depth_intra
        s.push(0, 1); // scaling_list_enabled_flag
        s.push(0, 1); // amp_enabled_flag
        s.push(0, 1); // sample_adaptive_offset_enabled_flag
        s.push(0, 1); // pcm_enabled_flag
        s.ue(0); // num_short_term_ref_pic_sets
        s.push(0, 1); // long_term_ref_pics_present_flag
        s.push(0, 1); // sps_temporal_mvp_enabled_flag
        s.push(0, 1); // strong_intra_smoothing_enabled_flag
        s.push(0, 1); // vui_parameters_present_flag
        s.push(0, 1); // sps_extension_flag
        s.finish()
    }

    /// A tiles-off PPS payload (NAL header excluded).
    pub(crate) fn pps_payload() -> Vec<u8> {
        let mut s = BitSink::new();
        s.ue(0); // pps_pic_parameter_set_id
        s.ue(0); // pps_seq_parameter_set_id
        s.push(0, 1); // dependent_slice_segments_enabled_flag
        s.push(0, 1); // output_flag_present_flag
        s.push(0, 3); // num_extra_slice_header_bits
        s.push(0, 1); // sign_data_hiding_enabled_flag
        s.push(0, 1); // cabac_init_present_flag
        s.ue(0); // num_ref_idx_l0_default_active_minus1
        s.ue(0); // num_ref_idx_l1_default_active_minus1
        s.push(0b100, 3); // init_qp_minus26 se(0) + constrained/transform_skip
        s.push(0, 1); // cu_qp_delta_enabled_flag
        s.push(0b11, 2); // pps_cb_qp_offset, pps_cr_qp_offset: se(0), se(0)
        s.push(0, 1); // pps_slice_chroma_qp_offsets_present_flag
        s.push(0, 1); // weighted_pred_flag
        s.push(0, 1); // weighted_bipred_flag
        s.push(0, 1); // transquant_bypass_enabled_flag
        s.push(0, 1); // tiles_enabled_flag
        s.push(0, 1); // entropy_coding_sync_enabled_flag
        s.push(0, 1); // pps_loop_filter_across_slices_enabled_flag
        s.push(0, 1); // deblocking_filter_control_present_flag
        s.push(0, 1); // pps_scaling_list_data_present_flag
        s.push(0, 1); // lists_modification_present_flag
        s.ue(0); // log2_parallel_merge_level_minus2
        s.push(0, 1); // slice_segment_header_extension_present_flag
        s.push(0, 1); // pps_extension_flag
        s.finish()
    }

    pub(crate) fn nal(nal_unit_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut n = vec![nal_unit_type << 1, 0x01];
        n.extend_from_slice(payload);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::test_streams::{nal, pps_payload, sps_payload, sps_payload_with, vps_payload};
    use super::*;

    #[test]
    fn parses_built_sps() {
        let sps = parse_sps_minimally(&sps_payload()).unwrap();
        assert_eq!(sps.seq_parameter_set_id, 0);
        assert_eq!(sps.chroma_format_idc, 1);
        assert_eq!(sps.cropped_width, 1280);
        assert_eq!(sps.cropped_height, 720);
        assert_eq!(sps.log2_max_pic_order_cnt_lsb, 8);
        assert_eq!(sps.ptl.general.profile_idc, 1);
        assert_eq!(sps.ptl.general.level_idc, 93);
        // 1280x720 at 64x64 CTBs.
        assert_eq!(sps.pic_width_in_ctbs, 20);
        assert_eq!(sps.pic_height_in_ctbs, 12);
    }

    #[test]
    fn ps_identifiers() {
        assert_eq!(get_vps_id(&vps_payload()).unwrap(), 0);
        assert_eq!(get_sps_id(&sps_payload()).unwrap(), 0);
        assert_eq!(get_pps_id(&pps_payload()).unwrap(), 0);
    }

    #[test]
    fn hvcc_serializes_all_arrays() {
        let mut hvcc = HevcConfigurationRecord::default();
        hvcc.append_parameter_set(DcrNaluType::Vps, &nal(NALU_TYPE_VPS, &vps_payload()))
            .unwrap();
        hvcc.append_parameter_set(DcrNaluType::Sps, &nal(NALU_TYPE_SPS, &sps_payload()))
            .unwrap();
        hvcc.append_parameter_set(DcrNaluType::Pps, &nal(NALU_TYPE_PPS, &pps_payload()))
            .unwrap();
        let b = hvcc.serialize().unwrap();
        assert_eq!(&b[4..8], b"hvcC");
        assert_eq!(b[8], 1); // configurationVersion
        assert_eq!(b[9] & 0x1f, 1); // general_profile_idc: Main
        assert_eq!(b[20], 93); // general_level_idc
        assert_eq!(b[21] & 0xF0, 0xF0); // min_spatial_segmentation sentinel
        assert_eq!(b[23], 0xFD); // parallelismType 1 | 0xFC
        assert_eq!(b[30], 3); // numOfArrays: VPS, SPS, PPS
        assert_eq!(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize, b.len());
    }

    #[test]
    fn conflicting_sps_forces_new_record() {
        let mut hvcc = HevcConfigurationRecord::default();
        hvcc.append_parameter_set(DcrNaluType::Sps, &nal(NALU_TYPE_SPS, &sps_payload()))
            .unwrap();
        let same = nal(NALU_TYPE_SPS, &sps_payload());
        assert_eq!(
            hvcc.check_appendable(DcrNaluType::Sps, &same).unwrap(),
            Appendable::Duplicated
        );
        // Same identifier, different form.
        let altered = nal(NALU_TYPE_SPS, &sps_payload_with(1920, 1080));
        assert_eq!(
            hvcc.check_appendable(DcrNaluType::Sps, &altered).unwrap(),
            Appendable::NewDcrRequired
        );
    }

    #[test]
    fn nalu_type_delimits() {
        // A VPS after a VCL NALU starts a new AU.
        assert!(find_au_delimit_by_nalu_type(NALU_TYPE_VPS, NALU_TYPE_TRAIL_N));
        // A suffix SEI doesn't.
        assert!(!find_au_delimit_by_nalu_type(
            NALU_TYPE_SUFFIX_SEI,
            NALU_TYPE_TRAIL_N
        ));
        // After EOS, everything but EOB starts a new AU.
        assert!(find_au_delimit_by_nalu_type(NALU_TYPE_TRAIL_N, NALU_TYPE_EOS));
        assert!(!find_au_delimit_by_nalu_type(NALU_TYPE_EOB, NALU_TYPE_EOS));
        assert!(find_au_delimit_by_nalu_type(NALU_TYPE_TRAIL_N, NALU_TYPE_EOB));
    }
}
