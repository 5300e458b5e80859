//! H.265/HEVC Annex B importer.
//!
//! Shares its shape with the H.264 importer: a whole-stream analysis
//! pass for POCs and configuration snapshots, then a rewound delivery
//! pass producing length-prefixed access units.

use bytes::Bytes;
use failure::{bail, format_err, Error};
use log::debug;

use super::nalu::{
    deduplicate_poc, generate_timestamps_from_poc, reduce_timescale, MediaTimestamp, PicTiming,
};
use super::{Leading, RaFlags, Sample, SampleProperty, Status};
use crate::codec::hevc::{
    self, DcrNaluType, HevcConfigurationRecord, HevcParser, PictureInfo, ScanOutcome,
};
use crate::codec::nalu::{self, SHORT_START_CODE_LENGTH};
use crate::stream::ByteStream;
use crate::summary::{CodecSpecific, ColorInfo, FourCc, Summary, VideoSummary};

#[derive(Default)]
struct AccessUnit {
    data: Vec<u8>,
    incomplete_data: Vec<u8>,
    length: u32,
    incomplete_length: u32,
    number: u32,
    temporal_id: u8,
    picture: PictureInfo,
}

impl AccessUnit {
    fn start_new(&mut self) {
        self.length = 0;
        self.picture.picture_type = hevc::PictureType::None;
        self.picture.random_accessible = false;
        self.picture.recovery_poc_cnt = 0;
    }

    fn append_nalu(&mut self, nalu: &[u8], probe: bool) {
        if !probe {
            self.incomplete_data
                .extend_from_slice(&(nalu.len() as u32).to_be_bytes());
            self.incomplete_data.extend_from_slice(nalu);
        }
        self.incomplete_length += (nalu::NALU_LENGTH_SIZE + nalu.len()) as u32;
    }

    fn complete(&mut self, probe: bool) -> bool {
        if !self.picture.has_primary || self.incomplete_length == 0 {
            return false;
        }
        if !probe {
            self.data = std::mem::replace(&mut self.incomplete_data, Vec::new());
        }
        self.temporal_id = self.picture.temporal_id;
        self.length = self.incomplete_length;
        self.incomplete_length = 0;
        self.picture.has_primary = false;
        true
    }
}

pub(crate) struct HevcImporter {
    status: Status,
    parser: HevcParser,
    hvcc_list: Vec<HevcConfigurationRecord>,
    hvcc_number: usize,
    ts: Vec<MediaTimestamp>,
    last_delta: u32,
    timescale: u32,
    max_au_length: u32,
    num_undecodable: u32,
    max_temporal_id: u8,
    composition_reordering_present: bool,
    field_pic_present: bool,
    last_intra_cts: u64,
    sc_head_pos: u64,
    au: AccessUnit,
}

impl HevcImporter {
    fn end_status(&mut self, bs: &mut ByteStream) {
        if bs.is_end(0) && self.au.incomplete_length == 0 {
            self.status = Status::Eof;
        } else if self.status != Status::Change {
            self.status = Status::Ok;
        }
    }

    fn get_access_unit_internal(&mut self, bs: &mut ByteStream, probe: bool) -> Result<(), Error> {
        let mut complete_au = false;
        self.au.start_new();
        loop {
            let (header, nalu_length, start_code_length, trailing_zero_bytes) =
                match hevc::find_next_start_code(bs) {
                    ScanOutcome::Nalu {
                        header,
                        nalu_length,
                        start_code_length,
                        trailing_zero_bytes,
                    } => (header, nalu_length, start_code_length, trailing_zero_bytes),
                    ScanOutcome::NoStartCode => {
                        // The last NALU was already appended and parsed.
                        let slice = self.parser.slice;
                        self.parser.update_picture_info(&mut self.au.picture, &slice);
                        complete_au = self.au.complete(probe);
                        self.end_status(bs);
                        if complete_au {
                            self.au.number += 1;
                            return Ok(());
                        }
                        bail!("no start code at the current position");
                    }
                };
            let nalu_type = header.nal_unit_type;
            let next_sc_head_pos =
                self.sc_head_pos + start_code_length as u64 + nalu_length + trailing_zero_bytes;
            // Track the end of sequence for POC resets.
            self.parser.eos |= self.parser.prev_nalu_type == hevc::NALU_TYPE_EOS
                || self.parser.prev_nalu_type == hevc::NALU_TYPE_EOB;
            if nalu_type == hevc::NALU_TYPE_FD {
                if self.parser.sps.vui.hrd.present {
                    self.end_status(bs);
                    bail!("filler data with HRD present");
                }
            } else if nalu_type <= hevc::NALU_TYPE_RASL_R
                || (hevc::NALU_TYPE_BLA_W_LP..=hevc::NALU_TYPE_CRA).contains(&nalu_type)
                || (hevc::NALU_TYPE_VPS..=hevc::NALU_TYPE_SUFFIX_SEI).contains(&nalu_type)
            {
                let total = start_code_length + nalu_length as usize;
                let nalu = bs.buffered()[start_code_length..total].to_vec();
                if nalu_type <= hevc::NALU_TYPE_RSV_VCL31 {
                    // VCL NALU (slice segment).
                    let prev_slice = self.parser.slice;
                    if let Err(e) = self
                        .parser
                        .parse_slice_segment_header(&header, &nalu[header.length..])
                    {
                        self.end_status(bs);
                        return Err(e);
                    }
                    if probe && self.parser.hvcc_pending {
                        self.hvcc_list.push(self.parser.hvcc.clone());
                    }
                    self.parser.move_pending_hvcc()?;
                    if prev_slice.present {
                        if hevc::find_au_delimit_by_slice_info(
                            &self.parser,
                            &self.parser.slice,
                            &prev_slice,
                        ) {
                            self.parser.update_picture_info(&mut self.au.picture, &prev_slice);
                            complete_au = self.au.complete(probe);
                        } else {
                            self.parser
                                .update_picture_info_for_slice(&mut self.au.picture, &prev_slice);
                        }
                    }
                    self.au.append_nalu(&nalu, probe);
                    self.parser.slice.present = true;
                } else {
                    if hevc::find_au_delimit_by_nalu_type(nalu_type, self.parser.prev_nalu_type) {
                        let slice = self.parser.slice;
                        self.parser.update_picture_info(&mut self.au.picture, &slice);
                        complete_au = self.au.complete(probe);
                    }
                    match nalu_type {
                        hevc::NALU_TYPE_PREFIX_SEI | hevc::NALU_TYPE_SUFFIX_SEI => {
                            if let Err(e) = self.parser.parse_sei(&header, &nalu[header.length..]) {
                                self.end_status(bs);
                                return Err(e);
                            }
                            self.au.append_nalu(&nalu, probe);
                        }
                        hevc::NALU_TYPE_VPS => {
                            self.parser.try_to_append_dcr_nalu(DcrNaluType::Vps, &nalu)?;
                        }
                        hevc::NALU_TYPE_SPS => {
                            self.parser.try_to_append_dcr_nalu(DcrNaluType::Sps, &nalu)?;
                        }
                        hevc::NALU_TYPE_PPS => {
                            self.parser.try_to_append_dcr_nalu(DcrNaluType::Pps, &nalu)?;
                        }
                        hevc::NALU_TYPE_AUD => {} // dropped from the output
                        _ => self.au.append_nalu(&nalu, probe),
                    }
                    if self.parser.hvcc_pending {
                        self.status = Status::Change;
                    }
                }
            }
            self.parser.prev_nalu_type = nalu_type;
            bs.read_seek_set(next_sc_head_pos)?;
            if !bs.is_end(SHORT_START_CODE_LENGTH) {
                self.sc_head_pos = next_sc_head_pos;
            } else if self.au.incomplete_length > 0 && self.au.length == 0 {
                let slice = self.parser.slice;
                self.parser.update_picture_info(&mut self.au.picture, &slice);
                self.au.complete(probe);
                self.end_status(bs);
                self.au.number += 1;
                return Ok(());
            }
            if complete_au {
                self.end_status(bs);
                self.au.number += 1;
                return Ok(());
            }
        }
    }

    fn analyze_whole_stream(&mut self, bs: &mut ByteStream) -> Result<(), Error> {
        let mut npt: Vec<PicTiming> = Vec::new();
        self.status = Status::Ok;
        debug!("analyzing stream as HEVC");
        while self.status != Status::Eof {
            let prev_picture = self.au.picture;
            self.get_access_unit_internal(bs, true)?;
            self.parser
                .calculate_poc(&mut self.au.picture, &prev_picture)?;
            let picture = &self.au.picture;
            self.field_pic_present |= picture.field_coded;
            npt.push(PicTiming {
                poc: i64::from(picture.poc),
                delta: picture.delta,
                poc_delta: 1,
                reset: false,
            });
            self.max_au_length = self.max_au_length.max(self.au.length);
            self.max_temporal_id = self.max_temporal_id.max(self.au.temporal_id);
        }
        self.hvcc_list.push(self.parser.hvcc.clone());
        for pt in &npt {
            if pt.poc == 0 {
                break;
            }
            self.num_undecodable += 1;
        }
        let mut max_composition_delay = 0;
        deduplicate_poc(&mut npt, &mut max_composition_delay, 15);
        let (ts, reordering, mut last_delta) =
            generate_timestamps_from_poc(&npt, max_composition_delay);
        self.composition_reordering_present = reordering;
        // Picture timing is field-level; time_scale is usually set per
        // frame, so double it before reducing the timebase.
        let mut timescale = self.parser.sps.vui.time_scale.saturating_mul(2);
        let mut ts = ts;
        reduce_timescale(&mut ts, &npt, &mut last_delta, &mut timescale);
        self.ts = ts;
        self.last_delta = last_delta;
        self.timescale = timescale;
        Ok(())
    }

    fn create_summary(&self, record: &HevcConfigurationRecord) -> Result<Summary, Error> {
        let sps = &self.parser.sps;
        Ok(Summary::Video(VideoSummary {
            sample_type: FourCc(*b"hvc1"),
            max_au_length: self.max_au_length,
            timescale: self.timescale,
            timebase: sps.vui.num_units_in_tick,
            vfr: record.constant_frame_rate == 0,
            sample_per_field: self.field_pic_present,
            width: sps.cropped_width,
            height: sps.cropped_height,
            par: (u32::from(sps.vui.sar_width), u32::from(sps.vui.sar_height)),
            color: ColorInfo {
                // 2 is "unspecified"; leave such entries unset.
                primaries_index: if sps.vui.colour_primaries != 2 {
                    sps.vui.colour_primaries
                } else {
                    0
                },
                transfer_index: if sps.vui.transfer_characteristics != 2 {
                    sps.vui.transfer_characteristics
                } else {
                    0
                },
                matrix_index: if sps.vui.matrix_coeffs != 2 {
                    sps.vui.matrix_coeffs
                } else {
                    0
                },
                full_range: sps.vui.video_full_range_flag,
            },
            codec_specific: vec![CodecSpecific::Unstructured(record.serialize()?)],
        }))
    }
}

pub(crate) fn probe(bs: &mut ByteStream) -> Result<(HevcImporter, Summary), Error> {
    if !bs.is_seekable() {
        bail!("HEVC import requires seekable input");
    }
    let first_sc_head_pos = match nalu::find_first_start_code(bs) {
        Some(pos) => pos,
        None => bail!("no long start code at the head of the stream"),
    };
    let mut imp = HevcImporter {
        status: Status::Ok,
        parser: HevcParser::new(),
        hvcc_list: Vec::new(),
        hvcc_number: 0,
        ts: Vec::new(),
        last_delta: 0,
        timescale: 0,
        max_au_length: 0,
        num_undecodable: 0,
        max_temporal_id: 0,
        composition_reordering_present: false,
        field_pic_present: false,
        last_intra_cts: 0,
        sc_head_pos: first_sc_head_pos,
        au: AccessUnit::default(),
    };
    bs.read_seek_set(first_sc_head_pos)?;
    imp.analyze_whole_stream(bs)?;
    let record = imp
        .hvcc_list
        .get(0)
        .ok_or_else(|| format_err!("no configuration record"))?;
    let summary = imp.create_summary(record)?;
    imp.hvcc_number = 1;
    // Rewind for delivery; parsed parameter sets survive.
    imp.status = Status::Ok;
    bs.read_seek_set(first_sc_head_pos)?;
    imp.sc_head_pos = first_sc_head_pos;
    imp.parser.prev_nalu_type = hevc::NALU_TYPE_UNKNOWN;
    imp.au = AccessUnit::default();
    imp.parser.slice = Default::default();
    imp.parser.vps = Default::default();
    imp.parser.sps = Default::default();
    imp.parser.pps = Default::default();
    imp.parser.sei = Default::default();
    imp.parser.hvcc = Default::default();
    imp.parser.hvcc_next = Default::default();
    imp.parser.hvcc_pending = false;
    imp.parser.eos = true;
    Ok((imp, summary))
}

impl HevcImporter {
    pub(crate) fn get_access_unit(
        &mut self,
        bs: &mut ByteStream,
        summary: &mut Summary,
    ) -> Result<Option<Sample>, Error> {
        let mut current_status = self.status;
        match current_status {
            Status::Error => bail!("HEVC importer in error state"),
            Status::Eof => return Ok(None),
            _ => {}
        }
        if let Err(e) = self.get_access_unit_internal(bs, false) {
            self.status = Status::Error;
            return Err(e);
        }
        if self.status == Status::Change && !self.parser.hvcc_pending {
            current_status = Status::Change;
        }
        let mut summary_changed = false;
        if current_status == Status::Change {
            let record = self
                .hvcc_list
                .get(self.hvcc_number)
                .ok_or_else(|| format_err!("ran out of configuration records"))?
                .clone();
            self.hvcc_number += 1;
            *summary = self.create_summary(&record)?;
            summary_changed = true;
            self.status = Status::Ok;
        }
        let picture = &self.au.picture;
        let idx = self.au.number as usize - 1;
        let ts = self
            .ts
            .get(idx)
            .ok_or_else(|| format_err!("access unit beyond the analyzed stream"))?;
        let mut prop = SampleProperty::default();
        // Sub-layer non-reference pictures of the highest sub-layer are
        // referenced by nothing afterwards.
        prop.disposable =
            Some(picture.sublayer_nonref && self.au.temporal_id == self.max_temporal_id);
        prop.leading = if picture.radl || picture.rasl {
            if picture.radl {
                Leading::Decodable
            } else {
                Leading::Undecodable
            }
        } else if self.au.number < self.num_undecodable {
            Leading::Undecodable
        } else if picture.independent || ts.cts >= self.last_intra_cts {
            Leading::NotLeading
        } else {
            Leading::Undecodable
        };
        if picture.independent {
            self.last_intra_cts = ts.cts;
        }
        if self.composition_reordering_present && prop.disposable != Some(true) && !picture.irap {
            prop.allow_earlier_pts = true;
        }
        prop.independent = Some(picture.independent);
        prop.has_redundancy = Some(false);
        prop.post_roll.identifier = picture.poc as u32;
        if picture.random_accessible {
            if picture.irap {
                prop.ra_flags = RaFlags::SYNC;
                prop.ra_flags |= if picture.closed_rap {
                    RaFlags::CLOSED_RAP
                } else {
                    RaFlags::RAP
                };
            } else if picture.recovery_poc_cnt != 0 {
                prop.ra_flags = RaFlags::POST_ROLL_START;
                prop.post_roll.complete = (picture.poc + picture.recovery_poc_cnt) as u32;
            } else {
                prop.ra_flags = RaFlags::RAP;
            }
        }
        let data = Bytes::from(std::mem::replace(&mut self.au.data, Vec::new()));
        Ok(Some(Sample {
            data,
            dts: ts.dts,
            cts: ts.cts,
            prop,
            summary_changed,
        }))
    }

    pub(crate) fn last_delta(&self, _summary: &Summary) -> u32 {
        if self.status != Status::Eof {
            return 0;
        }
        if self.ts.is_empty() {
            u32::MAX // arbitrary
        } else {
            self.last_delta
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::codec::hevc::test_streams::{
        nal, pps_payload, sps_payload, vps_payload, BitSink,
    };
    use crate::codec::hevc::{
        NALU_TYPE_CRA, NALU_TYPE_IDR_W_RADL, NALU_TYPE_PPS, NALU_TYPE_RASL_N, NALU_TYPE_SPS,
        NALU_TYPE_TRAIL_R, NALU_TYPE_VPS,
    };
    use crate::import::{Importer, Leading, RaFlags};
    use crate::summary::Summary;
    use std::io::Cursor;

    /// An independent slice segment with the given POC lsb (8 bits).
    /// Non-IRAP slice types carry an inline empty short-term RPS.
    fn slice_nal(nalu_type: u8, poc_lsb: u8, slice_type: u64) -> Vec<u8> {
        let mut s = BitSink::new();
        s.push(1, 1); // first_slice_segment_in_pic_flag
        if (16..=23).contains(&nalu_type) {
            s.push(0, 1); // no_output_of_prior_pics_flag
        }
        s.ue(0); // slice_pic_parameter_set_id
        s.ue(slice_type); // slice_type
        if nalu_type != NALU_TYPE_IDR_W_RADL && nalu_type != 20 {
            s.push(u64::from(poc_lsb), 8); // slice_pic_order_cnt_lsb
            s.push(0, 1); // short_term_ref_pic_set_sps_flag
            s.ue(0); // num_negative_pics
            s.ue(0); // num_positive_pics
        }
        s.push(1, 1); // stand-in slice data
        nal(nalu_type, &s.finish())
    }

    fn annexb(nals: &[Vec<u8>]) -> Vec<u8> {
        let mut stream = Vec::new();
        for nal in nals {
            stream.extend_from_slice(&[0, 0, 0, 1]);
            stream.extend_from_slice(nal);
        }
        stream
    }

    fn parameter_sets() -> Vec<Vec<u8>> {
        vec![
            nal(NALU_TYPE_VPS, &vps_payload()),
            nal(NALU_TYPE_SPS, &sps_payload()),
            nal(NALU_TYPE_PPS, &pps_payload()),
        ]
    }

    #[test]
    fn idr_only_stream() {
        let mut nals = parameter_sets();
        nals.push(slice_nal(NALU_TYPE_IDR_W_RADL, 0, 2));
        let mut imp = Importer::open(Cursor::new(annexb(&nals)), "hevc").unwrap();
        match imp.summary(1).unwrap() {
            Summary::Video(v) => {
                assert_eq!(v.width, 1280);
                assert_eq!(v.height, 720);
                assert_eq!(v.sample_type.0, *b"hvc1");
                let hvcc = match &v.codec_specific[0] {
                    crate::summary::CodecSpecific::Unstructured(b) => b.clone(),
                    _ => panic!("expected serialized hvcC"),
                };
                assert_eq!(&hvcc[4..8], b"hvcC");
            }
            _ => panic!("expected video summary"),
        }
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.dts, 0);
        assert!(s.prop.ra_flags.contains(RaFlags::SYNC));
        assert!(s.prop.ra_flags.contains(RaFlags::CLOSED_RAP));
        assert!(imp.get_access_unit(1).unwrap().is_none());
    }

    #[test]
    fn cra_with_leading_rasl() {
        let mut nals = parameter_sets();
        // The CRA at POC 0; its RASL companions compose before it (their
        // poc_lsb values wrap negative against the CRA's anchors).
        nals.push(slice_nal(NALU_TYPE_CRA, 0, 2));
        nals.push(slice_nal(NALU_TYPE_RASL_N, 254, 0));
        nals.push(slice_nal(NALU_TYPE_RASL_N, 255, 0));
        nals.push(slice_nal(NALU_TYPE_TRAIL_R, 2, 1));
        nals.push(slice_nal(NALU_TYPE_TRAIL_R, 4, 1));
        let mut imp = Importer::open(Cursor::new(annexb(&nals)), "hevc").unwrap();
        let cra = imp.get_access_unit(1).unwrap().unwrap();
        assert!(cra.prop.ra_flags.contains(RaFlags::SYNC));
        assert!(cra.prop.ra_flags.contains(RaFlags::RAP));
        assert!(!cra.prop.ra_flags.contains(RaFlags::CLOSED_RAP));
        let mut undecodable_leading = 0;
        loop {
            let s = match imp.get_access_unit(1).unwrap() {
                Some(s) => s,
                None => break,
            };
            if s.prop.leading == Leading::Undecodable {
                undecodable_leading += 1;
            }
            assert!(s.dts <= s.cts);
        }
        assert_eq!(undecodable_leading, 2);
    }

    #[test]
    fn monotone_dts() {
        let mut nals = parameter_sets();
        nals.push(slice_nal(NALU_TYPE_IDR_W_RADL, 0, 2));
        nals.push(slice_nal(NALU_TYPE_TRAIL_R, 2, 1));
        nals.push(slice_nal(NALU_TYPE_TRAIL_R, 4, 1));
        let mut imp = Importer::open(Cursor::new(annexb(&nals)), "hevc").unwrap();
        let mut prev_dts = None;
        while let Some(s) = imp.get_access_unit(1).unwrap() {
            if let Some(prev) = prev_dts {
                assert!(s.dts > prev);
            }
            prev_dts = Some(s.dts);
        }
        assert!(imp.last_delta(1) > 0);
    }
}
