//! H.264 Annex B importer.
//!
//! The probe makes a full analysis pass over the stream: assembling
//! access units, reconstructing picture order counts, and snapshotting
//! every decoder configuration the stream transitions through. It then
//! rewinds and replays, delivering length-prefixed access units against
//! the timestamp table the analysis produced.

use bytes::Bytes;
use failure::{bail, format_err, Error};
use log::debug;

use super::nalu::{
    deduplicate_poc, generate_timestamps_from_poc, reduce_timescale, MediaTimestamp, PicTiming,
};
use super::{Leading, RaFlags, Sample, SampleProperty, Status};
use crate::codec::h264::{
    self, AvcConfigurationRecord, H264Parser, ParameterSetType, PictureInfo, ScanOutcome,
};
use crate::codec::nalu::{self, SHORT_START_CODE_LENGTH};
use crate::stream::ByteStream;
use crate::summary::{CodecSpecific, ColorInfo, FourCc, Summary, VideoSummary};

#[derive(Default)]
struct AccessUnit {
    /// The complete AU, as length-prefixed NALUs.
    data: Vec<u8>,
    incomplete_data: Vec<u8>,
    length: u32,
    incomplete_length: u32,
    number: u32,
    picture: PictureInfo,
}

impl AccessUnit {
    fn start_new(&mut self) {
        self.length = 0;
        self.picture.picture_type = h264::PictureType::None;
        self.picture.random_accessible = false;
        self.picture.recovery_frame_cnt = 0;
        self.picture.has_mmco5 = false;
        self.picture.has_redundancy = false;
        self.picture.broken_link_flag = false;
    }

    fn append_nalu(&mut self, nalu: &[u8], probe: bool) {
        if !probe {
            self.incomplete_data
                .extend_from_slice(&(nalu.len() as u32).to_be_bytes());
            self.incomplete_data.extend_from_slice(nalu);
        }
        self.incomplete_length += (nalu::NALU_LENGTH_SIZE + nalu.len()) as u32;
    }

    /// Promotes the incomplete AU to deliverable if it holds a primary
    /// coded picture.
    fn complete(&mut self, probe: bool) -> bool {
        if !self.picture.has_primary || self.incomplete_length == 0 {
            return false;
        }
        if !probe {
            self.data = std::mem::replace(&mut self.incomplete_data, Vec::new());
        }
        self.length = self.incomplete_length;
        self.incomplete_length = 0;
        self.picture.has_primary = false;
        true
    }
}

pub(crate) struct H264Importer {
    status: Status,
    parser: H264Parser,
    /// Snapshots of each configuration record the stream ran through, in
    /// activation order.
    avcc_list: Vec<AvcConfigurationRecord>,
    avcc_number: usize,
    ts: Vec<MediaTimestamp>,
    last_delta: u32,
    timescale: u32,
    max_au_length: u32,
    num_undecodable: u32,
    composition_reordering_present: bool,
    field_pic_present: bool,
    last_intra_cts: u64,
    sc_head_pos: u64,
    au: AccessUnit,
}

impl H264Importer {
    fn end_status(&mut self, bs: &mut ByteStream) {
        if bs.is_end(0) && self.au.incomplete_length == 0 {
            self.status = Status::Eof;
        } else if self.status != Status::Change {
            self.status = Status::Ok;
        }
    }

    /// Assembles the next access unit. In probe mode only lengths and
    /// picture state are tracked, not payload bytes.
    fn get_access_unit_internal(&mut self, bs: &mut ByteStream, probe: bool) -> Result<(), Error> {
        let mut complete_au = false;
        self.au.start_new();
        loop {
            let (header, nalu_length, start_code_length, trailing_zero_bytes) =
                match h264::find_next_start_code(bs) {
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
            if nalu_type == h264::NALU_TYPE_FD {
                // Filler coexisting with HRD timing is unsupported;
                // otherwise elemental streams simply may not carry it, so
                // it is dropped.
                if self.parser.sps.vui.hrd.present {
                    self.end_status(bs);
                    bail!("filler data with HRD present");
                }
            } else if (h264::NALU_TYPE_SLICE_N_IDR..=h264::NALU_TYPE_SPS_EXT).contains(&nalu_type)
                || nalu_type == h264::NALU_TYPE_SLICE_AUX
            {
                let total = start_code_length + nalu_length as usize;
                let nalu = bs.buffered()[start_code_length..total].to_vec();
                if (h264::NALU_TYPE_SLICE_N_IDR..=h264::NALU_TYPE_SLICE_IDR).contains(&nalu_type) {
                    // VCL NALU (slice).
                    let prev_slice = self.parser.slice;
                    if let Err(e) = self.parser.parse_slice(&header, &nalu[header.length..]) {
                        self.end_status(bs);
                        return Err(e);
                    }
                    if probe && self.parser.avcc_pending {
                        // The retiring configuration becomes one summary.
                        self.avcc_list.push(self.parser.avcc.clone());
                    }
                    self.parser.move_pending_avcc()?;
                    if prev_slice.present {
                        if h264::find_au_delimit_by_slice_info(&self.parser.slice, &prev_slice) {
                            // The new slice starts the primary coded
                            // picture of a new AU; the previous slice
                            // finishes this one.
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
                    if h264::find_au_delimit_by_nalu_type(nalu_type, self.parser.prev_nalu_type) {
                        // The last slice belongs to the AU in progress.
                        let slice = self.parser.slice;
                        self.parser.update_picture_info(&mut self.au.picture, &slice);
                        complete_au = self.au.complete(probe);
                    }
                    match nalu_type {
                        h264::NALU_TYPE_SEI => {
                            if let Err(e) = self.parser.parse_sei(&nalu[header.length..]) {
                                self.end_status(bs);
                                return Err(e);
                            }
                            self.au.append_nalu(&nalu, probe);
                        }
                        h264::NALU_TYPE_SPS => {
                            self.parser
                                .try_to_append_parameter_set(ParameterSetType::Sps, &nalu)?;
                        }
                        h264::NALU_TYPE_PPS => {
                            self.parser
                                .try_to_append_parameter_set(ParameterSetType::Pps, &nalu)?;
                        }
                        h264::NALU_TYPE_AUD => {} // dropped from the output
                        h264::NALU_TYPE_SPS_EXT => {
                            self.parser
                                .try_to_append_parameter_set(ParameterSetType::SpsExt, &nalu)?;
                        }
                        _ => self.au.append_nalu(&nalu, probe),
                    }
                    if self.parser.avcc_pending {
                        self.status = Status::Change;
                    }
                }
            }
            // Move to the first byte of the next start code.
            self.parser.prev_nalu_type = nalu_type;
            bs.read_seek_set(next_sc_head_pos)?;
            if !bs.is_end(SHORT_START_CODE_LENGTH) {
                self.sc_head_pos = next_sc_head_pos;
            } else if self.au.incomplete_length > 0 && self.au.length == 0 {
                // Out of data with a flushed chunk of NALUs: deliver it
                // as the final AU.
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

    /// Pass 1: walk the whole stream, computing POCs and snapshotting
    /// configuration records, then synthesize the timestamp table.
    fn analyze_whole_stream(&mut self, bs: &mut ByteStream) -> Result<(), Error> {
        let mut npt: Vec<PicTiming> = Vec::new();
        self.status = Status::Ok;
        debug!("analyzing stream as H.264");
        while self.status != Status::Eof {
            let prev_picture = self.au.picture;
            self.get_access_unit_internal(bs, true)?;
            self.parser
                .calculate_poc(&mut self.au.picture, &prev_picture)?;
            let picture = &self.au.picture;
            self.field_pic_present |= picture.field_pic_flag;
            npt.push(PicTiming {
                poc: i64::from(picture.pic_order_cnt),
                delta: picture.delta,
                poc_delta: if picture.field_pic_flag { 1 } else { 2 },
                reset: picture.has_mmco5,
            });
            self.max_au_length = self.max_au_length.max(self.au.length);
        }
        // The final configuration record becomes the last summary.
        self.avcc_list.push(self.parser.avcc.clone());
        // Count undecodable leading samples.
        for pt in &npt {
            if pt.poc == 0 {
                break;
            }
            self.num_undecodable += 1;
        }
        let mut max_composition_delay = 0;
        deduplicate_poc(&mut npt, &mut max_composition_delay, 32);
        let (ts, reordering, mut last_delta) =
            generate_timestamps_from_poc(&npt, max_composition_delay);
        self.composition_reordering_present = reordering;
        let mut timescale = self.parser.sps.vui.time_scale;
        let mut ts = ts;
        reduce_timescale(&mut ts, &npt, &mut last_delta, &mut timescale);
        self.ts = ts;
        self.last_delta = last_delta;
        self.timescale = timescale;
        Ok(())
    }

    fn create_summary(&self, record: &AvcConfigurationRecord) -> Result<Summary, Error> {
        let sps = &self.parser.sps;
        Ok(Summary::Video(VideoSummary {
            sample_type: FourCc(*b"avc1"),
            max_au_length: self.max_au_length,
            timescale: self.timescale,
            timebase: sps.vui.num_units_in_tick,
            vfr: !sps.vui.fixed_frame_rate_flag,
            sample_per_field: self.field_pic_present,
            width: sps.cropped_width,
            height: sps.cropped_height,
            par: (u32::from(sps.vui.sar_width), u32::from(sps.vui.sar_height)),
            color: ColorInfo {
                primaries_index: sps.vui.colour_primaries,
                transfer_index: sps.vui.transfer_characteristics,
                matrix_index: sps.vui.matrix_coefficients,
                full_range: sps.vui.video_full_range_flag,
            },
            codec_specific: vec![CodecSpecific::Unstructured(record.serialize()?)],
        }))
    }
}

pub(crate) fn probe(bs: &mut ByteStream) -> Result<(H264Importer, Summary), Error> {
    if !bs.is_seekable() {
        // Timestamp synthesis needs a second pass over the stream.
        bail!("H.264 import requires seekable input");
    }
    let first_sc_head_pos = match nalu::find_first_start_code(bs) {
        Some(pos) => pos,
        None => bail!("no long start code at the head of the stream"),
    };
    let mut imp = H264Importer {
        status: Status::Ok,
        parser: H264Parser::new(),
        avcc_list: Vec::new(),
        avcc_number: 0,
        ts: Vec::new(),
        last_delta: 0,
        timescale: 0,
        max_au_length: 0,
        num_undecodable: 0,
        composition_reordering_present: false,
        field_pic_present: false,
        last_intra_cts: 0,
        sc_head_pos: first_sc_head_pos,
        au: AccessUnit::default(),
    };
    bs.read_seek_set(first_sc_head_pos)?;
    imp.analyze_whole_stream(bs)?;
    let record = imp
        .avcc_list
        .get(0)
        .ok_or_else(|| format_err!("no configuration record"))?;
    let summary = imp.create_summary(record)?;
    imp.avcc_number = 1;
    // Rewind and reset for the delivery pass. The parsed parameter sets
    // survive; the active headers and record lists start over.
    imp.status = Status::Ok;
    bs.read_seek_set(first_sc_head_pos)?;
    imp.sc_head_pos = first_sc_head_pos;
    imp.parser.prev_nalu_type = h264::NALU_TYPE_UNSPECIFIED0;
    imp.au = AccessUnit::default();
    imp.parser.slice = Default::default();
    imp.parser.sps = Default::default();
    imp.parser.pps = Default::default();
    imp.parser.sei = Default::default();
    imp.parser.avcc = Default::default();
    imp.parser.avcc_next = Default::default();
    imp.parser.avcc_pending = false;
    Ok((imp, summary))
}

impl H264Importer {
    pub(crate) fn get_access_unit(
        &mut self,
        bs: &mut ByteStream,
        summary: &mut Summary,
    ) -> Result<Option<Sample>, Error> {
        let mut current_status = self.status;
        match current_status {
            Status::Error => bail!("H.264 importer in error state"),
            Status::Eof => return Ok(None),
            _ => {}
        }
        if let Err(e) = self.get_access_unit_internal(bs, false) {
            self.status = Status::Error;
            return Err(e);
        }
        if self.status == Status::Change && !self.parser.avcc_pending {
            current_status = Status::Change;
        }
        let mut summary_changed = false;
        if current_status == Status::Change {
            // Activate the next stored configuration record.
            let record = self
                .avcc_list
                .get(self.avcc_number)
                .ok_or_else(|| format_err!("ran out of configuration records"))?
                .clone();
            self.avcc_number += 1;
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
        prop.leading = if self.au.number < self.num_undecodable {
            Leading::Undecodable
        } else if picture.independent || ts.cts >= self.last_intra_cts {
            Leading::NotLeading
        } else {
            Leading::Undecodable
        };
        if picture.independent {
            self.last_intra_cts = ts.cts;
        }
        if self.composition_reordering_present && !picture.disposable && !picture.idr {
            prop.allow_earlier_pts = true;
        }
        prop.independent = Some(picture.independent);
        prop.disposable = Some(picture.disposable);
        prop.has_redundancy = Some(picture.has_redundancy);
        prop.post_roll.identifier = picture.frame_num;
        if picture.random_accessible {
            if picture.idr {
                prop.ra_flags = RaFlags::SYNC;
            } else if picture.recovery_frame_cnt > 0 {
                prop.ra_flags = RaFlags::POST_ROLL_START;
                prop.post_roll.complete = (picture.frame_num + picture.recovery_frame_cnt)
                    % self.parser.sps.max_frame_num;
            } else {
                prop.ra_flags = RaFlags::RAP;
                if !picture.broken_link_flag {
                    prop.ra_flags |= RaFlags::PARTIAL_SYNC;
                }
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
    use crate::import::{Importer, RaFlags};
    use crate::summary::Summary;
    use std::io::Cursor;

    // Baseline-ish SPS/PPS from a GW Security GW4089IP camera (720x480,
    // pic_order_cnt_type 2) plus hand-built IDR/non-IDR slices.
    const SPS: [u8; 14] = [
        0x67, 0x4d, 0x00, 0x1e, 0x95, 0xa8, 0x2d, 0x0f, 0x69, 0xb8, 0x08, 0x08, 0x08, 0x10,
    ];
    const PPS: [u8; 4] = [0x68, 0xee, 0x3c, 0x80];

    /// An IDR slice: first_mb_in_slice=0, slice_type=7 (I), pps_id=0,
    /// frame_num=0, idr_pic_id=0, dec_ref_pic_marking flags clear, then
    /// stand-in slice data.
    fn idr_slice() -> Vec<u8> {
        vec![0x65, 0x88, 0x80, 0x4F, 0xFF]
    }

    /// A non-IDR P slice referencing PPS 0 with the given frame_num.
    fn p_slice(frame_num: u8) -> Vec<u8> {
        let mut bits: Vec<bool> = Vec::new();
        let mut push = |v: u64, n: u8| {
            for i in (0..n).rev() {
                bits.push(v & (1 << i) != 0);
            }
        };
        push(1, 1); // first_mb_in_slice ue(0)
        push(0b00110, 5); // slice_type ue(5): P
        push(1, 1); // pic_parameter_set_id ue(0)
        push(u64::from(frame_num), 8); // frame_num (log2_max_frame_num = 8)
        push(0, 1); // num_ref_idx_active_override_flag
        push(0, 1); // ref_pic_list_modification_flag_l0
        push(0, 1); // adaptive_ref_pic_marking_mode_flag
        push(1, 1); // stand-in slice data
        let mut payload = vec![0x41]; // nal_ref_idc=2, nal_unit_type=1
        let mut bytes = vec![0u8; (bits.len() + 7) / 8];
        for (i, b) in bits.iter().enumerate() {
            if *b {
                bytes[i / 8] |= 1 << (7 - i % 8);
            }
        }
        payload.extend(bytes);
        payload
    }

    fn annexb(nals: &[&[u8]]) -> Vec<u8> {
        let mut stream = Vec::new();
        for nal in nals {
            stream.extend_from_slice(&[0, 0, 0, 1]);
            stream.extend_from_slice(nal);
        }
        stream
    }

    #[test]
    fn idr_only_stream() {
        let idr = idr_slice();
        let stream = annexb(&[&SPS[..], &PPS[..], &idr[..]]);
        let mut imp = Importer::open(Cursor::new(stream), "h264").unwrap();
        match imp.summary(1).unwrap() {
            Summary::Video(v) => {
                assert_eq!(v.width, 720);
                assert_eq!(v.height, 480);
                assert_eq!(v.sample_type.0, *b"avc1");
                let avcc = match &v.codec_specific[0] {
                    crate::summary::CodecSpecific::Unstructured(b) => b.clone(),
                    _ => panic!("expected serialized avcC"),
                };
                assert_eq!(&avcc[4..8], b"avcC");
                assert_eq!(avcc[13] & 0x1f, 1); // one SPS
            }
            _ => panic!("expected video summary"),
        }
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.dts, 0);
        assert_eq!(s.cts, 0);
        assert!(s.prop.ra_flags.contains(RaFlags::SYNC));
        assert_eq!(s.prop.independent, Some(true));
        assert_eq!(s.prop.disposable, Some(false));
        // One length-prefixed NALU; parameter sets live in the avcC.
        let len = u32::from_be_bytes([s.data[0], s.data[1], s.data[2], s.data[3]]) as usize;
        assert_eq!(len + 4, s.data.len());
        assert_eq!(s.data[4], 0x65);
        assert!(imp.get_access_unit(1).unwrap().is_none());
    }

    #[test]
    fn idr_plus_trailing_pictures() {
        let idr = idr_slice();
        let p1 = p_slice(1);
        let p2 = p_slice(2);
        let stream = annexb(&[&SPS[..], &PPS[..], &idr[..], &p1[..], &p2[..]]);
        let mut imp = Importer::open(Cursor::new(stream), "h264").unwrap();
        let s0 = imp.get_access_unit(1).unwrap().unwrap();
        assert!(s0.prop.ra_flags.contains(RaFlags::SYNC));
        let s1 = imp.get_access_unit(1).unwrap().unwrap();
        assert!(s1.prop.ra_flags.is_empty());
        assert!(s1.dts > s0.dts);
        assert!(s1.dts <= s1.cts);
        let s2 = imp.get_access_unit(1).unwrap().unwrap();
        assert!(s2.dts > s1.dts);
        assert!(imp.get_access_unit(1).unwrap().is_none());
        assert!(imp.last_delta(1) > 0);
    }

    #[test]
    fn aud_is_dropped() {
        let idr = idr_slice();
        let aud = [0x09, 0x10];
        let stream = annexb(&[&SPS[..], &PPS[..], &aud[..], &idr[..]]);
        let mut imp = Importer::open(Cursor::new(stream), "h264").unwrap();
        let s = imp.get_access_unit(1).unwrap().unwrap();
        // Only the IDR slice remains in the sample.
        assert_eq!(s.data[4], 0x65);
    }
}
