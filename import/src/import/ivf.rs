//! IVF importer: AV1 temporal units inside the simple IVF container.
//!
//! IVF is a 32-byte little-endian global header followed by
//! `{u32 size, u64 pts}`-prefixed frames. Only the AV1 FourCC is
//! supported; each IVF frame is one temporal unit and becomes one sample.

use failure::{bail, Error};
use log::debug;

use super::{RaFlags, Sample, SampleProperty, Status};
use crate::codec::av1;
use crate::stream::ByteStream;
use crate::summary::{CodecSpecific, ColorInfo, FourCc, Summary, VideoSummary};

const GLOBAL_HEADER_LENGTH: usize = 32;
const FRAME_HEADER_LENGTH: usize = 12;

#[derive(Clone, Copy, Debug, Default)]
struct GlobalHeader {
    codec_fourcc: [u8; 4],
    width: u16,
    height: u16,
    frame_rate: u32,
    time_scale: u32,
}

fn reduce_fraction(mut num: u64, mut den: u64) -> (u64, u64) {
    let (mut a, mut b) = (num.max(den), num.min(den).max(1));
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    num /= a;
    den /= a;
    (num, den)
}

pub(crate) struct IvfImporter {
    status: Status,
    global_header: GlobalHeader,
    seq: av1::SequenceHeader,
    state: av1::DecoderState,
    seen_seq: bool,
    max_render_width: u32,
    max_render_height: u32,
    seq_width: u32,
    seq_height: u32,
    config: av1::Av1CodecConfiguration,
    first_pts_delta: u64,
}

/// Walks the first temporal unit to recover the sequence header, the
/// initial render dimensions, and the configOBUs blob.
fn parse_first_tu(tu: &[u8], imp: &mut IvfImporter) -> Result<av1::FrameHeader, Error> {
    let mut off = 0;
    let mut frame_header = None;
    while off < tu.len() {
        let obu = av1::next_obu(&tu[off..])?;
        match obu.obu_type {
            av1::OBU_SEQUENCE_HEADER => {
                let sh = av1::parse_sequence_header(obu.payload)?;
                imp.config = av1::Av1CodecConfiguration::from_sequence_header(&sh);
                // Only one sequence header OBU may be present in configOBUs.
                if !imp.seen_seq {
                    imp.config
                        .config_obus
                        .extend_from_slice(&tu[off..off + obu.encoded_len()]);
                }
                imp.seq_width = sh.max_frame_width;
                imp.seq_height = sh.max_frame_height;
                imp.seq = sh;
                imp.seen_seq = true;
            }
            av1::OBU_FRAME | av1::OBU_FRAME_HEADER => {
                if !imp.seen_seq {
                    bail!("frame before the first sequence header");
                }
                if frame_header.is_none() {
                    let fh = av1::parse_frame_header(obu.payload, &imp.seq, &mut imp.state)?;
                    frame_header = Some(fh);
                }
            }
            av1::OBU_METADATA => {
                if !imp.seen_seq {
                    // Config OBUs in a strange order; the proper fix would
                    // prepend the sequence header once found.
                    bail!("metadata before the first sequence header");
                }
                imp.config
                    .config_obus
                    .extend_from_slice(&tu[off..off + obu.encoded_len()]);
            }
            _ => {}
        }
        off += obu.encoded_len();
    }
    match (imp.seen_seq, frame_header) {
        (true, Some(fh)) => Ok(fh),
        _ => bail!("first temporal unit has no sequence header and frame"),
    }
}

fn include_obu(obu_type: u8) -> bool {
    obu_type == av1::OBU_SEQUENCE_HEADER
        || obu_type == av1::OBU_FRAME_HEADER
        || obu_type == av1::OBU_TILE_GROUP
        || obu_type == av1::OBU_METADATA
        || obu_type == av1::OBU_FRAME
}

impl IvfImporter {
    /// Filters one temporal unit into sample form, tracking render size
    /// growth and deciding syncness.
    ///
    /// A sample is sync iff its first frame is a shown key frame and a
    /// sequence header preceded it within the same temporal unit.
    fn assemble_sample(&mut self, tu: &[u8]) -> Result<(Vec<u8>, bool), Error> {
        let mut sample = Vec::with_capacity(tu.len());
        let mut off = 0;
        let mut first_fh = true;
        let mut seen_seq_this_tu = false;
        let mut issync = false;
        while off < tu.len() {
            let obu = av1::next_obu(&tu[off..])?;
            let encoded_len = obu.encoded_len();
            if !include_obu(obu.obu_type) {
                off += encoded_len;
                continue;
            }
            match obu.obu_type {
                av1::OBU_SEQUENCE_HEADER => {
                    self.seq = av1::parse_sequence_header(obu.payload)?;
                    self.seen_seq = true;
                    seen_seq_this_tu = true;
                }
                av1::OBU_FRAME_HEADER | av1::OBU_FRAME => {
                    // Sync samples require the sequence header first.
                    if !self.seen_seq {
                        bail!("frame before any sequence header");
                    }
                    let fh = av1::parse_frame_header(obu.payload, &self.seq, &mut self.state)?;
                    if fh.render_width > self.max_render_width {
                        self.max_render_width = fh.render_width;
                    }
                    if fh.render_height > self.max_render_height {
                        self.max_render_height = fh.render_height;
                    }
                    if seen_seq_this_tu && first_fh {
                        issync = fh.show_frame && fh.frame_type == av1::KEY_FRAME;
                    }
                    first_fh = false;
                }
                _ => {}
            }
            sample.extend_from_slice(&tu[off..off + encoded_len]);
            off += encoded_len;
        }
        Ok((sample, issync))
    }
}

fn create_summary(imp: &IvfImporter) -> Summary {
    let gh = &imp.global_header;
    let (par_h, par_v) = reduce_fraction(
        u64::from(imp.max_render_width) * u64::from(imp.seq_height),
        u64::from(imp.seq_width) * u64::from(imp.max_render_height),
    );
    Summary::Video(VideoSummary {
        sample_type: FourCc(*b"av01"),
        max_au_length: u32::MAX, // unused
        timescale: gh.frame_rate,
        timebase: gh.time_scale,
        vfr: false,
        sample_per_field: false,
        width: imp.seq_width,
        height: imp.seq_height,
        par: (par_h as u32, par_v as u32),
        color: ColorInfo {
            primaries_index: imp.seq.color.color_primaries,
            transfer_index: imp.seq.color.transfer_characteristics,
            matrix_index: imp.seq.color.matrix_coefficients,
            full_range: imp.seq.color.color_range,
        },
        codec_specific: vec![CodecSpecific::Unstructured(imp.config.serialize())],
    })
}

pub(crate) fn probe(bs: &mut ByteStream) -> Result<(IvfImporter, Summary), Error> {
    let mut gh = GlobalHeader::default();
    if bs.show_le32(0) != u32::from_le_bytes(*b"DKIF") {
        bail!("no IVF signature");
    }
    if bs.show_le16(4) != 0 {
        bail!("unknown IVF version");
    }
    let header_length = bs.show_le16(6);
    if header_length != GLOBAL_HEADER_LENGTH as u16 {
        bail!("unexpected IVF header length {}", header_length);
    }
    let mut fourcc = [0u8; 4];
    for (i, b) in fourcc.iter_mut().enumerate() {
        *b = bs.show_byte(8 + i);
    }
    gh.codec_fourcc = fourcc;
    gh.width = bs.show_le16(12);
    gh.height = bs.show_le16(14);
    gh.frame_rate = bs.show_le32(16);
    gh.time_scale = bs.show_le32(20);
    match &gh.codec_fourcc {
        b"AV01" => {}
        b"VP80" | b"VP90" => bail!("only AV1 is supported in IVF"),
        other => bail!("unknown IVF codec {:?}", other),
    }
    debug!("IVF container says {}x{}", gh.width, gh.height);
    bs.skip(GLOBAL_HEADER_LENGTH);
    // Parse the first temporal unit for the sequence header, render
    // dimensions, and color information.
    let au_length = bs.show_le32(0) as usize;
    let mut tu = vec![0u8; au_length];
    {
        let mut with_header = vec![0u8; FRAME_HEADER_LENGTH + au_length];
        for (i, b) in with_header.iter_mut().enumerate() {
            *b = bs.show_byte(i);
        }
        tu.copy_from_slice(&with_header[FRAME_HEADER_LENGTH..]);
    }
    let mut imp = IvfImporter {
        status: Status::Ok,
        global_header: gh,
        seq: av1::SequenceHeader::default(),
        state: av1::DecoderState::default(),
        seen_seq: false,
        max_render_width: 0,
        max_render_height: 0,
        seq_width: 0,
        seq_height: 0,
        config: av1::Av1CodecConfiguration::default(),
        first_pts_delta: 0,
    };
    let fh = parse_first_tu(&tu, &mut imp)?;
    imp.max_render_width = fh.render_width;
    imp.max_render_height = fh.render_height;
    // The probe parse fed the reference state; delivery re-parses from a
    // clean slate.
    imp.state = av1::DecoderState::default();
    imp.seen_seq = false;
    let summary = create_summary(&imp);
    Ok((imp, summary))
}

impl IvfImporter {
    pub(crate) fn get_access_unit(
        &mut self,
        bs: &mut ByteStream,
        summary: &mut Summary,
    ) -> Result<Option<Sample>, Error> {
        match self.status {
            Status::Error => bail!("IVF importer in error state"),
            Status::Eof => return Ok(None),
            _ => {}
        }
        if bs.is_end(FRAME_HEADER_LENGTH) {
            self.status = Status::Eof;
            return Ok(None);
        }
        let au_length = bs.get_le32() as usize;
        let pts = bs.get_le64();
        let mut packet = vec![0u8; au_length];
        if bs.get(&mut packet) != au_length {
            self.status = Status::Error;
            bail!("truncated IVF frame");
        }
        let prev_render_width = self.max_render_width;
        let prev_render_height = self.max_render_height;
        let (data, issync) = match self.assemble_sample(&packet) {
            Ok(r) => r,
            Err(e) => {
                self.status = Status::Error;
                return Err(e);
            }
        };
        let mut prop = SampleProperty::default();
        if issync {
            prop.ra_flags = RaFlags::SYNC;
        }
        // A RenderWidth or RenderHeight beyond the running maximum forces
        // a new sample entry to keep the file legal, per the AV1-ISOBMFF
        // binding; the pixel aspect ratio absorbs the difference. One
        // sample entry for the whole file would require scanning it all
        // before choosing the first summary.
        let mut summary_changed = false;
        if self.max_render_width > prev_render_width
            || self.max_render_height > prev_render_height
        {
            *summary = create_summary(self);
            summary_changed = true;
        }
        if self.first_pts_delta == 0 {
            self.first_pts_delta = pts;
        }
        Ok(Some(Sample {
            data: data.into(),
            dts: pts,
            cts: pts,
            prop,
            summary_changed,
        }))
    }

    pub(crate) fn last_delta(&self, _summary: &Summary) -> u32 {
        if self.status != Status::Eof {
            return 0;
        }
        // Only correct for constant frame rate streams.
        self.first_pts_delta as u32
    }
}

#[cfg(test)]
mod tests {
    use crate::import::Importer;
    use crate::summary::Summary;
    use std::io::Cursor;

    struct BitSink(Vec<bool>);

    impl BitSink {
        fn push(&mut self, v: u64, n: u8) {
            for i in (0..n).rev() {
                self.0.push(v & (1 << i) != 0);
            }
        }

        fn into_bytes(self) -> Vec<u8> {
            let mut bytes = vec![0u8; (self.0.len() + 7) / 8];
            for (i, b) in self.0.iter().enumerate() {
                if *b {
                    bytes[i / 8] |= 1 << (7 - i % 8);
                }
            }
            bytes
        }
    }

    /// Profile 0, level 8, 1280x720, order hints, 8-bit 4:2:0.
    fn sequence_header_payload() -> Vec<u8> {
        let mut s = BitSink(Vec::new());
        s.push(0, 3); // seq_profile
        s.push(0, 1); // still_picture
        s.push(0, 1); // reduced_still_picture_header
        s.push(0, 1); // timing_info_present_flag
        s.push(0, 1); // initial_display_delay_present_flag
        s.push(0, 5); // operating_points_cnt_minus_1
        s.push(0, 12); // operating_point_idc[0]
        s.push(8, 5); // seq_level_idx[0]
        s.push(10, 4); // frame_width_bits_minus_1
        s.push(9, 4); // frame_height_bits_minus_1
        s.push(1279, 11); // max_frame_width_minus_1
        s.push(719, 10); // max_frame_height_minus_1
        s.push(0, 1); // frame_id_numbers_present_flag
        s.push(1, 1); // use_128x128_superblock
        s.push(0, 2); // enable_filter_intra, enable_intra_edge_filter
        s.push(0, 4); // interintra/masked/warped/dual_filter
        s.push(1, 1); // enable_order_hint
        s.push(0, 2); // enable_jnt_comp, enable_ref_frame_mvs
        s.push(1, 1); // seq_choose_screen_content_tools
        s.push(1, 1); // seq_choose_integer_mv
        s.push(6, 3); // order_hint_bits_minus_1
        s.push(0, 1); // enable_superres
        s.push(0, 1); // enable_cdef
        s.push(1, 1); // enable_restoration
        s.push(0, 1); // high_bitdepth
        s.push(0, 1); // mono_chrome
        s.push(0, 1); // color_description_present_flag
        s.push(0, 1); // color_range
        s.push(0, 2); // chroma_sample_position
        s.push(0, 1); // separate_uv_delta_q
        s.push(0, 1); // film_grain_params_present
        s.push(1, 1); // trailing bit
        s.into_bytes()
    }

    /// Key frame, shown, with an optional explicit render size.
    fn frame_payload(render: Option<(u32, u32)>) -> Vec<u8> {
        let mut s = BitSink(Vec::new());
        s.push(0, 1); // show_existing_frame
        s.push(0, 2); // frame_type KEY
        s.push(1, 1); // show_frame (error_resilient_mode implied)
        s.push(0, 1); // disable_cdf_update
        s.push(0, 1); // allow_screen_content_tools
        s.push(0, 1); // frame_size_override_flag
        s.push(0, 7); // order_hint
        match render {
            None => s.push(0, 1), // render_and_frame_size_different
            Some((w, h)) => {
                s.push(1, 1);
                s.push(u64::from(w) - 1, 16);
                s.push(u64::from(h) - 1, 16);
            }
        }
        s.push(0, 8); // fake tile payload
        s.into_bytes()
    }

    fn obu(obu_type: u8, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() < 0x80);
        let mut o = vec![(obu_type << 3) | 0x2, payload.len() as u8];
        o.extend_from_slice(payload);
        o
    }

    fn temporal_unit(render: Option<(u32, u32)>, with_seq: bool) -> Vec<u8> {
        let mut tu = obu(super::av1::OBU_TEMPORAL_DELIMITER, &[]);
        if with_seq {
            tu.extend(obu(
                super::av1::OBU_SEQUENCE_HEADER,
                &sequence_header_payload(),
            ));
        }
        tu.extend(obu(super::av1::OBU_FRAME, &frame_payload(render)));
        tu
    }

    fn ivf_stream(tus: &[(Vec<u8>, u64)]) -> Vec<u8> {
        let mut s = Vec::new();
        s.extend_from_slice(b"DKIF");
        s.extend_from_slice(&0u16.to_le_bytes()); // version
        s.extend_from_slice(&32u16.to_le_bytes()); // header length
        s.extend_from_slice(b"AV01");
        s.extend_from_slice(&1280u16.to_le_bytes());
        s.extend_from_slice(&720u16.to_le_bytes());
        s.extend_from_slice(&30u32.to_le_bytes()); // frame_rate
        s.extend_from_slice(&1u32.to_le_bytes()); // time_scale
        s.extend_from_slice(&(tus.len() as u32).to_le_bytes());
        s.extend_from_slice(&0u32.to_le_bytes()); // unused
        for (tu, pts) in tus {
            s.extend_from_slice(&(tu.len() as u32).to_le_bytes());
            s.extend_from_slice(&pts.to_le_bytes());
            s.extend_from_slice(tu);
        }
        s
    }

    #[test]
    fn probe_and_first_sample() {
        let stream = ivf_stream(&[
            (temporal_unit(None, true), 0),
            (temporal_unit(None, false), 1),
        ]);
        let mut imp = Importer::open(Cursor::new(stream), "ivf").unwrap();
        match imp.summary(1).unwrap() {
            Summary::Video(v) => {
                assert_eq!(v.width, 1280);
                assert_eq!(v.height, 720);
                assert_eq!(v.par, (1, 1));
                assert_eq!(v.timescale, 30);
                assert_eq!(v.sample_type.0, *b"av01");
            }
            _ => panic!("expected video summary"),
        }
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert!(s.prop.ra_flags.contains(crate::import::RaFlags::SYNC));
        assert!(!s.summary_changed);
        // The temporal delimiter is dropped from the sample.
        assert_eq!(s.data[0] >> 3 & 0xf, super::av1::OBU_SEQUENCE_HEADER);
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert_eq!(s.dts, 1);
        assert!(imp.get_access_unit(1).unwrap().is_none());
        assert_eq!(imp.last_delta(1), 1);
    }

    #[test]
    fn render_resize_signals_change() {
        let stream = ivf_stream(&[
            (temporal_unit(None, true), 0),
            (temporal_unit(Some((1920, 1080)), false), 1),
        ]);
        let mut imp = Importer::open(Cursor::new(stream), "ivf").unwrap();
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert!(!s.summary_changed);
        let s = imp.get_access_unit(1).unwrap().unwrap();
        assert!(s.summary_changed);
        match imp.summary(1).unwrap() {
            // 1920*720 : 1280*1080 reduces to 1:1.
            Summary::Video(v) => assert_eq!(v.par, (1, 1)),
            _ => panic!("expected video summary"),
        }
    }

    #[test]
    fn rejects_vp9() {
        let mut stream = ivf_stream(&[(temporal_unit(None, true), 0)]);
        stream[8..12].copy_from_slice(b"VP90");
        assert!(Importer::open(Cursor::new(stream), "ivf").is_err());
    }
}
