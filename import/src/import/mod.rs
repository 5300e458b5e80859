//! The importer framework: format detection and the per-codec dispatch.
//!
//! An importer turns one elementary stream into a sequence of timestamped
//! access units plus a [crate::summary::Summary] describing them. Each
//! concrete importer implements three operations behind the [Format] enum:
//! `probe` (validate the stream head and build the initial summary),
//! `get_access_unit`, and `last_delta` (the duration of the final access
//! unit, known only at end of stream).

use std::io::{Read, Seek};

use bytes::Bytes;
use failure::{bail, format_err, Error};
use log::debug;

use crate::stream::ByteStream;
use crate::summary::Summary;

pub mod ac3;
pub mod adts;
pub mod als;
pub mod amr;
pub mod dts;
pub mod eac3;
pub mod h264;
pub mod hevc;
pub mod ivf;
pub mod mp3;
mod nalu;

/// Importer delivery state. `Change` means a new summary is pending and
/// becomes active when the next access unit is delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Status {
    Ok,
    Change,
    Eof,
    Error,
}

/// Random-access flags of a sample, as understood by ISO/IEC 14496-12
/// sync/rap/roll sample groupings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RaFlags(u32);

impl RaFlags {
    pub const NONE: RaFlags = RaFlags(0);
    /// A sync sample: decodable with no prior state, nothing later depends
    /// on anything earlier.
    pub const SYNC: RaFlags = RaFlags(1 << 0);
    /// A random access point that may have undecodable leading samples.
    pub const RAP: RaFlags = RaFlags(1 << 1);
    /// A RAP whose coded video sequence has no undecodable leading samples.
    pub const CLOSED_RAP: RaFlags = RaFlags(1 << 2);
    /// Decodable, but possibly with visible artifacts (open GOP entry).
    pub const PARTIAL_SYNC: RaFlags = RaFlags(1 << 3);
    /// Starting point of a gradual decoder refresh; see `post_roll`.
    pub const POST_ROLL_START: RaFlags = RaFlags(1 << 4);

    pub fn contains(self, other: RaFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for RaFlags {
    type Output = RaFlags;
    fn bitor(self, rhs: RaFlags) -> RaFlags {
        RaFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for RaFlags {
    fn bitor_assign(&mut self, rhs: RaFlags) {
        self.0 |= rhs.0;
    }
}

/// Position of a sample relative to the random access point it follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Leading {
    Unknown,
    /// Composed before its RAP but requires samples preceding the RAP.
    Undecodable,
    Decodable,
    NotLeading,
}

impl Default for Leading {
    fn default() -> Self {
        Leading::Unknown
    }
}

/// Recovery information for `RaFlags::POST_ROLL_START` samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PostRoll {
    /// Identifier of this sample (frame_num or POC).
    pub identifier: u32,
    /// Identifier of the sample at which decoding is complete.
    pub complete: u32,
}

#[derive(Clone, Debug, Default)]
pub struct SampleProperty {
    pub ra_flags: RaFlags,
    pub leading: Leading,
    /// Whether this sample depends on no other sample; `None` if unknown.
    pub independent: Option<bool>,
    /// Whether no other sample depends on this one.
    pub disposable: Option<bool>,
    pub has_redundancy: Option<bool>,
    /// An earlier presentation time would be acceptable (QuickTime quirk
    /// for reordered non-reference pictures).
    pub allow_earlier_pts: bool,
    /// Number of preceding samples the decoder must process before this
    /// one is correct; 1 for the MDCT overlap of AAC/MP3/AC-3.
    pub pre_roll_distance: u32,
    pub post_roll: PostRoll,
}

/// One access unit, in decode order.
pub struct Sample {
    pub data: Bytes,
    pub dts: u64,
    pub cts: u64,
    pub prop: SampleProperty,
    /// The active summary was replaced immediately before this sample was
    /// delivered; re-query [Importer::summary].
    pub summary_changed: bool,
}

impl std::fmt::Debug for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sample")
            .field("len", &self.data.len())
            .field("dts", &self.dts)
            .field("cts", &self.cts)
            .field("prop", &self.prop)
            .field("summary_changed", &self.summary_changed)
            .finish()
    }
}

pub(crate) enum Format {
    Adts(adts::AdtsImporter),
    Mp3(mp3::Mp3Importer),
    Amr(amr::AmrImporter),
    Ac3(ac3::Ac3Importer),
    Eac3(eac3::Eac3Importer),
    Als(als::AlsImporter),
    Dts(dts::DtsImporter),
    H264(h264::H264Importer),
    Hevc(hevc::HevcImporter),
    Ivf(ivf::IvfImporter),
}

/// Formats in auto-detection order. Strict-syncword formats go first; the
/// NAL formats scan for start codes and are the most permissive, so they
/// probe last.
const FORMAT_NAMES: [&str; 10] = [
    "adts", "mp3", "amr", "ac3", "eac3", "als", "dts", "ivf", "h264", "hevc",
];

fn probe_format(
    name: &str,
    bs: &mut ByteStream,
) -> Result<(Format, Summary), Error> {
    match name {
        "adts" => adts::probe(bs).map(|(i, s)| (Format::Adts(i), s)),
        "mp3" => mp3::probe(bs).map(|(i, s)| (Format::Mp3(i), s)),
        "amr" => amr::probe(bs).map(|(i, s)| (Format::Amr(i), s)),
        "ac3" => ac3::probe(bs).map(|(i, s)| (Format::Ac3(i), s)),
        "eac3" => eac3::probe(bs).map(|(i, s)| (Format::Eac3(i), s)),
        "als" => als::probe(bs).map(|(i, s)| (Format::Als(i), s)),
        "dts" => dts::probe(bs).map(|(i, s)| (Format::Dts(i), s)),
        "h264" => h264::probe(bs).map(|(i, s)| (Format::H264(i), s)),
        "hevc" => hevc::probe(bs).map(|(i, s)| (Format::Hevc(i), s)),
        "ivf" => ivf::probe(bs).map(|(i, s)| (Format::Ivf(i), s)),
        _ => bail!("unknown format {:?}", name),
    }
}

/// An open elementary stream with its importer state.
pub struct Importer {
    bs: ByteStream,
    format: Format,
    summaries: Vec<Summary>,
    eof: bool,
    failed: bool,
}

impl Importer {
    /// Opens `input` by probing each known format in turn, rewinding
    /// between attempts. The first successful probe wins.
    pub fn open_auto<R: Read + Seek + 'static>(input: R) -> Result<Importer, Error> {
        let mut bs = ByteStream::new(input);
        for name in &FORMAT_NAMES {
            match probe_format(name, &mut bs) {
                Ok((format, summary)) => {
                    return Ok(Importer {
                        bs,
                        format,
                        summaries: vec![summary],
                        eof: false,
                        failed: false,
                    });
                }
                Err(e) => {
                    debug!("probe as {} failed: {}", name, e);
                    bs.read_seek_set(0)?;
                }
            }
        }
        bail!("no importer accepted the stream");
    }

    /// Opens `input` with the named format only.
    pub fn open<R: Read + Seek + 'static>(input: R, format: &str) -> Result<Importer, Error> {
        let mut bs = ByteStream::new(input);
        let (format, summary) = probe_format(format, &mut bs)?;
        Ok(Importer {
            bs,
            format,
            summaries: vec![summary],
            eof: false,
            failed: false,
        })
    }

    /// Opens an unseekable stream (a pipe) with the named format. The
    /// whole-stream-scanning importers (H.264, H.265) reject such input.
    pub fn open_unseekable<R: Read + 'static>(input: R, format: &str) -> Result<Importer, Error> {
        let mut bs = ByteStream::unseekable(input);
        let (format, summary) = probe_format(format, &mut bs)?;
        Ok(Importer {
            bs,
            format,
            summaries: vec![summary],
            eof: false,
            failed: false,
        })
    }

    /// Number of elementary streams described; 1 for every current format.
    pub fn track_count(&self) -> u32 {
        self.summaries.len() as u32
    }

    /// The active summary for 1-based `track_number`. The caller must not
    /// rely on it across a sample with `summary_changed`.
    pub fn summary(&self, track_number: u32) -> Option<&Summary> {
        self.summaries.get(track_number.checked_sub(1)? as usize)
    }

    /// Deep copy of the active summary.
    pub fn duplicate_summary(&self, track_number: u32) -> Option<Summary> {
        self.summary(track_number).cloned()
    }

    /// Pulls the next access unit in decode order. `Ok(None)` is end of
    /// stream; errors are fatal to the importer.
    pub fn get_access_unit(&mut self, track_number: u32) -> Result<Option<Sample>, Error> {
        if self.failed {
            bail!("importer previously failed");
        }
        if track_number != 1 {
            bail!("track {} out of range", track_number);
        }
        if self.eof {
            return Ok(None);
        }
        let summary = self
            .summaries
            .get_mut(0)
            .ok_or_else(|| format_err!("no summary"))?;
        let r = match &mut self.format {
            Format::Adts(i) => i.get_access_unit(&mut self.bs, summary),
            Format::Mp3(i) => i.get_access_unit(&mut self.bs, summary),
            Format::Amr(i) => i.get_access_unit(&mut self.bs, summary),
            Format::Ac3(i) => i.get_access_unit(&mut self.bs, summary),
            Format::Eac3(i) => i.get_access_unit(&mut self.bs, summary),
            Format::Als(i) => i.get_access_unit(&mut self.bs, summary),
            Format::Dts(i) => i.get_access_unit(&mut self.bs, summary),
            Format::H264(i) => i.get_access_unit(&mut self.bs, summary),
            Format::Hevc(i) => i.get_access_unit(&mut self.bs, summary),
            Format::Ivf(i) => i.get_access_unit(&mut self.bs, summary),
        };
        match r {
            Ok(None) => {
                self.eof = true;
                Ok(None)
            }
            Ok(s) => Ok(s),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    /// Duration of the final access unit in the summary's timescale.
    /// Valid only once `get_access_unit` has returned `Ok(None)`.
    pub fn last_delta(&self, track_number: u32) -> u32 {
        if track_number != 1 || !self.eof {
            return 0;
        }
        let summary = match self.summaries.get(0) {
            Some(s) => s,
            None => return 0,
        };
        match &self.format {
            Format::Adts(i) => i.last_delta(summary),
            Format::Mp3(i) => i.last_delta(summary),
            Format::Amr(i) => i.last_delta(summary),
            Format::Ac3(i) => i.last_delta(summary),
            Format::Eac3(i) => i.last_delta(summary),
            Format::Als(i) => i.last_delta(summary),
            Format::Dts(i) => i.last_delta(summary),
            Format::H264(i) => i.last_delta(summary),
            Format::Hevc(i) => i.last_delta(summary),
            Format::Ivf(i) => i.last_delta(summary),
        }
    }
}
