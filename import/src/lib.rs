//! Elementary-stream importers for `.mp4` muxing.
//!
//! This crate reads raw compressed bitstreams (AAC in ADTS, MPEG-1/2
//! audio, AMR-NB/WB storage files, AC-3 and Enhanced AC-3, MPEG-4 ALS,
//! DTS, H.264 and H.265 Annex B byte streams, and AV1 inside IVF) and
//! produces, per stream:
//!
//! *   a [summary::Summary] describing the stream the way an `.mp4`
//!     sample entry does (codec, dimensions or channels/frequency, and the
//!     serialized decoder configuration: `esds` payload, `dac3`, `dec3`,
//!     `ddts`, `damr`, `avcC`, `hvcC`, or `av1C`);
//! *   successive [import::Sample]s: access units with decode/composition
//!     timestamps and random-access properties, ready to append to a track.
//!
//! It is one half of a muxer. Box serialization, file plumbing, and the
//! actual track writing are the other half and live elsewhere.
//!
//! The H.264/H.265 importers parse the full bitstream syntax (Exp-Golomb,
//! parameter sets, slice headers, SEI) to reconstruct picture order counts
//! and synthesize timestamps in a two-pass analyze-then-replay design, so
//! they require seekable input. The framed audio formats work
//! frame-at-a-time and accept pipes.

pub mod bits;
pub mod codec;
pub mod import;
pub mod stream;
pub mod summary;

pub use crate::import::{Importer, Leading, PostRoll, RaFlags, Sample, SampleProperty};
pub use crate::summary::{AudioSummary, CodecSpecific, FourCc, Summary, VideoSummary};
