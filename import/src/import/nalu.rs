//! Timestamp synthesis shared by the H.264 and H.265 importers.
//!
//! The probe pass records one [PicTiming] per access unit in decode
//! order. POCs are then deduplicated across coded video sequences into a
//! single monotone composition order, reordering is detected, and DTS/CTS
//! pairs are generated with a ring-buffered composition delay.

use log::warn;

/// Per-access-unit result of the analysis pass.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct PicTiming {
    pub poc: i64,
    /// Duration in DeltaTfiDivisor field units.
    pub delta: u32,
    /// Expected POC step to the next picture in output order.
    pub poc_delta: u16,
    /// Picture resets POC anchors (MMCO5 or an end of sequence).
    pub reset: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub(super) struct MediaTimestamp {
    pub dts: u64,
    pub cts: u64,
}

/// Offsets POCs so that every coded video sequence lands after the one
/// before it: within each CVS (a run between resets/IDRs) POCs become
/// non-negative and grouped monotonically.
///
/// Pictures with negative POC shortly after an IDR (within
/// `max_num_reorder_pics`) are leading pictures composed before it; older
/// negative POCs are invalid-but-present and get displaced into the next
/// coded video sequence. `max_composition_delay` grows to the largest
/// distance a leading picture reaches back.
pub(super) fn deduplicate_poc(
    npt: &mut [PicTiming],
    max_composition_delay: &mut u32,
    max_num_reorder_pics: usize,
) {
    let num_access_units = npt.len();
    let mut poc_offset: i64 = 0;
    let mut poc_min: i64 = 0;
    let mut invalid_poc_min: i64 = 0;
    let mut last_poc_reset: Option<usize> = None;
    let mut invalid_poc_start: usize = 0;
    let mut invalid_poc_present = false;
    let mut i = 0;
    loop {
        if i < num_access_units && npt[i].poc != 0 && !npt[i].reset {
            // poc_offset is applied when the next coded video sequence is
            // encountered, not here.
            if npt[i].poc < 0 {
                match last_poc_reset {
                    Some(reset) if i <= reset + max_num_reorder_pics => {
                        if poc_min > npt[i].poc {
                            poc_min = npt[i].poc;
                            *max_composition_delay =
                                (*max_composition_delay).max((i - reset) as u32);
                        }
                    }
                    _ => {
                        if !invalid_poc_present {
                            invalid_poc_present = true;
                            invalid_poc_start = i;
                        }
                        if invalid_poc_min > npt[i].poc {
                            invalid_poc_min = npt[i].poc;
                        }
                    }
                }
            }
            i += 1;
            continue;
        }
        // A new coded video sequence, or no more POCs: shift the previous
        // sequence into place.
        poc_offset -= poc_min;
        let end = if i < num_access_units && npt[i].reset {
            i + 1
        } else {
            i
        };
        let mut poc_max: i64 = 0;
        if let Some(reset) = last_poc_reset {
            for j in reset..end {
                if npt[j].poc >= 0 || j <= reset + max_num_reorder_pics {
                    npt[j].poc += poc_offset;
                    poc_max = poc_max.max(npt[j].poc);
                }
            }
        }
        poc_offset = poc_max + 1;
        if invalid_poc_present {
            // Invalid negative POCs are presumably meant to composite both
            // after the current sequence and before the next one.
            poc_offset -= invalid_poc_min;
            for j in invalid_poc_start..end {
                if npt[j].poc < 0 {
                    npt[j].poc += poc_offset;
                    poc_max = poc_max.max(npt[j].poc);
                }
            }
            invalid_poc_present = false;
            invalid_poc_start = 0;
            invalid_poc_min = 0;
            poc_offset = poc_max + 1;
        }
        if i < num_access_units {
            if npt[i].reset {
                npt[i].poc = 0;
            }
            poc_min = 0;
            last_poc_reset = Some(i);
        } else {
            break;
        }
        i += 1;
    }
}

/// Generates DTS/CTS per access unit from deduplicated POCs, returning
/// the timestamps, whether composition reordering is present, and the
/// final delta.
pub(super) fn generate_timestamps_from_poc(
    npt: &[PicTiming],
    mut max_composition_delay: u32,
) -> (Vec<MediaTimestamp>, bool, u32) {
    let num_access_units = npt.len();
    if num_access_units == 0 {
        return (Vec::new(), false, 0);
    }
    // Composition reordering may be implied by leading pictures or found
    // by a POC inversion.
    let mut composition_reordering_present = max_composition_delay != 0;
    if !composition_reordering_present {
        for i in 1..num_access_units {
            if npt[i].poc < npt[i - 1].poc {
                composition_reordering_present = true;
                break;
            }
        }
    }
    let mut timestamp = vec![MediaTimestamp::default(); num_access_units];
    let last_delta = npt[num_access_units - 1].delta;
    if composition_reordering_present {
        // First pass into composition order: cts carries POC, dts the
        // decode index.
        for (i, ts) in timestamp.iter_mut().enumerate() {
            ts.cts = npt[i].poc as u64;
            ts.dts = i as u64;
        }
        timestamp.sort_by_key(|ts| (ts.cts, ts.dts));
        // Check for POC gaps in output order.
        for i in 1..num_access_units {
            if timestamp[i].cts > timestamp[i - 1].cts + u64::from(npt[i - 1].poc_delta) {
                warn!(
                    "POC gap is detected at picture {}. Maybe some pictures are lost.",
                    timestamp[i].dts
                );
            }
        }
        // The maximum composition delay derived from reordering.
        for (i, ts) in timestamp.iter().enumerate() {
            if (i as u64) < ts.dts {
                max_composition_delay = max_composition_delay.max((ts.dts - i as u64) as u32);
            }
        }
        // Generate CTSs by accumulating durations in composition order.
        timestamp[0].cts = 0;
        for i in 1..num_access_units {
            timestamp[i].cts = timestamp[i - 1].cts + u64::from(npt[i - 1].delta);
        }
        let composition_delay_time = timestamp[max_composition_delay as usize].cts;
        let mut reorder_cts = Vec::with_capacity(num_access_units);
        for ts in timestamp.iter_mut() {
            ts.cts += composition_delay_time;
            reorder_cts.push(ts.cts);
        }
        // Back into decode order, then derive DTSs by replaying the
        // composition times through a delay line.
        timestamp.sort_by_key(|ts| ts.dts);
        let mcd = max_composition_delay as usize;
        let mut prev_reorder_cts = vec![0u64; mcd];
        for i in 0..num_access_units {
            timestamp[i].dts = if i <= mcd {
                reorder_cts[i] - composition_delay_time
            } else {
                prev_reorder_cts[(i - mcd) % mcd]
            };
            prev_reorder_cts[i % mcd] = reorder_cts[i];
        }
    } else {
        timestamp[0] = MediaTimestamp { dts: 0, cts: 0 };
        for i in 1..num_access_units {
            let t = timestamp[i - 1].dts + u64::from(npt[i - 1].delta);
            timestamp[i] = MediaTimestamp { dts: t, cts: t };
        }
    }
    (timestamp, composition_reordering_present, last_delta)
}

/// Divides timestamps, the final delta, and the timescale by their GCD.
pub(super) fn reduce_timescale(
    timestamp: &mut [MediaTimestamp],
    npt: &[PicTiming],
    last_delta: &mut u32,
    timescale: &mut u32,
) {
    let mut gcd_delta = u64::from(*timescale);
    for pt in npt {
        if gcd_delta <= 1 {
            break;
        }
        gcd_delta = gcd(gcd_delta, u64::from(pt.delta));
    }
    if gcd_delta <= 1 {
        return;
    }
    for ts in timestamp.iter_mut() {
        ts.dts /= gcd_delta;
        ts.cts /= gcd_delta;
    }
    *last_delta /= gcd_delta as u32;
    *timescale /= gcd_delta as u32;
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    fn npt_of(pocs: &[i64]) -> Vec<PicTiming> {
        pocs.iter()
            .map(|&poc| PicTiming {
                poc,
                delta: 2,
                poc_delta: 2,
                reset: false,
            })
            .collect()
    }

    #[test]
    fn no_reordering_is_cumulative() {
        let npt = npt_of(&[0, 2, 4, 6]);
        let (ts, reordering, last_delta) = generate_timestamps_from_poc(&npt, 0);
        assert!(!reordering);
        assert_eq!(last_delta, 2);
        let dts: Vec<u64> = ts.iter().map(|t| t.dts).collect();
        assert_eq!(dts, &[0, 2, 4, 6]);
        assert!(ts.iter().all(|t| t.dts == t.cts));
    }

    #[test]
    fn ibbp_reordering() {
        // Decode order IPBB...: POCs 0, 4, 2, 6 with one frame of delay.
        let npt = npt_of(&[0, 4, 2, 6]);
        let (ts, reordering, _last_delta) = generate_timestamps_from_poc(&npt, 0);
        assert!(reordering);
        // CTS in composition order is 0,2,4,6; decode order leaves them
        // as 0,4,2,6 shifted by the composition delay (one 2-unit frame).
        let cts: Vec<u64> = ts.iter().map(|t| t.cts).collect();
        assert_eq!(cts, &[2, 6, 4, 8]);
        // Monotone DTS, dts <= cts everywhere.
        for i in 1..ts.len() {
            assert!(ts[i].dts > ts[i - 1].dts);
        }
        for t in &ts {
            assert!(t.dts <= t.cts);
        }
    }

    #[test]
    fn poc_dedup_across_idr() {
        // Two IDR-led sequences; the second lands after the first, and
        // relative order is all that matters downstream.
        let mut npt = npt_of(&[0, 2, 4, 0, 2]);
        let mut mcd = 0;
        deduplicate_poc(&mut npt, &mut mcd, 32);
        let pocs: Vec<i64> = npt.iter().map(|pt| pt.poc).collect();
        assert_eq!(pocs, &[1, 3, 5, 6, 8]);
        assert_eq!(mcd, 0);
    }

    #[test]
    fn poc_dedup_keeps_leading_pictures() {
        // An IDR followed by leading pictures composed before it.
        let mut npt = npt_of(&[0, 2, 4, 0, -2, 2]);
        let mut mcd = 0;
        deduplicate_poc(&mut npt, &mut mcd, 32);
        let pocs: Vec<i64> = npt.iter().map(|pt| pt.poc).collect();
        // The leading picture stays composed before its IDR, one frame
        // of composition delay is recorded, and nothing stays negative.
        assert_eq!(pocs, &[1, 3, 5, 8, 6, 10]);
        assert_eq!(mcd, 1);
        assert!(pocs.iter().all(|&poc| poc >= 0));
    }

    #[test]
    fn timescale_reduction() {
        let npt = npt_of(&[0, 2, 4, 6]);
        let (mut ts, _, mut last_delta) = generate_timestamps_from_poc(&npt, 0);
        let mut timescale = 60;
        reduce_timescale(&mut ts, &npt, &mut last_delta, &mut timescale);
        assert_eq!(timescale, 30);
        assert_eq!(last_delta, 1);
        let dts: Vec<u64> = ts.iter().map(|t| t.dts).collect();
        assert_eq!(dts, &[0, 1, 2, 3]);
    }
}
