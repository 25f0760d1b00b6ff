//! Timed playback over recorded segments.
//!
//! Given a path, a start time and a duration, the stitcher enumerates the
//! segments intersecting the window, seeks to the last random access point
//! at or before the requested offset, and emits one concatenated byte
//! stream, carrying over into following segments while they are contiguous.

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

use relaymux_core::{Error, PathConf, RecordFormat, Result};

use crate::fmp4;
use crate::index::{segments_of_path, Segment};
use crate::mpegts;

/// Two adjacent segments are contiguous iff the gap between the end of one
/// and the start of the next stays within this bound, in either direction.
const MAX_GAP: Duration = Duration::from_secs(1);

/// One available recording range, for the playback list endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TimeSpan {
    pub start: DateTime<Local>,
    /// Seconds.
    pub duration: f64,
}

struct MeasuredSegment {
    segment: Segment,
    data: Vec<u8>,
    duration: Duration,
}

fn load_segment(segment: Segment) -> Result<MeasuredSegment> {
    let data = fs::read(&segment.file_path).map_err(|e| {
        Error::Transport(format!(
            "can not read '{}': {e}",
            segment.file_path.display()
        ))
    })?;
    let duration = match segment.format {
        RecordFormat::Fmp4 => fmp4::segment_duration(&data)?,
        RecordFormat::Mpegts => mpegts::scan_segment(&data)?.duration(),
    };
    Ok(MeasuredSegment {
        segment,
        data,
        duration,
    })
}

fn contiguous(prev: &MeasuredSegment, next: &MeasuredSegment) -> bool {
    let prev_end = prev.segment.start
        + chrono::Duration::from_std(prev.duration).unwrap_or_default();
    let gap = next.segment.start - prev_end;
    gap.abs().to_std().unwrap_or(Duration::MAX) <= MAX_GAP
}

/// Available time ranges of one path: contiguous segment chains merged.
pub fn list_spans(path_conf: &PathConf, name: &str) -> Result<Vec<TimeSpan>> {
    let segments = segments_of_path(path_conf, name)?;

    let mut spans: Vec<TimeSpan> = Vec::new();
    let mut previous: Option<MeasuredSegment> = None;

    for segment in segments {
        let measured = load_segment(segment)?;
        let extend = previous
            .as_ref()
            .is_some_and(|prev| contiguous(prev, &measured));
        if extend {
            if let Some(span) = spans.last_mut() {
                let end = measured.segment.start
                    + chrono::Duration::from_std(measured.duration).unwrap_or_default();
                span.duration = (end - span.start)
                    .to_std()
                    .unwrap_or_default()
                    .as_secs_f64();
            }
        } else {
            spans.push(TimeSpan {
                start: measured.segment.start,
                duration: measured.duration.as_secs_f64(),
            });
        }
        previous = Some(measured);
    }
    Ok(spans)
}

/// Emit `[start, start+duration)` of a recorded path as one concatenated
/// byte stream in the path's record format.
pub fn stitch(
    path_conf: &PathConf,
    name: &str,
    start: DateTime<Local>,
    duration: Duration,
) -> Result<Vec<u8>> {
    if duration.is_zero() {
        return Err(Error::Validation("duration must be positive".to_string()));
    }
    let window_end = start + chrono::Duration::from_std(duration).unwrap_or_default();

    let segments = segments_of_path(path_conf, name)?;

    // first segment whose [start, start+dur) intersects the window
    let mut selected = Vec::new();
    for segment in segments {
        if segment.start >= window_end {
            break;
        }
        let measured = load_segment(segment)?;
        let seg_end = measured.segment.start
            + chrono::Duration::from_std(measured.duration).unwrap_or_default();
        if seg_end <= start {
            continue;
        }
        if let Some(prev) = selected.last() {
            if !contiguous(prev, &measured) {
                // a gap terminates playback
                break;
            }
        }
        selected.push(measured);
    }

    if selected.is_empty() {
        return Err(Error::NotFound(format!(
            "no recording of path '{name}' intersects the requested window"
        )));
    }

    match path_conf.record_format {
        RecordFormat::Fmp4 => stitch_fmp4(&selected, start, window_end),
        RecordFormat::Mpegts => stitch_mpegts(&selected, start, window_end),
    }
}

fn stitch_fmp4(
    segments: &[MeasuredSegment],
    start: DateTime<Local>,
    window_end: DateTime<Local>,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    // ticks already emitted per track, so each segment rebases onto the
    // previous one's end
    let mut emitted_ticks: HashMap<u32, u64> = HashMap::new();

    for (seg_idx, measured) in segments.iter().enumerate() {
        let data = &measured.data;
        let tracks = fmp4::parse_init(data)?;
        let parts = fmp4::scan_parts(data)?;
        if parts.is_empty() {
            continue;
        }

        if seg_idx == 0 {
            let init_len = fmp4::init_section_len(data)?;
            out.extend_from_slice(&data[..init_len]);
        }

        let timescale = |id: u32| -> u64 {
            tracks
                .iter()
                .find(|t| t.id == id)
                .map_or(90_000, |t| u64::from(t.timescale.max(1)))
        };

        // part offsets are measured on the leading track
        let lead_id = parts[0].tracks.first().map_or(1, |t| t.id);
        let lead_scale = timescale(lead_id);
        let first_base = parts[0]
            .tracks
            .first()
            .map_or(0, |t| t.base_decode_time);

        let part_offset = |part: &fmp4::ParsedPart| -> Duration {
            let ticks = part
                .tracks
                .iter()
                .find(|t| t.id == lead_id)
                .map_or(0, |t| t.base_decode_time.saturating_sub(first_base));
            Duration::from_nanos(
                (u128::from(ticks) * 1_000_000_000 / u128::from(lead_scale)) as u64,
            )
        };

        // seek to the last random access point at or before the offset
        let seek = if seg_idx == 0 && start > measured.segment.start {
            let offset = (start - measured.segment.start)
                .to_std()
                .unwrap_or_default();
            parts
                .iter()
                .enumerate()
                .filter(|(_, p)| p.random_access() && part_offset(p) <= offset)
                .map(|(i, _)| i)
                .next_back()
                .unwrap_or(0)
        } else {
            0
        };

        let mut deltas: Vec<(u32, i64)> = Vec::new();
        let mut emitted_here: HashMap<u32, u64> = HashMap::new();

        for part in &parts[seek..] {
            let part_time = measured.segment.start
                + chrono::Duration::from_std(part_offset(part)).unwrap_or_default();
            if part_time >= window_end {
                break;
            }

            for track in &part.tracks {
                if !deltas.iter().any(|(id, _)| *id == track.id) {
                    let already = emitted_ticks.get(&track.id).copied().unwrap_or(0);
                    deltas.push((
                        track.id,
                        track.base_decode_time as i64 - already as i64,
                    ));
                }
                *emitted_here.entry(track.id).or_insert(0) += track.duration;
            }

            let mut copy = data[part.offset..part.end].to_vec();
            fmp4::rebase_part(&mut copy, part, &deltas);
            out.extend_from_slice(&copy);
        }

        for (id, ticks) in emitted_here {
            *emitted_ticks.entry(id).or_insert(0) += ticks;
        }
    }

    Ok(out)
}

fn stitch_mpegts(
    segments: &[MeasuredSegment],
    start: DateTime<Local>,
    window_end: DateTime<Local>,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();

    for (seg_idx, measured) in segments.iter().enumerate() {
        let data = &measured.data;
        let info = mpegts::scan_segment(data)?;
        let Some(first_pts) = info.first_pts else {
            continue;
        };

        let rap_time = |pts: i64| {
            let mut span = pts - first_pts;
            if span < 0 {
                span += 1 << 33;
            }
            measured.segment.start
                + chrono::Duration::from_std(Duration::from_nanos(
                    (span as u64) * 1_000_000_000 / 90_000,
                ))
                .unwrap_or_default()
        };

        // head: last cut point at or before the requested offset
        let head = if seg_idx == 0 && start > measured.segment.start {
            info.random_access_points
                .iter()
                .filter(|rap| rap_time(rap.pts) <= start)
                .map(|rap| rap.cut_offset)
                .next_back()
                .unwrap_or(0)
        } else {
            0
        };

        // tail: first cut point past the window end
        let tail = info
            .random_access_points
            .iter()
            .find(|rap| rap_time(rap.pts) >= window_end)
            .map_or(data.len(), |rap| rap.cut_offset);

        if head < tail {
            out.extend_from_slice(&data[head..tail]);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use bytes::Bytes;
    use chrono::TimeZone;

    use relaymux_core::Conf;

    use super::*;
    use crate::segment_path::SegmentPathTemplate;

    fn conf_in(dir: &Path) -> Conf {
        let record_path = format!("{}/%path/%Y-%m-%d_%H-%M-%S-%f", dir.display());
        let conf = Conf::from_json_value(serde_json::json!({
            "pathDefaults": {"recordPath": record_path},
            "paths": {"p1": {}},
        }))
        .expect("conf");
        conf.validate().expect("valid");
        conf
    }

    fn local(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, h, m, s).single().expect("time")
    }

    /// Write a synthetic 10-second fMP4 segment: ten one-second parts, each
    /// starting with a sync sample.
    fn write_fmp4_segment(path_conf: &PathConf, start: DateTime<Local>) {
        let template =
            SegmentPathTemplate::new(&path_conf.record_path, path_conf.record_format);
        let file = template.encode("p1", start).expect("encode");
        fs::create_dir_all(Path::new(&file).parent().expect("parent")).expect("mkdir");

        let mut data = Vec::new();
        data.extend_from_slice(&fmp4::write_init(&[fmp4::InitTrack {
            id: 1,
            timescale: 90_000,
            audio: false,
        }]));
        for i in 0..10u64 {
            let part = fmp4::write_part(
                &[fmp4::PartTrack {
                    id: 1,
                    base_decode_time: i * 90_000,
                    samples: vec![
                        fmp4::PartSample {
                            duration: 45_000,
                            random_access: true,
                            pts_offset: 0,
                            payload: Bytes::from(vec![1u8; 16]),
                        },
                        fmp4::PartSample {
                            duration: 45_000,
                            random_access: false,
                            pts_offset: 0,
                            payload: Bytes::from(vec![2u8; 16]),
                        },
                    ],
                }],
                i as u32 + 1,
            );
            data.extend_from_slice(&part);
        }
        fs::write(&file, &data).expect("write segment");
    }

    #[test]
    fn test_list_spans_merges_contiguous() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = conf_in(dir.path());
        let path_conf = &conf.paths["p1"];

        // contiguous pair, then a distant third segment
        write_fmp4_segment(path_conf, local(10, 0, 0));
        write_fmp4_segment(path_conf, local(10, 0, 10));
        write_fmp4_segment(path_conf, local(12, 0, 0));

        let spans = list_spans(path_conf, "p1").expect("spans");
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].start, local(10, 0, 0));
        assert!((spans[0].duration - 20.0).abs() < 0.01);
        assert_eq!(spans[1].start, local(12, 0, 0));
    }

    #[test]
    fn test_stitch_single_segment_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = conf_in(dir.path());
        let path_conf = &conf.paths["p1"];
        write_fmp4_segment(path_conf, local(10, 0, 0));

        // 3..7 seconds into the recording
        let out = stitch(
            path_conf,
            "p1",
            local(10, 0, 3),
            Duration::from_secs(4),
        )
        .expect("stitch");

        let parts = fmp4::scan_parts(&out).expect("parts");
        assert_eq!(parts.len(), 4);
        // the first emitted part is rebased to decode time zero
        assert_eq!(parts[0].tracks[0].base_decode_time, 0);
        assert!(parts[0].random_access());
    }

    #[test]
    fn test_stitch_carries_over_contiguous_segments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = conf_in(dir.path());
        let path_conf = &conf.paths["p1"];
        write_fmp4_segment(path_conf, local(10, 0, 0));
        write_fmp4_segment(path_conf, local(10, 0, 10));

        // last 5 s of the first segment + first 5 s of the second
        let out = stitch(
            path_conf,
            "p1",
            local(10, 0, 5),
            Duration::from_secs(10),
        )
        .expect("stitch");

        let parts = fmp4::scan_parts(&out).expect("parts");
        assert_eq!(parts.len(), 10);
        // the timeline is continuous across the segment boundary
        assert_eq!(parts[0].tracks[0].base_decode_time, 0);
        assert_eq!(parts[5].tracks[0].base_decode_time, 5 * 90_000);
    }

    #[test]
    fn test_stitch_stops_at_gap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = conf_in(dir.path());
        let path_conf = &conf.paths["p1"];
        write_fmp4_segment(path_conf, local(10, 0, 0));
        // 50 s gap
        write_fmp4_segment(path_conf, local(10, 1, 0));

        let out = stitch(
            path_conf,
            "p1",
            local(10, 0, 0),
            Duration::from_secs(120),
        )
        .expect("stitch");

        // only the first segment's ten parts are emitted
        let parts = fmp4::scan_parts(&out).expect("parts");
        assert_eq!(parts.len(), 10);
    }

    #[test]
    fn test_stitch_outside_any_recording() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = conf_in(dir.path());
        let path_conf = &conf.paths["p1"];
        write_fmp4_segment(path_conf, local(10, 0, 0));

        let err = stitch(
            path_conf,
            "p1",
            local(11, 0, 0),
            Duration::from_secs(10),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_stitch_rejects_zero_duration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = conf_in(dir.path());
        let err = stitch(
            &conf.paths["p1"],
            "p1",
            local(10, 0, 0),
            Duration::ZERO,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
