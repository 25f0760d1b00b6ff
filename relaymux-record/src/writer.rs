//! On-disk segment writer.
//!
//! Attached as a stream reader while its path is ready and recording is
//! enabled. Rolls to a new file when the configured segment duration has
//! elapsed AND the incoming unit is a random access point, so every segment
//! starts decodable. Disk errors degrade to best-effort: the writer logs,
//! drops the current segment and retries at the next roll.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Local;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relaymux_core::{PathConf, RecordFormat};
use relaymux_stream::adapter::{RecorderFactory, RecorderHandle};
use relaymux_stream::stream::Stream;
use relaymux_stream::unit::{Unit, UnitPayload};

use crate::fmp4;
use crate::mpegts::{self, TsTrack, TsWriter};
use crate::segment_path::SegmentPathTemplate;

/// Target duration of one fMP4 part.
const PART_DURATION: Duration = Duration::from_secs(1);

const UNIT_CHANNEL_CAPACITY: usize = 256;

/// Factory wired into the path manager.
pub struct Recorder;

impl RecorderFactory for Recorder {
    fn start(
        &self,
        path_name: &str,
        conf: &PathConf,
        stream: Arc<Stream>,
    ) -> Box<dyn RecorderHandle> {
        Box::new(RecorderInstance::start(path_name, conf, stream))
    }
}

pub struct RecorderInstance {
    token: CancellationToken,
}

impl RecorderHandle for RecorderInstance {
    fn close(self: Box<Self>) {
        self.token.cancel();
    }
}

struct TrackDesc {
    clock_rate: u32,
    codec: String,
    video: bool,
}

impl RecorderInstance {
    fn start(path_name: &str, conf: &PathConf, stream: Arc<Stream>) -> Self {
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<(usize, Arc<Unit>)>(UNIT_CHANNEL_CAPACITY);

        let mut tracks = Vec::new();
        let mut reader_ids = Vec::new();
        for (media_idx, media) in stream.desc().medias.iter().enumerate() {
            for (format_idx, format) in media.formats.iter().enumerate() {
                let track_idx = tracks.len();
                tracks.push(TrackDesc {
                    clock_rate: format.clock_rate,
                    codec: format.codec.clone(),
                    video: media.kind == relaymux_stream::unit::MediaKind::Video,
                });

                let tx = tx.clone();
                match stream.add_reader(
                    media_idx,
                    format_idx,
                    Box::new(move |unit| {
                        // recording is best-effort: a full queue drops units
                        let _ = tx.try_send((track_idx, unit));
                        Ok(())
                    }),
                ) {
                    Ok(reader) => {
                        stream.start_reader(reader.id);
                        reader_ids.push(reader.id);
                    }
                    Err(e) => {
                        tracing::error!(
                            "recorder for '{}': can not subscribe: {}",
                            path_name,
                            e
                        );
                    }
                }
            }
        }

        let task_token = token.clone();
        let path_name = path_name.to_string();
        let conf = conf.clone();
        tokio::spawn(async move {
            run_recorder(&path_name, &conf, tracks, rx, task_token).await;
            for id in reader_ids {
                stream.remove_reader(id);
            }
        });

        Self { token }
    }
}

async fn run_recorder(
    path_name: &str,
    conf: &PathConf,
    tracks: Vec<TrackDesc>,
    mut rx: mpsc::Receiver<(usize, Arc<Unit>)>,
    token: CancellationToken,
) {
    let template = SegmentPathTemplate::new(&conf.record_path, conf.record_format);
    let mut writer = SegmentWriter::new(
        path_name,
        template,
        conf.record_format,
        conf.record_segment_duration.as_duration(),
        tracks,
    );

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            item = rx.recv() => {
                let Some((track, unit)) = item else { break };
                writer.push(track, &unit);
            }
        }
    }
    writer.finish();
}

struct PendingSample {
    unit: Arc<Unit>,
}

struct TrackState {
    desc: TrackDesc,
    /// Last unit, waiting for its successor to learn its duration.
    queued: Option<PendingSample>,
    /// Completed samples of the current part.
    part: Vec<fmp4::PartSample>,
    /// DTS of the first sample of the current part, in track ticks.
    part_base: Option<u64>,
    /// DTS of the first sample of the segment, in track ticks.
    segment_base: Option<i64>,
    next_decode_time: u64,
}

struct SegmentWriter {
    path_name: String,
    template: SegmentPathTemplate,
    format: RecordFormat,
    segment_duration: Duration,
    tracks: Vec<TrackState>,

    file: Option<std::io::BufWriter<fs::File>>,
    segment_started: Option<Instant>,
    part_started: Option<Instant>,
    part_sequence: u32,
    ts_writer: TsWriter,
    bytes_written: u64,
    degraded: bool,
}

impl SegmentWriter {
    fn new(
        path_name: &str,
        template: SegmentPathTemplate,
        format: RecordFormat,
        segment_duration: Duration,
        tracks: Vec<TrackDesc>,
    ) -> Self {
        let ts_tracks: Vec<TsTrack> = tracks
            .iter()
            .enumerate()
            .map(|(i, t)| TsTrack {
                pid: mpegts::FIRST_ES_PID + i as u16,
                stream_type: match t.codec.as_str() {
                    "H264" => mpegts::stream_type::H264,
                    "H265" => mpegts::stream_type::H265,
                    "AAC" | "MPEG-4 Audio" => mpegts::stream_type::AAC,
                    _ => mpegts::stream_type::PRIVATE,
                },
                video: t.video,
            })
            .collect();

        Self {
            path_name: path_name.to_string(),
            template,
            format,
            segment_duration,
            tracks: tracks
                .into_iter()
                .map(|desc| TrackState {
                    desc,
                    queued: None,
                    part: Vec::new(),
                    part_base: None,
                    segment_base: None,
                    next_decode_time: 0,
                })
                .collect(),
            file: None,
            segment_started: None,
            part_started: None,
            part_sequence: 1,
            ts_writer: TsWriter::new(ts_tracks),
            bytes_written: 0,
            degraded: false,
        }
    }

    fn push(&mut self, track: usize, unit: &Arc<Unit>) {
        if track >= self.tracks.len() {
            return;
        }

        let leading_video = self.tracks[track].desc.video || !self.has_video();
        let roll_due = self
            .segment_started
            .is_some_and(|s| s.elapsed() >= self.segment_duration);

        if self.file.is_none() || (roll_due && unit.random_access && leading_video) {
            self.roll_segment(unit.random_access || !self.has_video());
            if self.file.is_none() {
                return;
            }
        }

        match self.format {
            RecordFormat::Fmp4 => self.push_fmp4(track, unit, leading_video),
            RecordFormat::Mpegts => self.push_mpegts(track, unit),
        }
    }

    fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.desc.video)
    }

    /// A segment only opens on a random access point, so readers can always
    /// decode from its first unit.
    fn roll_segment(&mut self, can_open: bool) {
        self.flush_part();
        self.finish_file();
        if !can_open {
            return;
        }

        let start = Local::now();
        let file_path = match self.template.encode(&self.path_name, start) {
            Ok(p) => p,
            Err(e) => {
                self.degrade(&format!("invalid record path: {e}"));
                return;
            }
        };

        if let Some(parent) = Path::new(&file_path).parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                self.degrade(&format!("can not create '{}': {e}", parent.display()));
                return;
            }
        }

        match fs::File::create(&file_path) {
            Ok(file) => {
                tracing::info!("recorder '{}': opened segment {file_path}", self.path_name);
                self.file = Some(std::io::BufWriter::new(file));
                self.segment_started = Some(Instant::now());
                self.part_started = None;
                self.degraded = false;
                for t in &mut self.tracks {
                    t.segment_base = None;
                    t.part_base = None;
                    t.next_decode_time = 0;
                }
                self.write_segment_header();
            }
            Err(e) => {
                self.degrade(&format!("can not create '{file_path}': {e}"));
            }
        }
    }

    fn write_segment_header(&mut self) {
        match self.format {
            RecordFormat::Fmp4 => {
                let init_tracks: Vec<fmp4::InitTrack> = self
                    .tracks
                    .iter()
                    .enumerate()
                    .map(|(i, t)| fmp4::InitTrack {
                        id: i as u32 + 1,
                        timescale: t.desc.clock_rate,
                        audio: !t.desc.video,
                    })
                    .collect();
                let init = fmp4::write_init(&init_tracks);
                self.write_bytes(&init);
            }
            RecordFormat::Mpegts => {
                let mut out = BytesMut::new();
                self.ts_writer.write_pat(&mut out);
                self.ts_writer.write_pmt(&mut out);
                self.write_bytes(&out);
            }
        }
    }

    fn push_fmp4(&mut self, track: usize, unit: &Arc<Unit>, leading_video: bool) {
        // a video RAP closes the current part before starting the next one
        let part_due = (unit.random_access && leading_video)
            || self
                .part_started
                .is_some_and(|s| s.elapsed() >= PART_DURATION);
        if part_due && self.tracks.iter().any(|t| !t.part.is_empty()) {
            self.flush_part();
        }
        if self.part_started.is_none() {
            self.part_started = Some(Instant::now());
        }

        let state = &mut self.tracks[track];
        if state.segment_base.is_none() {
            state.segment_base = Some(unit.dts_or_pts());
        }

        // the previous unit's duration is the DTS delta to this one
        if let Some(pending) = state.queued.take() {
            let delta = unit.dts_or_pts() - pending.unit.dts_or_pts();
            let duration = u32::try_from(delta.max(0)).unwrap_or(0);
            let sample = make_sample(&pending.unit, duration);
            if state.part_base.is_none() {
                state.part_base = Some(state.next_decode_time);
            }
            state.next_decode_time += u64::from(duration);
            state.part.push(sample);
        }
        state.queued = Some(PendingSample { unit: unit.clone() });
    }

    fn push_mpegts(&mut self, track: usize, unit: &Arc<Unit>) {
        let state = &mut self.tracks[track];
        if state.segment_base.is_none() {
            state.segment_base = Some(unit.dts_or_pts());
        }
        let clock_rate = i64::from(state.desc.clock_rate.max(1));
        let pts = unit.pts * 90_000 / clock_rate;
        let dts = unit.dts_or_pts() * 90_000 / clock_rate;
        let payload = payload_bytes(&unit.payload);
        let ts_track = self.ts_writer.tracks()[track];

        let mut out = BytesMut::new();
        if unit.random_access && self.segment_started.is_some() {
            // repeat tables in front of every RAP so segments can be cut there
            self.ts_writer.write_pat(&mut out);
            self.ts_writer.write_pmt(&mut out);
        }
        self.ts_writer
            .write_pes(&mut out, ts_track, pts, dts, &payload, unit.random_access);
        self.write_bytes(&out);
    }

    fn flush_part(&mut self) {
        if self.format != RecordFormat::Fmp4 {
            return;
        }
        let mut part_tracks = Vec::new();
        for (i, state) in self.tracks.iter_mut().enumerate() {
            if state.part.is_empty() {
                continue;
            }
            part_tracks.push(fmp4::PartTrack {
                id: i as u32 + 1,
                base_decode_time: state.part_base.take().unwrap_or(0),
                samples: std::mem::take(&mut state.part),
            });
        }
        if part_tracks.is_empty() {
            return;
        }
        let part = fmp4::write_part(&part_tracks, self.part_sequence);
        self.part_sequence += 1;
        self.part_started = None;
        self.write_bytes(&part);
    }

    fn write_bytes(&mut self, data: &[u8]) {
        if let Some(file) = &mut self.file {
            match file.write_all(data) {
                Ok(()) => {
                    self.bytes_written += data.len() as u64;
                }
                Err(e) => {
                    self.degrade(&format!("write failed: {e}"));
                }
            }
        }
    }

    fn degrade(&mut self, reason: &str) {
        if !self.degraded {
            tracing::error!("recorder '{}': {reason}", self.path_name);
            self.degraded = true;
        }
        self.file = None;
        self.segment_started = None;
    }

    fn finish_file(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                tracing::error!("recorder '{}': flush failed: {e}", self.path_name);
            }
        }
        self.segment_started = None;
    }

    fn finish(&mut self) {
        // the trailing queued sample of each track gets a zero duration
        for state in &mut self.tracks {
            if let Some(pending) = state.queued.take() {
                if state.part_base.is_none() {
                    state.part_base = Some(state.next_decode_time);
                }
                state.part.push(make_sample(&pending.unit, 0));
            }
        }
        self.flush_part();
        self.finish_file();
        tracing::info!(
            "recorder '{}': closed, {} bytes written",
            self.path_name,
            self.bytes_written
        );
    }
}

fn make_sample(unit: &Arc<Unit>, duration: u32) -> fmp4::PartSample {
    let pts_offset = i32::try_from(unit.pts - unit.dts_or_pts()).unwrap_or(0);
    fmp4::PartSample {
        duration,
        random_access: unit.random_access,
        pts_offset,
        payload: payload_bytes(&unit.payload),
    }
}

/// Flatten a payload for storage: NALU lists become length-prefixed, other
/// payloads are written as-is.
fn payload_bytes(payload: &UnitPayload) -> Bytes {
    match payload {
        UnitPayload::H264 { nalus } | UnitPayload::H265 { nalus } => {
            let total: usize = nalus.iter().map(|n| n.len() + 4).sum();
            let mut out = BytesMut::with_capacity(total);
            for nalu in nalus {
                out.put_u32(nalu.len() as u32);
                out.put_slice(nalu);
            }
            out.freeze()
        }
        UnitPayload::Opus { frame } => frame.clone(),
        UnitPayload::Aac { au } => au.clone(),
        UnitPayload::MpegtsPes { data } | UnitPayload::Generic { data } => data.clone(),
        UnitPayload::Rtp { packet } => packet.clone(),
    }
}
