//! Minimal fragmented-MP4 segment container.
//!
//! Segments are written as an init section (ftyp + moov with one trex per
//! track) followed by parts (moof + mdat). Each part starts at a random
//! access point for its leading track. The reader side recovers track
//! timescales, part boundaries, decode times and durations; that is all the
//! playback stitcher needs.
//!
//! Codec configuration records are intentionally not produced here; sample
//! entries carry the codec four-cc only.

use bytes::{BufMut, Bytes, BytesMut};

use relaymux_core::{Error, Result};

// trun sample flags
const SAMPLE_FLAG_SYNC: u32 = 0x0200_0000;
const SAMPLE_FLAG_NON_SYNC: u32 = 0x0101_0000;

/// One track as declared in the init section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitTrack {
    pub id: u32,
    pub timescale: u32,
    pub audio: bool,
}

/// One sample inside a part.
#[derive(Debug, Clone)]
pub struct PartSample {
    /// In track timescale units.
    pub duration: u32,
    pub random_access: bool,
    /// PTS minus DTS, in track timescale units.
    pub pts_offset: i32,
    pub payload: Bytes,
}

/// Samples of one track inside a part.
#[derive(Debug, Clone)]
pub struct PartTrack {
    pub id: u32,
    /// DTS of the first sample, in track timescale units.
    pub base_decode_time: u64,
    pub samples: Vec<PartSample>,
}

fn begin_box(buf: &mut BytesMut, name: &[u8; 4]) -> usize {
    let offset = buf.len();
    buf.put_u32(0);
    buf.put_slice(name);
    offset
}

fn end_box(buf: &mut BytesMut, offset: usize) {
    let size = (buf.len() - offset) as u32;
    buf[offset..offset + 4].copy_from_slice(&size.to_be_bytes());
}

fn full_box(buf: &mut BytesMut, version: u8, flags: u32) {
    buf.put_u32((u32::from(version) << 24) | (flags & 0x00ff_ffff));
}

/// Serialize the init section: ftyp plus moov.
#[must_use]
pub fn write_init(tracks: &[InitTrack]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1024);

    let ftyp = begin_box(&mut buf, b"ftyp");
    buf.put_slice(b"iso4");
    buf.put_u32(512);
    buf.put_slice(b"iso4");
    buf.put_slice(b"mp41");
    end_box(&mut buf, ftyp);

    let moov = begin_box(&mut buf, b"moov");

    let mvhd = begin_box(&mut buf, b"mvhd");
    full_box(&mut buf, 0, 0);
    buf.put_u32(0); // creation time
    buf.put_u32(0); // modification time
    buf.put_u32(1000); // timescale
    buf.put_u32(0); // duration, unknown for live recordings
    buf.put_u32(0x0001_0000); // rate 1.0
    buf.put_u16(0x0100); // volume 1.0
    buf.put_u16(0);
    buf.put_u64(0);
    for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        buf.put_u32(v);
    }
    for _ in 0..6 {
        buf.put_u32(0); // pre-defined
    }
    let next_track_id = tracks.iter().map(|t| t.id).max().unwrap_or(0) + 1;
    buf.put_u32(next_track_id);
    end_box(&mut buf, mvhd);

    for track in tracks {
        write_trak(&mut buf, track);
    }

    let mvex = begin_box(&mut buf, b"mvex");
    for track in tracks {
        let trex = begin_box(&mut buf, b"trex");
        full_box(&mut buf, 0, 0);
        buf.put_u32(track.id);
        buf.put_u32(1); // default sample description index
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0);
        end_box(&mut buf, trex);
    }
    end_box(&mut buf, mvex);

    end_box(&mut buf, moov);
    buf.freeze()
}

fn write_trak(buf: &mut BytesMut, track: &InitTrack) {
    let trak = begin_box(buf, b"trak");

    let tkhd = begin_box(buf, b"tkhd");
    full_box(buf, 0, 3); // enabled + in movie
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(track.id);
    buf.put_u32(0);
    buf.put_u32(0); // duration
    buf.put_u64(0);
    buf.put_u16(0); // layer
    buf.put_u16(0); // alternate group
    buf.put_u16(if track.audio { 0x0100 } else { 0 }); // volume
    buf.put_u16(0);
    for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        buf.put_u32(v);
    }
    buf.put_u32(0); // width
    buf.put_u32(0); // height
    end_box(buf, tkhd);

    let mdia = begin_box(buf, b"mdia");

    let mdhd = begin_box(buf, b"mdhd");
    full_box(buf, 0, 0);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(track.timescale);
    buf.put_u32(0); // duration
    buf.put_u16(0x55c4); // language: und
    buf.put_u16(0);
    end_box(buf, mdhd);

    let hdlr = begin_box(buf, b"hdlr");
    full_box(buf, 0, 0);
    buf.put_u32(0);
    buf.put_slice(if track.audio { b"soun" } else { b"vide" });
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u8(0); // empty name
    end_box(buf, hdlr);

    let minf = begin_box(buf, b"minf");
    let stbl = begin_box(buf, b"stbl");
    for name in [b"stsd", b"stts", b"stsc", b"stsz", b"stco"] {
        let b = begin_box(buf, name);
        full_box(buf, 0, 0);
        if name == b"stsz" {
            buf.put_u32(0); // sample size
        }
        buf.put_u32(0); // entry count
        end_box(buf, b);
    }
    end_box(buf, stbl);
    end_box(buf, minf);

    end_box(buf, mdia);
    end_box(buf, trak);
}

/// Serialize one part: moof plus mdat, with correct trun data offsets.
#[must_use]
pub fn write_part(tracks: &[PartTrack], sequence_number: u32) -> Bytes {
    let mut moof = BytesMut::with_capacity(512);
    let mut data_offset_positions = Vec::with_capacity(tracks.len());

    let moof_box = begin_box(&mut moof, b"moof");

    let mfhd = begin_box(&mut moof, b"mfhd");
    full_box(&mut moof, 0, 0);
    moof.put_u32(sequence_number);
    end_box(&mut moof, mfhd);

    for track in tracks {
        let traf = begin_box(&mut moof, b"traf");

        let tfhd = begin_box(&mut moof, b"tfhd");
        full_box(&mut moof, 0, 0x0002_0000); // default-base-is-moof
        moof.put_u32(track.id);
        end_box(&mut moof, tfhd);

        let tfdt = begin_box(&mut moof, b"tfdt");
        full_box(&mut moof, 1, 0);
        moof.put_u64(track.base_decode_time);
        end_box(&mut moof, tfdt);

        let trun = begin_box(&mut moof, b"trun");
        // data offset + duration + size + flags + composition offsets
        full_box(&mut moof, 1, 0x0001 | 0x0100 | 0x0200 | 0x0400 | 0x0800);
        moof.put_u32(track.samples.len() as u32);
        data_offset_positions.push(moof.len());
        moof.put_u32(0); // patched below
        for sample in &track.samples {
            moof.put_u32(sample.duration);
            moof.put_u32(sample.payload.len() as u32);
            moof.put_u32(if sample.random_access {
                SAMPLE_FLAG_SYNC
            } else {
                SAMPLE_FLAG_NON_SYNC
            });
            moof.put_i32(sample.pts_offset);
        }
        end_box(&mut moof, trun);

        end_box(&mut moof, traf);
    }
    end_box(&mut moof, moof_box);

    // mdat payload offsets are relative to the start of moof
    let mut mdat_payload_len = 0usize;
    for (i, track) in tracks.iter().enumerate() {
        let offset = (moof.len() + 8 + mdat_payload_len) as u32;
        let pos = data_offset_positions[i];
        moof[pos..pos + 4].copy_from_slice(&offset.to_be_bytes());
        mdat_payload_len += track
            .samples
            .iter()
            .map(|s| s.payload.len())
            .sum::<usize>();
    }

    let mut out = BytesMut::with_capacity(moof.len() + 8 + mdat_payload_len);
    out.put_slice(&moof);
    out.put_u32((8 + mdat_payload_len) as u32);
    out.put_slice(b"mdat");
    for track in tracks {
        for sample in &track.samples {
            out.put_slice(&sample.payload);
        }
    }
    out.freeze()
}

// ---------------------------------------------------------------------------
// reading
// ---------------------------------------------------------------------------

/// Track of a parsed part.
#[derive(Debug, Clone)]
pub struct ParsedPartTrack {
    pub id: u32,
    pub base_decode_time: u64,
    /// Absolute file offset of the 8-byte tfdt value, for timeline rebasing.
    pub tfdt_value_offset: usize,
    /// Sum of sample durations, in track timescale units.
    pub duration: u64,
    /// First sample is a sync sample.
    pub random_access: bool,
}

/// One moof+mdat pair.
#[derive(Debug, Clone)]
pub struct ParsedPart {
    pub offset: usize,
    pub end: usize,
    pub tracks: Vec<ParsedPartTrack>,
}

impl ParsedPart {
    #[must_use]
    pub fn random_access(&self) -> bool {
        self.tracks.first().is_some_and(|t| t.random_access)
    }
}

fn box_at(data: &[u8], offset: usize) -> Result<(&[u8; 4], usize, usize)> {
    if offset + 8 > data.len() {
        return Err(Error::Transport("truncated box header".to_string()));
    }
    let size = u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]) as usize;
    let name: &[u8; 4] = data[offset + 4..offset + 8]
        .try_into()
        .map_err(|_| Error::Transport("truncated box name".to_string()))?;
    if size < 8 || offset + size > data.len() {
        return Err(Error::Transport(format!(
            "invalid box size {size} at offset {offset}"
        )));
    }
    Ok((name, offset + 8, offset + size))
}

/// Byte length of the init section (everything before the first moof).
pub fn init_section_len(data: &[u8]) -> Result<usize> {
    let mut offset = 0;
    while offset < data.len() {
        let (name, _, end) = box_at(data, offset)?;
        if name == b"moof" {
            return Ok(offset);
        }
        offset = end;
    }
    Ok(data.len())
}

/// Track id → timescale, recovered from moov.
pub fn parse_init(data: &[u8]) -> Result<Vec<InitTrack>> {
    let mut tracks = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let (name, body, end) = box_at(data, offset)?;
        if name == b"moov" {
            let mut inner = body;
            while inner < end {
                let (iname, ibody, iend) = box_at(data, inner)?;
                if iname == b"trak" {
                    tracks.push(parse_trak(data, ibody, iend)?);
                }
                inner = iend;
            }
            return Ok(tracks);
        }
        offset = end;
    }
    Err(Error::Transport("init section has no moov".to_string()))
}

fn parse_trak(data: &[u8], body: usize, end: usize) -> Result<InitTrack> {
    let mut id = None;
    let mut timescale = None;
    let mut audio = false;

    let mut offset = body;
    while offset < end {
        let (name, ibody, iend) = box_at(data, offset)?;
        match name {
            b"tkhd" => {
                // version(1) flags(3) creation(4) modification(4) id(4)
                let pos = ibody + 12;
                if pos + 4 > iend {
                    return Err(Error::Transport("truncated tkhd".to_string()));
                }
                id = Some(u32::from_be_bytes([
                    data[pos],
                    data[pos + 1],
                    data[pos + 2],
                    data[pos + 3],
                ]));
            }
            b"mdia" => {
                let mut inner = ibody;
                while inner < iend {
                    let (mname, mbody, mend) = box_at(data, inner)?;
                    match mname {
                        b"mdhd" => {
                            let pos = mbody + 12;
                            if pos + 4 > mend {
                                return Err(Error::Transport("truncated mdhd".to_string()));
                            }
                            timescale = Some(u32::from_be_bytes([
                                data[pos],
                                data[pos + 1],
                                data[pos + 2],
                                data[pos + 3],
                            ]));
                        }
                        b"hdlr" => {
                            let pos = mbody + 8;
                            if pos + 4 <= mend {
                                audio = &data[pos..pos + 4] == b"soun";
                            }
                        }
                        _ => {}
                    }
                    inner = mend;
                }
            }
            _ => {}
        }
        offset = iend;
    }

    Ok(InitTrack {
        id: id.ok_or_else(|| Error::Transport("trak without tkhd".to_string()))?,
        timescale: timescale
            .ok_or_else(|| Error::Transport("trak without mdhd".to_string()))?,
        audio,
    })
}

/// Scan every moof+mdat pair of a segment.
pub fn scan_parts(data: &[u8]) -> Result<Vec<ParsedPart>> {
    let mut parts = Vec::new();
    let mut offset = init_section_len(data)?;

    while offset < data.len() {
        let (name, body, end) = box_at(data, offset)?;
        if name != b"moof" {
            offset = end;
            continue;
        }

        let mut tracks = Vec::new();
        let mut inner = body;
        while inner < end {
            let (iname, ibody, iend) = box_at(data, inner)?;
            if iname == b"traf" {
                tracks.push(parse_traf(data, ibody, iend)?);
            }
            inner = iend;
        }

        // the following box must be the part's mdat
        let part_end = if end < data.len() {
            let (mname, _, mend) = box_at(data, end)?;
            if mname == b"mdat" {
                mend
            } else {
                end
            }
        } else {
            end
        };

        parts.push(ParsedPart {
            offset,
            end: part_end,
            tracks,
        });
        offset = part_end;
    }
    Ok(parts)
}

fn parse_traf(data: &[u8], body: usize, end: usize) -> Result<ParsedPartTrack> {
    let mut id = None;
    let mut base_decode_time = 0u64;
    let mut tfdt_value_offset = 0usize;
    let mut duration = 0u64;
    let mut random_access = false;

    let mut offset = body;
    while offset < end {
        let (name, ibody, iend) = box_at(data, offset)?;
        match name {
            b"tfhd" => {
                let pos = ibody + 4;
                if pos + 4 > iend {
                    return Err(Error::Transport("truncated tfhd".to_string()));
                }
                id = Some(u32::from_be_bytes([
                    data[pos],
                    data[pos + 1],
                    data[pos + 2],
                    data[pos + 3],
                ]));
            }
            b"tfdt" => {
                let version = data[ibody];
                if version == 1 {
                    let pos = ibody + 4;
                    if pos + 8 > iend {
                        return Err(Error::Transport("truncated tfdt".to_string()));
                    }
                    tfdt_value_offset = pos;
                    base_decode_time = u64::from_be_bytes(
                        data[pos..pos + 8]
                            .try_into()
                            .map_err(|_| Error::Transport("truncated tfdt".to_string()))?,
                    );
                } else {
                    let pos = ibody + 4;
                    if pos + 4 > iend {
                        return Err(Error::Transport("truncated tfdt".to_string()));
                    }
                    tfdt_value_offset = pos;
                    base_decode_time = u64::from(u32::from_be_bytes([
                        data[pos],
                        data[pos + 1],
                        data[pos + 2],
                        data[pos + 3],
                    ]));
                }
            }
            b"trun" => {
                let (dur, ra) = parse_trun(data, ibody, iend)?;
                duration += dur;
                random_access = random_access || ra;
            }
            _ => {}
        }
        offset = iend;
    }

    Ok(ParsedPartTrack {
        id: id.ok_or_else(|| Error::Transport("traf without tfhd".to_string()))?,
        base_decode_time,
        tfdt_value_offset,
        duration,
        random_access,
    })
}

fn parse_trun(data: &[u8], body: usize, end: usize) -> Result<(u64, bool)> {
    if body + 8 > end {
        return Err(Error::Transport("truncated trun".to_string()));
    }
    let flags = u32::from_be_bytes([0, data[body + 1], data[body + 2], data[body + 3]]);
    let sample_count = u32::from_be_bytes([
        data[body + 4],
        data[body + 5],
        data[body + 6],
        data[body + 7],
    ]);

    let mut pos = body + 8;
    if flags & 0x0001 != 0 {
        pos += 4; // data offset
    }
    if flags & 0x0004 != 0 {
        pos += 4; // first sample flags
    }

    let per_sample = [
        (0x0100u32, 4usize), // duration
        (0x0200, 4),         // size
        (0x0400, 4),         // flags
        (0x0800, 4),         // composition offset
    ];

    let mut duration = 0u64;
    let mut first_flags = None;

    for i in 0..sample_count {
        for (bit, width) in per_sample {
            if flags & bit == 0 {
                continue;
            }
            if pos + width > end {
                return Err(Error::Transport("truncated trun entry".to_string()));
            }
            let value = u32::from_be_bytes([
                data[pos],
                data[pos + 1],
                data[pos + 2],
                data[pos + 3],
            ]);
            match bit {
                0x0100 => duration += u64::from(value),
                0x0400 if i == 0 => first_flags = Some(value),
                _ => {}
            }
            pos += width;
        }
    }

    let random_access = first_flags.is_some_and(|f| f & 0x0001_0000 == 0);
    Ok((duration, random_access))
}

/// Duration of a whole segment: the longest per-track duration sum.
pub fn segment_duration(data: &[u8]) -> Result<std::time::Duration> {
    let tracks = parse_init(data)?;
    let parts = scan_parts(data)?;

    let mut best = std::time::Duration::ZERO;
    for track in &tracks {
        let ticks: u64 = parts
            .iter()
            .flat_map(|p| &p.tracks)
            .filter(|t| t.id == track.id)
            .map(|t| t.duration)
            .sum();
        if track.timescale > 0 {
            let nanos = u128::from(ticks) * 1_000_000_000 / u128::from(track.timescale);
            let d = std::time::Duration::from_nanos(nanos as u64);
            best = best.max(d);
        }
    }
    Ok(best)
}

/// Shift a copied part's tfdt fields by per-track signed deltas, rebasing
/// its timeline onto a playback window. `buf` starts at the part's original
/// file offset.
pub fn rebase_part(buf: &mut [u8], part: &ParsedPart, deltas: &[(u32, i64)]) {
    for track in &part.tracks {
        let Some((_, delta)) = deltas.iter().find(|(id, _)| *id == track.id) else {
            continue;
        };
        let rel = track.tfdt_value_offset - part.offset;
        if rel + 8 <= buf.len() {
            let rebased = (track.base_decode_time as i64 - delta).max(0) as u64;
            buf[rel..rel + 8].copy_from_slice(&rebased.to_be_bytes());
        }
    }
}
