//! Minimal MPEG-TS segment container.
//!
//! The writer produces 188-byte packets: PAT and PMT are repeated in front
//! of every random access point so a segment can be cut at any RAP and stay
//! decodable. The reader recovers duration (first/last PTS) and the cut
//! points the playback stitcher needs.

use bytes::{BufMut, Bytes, BytesMut};

use relaymux_core::{Error, Result};

pub const TS_PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;

const PAT_PID: u16 = 0;
const PMT_PID: u16 = 0x1000;
/// First elementary stream PID; tracks get consecutive PIDs from here.
pub const FIRST_ES_PID: u16 = 0x0100;

const PTS_MAX: i64 = 1 << 33;

/// MPEG stream types.
pub mod stream_type {
    pub const H264: u8 = 0x1B;
    pub const H265: u8 = 0x24;
    pub const AAC: u8 = 0x0F;
    pub const PRIVATE: u8 = 0x06;
}

/// One elementary stream of a TS mux.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsTrack {
    pub pid: u16,
    pub stream_type: u8,
    pub video: bool,
}

/// MPEG-2 CRC32 (poly 0x04C11DB7, no reflection).
fn crc32_mpeg(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte) << 24;
        for _ in 0..8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04C1_1DB7;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Stateful packetizer; owns per-PID continuity counters.
pub struct TsWriter {
    tracks: Vec<TsTrack>,
    continuity: std::collections::HashMap<u16, u8>,
}

impl TsWriter {
    #[must_use]
    pub fn new(tracks: Vec<TsTrack>) -> Self {
        Self {
            tracks,
            continuity: std::collections::HashMap::new(),
        }
    }

    #[must_use]
    pub fn tracks(&self) -> &[TsTrack] {
        &self.tracks
    }

    fn next_continuity(&mut self, pid: u16) -> u8 {
        let counter = self.continuity.entry(pid).or_insert(0);
        let value = *counter;
        *counter = (value + 1) & 0x0F;
        value
    }

    fn psi_packet(&mut self, pid: u16, table: &[u8]) -> Bytes {
        let mut pkt = BytesMut::with_capacity(TS_PACKET_SIZE);
        pkt.put_u8(SYNC_BYTE);
        pkt.put_u16(0x4000 | (pid & 0x1FFF)); // payload unit start
        pkt.put_u8(0x10 | self.next_continuity(pid)); // payload only
        pkt.put_u8(0); // pointer field
        pkt.put_slice(table);
        while pkt.len() < TS_PACKET_SIZE {
            pkt.put_u8(0xFF);
        }
        pkt.freeze()
    }

    /// Program association table: one program pointing at the PMT.
    pub fn write_pat(&mut self, out: &mut BytesMut) {
        let mut section = BytesMut::new();
        section.put_u8(0x00); // table id
        // section syntax + length (9 bytes after length + 4 CRC)
        section.put_u16(0xB000 | 13);
        section.put_u16(1); // transport stream id
        section.put_u8(0xC1); // version 0, current
        section.put_u8(0); // section number
        section.put_u8(0); // last section number
        section.put_u16(1); // program number
        section.put_u16(0xE000 | PMT_PID);
        let crc = crc32_mpeg(&section);
        section.put_u32(crc);

        out.put_slice(&self.psi_packet(PAT_PID, &section));
    }

    /// Program map table listing every elementary stream.
    pub fn write_pmt(&mut self, out: &mut BytesMut) {
        let pcr_pid = self
            .tracks
            .iter()
            .find(|t| t.video)
            .or(self.tracks.first())
            .map_or(0x1FFF, |t| t.pid);

        let mut section = BytesMut::new();
        section.put_u8(0x02); // table id
        let section_length = 13 + self.tracks.len() * 5;
        section.put_u16(0xB000 | section_length as u16);
        section.put_u16(1); // program number
        section.put_u8(0xC1);
        section.put_u8(0);
        section.put_u8(0);
        section.put_u16(0xE000 | pcr_pid);
        section.put_u16(0xF000); // program info length 0
        for track in &self.tracks {
            section.put_u8(track.stream_type);
            section.put_u16(0xE000 | track.pid);
            section.put_u16(0xF000); // ES info length 0
        }
        let crc = crc32_mpeg(&section);
        section.put_u32(crc);

        out.put_slice(&self.psi_packet(PMT_PID, &section));
    }

    /// Packetize one access unit as a PES packet. Sets the random access
    /// indicator (and a PCR, for video) on the first packet of a RAP.
    pub fn write_pes(
        &mut self,
        out: &mut BytesMut,
        track: TsTrack,
        pts: i64,
        dts: i64,
        payload: &[u8],
        random_access: bool,
    ) {
        let pes_header = build_pes_header(track, pts, dts, payload.len());

        let mut data = BytesMut::with_capacity(pes_header.len() + payload.len());
        data.put_slice(&pes_header);
        data.put_slice(payload);
        let mut remaining = &data[..];

        let mut first = true;
        while !remaining.is_empty() || first {
            let flags_needed = first && random_access;
            let with_pcr = flags_needed && track.video;
            let body = if flags_needed { 1 + usize::from(with_pcr) * 6 } else { 0 };

            // 184 bytes after the 4-byte header; an adaptation field costs
            // one length byte plus its body, and absorbs any stuffing
            let mut adaptation = flags_needed;
            let mut af_len = body;
            let mut payload_space = 184 - if adaptation { 1 + af_len } else { 0 };
            if remaining.len() < payload_space {
                if adaptation {
                    af_len += payload_space - remaining.len();
                } else {
                    adaptation = true;
                    af_len = 183 - remaining.len();
                }
                payload_space = remaining.len();
            }

            let mut pkt = BytesMut::with_capacity(TS_PACKET_SIZE);
            pkt.put_u8(SYNC_BYTE);
            let pusi = if first { 0x4000 } else { 0 };
            pkt.put_u16(pusi | (track.pid & 0x1FFF));
            pkt.put_u8(
                (if adaptation { 0x30 } else { 0x10 }) | self.next_continuity(track.pid),
            );

            if adaptation {
                pkt.put_u8(af_len as u8);
                if af_len > 0 {
                    let flags: u8 = if with_pcr {
                        0x50 // RAI + PCR
                    } else if flags_needed {
                        0x40 // RAI
                    } else {
                        0x00
                    };
                    pkt.put_u8(flags);
                    if with_pcr {
                        let pcr_base = dts.rem_euclid(PTS_MAX) as u64;
                        pkt.put_u32((pcr_base >> 1) as u32);
                        pkt.put_u16((((pcr_base & 1) as u16) << 15) | 0x7E00);
                    }
                    for _ in 0..af_len - 1 - usize::from(with_pcr) * 6 {
                        pkt.put_u8(0xFF);
                    }
                }
            }

            pkt.put_slice(&remaining[..payload_space]);
            remaining = &remaining[payload_space..];
            debug_assert_eq!(pkt.len(), TS_PACKET_SIZE);
            out.put_slice(&pkt);
            first = false;
        }
    }
}

fn build_pes_header(track: TsTrack, pts: i64, dts: i64, payload_len: usize) -> Bytes {
    let stream_id: u8 = if track.video { 0xE0 } else { 0xC0 };
    let with_dts = dts != pts;
    let header_data_len: usize = if with_dts { 10 } else { 5 };

    let mut header = BytesMut::with_capacity(9 + header_data_len);
    header.put_u8(0);
    header.put_u8(0);
    header.put_u8(1);
    header.put_u8(stream_id);

    let pes_len = 3 + header_data_len + payload_len;
    // video PES may exceed the 16-bit length field; zero means unbounded
    header.put_u16(u16::try_from(pes_len).unwrap_or(0));

    header.put_u8(0x80); // marker
    header.put_u8(if with_dts { 0xC0 } else { 0x80 });
    header.put_u8(header_data_len as u8);

    put_timestamp(&mut header, if with_dts { 0x30 } else { 0x20 }, pts);
    if with_dts {
        put_timestamp(&mut header, 0x10, dts);
    }
    header.freeze()
}

fn put_timestamp(buf: &mut BytesMut, prefix: u8, ts: i64) {
    let ts = ts.rem_euclid(PTS_MAX) as u64;
    buf.put_u8(prefix | (((ts >> 30) as u8) << 1) | 1);
    buf.put_u16((((ts >> 15) as u16 & 0x7FFF) << 1) | 1);
    buf.put_u16((((ts as u16) & 0x7FFF) << 1) | 1);
}

// ---------------------------------------------------------------------------
// reading
// ---------------------------------------------------------------------------

/// One random access point inside a TS segment.
#[derive(Debug, Clone, Copy)]
pub struct TsRandomAccessPoint {
    /// Byte offset of the PAT packet preceding the RAP; the segment stays
    /// decodable when cut here.
    pub cut_offset: usize,
    pub pts: i64,
}

/// Everything the stitcher needs from one TS segment.
#[derive(Debug, Clone)]
pub struct TsSegmentInfo {
    pub first_pts: Option<i64>,
    pub last_pts: Option<i64>,
    pub random_access_points: Vec<TsRandomAccessPoint>,
}

impl TsSegmentInfo {
    /// 90 kHz PTS span, wrap-aware.
    #[must_use]
    pub fn duration(&self) -> std::time::Duration {
        match (self.first_pts, self.last_pts) {
            (Some(first), Some(last)) => {
                let mut span = last - first;
                if span < 0 {
                    span += PTS_MAX;
                }
                std::time::Duration::from_nanos((span as u64) * 1_000_000_000 / 90_000)
            }
            _ => std::time::Duration::ZERO,
        }
    }
}

/// Scan a TS segment: PTS bounds and cut points.
pub fn scan_segment(data: &[u8]) -> Result<TsSegmentInfo> {
    if data.len() % TS_PACKET_SIZE != 0 {
        return Err(Error::Transport(
            "TS segment is not packet-aligned".to_string(),
        ));
    }

    let mut info = TsSegmentInfo {
        first_pts: None,
        last_pts: None,
        random_access_points: Vec::new(),
    };
    let mut last_pat_offset = 0usize;

    for offset in (0..data.len()).step_by(TS_PACKET_SIZE) {
        let pkt = &data[offset..offset + TS_PACKET_SIZE];
        if pkt[0] != SYNC_BYTE {
            return Err(Error::Transport(format!(
                "lost TS sync at offset {offset}"
            )));
        }
        let pusi = pkt[1] & 0x40 != 0;
        let pid = (u16::from(pkt[1] & 0x1F) << 8) | u16::from(pkt[2]);
        let has_adaptation = pkt[3] & 0x20 != 0;
        let has_payload = pkt[3] & 0x10 != 0;

        if pid == PAT_PID {
            last_pat_offset = offset;
            continue;
        }

        let mut pos = 4;
        let mut rai = false;
        if has_adaptation {
            let len = pkt[4] as usize;
            if len > 0 && pos + 1 < TS_PACKET_SIZE {
                rai = pkt[5] & 0x40 != 0;
            }
            pos += 1 + len;
        }
        if !has_payload || !pusi || pos + 14 > TS_PACKET_SIZE {
            continue;
        }

        // PES start code
        if pkt[pos] != 0 || pkt[pos + 1] != 0 || pkt[pos + 2] != 1 {
            continue;
        }
        let pts_dts_flags = pkt[pos + 7] >> 6;
        if pts_dts_flags & 0x2 == 0 {
            continue;
        }
        let ts_bytes = &pkt[pos + 9..pos + 14];
        let pts = (i64::from(ts_bytes[0] >> 1 & 0x07) << 30)
            | (i64::from(ts_bytes[1]) << 22)
            | (i64::from(ts_bytes[2] >> 1) << 15)
            | (i64::from(ts_bytes[3]) << 7)
            | i64::from(ts_bytes[4] >> 1);

        if info.first_pts.is_none() {
            info.first_pts = Some(pts);
        }
        info.last_pts = Some(pts);

        if rai {
            info.random_access_points.push(TsRandomAccessPoint {
                cut_offset: last_pat_offset,
                pts,
            });
        }
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video() -> TsTrack {
        TsTrack {
            pid: FIRST_ES_PID,
            stream_type: stream_type::H264,
            video: true,
        }
    }

    fn write_gop(writer: &mut TsWriter, out: &mut BytesMut, base_pts: i64, frames: usize) {
        writer.write_pat(out);
        writer.write_pmt(out);
        for i in 0..frames {
            let pts = base_pts + (i as i64) * 3000;
            writer.write_pes(
                out,
                video(),
                pts,
                pts,
                &vec![0x42; 400],
                i == 0,
            );
        }
    }

    #[test]
    fn test_packet_alignment() {
        let mut writer = TsWriter::new(vec![video()]);
        let mut out = BytesMut::new();
        write_gop(&mut writer, &mut out, 0, 5);
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        assert!(out.iter().step_by(TS_PACKET_SIZE).all(|&b| b == SYNC_BYTE));
    }

    #[test]
    fn test_scan_recovers_pts_and_raps() {
        let mut writer = TsWriter::new(vec![video()]);
        let mut out = BytesMut::new();
        // two GOPs, 30 frames at 30 fps -> 2 seconds overall span
        write_gop(&mut writer, &mut out, 0, 30);
        write_gop(&mut writer, &mut out, 90_000, 30);

        let info = scan_segment(&out).unwrap();
        assert_eq!(info.first_pts, Some(0));
        assert_eq!(info.last_pts, Some(90_000 + 29 * 3000));
        assert_eq!(info.random_access_points.len(), 2);
        assert_eq!(info.random_access_points[0].pts, 0);
        assert_eq!(info.random_access_points[1].pts, 90_000);

        // cutting at the second RAP keeps sync and decodability
        let cut = info.random_access_points[1].cut_offset;
        assert_eq!(cut % TS_PACKET_SIZE, 0);
        let tail = &out[cut..];
        let tail_info = scan_segment(tail).unwrap();
        assert_eq!(tail_info.first_pts, Some(90_000));
    }

    #[test]
    fn test_duration() {
        let info = TsSegmentInfo {
            first_pts: Some(0),
            last_pts: Some(180_000),
            random_access_points: Vec::new(),
        };
        assert_eq!(info.duration(), std::time::Duration::from_secs(2));
    }

    #[test]
    fn test_duration_wraps() {
        let info = TsSegmentInfo {
            first_pts: Some(PTS_MAX - 90_000),
            last_pts: Some(90_000),
            random_access_points: Vec::new(),
        };
        assert_eq!(info.duration(), std::time::Duration::from_secs(2));
    }

    #[test]
    fn test_unaligned_rejected() {
        assert!(scan_segment(&[0x47; 100]).is_err());
    }

    #[test]
    fn test_large_payload_spans_packets() {
        let mut writer = TsWriter::new(vec![video()]);
        let mut out = BytesMut::new();
        writer.write_pat(&mut out);
        writer.write_pmt(&mut out);
        writer.write_pes(&mut out, video(), 0, 0, &vec![0x55; 10_000], true);
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        let info = scan_segment(&out).unwrap();
        assert_eq!(info.first_pts, Some(0));
    }
}
