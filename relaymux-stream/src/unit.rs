//! Typed media units and stream descriptions.
//!
//! Units are heap-allocated once by the publisher and shared by reference
//! across every reader of one broadcast; they are read-only after enqueue.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Payload variants carried through a stream.
#[derive(Debug, Clone)]
pub enum UnitPayload {
    /// H.264 access unit (one or more NAL units).
    H264 { nalus: Vec<Bytes> },
    /// H.265 access unit.
    H265 { nalus: Vec<Bytes> },
    /// Opus frame.
    Opus { frame: Bytes },
    /// AAC access unit.
    Aac { au: Bytes },
    /// MPEG-TS PES payload.
    MpegtsPes { data: Bytes },
    /// Raw RTP packet, for adapters that forward without depacketizing.
    Rtp { packet: Bytes },
    /// Opaque payload for formats the core does not inspect.
    Generic { data: Bytes },
}

impl UnitPayload {
    /// Total payload size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::H264 { nalus } | Self::H265 { nalus } => {
                nalus.iter().map(Bytes::len).sum()
            }
            Self::Opus { frame } => frame.len(),
            Self::Aac { au } => au.len(),
            Self::MpegtsPes { data } | Self::Generic { data } => data.len(),
            Self::Rtp { packet } => packet.len(),
        }
    }
}

/// One frame/access-unit/packet carried through a stream.
#[derive(Debug, Clone)]
pub struct Unit {
    /// Presentation timestamp in the track clock rate.
    pub pts: i64,
    /// Decode timestamp, when distinct from PTS.
    pub dts: Option<i64>,
    /// Wall-clock capture time.
    pub ntp: DateTime<Utc>,
    /// Decoding can start from this unit without prior state.
    pub random_access: bool,
    pub payload: UnitPayload,
}

impl Unit {
    #[must_use]
    pub fn dts_or_pts(&self) -> i64 {
        self.dts.unwrap_or(self.pts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Application,
}

/// One negotiated format inside a media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatDesc {
    /// Codec tag, e.g. "H264", "Opus".
    pub codec: String,
    pub clock_rate: u32,
}

/// One media (track) inside a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaDesc {
    pub kind: MediaKind,
    pub formats: Vec<FormatDesc>,
}

/// The published session description: the list of medias offered by the
/// publisher.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StreamDesc {
    pub medias: Vec<MediaDesc>,
}

impl StreamDesc {
    /// Codec tags of every track, for API introspection.
    #[must_use]
    pub fn track_codecs(&self) -> Vec<String> {
        self.medias
            .iter()
            .flat_map(|m| m.formats.iter().map(|f| f.codec.clone()))
            .collect()
    }
}
