//! Segment-based recording and timed playback.
//!
//! While a path is ready and recording is enabled, a [`writer::Recorder`]
//! is attached to its stream and writes fMP4 or MPEG-TS segments whose
//! filenames encode the start wall-clock time. Reads go the other way:
//! [`index`] discovers segments on disk and [`playback`] stitches them into
//! a single byte stream over an arbitrary time window.

pub mod cleaner;
pub mod fmp4;
pub mod index;
pub mod mpegts;
pub mod playback;
pub mod segment_path;
pub mod writer;

pub use cleaner::RecordCleaner;
pub use index::{delete_segment, find_all_paths_with_segments, segments_of_path};
pub use playback::{list_spans, stitch};
pub use segment_path::SegmentPathTemplate;
pub use writer::Recorder;
