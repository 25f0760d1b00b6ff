//! Contract between the core and protocol adapters.
//!
//! Wire-level framing (RTSP, RTMP, SRT, WebRTC, HLS) lives in dedicated
//! servers outside this crate. They interact with the core exclusively
//! through [`crate::manager::PathManager`] plus the factory traits below,
//! which let the core start work it cannot perform itself: pulling from a
//! remote source and writing recording segments.

use std::sync::Arc;

use relaymux_core::PathConf;

use crate::stream::Stream;

/// A running pull source. Closing it must stop the transfer and remove the
/// publisher it registered.
pub trait SourceHandle: Send + Sync {
    fn close(&self);
}

/// Starts pull sources ("source" is a URL). The implementation is expected
/// to connect, then register itself as the path's publisher through the
/// manager.
pub trait StaticSourceFactory: Send + Sync {
    fn start(&self, path_name: &str, conf: &PathConf) -> Box<dyn SourceHandle>;
}

/// A running segment writer.
pub trait RecorderHandle: Send {
    fn close(self: Box<Self>);
}

/// Starts a segment writer attached to a stream while its path is ready.
pub trait RecorderFactory: Send + Sync {
    fn start(
        &self,
        path_name: &str,
        conf: &PathConf,
        stream: Arc<Stream>,
    ) -> Box<dyn RecorderHandle>;
}
