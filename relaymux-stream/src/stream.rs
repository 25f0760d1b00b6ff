//! Per-path broadcast of media units.
//!
//! One producer, many independent consumers. The writer never awaits:
//! each reader owns a bounded queue drained by its own task, and a reader
//! that falls behind overflows and is cut off instead of slowing anyone
//! else down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use relaymux_core::{Error, Result};

use crate::unit::{StreamDesc, Unit};

/// Smallest permitted per-unit payload cap (WebRTC floor).
pub const MIN_PAYLOAD_SIZE: usize = 1200;

/// Smallest permitted per-reader queue.
pub const MIN_WRITE_QUEUE_SIZE: usize = 8;

pub type ReaderId = Uuid;

/// Per-unit consumer callback. Must not block; a slow callback is caught by
/// the reader's own bounded queue.
pub type OnUnitFn = Box<dyn FnMut(Arc<Unit>) -> anyhow::Result<()> + Send>;

/// Asynchronous failure of one reader.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReaderError {
    #[error("reader queue overflowed")]
    QueueOverflow,
    #[error("reader callback failed: {0}")]
    Callback(String),
}

struct ReaderSlot {
    sender: mpsc::Sender<Arc<Unit>>,
    err_tx: mpsc::Sender<ReaderError>,
    media: usize,
    format: usize,
    running: bool,
    overflowed: bool,
}

/// Handle returned by [`Stream::add_reader`]; owns the one-shot error
/// channel for this subscription.
pub struct StreamReader {
    pub id: ReaderId,
    err_rx: mpsc::Receiver<ReaderError>,
}

impl StreamReader {
    /// Wait for the reader's asynchronous error. Resolves to `None` when the
    /// reader is removed or the stream is torn down without an error.
    pub async fn error(&mut self) -> Option<ReaderError> {
        self.err_rx.recv().await
    }

    /// Non-blocking check of the error slot.
    pub fn try_error(&mut self) -> Option<ReaderError> {
        self.err_rx.try_recv().ok()
    }
}

/// Aggregate counters, exposed through the admin API.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStats {
    pub bytes_received: u64,
    pub units_received: u64,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("desc", &self.desc)
            .field("write_queue_size", &self.write_queue_size)
            .field("max_payload_size", &self.max_payload_size)
            .field("generate_packets", &self.generate_packets)
            .field("sequence", &self.sequence)
            .field("bytes_received", &self.bytes_received)
            .field("units_received", &self.units_received)
            .field("running_readers", &self.running_readers)
            .field("closed", &self.closed)
            .finish()
    }
}

pub struct Stream {
    desc: StreamDesc,
    write_queue_size: usize,
    max_payload_size: usize,
    /// Adapters may ask for RTP packetization of outgoing units.
    generate_packets: bool,

    // held only during attach/detach and the non-blocking write sweep
    readers: Mutex<HashMap<ReaderId, ReaderSlot>>,

    sequence: AtomicU64,
    bytes_received: AtomicU64,
    units_received: AtomicU64,

    running_readers: AtomicUsize,
    running_notify: Notify,
    closed: AtomicBool,
}

impl Stream {
    /// Publish a media description and create the broadcast.
    ///
    /// `write_queue_size` must be a power of two >= 8; `max_payload_size`
    /// must be at least [`MIN_PAYLOAD_SIZE`].
    pub fn new(
        desc: StreamDesc,
        write_queue_size: usize,
        max_payload_size: usize,
        generate_packets: bool,
    ) -> Result<Arc<Self>> {
        if write_queue_size < MIN_WRITE_QUEUE_SIZE || !write_queue_size.is_power_of_two() {
            return Err(Error::Validation(
                "writeQueueSize must be a power of two greater than or equal to 8".to_string(),
            ));
        }
        if max_payload_size < MIN_PAYLOAD_SIZE {
            return Err(Error::Validation(format!(
                "maxPayloadSize must be at least {MIN_PAYLOAD_SIZE}"
            )));
        }

        Ok(Arc::new(Self {
            desc,
            write_queue_size,
            max_payload_size,
            generate_packets,
            readers: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            units_received: AtomicU64::new(0),
            running_readers: AtomicUsize::new(0),
            running_notify: Notify::new(),
            closed: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn desc(&self) -> &StreamDesc {
        &self.desc
    }

    #[must_use]
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    #[must_use]
    pub fn generate_packets(&self) -> bool {
        self.generate_packets
    }

    #[must_use]
    pub fn stats(&self) -> StreamStats {
        StreamStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            units_received: self.units_received.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.readers.lock().len()
    }

    /// Register a subscription bound to one (media, format) pair.
    ///
    /// The reader starts in the "registered" state: units are dropped until
    /// [`Stream::start_reader`] is called.
    pub fn add_reader(
        self: &Arc<Self>,
        media: usize,
        format: usize,
        mut on_unit: OnUnitFn,
    ) -> Result<StreamReader> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }
        if media >= self.desc.medias.len()
            || format >= self.desc.medias[media].formats.len()
        {
            return Err(Error::NotFound(format!(
                "stream has no media {media} format {format}"
            )));
        }

        let id = Uuid::new_v4();
        let (sender, mut receiver) = mpsc::channel::<Arc<Unit>>(self.write_queue_size);
        let (err_tx, err_rx) = mpsc::channel::<ReaderError>(1);

        let slot = ReaderSlot {
            sender,
            err_tx: err_tx.clone(),
            media,
            format,
            running: false,
            overflowed: false,
        };
        self.readers.lock().insert(id, slot);

        let stream = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(unit) = receiver.recv().await {
                if let Err(e) = on_unit(unit) {
                    let _ = err_tx.try_send(ReaderError::Callback(e.to_string()));
                    if let Some(stream) = stream.upgrade() {
                        stream.remove_reader(id);
                    }
                    return;
                }
            }
            // queue closed: stream torn down or reader removed
        });

        Ok(StreamReader { id, err_rx })
    }

    /// Transition a reader from "registered" to "running".
    pub fn start_reader(&self, id: ReaderId) {
        let mut readers = self.readers.lock();
        if let Some(slot) = readers.get_mut(&id) {
            if !slot.running {
                slot.running = true;
                self.running_readers.fetch_add(1, Ordering::AcqRel);
                self.running_notify.notify_waiters();
            }
        }
    }

    /// Idempotent; after return no further callbacks fire for `id`.
    pub fn remove_reader(&self, id: ReaderId) {
        let mut readers = self.readers.lock();
        if let Some(slot) = readers.remove(&id) {
            if slot.running {
                self.running_readers.fetch_sub(1, Ordering::AcqRel);
            }
            // dropping the sender ends the consumer task
        }
    }

    /// Writer-side entry. Enqueues the shared unit to every running reader
    /// of (media, format); never blocks and never fails.
    ///
    /// A reader whose queue is full gets a one-shot overflow error and is
    /// skipped from then on.
    pub fn write_unit(&self, media: usize, format: usize, unit: Unit) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        self.sequence.fetch_add(1, Ordering::Relaxed);
        self.units_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(unit.payload.size() as u64, Ordering::Relaxed);

        let shared = Arc::new(unit);
        let mut closed_ids = Vec::new();

        let mut readers = self.readers.lock();
        for (id, slot) in readers.iter_mut() {
            if slot.media != media || slot.format != format || !slot.running || slot.overflowed
            {
                continue;
            }
            match slot.sender.try_send(shared.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slot.overflowed = true;
                    let _ = slot.err_tx.try_send(ReaderError::QueueOverflow);
                    tracing::warn!("reader {} dropped: queue overflow", id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed_ids.push(*id);
                }
            }
        }
        for id in closed_ids {
            if let Some(slot) = readers.remove(&id) {
                if slot.running {
                    self.running_readers.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }

    /// Block until at least one reader is running. Used by pull sources that
    /// don't want to waste upstream bandwidth.
    pub async fn wait_running_reader(&self) {
        loop {
            let notified = self.running_notify.notified();
            if self.running_readers.load(Ordering::Acquire) > 0
                || self.closed.load(Ordering::Acquire)
            {
                return;
            }
            notified.await;
        }
    }

    /// Tear the broadcast down: every reader queue is closed, consumer loops
    /// observe end-of-stream and exit.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut readers = self.readers.lock();
        readers.clear();
        self.running_readers.store(0, Ordering::Release);
        self.running_notify.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::Utc;

    use super::*;
    use crate::unit::{FormatDesc, MediaDesc, MediaKind, UnitPayload};

    fn desc() -> StreamDesc {
        StreamDesc {
            medias: vec![MediaDesc {
                kind: MediaKind::Video,
                formats: vec![FormatDesc {
                    codec: "H264".to_string(),
                    clock_rate: 90000,
                }],
            }],
        }
    }

    fn unit(n: u8) -> Unit {
        Unit {
            pts: i64::from(n),
            dts: None,
            ntp: Utc::now(),
            random_access: n == 0,
            payload: UnitPayload::Generic {
                data: Bytes::from(vec![n]),
            },
        }
    }

    #[test]
    fn test_queue_size_must_be_power_of_two() {
        assert!(Stream::new(desc(), 100, 1472, false).is_err());
        assert!(Stream::new(desc(), 4, 1472, false).is_err());
        assert!(Stream::new(desc(), 16, 1472, false).is_ok());
    }

    #[test]
    fn test_payload_size_floor() {
        assert!(Stream::new(desc(), 16, 100, false).is_err());
    }

    #[tokio::test]
    async fn test_units_delivered_in_order() {
        let stream = Stream::new(desc(), 512, 1472, false).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = stream
            .add_reader(
                0,
                0,
                Box::new(move |u| {
                    tx.send(u.pts).map_err(|e| anyhow::anyhow!("{e}"))
                }),
            )
            .unwrap();
        stream.start_reader(reader.id);

        for n in 0..100u8 {
            stream.write_unit(0, 0, unit(n));
        }

        let mut got = Vec::new();
        while got.len() < 100 {
            got.push(
                tokio::time::timeout(Duration::from_secs(2), rx.recv())
                    .await
                    .expect("timed out")
                    .expect("channel closed"),
            );
        }
        assert_eq!(got, (0..100).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_units_dropped_before_start() {
        let stream = Stream::new(desc(), 16, 1472, false).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = stream
            .add_reader(
                0,
                0,
                Box::new(move |u| {
                    tx.send(u.pts).map_err(|e| anyhow::anyhow!("{e}"))
                }),
            )
            .unwrap();

        // not started yet: these must be dropped
        stream.write_unit(0, 0, unit(1));
        stream.write_unit(0, 0, unit(2));

        stream.start_reader(reader.id);
        stream.write_unit(0, 0, unit(3));

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(first, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_reader_overflows_without_blocking_writer() {
        let stream = Stream::new(desc(), 16, 1472, false).unwrap();

        // reader A: ~10 units/s
        let slow_count = Arc::new(AtomicU64::new(0));
        let slow_count_cb = slow_count.clone();
        let mut slow = stream
            .add_reader(
                0,
                0,
                Box::new(move |_| {
                    std::thread::sleep(Duration::from_millis(100));
                    slow_count_cb.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        stream.start_reader(slow.id);

        // reader B: effectively unbounded speed
        let (fast_tx, mut fast_rx) = mpsc::unbounded_channel();
        let fast = stream
            .add_reader(
                0,
                0,
                Box::new(move |u| {
                    fast_tx.send(u.pts).map_err(|e| anyhow::anyhow!("{e}"))
                }),
            )
            .unwrap();
        stream.start_reader(fast.id);

        let start = std::time::Instant::now();
        for n in 0..1000u64 {
            stream.write_unit(
                0,
                0,
                Unit {
                    pts: n as i64,
                    dts: None,
                    ntp: Utc::now(),
                    random_access: false,
                    payload: UnitPayload::Generic {
                        data: Bytes::from_static(&[0]),
                    },
                },
            );
        }
        // the writer must not have been paced by reader A
        assert!(start.elapsed() < Duration::from_secs(1));

        // reader B receives all 1000 units in order
        let mut got = Vec::new();
        while got.len() < 1000 {
            got.push(
                tokio::time::timeout(Duration::from_secs(2), fast_rx.recv())
                    .await
                    .expect("timed out")
                    .expect("channel closed"),
            );
        }
        assert_eq!(got, (0..1000).collect::<Vec<i64>>());

        // reader A receives a prefix, then the overflow error
        let err = tokio::time::timeout(Duration::from_secs(5), slow.error())
            .await
            .expect("timed out")
            .expect("no error");
        assert!(matches!(err, ReaderError::QueueOverflow));
        assert!(slow_count.load(Ordering::SeqCst) < 1000);
    }

    #[tokio::test]
    async fn test_callback_error_is_reported() {
        let stream = Stream::new(desc(), 16, 1472, false).unwrap();

        let mut reader = stream
            .add_reader(0, 0, Box::new(|_| anyhow::bail!("decode failed")))
            .unwrap();
        stream.start_reader(reader.id);
        stream.write_unit(0, 0, unit(1));

        let err = tokio::time::timeout(Duration::from_secs(2), reader.error())
            .await
            .expect("timed out")
            .expect("no error");
        assert!(matches!(err, ReaderError::Callback(_)));
    }

    #[tokio::test]
    async fn test_remove_reader_is_idempotent() {
        let stream = Stream::new(desc(), 16, 1472, false).unwrap();
        let reader = stream.add_reader(0, 0, Box::new(|_| Ok(()))).unwrap();
        stream.start_reader(reader.id);
        stream.remove_reader(reader.id);
        stream.remove_reader(reader.id);
        assert_eq!(stream.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_running_reader() {
        let stream = Stream::new(desc(), 16, 1472, false).unwrap();

        let waiter = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.wait_running_reader().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let reader = stream.add_reader(0, 0, Box::new(|_| Ok(()))).unwrap();
        stream.start_reader(reader.id);

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("timed out")
            .expect("join failed");
    }

    #[tokio::test]
    async fn test_close_ends_consumers() {
        let stream = Stream::new(desc(), 16, 1472, false).unwrap();
        let reader = stream.add_reader(0, 0, Box::new(|_| Ok(()))).unwrap();
        stream.start_reader(reader.id);

        stream.close();
        assert!(stream.is_closed());
        assert_eq!(stream.reader_count(), 0);

        // writes after close are no-ops
        stream.write_unit(0, 0, unit(1));
        assert_eq!(stream.stats().units_received, 0);
    }

    #[tokio::test]
    async fn test_invalid_media_rejected() {
        let stream = Stream::new(desc(), 16, 1472, false).unwrap();
        assert!(stream.add_reader(1, 0, Box::new(|_| Ok(()))).is_err());
        assert!(stream.add_reader(0, 5, Box::new(|_| Ok(()))).is_err());
    }
}
