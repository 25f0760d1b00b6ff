//! Age-based segment deletion.
//!
//! Paths with a `recordDeleteAfter` run a periodic sweep that removes
//! segments whose start time has fallen out of the retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio_util::sync::CancellationToken;

use relaymux_core::Conf;

use crate::index::walk_decoded;
use crate::segment_path::SegmentPathTemplate;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic cleaner over every recording path of the configuration
/// snapshot. Cancel the returned token to stop it; the snapshot is replaced
/// by restarting the cleaner on config reload.
pub struct RecordCleaner {
    token: CancellationToken,
}

impl RecordCleaner {
    #[must_use]
    pub fn start(conf: Arc<Conf>) -> Self {
        let token = CancellationToken::new();
        let task_token = token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = ticker.tick() => sweep(&conf),
                }
            }
        });

        Self { token }
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

fn sweep(conf: &Conf) {
    for path_conf in conf.paths.values() {
        if !path_conf.record || path_conf.record_delete_after.is_zero() {
            continue;
        }
        let retention = match chrono::Duration::from_std(
            path_conf.record_delete_after.as_duration(),
        ) {
            Ok(d) => d,
            Err(_) => continue,
        };
        let threshold = Local::now() - retention;

        let template =
            SegmentPathTemplate::new(&path_conf.record_path, path_conf.record_format);
        for (name, start, file_path) in walk_decoded(&template) {
            if start >= threshold {
                continue;
            }
            match std::fs::remove_file(&file_path) {
                Ok(()) => {
                    tracing::info!(
                        "cleaner: removed expired segment '{}' of path '{}'",
                        file_path.display(),
                        name
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "cleaner: can not remove '{}': {}",
                        file_path.display(),
                        e
                    );
                }
            }
        }
    }
}
