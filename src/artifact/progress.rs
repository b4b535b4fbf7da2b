//! Update progress events for observers of the artifact pipeline

use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;
use tokio::sync::mpsc;

/// Phase of a single update run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Resolving,   // Fetching remote version metadata
    Downloading, // Streaming artifact bytes
    Verifying,   // Checksum of the staged file
    Installing,  // Extraction or binary swap
    Complete,
}

#[derive(Debug, Clone)]
pub struct UpdateProgress {
    pub phase: UpdatePhase,
    pub bytes_downloaded: u64,
    /// From `content-length`, when the server sends one
    pub total_bytes: Option<u64>,
    pub version: Option<String>,
}

impl UpdateProgress {
    pub fn phase(phase: UpdatePhase, version: Option<String>) -> Self {
        Self {
            phase,
            bytes_downloaded: 0,
            total_bytes: None,
            version,
        }
    }

    pub fn download(bytes_downloaded: u64, total_bytes: Option<u64>, version: Option<String>) -> Self {
        Self {
            phase: UpdatePhase::Downloading,
            bytes_downloaded,
            total_bytes,
            version,
        }
    }
}

/// Best-effort sender: a closed or full channel never fails the update
#[derive(Debug, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<UpdateProgress>>,
    disabled: AtomicBool,
}

impl ProgressSink {
    pub fn new(tx: Option<mpsc::Sender<UpdateProgress>>) -> Self {
        Self {
            tx,
            disabled: AtomicBool::new(false),
        }
    }

    pub fn send(&self, progress: UpdateProgress) {
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        if let Some(tx) = &self.tx
            && let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(progress)
        {
            warn!("Progress channel closed, continuing update without progress updates");
            self.disabled.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_channel_disables_sink() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let sink = ProgressSink::new(Some(tx));
        sink.send(UpdateProgress::phase(UpdatePhase::Resolving, None));
        assert!(sink.disabled.load(Ordering::Relaxed));
    }
}
