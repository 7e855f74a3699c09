use crate::metadata::EnrichedMetadata;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// One line on the progress stream. Serialized as JSON with a `type`
/// discriminator so clients can switch on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    Status {
        message: String,
    },
    Info {
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        artist: Option<String>,
    },
    Progress {
        percent: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        eta: Option<String>,
    },
    Metadata {
        metadata: EnrichedMetadata,
    },
    Complete {
        filename: String,
        size: u64,
        provider: String,
        payload: String,
    },
    Error {
        error: String,
    },
}

impl ProgressEvent {
    /// Complete and error both end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Complete { .. } | ProgressEvent::Error { .. })
    }
}

/// Write side of one request's event stream.
///
/// After a terminal event (or an explicit close) every further send is
/// silently dropped, so late progress from a lingering worker can never
/// corrupt a finished stream. A receiver that went away (client
/// disconnect) closes the sink the same way.
pub struct EventSink {
    tx: mpsc::Sender<ProgressEvent>,
    closed: AtomicBool,
}

impl EventSink {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub async fn send(&self, event: ProgressEvent) {
        if self.closed.load(Ordering::SeqCst) {
            log::debug!("[EVENTS] dropping event after close: {:?}", event);
            return;
        }

        let terminal = event.is_terminal();
        if self.tx.send(event).await.is_err() {
            self.closed.store(true, Ordering::SeqCst);
            return;
        }
        if terminal {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Idempotent. Marks the stream finished without emitting anything.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
