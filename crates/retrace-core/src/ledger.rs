//! Rolling window of attempt markers reported by the host application.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// A host-reported event pinned to a frame of the live recording.
///
/// Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptMarker {
    /// Encoder frame number current when the event was reported
    pub frame_number: u64,
    /// Application label, e.g. the level name
    pub label: String,
    /// Host-supplied attempt counter
    pub sequence: u64,
}

impl AttemptMarker {
    pub fn new(frame_number: u64, label: impl Into<String>, sequence: u64) -> Self {
        Self {
            frame_number,
            label: label.into(),
            sequence,
        }
    }
}

/// Bounded history of the `window` most recent markers, newest first.
#[derive(Debug)]
pub struct AttemptLedger {
    window: usize,
    markers: Mutex<VecDeque<AttemptMarker>>,
}

impl AttemptLedger {
    /// Create a ledger retaining at most `window` markers (minimum 1).
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            markers: Mutex::new(VecDeque::with_capacity(window + 1)),
        }
    }

    /// Record a marker, evicting the oldest one if the window is exceeded.
    pub fn record(&self, frame_number: u64, label: impl Into<String>, sequence: u64) -> AttemptMarker {
        let marker = AttemptMarker::new(frame_number, label, sequence);
        let mut markers = self.markers.lock();
        markers.push_front(marker.clone());
        while markers.len() > self.window {
            markers.pop_back();
        }
        debug!(
            frame = marker.frame_number,
            sequence = marker.sequence,
            retained = markers.len(),
            "Attempt recorded"
        );
        marker
    }

    /// Current markers, newest first.
    pub fn snapshot(&self) -> Vec<AttemptMarker> {
        self.markers.lock().iter().cloned().collect()
    }

    /// Most recent and oldest retained markers, if any.
    pub fn bounds(&self) -> Option<(AttemptMarker, AttemptMarker)> {
        let markers = self.markers.lock();
        let newest = markers.front()?.clone();
        let oldest = markers.back()?.clone();
        Some((newest, oldest))
    }

    pub fn len(&self) -> usize {
        self.markers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.lock().is_empty()
    }

    /// Whether the ledger holds a full window of markers.
    pub fn is_full(&self) -> bool {
        self.len() == self.window
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Forget all markers, e.g. when a new session starts.
    pub fn clear(&self) {
        self.markers.lock().clear();
    }
}
