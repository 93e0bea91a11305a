use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// One GPS fix pushed by the location feed. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSample {
    pub captured_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub bearing: Option<f64>,
    pub accuracy: Option<f64>,
}

struct TrackBuffer {
    samples: Vec<LocationSample>,
    accepting: bool,
}

/// Accumulates location samples for the active session in arrival order.
///
/// Cloneable handle: the location feed pushes while the session's status
/// path reads the count. `push` is a short locked append and never blocks
/// on I/O. Ordering is arrival order; out-of-order capture timestamps are
/// kept as-is.
#[derive(Clone)]
pub struct TrackRecorder {
    inner: Arc<Mutex<TrackBuffer>>,
}

impl TrackRecorder {
    pub fn new() -> Self {
        TrackRecorder {
            inner: Arc::new(Mutex::new(TrackBuffer {
                samples: Vec::new(),
                accepting: false,
            })),
        }
    }

    /// Clear any prior buffer and begin accepting samples.
    pub fn start(&self) {
        let mut buf = self.inner.lock().expect("track buffer lock");
        buf.samples.clear();
        buf.accepting = true;
    }

    /// Append a sample in arrival order. Returns false (and logs) if the
    /// track is frozen; the sample is not silently mixed into a finished
    /// track.
    pub fn push(&self, sample: LocationSample) -> bool {
        let mut buf = self.inner.lock().expect("track buffer lock");
        if !buf.accepting {
            tracing::warn!("location sample dropped: track is not accepting");
            return false;
        }
        buf.samples.push(sample);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("track buffer lock").samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Freeze the track and return the samples collected so far. Further
    /// pushes are rejected. A partial or empty track is valid output.
    pub fn stop(&self) -> Vec<LocationSample> {
        let mut buf = self.inner.lock().expect("track buffer lock");
        buf.accepting = false;
        std::mem::take(&mut buf.samples)
    }
}

impl Default for TrackRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire form of one track point, one JSON object per line.
#[derive(Debug, Serialize)]
struct TrackPoint<'a> {
    ts: &'a DateTime<Utc>,
    lat: f64,
    lon: f64,
    alt: Option<f64>,
    spd: Option<f64>,
    brg: Option<f64>,
    acc: Option<f64>,
}

/// Serialize a frozen track as newline-delimited JSON records. An empty
/// track serializes to an empty string.
pub fn to_jsonl(samples: &[LocationSample]) -> String {
    samples
        .iter()
        .map(|s| {
            let point = TrackPoint {
                ts: &s.captured_at,
                lat: s.latitude,
                lon: s.longitude,
                alt: s.altitude,
                spd: s.speed,
                brg: s.bearing,
                acc: s.accuracy,
            };
            serde_json::to_string(&point).expect("track point serialization")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
