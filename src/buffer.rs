//! Bounded, arrival-ordered window of facial-metric samples for charting.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::channel::frame::Frame;
use crate::error::FrameError;

pub const DEFAULT_CAPACITY: usize = 50;

/// One facial-metric reading, stamped with its local arrival time.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    /// Eye aspect ratio, roughly in [0, 1].
    pub ear: f64,
    /// Mouth aspect ratio, non-negative.
    pub mar: f64,
    pub is_drowsy: bool,
    pub is_yawning: bool,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct MetricPayload {
    ear: f64,
    mar: f64,
    is_drowsy: bool,
    // The backend's idle frame omits it.
    #[serde(default)]
    is_yawning: bool,
}

impl Frame for MetricSample {
    fn decode(text: &str, received_at: DateTime<Utc>) -> Result<Self, FrameError> {
        let payload: MetricPayload = serde_json::from_str(text)?;
        if !payload.ear.is_finite() || payload.ear < 0.0 {
            return Err(FrameError::OutOfRange("ear"));
        }
        if !payload.mar.is_finite() || payload.mar < 0.0 {
            return Err(FrameError::OutOfRange("mar"));
        }
        Ok(MetricSample {
            ear: payload.ear,
            mar: payload.mar,
            is_drowsy: payload.is_drowsy,
            is_yawning: payload.is_yawning,
            received_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MetricBuffer {
    samples: VecDeque<MetricSample>,
    capacity: usize,
}

impl Default for MetricBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MetricBuffer {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Append at the tail; evicts the oldest sample once over capacity.
    pub fn push(&mut self, sample: MetricSample) {
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// Oldest-to-newest copy of the window.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        self.samples.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&MetricSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Chart-ready view over a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct MetricWindow<'a> {
    samples: &'a [MetricSample],
}

impl<'a> MetricWindow<'a> {
    pub fn new(samples: &'a [MetricSample]) -> Self {
        Self { samples }
    }

    pub fn ear_series(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.ear).collect()
    }

    pub fn mar_series(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.mar).collect()
    }

    pub fn mean_ear(&self) -> Option<f64> {
        mean(self.samples.iter().map(|s| s.ear))
    }

    pub fn mean_mar(&self) -> Option<f64> {
        mean(self.samples.iter().map(|s| s.mar))
    }

    /// Fraction of samples flagged drowsy.
    pub fn drowsy_ratio(&self) -> Option<f64> {
        mean(self.samples.iter().map(|s| if s.is_drowsy { 1.0 } else { 0.0 }))
    }

    pub fn yawning_ratio(&self) -> Option<f64> {
        mean(self.samples.iter().map(|s| if s.is_yawning { 1.0 } else { 0.0 }))
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(i: usize) -> MetricSample {
        MetricSample {
            ear: 0.30 - i as f64 * 0.001,
            mar: 0.10 + i as f64 * 0.01,
            is_drowsy: i % 7 == 0,
            is_yawning: i % 5 == 0,
            received_at: Utc.timestamp_millis_opt(i as i64 * 10).unwrap(),
        }
    }

    #[test]
    fn test_length_and_suffix_after_every_push() {
        let capacity = 8;
        let mut buf = MetricBuffer::new(capacity);
        let mut pushed = Vec::new();
        for i in 0..25 {
            let s = sample(i);
            pushed.push(s.clone());
            buf.push(s);
            let expected_len = pushed.len().min(capacity);
            assert_eq!(buf.len(), expected_len);
            assert_eq!(buf.snapshot(), pushed[pushed.len() - expected_len..].to_vec());
        }
    }

    #[test]
    fn test_sixty_pushes_into_fifty() {
        let mut buf = MetricBuffer::new(50);
        for i in 0..60 {
            buf.push(sample(i));
        }
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 50);
        assert_eq!(snap[0], sample(10));
        assert_eq!(snap[49], sample(59));
    }

    #[test]
    fn test_arrival_order_beats_timestamps() {
        let mut buf = MetricBuffer::new(4);
        let late = sample(9);
        let early = sample(1);
        buf.push(late.clone());
        buf.push(early.clone());
        assert_eq!(buf.snapshot(), vec![late, early]);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut buf = MetricBuffer::new(4);
        buf.push(sample(0));
        let mut snap = buf.snapshot();
        snap[0].ear = 99.0;
        snap.clear();
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.latest(), Some(&sample(0)));
    }

    #[test]
    fn test_round_trip_fields() {
        let at = Utc::now();
        let s = MetricSample::decode(
            r#"{"ear":0.21,"mar":0.64,"is_drowsy":true,"is_yawning":true}"#,
            at,
        )
        .unwrap();
        let mut buf = MetricBuffer::default();
        buf.push(s.clone());
        let out = &buf.snapshot()[0];
        assert_eq!(out.ear, 0.21);
        assert_eq!(out.mar, 0.64);
        assert!(out.is_drowsy);
        assert!(out.is_yawning);
        assert_eq!(out.received_at, at);
        assert_eq!(*out, s);
    }

    #[test]
    fn test_decode_tolerates_idle_frame() {
        let s = MetricSample::decode(
            r#"{"ear":0.0,"mar":0.0,"is_drowsy":false,"is_calling":"false"}"#,
            Utc::now(),
        )
        .unwrap();
        assert!(!s.is_yawning);
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        assert!(matches!(
            MetricSample::decode(r#"{"ear":-1,"mar":0.1,"is_drowsy":false}"#, Utc::now()),
            Err(FrameError::OutOfRange("ear"))
        ));
        assert!(matches!(
            MetricSample::decode(r#"{"mar":0.1,"is_drowsy":false}"#, Utc::now()),
            Err(FrameError::Json(_))
        ));
        assert!(MetricSample::decode("\"evt-1\"", Utc::now()).is_err());
    }

    #[test]
    fn test_zero_capacity_keeps_latest() {
        let mut buf = MetricBuffer::new(0);
        buf.push(sample(0));
        buf.push(sample(1));
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.snapshot(), vec![sample(1)]);
    }

    #[test]
    fn test_window_summary() {
        let samples = vec![
            MetricSample { ear: 0.2, mar: 0.4, is_drowsy: true, is_yawning: false, ..sample(0) },
            MetricSample { ear: 0.4, mar: 0.8, is_drowsy: false, is_yawning: true, ..sample(1) },
        ];
        let window = MetricWindow::new(&samples);
        assert_eq!(window.ear_series(), vec![0.2, 0.4]);
        assert!((window.mean_ear().unwrap() - 0.3).abs() < 1e-9);
        assert!((window.mean_mar().unwrap() - 0.6).abs() < 1e-9);
        assert_eq!(window.drowsy_ratio(), Some(0.5));
        assert_eq!(window.yawning_ratio(), Some(0.5));
        assert_eq!(MetricWindow::new(&[]).mean_ear(), None);
    }
}
