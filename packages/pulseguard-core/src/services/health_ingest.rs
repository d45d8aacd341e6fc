//! Health data ingestion: per-device sliding-window buffers.
//!
//! Each device owns a bounded ring of the last [`WINDOW_SIZE`] readings.
//! [`HealthIngest::window`] yields a dense matrix only once the ring is
//! full; [`HealthIngest::partial_window`] left-pads a short ring by
//! repeating the oldest sample so early inference still sees the fixed
//! shape.

use std::collections::VecDeque;

use dashmap::DashMap;
use serde::Serialize;

use crate::protocol::Vitals;
use crate::utils::now_millis;

/// Readings per inference window (5 minutes at 12-second intervals).
pub const WINDOW_SIZE: usize = 60;

/// Features per reading: heart rate, HRV, acceleration, skin temperature.
pub const FEATURES: usize = 4;

/// A single biometric sample as stored in the ring.
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub device_id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub vitals: Vitals,
    pub timestamp: u64,
}

impl Reading {
    /// Builds a reading from an inbound sample, stamping arrival time when
    /// the client supplied none.
    pub fn new(device_id: &str, user_id: &str, vitals: Vitals, timestamp: Option<u64>) -> Self {
        Self {
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            vitals,
            timestamp: timestamp.unwrap_or_else(now_millis),
        }
    }

    fn features(&self) -> [f32; FEATURES] {
        [
            self.vitals.heart_rate as f32,
            self.vitals.hrv as f32,
            self.vitals.acceleration as f32,
            self.vitals.skin_temp as f32,
        ]
    }
}

/// Fixed-shape inference window: `WINDOW_SIZE` rows × [`FEATURES`] columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Window(pub Vec<[f32; FEATURES]>);

impl Window {
    /// Builds a window from a raw row-major matrix, validating the shape.
    ///
    /// Used for `health_batch` messages where the client ships a full
    /// window in one frame.
    pub fn from_rows(rows: &[Vec<f32>]) -> Option<Self> {
        if rows.len() != WINDOW_SIZE {
            return None;
        }
        let mut out = Vec::with_capacity(WINDOW_SIZE);
        for row in rows {
            if row.len() != FEATURES {
                return None;
            }
            out.push([row[0], row[1], row[2], row[3]]);
        }
        Some(Window(out))
    }

    pub fn rows(&self) -> &[[f32; FEATURES]] {
        &self.0
    }
}

/// Manages health data ingestion and sliding-window buffers per device.
#[derive(Default)]
pub struct HealthIngest {
    buffers: DashMap<String, VecDeque<[f32; FEATURES]>>,
    latest: DashMap<String, Reading>,
}

impl HealthIngest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a reading to the device's ring, evicting the oldest sample
    /// once the ring holds [`WINDOW_SIZE`] entries.
    pub fn ingest(&self, reading: Reading) {
        let mut buf = self
            .buffers
            .entry(reading.device_id.clone())
            .or_insert_with(|| VecDeque::with_capacity(WINDOW_SIZE));
        if buf.len() == WINDOW_SIZE {
            buf.pop_front();
        }
        buf.push_back(reading.features());
        drop(buf);
        self.latest.insert(reading.device_id.clone(), reading);
    }

    /// Returns the dense window for a device, or `None` while the ring is
    /// still filling.
    pub fn window(&self, device_id: &str) -> Option<Window> {
        let buf = self.buffers.get(device_id)?;
        if buf.len() < WINDOW_SIZE {
            return None;
        }
        Some(Window(buf.iter().copied().collect()))
    }

    /// Returns a window padded to full shape by repeating the oldest
    /// sample, or `None` if the device has no readings at all.
    pub fn partial_window(&self, device_id: &str) -> Option<Window> {
        let buf = self.buffers.get(device_id)?;
        let first = *buf.front()?;
        let mut rows = Vec::with_capacity(WINDOW_SIZE);
        rows.resize(WINDOW_SIZE - buf.len(), first);
        rows.extend(buf.iter().copied());
        Some(Window(rows))
    }

    /// Latest raw reading for a device.
    pub fn latest(&self, device_id: &str) -> Option<Reading> {
        self.latest.get(device_id).map(|r| r.clone())
    }

    /// Device ids with at least one buffered reading.
    pub fn active_devices(&self) -> Vec<String> {
        self.buffers.iter().map(|e| e.key().clone()).collect()
    }

    /// Current ring length per device (diagnostics).
    pub fn buffer_len(&self, device_id: &str) -> usize {
        self.buffers.get(device_id).map_or(0, |b| b.len())
    }

    /// Drops all buffered data for a device.
    pub fn forget_device(&self, device_id: &str) {
        self.buffers.remove(device_id);
        self.latest.remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(device: &str, hr: f64) -> Reading {
        Reading::new(
            device,
            "user-1",
            Vitals {
                heart_rate: hr,
                hrv: 50.0,
                acceleration: 1.0,
                skin_temp: 36.5,
            },
            Some(0),
        )
    }

    #[test]
    fn window_requires_full_ring() {
        let ingest = HealthIngest::new();
        for i in 0..WINDOW_SIZE - 1 {
            ingest.ingest(reading("d1", 70.0 + i as f64));
        }
        assert!(ingest.window("d1").is_none());

        ingest.ingest(reading("d1", 99.0));
        let window = ingest.window("d1").unwrap();
        assert_eq!(window.rows().len(), WINDOW_SIZE);
        assert_eq!(window.rows()[WINDOW_SIZE - 1][0], 99.0);
    }

    #[test]
    fn ring_evicts_oldest_when_full() {
        let ingest = HealthIngest::new();
        for i in 0..WINDOW_SIZE + 10 {
            ingest.ingest(reading("d1", i as f64));
        }
        let window = ingest.window("d1").unwrap();
        // Oldest surviving sample is reading #10.
        assert_eq!(window.rows()[0][0], 10.0);
        assert_eq!(window.rows()[WINDOW_SIZE - 1][0], (WINDOW_SIZE + 9) as f64 as f32);
    }

    #[test]
    fn partial_window_left_pads_with_oldest() {
        let ingest = HealthIngest::new();
        ingest.ingest(reading("d1", 80.0));
        ingest.ingest(reading("d1", 90.0));

        let window = ingest.partial_window("d1").unwrap();
        assert_eq!(window.rows().len(), WINDOW_SIZE);
        assert_eq!(window.rows()[0][0], 80.0);
        assert_eq!(window.rows()[WINDOW_SIZE - 3][0], 80.0);
        assert_eq!(window.rows()[WINDOW_SIZE - 2][0], 80.0);
        assert_eq!(window.rows()[WINDOW_SIZE - 1][0], 90.0);
    }

    #[test]
    fn partial_window_none_for_unknown_device() {
        let ingest = HealthIngest::new();
        assert!(ingest.partial_window("ghost").is_none());
    }

    #[test]
    fn forget_device_drops_ring_and_latest() {
        let ingest = HealthIngest::new();
        for _ in 0..WINDOW_SIZE {
            ingest.ingest(reading("d1", 70.0));
        }
        assert!(ingest.window("d1").is_some());
        assert!(ingest.latest("d1").is_some());

        ingest.forget_device("d1");
        assert!(ingest.window("d1").is_none());
        assert!(ingest.partial_window("d1").is_none());
        assert!(ingest.latest("d1").is_none());
        assert!(ingest.active_devices().is_empty());
    }

    #[test]
    fn from_rows_validates_shape() {
        let good: Vec<Vec<f32>> = (0..WINDOW_SIZE).map(|_| vec![70.0, 50.0, 1.0, 36.5]).collect();
        assert!(Window::from_rows(&good).is_some());

        let short: Vec<Vec<f32>> = (0..10).map(|_| vec![70.0, 50.0, 1.0, 36.5]).collect();
        assert!(Window::from_rows(&short).is_none());

        let ragged: Vec<Vec<f32>> = (0..WINDOW_SIZE).map(|_| vec![70.0, 50.0]).collect();
        assert!(Window::from_rows(&ragged).is_none());
    }
}
