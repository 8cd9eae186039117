//! Sensor adapter traits and the mock/replay implementations that stand
//! in for real hardware. Talking to an actual BNO055 over I2C, a GPIO
//! pulse interrupt, or a serial GPS module is an external collaborator
//! per scope (the core only needs a place to plug one in); what lives
//! here is the trait boundary plus adapters good enough to drive the
//! pipeline in development and in `replay`.
//!
//! The IMU correction applied in `ImuReading::from_raw` (pitch flip,
//! gyro-Z negation, lateral-X negation) is a fixed property of how the
//! sensor is bolted to the chassis, not a tunable — it belongs here,
//! not in the car profile.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{info, warn};

use crate::clock::Clock;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CalibrationStatus {
    pub sys: u8,
    pub gyro: u8,
    pub acc: u8,
    pub mag: u8,
}

impl CalibrationStatus {
    /// Mirrors `BNO055.is_calibrated()`: magnetometer and gyro both at
    /// least "usable", not necessarily fully settled.
    pub fn is_usable(&self) -> bool {
        self.mag >= 2 && self.gyro >= 2
    }

    pub fn is_fully_calibrated(&self) -> bool {
        self.sys == 3 && self.gyro == 3 && self.acc == 3 && self.mag == 3
    }
}

pub const CALIBRATION_BLOB_SIZE: usize = 22;

/// The 22-byte BNO055 offset blob, persisted once per session when the
/// sensor reaches full calibration and restored before fusion is armed
/// (spec invariant 6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CalibrationBlob(pub [u8; CALIBRATION_BLOB_SIZE]);

impl CalibrationBlob {
    pub fn load_from_file(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).ok()?;
        if bytes.len() != CALIBRATION_BLOB_SIZE {
            warn!(
                "[imu] calibration blob at {} is {} bytes, expected {}; discarding, calibrating fresh",
                path.display(),
                bytes.len(),
                CALIBRATION_BLOB_SIZE
            );
            return None;
        }
        let mut buf = [0u8; CALIBRATION_BLOB_SIZE];
        buf.copy_from_slice(&bytes);
        Some(CalibrationBlob(buf))
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        fs::write(path, self.0)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ImuReading {
    pub heading_deg: f64,
    pub roll_deg: f64,
    /// Corrected: positive = nose up.
    pub pitch_deg: f64,
    /// Corrected: positive = counter-clockwise viewed from above.
    pub yaw_rate_dps: f64,
    pub forward_accel_ms2: f64,
    /// Corrected: positive = right.
    pub lateral_accel_ms2: f64,
    pub calibration: CalibrationStatus,
}

impl ImuReading {
    /// Apply the fixed mounting correction to a raw sensor-frame sample.
    /// `raw_pitch_deg`/`raw_yaw_rate_dps`/`raw_lateral_ms2` are exactly
    /// what the chip reports before any sign or wrap correction.
    pub fn from_raw(
        heading_deg: f64,
        roll_deg: f64,
        raw_pitch_deg: f64,
        raw_yaw_rate_dps: f64,
        forward_accel_ms2: f64,
        raw_lateral_ms2: f64,
        calibration: CalibrationStatus,
    ) -> Self {
        // Mounted inverted: a chip reporting "flat, upside-down" as
        // +179/-179 should read back as ~0 once corrected.
        let pitch_deg = raw_pitch_deg.signum() * (180.0 - raw_pitch_deg.abs());
        ImuReading {
            heading_deg,
            roll_deg,
            pitch_deg,
            yaw_rate_dps: -raw_yaw_rate_dps,
            forward_accel_ms2,
            lateral_accel_ms2: -raw_lateral_ms2,
            calibration,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GpsReading {
    pub speed_kmh: f64,
    pub lat: f64,
    pub lon: f64,
    pub course_deg: f64,
    pub fix: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WheelReading {
    pub speed_kmh: f64,
    pub rpm: f64,
}

/// Polled ~20 Hz by the IMU ingestion task.
pub trait ImuSource {
    #[allow(async_fn_in_trait)]
    async fn poll(&mut self) -> Option<ImuReading>;
}

/// Polled by the GPS ingestion task, typically every few hundred ms.
pub trait GpsSource {
    #[allow(async_fn_in_trait)]
    async fn poll(&mut self) -> Option<GpsReading>;
}

/// Sampled synchronously from the command path or a fast timer; the
/// wheel itself is interrupt-driven (see `WheelPulseCounter`), so there
/// is nothing to await here.
pub trait WheelSource {
    fn snapshot(&self) -> Option<WheelReading>;
}

/// The one true contention point (§5): an ISR callback and the reader
/// share `(count, last_pulse)` under a short-lived lock, never held
/// across any derived computation.
#[derive(Clone)]
pub struct WheelPulseCounter {
    inner: Arc<Mutex<(u64, Option<Instant>, f64)>>,
    wheel_circumference_m: f64,
    magnets_per_rev: u32,
    timeout_s: f64,
}

impl WheelPulseCounter {
    pub fn new(wheel_diameter_mm: f64, magnets_per_rev: u32, timeout_s: f64) -> Self {
        let wheel_circumference_m = std::f64::consts::PI * (wheel_diameter_mm / 1000.0);
        WheelPulseCounter {
            inner: Arc::new(Mutex::new((0, None, 0.0))),
            wheel_circumference_m,
            magnets_per_rev: magnets_per_rev.max(1),
            timeout_s,
        }
    }

    /// Called from the GPIO interrupt context on every falling edge.
    /// Holds the lock only long enough to update the pair.
    pub fn on_pulse(&self, clock: &dyn Clock) {
        let now = clock.now();
        let mut guard = self.inner.lock().unwrap();
        if let Some(last) = guard.1 {
            guard.2 = now.saturating_duration_since(last).as_secs_f64();
        }
        guard.1 = Some(now);
        guard.0 += 1;
    }

    pub fn pulse_count(&self) -> u64 {
        self.inner.lock().unwrap().0
    }
}

impl WheelSource for WheelPulseCounter {
    fn snapshot(&self) -> Option<WheelReading> {
        let (_, last, interval_s) = *self.inner.lock().unwrap();
        let last = last?;
        // Caller has no clock of its own here; staleness is instead
        // judged by the pipeline against `VehicleState::wheel_fresh`,
        // which is touched whenever this snapshot is consulted. A
        // reading older than `timeout_s` since its own interval means
        // the wheel has actually stopped, not merely that we haven't
        // asked in a while.
        if interval_s <= 0.0 || interval_s > self.timeout_s {
            return Some(WheelReading { speed_kmh: 0.0, rpm: 0.0 });
        }
        let rpm = (60.0 / interval_s) / self.magnets_per_rev as f64;
        let speed_kmh = rpm * self.wheel_circumference_m * 60.0 / 1000.0;
        let _ = last;
        Some(WheelReading { speed_kmh, rpm })
    }
}

/// Deterministic mock IMU for local development and `replay` fallback
/// when no recorded session provides IMU samples. Calibration climbs to
/// fully-calibrated after a short warm-up, matching how a real BNO055
/// in NDOF mode settles once the car has been driven in a figure-8.
pub struct MockImuSource {
    tick: u64,
}

impl MockImuSource {
    pub fn new() -> Self {
        MockImuSource { tick: 0 }
    }
}

impl Default for MockImuSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ImuSource for MockImuSource {
    async fn poll(&mut self) -> Option<ImuReading> {
        use std::f64::consts::PI;
        let t = self.tick as f64 * 0.05;
        self.tick += 1;

        let cal_level = ((self.tick / 40).min(3)) as u8;
        let calibration = CalibrationStatus {
            sys: cal_level,
            gyro: cal_level,
            acc: cal_level,
            mag: cal_level,
        };

        Some(ImuReading::from_raw(
            (t * 5.0) % 360.0,
            (t * 0.3).sin() * 2.0,
            179.0,
            (t * 1.0).sin() * 5.0,
            (t * 2.0 * PI).sin() * 0.3,
            (t * 0.7).cos() * 0.2,
            calibration,
        ))
    }
}

/// Deterministic mock GPS: a slow, steady drift with a plausible fix
/// delay, standing in for a cold-start U-blox module.
pub struct MockGpsSource {
    fixes_seen: u64,
}

impl MockGpsSource {
    pub fn new() -> Self {
        MockGpsSource { fixes_seen: 0 }
    }
}

impl Default for MockGpsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl GpsSource for MockGpsSource {
    async fn poll(&mut self) -> Option<GpsReading> {
        self.fixes_seen += 1;
        if self.fixes_seen < 3 {
            // No fix yet, same as a real module's cold-start.
            return None;
        }
        let seq = self.fixes_seen as f64;
        Some(GpsReading {
            speed_kmh: (10.0 + (seq * 0.1).sin() * 5.0).max(0.0),
            lat: 0.0,
            lon: 0.0,
            course_deg: (seq * 2.0) % 360.0,
            fix: true,
        })
    }
}

/// Loads or initializes the IMU calibration blob for a session: restore
/// before arming fusion, persist once fully calibrated (never more than
/// once per session). Matches the Rust realization's "never crash on a
/// bad blob" rule (§7 category 4).
pub struct CalibrationManager {
    path: std::path::PathBuf,
    saved_this_session: bool,
}

impl CalibrationManager {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        CalibrationManager {
            path: path.into(),
            saved_this_session: false,
        }
    }

    pub fn restore(&self) -> Option<CalibrationBlob> {
        let blob = CalibrationBlob::load_from_file(&self.path)?;
        info!("[imu] restored calibration blob from {}", self.path.display());
        Some(blob)
    }

    /// Call once per reading; persists the blob the first time the
    /// sensor reports all four fields maxed out.
    pub fn maybe_persist(&mut self, calibration: CalibrationStatus, blob: &CalibrationBlob) {
        if self.saved_this_session || !calibration.is_fully_calibrated() {
            return;
        }
        match blob.save_to_file(&self.path) {
            Ok(()) => {
                info!("[imu] persisted calibration blob to {}", self.path.display());
                self.saved_this_session = true;
            }
            Err(e) => warn!("[imu] failed to persist calibration blob: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pitch_correction_maps_flat_upside_down_to_near_zero() {
        let r179 = ImuReading::from_raw(0.0, 0.0, 179.0, 0.0, 0.0, 0.0, CalibrationStatus::default());
        let rneg179 = ImuReading::from_raw(0.0, 0.0, -179.0, 0.0, 0.0, 0.0, CalibrationStatus::default());
        assert!(r179.pitch_deg.abs() < 1.0);
        assert!(rneg179.pitch_deg.abs() < 1.0);
    }

    #[test]
    fn gyro_and_lateral_are_negated() {
        let r = ImuReading::from_raw(0.0, 0.0, 0.0, 10.0, 0.0, 3.0, CalibrationStatus::default());
        assert_eq!(r.yaw_rate_dps, -10.0);
        assert_eq!(r.lateral_accel_ms2, -3.0);
    }

    #[test]
    fn wheel_counter_reports_zero_when_stale() {
        let clock = crate::clock::FakeClock::new();
        let counter = WheelPulseCounter::new(100.0, 1, 0.5);
        counter.on_pulse(&clock);
        clock.advance_secs(1.0);
        counter.on_pulse(&clock);
        clock.advance_secs(2.0); // exceeds timeout since last interval
        let reading = counter.snapshot().unwrap();
        assert_eq!(reading.speed_kmh, 0.0);
    }

    #[test]
    fn wheel_counter_computes_speed_from_interval() {
        let clock = crate::clock::FakeClock::new();
        // 100mm diameter wheel, one magnet, pulses every 0.1s -> 600 rpm.
        let counter = WheelPulseCounter::new(100.0, 1, 1.0);
        counter.on_pulse(&clock);
        clock.advance_secs(0.1);
        counter.on_pulse(&clock);
        let reading = counter.snapshot().unwrap();
        assert!(reading.rpm > 0.0);
        assert!(reading.speed_kmh > 0.0);
    }

    #[test]
    fn calibration_blob_rejects_wrong_size() {
        let dir = std::env::temp_dir().join("ratrod_test_calib");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.bin");
        std::fs::write(&path, [0u8; 5]).unwrap();
        assert!(CalibrationBlob::load_from_file(&path).is_none());
    }

    #[test]
    fn calibration_blob_round_trips() {
        let dir = std::env::temp_dir().join("ratrod_test_calib_roundtrip");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ok.bin");
        let blob = CalibrationBlob([7u8; CALIBRATION_BLOB_SIZE]);
        blob.save_to_file(&path).unwrap();
        let loaded = CalibrationBlob::load_from_file(&path).unwrap();
        assert_eq!(blob, loaded);
    }
}
