//! Surface grip estimation: compares measured lateral acceleration
//! against what the bicycle model predicts for the current speed and
//! steering angle during a sustained turn. A rolling average of that
//! ratio becomes a grip coefficient that the traction and ABS
//! controllers scale their slip thresholds by — low-grip surfaces get
//! more aggressive intervention, high-grip surfaces get less.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::CarProfile;
use crate::state::Command;

pub struct SurfaceConfig {
    pub min_speed_kmh: f64,
    pub min_steering: Command,
    pub min_samples: usize,
    pub default_grip: f64,
    pub grip_smoothing: f64,
    pub grip_min: f64,
    pub grip_max: f64,
    pub history_size: usize,
}

impl SurfaceConfig {
    pub fn from_profile(profile: &CarProfile) -> Self {
        let section = "surface_adaptation";
        SurfaceConfig {
            min_speed_kmh: profile.get_float(section, "min_speed_kmh"),
            min_steering: profile.get_int(section, "min_steering") as Command,
            min_samples: profile.get_int(section, "min_samples") as usize,
            default_grip: profile.get_float(section, "default_grip"),
            grip_smoothing: profile.get_float(section, "grip_smoothing"),
            grip_min: profile.get_float(section, "grip_min"),
            grip_max: profile.get_float(section, "grip_max"),
            history_size: profile.get_int(section, "history_size") as usize,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct SurfaceStatus {
    pub estimated_grip: f64,
    pub threshold_multiplier: f64,
    pub measurement_active: bool,
    pub sample_count: u64,
}

pub struct SurfaceAdaptation {
    config: SurfaceConfig,
    armed: Arc<AtomicBool>,
    wheelbase_m: f64,
    max_steering_angle_deg: f64,
    estimated_grip: f64,
    grip_history: VecDeque<f64>,
    measurement_active: bool,
    lateral_accel_smooth: f64,
    speed_smooth: f64,
    sample_count: u64,
}

const SMOOTHING_ALPHA: f64 = 0.3;

impl SurfaceAdaptation {
    pub fn new(config: SurfaceConfig, wheelbase_m: f64, max_steering_angle_deg: f64) -> Self {
        let default_grip = config.default_grip;
        SurfaceAdaptation {
            config,
            armed: Arc::new(AtomicBool::new(true)),
            wheelbase_m,
            max_steering_angle_deg,
            estimated_grip: default_grip,
            grip_history: VecDeque::new(),
            measurement_active: false,
            lateral_accel_smooth: 0.0,
            speed_smooth: 0.0,
            sample_count: 0,
        }
    }

    pub fn armed_handle(&self) -> Arc<AtomicBool> {
        self.armed.clone()
    }

    pub fn reset(&mut self) {
        self.estimated_grip = self.config.default_grip;
        self.grip_history.clear();
        self.measurement_active = false;
        self.lateral_accel_smooth = 0.0;
        self.speed_smooth = 0.0;
        self.sample_count = 0;
    }

    pub fn grip_multiplier(&self) -> f64 {
        if !self.armed.load(Ordering::Relaxed) {
            return 1.0;
        }
        let clamped_grip = self.estimated_grip.max(0.3);
        1.0 / clamped_grip
    }

    pub fn status(&self) -> SurfaceStatus {
        SurfaceStatus {
            estimated_grip: self.estimated_grip,
            threshold_multiplier: self.grip_multiplier(),
            measurement_active: self.measurement_active,
            sample_count: self.sample_count,
        }
    }

    fn steering_to_angle_rad(&self, steering: Command) -> f64 {
        let max_input = if steering.unsigned_abs() > 1000 { 32767.0 } else { 1000.0 };
        let normalized = steering as f64 / max_input;
        (normalized * self.max_steering_angle_deg).to_radians()
    }

    fn expected_lateral_accel(&self, speed_kmh: f64, steering: Command) -> f64 {
        let speed_ms = speed_kmh / 3.6;
        let delta = self.steering_to_angle_rad(steering);
        if delta.abs() < 0.01 {
            return 0.0;
        }
        let radius = (self.wheelbase_m / delta.abs().tan()).max(0.1);
        speed_ms * speed_ms / radius
    }

    fn update_grip_estimate(&mut self, actual_accel: f64, expected_accel: f64) {
        if expected_accel < 0.5 {
            return;
        }

        let grip_sample = (actual_accel.abs() / expected_accel).clamp(self.config.grip_min, self.config.grip_max);
        self.sample_count += 1;

        self.grip_history.push_back(grip_sample);
        if self.grip_history.len() > self.config.history_size {
            self.grip_history.pop_front();
        }

        if self.grip_history.len() >= self.config.min_samples {
            let avg_grip = self.grip_history.iter().sum::<f64>() / self.grip_history.len() as f64;
            self.estimated_grip += self.config.grip_smoothing * (avg_grip - self.estimated_grip);
        }
    }

    /// Call at 10-20 Hz. `lateral_accel_ms2`: positive = right.
    pub fn update(&mut self, lateral_accel_ms2: f64, speed_kmh: f64, steering: Command) {
        if !self.armed.load(Ordering::Relaxed) {
            return;
        }

        self.lateral_accel_smooth += SMOOTHING_ALPHA * (lateral_accel_ms2 - self.lateral_accel_smooth);
        self.speed_smooth += SMOOTHING_ALPHA * (speed_kmh - self.speed_smooth);

        let speed_ok = self.speed_smooth > self.config.min_speed_kmh;
        let steering_ok = steering.unsigned_abs() > self.config.min_steering.unsigned_abs();
        self.measurement_active = speed_ok && steering_ok;

        if !self.measurement_active {
            return;
        }

        let expected = self.expected_lateral_accel(self.speed_smooth, steering);
        let actual = self.lateral_accel_smooth.abs();
        self.update_grip_estimate(actual, expected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SurfaceConfig {
        SurfaceConfig {
            min_speed_kmh: 10.0,
            min_steering: 200,
            min_samples: 10,
            default_grip: 0.7,
            grip_smoothing: 0.05,
            grip_min: 0.2,
            grip_max: 1.2,
            history_size: 50,
        }
    }

    #[test]
    fn stays_at_default_without_enough_samples() {
        let mut s = SurfaceAdaptation::new(cfg(), 0.32, 30.0);
        for _ in 0..3 {
            s.update(3.0, 20.0, 5000);
        }
        assert_eq!(s.status().estimated_grip, 0.7);
    }

    #[test]
    fn low_actual_vs_expected_lowers_grip_estimate() {
        let mut s = SurfaceAdaptation::new(cfg(), 0.32, 30.0);
        for _ in 0..60 {
            // actual lateral well below the bicycle-model expectation
            // at this speed/steering: slippery surface.
            s.update(0.5, 20.0, 15000);
        }
        assert!(s.status().estimated_grip < 0.7);
        assert!(s.grip_multiplier() > 1.0);
    }

    #[test]
    fn no_measurement_below_min_speed() {
        let mut s = SurfaceAdaptation::new(cfg(), 0.32, 30.0);
        s.update(3.0, 2.0, 15000);
        assert!(!s.status().measurement_active);
    }
}
