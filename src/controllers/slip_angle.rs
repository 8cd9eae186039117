//! Sustained-slide detection from pure IMU data: the lateral
//! acceleration a car should see mid-turn is `v * yaw_rate`, so excess
//! over that for long enough means the rear is sliding out. Gentle and
//! slow compared to `yaw_rate`'s instant reaction — it catches the
//! slides that controller never sees because they don't show up as a
//! rotation-rate error, only as a sustained overshoot of lateral g.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::CarProfile;
use crate::state::Command;

pub struct SlipAngleConfig {
    pub min_speed_kmh: f64,
    pub lateral_excess_threshold: f64,
    pub slip_duration_threshold_s: f64,
    pub min_throttle_for_intervention: Command,
    pub recovery_target: f64,
    pub reduction_rate: f64,
    pub recovery_rate: f64,
    pub min_multiplier: f64,
    pub smoothing_alpha: f64,
}

impl SlipAngleConfig {
    pub fn from_profile(profile: &CarProfile) -> Self {
        let section = "slip_angle_watchdog";
        SlipAngleConfig {
            min_speed_kmh: profile.get_float(section, "min_speed_kmh"),
            lateral_excess_threshold: profile.get_float(section, "lateral_excess_threshold"),
            slip_duration_threshold_s: profile.get_float(section, "slip_duration_threshold_s"),
            min_throttle_for_intervention: profile.get_int(section, "min_throttle_for_intervention") as Command,
            recovery_target: profile.get_float(section, "recovery_target"),
            reduction_rate: profile.get_float(section, "reduction_rate"),
            recovery_rate: profile.get_float(section, "recovery_rate"),
            min_multiplier: profile.get_float(section, "min_multiplier"),
            smoothing_alpha: profile.get_float(section, "smoothing_alpha"),
        }
    }
}

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct SlipAngleStatus {
    pub lateral_excess: f64,
    pub expected_lateral: f64,
    pub actual_lateral: f64,
    pub slip_detected: bool,
    pub slip_duration_s: f64,
    pub intervention_active: bool,
    pub throttle_multiplier: f64,
}

pub struct SlipAngleWatchdog {
    config: SlipAngleConfig,
    armed: Arc<AtomicBool>,
    throttle_multiplier: f64,
    slip_elapsed_s: Option<f64>,
    intervention_active: bool,
    lateral_excess_smooth: f64,
    lateral_excess: f64,
    expected_lateral: f64,
    actual_lateral: f64,
    slip_detected: bool,
    slip_duration_s: f64,
}

impl SlipAngleWatchdog {
    pub fn new(config: SlipAngleConfig) -> Self {
        SlipAngleWatchdog {
            config,
            armed: Arc::new(AtomicBool::new(true)),
            throttle_multiplier: 1.0,
            slip_elapsed_s: None,
            intervention_active: false,
            lateral_excess_smooth: 0.0,
            lateral_excess: 0.0,
            expected_lateral: 0.0,
            actual_lateral: 0.0,
            slip_detected: false,
            slip_duration_s: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.throttle_multiplier = 1.0;
        self.slip_elapsed_s = None;
        self.intervention_active = false;
        self.lateral_excess_smooth = 0.0;
        self.lateral_excess = 0.0;
        self.expected_lateral = 0.0;
        self.actual_lateral = 0.0;
        self.slip_detected = false;
        self.slip_duration_s = 0.0;
    }

    pub fn armed_handle(&self) -> Arc<AtomicBool> {
        self.armed.clone()
    }

    pub fn status(&self) -> SlipAngleStatus {
        SlipAngleStatus {
            lateral_excess: self.lateral_excess,
            expected_lateral: self.expected_lateral,
            actual_lateral: self.actual_lateral,
            slip_detected: self.slip_detected,
            slip_duration_s: self.slip_duration_s,
            intervention_active: self.intervention_active,
            throttle_multiplier: self.throttle_multiplier,
        }
    }

    /// `lateral_accel_ms2`: positive = right. `yaw_rate_dps`: positive
    /// = CCW/left. `dt` in seconds.
    pub fn update(&mut self, lateral_accel_ms2: f64, yaw_rate_dps: f64, speed_kmh: f64, throttle_input: Command, dt: f64) {
        if !self.armed.load(Ordering::Relaxed) {
            return;
        }

        self.actual_lateral = lateral_accel_ms2;

        let v_ms = speed_kmh / 3.6;
        let omega_rad = yaw_rate_dps.to_radians();
        self.expected_lateral = (v_ms * omega_rad).abs();

        let raw_excess = lateral_accel_ms2.abs() - self.expected_lateral;
        self.lateral_excess_smooth += self.config.smoothing_alpha * (raw_excess - self.lateral_excess_smooth);
        self.lateral_excess = self.lateral_excess_smooth;

        let speed_ok = speed_kmh >= self.config.min_speed_kmh;
        let throttle_ok = throttle_input >= self.config.min_throttle_for_intervention;
        let slip_high = self.lateral_excess > self.config.lateral_excess_threshold;

        self.slip_detected = speed_ok && slip_high;

        if speed_ok && throttle_ok && slip_high {
            self.slip_duration_s = self.slip_elapsed_s.unwrap_or(0.0) + dt;
            self.slip_elapsed_s = Some(self.slip_duration_s);

            if self.slip_duration_s >= self.config.slip_duration_threshold_s {
                self.apply_intervention();
            }
        } else {
            self.slip_elapsed_s = None;
            self.slip_duration_s = 0.0;
            self.recover();
        }
    }

    fn apply_intervention(&mut self) {
        self.intervention_active = true;
        let target = self.config.min_multiplier.max(self.config.recovery_target);
        if self.throttle_multiplier > target {
            self.throttle_multiplier = (self.throttle_multiplier - self.config.reduction_rate).max(target);
        }
    }

    fn recover(&mut self) {
        if !self.intervention_active {
            self.throttle_multiplier = 1.0;
            return;
        }
        self.throttle_multiplier = (self.throttle_multiplier + self.config.recovery_rate).min(1.0);
        if self.throttle_multiplier >= 1.0 {
            self.intervention_active = false;
        }
    }

    /// Apply watchdog to throttle. Only affects positive throttle.
    pub fn apply_to_throttle(&self, throttle: Command) -> Command {
        if !self.armed.load(Ordering::Relaxed) || throttle <= 0 {
            return throttle;
        }
        (throttle as f64 * self.throttle_multiplier) as Command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SlipAngleConfig {
        SlipAngleConfig {
            min_speed_kmh: 5.0,
            lateral_excess_threshold: 2.0,
            slip_duration_threshold_s: 0.2,
            min_throttle_for_intervention: 100,
            recovery_target: 0.6,
            reduction_rate: 0.05,
            recovery_rate: 0.03,
            min_multiplier: 0.4,
            smoothing_alpha: 0.5,
        }
    }

    #[test]
    fn no_intervention_below_min_speed() {
        let mut w = SlipAngleWatchdog::new(cfg());
        w.update(10.0, 0.0, 2.0, 1000, 0.02);
        assert!(!w.status().slip_detected);
    }

    #[test]
    fn sustained_excess_lateral_triggers_intervention() {
        let mut w = SlipAngleWatchdog::new(cfg());
        for _ in 0..20 {
            w.update(10.0, 0.0, 20.0, 1000, 0.02);
        }
        assert!(w.status().intervention_active);
        assert!(w.status().throttle_multiplier < 1.0);
    }

    #[test]
    fn brief_excess_does_not_trigger() {
        let mut w = SlipAngleWatchdog::new(cfg());
        w.update(10.0, 0.0, 20.0, 1000, 0.02);
        assert!(!w.status().intervention_active);
    }
}
