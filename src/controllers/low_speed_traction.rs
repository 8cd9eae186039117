//! Unified low-speed traction management: launch-phase proactive slip
//! targeting blended into cruise-phase reactive slip cutting, so there
//! is one continuous strategy instead of two conflicting ones at the
//! launch/cruise boundary.
//!
//! Maintains its own IMU-primary ground-speed estimate rather than
//! reading `VehicleState::fused_speed_kmh` — slip control needs a speed
//! reference that tracks wheel acceleration tightly, and `fused_speed`
//! is nudged by GPS, which this loop must never see even indirectly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::CarProfile;
use crate::state::Command;

const THROTTLE_SCALE: f64 = 32767.0 / 1000.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum Phase {
    Launch,
    Transition,
    Cruise,
}

pub struct LowSpeedTractionConfig {
    pub launch_phase_end_kmh: f64,
    pub transition_phase_end_kmh: f64,
    pub launch_target_slip: f64,
    pub launch_slip_tolerance: f64,
    pub launch_max_throttle_rate: Command,
    pub launch_throttle_ceiling: Command,
    pub launch_slip_high_cut: f64,
    pub cruise_slip_threshold: f64,
    pub cruise_throttle_cut_rate: f64,
    pub cruise_recovery_rate: f64,
    pub cruise_min_multiplier: f64,
    pub min_throttle_for_slip: Command,
    pub yaw_rate_threshold: f64,
    pub accel_smoothing: f64,
    pub gps_drift_correction_alpha: f64,
    pub gps_drift_correction_min_speed_kmh: f64,
}

impl LowSpeedTractionConfig {
    pub fn from_profile(profile: &CarProfile) -> Self {
        let section = "low_speed_traction";
        LowSpeedTractionConfig {
            launch_phase_end_kmh: profile.get_float(section, "launch_phase_end_kmh"),
            transition_phase_end_kmh: profile.get_float(section, "transition_phase_end_kmh"),
            launch_target_slip: profile.get_float(section, "launch_target_slip"),
            launch_slip_tolerance: profile.get_float(section, "launch_slip_tolerance"),
            launch_max_throttle_rate: (profile.get_int(section, "launch_max_throttle_rate") as f64 * THROTTLE_SCALE) as Command,
            launch_throttle_ceiling: (profile.get_int(section, "launch_throttle_ceiling") as f64 * THROTTLE_SCALE) as Command,
            launch_slip_high_cut: profile.get_float(section, "launch_slip_high_cut"),
            cruise_slip_threshold: profile.get_float(section, "cruise_slip_threshold"),
            cruise_throttle_cut_rate: profile.get_float(section, "cruise_throttle_cut_rate"),
            cruise_recovery_rate: profile.get_float(section, "cruise_recovery_rate"),
            cruise_min_multiplier: profile.get_float(section, "cruise_min_multiplier"),
            min_throttle_for_slip: (profile.get_int(section, "min_throttle_for_slip") as f64 * THROTTLE_SCALE) as Command,
            yaw_rate_threshold: profile.get_float(section, "yaw_rate_threshold"),
            accel_smoothing: profile.get_float(section, "accel_smoothing"),
            gps_drift_correction_alpha: profile.get_float(section, "gps_drift_correction_alpha"),
            gps_drift_correction_min_speed_kmh: profile.get_float(section, "gps_drift_correction_min_speed_kmh"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct LowSpeedTractionStatus {
    pub phase: Option<Phase>,
    pub slip_detected: bool,
    pub slip_ratio: f64,
    pub throttle_multiplier: f64,
    pub estimated_speed_kmh: f64,
    pub current_slip_threshold: f64,
}

pub struct LowSpeedTractionManager {
    config: LowSpeedTractionConfig,
    armed: Arc<AtomicBool>,
    phase: Phase,
    throttle_multiplier: f64,
    launch_throttle_target: Command,
    slip_detected: bool,
    estimated_ground_speed_ms: f64,
    prev_wheel_speed_ms: f64,
    wheel_accel_smooth: f64,
    vehicle_accel_smooth: f64,
    slip_ratio: f64,
    current_slip_threshold: f64,
}

impl LowSpeedTractionManager {
    pub fn new(config: LowSpeedTractionConfig) -> Self {
        LowSpeedTractionManager {
            config,
            armed: Arc::new(AtomicBool::new(true)),
            phase: Phase::Launch,
            throttle_multiplier: 1.0,
            launch_throttle_target: 0,
            slip_detected: false,
            estimated_ground_speed_ms: 0.0,
            prev_wheel_speed_ms: 0.0,
            wheel_accel_smooth: 0.0,
            vehicle_accel_smooth: 0.0,
            slip_ratio: 0.0,
            current_slip_threshold: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.phase = Phase::Launch;
        self.throttle_multiplier = 1.0;
        self.launch_throttle_target = 0;
        self.slip_detected = false;
        self.estimated_ground_speed_ms = 0.0;
        self.prev_wheel_speed_ms = 0.0;
        self.wheel_accel_smooth = 0.0;
        self.vehicle_accel_smooth = 0.0;
        self.slip_ratio = 0.0;
    }

    pub fn armed_handle(&self) -> Arc<AtomicBool> {
        self.armed.clone()
    }

    pub fn status(&self) -> LowSpeedTractionStatus {
        LowSpeedTractionStatus {
            phase: Some(self.phase),
            slip_detected: self.slip_detected,
            slip_ratio: self.slip_ratio,
            throttle_multiplier: self.throttle_multiplier,
            estimated_speed_kmh: self.estimated_ground_speed_ms * 3.6,
            current_slip_threshold: self.current_slip_threshold,
        }
    }

    fn slip_ratio_of(ground_speed_ms: f64, wheel_speed_ms: f64) -> f64 {
        if ground_speed_ms < 0.5 {
            if wheel_speed_ms < 0.1 {
                return 0.0;
            }
            return (wheel_speed_ms - ground_speed_ms) / wheel_speed_ms.max(1.0);
        }
        (wheel_speed_ms - ground_speed_ms) / ground_speed_ms
    }

    fn phase_of(ground_speed_kmh: f64, launch_end: f64, transition_end: f64) -> Phase {
        if ground_speed_kmh < launch_end {
            Phase::Launch
        } else if ground_speed_kmh < transition_end {
            Phase::Transition
        } else {
            Phase::Cruise
        }
    }

    fn update_ground_speed_estimate(&mut self, imu_accel: f64, gps_speed_ms: f64, gps_valid: bool, dt: f64) {
        self.estimated_ground_speed_ms += imu_accel * dt;
        self.estimated_ground_speed_ms = self.estimated_ground_speed_ms.max(0.0);

        if gps_valid && gps_speed_ms > self.config.gps_drift_correction_min_speed_kmh / 3.6 {
            let drift_error = gps_speed_ms - self.estimated_ground_speed_ms;
            self.estimated_ground_speed_ms += self.config.gps_drift_correction_alpha * drift_error;
        }

        if self.prev_wheel_speed_ms > 1.0 {
            let max_reasonable = self.prev_wheel_speed_ms * 1.1;
            self.estimated_ground_speed_ms = self.estimated_ground_speed_ms.min(max_reasonable);
        }
    }

    /// Update estimator state. Call at IMU rate (20-50 Hz). `dt` in
    /// seconds, clamped internally to [0.001, 0.1].
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        wheel_speed_kmh: f64,
        imu_forward_accel: f64,
        gps_speed_kmh: f64,
        gps_valid: bool,
        dt: f64,
    ) {
        if !self.armed.load(Ordering::Relaxed) {
            return;
        }

        let dt = dt.clamp(0.001, 0.1);
        let wheel_speed_ms = wheel_speed_kmh / 3.6;
        let gps_speed_ms = gps_speed_kmh / 3.6;

        self.update_ground_speed_estimate(imu_forward_accel, gps_speed_ms, gps_valid, dt);

        let wheel_accel_raw = (wheel_speed_ms - self.prev_wheel_speed_ms) / dt;
        self.prev_wheel_speed_ms = wheel_speed_ms;

        self.wheel_accel_smooth += self.config.accel_smoothing * (wheel_accel_raw - self.wheel_accel_smooth);
        self.vehicle_accel_smooth += self.config.accel_smoothing * (imu_forward_accel - self.vehicle_accel_smooth);

        self.slip_ratio = Self::slip_ratio_of(self.estimated_ground_speed_ms, wheel_speed_ms);
        self.phase = Self::phase_of(
            self.estimated_ground_speed_ms * 3.6,
            self.config.launch_phase_end_kmh,
            self.config.transition_phase_end_kmh,
        );
    }

    fn launch_control(&mut self, throttle_input: Command, slip_ratio: f64, grip_multiplier: f64) -> Command {
        if throttle_input <= 0 {
            self.launch_throttle_target = 0;
            return throttle_input;
        }

        let adjusted_target = self.config.launch_target_slip * grip_multiplier;

        self.launch_throttle_target = (self.launch_throttle_target + self.config.launch_max_throttle_rate)
            .min(throttle_input.min(self.config.launch_throttle_ceiling));

        if slip_ratio > adjusted_target * 1.3 {
            self.slip_detected = true;
            (self.launch_throttle_target as f64 * self.config.launch_slip_high_cut) as Command
        } else if slip_ratio > adjusted_target * 1.1 {
            self.slip_detected = true;
            self.launch_throttle_target
        } else {
            self.slip_detected = false;
            self.launch_throttle_target
        }
    }

    fn cruise_control(&mut self, throttle_input: Command, slip_ratio: f64, yaw_rate_abs: f64, grip_multiplier: f64) -> Command {
        if throttle_input <= 0 {
            self.throttle_multiplier = 1.0;
            self.slip_detected = false;
            return throttle_input;
        }

        let turn_factor = if yaw_rate_abs > self.config.yaw_rate_threshold { 1.5 } else { 1.0 };
        let adjusted_threshold = self.config.cruise_slip_threshold * grip_multiplier * turn_factor;
        self.current_slip_threshold = adjusted_threshold;

        if slip_ratio > adjusted_threshold {
            self.slip_detected = true;
            self.throttle_multiplier = (self.throttle_multiplier - self.config.cruise_throttle_cut_rate).max(self.config.cruise_min_multiplier);
        } else {
            self.slip_detected = false;
            self.throttle_multiplier = (self.throttle_multiplier + self.config.cruise_recovery_rate).min(1.0);
        }

        (throttle_input as f64 * self.throttle_multiplier) as Command
    }

    fn transition_control(&mut self, throttle_input: Command, slip_ratio: f64, ground_speed_kmh: f64, yaw_rate_abs: f64, grip_multiplier: f64) -> Command {
        let span = self.config.transition_phase_end_kmh - self.config.launch_phase_end_kmh;
        let blend = ((ground_speed_kmh - self.config.launch_phase_end_kmh) / span).clamp(0.0, 1.0);

        let launch_output = self.launch_control(throttle_input, slip_ratio, grip_multiplier);
        let cruise_output = self.cruise_control(throttle_input, slip_ratio, yaw_rate_abs, grip_multiplier);

        (launch_output as f64 * (1.0 - blend) + cruise_output as f64 * blend) as Command
    }

    /// Apply traction management to a throttle command. Only affects
    /// positive (forward acceleration) throttle.
    pub fn apply_to_throttle(&mut self, throttle: Command, yaw_rate_dps: f64, grip_multiplier: f64) -> Command {
        if !self.armed.load(Ordering::Relaxed) {
            self.slip_detected = false;
            self.throttle_multiplier = 1.0;
            return throttle;
        }

        if throttle <= 0 || throttle < self.config.min_throttle_for_slip {
            return throttle;
        }

        let yaw_rate_abs = yaw_rate_dps.abs();
        let slip_ratio = self.slip_ratio;

        match self.phase {
            Phase::Launch => self.launch_control(throttle, slip_ratio, grip_multiplier),
            Phase::Transition => {
                let ground_speed_kmh = self.estimated_ground_speed_ms * 3.6;
                self.transition_control(throttle, slip_ratio, ground_speed_kmh, yaw_rate_abs, grip_multiplier)
            }
            Phase::Cruise => self.cruise_control(throttle, slip_ratio, yaw_rate_abs, grip_multiplier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LowSpeedTractionConfig {
        LowSpeedTractionConfig {
            launch_phase_end_kmh: 5.0,
            transition_phase_end_kmh: 15.0,
            launch_target_slip: 0.1,
            launch_slip_tolerance: 0.05,
            launch_max_throttle_rate: 500,
            launch_throttle_ceiling: 20000,
            launch_slip_high_cut: 0.5,
            cruise_slip_threshold: 0.2,
            cruise_throttle_cut_rate: 0.1,
            cruise_recovery_rate: 0.02,
            cruise_min_multiplier: 0.4,
            min_throttle_for_slip: 1000,
            yaw_rate_threshold: 30.0,
            accel_smoothing: 0.3,
            gps_drift_correction_alpha: 0.01,
            gps_drift_correction_min_speed_kmh: 3.0,
        }
    }

    #[test]
    fn launch_phase_ramps_throttle_target_gradually() {
        let mut tc = LowSpeedTractionManager::new(cfg());
        tc.update(0.0, 0.0, 0.0, false, 0.02);
        assert_eq!(tc.phase, Phase::Launch);
        let out = tc.apply_to_throttle(20000, 0.0, 1.0);
        assert!(out < 20000);
        assert!(out > 0);
    }

    #[test]
    fn cruise_cuts_throttle_on_excess_slip() {
        let mut tc = LowSpeedTractionManager::new(cfg());
        // Drive into cruise phase with wheel spinning far faster than
        // the (near-zero) IMU-integrated ground speed estimate.
        for _ in 0..40 {
            tc.update(30.0, 0.0, 0.0, false, 0.02);
        }
        assert_eq!(tc.phase, Phase::Cruise);
        let out = tc.apply_to_throttle(20000, 0.0, 1.0);
        assert!(out < 20000);
    }

    #[test]
    fn negative_throttle_passes_through_untouched() {
        let mut tc = LowSpeedTractionManager::new(cfg());
        tc.update(0.0, 0.0, 0.0, false, 0.02);
        assert_eq!(tc.apply_to_throttle(-15000, 0.0, 1.0), -15000);
    }
}
