//! Yaw-rate stability control (ESC-lite): a bicycle-model check of
//! actual rotation against commanded rotation, reacting locally within
//! one control cycle rather than waiting on a round trip to the
//! driver over a high-latency link.
//!
//! `r_des = v / L * tan(delta)`; oversteer (rotating faster than
//! commanded) cuts throttle hard and may add a virtual brake,
//! understeer cuts mildly so the front tires can regain grip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::CarProfile;
use crate::state::Command;

pub struct YawRateConfig {
    pub grip_factor: f64,
    pub min_speed_kmh: f64,
    pub oversteer_threshold: f64,
    pub understeer_threshold: f64,
    pub oversteer_cut_rate: f64,
    pub understeer_cut_rate: f64,
    pub min_throttle_mult: f64,
    pub recovery_rate: f64,
    pub fast_recovery_rate: f64,
    pub virtual_brake_enabled: bool,
    pub virtual_brake_threshold: f64,
    pub max_virtual_brake: Command,
    pub yaw_smoothing: f64,
}

impl YawRateConfig {
    pub fn from_profile(profile: &CarProfile) -> Self {
        let section = "yaw_rate_controller";
        YawRateConfig {
            grip_factor: profile.get_float(section, "grip_factor"),
            min_speed_kmh: profile.get_float(section, "min_speed_kmh"),
            oversteer_threshold: profile.get_float(section, "oversteer_threshold"),
            understeer_threshold: profile.get_float(section, "understeer_threshold"),
            oversteer_cut_rate: profile.get_float(section, "oversteer_cut_rate"),
            understeer_cut_rate: profile.get_float(section, "understeer_cut_rate"),
            min_throttle_mult: profile.get_float(section, "min_throttle_mult"),
            recovery_rate: profile.get_float(section, "recovery_rate"),
            fast_recovery_rate: profile.get_float(section, "fast_recovery_rate"),
            virtual_brake_enabled: profile.get_bool(section, "virtual_brake_enabled"),
            virtual_brake_threshold: profile.get_float(section, "virtual_brake_threshold"),
            max_virtual_brake: profile.get_int(section, "max_virtual_brake") as Command,
            yaw_smoothing: profile.get_float(section, "yaw_smoothing"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum Intervention {
    None,
    Oversteer,
    Understeer,
}

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct YawRateStatus {
    pub intervention: Intervention,
    pub intervention_active: bool,
    pub throttle_multiplier: f64,
    pub virtual_brake: Command,
    pub yaw_rate_desired: f64,
    pub yaw_rate_actual: f64,
    pub yaw_error: f64,
}

pub struct YawRateController {
    config: YawRateConfig,
    armed: Arc<AtomicBool>,
    wheelbase_m: f64,
    max_steering_angle_deg: f64,
    throttle_multiplier: f64,
    virtual_brake: Command,
    yaw_rate_smooth: f64,
    intervention_active: bool,
    intervention_elapsed_s: f64,
    yaw_rate_desired: f64,
    yaw_rate_actual: f64,
    yaw_error: f64,
    intervention: Intervention,
}

impl YawRateController {
    pub fn new(config: YawRateConfig, wheelbase_m: f64, max_steering_angle_deg: f64) -> Self {
        YawRateController {
            config,
            armed: Arc::new(AtomicBool::new(true)),
            wheelbase_m,
            max_steering_angle_deg,
            throttle_multiplier: 1.0,
            virtual_brake: 0,
            yaw_rate_smooth: 0.0,
            intervention_active: false,
            intervention_elapsed_s: 0.0,
            yaw_rate_desired: 0.0,
            yaw_rate_actual: 0.0,
            yaw_error: 0.0,
            intervention: Intervention::None,
        }
    }

    pub fn reset(&mut self) {
        self.throttle_multiplier = 1.0;
        self.virtual_brake = 0;
        self.yaw_rate_smooth = 0.0;
        self.intervention_active = false;
        self.intervention_elapsed_s = 0.0;
        self.intervention = Intervention::None;
        self.yaw_error = 0.0;
    }

    pub fn armed_handle(&self) -> Arc<AtomicBool> {
        self.armed.clone()
    }

    pub fn status(&self) -> YawRateStatus {
        YawRateStatus {
            intervention: self.intervention,
            intervention_active: self.intervention_active,
            throttle_multiplier: self.throttle_multiplier,
            virtual_brake: self.virtual_brake,
            yaw_rate_desired: self.yaw_rate_desired,
            yaw_rate_actual: self.yaw_rate_actual,
            yaw_error: self.yaw_error,
        }
    }

    fn desired_yaw_rate(&self, speed_kmh: f64, steering: Command) -> f64 {
        let v = speed_kmh / 3.6;
        let delta_deg = (steering as f64 / 1000.0) * self.max_steering_angle_deg;
        let delta_rad = delta_deg.to_radians();
        if delta_rad.abs() < 0.001 {
            return 0.0;
        }
        let r_rad_s = (v / self.wheelbase_m) * delta_rad.tan();
        -(r_rad_s.to_degrees()) * self.config.grip_factor
    }

    /// `yaw_rate_dps`: gyro Z already sign-corrected for mount
    /// orientation, positive = CCW. `dt` in seconds.
    pub fn update(&mut self, yaw_rate_dps: f64, speed_kmh: f64, steering: Command, dt: f64) {
        let dt = dt.clamp(0.001, 0.1);

        self.yaw_rate_smooth += self.config.yaw_smoothing * (yaw_rate_dps - self.yaw_rate_smooth);
        self.yaw_rate_actual = self.yaw_rate_smooth;

        self.yaw_rate_desired = self.desired_yaw_rate(speed_kmh, steering);
        self.yaw_error = self.yaw_rate_desired - self.yaw_rate_actual;

        if !self.armed.load(Ordering::Relaxed) {
            self.intervention = Intervention::None;
            self.intervention_active = false;
            self.throttle_multiplier = 1.0;
            self.virtual_brake = 0;
            return;
        }

        self.update_intervention(speed_kmh, dt);
    }

    fn update_intervention(&mut self, speed_kmh: f64, dt: f64) {
        self.virtual_brake = 0;

        if speed_kmh < self.config.min_speed_kmh {
            self.intervention = Intervention::None;
            self.recover(dt);
            return;
        }

        let abs_desired = self.yaw_rate_desired.abs();
        let abs_actual = self.yaw_rate_actual.abs();

        let mut is_oversteer = false;
        let mut is_understeer = false;

        if abs_desired < 5.0 {
            if abs_actual > self.config.oversteer_threshold {
                is_oversteer = true;
            }
        } else {
            let same_direction = self.yaw_rate_desired * self.yaw_rate_actual > 0.0;
            if same_direction {
                if abs_actual > abs_desired + self.config.oversteer_threshold {
                    is_oversteer = true;
                } else if abs_actual < abs_desired - self.config.understeer_threshold {
                    is_understeer = true;
                }
            } else if abs_actual > 10.0 {
                is_oversteer = true;
            }
        }

        if is_oversteer {
            self.intervention = Intervention::Oversteer;
            self.apply_oversteer_correction();
        } else if is_understeer {
            self.intervention = Intervention::Understeer;
            self.apply_understeer_correction();
        } else {
            self.intervention = Intervention::None;
            self.recover(dt);
        }
    }

    fn apply_oversteer_correction(&mut self) {
        self.intervention_active = true;
        self.intervention_elapsed_s = 0.0;

        self.throttle_multiplier = (self.throttle_multiplier - self.config.oversteer_cut_rate).max(self.config.min_throttle_mult);

        if self.config.virtual_brake_enabled {
            let severity = self.yaw_rate_actual.abs() - self.yaw_rate_desired.abs();
            if severity > self.config.virtual_brake_threshold {
                let brake_factor = ((severity - self.config.virtual_brake_threshold) / 50.0).min(1.0);
                self.virtual_brake = (brake_factor * self.config.max_virtual_brake as f64) as Command;
            }
        }
    }

    fn apply_understeer_correction(&mut self) {
        self.intervention_active = true;
        self.intervention_elapsed_s = 0.0;
        self.throttle_multiplier = (self.throttle_multiplier - self.config.understeer_cut_rate).max(self.config.min_throttle_mult);
    }

    fn recover(&mut self, dt: f64) {
        if !self.intervention_active {
            self.throttle_multiplier = 1.0;
            return;
        }

        self.intervention_elapsed_s += dt;

        let rate = if self.intervention_elapsed_s > 0.2 && self.yaw_error.abs() < 10.0 {
            self.config.fast_recovery_rate
        } else {
            self.config.recovery_rate
        };

        self.throttle_multiplier = (self.throttle_multiplier + rate).min(1.0);
        if self.throttle_multiplier >= 1.0 {
            self.intervention_active = false;
        }
    }

    /// Apply stability control to throttle. Only affects positive
    /// (forward) throttle.
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

    fn cfg() -> YawRateConfig {
        YawRateConfig {
            grip_factor: 0.35,
            min_speed_kmh: 5.0,
            oversteer_threshold: 25.0,
            understeer_threshold: 15.0,
            oversteer_cut_rate: 0.15,
            understeer_cut_rate: 0.05,
            min_throttle_mult: 0.3,
            recovery_rate: 0.03,
            fast_recovery_rate: 0.08,
            virtual_brake_enabled: true,
            virtual_brake_threshold: 50.0,
            max_virtual_brake: 400,
            yaw_smoothing: 0.4,
        }
    }

    #[test]
    fn straight_line_no_intervention() {
        let mut c = YawRateController::new(cfg(), 0.32, 30.0);
        c.update(0.0, 20.0, 0, 0.02);
        assert_eq!(c.status().intervention, Intervention::None);
        assert_eq!(c.status().throttle_multiplier, 1.0);
    }

    #[test]
    fn spin_out_triggers_oversteer_cut() {
        let mut c = YawRateController::new(cfg(), 0.32, 30.0);
        for _ in 0..5 {
            c.update(80.0, 20.0, 0, 0.02);
        }
        assert_eq!(c.status().intervention, Intervention::Oversteer);
        assert!(c.status().throttle_multiplier < 1.0);
    }

    #[test]
    fn below_min_speed_never_intervenes() {
        let mut c = YawRateController::new(cfg(), 0.32, 30.0);
        c.update(200.0, 2.0, 1000, 0.02);
        assert_eq!(c.status().intervention, Intervention::None);
    }
}
