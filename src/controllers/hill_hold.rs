//! Incline assist: holds position against rollback by injecting
//! counter-throttle proportional to pitch, and releases it according to
//! whether the driver's next input fights gravity or follows it.
//!
//! Activation is gated on a settling time of continuous stillness so
//! chassis pitch from braking or accelerating (not an actual slope)
//! never trips it — see `settling_time_s`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::CarProfile;
use crate::state::Command;

const THROTTLE_SCALE: f64 = 32767.0 / 1000.0;

pub struct HillHoldConfig {
    pub pitch_threshold_deg: f64,
    pub speed_threshold_kmh: f64,
    pub throttle_deadzone: Command,
    pub hold_strength: f64,
    pub max_hold_force: Command,
    pub immediate_release_threshold: Command,
    pub blend_rate: f64,
    pub timeout_s: f64,
    pub settling_time_s: f64,
}

impl HillHoldConfig {
    pub fn from_profile(profile: &CarProfile) -> Self {
        let section = "hill_hold";
        HillHoldConfig {
            pitch_threshold_deg: profile.get_float(section, "pitch_threshold_deg"),
            speed_threshold_kmh: profile.get_float(section, "speed_threshold_kmh"),
            throttle_deadzone: (profile.get_int(section, "throttle_deadzone") as f64 * THROTTLE_SCALE) as Command,
            hold_strength: profile.get_float(section, "hold_strength") * THROTTLE_SCALE,
            max_hold_force: (profile.get_int(section, "max_hold_force") as f64 * THROTTLE_SCALE) as Command,
            immediate_release_threshold: (profile.get_int(section, "immediate_release_threshold") as f64 * THROTTLE_SCALE) as Command,
            blend_rate: profile.get_float(section, "blend_rate"),
            timeout_s: profile.get_float(section, "timeout_s"),
            settling_time_s: profile.get_float(section, "settling_time_s"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
enum ReleaseMode {
    Hold,
    Immediate,
    BlendUp,
    BlendDown,
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct HillHoldStatus {
    pub active: bool,
    pub hold_force: Command,
    pub blend_factor: f64,
    pub pitch_at_activation: f64,
}

pub struct HillHold {
    config: HillHoldConfig,
    armed: Arc<AtomicBool>,
    active: bool,
    hold_force: Command,
    blend_factor: f64,
    activation_elapsed_s: f64,
    pitch_at_activation: f64,
    stationary_since_s: Option<f64>,
    elapsed_s: f64,
}

impl HillHold {
    pub fn new(config: HillHoldConfig) -> Self {
        HillHold {
            config,
            armed: Arc::new(AtomicBool::new(true)),
            active: false,
            hold_force: 0,
            blend_factor: 1.0,
            activation_elapsed_s: 0.0,
            pitch_at_activation: 0.0,
            stationary_since_s: None,
            elapsed_s: 0.0,
        }
    }

    pub fn armed_handle(&self) -> Arc<AtomicBool> {
        self.armed.clone()
    }

    pub fn reset(&mut self) {
        self.active = false;
        self.hold_force = 0;
        self.blend_factor = 1.0;
        self.activation_elapsed_s = 0.0;
        self.pitch_at_activation = 0.0;
        self.stationary_since_s = None;
    }

    pub fn status(&self) -> HillHoldStatus {
        HillHoldStatus {
            active: self.active,
            hold_force: self.hold_force,
            blend_factor: self.blend_factor,
            pitch_at_activation: self.pitch_at_activation,
        }
    }

    fn hold_force_for(&self, pitch_deg: f64) -> Command {
        let force = (pitch_deg * self.config.hold_strength) as Command;
        force.clamp(-self.config.max_hold_force, self.config.max_hold_force)
    }

    fn should_activate(&mut self, pitch_deg: f64, speed_kmh: f64, throttle_input: Command, dt: f64) -> bool {
        let stationary = speed_kmh.abs() < self.config.speed_threshold_kmh;
        let throttle_neutral = throttle_input.unsigned_abs() < self.config.throttle_deadzone.unsigned_abs();
        let on_incline = pitch_deg.abs() > self.config.pitch_threshold_deg;

        if stationary && throttle_neutral {
            self.stationary_since_s = Some(self.stationary_since_s.unwrap_or(0.0) + dt);
        } else {
            self.stationary_since_s = None;
            return false;
        }

        let settled = self.stationary_since_s.unwrap_or(0.0) >= self.config.settling_time_s;
        on_incline && settled
    }

    fn release_mode(&self, throttle_input: Command, pitch_deg: f64) -> ReleaseMode {
        if throttle_input.unsigned_abs() < self.config.throttle_deadzone.unsigned_abs() {
            return ReleaseMode::Hold;
        }
        if throttle_input.unsigned_abs() > self.config.immediate_release_threshold.unsigned_abs() {
            return ReleaseMode::Immediate;
        }

        let throttle_direction = if throttle_input > 0 { 1 } else { -1 };
        let hill_direction = if pitch_deg > 0.0 { 1 } else { -1 };
        let going_uphill = throttle_direction == hill_direction;

        if going_uphill {
            ReleaseMode::BlendUp
        } else {
            ReleaseMode::BlendDown
        }
    }

    /// `pitch_deg`: positive = nose up. `dt` in seconds.
    pub fn update(&mut self, pitch_deg: f64, speed_kmh: f64, throttle_input: Command, dt: f64) -> Command {
        if !self.armed.load(Ordering::Relaxed) {
            self.active = false;
            return throttle_input;
        }

        self.elapsed_s += dt;

        if !self.active {
            if self.should_activate(pitch_deg, speed_kmh, throttle_input, dt) {
                self.active = true;
                self.blend_factor = 1.0;
                self.activation_elapsed_s = self.elapsed_s;
                self.pitch_at_activation = pitch_deg;
                self.hold_force = self.hold_force_for(pitch_deg);
            }
            return throttle_input;
        }

        if self.elapsed_s - self.activation_elapsed_s > self.config.timeout_s {
            self.active = false;
            return throttle_input;
        }

        if speed_kmh.abs() > self.config.speed_threshold_kmh * 2.0 {
            self.active = false;
            return throttle_input;
        }

        match self.release_mode(throttle_input, self.pitch_at_activation) {
            ReleaseMode::Immediate => {
                self.active = false;
                throttle_input
            }
            ReleaseMode::Hold => self.hold_force,
            ReleaseMode::BlendUp => {
                self.blend_factor = (self.blend_factor - self.config.blend_rate * 2.0).max(0.0);
                self.blended_output(throttle_input)
            }
            ReleaseMode::BlendDown => {
                self.blend_factor = (self.blend_factor - self.config.blend_rate * 0.5).max(0.0);
                self.blended_output(throttle_input)
            }
        }
    }

    fn blended_output(&mut self, throttle_input: Command) -> Command {
        if self.blend_factor <= 0.0 {
            self.active = false;
            return throttle_input;
        }
        let blended = self.hold_force as f64 * self.blend_factor + throttle_input as f64 * (1.0 - self.blend_factor);
        blended.clamp(-32767.0, 32767.0) as Command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> HillHoldConfig {
        HillHoldConfig {
            pitch_threshold_deg: 5.0,
            speed_threshold_kmh: 1.0,
            throttle_deadzone: 150,
            hold_strength: 30.0,
            max_hold_force: 10000,
            immediate_release_threshold: 9000,
            blend_rate: 0.05,
            timeout_s: 30.0,
            settling_time_s: 0.5,
        }
    }

    #[test]
    fn does_not_activate_before_settling_time() {
        let mut hh = HillHold::new(cfg());
        let out = hh.update(10.0, 0.0, 0, 0.1);
        assert_eq!(out, 0);
        assert!(!hh.status().active);
    }

    #[test]
    fn activates_after_settling_time_on_incline() {
        let mut hh = HillHold::new(cfg());
        for _ in 0..10 {
            hh.update(10.0, 0.0, 0, 0.1);
        }
        assert!(hh.status().active);
        assert!(hh.status().hold_force > 0);
    }

    #[test]
    fn strong_throttle_releases_immediately() {
        let mut hh = HillHold::new(cfg());
        for _ in 0..10 {
            hh.update(10.0, 0.0, 0, 0.1);
        }
        assert!(hh.status().active);
        let out = hh.update(10.0, 0.0, 20000, 0.02);
        assert_eq!(out, 20000);
        assert!(!hh.status().active);
    }
}
