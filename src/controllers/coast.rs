//! Coast-to-throttle transition smoothing. Brushless ESCs apply fairly
//! aggressive drag braking the instant throttle is released, which
//! feels abrupt over a high-latency link; this injects a brief,
//! linearly decaying counter-throttle across the release edge to take
//! the jolt out of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::CarProfile;
use crate::state::Command;

const THROTTLE_SCALE: f64 = 32767.0 / 1000.0;

pub struct CoastConfig {
    pub release_threshold_high: Command,
    pub release_threshold_low: Command,
    pub coast_duration_s: f64,
    pub coast_throttle: Command,
    pub min_speed_kmh: f64,
}

impl CoastConfig {
    pub fn from_profile(profile: &CarProfile) -> Self {
        let section = "coast_control";
        CoastConfig {
            release_threshold_high: (profile.get_int(section, "release_threshold_high") as f64 * THROTTLE_SCALE) as Command,
            release_threshold_low: (profile.get_int(section, "release_threshold_low") as f64 * THROTTLE_SCALE) as Command,
            coast_duration_s: profile.get_float(section, "coast_duration_s"),
            coast_throttle: (profile.get_int(section, "coast_throttle") as f64 * THROTTLE_SCALE) as Command,
            min_speed_kmh: profile.get_float(section, "min_speed_kmh"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct CoastStatus {
    pub active: bool,
    pub injection: Command,
}

pub struct CoastControl {
    config: CoastConfig,
    armed: Arc<AtomicBool>,
    last_throttle: Command,
    elapsed_since_release_s: f64,
    active: bool,
    injection: Command,
}

impl CoastControl {
    pub fn new(config: CoastConfig) -> Self {
        CoastControl {
            config,
            armed: Arc::new(AtomicBool::new(true)),
            last_throttle: 0,
            elapsed_since_release_s: 0.0,
            active: false,
            injection: 0,
        }
    }

    pub fn armed_handle(&self) -> Arc<AtomicBool> {
        self.armed.clone()
    }

    pub fn reset(&mut self) {
        self.last_throttle = 0;
        self.elapsed_since_release_s = 0.0;
        self.active = false;
        self.injection = 0;
    }

    pub fn status(&self) -> CoastStatus {
        CoastStatus {
            active: self.active,
            injection: self.injection,
        }
    }

    fn detects_release(&self, throttle_input: Command) -> bool {
        let was_throttling = self.last_throttle > self.config.release_threshold_high;
        let now_released = throttle_input < self.config.release_threshold_low;
        was_throttling && now_released
    }

    fn coast_injection(&self, elapsed_s: f64) -> Command {
        if elapsed_s >= self.config.coast_duration_s {
            return 0;
        }
        let progress = elapsed_s / self.config.coast_duration_s;
        let injection = (self.config.coast_throttle as f64 * (1.0 - progress)) as Command;
        injection.max(0)
    }

    /// `speed_kmh`: `None` skips the minimum-speed gate.
    pub fn update(&mut self, throttle_input: Command, speed_kmh: Option<f64>, dt: f64) -> Command {
        if !self.armed.load(Ordering::Relaxed) {
            self.last_throttle = throttle_input;
            self.active = false;
            self.injection = 0;
            return throttle_input;
        }

        if self.detects_release(throttle_input) && speed_kmh.map_or(true, |s| s > self.config.min_speed_kmh) {
            self.active = true;
            self.elapsed_since_release_s = 0.0;
        }

        self.last_throttle = throttle_input;

        if !self.active {
            self.injection = 0;
            return throttle_input;
        }

        self.elapsed_since_release_s += dt;

        if self.elapsed_since_release_s >= self.config.coast_duration_s {
            self.active = false;
            self.injection = 0;
            return throttle_input;
        }

        if throttle_input > self.config.release_threshold_low || throttle_input < -self.config.release_threshold_low {
            self.active = false;
            self.injection = 0;
            return throttle_input;
        }

        self.injection = self.coast_injection(self.elapsed_since_release_s);
        (throttle_input + self.injection).min(self.config.coast_throttle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CoastConfig {
        CoastConfig {
            release_threshold_high: 3000,
            release_threshold_low: 1500,
            coast_duration_s: 0.3,
            coast_throttle: 3000,
            min_speed_kmh: 5.0,
        }
    }

    #[test]
    fn injects_counter_throttle_on_release() {
        let mut c = CoastControl::new(cfg());
        c.update(20000, Some(20.0), 0.02);
        let out = c.update(0, Some(20.0), 0.02);
        assert!(out > 0);
        assert!(c.status().active);
    }

    #[test]
    fn injection_decays_to_zero_over_duration() {
        let mut c = CoastControl::new(cfg());
        c.update(20000, Some(20.0), 0.02);
        c.update(0, Some(20.0), 0.02);
        for _ in 0..20 {
            c.update(0, Some(20.0), 0.02);
        }
        assert!(!c.status().active);
        assert_eq!(c.status().injection, 0);
    }

    #[test]
    fn skipped_below_min_speed() {
        let mut c = CoastControl::new(cfg());
        c.update(20000, Some(1.0), 0.02);
        let out = c.update(0, Some(1.0), 0.02);
        assert_eq!(out, 0);
        assert!(!c.status().active);
    }
}
