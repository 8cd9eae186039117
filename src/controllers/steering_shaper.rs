//! Latency-aware steering processor: the single biggest win for
//! driving over a high-latency link. Limits steering range at speed,
//! rate-limits changes so delayed human input can't snap the car into
//! oversteer, nudges a subtle counter-steer when the driver releases
//! the wheel but the car is still rotating, and lightly smooths the
//! result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::CarProfile;
use crate::state::Command;

pub struct SteeringShaperConfig {
    pub max_steering_ratio: f64,
    pub min_steering_ratio: f64,
    pub low_speed_kmh: f64,
    pub high_speed_kmh: f64,
    pub max_rate: f64,
    pub center_rate: f64,
    pub counter_steer_enabled: bool,
    pub counter_steer_min_yaw: f64,
    pub counter_steer_strength: f64,
    pub counter_steer_max_input: Command,
    pub counter_steer_min_speed_kmh: f64,
    pub counter_steer_max_amount: Command,
    pub smoothing_alpha: f64,
}

impl SteeringShaperConfig {
    pub fn from_profile(profile: &CarProfile) -> Self {
        let section = "steering_shaper";
        SteeringShaperConfig {
            max_steering_ratio: profile.get_float(section, "max_steering_ratio"),
            min_steering_ratio: profile.get_float(section, "min_steering_ratio"),
            low_speed_kmh: profile.get_float(section, "low_speed_kmh"),
            high_speed_kmh: profile.get_float(section, "high_speed_kmh"),
            max_rate: profile.get_float(section, "max_rate"),
            center_rate: profile.get_float(section, "center_rate"),
            counter_steer_enabled: profile.get_bool(section, "counter_steer_enabled"),
            counter_steer_min_yaw: profile.get_float(section, "counter_steer_min_yaw"),
            counter_steer_strength: profile.get_float(section, "counter_steer_strength"),
            counter_steer_max_input: profile.get_int(section, "counter_steer_max_input") as Command,
            counter_steer_min_speed_kmh: profile.get_float(section, "counter_steer_min_speed_kmh"),
            counter_steer_max_amount: profile.get_int(section, "counter_steer_max_amount") as Command,
            smoothing_alpha: profile.get_float(section, "smoothing_alpha"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct SteeringShaperStatus {
    pub steering_limit: f64,
    pub rate_limited: bool,
    pub counter_steer_active: bool,
    pub counter_steer_amount: Command,
}

pub struct SteeringShaper {
    config: SteeringShaperConfig,
    armed: Arc<AtomicBool>,
    prev_output: f64,
    steering_limit: f64,
    rate_limited: bool,
    counter_steer_active: bool,
    counter_steer_amount: Command,
}

impl SteeringShaper {
    pub fn new(config: SteeringShaperConfig) -> Self {
        SteeringShaper {
            config,
            armed: Arc::new(AtomicBool::new(true)),
            prev_output: 0.0,
            steering_limit: 1.0,
            rate_limited: false,
            counter_steer_active: false,
            counter_steer_amount: 0,
        }
    }

    /// Shared handle an admin surface can flip to disable this
    /// controller without touching the pipeline's ownership of it.
    pub fn armed_handle(&self) -> Arc<AtomicBool> {
        self.armed.clone()
    }

    pub fn reset(&mut self) {
        self.prev_output = 0.0;
        self.rate_limited = false;
        self.counter_steer_active = false;
        self.counter_steer_amount = 0;
    }

    pub fn status(&self) -> SteeringShaperStatus {
        SteeringShaperStatus {
            steering_limit: self.steering_limit,
            rate_limited: self.rate_limited,
            counter_steer_active: self.counter_steer_active,
            counter_steer_amount: self.counter_steer_amount,
        }
    }

    fn apply_speed_limit(&mut self, steering: f64, speed_kmh: f64) -> f64 {
        let limit = if speed_kmh <= self.config.low_speed_kmh {
            self.config.max_steering_ratio
        } else if speed_kmh >= self.config.high_speed_kmh {
            self.config.min_steering_ratio
        } else {
            let t = (speed_kmh - self.config.low_speed_kmh) / (self.config.high_speed_kmh - self.config.low_speed_kmh);
            self.config.max_steering_ratio + t * (self.config.min_steering_ratio - self.config.max_steering_ratio)
        };
        self.steering_limit = limit;
        steering * limit
    }

    fn apply_counter_steer_assist(&mut self, steering: f64, speed_kmh: f64, yaw_rate_dps: f64) -> f64 {
        self.counter_steer_active = false;
        self.counter_steer_amount = 0;

        if !self.config.counter_steer_enabled
            || speed_kmh < self.config.counter_steer_min_speed_kmh
            || steering.abs() > self.config.counter_steer_max_input as f64
            || yaw_rate_dps.abs() < self.config.counter_steer_min_yaw
        {
            return steering;
        }

        let yaw_factor = (yaw_rate_dps.abs() / 60.0).min(1.0);
        let assist = (-yaw_rate_dps * self.config.counter_steer_strength * yaw_factor * 10.0)
            .clamp(-(self.config.counter_steer_max_amount as f64), self.config.counter_steer_max_amount as f64);

        self.counter_steer_active = true;
        self.counter_steer_amount = assist as Command;
        steering + assist
    }

    fn apply_rate_limit(&mut self, steering: f64, dt: f64) -> f64 {
        self.rate_limited = false;
        let delta = steering - self.prev_output;
        let going_to_center = steering.abs() < self.prev_output.abs();
        let max_rate = if going_to_center { self.config.center_rate } else { self.config.max_rate };
        let max_delta = max_rate * dt;

        if delta.abs() > max_delta {
            self.rate_limited = true;
            if delta > 0.0 {
                self.prev_output + max_delta
            } else {
                self.prev_output - max_delta
            }
        } else {
            steering
        }
    }

    /// `yaw_rate_dps`: positive = CCW, as reported after mount-sign
    /// correction. `dt` in seconds.
    pub fn update(&mut self, steering_input: Command, speed_kmh: f64, yaw_rate_dps: f64, dt: f64) -> Command {
        if !self.armed.load(Ordering::Relaxed) {
            self.prev_output = steering_input as f64;
            self.rate_limited = false;
            self.counter_steer_active = false;
            self.counter_steer_amount = 0;
            return steering_input;
        }

        let dt = dt.clamp(0.001, 0.1);

        let mut steering = steering_input as f64;
        steering = self.apply_speed_limit(steering, speed_kmh);
        steering = self.apply_counter_steer_assist(steering, speed_kmh, yaw_rate_dps);
        steering = self.apply_rate_limit(steering, dt);

        steering = self.prev_output + self.config.smoothing_alpha * (steering - self.prev_output);
        self.prev_output = steering;

        steering.clamp(-32767.0, 32767.0) as Command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SteeringShaperConfig {
        SteeringShaperConfig {
            max_steering_ratio: 1.0,
            min_steering_ratio: 0.5,
            low_speed_kmh: 8.0,
            high_speed_kmh: 40.0,
            max_rate: 300_000.0,
            center_rate: 400_000.0,
            counter_steer_enabled: true,
            counter_steer_min_yaw: 20.0,
            counter_steer_strength: 0.1,
            counter_steer_max_input: 5000,
            counter_steer_min_speed_kmh: 10.0,
            counter_steer_max_amount: 5000,
            smoothing_alpha: 0.7,
        }
    }

    #[test]
    fn full_range_at_low_speed() {
        let mut s = SteeringShaper::new(cfg());
        let out = s.update(10000, 2.0, 0.0, 0.02);
        assert!(out > 6000);
    }

    #[test]
    fn reduced_range_at_high_speed() {
        let mut s = SteeringShaper::new(cfg());
        for _ in 0..5 {
            s.update(10000, 50.0, 0.0, 0.02);
        }
        let out = s.update(10000, 50.0, 0.0, 0.02);
        assert!(out < 6000);
    }

    #[test]
    fn counter_steer_nudges_neutral_input_while_rotating() {
        let mut s = SteeringShaper::new(cfg());
        let out = s.update(0, 20.0, 40.0, 0.02);
        assert!(out != 0);
    }

    #[test]
    fn rate_limit_prevents_instant_snap() {
        let mut s = SteeringShaper::new(cfg());
        s.update(0, 20.0, 0.0, 0.02);
        let out = s.update(32767, 20.0, 0.0, 0.001);
        assert!(out < 32767);
    }
}
