//! Anti-lock braking and the ESC brake/reverse disambiguation it
//! depends on. A negative throttle command means two different things
//! depending on motion: braking while rolling forward, or reversing
//! once stopped. ABS must only ever act on the former — pulsing the
//! brake during an intentional reverse would just make the car fight
//! the driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::clock::Clock;
use crate::config::CarProfile;
use crate::state::{Command, EscState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TrackerState {
    Neutral,
    Braking,
    ReverseArmed,
    Reversing,
}

/// Tracks the ESC's brake/reverse state machine from throttle and
/// speed alone.
///
/// `was_moving_forward` is cleared only when the vehicle comes to a
/// full stop with the throttle back at neutral — never merely by
/// moving backward. A car can roll backward down a slope under gravity
/// while the driver is still holding brake from a forward stop; if
/// that alone cleared the forward memory, the very next throttle-down
/// would be read as an intentional reverse instead of continued
/// braking.
pub struct ThrottleStateTracker {
    state: TrackerState,
    was_moving_forward: bool,
    throttle_returned_to_neutral: bool,
}

impl Default for ThrottleStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleStateTracker {
    pub fn new() -> Self {
        ThrottleStateTracker {
            state: TrackerState::Neutral,
            was_moving_forward: false,
            throttle_returned_to_neutral: true,
        }
    }

    pub fn reset(&mut self) {
        self.state = TrackerState::Neutral;
        self.was_moving_forward = false;
        self.throttle_returned_to_neutral = true;
    }

    pub fn esc_state(&self) -> EscState {
        match self.state {
            TrackerState::Neutral => EscState::Neutral,
            TrackerState::Braking => EscState::Braking,
            TrackerState::ReverseArmed => EscState::ReverseArmed,
            TrackerState::Reversing => EscState::Reversing,
        }
    }

    pub fn update(&mut self, throttle_input: Command, vehicle_speed_kmh: f64) -> EscState {
        let moving_forward = vehicle_speed_kmh > 2.0;
        let moving_backward = vehicle_speed_kmh < -2.0;
        let stopped = vehicle_speed_kmh.abs() <= 2.0;
        let throttle_neutral = throttle_input.unsigned_abs() < 50;
        let throttle_negative = throttle_input < -100;

        if moving_forward {
            self.was_moving_forward = true;
            self.state = if throttle_negative { TrackerState::Braking } else { TrackerState::Neutral };
        } else if stopped {
            if throttle_neutral {
                self.throttle_returned_to_neutral = true;
                self.was_moving_forward = false;
                self.state = TrackerState::Neutral;
            } else if throttle_negative {
                if self.was_moving_forward && !self.throttle_returned_to_neutral {
                    self.state = TrackerState::Braking;
                } else {
                    self.state = TrackerState::ReverseArmed;
                }
            }
        } else if moving_backward {
            self.throttle_returned_to_neutral = false;
            self.state = TrackerState::Reversing;
        }

        self.esc_state()
    }
}

pub struct AbsConfig {
    pub slip_threshold: f64,
    pub min_speed_kmh: f64,
    pub min_brake_input: Command,
    pub direction_hysteresis_kmh: f64,
    pub accel_direction_threshold: f64,
    pub cycle_time_ms: i64,
    pub brake_apply_ratio: f64,
    pub brake_release_ratio: f64,
}

impl AbsConfig {
    pub fn from_profile(profile: &CarProfile) -> Self {
        let section = "abs";
        AbsConfig {
            slip_threshold: profile.get_float(section, "slip_threshold"),
            min_speed_kmh: profile.get_float(section, "min_speed_kmh"),
            min_brake_input: profile.get_int(section, "min_brake_input") as Command,
            direction_hysteresis_kmh: profile.get_float(section, "direction_hysteresis_kmh"),
            accel_direction_threshold: profile.get_float(section, "accel_direction_threshold"),
            cycle_time_ms: profile.get_int(section, "cycle_time_ms"),
            brake_apply_ratio: profile.get_float(section, "brake_apply_ratio"),
            brake_release_ratio: profile.get_float(section, "brake_release_ratio"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
enum Phase {
    Apply,
    Release,
}

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct AbsStatus {
    pub active: bool,
    pub slip_ratio: f64,
    pub wheel_locked: bool,
}

pub struct AbsController {
    config: AbsConfig,
    armed: Arc<AtomicBool>,
    last_cycle: Option<Instant>,
    phase: Phase,
    intervention_active: bool,
    slip_ratio: f64,
    slip_ratio_smooth: f64,
    wheel_locked: bool,
}

impl AbsController {
    pub fn new(config: AbsConfig) -> Self {
        AbsController {
            config,
            armed: Arc::new(AtomicBool::new(true)),
            last_cycle: None,
            phase: Phase::Apply,
            intervention_active: false,
            slip_ratio: 0.0,
            slip_ratio_smooth: 0.0,
            wheel_locked: false,
        }
    }

    pub fn armed_handle(&self) -> Arc<AtomicBool> {
        self.armed.clone()
    }

    pub fn reset(&mut self) {
        self.last_cycle = None;
        self.phase = Phase::Apply;
        self.intervention_active = false;
        self.slip_ratio = 0.0;
        self.slip_ratio_smooth = 0.0;
        self.wheel_locked = false;
    }

    pub fn status(&self) -> AbsStatus {
        AbsStatus {
            active: self.intervention_active,
            slip_ratio: self.slip_ratio,
            wheel_locked: self.wheel_locked,
        }
    }

    fn determine_direction(&self, vehicle_speed_kmh: f64, imu_forward_accel: f64) -> Direction {
        if vehicle_speed_kmh.abs() < self.config.direction_hysteresis_kmh {
            if imu_forward_accel > self.config.accel_direction_threshold {
                Direction::Forward
            } else if imu_forward_accel < -self.config.accel_direction_threshold {
                Direction::Backward
            } else {
                Direction::Stopped
            }
        } else if vehicle_speed_kmh > self.config.direction_hysteresis_kmh {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }

    /// Low-pass smoothed slip ratio, scaled down as `grip_multiplier`
    /// drops below 1.0 so a low-grip surface trips the lockup
    /// threshold sooner.
    fn detect_wheel_lockup(&mut self, wheel_speed_kmh: f64, vehicle_speed_kmh: f64, grip_multiplier: f64) -> bool {
        if vehicle_speed_kmh < self.config.min_speed_kmh {
            self.slip_ratio_smooth = 0.0;
            self.slip_ratio = 0.0;
            return false;
        }

        let raw_slip = (vehicle_speed_kmh - wheel_speed_kmh) / vehicle_speed_kmh.max(0.1);
        self.slip_ratio_smooth += 0.5 * (raw_slip - self.slip_ratio_smooth);
        self.slip_ratio = self.slip_ratio_smooth;

        let effective_threshold = self.config.slip_threshold * grip_multiplier.max(0.3);
        self.slip_ratio > effective_threshold
    }

    /// Process throttle through ABS. Only ever modifies throttle when
    /// `esc_state` reports `Braking` while actually rolling forward.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        wheel_speed_kmh: f64,
        vehicle_speed_kmh: f64,
        imu_forward_accel: f64,
        throttle_input: Command,
        esc_state: EscState,
        grip_multiplier: f64,
        clock: &dyn Clock,
    ) -> Command {
        if !self.armed.load(Ordering::Relaxed) {
            return throttle_input;
        }

        let direction = self.determine_direction(vehicle_speed_kmh, imu_forward_accel);

        let is_braking_while_forward = direction == Direction::Forward
            && esc_state == EscState::Braking
            && throttle_input < -self.config.min_brake_input
            && vehicle_speed_kmh > self.config.min_speed_kmh;

        if !is_braking_while_forward {
            self.intervention_active = false;
            self.wheel_locked = false;
            return throttle_input;
        }

        self.wheel_locked = self.detect_wheel_lockup(wheel_speed_kmh, vehicle_speed_kmh, grip_multiplier);

        if !self.wheel_locked {
            self.intervention_active = false;
            return throttle_input;
        }

        self.intervention_active = true;

        let now = clock.now();
        let cycle_elapsed_ms = match self.last_cycle {
            Some(last) => now.saturating_duration_since(last).as_millis() as i64,
            None => self.config.cycle_time_ms,
        };

        if cycle_elapsed_ms >= self.config.cycle_time_ms {
            self.last_cycle = Some(now);
            self.phase = if self.phase == Phase::Apply { Phase::Release } else { Phase::Apply };
        }

        let ratio = if self.phase == Phase::Apply {
            self.config.brake_apply_ratio
        } else {
            self.config.brake_release_ratio
        };
        (throttle_input as f64 * ratio) as Command
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn abs_cfg() -> AbsConfig {
        AbsConfig {
            slip_threshold: 0.2,
            min_speed_kmh: 3.0,
            min_brake_input: 100,
            direction_hysteresis_kmh: 2.0,
            accel_direction_threshold: 0.3,
            cycle_time_ms: 100,
            brake_apply_ratio: 0.7,
            brake_release_ratio: 0.3,
        }
    }

    #[test]
    fn tracker_stays_braking_through_stop_without_neutral() {
        let mut t = ThrottleStateTracker::new();
        assert_eq!(t.update(20000, 20.0), EscState::Neutral);
        assert_eq!(t.update(-15000, 20.0), EscState::Braking);
        // Slows to a stop while still holding the same brake input.
        assert_eq!(t.update(-15000, 0.0), EscState::Braking);
    }

    #[test]
    fn tracker_arms_reverse_only_after_neutral() {
        let mut t = ThrottleStateTracker::new();
        t.update(20000, 20.0);
        t.update(-15000, 20.0);
        t.update(-15000, 0.0);
        // Return to neutral first.
        assert_eq!(t.update(0, 0.0), EscState::Neutral);
        assert_eq!(t.update(-15000, 0.0), EscState::ReverseArmed);
    }

    #[test]
    fn backward_motion_alone_does_not_clear_forward_memory() {
        let mut t = ThrottleStateTracker::new();
        t.update(20000, 20.0);
        t.update(-15000, -5.0);
        assert!(t.was_moving_forward);
    }

    #[test]
    fn abs_passes_through_when_reversing() {
        let mut abs = AbsController::new(abs_cfg());
        let clock = FakeClock::new();
        let out = abs.update(0.0, -10.0, -1.0, -15000, EscState::Reversing, 1.0, &clock);
        assert_eq!(out, -15000);
        assert!(!abs.status().active);
    }

    #[test]
    fn abs_pulses_on_locked_wheel_during_forward_braking() {
        let mut abs = AbsController::new(abs_cfg());
        let clock = FakeClock::new();
        let out = abs.update(0.0, 20.0, -1.0, -15000, EscState::Braking, 1.0, &clock);
        assert!(out.abs() < 15000);
        assert!(abs.status().active);
    }
}
