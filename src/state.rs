//! The single shared vehicle-state record. Written only by the
//! ingestion loops and the fusion functions; read by every controller.
//! No controller owns a `&mut VehicleState` of its own — each receives
//! a shared snapshot and returns its contribution through its own
//! private fields.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscState {
    Neutral,
    Braking,
    ReverseArmed,
    Reversing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaceState {
    Idle,
    Countdown,
    Racing,
}

/// A signed 16-bit driver command, mirroring the wire format's
/// throttle/steering range.
pub type Command = i16;
pub const COMMAND_MAX: i32 = 32767;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInput {
    pub throttle: Command,
    pub steering: Command,
}

/// Freshness bookkeeping for one sensor source. Not serialized — only
/// meaningful within a running process, compared against the injected
/// clock.
#[derive(Clone, Copy, Debug)]
pub struct Freshness {
    pub last_update: Option<Instant>,
}

impl Default for Freshness {
    fn default() -> Self {
        Freshness { last_update: None }
    }
}

impl Freshness {
    pub fn touch(&mut self, clock: &dyn Clock) {
        self.last_update = Some(clock.now());
    }

    pub fn age_secs(&self, clock: &dyn Clock) -> f64 {
        match self.last_update {
            Some(t) => clock.now().saturating_duration_since(t).as_secs_f64(),
            None => f64::INFINITY,
        }
    }

    pub fn is_fresh(&self, clock: &dyn Clock, max_age_secs: f64) -> bool {
        self.age_secs(clock) <= max_age_secs
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VehicleState {
    pub wheel_speed_kmh: f64,
    pub fused_speed_kmh: f64,
    pub signed_speed_kmh: f64,
    pub direction_confidence: f64,

    pub gps_speed_kmh: f64,
    pub gps_lat: f64,
    pub gps_lon: f64,
    pub gps_course_deg: f64,
    pub gps_fix: bool,

    pub imu_heading_deg: f64,
    pub blended_heading_deg: f64,
    pub yaw_rate_dps: f64,
    pub forward_accel_ms2: f64,
    pub lateral_accel_ms2: f64,
    pub pitch_deg: f64,

    pub grip_multiplier: f64,

    pub driver_input: DriverInput,
    pub driver_connected: bool,

    pub esc_state: EscState,
    pub direction: Direction,
    pub race_state: RaceState,

    #[serde(skip)]
    pub imu_fresh: Freshness,
    #[serde(skip)]
    pub wheel_fresh: Freshness,
    #[serde(skip)]
    pub gps_fresh: Freshness,
    #[serde(skip)]
    pub driver_fresh: Freshness,
}

impl Default for VehicleState {
    fn default() -> Self {
        VehicleState {
            wheel_speed_kmh: 0.0,
            fused_speed_kmh: 0.0,
            signed_speed_kmh: 0.0,
            direction_confidence: 0.5,

            gps_speed_kmh: 0.0,
            gps_lat: 0.0,
            gps_lon: 0.0,
            gps_course_deg: 0.0,
            gps_fix: false,

            imu_heading_deg: 0.0,
            blended_heading_deg: 0.0,
            yaw_rate_dps: 0.0,
            forward_accel_ms2: 0.0,
            lateral_accel_ms2: 0.0,
            pitch_deg: 0.0,

            grip_multiplier: 1.0,

            driver_input: DriverInput::default(),
            driver_connected: false,

            esc_state: EscState::Neutral,
            direction: Direction::Stopped,
            race_state: RaceState::Idle,

            imu_fresh: Freshness::default(),
            wheel_fresh: Freshness::default(),
            gps_fresh: Freshness::default(),
            driver_fresh: Freshness::default(),
        }
    }
}

impl VehicleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to defaults, as happens on race start and on driver
    /// disconnect (spec invariant 5: smoothed filter state decays or
    /// resets when `race_state` transitions to `idle`). Controller-local
    /// filter state lives outside this struct and is reset separately
    /// by the pipeline when it calls this.
    pub fn reset_for_session(&mut self) {
        *self = VehicleState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_has_no_race_output() {
        let s = VehicleState::new();
        assert_eq!(s.race_state, RaceState::Idle);
        assert_eq!(s.wheel_speed_kmh, 0.0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut s = VehicleState::new();
        s.wheel_speed_kmh = 40.0;
        s.race_state = RaceState::Racing;
        s.reset_for_session();
        assert_eq!(s.wheel_speed_kmh, 0.0);
        assert_eq!(s.race_state, RaceState::Idle);
    }
}
