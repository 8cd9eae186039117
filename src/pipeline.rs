//! The orchestrator: wires the fixed controller chain to one shared
//! `VehicleState` and drives it from the three ingestion loops plus the
//! command path. Chain order is load-bearing and not configurable —
//! see the module-level doc on `controllers`.

use std::sync::Arc;

use log::debug;

use crate::clock::Clock;
use crate::config::CarProfile;
use crate::controllers::abs::{AbsConfig, AbsController, ThrottleStateTracker};
use crate::controllers::coast::{CoastConfig, CoastControl};
use crate::controllers::hill_hold::{HillHold, HillHoldConfig};
use crate::controllers::low_speed_traction::{LowSpeedTractionConfig, LowSpeedTractionManager};
use crate::controllers::slip_angle::{SlipAngleConfig, SlipAngleWatchdog};
use crate::controllers::steering_shaper::{SteeringShaper, SteeringShaperConfig};
use crate::controllers::yaw_rate::{YawRateConfig, YawRateController};
use crate::direction::{DirectionConfig, DirectionEstimator};
use crate::fusion::{HeadingBlendConfig, SpeedFusion, SpeedFusionConfig, HeadingBlend};
use crate::sensors::{GpsReading, ImuReading, WheelReading};
use crate::state::{Command, DriverInput, RaceState, VehicleState};
use crate::surface::{SurfaceAdaptation, SurfaceConfig};

pub struct Pipeline {
    clock: Arc<dyn Clock>,
    state: VehicleState,

    speed_fusion: SpeedFusion,
    heading_blend: HeadingBlend,
    direction: DirectionEstimator,
    surface: SurfaceAdaptation,

    steering_shaper: SteeringShaper,
    hill_hold: HillHold,
    traction: LowSpeedTractionManager,
    yaw_rate: YawRateController,
    slip_angle: SlipAngleWatchdog,
    abs_tracker: ThrottleStateTracker,
    abs: AbsController,
    coast: CoastControl,
}

impl Pipeline {
    pub fn new(profile: &CarProfile, clock: Arc<dyn Clock>) -> Self {
        let wheelbase_m = profile.get_float("vehicle", "wheelbase_m");
        let max_steering_angle_deg = profile.get_float("vehicle", "max_steering_angle_deg");

        Pipeline {
            clock,
            state: VehicleState::new(),

            speed_fusion: SpeedFusion::new(SpeedFusionConfig::from_profile(profile)),
            heading_blend: HeadingBlend::new(HeadingBlendConfig::from_profile(profile)),
            direction: DirectionEstimator::new(DirectionConfig::from_profile(profile)),
            surface: SurfaceAdaptation::new(SurfaceConfig::from_profile(profile), wheelbase_m, max_steering_angle_deg),

            steering_shaper: SteeringShaper::new(SteeringShaperConfig::from_profile(profile)),
            hill_hold: HillHold::new(HillHoldConfig::from_profile(profile)),
            traction: LowSpeedTractionManager::new(LowSpeedTractionConfig::from_profile(profile)),
            yaw_rate: YawRateController::new(YawRateConfig::from_profile(profile), wheelbase_m, max_steering_angle_deg),
            slip_angle: SlipAngleWatchdog::new(SlipAngleConfig::from_profile(profile)),
            abs_tracker: ThrottleStateTracker::new(),
            abs: AbsController::new(AbsConfig::from_profile(profile)),
            coast: CoastControl::new(CoastConfig::from_profile(profile)),
        }
    }

    pub fn state(&self) -> &VehicleState {
        &self.state
    }

    /// Assemble the admin-facing status snapshot (§7) from every
    /// controller's own `status()` plus the handful of shared-state
    /// fields an operator needs alongside them.
    pub fn status(&self) -> crate::telemetry::PipelineStatus {
        crate::telemetry::PipelineStatus {
            race_state: self.state.race_state,
            esc_state: self.state.esc_state,
            direction: self.state.direction,
            fused_speed_kmh: self.state.fused_speed_kmh,
            grip_multiplier: self.state.grip_multiplier,

            direction_estimator: self.direction.status(),
            surface_adaptation: self.surface.status(),
            steering_shaper: self.steering_shaper.status(),
            hill_hold: self.hill_hold.status(),
            low_speed_traction: self.traction.status(),
            yaw_rate: self.yaw_rate.status(),
            slip_angle: self.slip_angle.status(),
            abs: self.abs.status(),
            coast: self.coast.status(),
        }
    }

    /// Reset every filter and the shared state to defaults (spec
    /// invariant 5). Called on race-stop and driver disconnect.
    pub fn reset_for_session(&mut self) {
        self.state.reset_for_session();
        self.speed_fusion.reset();
        self.heading_blend.reset();
        self.direction.reset();
        self.surface.reset();
        self.steering_shaper.reset();
        self.hill_hold.reset();
        self.traction.reset();
        self.yaw_rate.reset();
        self.slip_angle.reset();
        self.abs_tracker.reset();
        self.abs.reset();
        self.coast.reset();
    }

    /// Track the race supervisor's state; resets on the `Racing`/other
    /// -> `Idle` edge, matching invariant 5.
    pub fn sync_race_state(&mut self, new_state: RaceState) {
        let was_idle = self.state.race_state == RaceState::Idle;
        self.state.race_state = new_state;
        if new_state == RaceState::Idle && !was_idle {
            self.reset_for_session();
            self.state.race_state = RaceState::Idle;
        }
    }

    pub fn ingest_wheel(&mut self, reading: WheelReading) {
        self.state.wheel_speed_kmh = reading.speed_kmh.max(0.0);
        self.state.wheel_fresh.touch(self.clock.as_ref());
    }

    pub fn ingest_gps(&mut self, reading: GpsReading) {
        self.state.gps_speed_kmh = reading.speed_kmh.max(0.0);
        self.state.gps_lat = reading.lat;
        self.state.gps_lon = reading.lon;
        self.state.gps_course_deg = reading.course_deg;
        self.state.gps_fix = reading.fix;
        self.state.gps_fresh.touch(self.clock.as_ref());
    }

    fn gps_is_valid(&self) -> bool {
        self.state.gps_fix && self.state.gps_fresh.is_fresh(self.clock.as_ref(), 2.0)
    }

    /// The IMU tick (~20 Hz) is where speed fusion, heading blend, the
    /// direction estimator, and surface adaptation all recompute — the
    /// source values they need are published by the IMU at the rate
    /// that matters; wheel and GPS loops just keep their own fields
    /// fresh in between ticks.
    pub fn ingest_imu(&mut self, reading: ImuReading, dt: f64) {
        self.state.imu_fresh.touch(self.clock.as_ref());

        self.state.imu_heading_deg = self.heading_blend.apply_mount_offset(reading.heading_deg);
        self.state.yaw_rate_dps = reading.yaw_rate_dps;
        self.state.forward_accel_ms2 = reading.forward_accel_ms2;
        self.state.lateral_accel_ms2 = reading.lateral_accel_ms2;
        self.state.pitch_deg = reading.pitch_deg;

        let gps_valid = self.gps_is_valid();

        let fused = self.speed_fusion.update(
            self.state.wheel_speed_kmh,
            self.state.forward_accel_ms2,
            gps_valid.then_some(self.state.gps_speed_kmh),
            self.state.driver_connected,
            dt,
            self.clock.as_ref(),
        );
        self.state.fused_speed_kmh = fused;

        self.state.blended_heading_deg = self.heading_blend.update(
            Some(self.state.imu_heading_deg),
            gps_valid.then_some(self.state.gps_course_deg),
            fused,
        );

        let signed = self.direction.update(
            self.state.forward_accel_ms2,
            self.state.wheel_speed_kmh,
            self.state.driver_input.throttle,
            self.state.driver_input.steering,
            self.state.yaw_rate_dps,
            dt,
        );
        self.state.signed_speed_kmh = signed;
        self.state.direction_confidence = self.direction.status().confidence;
        self.state.direction = self.direction.direction();

        self.traction.update(
            self.state.wheel_speed_kmh,
            self.state.forward_accel_ms2,
            self.state.gps_speed_kmh,
            gps_valid,
            dt,
        );

        self.surface.update(self.state.lateral_accel_ms2, fused, self.state.driver_input.steering);
        self.state.grip_multiplier = self.surface.grip_multiplier();
    }

    /// Run one driver sample through the fixed controller chain. Returns
    /// `None` when `race_state != racing` (category 6 of the error
    /// taxonomy: out-of-session inputs are silently dropped, never an
    /// error) — the chain still runs so every controller's filter state
    /// stays current for when racing resumes.
    pub fn process_driver_input(&mut self, input: DriverInput, dt: f64) -> Option<DriverInput> {
        self.state.driver_connected = true;
        self.state.driver_fresh.touch(self.clock.as_ref());
        self.state.driver_input = input;

        let esc_state = self.abs_tracker.update(input.throttle, self.state.signed_speed_kmh);
        self.state.esc_state = esc_state;

        let steering =
            self.steering_shaper
                .update(input.steering, self.state.fused_speed_kmh, self.state.yaw_rate_dps, dt);

        let mut throttle = input.throttle;
        throttle = self.hill_hold.update(self.state.pitch_deg, self.state.fused_speed_kmh, throttle, dt);
        throttle = self.traction.apply_to_throttle(throttle, self.state.yaw_rate_dps, self.state.grip_multiplier);

        self.yaw_rate.update(self.state.yaw_rate_dps, self.state.fused_speed_kmh, steering, dt);
        throttle = self.yaw_rate.apply_to_throttle(throttle);
        let virtual_brake = self.yaw_rate.status().virtual_brake;
        if virtual_brake > 0 {
            throttle = apply_virtual_brake(throttle, virtual_brake);
        }

        self.slip_angle
            .update(self.state.lateral_accel_ms2, self.state.yaw_rate_dps, self.state.fused_speed_kmh, throttle, dt);
        throttle = self.slip_angle.apply_to_throttle(throttle);

        throttle = self.abs.update(
            self.state.wheel_speed_kmh,
            self.state.signed_speed_kmh,
            self.state.forward_accel_ms2,
            throttle,
            esc_state,
            self.state.grip_multiplier,
            self.clock.as_ref(),
        );

        throttle = self.coast.update(throttle, Some(self.state.fused_speed_kmh), dt);

        if self.state.race_state != RaceState::Racing {
            debug!("[pipeline] output dropped, race_state = {:?}", self.state.race_state);
            return None;
        }

        Some(DriverInput { throttle, steering })
    }
}

/// A yaw-rate virtual brake is a commanded deceleration, not a throttle
/// multiplier; fold it in by subtracting it from whatever throttle the
/// rest of the chain already produced, never reversing its sign.
fn apply_virtual_brake(throttle: Command, virtual_brake: Command) -> Command {
    if throttle <= 0 {
        return throttle;
    }
    (throttle - virtual_brake).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn test_profile() -> CarProfile {
        // Build a minimal profile covering every required key with
        // permissive, "mostly pass-through" tuning values.
        let raw = [
            ("vehicle", vec![
                ("wheel_diameter_mm", "100"), ("weight_kg", "4.5"),
                ("wheelbase_m", "0.32"), ("max_steering_angle_deg", "30"),
            ]),
            ("heading_blend", vec![
                ("imu_only_speed_kmh", "3"), ("gps_blend_speed_kmh", "20"),
                ("heading_smooth_alpha", "0.5"), ("imu_mount_offset_deg", "0"),
            ]),
            ("speed_fusion", vec![
                ("fusion_alpha", "0.5"), ("imu_integrate_rate", "1.0"),
                ("gps_drift_correction_alpha", "0.05"), ("gps_drift_correction_min_speed_kmh", "2.0"),
                ("wheelspin_detect_ratio", "1.8"), ("wheelspin_detect_time_s", "0.3"),
                ("wheelspin_max_fused_ratio", "1.3"), ("stationary_timeout_s", "1.0"),
                ("stationary_decay_rate", "0.9"), ("imu_accel_noise_threshold", "0.2"),
            ]),
            ("direction_estimator", vec![
                ("throttle_seed_threshold", "3000"), ("accel_confirm_threshold", "0.3"),
                ("stopped_threshold_ms", "0.15"), ("yaw_validation_min_speed_ms", "1.0"),
                ("min_steering_for_validation", "2000"), ("min_yaw_rate_for_validation", "10.0"),
                ("yaw_correction_min_speed_ms", "1.5"), ("yaw_correction_min_yaw_rate", "20.0"),
                ("stationary_decay_rate", "0.8"), ("stationary_accel_threshold", "0.2"),
                ("stationary_throttle_threshold", "500"), ("bias_learning_rate", "0.01"),
                ("confidence_decay_on_disagreement", "0.5"), ("confidence_decay_when_stationary", "0.9"),
                ("confidence_growth_rate", "0.02"),
            ]),
            ("low_speed_traction", vec![
                ("launch_phase_end_kmh", "5"), ("transition_phase_end_kmh", "15"),
                ("launch_target_slip", "0.1"), ("launch_slip_tolerance", "0.05"),
                ("launch_max_throttle_rate", "500"), ("launch_throttle_ceiling", "1000"),
                ("launch_slip_high_cut", "0.5"), ("cruise_slip_threshold", "0.2"),
                ("cruise_throttle_cut_rate", "0.1"), ("cruise_recovery_rate", "0.02"),
                ("cruise_min_multiplier", "0.4"), ("min_throttle_for_slip", "50"),
                ("yaw_rate_threshold", "30"), ("accel_smoothing", "0.3"),
                ("gps_drift_correction_alpha", "0.01"), ("gps_drift_correction_min_speed_kmh", "3"),
            ]),
            ("yaw_rate_controller", vec![
                ("grip_factor", "0.35"), ("min_speed_kmh", "5"),
                ("oversteer_threshold", "25"), ("understeer_threshold", "15"),
                ("oversteer_cut_rate", "0.15"), ("understeer_cut_rate", "0.05"),
                ("min_throttle_mult", "0.3"), ("recovery_rate", "0.03"),
                ("fast_recovery_rate", "0.08"), ("virtual_brake_enabled", "true"),
                ("virtual_brake_threshold", "50"), ("max_virtual_brake", "400"),
                ("yaw_smoothing", "0.4"),
            ]),
            ("slip_angle_watchdog", vec![
                ("min_speed_kmh", "5"), ("lateral_excess_threshold", "2.0"),
                ("slip_duration_threshold_s", "0.2"), ("min_throttle_for_intervention", "100"),
                ("recovery_target", "0.6"), ("reduction_rate", "0.05"),
                ("recovery_rate", "0.03"), ("min_multiplier", "0.4"), ("smoothing_alpha", "0.5"),
            ]),
            ("surface_adaptation", vec![
                ("min_speed_kmh", "10"), ("min_steering", "200"), ("min_samples", "10"),
                ("default_grip", "0.7"), ("grip_smoothing", "0.05"), ("grip_min", "0.2"),
                ("grip_max", "1.2"), ("history_size", "50"),
            ]),
            ("hill_hold", vec![
                ("pitch_threshold_deg", "5"), ("speed_threshold_kmh", "1"),
                ("throttle_deadzone", "150"), ("hold_strength", "30"),
                ("max_hold_force", "1000"), ("immediate_release_threshold", "900"),
                ("blend_rate", "0.05"), ("timeout_s", "30"), ("settling_time_s", "0.5"),
            ]),
            ("abs", vec![
                ("slip_threshold", "0.2"), ("min_speed_kmh", "3"), ("min_brake_input", "100"),
                ("direction_hysteresis_kmh", "2"), ("accel_direction_threshold", "0.3"),
                ("cycle_time_ms", "100"), ("brake_apply_ratio", "0.7"), ("brake_release_ratio", "0.3"),
            ]),
            ("coast_control", vec![
                ("release_threshold_high", "300"), ("release_threshold_low", "150"),
                ("coast_duration_s", "0.3"), ("coast_throttle", "300"), ("min_speed_kmh", "5"),
            ]),
            ("steering_shaper", vec![
                ("max_steering_ratio", "1.0"), ("min_steering_ratio", "0.5"),
                ("low_speed_kmh", "8"), ("high_speed_kmh", "40"), ("max_rate", "300000"),
                ("center_rate", "400000"), ("counter_steer_enabled", "true"),
                ("counter_steer_min_yaw", "20"), ("counter_steer_strength", "0.1"),
                ("counter_steer_max_input", "5000"), ("counter_steer_min_speed_kmh", "10"),
                ("counter_steer_max_amount", "5000"), ("smoothing_alpha", "0.7"),
            ]),
        ];

        let dir = std::env::temp_dir().join(format!("ratrod_pipeline_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut text = String::new();
        for (section, keys) in raw.iter() {
            text.push_str(&format!("[{section}]\n"));
            for (k, v) in keys {
                text.push_str(&format!("{k} = {v}\n"));
            }
        }
        std::fs::write(dir.join("test.ini"), text).unwrap();
        CarProfile::load(&dir, "test").expect("test profile should be valid")
    }

    #[test]
    fn output_is_dropped_when_not_racing() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let mut p = Pipeline::new(&test_profile(), clock);
        let out = p.process_driver_input(DriverInput { throttle: 10000, steering: 0 }, 0.02);
        assert!(out.is_none());
    }

    #[test]
    fn output_passes_through_when_racing_with_no_sensor_activity() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let mut p = Pipeline::new(&test_profile(), clock);
        p.sync_race_state(RaceState::Racing);
        let out = p.process_driver_input(DriverInput { throttle: 0, steering: 0 }, 0.02);
        assert_eq!(out, Some(DriverInput { throttle: 0, steering: 0 }));
    }

    #[test]
    fn idle_transition_resets_state() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let mut p = Pipeline::new(&test_profile(), clock);
        p.sync_race_state(RaceState::Racing);
        p.ingest_wheel(WheelReading { speed_kmh: 20.0, rpm: 500.0 });
        p.sync_race_state(RaceState::Idle);
        assert_eq!(p.state().wheel_speed_kmh, 0.0);
        assert_eq!(p.state().race_state, RaceState::Idle);
    }

    #[test]
    fn imu_tick_updates_fused_speed_from_wheel() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let mut p = Pipeline::new(&test_profile(), clock);
        p.ingest_wheel(WheelReading { speed_kmh: 20.0, rpm: 500.0 });
        for _ in 0..30 {
            p.ingest_imu(
                ImuReading {
                    heading_deg: 0.0,
                    roll_deg: 0.0,
                    pitch_deg: 0.0,
                    yaw_rate_dps: 0.0,
                    forward_accel_ms2: 0.0,
                    lateral_accel_ms2: 0.0,
                    calibration: Default::default(),
                },
                0.05,
            );
        }
        assert!(p.state().fused_speed_kmh > 5.0);
    }
}
