//! Admin-facing status telemetry (§7: "Admin sees structured status
//! telemetry identifying which assistance subsystems are active and
//! their current intervention state"). A pure snapshot type, built from
//! each controller's own `status()` plus the shared `VehicleState`
//! fields an operator needs alongside it — no telemetry field is
//! computed here, it is only assembled and serialized.

use serde::Serialize;

use crate::controllers::abs::AbsStatus;
use crate::controllers::coast::CoastStatus;
use crate::controllers::hill_hold::HillHoldStatus;
use crate::controllers::low_speed_traction::LowSpeedTractionStatus;
use crate::controllers::slip_angle::SlipAngleStatus;
use crate::controllers::steering_shaper::SteeringShaperStatus;
use crate::controllers::yaw_rate::YawRateStatus;
use crate::direction::DirectionStatus;
use crate::state::{Direction, EscState, RaceState};
use crate::surface::SurfaceStatus;

#[derive(Clone, Debug, Serialize)]
pub struct PipelineStatus {
    pub race_state: RaceState,
    pub esc_state: EscState,
    pub direction: Direction,
    pub fused_speed_kmh: f64,
    pub grip_multiplier: f64,

    pub direction_estimator: DirectionStatus,
    pub surface_adaptation: SurfaceStatus,
    pub steering_shaper: SteeringShaperStatus,
    pub hill_hold: HillHoldStatus,
    pub low_speed_traction: LowSpeedTractionStatus,
    pub yaw_rate: YawRateStatus,
    pub slip_angle: SlipAngleStatus,
    pub abs: AbsStatus,
    pub coast: CoastStatus,
}

impl PipelineStatus {
    /// Names of every subsystem currently intervening, for a one-line
    /// admin summary (`[abs, hill_hold]`) without re-deriving each
    /// controller's own activity flag.
    pub fn active_subsystems(&self) -> Vec<&'static str> {
        let mut active = Vec::new();
        if self.hill_hold.active {
            active.push("hill_hold");
        }
        if self.low_speed_traction.slip_detected {
            active.push("low_speed_traction");
        }
        if self.yaw_rate.intervention_active {
            active.push("yaw_rate");
        }
        if self.slip_angle.intervention_active {
            active.push("slip_angle");
        }
        if self.abs.active {
            active.push("abs");
        }
        if self.coast.active {
            active.push("coast");
        }
        if self.steering_shaper.counter_steer_active {
            active.push("steering_shaper");
        }
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::config::CarProfile;
    use crate::pipeline::Pipeline;
    use std::sync::Arc;

    fn test_profile_dir() -> std::path::PathBuf {
        // Reuses the pipeline test fixture builder indirectly isn't
        // possible across modules, so build a minimal one here too.
        let raw = [
            ("vehicle", vec![("wheel_diameter_mm", "100"), ("weight_kg", "4.5"), ("wheelbase_m", "0.32"), ("max_steering_angle_deg", "30")]),
            ("heading_blend", vec![("imu_only_speed_kmh", "3"), ("gps_blend_speed_kmh", "20"), ("heading_smooth_alpha", "0.5"), ("imu_mount_offset_deg", "0")]),
            ("speed_fusion", vec![("fusion_alpha", "0.5"), ("imu_integrate_rate", "1.0"), ("gps_drift_correction_alpha", "0.05"), ("gps_drift_correction_min_speed_kmh", "2.0"), ("wheelspin_detect_ratio", "1.8"), ("wheelspin_detect_time_s", "0.3"), ("wheelspin_max_fused_ratio", "1.3"), ("stationary_timeout_s", "1.0"), ("stationary_decay_rate", "0.9"), ("imu_accel_noise_threshold", "0.2")]),
            ("direction_estimator", vec![("throttle_seed_threshold", "3000"), ("accel_confirm_threshold", "0.3"), ("stopped_threshold_ms", "0.15"), ("yaw_validation_min_speed_ms", "1.0"), ("min_steering_for_validation", "2000"), ("min_yaw_rate_for_validation", "10.0"), ("yaw_correction_min_speed_ms", "1.5"), ("yaw_correction_min_yaw_rate", "20.0"), ("stationary_decay_rate", "0.8"), ("stationary_accel_threshold", "0.2"), ("stationary_throttle_threshold", "500"), ("bias_learning_rate", "0.01"), ("confidence_decay_on_disagreement", "0.5"), ("confidence_decay_when_stationary", "0.9"), ("confidence_growth_rate", "0.02")]),
            ("low_speed_traction", vec![("launch_phase_end_kmh", "5"), ("transition_phase_end_kmh", "15"), ("launch_target_slip", "0.1"), ("launch_slip_tolerance", "0.05"), ("launch_max_throttle_rate", "500"), ("launch_throttle_ceiling", "1000"), ("launch_slip_high_cut", "0.5"), ("cruise_slip_threshold", "0.2"), ("cruise_throttle_cut_rate", "0.1"), ("cruise_recovery_rate", "0.02"), ("cruise_min_multiplier", "0.4"), ("min_throttle_for_slip", "50"), ("yaw_rate_threshold", "30"), ("accel_smoothing", "0.3"), ("gps_drift_correction_alpha", "0.01"), ("gps_drift_correction_min_speed_kmh", "3")]),
            ("yaw_rate_controller", vec![("grip_factor", "0.35"), ("min_speed_kmh", "5"), ("oversteer_threshold", "25"), ("understeer_threshold", "15"), ("oversteer_cut_rate", "0.15"), ("understeer_cut_rate", "0.05"), ("min_throttle_mult", "0.3"), ("recovery_rate", "0.03"), ("fast_recovery_rate", "0.08"), ("virtual_brake_enabled", "true"), ("virtual_brake_threshold", "50"), ("max_virtual_brake", "400"), ("yaw_smoothing", "0.4")]),
            ("slip_angle_watchdog", vec![("min_speed_kmh", "5"), ("lateral_excess_threshold", "2.0"), ("slip_duration_threshold_s", "0.2"), ("min_throttle_for_intervention", "100"), ("recovery_target", "0.6"), ("reduction_rate", "0.05"), ("recovery_rate", "0.03"), ("min_multiplier", "0.4"), ("smoothing_alpha", "0.5")]),
            ("surface_adaptation", vec![("min_speed_kmh", "10"), ("min_steering", "200"), ("min_samples", "10"), ("default_grip", "0.7"), ("grip_smoothing", "0.05"), ("grip_min", "0.2"), ("grip_max", "1.2"), ("history_size", "50")]),
            ("hill_hold", vec![("pitch_threshold_deg", "5"), ("speed_threshold_kmh", "1"), ("throttle_deadzone", "150"), ("hold_strength", "30"), ("max_hold_force", "1000"), ("immediate_release_threshold", "900"), ("blend_rate", "0.05"), ("timeout_s", "30"), ("settling_time_s", "0.5")]),
            ("abs", vec![("slip_threshold", "0.2"), ("min_speed_kmh", "3"), ("min_brake_input", "100"), ("direction_hysteresis_kmh", "2"), ("accel_direction_threshold", "0.3"), ("cycle_time_ms", "100"), ("brake_apply_ratio", "0.7"), ("brake_release_ratio", "0.3")]),
            ("coast_control", vec![("release_threshold_high", "300"), ("release_threshold_low", "150"), ("coast_duration_s", "0.3"), ("coast_throttle", "300"), ("min_speed_kmh", "5")]),
            ("steering_shaper", vec![("max_steering_ratio", "1.0"), ("min_steering_ratio", "0.5"), ("low_speed_kmh", "8"), ("high_speed_kmh", "40"), ("max_rate", "300000"), ("center_rate", "400000"), ("counter_steer_enabled", "true"), ("counter_steer_min_yaw", "20"), ("counter_steer_strength", "0.1"), ("counter_steer_max_input", "5000"), ("counter_steer_min_speed_kmh", "10"), ("counter_steer_max_amount", "5000"), ("smoothing_alpha", "0.7")]),
        ];
        let dir = std::env::temp_dir().join(format!("ratrod_telemetry_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut text = String::new();
        for (section, keys) in raw.iter() {
            text.push_str(&format!("[{section}]\n"));
            for (k, v) in keys {
                text.push_str(&format!("{k} = {v}\n"));
            }
        }
        std::fs::write(dir.join("test.ini"), text).unwrap();
        dir
    }

    #[test]
    fn status_serializes_and_reports_no_active_subsystems_at_rest() {
        let dir = test_profile_dir();
        let profile = CarProfile::load(&dir, "test").unwrap();
        let clock: Arc<dyn crate::clock::Clock> = Arc::new(FakeClock::new());
        let pipeline = Pipeline::new(&profile, clock);

        let status = pipeline.status();
        assert!(status.active_subsystems().is_empty());

        let json = serde_json::to_string(&status).expect("status must serialize");
        assert!(json.contains("\"race_state\""));
    }
}
