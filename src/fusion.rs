//! Speed fusion and heading blend (the unified state estimator that
//! every controller reads from). An IMU-primary complementary filter:
//! wheel pulses and forward acceleration dominate moment-to-moment,
//! GPS only ever nudges long-term drift.

use std::time::Instant;

use crate::clock::Clock;
use crate::config::CarProfile;

fn wrap_360(deg: f64) -> f64 {
    let mut d = deg % 360.0;
    if d < 0.0 {
        d += 360.0;
    }
    d
}

/// Shortest signed angular difference `b - a`, in (-180, 180].
fn angular_diff(a: f64, b: f64) -> f64 {
    let mut d = (b - a) % 360.0;
    if d > 180.0 {
        d -= 360.0;
    } else if d < -180.0 {
        d += 360.0;
    }
    d
}

fn angular_lerp(a: f64, b: f64, t: f64) -> f64 {
    wrap_360(a + angular_diff(a, b) * t)
}

pub struct SpeedFusionConfig {
    pub fusion_alpha: f64,
    pub imu_integrate_rate: f64,
    pub gps_drift_correction_alpha: f64,
    pub gps_drift_correction_min_speed_kmh: f64,
    pub wheelspin_detect_ratio: f64,
    pub wheelspin_detect_time_s: f64,
    pub wheelspin_max_fused_ratio: f64,
    pub stationary_timeout_s: f64,
    pub stationary_decay_rate: f64,
    pub imu_accel_noise_threshold: f64,
}

impl SpeedFusionConfig {
    pub fn from_profile(profile: &CarProfile) -> Self {
        SpeedFusionConfig {
            fusion_alpha: profile.get_float("speed_fusion", "fusion_alpha"),
            imu_integrate_rate: profile.get_float("speed_fusion", "imu_integrate_rate"),
            gps_drift_correction_alpha: profile.get_float("speed_fusion", "gps_drift_correction_alpha"),
            gps_drift_correction_min_speed_kmh: profile
                .get_float("speed_fusion", "gps_drift_correction_min_speed_kmh"),
            wheelspin_detect_ratio: profile.get_float("speed_fusion", "wheelspin_detect_ratio"),
            wheelspin_detect_time_s: profile.get_float("speed_fusion", "wheelspin_detect_time_s"),
            wheelspin_max_fused_ratio: profile.get_float("speed_fusion", "wheelspin_max_fused_ratio"),
            stationary_timeout_s: profile.get_float("speed_fusion", "stationary_timeout_s"),
            stationary_decay_rate: profile.get_float("speed_fusion", "stationary_decay_rate"),
            imu_accel_noise_threshold: profile.get_float("speed_fusion", "imu_accel_noise_threshold"),
        }
    }
}

const WHEEL_MOVING_FLOOR_KMH: f64 = 0.5;
const WHEEL_BLEND_WEIGHT: f64 = 0.7;
const IMU_BLEND_WEIGHT: f64 = 0.3;

pub struct SpeedFusion {
    config: SpeedFusionConfig,
    imu_integrated_kmh: f64,
    fused_speed_kmh: f64,
    stopped_since: Option<Instant>,
    wheelspin_since: Option<Instant>,
}

impl SpeedFusion {
    pub fn new(config: SpeedFusionConfig) -> Self {
        SpeedFusion {
            config,
            imu_integrated_kmh: 0.0,
            fused_speed_kmh: 0.0,
            stopped_since: None,
            wheelspin_since: None,
        }
    }

    pub fn reset(&mut self) {
        self.imu_integrated_kmh = 0.0;
        self.fused_speed_kmh = 0.0;
        self.stopped_since = None;
        self.wheelspin_since = None;
    }

    pub fn fused_speed_kmh(&self) -> f64 {
        self.fused_speed_kmh
    }

    /// Advance the filter by one ingestion tick. `gps` is `None` when
    /// there is no valid fix.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        wheel_speed_kmh: f64,
        forward_accel_ms2: f64,
        gps_speed_kmh: Option<f64>,
        driver_connected: bool,
        dt: f64,
        clock: &dyn Clock,
    ) -> f64 {
        // 1. Integrate forward acceleration, only while a driver is
        // connected (otherwise the integrator would free-drift during a
        // disconnect with nothing to correct it).
        if driver_connected {
            self.imu_integrated_kmh += forward_accel_ms2 * 3.6 * dt * self.config.imu_integrate_rate;
        } else {
            self.imu_integrated_kmh = 0.0;
        }

        let mut primary;
        if wheel_speed_kmh > WHEEL_MOVING_FLOOR_KMH {
            self.stopped_since = None;
            primary = WHEEL_BLEND_WEIGHT * wheel_speed_kmh + IMU_BLEND_WEIGHT * self.imu_integrated_kmh;
        } else {
            let now = clock.now();
            let stopped_since = *self.stopped_since.get_or_insert(now);
            let stopped_for = now.saturating_duration_since(stopped_since).as_secs_f64();
            if stopped_for > self.config.stationary_timeout_s
                && forward_accel_ms2.abs() < self.config.imu_accel_noise_threshold
            {
                self.imu_integrated_kmh *= self.config.stationary_decay_rate;
            }
            primary = self.imu_integrated_kmh;
        }

        // 4. Wheelspin cap: sustained wheel/GPS ratio above threshold
        // clamps the fused estimate to a GPS-anchored ceiling.
        if let Some(gps) = gps_speed_kmh {
            if gps > 0.1 && wheel_speed_kmh / gps > self.config.wheelspin_detect_ratio {
                let now = clock.now();
                let since = *self.wheelspin_since.get_or_insert(now);
                if now.saturating_duration_since(since).as_secs_f64() > self.config.wheelspin_detect_time_s {
                    let ceiling = gps * self.config.wheelspin_max_fused_ratio;
                    primary = primary.min(ceiling);
                }
            } else {
                self.wheelspin_since = None;
            }
        } else {
            self.wheelspin_since = None;
        }

        // 5. Drift correction: GPS nudges long-term drift only, never
        // drives real-time control.
        if let Some(gps) = gps_speed_kmh {
            if gps > self.config.gps_drift_correction_min_speed_kmh {
                let alpha = self.config.gps_drift_correction_alpha;
                primary += (gps - primary) * alpha;
                self.imu_integrated_kmh += (gps - self.imu_integrated_kmh) * alpha;
            }
        }

        primary = primary.max(0.0);

        // 6. Low-pass into the published fused speed.
        let alpha = self.config.fusion_alpha;
        self.fused_speed_kmh += (primary - self.fused_speed_kmh) * alpha;
        self.fused_speed_kmh = self.fused_speed_kmh.max(0.0);
        self.fused_speed_kmh
    }
}

pub struct HeadingBlendConfig {
    pub imu_only_speed_kmh: f64,
    pub gps_blend_speed_kmh: f64,
    pub heading_smooth_alpha: f64,
    pub imu_mount_offset_deg: f64,
}

impl HeadingBlendConfig {
    pub fn from_profile(profile: &CarProfile) -> Self {
        HeadingBlendConfig {
            imu_only_speed_kmh: profile.get_float("heading_blend", "imu_only_speed_kmh"),
            gps_blend_speed_kmh: profile.get_float("heading_blend", "gps_blend_speed_kmh"),
            heading_smooth_alpha: profile.get_float("heading_blend", "heading_smooth_alpha"),
            imu_mount_offset_deg: profile.get_float("heading_blend", "imu_mount_offset_deg"),
        }
    }
}

/// 80% GPS course / 20% IMU heading once above the GPS-trust speed.
const GPS_TRUST_WEIGHT: f64 = 0.8;

pub struct HeadingBlend {
    config: HeadingBlendConfig,
    blended_deg: f64,
}

impl HeadingBlend {
    pub fn new(config: HeadingBlendConfig) -> Self {
        HeadingBlend {
            config,
            blended_deg: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.blended_deg = 0.0;
    }

    pub fn blended_deg(&self) -> f64 {
        self.blended_deg
    }

    /// Apply the IMU mount offset to a raw sensor-frame heading.
    pub fn apply_mount_offset(&self, raw_heading_deg: f64) -> f64 {
        wrap_360(raw_heading_deg + self.config.imu_mount_offset_deg)
    }

    /// `imu_heading_deg` is already mount-offset corrected.
    pub fn update(
        &mut self,
        imu_heading_deg: Option<f64>,
        gps_course_deg: Option<f64>,
        fused_speed_kmh: f64,
    ) -> f64 {
        let target = match (imu_heading_deg, gps_course_deg) {
            (Some(imu), None) => imu,
            (None, Some(gps)) => gps,
            (None, None) => self.blended_deg,
            (Some(imu), Some(gps)) => {
                if fused_speed_kmh <= self.config.imu_only_speed_kmh {
                    imu
                } else if fused_speed_kmh >= self.config.gps_blend_speed_kmh {
                    angular_lerp(imu, gps, GPS_TRUST_WEIGHT)
                } else {
                    let span = (self.config.gps_blend_speed_kmh - self.config.imu_only_speed_kmh).max(1e-6);
                    let frac = (fused_speed_kmh - self.config.imu_only_speed_kmh) / span;
                    let high_speed_target = angular_lerp(imu, gps, GPS_TRUST_WEIGHT);
                    angular_lerp(imu, high_speed_target, frac)
                }
            }
        };

        self.blended_deg = angular_lerp(self.blended_deg, target, self.config.heading_smooth_alpha);
        self.blended_deg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn cfg() -> SpeedFusionConfig {
        SpeedFusionConfig {
            fusion_alpha: 0.5,
            imu_integrate_rate: 1.0,
            gps_drift_correction_alpha: 0.05,
            gps_drift_correction_min_speed_kmh: 2.0,
            wheelspin_detect_ratio: 1.8,
            wheelspin_detect_time_s: 0.3,
            wheelspin_max_fused_ratio: 1.3,
            stationary_timeout_s: 1.0,
            stationary_decay_rate: 0.9,
            imu_accel_noise_threshold: 0.2,
        }
    }

    #[test]
    fn wheel_dominates_when_moving() {
        let clock = FakeClock::new();
        let mut f = SpeedFusion::new(cfg());
        for _ in 0..20 {
            f.update(20.0, 0.0, None, true, 0.05, &clock);
            clock.advance_secs(0.05);
        }
        assert!((f.fused_speed_kmh() - 20.0).abs() < 2.0);
    }

    #[test]
    fn wheelspin_clamps_to_gps_ceiling() {
        let clock = FakeClock::new();
        let mut f = SpeedFusion::new(cfg());
        for _ in 0..30 {
            f.update(40.0, 1.0, Some(5.0), true, 0.05, &clock);
            clock.advance_secs(0.05);
        }
        assert!(f.fused_speed_kmh() <= 5.0 * 1.3 + 1e-6);
    }

    #[test]
    fn never_negative() {
        let clock = FakeClock::new();
        let mut f = SpeedFusion::new(cfg());
        let out = f.update(0.0, -5.0, None, true, 0.05, &clock);
        assert!(out >= 0.0);
    }

    #[test]
    fn heading_below_imu_only_speed_tracks_imu_exactly() {
        let mut hb = HeadingBlend::new(HeadingBlendConfig {
            imu_only_speed_kmh: 3.0,
            gps_blend_speed_kmh: 20.0,
            heading_smooth_alpha: 1.0,
            imu_mount_offset_deg: 0.0,
        });
        let out = hb.update(Some(90.0), Some(180.0), 1.0);
        assert!((out - 90.0).abs() < 1e-6);
    }

    #[test]
    fn heading_continuous_at_boundaries() {
        let mut hb = HeadingBlend::new(HeadingBlendConfig {
            imu_only_speed_kmh: 3.0,
            gps_blend_speed_kmh: 20.0,
            heading_smooth_alpha: 1.0,
            imu_mount_offset_deg: 0.0,
        });
        let just_below = {
            let mut hb2 = HeadingBlend::new(HeadingBlendConfig {
                imu_only_speed_kmh: 3.0,
                gps_blend_speed_kmh: 20.0,
                heading_smooth_alpha: 1.0,
                imu_mount_offset_deg: 0.0,
            });
            hb2.update(Some(10.0), Some(50.0), 2.999)
        };
        let at_boundary = hb.update(Some(10.0), Some(50.0), 3.0);
        assert!((just_below - at_boundary).abs() < 1.0);
    }
}
