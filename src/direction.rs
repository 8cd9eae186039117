//! Reconstructs signed velocity from the unsigned wheel-speed sensor by
//! fusing bias-corrected IMU integration, throttle-intent seeding at
//! standstill, and yaw-rate/steering correlation while turning.

use crate::config::CarProfile;
use crate::state::{Command, Direction};

const THROTTLE_SCALE: f64 = 32767.0 / 1000.0;

pub struct DirectionConfig {
    pub throttle_seed_threshold: Command,
    pub accel_confirm_threshold: f64,
    pub stopped_threshold_ms: f64,
    pub yaw_validation_min_speed_ms: f64,
    pub min_steering_for_validation: Command,
    pub min_yaw_rate_for_validation: f64,
    pub yaw_correction_min_speed_ms: f64,
    pub yaw_correction_min_yaw_rate: f64,
    pub stationary_decay_rate: f64,
    pub stationary_accel_threshold: f64,
    pub stationary_throttle_threshold: Command,
    pub bias_learning_rate: f64,
    pub confidence_decay_on_disagreement: f64,
    pub confidence_decay_when_stationary: f64,
    pub confidence_growth_rate: f64,
}

impl DirectionConfig {
    pub fn from_profile(profile: &CarProfile) -> Self {
        let section = "direction_estimator";
        DirectionConfig {
            throttle_seed_threshold: (profile.get_float(section, "throttle_seed_threshold") * THROTTLE_SCALE) as Command,
            accel_confirm_threshold: profile.get_float(section, "accel_confirm_threshold"),
            stopped_threshold_ms: profile.get_float(section, "stopped_threshold_ms"),
            yaw_validation_min_speed_ms: profile.get_float(section, "yaw_validation_min_speed_ms"),
            min_steering_for_validation: profile.get_int(section, "min_steering_for_validation") as Command,
            min_yaw_rate_for_validation: profile.get_float(section, "min_yaw_rate_for_validation"),
            yaw_correction_min_speed_ms: profile.get_float(section, "yaw_correction_min_speed_ms"),
            yaw_correction_min_yaw_rate: profile.get_float(section, "yaw_correction_min_yaw_rate"),
            stationary_decay_rate: profile.get_float(section, "stationary_decay_rate"),
            stationary_accel_threshold: profile.get_float(section, "stationary_accel_threshold"),
            stationary_throttle_threshold: (profile.get_float(section, "stationary_throttle_threshold") * THROTTLE_SCALE) as Command,
            bias_learning_rate: profile.get_float(section, "bias_learning_rate"),
            confidence_decay_on_disagreement: profile.get_float(section, "confidence_decay_on_disagreement"),
            confidence_decay_when_stationary: profile.get_float(section, "confidence_decay_when_stationary"),
            confidence_growth_rate: profile.get_float(section, "confidence_growth_rate"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct DirectionStatus {
    pub signed_speed_kmh: f64,
    pub direction: Option<Direction>,
    pub confidence: f64,
    pub yaw_validation_active: bool,
    pub yaw_agrees: bool,
    pub accel_bias: f64,
}

pub struct DirectionEstimator {
    config: DirectionConfig,
    signed_speed_ms: f64,
    direction: Direction,
    confidence: f64,
    accel_bias_estimate: f64,
    yaw_validation_active: bool,
    yaw_agrees: bool,
}

impl DirectionEstimator {
    pub fn new(config: DirectionConfig) -> Self {
        DirectionEstimator {
            config,
            signed_speed_ms: 0.0,
            direction: Direction::Stopped,
            confidence: 0.0,
            accel_bias_estimate: 0.0,
            yaw_validation_active: false,
            yaw_agrees: true,
        }
    }

    pub fn reset(&mut self) {
        // accel_bias_estimate intentionally persists across resets, same
        // as the source: it is a slow physical-sensor property, not
        // session state.
        self.signed_speed_ms = 0.0;
        self.direction = Direction::Stopped;
        self.confidence = 0.0;
        self.yaw_validation_active = false;
        self.yaw_agrees = true;
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn signed_speed_kmh(&self) -> f64 {
        self.signed_speed_ms * 3.6
    }

    pub fn status(&self) -> DirectionStatus {
        DirectionStatus {
            signed_speed_kmh: self.signed_speed_kmh(),
            direction: Some(self.direction),
            confidence: self.confidence,
            yaw_validation_active: self.yaw_validation_active,
            yaw_agrees: self.yaw_agrees,
            accel_bias: self.accel_bias_estimate,
        }
    }

    /// `imu_accel`: forward acceleration, m/s², positive forward.
    /// `wheel_speed_kmh`: unsigned wheel magnitude.
    /// `yaw_rate_dps`: positive = CCW/left, as reported after IMU sign
    /// correction (§6 mount inversion already applied upstream).
    pub fn update(
        &mut self,
        imu_accel: f64,
        wheel_speed_kmh: f64,
        throttle: Command,
        steering: Command,
        yaw_rate_dps: f64,
        dt: f64,
    ) -> f64 {
        let dt = dt.clamp(0.001, 0.1);
        let wheel_speed_ms = wheel_speed_kmh / 3.6;

        // Step 1: track accelerometer bias as a slow low-pass.
        self.accel_bias_estimate += self.config.bias_learning_rate * (imu_accel - self.accel_bias_estimate);
        let corrected_accel = imu_accel - self.accel_bias_estimate;

        // Step 2: integrate.
        self.signed_speed_ms += corrected_accel * dt;

        // Step 3: magnitude bound.
        if self.signed_speed_ms.abs() > wheel_speed_ms {
            let sign = if self.signed_speed_ms >= 0.0 { 1.0 } else { -1.0 };
            self.signed_speed_ms = wheel_speed_ms * sign;
        }

        // Step 4: seed direction from standstill.
        if self.signed_speed_ms.abs() < 0.5 && wheel_speed_ms < 0.5 {
            if throttle > self.config.throttle_seed_threshold && imu_accel > self.config.accel_confirm_threshold {
                self.signed_speed_ms = 0.3;
                self.confidence = 0.6;
            } else if throttle < -self.config.throttle_seed_threshold && imu_accel < -self.config.accel_confirm_threshold {
                self.signed_speed_ms = -0.3;
                self.confidence = 0.6;
            }
        }

        // Step 5: yaw-steering correlation.
        self.yaw_validation_active = false;
        self.yaw_agrees = true;
        if steering.unsigned_abs() as i32 > self.config.min_steering_for_validation as i32
            && yaw_rate_dps.abs() > self.config.min_yaw_rate_for_validation
            && wheel_speed_ms > self.config.yaw_validation_min_speed_ms
        {
            self.yaw_validation_active = true;
            let expected_yaw_sign_forward: f64 = if steering > 0 { -1.0 } else { 1.0 };
            let actual_yaw_sign: f64 = if yaw_rate_dps > 0.0 { 1.0 } else { -1.0 };
            let yaw_says_forward = actual_yaw_sign == expected_yaw_sign_forward;
            let imu_says_forward = self.signed_speed_ms > 0.0;

            if yaw_says_forward != imu_says_forward {
                self.yaw_agrees = false;
                self.confidence *= self.config.confidence_decay_on_disagreement;

                if wheel_speed_ms > self.config.yaw_correction_min_speed_ms
                    && yaw_rate_dps.abs() > self.config.yaw_correction_min_yaw_rate
                {
                    self.signed_speed_ms = -self.signed_speed_ms;
                    self.confidence = 0.8;
                }
            }
        }

        // Step 6: stationary decay.
        if wheel_speed_ms < 0.3
            && throttle.unsigned_abs() < self.config.stationary_throttle_threshold.unsigned_abs()
            && imu_accel.abs() < self.config.stationary_accel_threshold
        {
            self.signed_speed_ms *= self.config.stationary_decay_rate;
            self.confidence *= self.config.confidence_decay_when_stationary;
            if self.signed_speed_ms.abs() < 0.1 {
                self.signed_speed_ms = 0.0;
            }
        }

        // Step 7: direction state.
        self.direction = if self.signed_speed_ms.abs() < self.config.stopped_threshold_ms {
            Direction::Stopped
        } else if self.signed_speed_ms > 0.0 {
            Direction::Forward
        } else {
            Direction::Backward
        };

        if wheel_speed_ms > 2.0 && self.yaw_agrees {
            self.confidence = (self.confidence + self.config.confidence_growth_rate).min(1.0);
        }

        self.signed_speed_kmh()
    }
}
