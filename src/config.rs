//! Car profile loading: an INI-like tuning file selected by the
//! `CAR_PROFILE` environment variable, validated against a fixed schema
//! before the process is allowed to arm.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("CAR_PROFILE environment variable not set; export it to a profile name under {profiles_dir}")]
    ProfileNotSet { profiles_dir: String },

    #[error("car profile not found: {0}")]
    ProfileNotFound(PathBuf),

    #[error("profile {profile} missing required values:\n  {}", .missing.join("\n  "))]
    MissingKeys { profile: String, missing: Vec<String> },

    #[error("[{section}].{key} must be a {expected}, got {raw:?}")]
    InvalidValue {
        section: String,
        key: String,
        expected: &'static str,
        raw: String,
    },
}

/// Required `[section] -> [keys]` schema, grounded directly on the
/// original `CarConfig.REQUIRED_SCHEMA`.
fn required_schema() -> &'static [(&'static str, &'static [&'static str])] {
    &[
        (
            "vehicle",
            &[
                "wheel_diameter_mm",
                "weight_kg",
                "wheelbase_m",
                "max_steering_angle_deg",
            ],
        ),
        (
            "heading_blend",
            &[
                "imu_only_speed_kmh",
                "gps_blend_speed_kmh",
                "heading_smooth_alpha",
                "imu_mount_offset_deg",
            ],
        ),
        (
            "speed_fusion",
            &[
                "fusion_alpha",
                "imu_integrate_rate",
                "gps_drift_correction_alpha",
                "gps_drift_correction_min_speed_kmh",
                "wheelspin_detect_ratio",
                "wheelspin_detect_time_s",
                "wheelspin_max_fused_ratio",
                "stationary_timeout_s",
                "stationary_decay_rate",
                "imu_accel_noise_threshold",
            ],
        ),
        (
            "direction_estimator",
            &[
                "throttle_seed_threshold",
                "accel_confirm_threshold",
                "stopped_threshold_ms",
                "yaw_validation_min_speed_ms",
                "min_steering_for_validation",
                "min_yaw_rate_for_validation",
                "yaw_correction_min_speed_ms",
                "yaw_correction_min_yaw_rate",
                "stationary_decay_rate",
                "stationary_accel_threshold",
                "stationary_throttle_threshold",
                "bias_learning_rate",
                "confidence_decay_on_disagreement",
                "confidence_decay_when_stationary",
                "confidence_growth_rate",
            ],
        ),
        (
            "low_speed_traction",
            &[
                "launch_phase_end_kmh",
                "transition_phase_end_kmh",
                "launch_target_slip",
                "launch_slip_tolerance",
                "launch_max_throttle_rate",
                "launch_throttle_ceiling",
                "launch_slip_high_cut",
                "cruise_slip_threshold",
                "cruise_throttle_cut_rate",
                "cruise_recovery_rate",
                "cruise_min_multiplier",
                "min_throttle_for_slip",
                "yaw_rate_threshold",
                "accel_smoothing",
                "gps_drift_correction_alpha",
                "gps_drift_correction_min_speed_kmh",
            ],
        ),
        (
            "yaw_rate_controller",
            &[
                "grip_factor",
                "min_speed_kmh",
                "oversteer_threshold",
                "understeer_threshold",
                "oversteer_cut_rate",
                "understeer_cut_rate",
                "min_throttle_mult",
                "recovery_rate",
                "fast_recovery_rate",
                "virtual_brake_enabled",
                "virtual_brake_threshold",
                "max_virtual_brake",
                "yaw_smoothing",
            ],
        ),
        (
            "slip_angle_watchdog",
            &[
                "min_speed_kmh",
                "lateral_excess_threshold",
                "slip_duration_threshold_s",
                "min_throttle_for_intervention",
                "recovery_target",
                "reduction_rate",
                "recovery_rate",
                "min_multiplier",
                "smoothing_alpha",
            ],
        ),
        (
            "surface_adaptation",
            &[
                "min_speed_kmh",
                "min_steering",
                "min_samples",
                "default_grip",
                "grip_smoothing",
                "grip_min",
                "grip_max",
                "history_size",
            ],
        ),
        (
            "hill_hold",
            &[
                "pitch_threshold_deg",
                "speed_threshold_kmh",
                "throttle_deadzone",
                "hold_strength",
                "max_hold_force",
                "immediate_release_threshold",
                "blend_rate",
                "timeout_s",
                "settling_time_s",
            ],
        ),
        (
            "abs",
            &[
                "slip_threshold",
                "min_speed_kmh",
                "min_brake_input",
                "direction_hysteresis_kmh",
                "accel_direction_threshold",
                "cycle_time_ms",
                "brake_apply_ratio",
                "brake_release_ratio",
            ],
        ),
        (
            "coast_control",
            &[
                "release_threshold_high",
                "release_threshold_low",
                "coast_duration_s",
                "coast_throttle",
                "min_speed_kmh",
            ],
        ),
        (
            "steering_shaper",
            &[
                "max_steering_ratio",
                "min_steering_ratio",
                "low_speed_kmh",
                "high_speed_kmh",
                "max_rate",
                "center_rate",
                "counter_steer_enabled",
                "counter_steer_min_yaw",
                "counter_steer_strength",
                "counter_steer_max_input",
                "counter_steer_min_speed_kmh",
                "counter_steer_max_amount",
                "smoothing_alpha",
            ],
        ),
    ]
}

/// A loaded, validated car profile. Stores raw strings; typed getters do
/// the conversion at the point of use, same as the source's
/// `get_float`/`get_int`/`get_bool`.
#[derive(Clone, Debug)]
pub struct CarProfile {
    name: String,
    sections: HashMap<String, HashMap<String, String>>,
}

impl CarProfile {
    /// Resolve `CAR_PROFILE` against `profiles_dir` and load+validate it.
    pub fn load_from_env(profiles_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let profiles_dir = profiles_dir.as_ref();
        let name = env::var("CAR_PROFILE").map_err(|_| ConfigError::ProfileNotSet {
            profiles_dir: profiles_dir.display().to_string(),
        })?;
        Self::load(profiles_dir, &name)
    }

    pub fn load(profiles_dir: impl AsRef<Path>, name: &str) -> Result<Self, ConfigError> {
        let path = profiles_dir.as_ref().join(format!("{name}.ini"));
        Self::load_file(&path, name)
    }

    fn load_file(path: &Path, name: &str) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::ProfileNotFound(path.to_path_buf()));
        }
        let text = fs::read_to_string(path).map_err(|_| ConfigError::ProfileNotFound(path.to_path_buf()))?;
        let sections = parse_ini(&text);

        let profile = CarProfile {
            name: name.to_string(),
            sections,
        };
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        for (section, keys) in required_schema() {
            match self.sections.get(*section) {
                None => missing.push(format!("[{section}] section")),
                Some(present) => {
                    for key in *keys {
                        if !present.contains_key(*key) {
                            missing.push(format!("[{section}].{key}"));
                        }
                    }
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingKeys {
                profile: self.name.clone(),
                missing,
            })
        }
    }

    fn raw(&self, section: &str, key: &str) -> &str {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(|s| s.as_str())
            .unwrap_or_else(|| panic!("[{section}].{key} read without validation"))
    }

    pub fn get_float(&self, section: &str, key: &str) -> f64 {
        let raw = self.raw(section, key);
        raw.parse().unwrap_or_else(|_| {
            panic!("[{section}].{key} must be a number, got {raw:?} (should have failed validation)")
        })
    }

    pub fn get_int(&self, section: &str, key: &str) -> i64 {
        let raw = self.raw(section, key);
        raw.parse().unwrap_or_else(|_| {
            panic!("[{section}].{key} must be an integer, got {raw:?} (should have failed validation)")
        })
    }

    pub fn get_bool(&self, section: &str, key: &str) -> bool {
        matches!(
            self.raw(section, key).to_ascii_lowercase().as_str(),
            "true" | "yes" | "1" | "on"
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Minimal INI parser: `[section]` headers, `key = value` lines,
/// `#`-prefixed full-line or inline comments, no interpolation.
fn parse_ini(text: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current = String::new();

    for raw_line in text.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            current = line[1..line.len() - 1].trim().to_string();
            sections.entry(current.clone()).or_default();
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if current.is_empty() {
                continue;
            }
            sections
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    sections
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_profile(dir: &Path, name: &str, contents: &str) {
        let mut f = fs::File::create(dir.join(format!("{name}.ini"))).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    fn full_profile() -> String {
        let mut s = String::new();
        for (section, keys) in required_schema() {
            s.push_str(&format!("[{section}]\n"));
            for key in *keys {
                s.push_str(&format!("{key} = 1.0 # comment\n"));
            }
        }
        s
    }

    #[test]
    fn complete_profile_loads() {
        let dir = std::env::temp_dir().join("ratrod_test_profiles_ok");
        fs::create_dir_all(&dir).unwrap();
        write_profile(&dir, "complete", &full_profile());

        let profile = CarProfile::load(&dir, "complete").expect("should load");
        assert_eq!(profile.get_float("vehicle", "wheelbase_m"), 1.0);
    }

    #[test]
    fn missing_keys_reports_every_one() {
        let dir = std::env::temp_dir().join("ratrod_test_profiles_missing");
        fs::create_dir_all(&dir).unwrap();
        write_profile(&dir, "broken", "[vehicle]\nwheel_diameter_mm = 100\n");

        let err = CarProfile::load(&dir, "broken").unwrap_err();
        match err {
            ConfigError::MissingKeys { missing, .. } => {
                assert!(missing.iter().any(|m| m.contains("weight_kg")));
                assert!(missing.iter().any(|m| m.contains("heading_blend")));
            }
            other => panic!("expected MissingKeys, got {other:?}"),
        }
    }

    #[test]
    fn nonexistent_profile_is_not_found() {
        let dir = std::env::temp_dir().join("ratrod_test_profiles_empty_dir_xyz");
        let err = CarProfile::load(&dir, "nope").unwrap_err();
        assert!(matches!(err, ConfigError::ProfileNotFound(_)));
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        let dir = std::env::temp_dir().join("ratrod_test_profiles_bool");
        fs::create_dir_all(&dir).unwrap();
        let mut contents = full_profile();
        contents.push_str("\n[scratch]\na = true\nb = no\nc = 1\n");
        write_profile(&dir, "boolcheck", &contents);

        let profile = CarProfile::load(&dir, "boolcheck").unwrap();
        assert!(profile.get_bool("scratch", "a"));
        assert!(!profile.get_bool("scratch", "b"));
        assert!(profile.get_bool("scratch", "c"));
    }
}
