//! Session replay: feeds a recorded JSON-lines session through the same
//! `ratrod_core::Pipeline` the live binary drives, advancing a
//! `FakeClock` by each event's own declared `dt` instead of real wall
//! time. Useful both for field-log post-mortems and as a scripted
//! scenario harness matching the spec's concrete end-to-end scenarios.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;

use ratrod_core::clock::{Clock, FakeClock};
use ratrod_core::config::CarProfile;
use ratrod_core::pipeline::Pipeline;
use ratrod_core::sensors::{CalibrationStatus, GpsReading, ImuReading, WheelReading};
use ratrod_core::state::{Command, DriverInput, RaceState};

#[derive(Parser, Debug)]
#[command(name = "replay", about = "Replay a recorded session through the ratrod pipeline")]
struct Args {
    /// JSON-lines file of recorded sensor/driver events.
    session: PathBuf,

    #[arg(long, default_value = "profiles")]
    profiles_dir: PathBuf,

    /// Print the full telemetry snapshot after every driver event.
    #[arg(long)]
    telemetry: bool,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Event {
    Imu {
        dt: f64,
        #[serde(default)]
        heading_deg: f64,
        #[serde(default)]
        roll_deg: f64,
        #[serde(default)]
        raw_pitch_deg: f64,
        #[serde(default)]
        raw_yaw_rate_dps: f64,
        #[serde(default)]
        forward_accel_ms2: f64,
        #[serde(default)]
        raw_lateral_ms2: f64,
        #[serde(default)]
        cal_sys: u8,
        #[serde(default)]
        cal_gyro: u8,
        #[serde(default)]
        cal_acc: u8,
        #[serde(default)]
        cal_mag: u8,
    },
    Gps {
        #[serde(default)]
        speed_kmh: f64,
        #[serde(default)]
        lat: f64,
        #[serde(default)]
        lon: f64,
        #[serde(default)]
        course_deg: f64,
        #[serde(default)]
        fix: bool,
    },
    Wheel {
        #[serde(default)]
        speed_kmh: f64,
        #[serde(default)]
        rpm: f64,
    },
    Driver {
        sequence_number: u64,
        throttle: Command,
        steering: Command,
        dt: f64,
    },
    Race {
        state: String,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let profile = CarProfile::load_from_env(&args.profiles_dir).with_context(|| {
        format!("failed to load car profile from {}", args.profiles_dir.display())
    })?;

    let clock = Arc::new(FakeClock::new());
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let mut pipeline = Pipeline::new(&profile, dyn_clock);

    let file = File::open(&args.session)
        .with_context(|| format!("failed to open session file {}", args.session.display()))?;
    let reader = BufReader::new(file);

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event: Event = serde_json::from_str(line)
            .with_context(|| format!("malformed event at line {}", line_no + 1))?;

        match event {
            Event::Imu {
                dt,
                heading_deg,
                roll_deg,
                raw_pitch_deg,
                raw_yaw_rate_dps,
                forward_accel_ms2,
                raw_lateral_ms2,
                cal_sys,
                cal_gyro,
                cal_acc,
                cal_mag,
            } => {
                clock.advance_secs(dt);
                let reading = ImuReading::from_raw(
                    heading_deg,
                    roll_deg,
                    raw_pitch_deg,
                    raw_yaw_rate_dps,
                    forward_accel_ms2,
                    raw_lateral_ms2,
                    CalibrationStatus {
                        sys: cal_sys,
                        gyro: cal_gyro,
                        acc: cal_acc,
                        mag: cal_mag,
                    },
                );
                pipeline.ingest_imu(reading, dt);
            }
            Event::Gps { speed_kmh, lat, lon, course_deg, fix } => {
                pipeline.ingest_gps(GpsReading { speed_kmh, lat, lon, course_deg, fix });
            }
            Event::Wheel { speed_kmh, rpm } => {
                pipeline.ingest_wheel(WheelReading { speed_kmh, rpm });
            }
            Event::Race { state } => {
                let new_state = match state.as_str() {
                    "idle" => RaceState::Idle,
                    "countdown" => RaceState::Countdown,
                    "racing" => RaceState::Racing,
                    other => bail!("unknown race state {other:?} at line {}", line_no + 1),
                };
                pipeline.sync_race_state(new_state);
            }
            Event::Driver { sequence_number, throttle, steering, dt } => {
                clock.advance_secs(dt);
                let input = DriverInput { throttle, steering };
                match pipeline.process_driver_input(input, dt) {
                    Some(out) => println!(
                        "{}",
                        serde_json::json!({
                            "sequence_number": sequence_number,
                            "throttle": out.throttle,
                            "steering": out.steering,
                        })
                    ),
                    None => println!(
                        "{}",
                        serde_json::json!({ "sequence_number": sequence_number, "dropped": true })
                    ),
                }
                if args.telemetry {
                    println!("{}", serde_json::to_string(&pipeline.status())?);
                }
            }
        }
    }

    Ok(())
}
