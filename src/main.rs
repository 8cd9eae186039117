//! Binary entry point for the onboard pipeline: resolves the car
//! profile, wires sensor ingestion and the driver-input/actuator-output
//! channels to one `Pipeline`, and drives everything from a single
//! cooperative select loop (§5 — no two tasks ever touch `VehicleState`
//! at once; ingestion tasks only ever hand a reading to this loop).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration};

use ratrod_core::clock::{Clock, SystemClock};
use ratrod_core::config::CarProfile;
use ratrod_core::pipeline::Pipeline;
use ratrod_core::race::{LocalRaceSupervisor, RaceSupervisor};
use ratrod_core::sensors::{
    CalibrationBlob, CalibrationManager, GpsReading, GpsSource, ImuReading, ImuSource,
    MockGpsSource, MockImuSource, WheelPulseCounter, WheelReading, WheelSource,
    CALIBRATION_BLOB_SIZE,
};
use ratrod_core::state::{Command, DriverInput};

const IMU_POLL_HZ: f64 = 20.0;
const GPS_POLL_INTERVAL_MS: u64 = 400;
const WHEEL_POLL_HZ: f64 = 20.0;
const DISCONNECT_TIMEOUT_S: f64 = 3.0;

#[derive(Parser, Debug)]
#[command(name = "ratrod", about = "Onboard remote-driving safety and assistance core")]
struct Cli {
    /// Directory holding `<name>.ini` car profiles; `CAR_PROFILE` selects which one.
    #[arg(long, default_value = "profiles")]
    profiles_dir: PathBuf,

    /// Where the IMU calibration blob is persisted/restored between sessions.
    #[arg(long, default_value = "calibration.bin")]
    calibration_path: PathBuf,
}

/// One driver-input sample as it arrives from the transport layer. The
/// network-facing control path itself is out of scope (§1); this
/// struct is the interface boundary it hands samples across.
struct DriverSample {
    sequence_number: u64,
    input: DriverInput,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let profile = match CarProfile::load_from_env(&cli.profiles_dir) {
        Ok(p) => p,
        Err(e) => {
            error!("[main] refusing to arm: {e}");
            return Err(e.into());
        }
    };
    info!("[main] loaded car profile {:?}", profile.name());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut pipeline = Pipeline::new(&profile, clock.clone());

    let race = LocalRaceSupervisor::new(3.0);
    race.start_countdown();

    let mut calibration = CalibrationManager::new(cli.calibration_path.clone());
    let calibration_blob = match calibration.restore() {
        Some(blob) => {
            info!("[imu] calibration restored, fusion armed with prior offsets");
            blob
        }
        None => {
            warn!("[imu] no calibration blob found, starting fresh (invariant 6: restore before fusion, never after)");
            CalibrationBlob([0u8; CALIBRATION_BLOB_SIZE])
        }
    };

    let (imu_tx, mut imu_rx) = mpsc::channel::<ImuReading>(8);
    let (gps_tx, mut gps_rx) = mpsc::channel::<GpsReading>(8);
    let (wheel_tx, mut wheel_rx) = mpsc::channel::<WheelReading>(8);
    let (driver_tx, mut driver_rx) = mpsc::channel::<DriverSample>(32);

    tokio::spawn(imu_ingestion_task(imu_tx));
    tokio::spawn(gps_ingestion_task(gps_tx));
    tokio::spawn(wheel_ingestion_task(wheel_tx));

    // Stands in for the external transport (§1): a fixed demo sequence
    // of driver commands at 50 Hz. A real deployment replaces this task
    // with whatever decodes the network control-path payload into the
    // same `DriverSample` shape.
    tokio::spawn(demo_driver_task(driver_tx));

    let mut last_imu_tick = clock.now();
    let mut last_driver_sample = clock.now();

    info!("[main] pipeline armed, entering select loop");

    loop {
        tokio::select! {
            Some(reading) = imu_rx.recv() => {
                let now = clock.now();
                let dt = now
                    .saturating_duration_since(last_imu_tick)
                    .as_secs_f64()
                    .max(1.0 / IMU_POLL_HZ / 4.0);
                last_imu_tick = now;
                pipeline.ingest_imu(reading, dt);
                calibration.maybe_persist(reading.calibration, &calibration_blob);
            }
            Some(reading) = gps_rx.recv() => {
                pipeline.ingest_gps(reading);
            }
            Some(reading) = wheel_rx.recv() => {
                pipeline.ingest_wheel(reading);
            }
            Some(sample) = driver_rx.recv() => {
                let now = clock.now();
                let dt = now.saturating_duration_since(last_driver_sample).as_secs_f64().max(1e-3);
                last_driver_sample = now;

                pipeline.sync_race_state(race.state());
                match pipeline.process_driver_input(sample.input, dt) {
                    Some(output) => info!(
                        "[actuator] seq={} throttle={} steering={}",
                        sample.sequence_number, output.throttle, output.steering
                    ),
                    None => {
                        // Category 6 (§7): out-of-session input, silently dropped.
                    }
                }
            }
            else => {
                error!("[main] all ingestion channels closed, shutting down");
                break;
            }
        }

        if pipeline.state().driver_connected
            && clock.now().saturating_duration_since(last_driver_sample).as_secs_f64() > DISCONNECT_TIMEOUT_S
        {
            warn!("[main] driver disconnect timeout exceeded, resetting session state");
            pipeline.reset_for_session();
            race.stop();
        }
    }

    Ok(())
}

async fn imu_ingestion_task(tx: mpsc::Sender<ImuReading>) {
    let mut source = MockImuSource::new();
    let mut ticker = interval(Duration::from_secs_f64(1.0 / IMU_POLL_HZ));
    loop {
        ticker.tick().await;
        match source.poll().await {
            Some(reading) => {
                if tx.send(reading).await.is_err() {
                    break;
                }
            }
            None => warn!("[imu] poll returned no reading, previous sample stays in VehicleState"),
        }
    }
}

async fn gps_ingestion_task(tx: mpsc::Sender<GpsReading>) {
    let mut source = MockGpsSource::new();
    let mut ticker = interval(Duration::from_millis(GPS_POLL_INTERVAL_MS));
    loop {
        ticker.tick().await;
        if let Some(reading) = source.poll().await {
            if tx.send(reading).await.is_err() {
                break;
            }
        }
    }
}

/// Stands in for the GPIO pulse ISR (§5): a background pulse generator
/// plays the interrupt's role, firing at a slowly increasing rate to
/// simulate the truck accelerating away from standstill, while this
/// task's own loop samples the derived reading at the cadence a real
/// adapter would be polled at.
async fn wheel_ingestion_task(tx: mpsc::Sender<WheelReading>) {
    let counter = WheelPulseCounter::new(100.0, 1, 0.5);
    let pulse_counter = counter.clone();
    tokio::spawn(async move {
        let pulse_clock = SystemClock;
        let mut interval_s = 0.2;
        loop {
            sleep(Duration::from_secs_f64(interval_s)).await;
            pulse_counter.on_pulse(&pulse_clock);
            interval_s = (interval_s * 0.995).max(0.03);
        }
    });

    let mut ticker = interval(Duration::from_secs_f64(1.0 / WHEEL_POLL_HZ));
    loop {
        ticker.tick().await;
        if let Some(reading) = counter.snapshot() {
            if tx.send(reading).await.is_err() {
                break;
            }
        }
    }
}

async fn demo_driver_task(tx: mpsc::Sender<DriverSample>) {
    let mut ticker = interval(Duration::from_millis(20));
    let mut seq: u64 = 0;
    loop {
        ticker.tick().await;
        seq += 1;
        let input = DriverInput {
            throttle: 12000,
            steering: ((seq as f64 * 0.05).sin() * 8000.0) as Command,
        };
        if tx
            .send(DriverSample { sequence_number: seq, input })
            .await
            .is_err()
        {
            break;
        }
    }
}
