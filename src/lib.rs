//! `ratrod_core` — onboard sensor-fusion and driver-assistance pipeline
//! for a remote-driven 1:10-scale monster truck. A single-threaded
//! cooperative pipeline ingests IMU/wheel/GPS samples into one shared
//! `VehicleState` and shapes each driver command through a fixed chain
//! of controllers before it reaches the motor and steering actuators.

pub mod clock;
pub mod config;
pub mod controllers;
pub mod direction;
pub mod fusion;
pub mod pipeline;
pub mod race;
pub mod sensors;
pub mod state;
pub mod surface;
pub mod telemetry;
