//! The driver-assistance controller chain. Each controller is applied
//! in a fixed order against the shared `VehicleState` snapshot; the
//! order itself is part of the design (steering shaping first, engine
//! braking last) and is not runtime-configurable.

pub mod abs;
pub mod coast;
pub mod hill_hold;
pub mod low_speed_traction;
pub mod slip_angle;
pub mod steering_shaper;
pub mod yaw_rate;
