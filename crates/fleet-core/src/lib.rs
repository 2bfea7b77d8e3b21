//! fleet-core: configuration shared by the fleet control plane crates.

pub mod config;
pub mod duration;

pub use config::{
    ConfigError, DaemonConfig, DriverConfig, FleetConfig, OperationsConfig, RolloutConfig,
};
pub use duration::{format_duration, parse_duration};
