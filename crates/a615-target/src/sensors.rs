use serde::Serialize;

use crate::config::SensorConfig;
use crate::error::Result;

/// Aircraft discretes that gate entry into maintenance mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SensorSnapshot {
    pub parking_brake: bool,
    pub weight_on_wheels: bool,
    pub maintenance_signal: bool,
}

impl SensorSnapshot {
    /// Loading is only allowed on the ground, brake set, with the
    /// maintenance discrete raised.
    pub fn permits_maintenance(&self) -> bool {
        self.parking_brake && self.weight_on_wheels && self.maintenance_signal
    }
}

pub trait SensorSource: Send + Sync {
    fn read(&self) -> Result<SensorSnapshot>;
}

/// Readings fixed by configuration.
pub struct StaticSensors {
    snapshot: SensorSnapshot,
}

impl StaticSensors {
    pub fn new(config: &SensorConfig) -> Self {
        Self {
            snapshot: SensorSnapshot {
                parking_brake: config.parking_brake,
                weight_on_wheels: config.weight_on_wheels,
                maintenance_signal: config.maintenance_signal,
            },
        }
    }
}

impl SensorSource for StaticSensors {
    fn read(&self) -> Result<SensorSnapshot> {
        Ok(self.snapshot)
    }
}
