//! Wireless access point the data loader associates with.

use tracing::{info, warn};

use crate::config::AccessPointConfig;
use crate::error::Result;
use crate::event::{Event, EventKind, EventSender};

/// Radio control used by the dispatcher when entering and leaving
/// maintenance mode. Calls are short and must not block on the network.
pub trait AccessPoint: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self);
}

/// Host stand-in for the radio.
///
/// Logs the configured SSID and, when `simulate_station` is set, reports a
/// station association as soon as the access point is up and its departure
/// when it goes down.
pub struct SimulatedAccessPoint {
    config: AccessPointConfig,
    events: EventSender,
}

impl SimulatedAccessPoint {
    pub fn new(config: AccessPointConfig, events: EventSender) -> Self {
        Self { config, events }
    }
}

impl AccessPoint for SimulatedAccessPoint {
    fn start(&self) -> Result<()> {
        info!(
            "Access point '{}' up on channel {}",
            self.config.ssid, self.config.channel
        );
        if self.config.simulate_station {
            let event = Event::new(EventKind::WifiClientConnected, "simulated station associated");
            if let Err(e) = self.events.try_post(event) {
                warn!("Could not report simulated station: {}", e);
            }
        }
        Ok(())
    }

    fn stop(&self) {
        info!("Access point '{}' down", self.config.ssid);
        if self.config.simulate_station {
            let event = Event::new(EventKind::WifiClientDisconnected, "simulated station left");
            if let Err(e) = self.events.try_post(event) {
                warn!("Could not report simulated station: {}", e);
            }
        }
    }
}
