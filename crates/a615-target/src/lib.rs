//! ARINC 615A data-loader target.
//!
//! In maintenance mode the target brings up an access point, listens for
//! TFTP on the well-known port and accepts loads through LUI/LUR/LUS
//! exchanges. The `dispatcher` owns the system state machine; everything
//! else reports to it through the event queue.

pub mod ap;
pub mod audit;
pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod fsm;
pub mod lus;
pub mod sensors;
pub mod stack;
pub mod tftp;
pub mod udp;
pub mod verify;

pub use config::TargetConfig;
pub use dispatcher::{Collaborators, Dispatcher, DispatcherSettings, TargetHandle};
pub use error::{Result, TargetError};
pub use event::{Event, EventKind, EventSender, event_channel};
pub use fsm::{ConnectionSubstate, MaintenanceSubstate, StateSnapshot, SystemMode};
