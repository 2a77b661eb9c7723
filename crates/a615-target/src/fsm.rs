//! System mode state machine.
//!
//! `StateMachine::handle` is pure: it updates the state triple and returns
//! the side effects the dispatcher must carry out. Nested substates are reset
//! to `Unset` whenever the state that governs them is left.

use serde::Serialize;
use std::path::PathBuf;

use crate::event::{Event, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    Operational,
    Maintenance,
}

/// Meaningful only while the mode is `Maintenance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceSubstate {
    Unset,
    Waiting,
    Connected,
    WaitingAuthorization,
}

/// Meaningful only while the maintenance substate is `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionSubstate {
    Unset,
    WaitingRequest,
    CredentialExchange,
    ReceivingPackets,
    ImageVerification,
}

/// Read-only view of the state triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StateSnapshot {
    pub mode: SystemMode,
    pub maintenance: MaintenanceSubstate,
    pub connection: ConnectionSubstate,
}

impl StateSnapshot {
    pub const OPERATIONAL: StateSnapshot = StateSnapshot {
        mode: SystemMode::Operational,
        maintenance: MaintenanceSubstate::Unset,
        connection: ConnectionSubstate::Unset,
    };
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::OPERATIONAL
    }
}

impl std::fmt::Display for StateSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{:?}/{:?}", self.mode, self.maintenance, self.connection)
    }
}

/// The three image checks; a load is authorised once all have passed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerificationFlags {
    pub hash_ok: bool,
    pub pn_ok: bool,
    pub format_ok: bool,
}

impl VerificationFlags {
    pub fn all_passed(&self) -> bool {
        self.hash_ok && self.pn_ok && self.format_ok
    }
}

/// Work the dispatcher performs after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Bring up the access point and the maintenance network stack
    StartMaintenance,
    /// Tear down the maintenance network stack and the access point
    StopMaintenance,
    /// Run the image checks on a downloaded load
    StartVerification(Option<PathBuf>),
    /// Access point failed; schedule another maintenance entry
    RetryMaintenanceEntry,
    /// Access point came up; forget earlier failures
    ResetApRetries,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Transitioned {
        from: StateSnapshot,
        to: StateSnapshot,
        effects: Vec<Effect>,
    },
    /// Expected event that did not change the state
    Acknowledged { effects: Vec<Effect> },
    /// Event not valid in the current state
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    state: StateSnapshot,
    flags: VerificationFlags,
    require_credential_exchange: bool,
}

impl StateMachine {
    pub fn new(require_credential_exchange: bool) -> Self {
        Self {
            require_credential_exchange,
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.state
    }

    pub fn flags(&self) -> VerificationFlags {
        self.flags
    }

    pub fn handle(&mut self, event: &Event) -> Outcome {
        use ConnectionSubstate as Conn;
        use MaintenanceSubstate as Maint;

        let from = self.state;
        let in_maintenance = from.mode == SystemMode::Maintenance;
        let connected = in_maintenance && from.maintenance == Maint::Connected;

        let effects = match event.kind {
            EventKind::EnterMaintenanceRequest if from.mode == SystemMode::Operational => {
                self.state = StateSnapshot {
                    mode: SystemMode::Maintenance,
                    maintenance: Maint::Waiting,
                    connection: Conn::Unset,
                };
                vec![Effect::StartMaintenance]
            }
            EventKind::AbortMaintenanceImmediate
            | EventKind::SensorsLinkDown
            | EventKind::GseProbeTimeout
                if in_maintenance =>
            {
                self.leave_maintenance();
                vec![Effect::StopMaintenance]
            }
            EventKind::ApStartFailure | EventKind::ApInitFailed
                if in_maintenance && from.maintenance == Maint::Waiting =>
            {
                self.leave_maintenance();
                vec![Effect::StopMaintenance, Effect::RetryMaintenanceEntry]
            }
            EventKind::WifiClientConnected
                if in_maintenance && from.maintenance == Maint::Waiting =>
            {
                self.state.maintenance = Maint::Connected;
                self.state.connection = Conn::WaitingRequest;
                Vec::new()
            }
            EventKind::WifiClientDisconnected | EventKind::CommAuthFailure if connected => {
                self.state.maintenance = Maint::Waiting;
                self.state.connection = Conn::Unset;
                self.flags = VerificationFlags::default();
                Vec::new()
            }
            EventKind::LoadRequest if connected && from.connection == Conn::WaitingRequest => {
                self.state.connection = if self.require_credential_exchange {
                    Conn::CredentialExchange
                } else {
                    Conn::ReceivingPackets
                };
                Vec::new()
            }
            EventKind::GseAuthSuccess
                if connected && from.connection == Conn::CredentialExchange =>
            {
                self.state.connection = Conn::ReceivingPackets;
                Vec::new()
            }
            EventKind::CommTimeout
                if connected
                    && matches!(
                        from.connection,
                        Conn::CredentialExchange | Conn::ReceivingPackets
                    ) =>
            {
                self.state.connection = Conn::WaitingRequest;
                Vec::new()
            }
            EventKind::TransferComplete
                if connected && from.connection == Conn::ReceivingPackets =>
            {
                self.state.connection = Conn::ImageVerification;
                self.flags = VerificationFlags::default();
                vec![Effect::StartVerification(event.image.clone())]
            }
            EventKind::SecImgHashOk | EventKind::SecImgPnOk | EventKind::SecImgFormatOk
                if connected && from.connection == Conn::ImageVerification =>
            {
                match event.kind {
                    EventKind::SecImgHashOk => self.flags.hash_ok = true,
                    EventKind::SecImgPnOk => self.flags.pn_ok = true,
                    _ => self.flags.format_ok = true,
                }
                if !self.flags.all_passed() {
                    return Outcome::Acknowledged {
                        effects: Vec::new(),
                    };
                }
                self.state.maintenance = Maint::WaitingAuthorization;
                self.state.connection = Conn::Unset;
                self.flags = VerificationFlags::default();
                Vec::new()
            }
            EventKind::SecErrImgHashMismatch
            | EventKind::SecErrImgPnMismatch
            | EventKind::SecErrImgBadFormat
                if connected && from.connection == Conn::ImageVerification =>
            {
                self.flags = VerificationFlags::default();
                self.state.connection = Conn::ReceivingPackets;
                Vec::new()
            }
            EventKind::ApStarted if in_maintenance => {
                return Outcome::Acknowledged {
                    effects: vec![Effect::ResetApRetries],
                };
            }
            EventKind::LogInfo | EventKind::CoreWarnUnexpectedEvent => {
                return Outcome::Acknowledged {
                    effects: Vec::new(),
                };
            }
            _ => return Outcome::Ignored,
        };

        Outcome::Transitioned {
            from,
            to: self.state,
            effects,
        }
    }

    fn leave_maintenance(&mut self) {
        self.state = StateSnapshot::OPERATIONAL;
        self.flags = VerificationFlags::default();
    }
}
