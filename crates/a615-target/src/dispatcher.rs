//! Event dispatcher: sole owner of the state machine.
//!
//! Consumes the event queue, applies each event to the state machine and
//! carries out the resulting effects. The current state is published through
//! a watch channel; everything else reads it from there.

use a615_codec::AccumulationBuffer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ap::{AccessPoint, SimulatedAccessPoint};
use crate::audit::AuditLogger;
use crate::config::TargetConfig;
use crate::error::{Result, TargetError};
use crate::event::{Event, EventKind, EventReceiver, EventSender};
use crate::fsm::{Effect, Outcome, StateMachine, StateSnapshot, SystemMode};
use crate::sensors::{SensorSource, StaticSensors};
use crate::stack::{MaintenanceStack, StackSettings};
use crate::verify::{ImageVerifier, Sha256ImageVerifier, run_verification};

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub poll_interval: Duration,
    pub stack_shutdown: Duration,
    pub max_ap_attempts: u32,
    pub ap_retry_backoff: Duration,
    pub require_sensor_interlock: bool,
    pub require_credential_exchange: bool,
    pub stack: StackSettings,
}

impl From<&TargetConfig> for DispatcherSettings {
    fn from(config: &TargetConfig) -> Self {
        Self {
            poll_interval: config.timeouts.dispatcher_poll(),
            stack_shutdown: config.timeouts.stack_shutdown(),
            max_ap_attempts: config.access_point.max_start_attempts,
            ap_retry_backoff: config.access_point.retry_backoff(),
            require_sensor_interlock: config.maintenance.require_sensor_interlock,
            require_credential_exchange: config.maintenance.require_credential_exchange,
            stack: StackSettings::from(config),
        }
    }
}

/// Hardware-facing services the dispatcher drives.
#[derive(Clone)]
pub struct Collaborators {
    pub access_point: Arc<dyn AccessPoint>,
    pub sensors: Arc<dyn SensorSource>,
    pub verifier: Arc<dyn ImageVerifier>,
}

impl Collaborators {
    /// Workstation stand-ins: simulated radio, configured sensors and the
    /// SHA-256 image verifier.
    pub fn host(config: &TargetConfig, events: &EventSender) -> Self {
        Self {
            access_point: Arc::new(SimulatedAccessPoint::new(
                config.access_point.clone(),
                events.clone(),
            )),
            sensors: Arc::new(StaticSensors::new(&config.maintenance.sensors)),
            verifier: Arc::new(Sha256ImageVerifier::new(config.device.part_number.clone())),
        }
    }
}

/// Read side of a running dispatcher.
#[derive(Debug, Clone)]
pub struct TargetHandle {
    events: EventSender,
    state: watch::Receiver<StateSnapshot>,
    listener: watch::Receiver<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl TargetHandle {
    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn state(&self) -> StateSnapshot {
        *self.state.borrow()
    }

    /// Address of the maintenance listener while the stack is up.
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        *self.listener.borrow()
    }

    pub async fn wait_for_state(
        &self,
        predicate: impl Fn(&StateSnapshot) -> bool,
        limit: Duration,
    ) -> Result<StateSnapshot> {
        let mut rx = self.state.clone();
        match timeout(limit, rx.wait_for(|state| predicate(state))).await {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Err(TargetError::EventQueue("dispatcher stopped".to_string())),
            Err(_) => Err(TargetError::SessionTimeout(format!(
                "state not reached within {:?} (now {})",
                limit,
                self.state()
            ))),
        }
    }

    pub async fn wait_for_listener(&self, limit: Duration) -> Result<SocketAddr> {
        let mut rx = self.listener.clone();
        match timeout(limit, rx.wait_for(Option::is_some)).await {
            Ok(Ok(addr)) => (*addr)
                .ok_or_else(|| TargetError::Transport("listener not running".to_string())),
            Ok(Err(_)) => Err(TargetError::EventQueue("dispatcher stopped".to_string())),
            Err(_) => Err(TargetError::SessionTimeout(format!(
                "listener not up within {:?}",
                limit
            ))),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub struct Dispatcher {
    machine: StateMachine,
    settings: DispatcherSettings,
    collaborators: Collaborators,
    events: EventSender,
    rx: EventReceiver,
    buffer: Arc<AccumulationBuffer>,
    stack: Option<MaintenanceStack>,
    ap_attempts: u32,
    pending_retry: Option<CancellationToken>,
    state_tx: watch::Sender<StateSnapshot>,
    listener_tx: watch::Sender<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        settings: DispatcherSettings,
        collaborators: Collaborators,
        events: EventSender,
        rx: EventReceiver,
    ) -> (Self, TargetHandle) {
        let machine = StateMachine::new(settings.require_credential_exchange);
        let (state_tx, state_rx) = watch::channel(machine.snapshot());
        let (listener_tx, listener_rx) = watch::channel(None);
        let shutdown = CancellationToken::new();

        let handle = TargetHandle {
            events: events.clone(),
            state: state_rx,
            listener: listener_rx,
            shutdown: shutdown.clone(),
        };
        let dispatcher = Self {
            machine,
            settings,
            collaborators,
            events,
            rx,
            buffer: Arc::new(AccumulationBuffer::for_lur()),
            stack: None,
            ap_attempts: 0,
            pending_retry: None,
            state_tx,
            listener_tx,
            shutdown,
        };
        (dispatcher, handle)
    }

    /// Runs until the handle requests shutdown.
    pub async fn run(mut self) {
        info!("Dispatcher started in {}", self.machine.snapshot());

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = timeout(self.settings.poll_interval, self.rx.recv()) => next,
            };
            match next {
                Ok(Some(event)) => self.dispatch(event).await,
                Ok(None) => break,
                Err(_) => self.housekeeping().await,
            }
        }

        self.cancel_retry();
        if self.machine.snapshot().mode == SystemMode::Maintenance {
            self.stop_maintenance().await;
        }
        info!("Dispatcher stopped in {}", self.machine.snapshot());
    }

    async fn dispatch(&mut self, event: Event) {
        let kind = event.kind;
        debug!("Dispatching {:?} in {}", kind, self.machine.snapshot());

        if kind == EventKind::EnterMaintenanceRequest
            && self.settings.require_sensor_interlock
            && self.machine.snapshot().mode == SystemMode::Operational
            && !self.sensors_permit_maintenance()
        {
            return;
        }

        match self.machine.handle(&event) {
            Outcome::Transitioned { from, to, effects } => {
                info!("{} -> {} on {:?}", from, to, kind);
                AuditLogger::mode_changed(from, to, &format!("{:?}", kind));
                self.state_tx.send_replace(to);
                for effect in effects {
                    self.apply(effect).await;
                }
            }
            Outcome::Acknowledged { effects } => {
                match kind {
                    EventKind::LogInfo => info!("{}", event.message),
                    EventKind::CoreWarnUnexpectedEvent => warn!("{}", event.message),
                    _ => debug!("{:?} acknowledged", kind),
                }
                for effect in effects {
                    self.apply(effect).await;
                }
            }
            Outcome::Ignored => {
                warn!(
                    "Unexpected event {:?} in {}, ignoring",
                    kind,
                    self.machine.snapshot()
                );
            }
        }
    }

    fn sensors_permit_maintenance(&self) -> bool {
        match self.collaborators.sensors.read() {
            Ok(snapshot) if snapshot.permits_maintenance() => true,
            Ok(snapshot) => {
                warn!("Maintenance refused by sensor interlock: {:?}", snapshot);
                AuditLogger::maintenance_refused(&format!("sensor interlock: {snapshot:?}"));
                false
            }
            Err(e) => {
                error!("Sensor read failed: {}", e);
                AuditLogger::maintenance_refused(&format!("sensor read failed: {e}"));
                self.post_detached(Event::new(EventKind::SensorsLinkDown, e.to_string()));
                false
            }
        }
    }

    async fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::StartMaintenance => self.start_maintenance().await,
            Effect::StopMaintenance => {
                self.cancel_retry();
                self.stop_maintenance().await;
            }
            Effect::RetryMaintenanceEntry => self.schedule_retry(),
            Effect::ResetApRetries => self.ap_attempts = 0,
            Effect::StartVerification(image) => self.start_verification(image),
        }
    }

    async fn start_maintenance(&mut self) {
        if let Err(e) = self.collaborators.access_point.start() {
            error!("Access point failed to start: {}", e);
            self.post_detached(Event::new(EventKind::ApStartFailure, e.to_string()));
            return;
        }
        self.post_detached(EventKind::ApStarted.into());

        match MaintenanceStack::start(
            &self.settings.stack,
            Arc::clone(&self.buffer),
            self.events.clone(),
            &self.shutdown,
        )
        .await
        {
            Ok(stack) => {
                self.listener_tx.send_replace(Some(stack.local_addr()));
                self.stack = Some(stack);
            }
            Err(e) => {
                error!("Maintenance stack failed to start: {}", e);
                self.post_detached(Event::new(
                    EventKind::AbortMaintenanceImmediate,
                    format!("network stack failed: {e}"),
                ));
            }
        }
    }

    async fn stop_maintenance(&mut self) {
        if let Some(stack) = self.stack.take() {
            stack.stop(self.settings.stack_shutdown).await;
        }
        self.listener_tx.send_replace(None);
        self.collaborators.access_point.stop();
    }

    fn schedule_retry(&mut self) {
        self.ap_attempts += 1;
        if self.ap_attempts >= self.settings.max_ap_attempts {
            error!(
                "Access point failed {} time(s), staying operational",
                self.ap_attempts
            );
            AuditLogger::maintenance_refused(&format!(
                "access point failed {} consecutive start attempts",
                self.ap_attempts
            ));
            self.ap_attempts = 0;
            return;
        }

        let delay = self.settings.ap_retry_backoff * self.ap_attempts;
        warn!(
            "Retrying maintenance entry in {:?} (attempt {} of {})",
            delay,
            self.ap_attempts + 1,
            self.settings.max_ap_attempts
        );
        let token = self.shutdown.child_token();
        self.pending_retry = Some(token.clone());
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let event = Event::new(EventKind::EnterMaintenanceRequest, "access point retry");
                    if events.post(event).await.is_err() {
                        debug!("Maintenance retry dropped");
                    }
                }
            }
        });
    }

    fn cancel_retry(&mut self) {
        if let Some(token) = self.pending_retry.take() {
            token.cancel();
        }
    }

    fn start_verification(&self, image: Option<PathBuf>) {
        let Some(image) = image else {
            warn!("Transfer completed without an image to verify");
            self.post_detached(Event::new(EventKind::SecErrImgBadFormat, "no image to verify"));
            return;
        };
        let verifier = Arc::clone(&self.collaborators.verifier);
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = run_verification(verifier, image, events).await {
                error!("Verification did not run: {}", e);
            }
        });
    }

    async fn housekeeping(&mut self) {
        let unhealthy = self
            .stack
            .as_ref()
            .is_some_and(|stack| !stack.is_healthy());
        if unhealthy && self.machine.snapshot().mode == SystemMode::Maintenance {
            error!("Maintenance network stack stopped unexpectedly");
            if let Some(stack) = self.stack.take() {
                stack.stop(self.settings.stack_shutdown).await;
            }
            self.listener_tx.send_replace(None);
            self.post_detached(Event::new(
                EventKind::AbortMaintenanceImmediate,
                "network stack stopped",
            ));
        }
    }

    /// Posts from a separate task; the dispatcher never waits on its own
    /// queue.
    fn post_detached(&self, event: Event) {
        let events = self.events.clone();
        tokio::spawn(async move {
            if events.post(event).await.is_err() {
                debug!("Self-posted event dropped");
            }
        });
    }
}
