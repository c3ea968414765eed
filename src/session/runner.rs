//! The session task: one `select!` loop owning the transport, all timers
//! and the published state, driven by UI commands and inbound lines.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use crate::discovery::{select_port, DeviceRegistry, DiscoveredDevice, PreferenceStore};
use crate::protocol::{
    classify_line, encode_config, encoder::CMD_ZERO, DecodedLine, HapticConfig, Query,
};
use crate::session::liveness::{LivenessLoss, LivenessMonitor};
use crate::session::poller::Poller;
use crate::session::state::{Phase, SessionSnapshot};
use crate::session::{ErrorKind, Result, SessionError, SessionEvent, DEFAULT_BAUD_RATE};
use crate::transport::{Transport, TransportEvent};

/// Timing and channel sizing. Defaults match the device's reference
/// behavior; tests compress the windows.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub grace_period: Duration,
    pub liveness_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub max_reconnect_attempts: u32,
    pub poll_interval: Duration,
    pub event_capacity: usize,
    pub command_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(2000),
            liveness_timeout: Duration::from_millis(2000),
            reconnect_backoff: Duration::from_millis(1000),
            max_reconnect_attempts: 3,
            poll_interval: Duration::from_millis(25),
            event_capacity: 256,
            command_capacity: 64,
        }
    }
}

enum Command {
    Connect {
        port: String,
        baud: u32,
        responder: oneshot::Sender<Result<()>>,
    },
    AutoConnect {
        responder: oneshot::Sender<Result<Option<String>>>,
    },
    Disconnect {
        responder: oneshot::Sender<()>,
    },
    ApplyConfig {
        config: HapticConfig,
        responder: oneshot::Sender<Result<()>>,
    },
    SetPolling {
        enabled: bool,
        interval_ms: Option<u64>,
        responder: oneshot::Sender<()>,
    },
    Request {
        query: Query,
        responder: oneshot::Sender<Result<()>>,
    },
    Zero {
        responder: oneshot::Sender<Result<()>>,
    },
    ListDevices {
        responder: oneshot::Sender<Result<Vec<DiscoveredDevice>>>,
    },
    Shutdown,
}

/// Cloneable UI-facing handle to a running session task.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<SessionEvent>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    async fn request_with<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn connect(&self, port: &str, baud: u32) -> Result<()> {
        self.request_with(|responder| Command::Connect {
            port: port.to_string(),
            baud,
            responder,
        })
        .await?
    }

    /// Scan ports and connect to the remembered device if it is present.
    /// Returns the chosen port path, or `None` when the choice is left to
    /// the user.
    pub async fn auto_connect(&self) -> Result<Option<String>> {
        self.request_with(|responder| Command::AutoConnect { responder })
            .await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request_with(|responder| Command::Disconnect { responder })
            .await
    }

    pub async fn apply_config(&self, config: HapticConfig) -> Result<()> {
        self.request_with(|responder| Command::ApplyConfig { config, responder })
            .await?
    }

    /// Apply a mode arriving as free text from the UI layer, with the mode's
    /// default parameters. Unknown names surface a configuration error and
    /// nothing is written to the device.
    pub async fn apply_mode(&self, name: &str) -> Result<()> {
        let config = HapticConfig::with_mode_name(name).map_err(|e| {
            let _ = self.events_tx.send(SessionEvent::Error {
                kind: ErrorKind::Configuration,
                message: e.to_string(),
            });
            SessionError::Protocol(e)
        })?;
        self.apply_config(config).await
    }

    pub async fn set_polling(&self, enabled: bool, interval_ms: Option<u64>) -> Result<()> {
        self.request_with(|responder| Command::SetPolling {
            enabled,
            interval_ms,
            responder,
        })
        .await
    }

    pub async fn request_angle(&self) -> Result<()> {
        self.request(Query::Angle).await
    }

    pub async fn request_velocity(&self) -> Result<()> {
        self.request(Query::Velocity).await
    }

    pub async fn request_torque(&self) -> Result<()> {
        self.request(Query::Torque).await
    }

    async fn request(&self, query: Query) -> Result<()> {
        self.request_with(|responder| Command::Request { query, responder })
            .await?
    }

    /// Re-zero the knob's angle origin.
    pub async fn reset(&self) -> Result<()> {
        self.request_with(|responder| Command::Zero { responder })
            .await?
    }

    /// Calibration collapses to the same zeroing command on the wire.
    pub async fn calibrate(&self) -> Result<()> {
        self.reset().await
    }

    /// Devices seen by the most recent port scans.
    pub async fn list_devices(&self) -> Result<Vec<DiscoveredDevice>> {
        self.request_with(|responder| Command::ListDevices { responder })
            .await?
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn snapshot(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

/// Entry point: spawns the session task and hands back its handle.
pub struct DeviceSession;

impl DeviceSession {
    pub fn spawn(
        transport: impl Transport + 'static,
        preferences: impl PreferenceStore + 'static,
        config: SessionConfig,
    ) -> SessionHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_capacity);
        let (events_tx, _) = broadcast::channel(config.event_capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let mut transport: Box<dyn Transport> = Box::new(transport);
        let transport_events = transport.events();

        let runner = Runner {
            transport,
            preferences: Box::new(preferences),
            liveness: LivenessMonitor::new(config.grace_period, config.liveness_timeout),
            poller: Poller::new(config.poll_interval),
            config,
            snapshot: SessionSnapshot::default(),
            snapshot_tx,
            events_tx: events_tx.clone(),
            registry: DeviceRegistry::new(),
            reconnect: None,
        };
        tokio::spawn(runner.run(cmd_rx, transport_events));

        SessionHandle {
            cmd_tx,
            events_tx,
            snapshot_rx,
        }
    }
}

struct ReconnectState {
    attempts: u32,
    at: Instant,
}

struct Runner {
    transport: Box<dyn Transport>,
    preferences: Box<dyn PreferenceStore>,
    config: SessionConfig,
    liveness: LivenessMonitor,
    poller: Poller,
    snapshot: SessionSnapshot,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
    registry: DeviceRegistry,
    reconnect: Option<ReconnectState>,
}

impl Runner {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut events_open = true;
        loop {
            let next = self.next_deadline();
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                maybe_event = transport_events.recv(), if events_open => {
                    match maybe_event {
                        Some(event) => self.handle_transport_event(event).await,
                        None => events_open = false,
                    }
                }
                _ = sleep_until(next.unwrap_or_else(far_future)), if next.is_some() => {
                    self.handle_deadlines(Instant::now()).await;
                }
            }
        }
        if let Err(e) = self.transport.close().await {
            log::debug!("Transport close on shutdown failed: {}", e);
        }
        log::info!("Session task terminated");
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.liveness.grace_deadline(),
            self.liveness.timeout_deadline(),
            self.reconnect.as_ref().map(|r| r.at),
            self.poller.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect {
                port,
                baud,
                responder,
            } => {
                let result = self.connect(&port, baud).await;
                let _ = responder.send(result);
            }
            Command::AutoConnect { responder } => {
                let result = self.auto_connect().await;
                let _ = responder.send(result);
            }
            Command::Disconnect { responder } => {
                self.disconnect().await;
                let _ = responder.send(());
            }
            Command::ApplyConfig { config, responder } => {
                let result = self.apply_config(&config).await;
                let _ = responder.send(result);
            }
            Command::SetPolling {
                enabled,
                interval_ms,
                responder,
            } => {
                self.set_polling(enabled, interval_ms);
                let _ = responder.send(());
            }
            Command::Request { query, responder } => {
                let result = self.write_checked(query.line()).await;
                let _ = responder.send(result);
            }
            Command::Zero { responder } => {
                let result = self.write_checked(CMD_ZERO).await;
                let _ = responder.send(result);
            }
            Command::ListDevices { responder } => {
                let result = self.list_devices();
                let _ = responder.send(result);
            }
            // Intercepted by the run loop before dispatch.
            Command::Shutdown => {}
        }
    }

    async fn connect(&mut self, port: &str, baud: u32) -> Result<()> {
        if matches!(self.snapshot.phase, Phase::Connecting | Phase::Reconnecting) {
            return Err(SessionError::Busy);
        }
        if matches!(self.snapshot.phase, Phase::Connected | Phase::Degraded) {
            // connect() from a live session supersedes it
            self.disconnect().await;
        }

        self.set_phase(Phase::Connecting, None);
        log::info!("Connecting to {} at {} baud", port, baud);
        match self.transport.open(port, baud).await {
            Ok(()) => {
                let now = Instant::now();
                self.snapshot.port = Some(port.to_string());
                self.snapshot.baud = Some(baud);
                self.snapshot.reconnect_attempts = 0;
                self.snapshot.responding = false;
                self.liveness.reset();
                self.liveness.arm_grace(now);
                self.poller.start(now);
                self.set_phase(Phase::Connected, None);
                self.remember_device(port);
                Ok(())
            }
            Err(e) => {
                self.set_phase(Phase::Disconnected, None);
                self.emit_error(ErrorKind::Transport, format!("Connection failed: {}", e));
                Err(e.into())
            }
        }
    }

    async fn auto_connect(&mut self) -> Result<Option<String>> {
        if matches!(self.snapshot.phase, Phase::Connecting | Phase::Reconnecting) {
            return Err(SessionError::Busy);
        }
        let ports = self.transport.list_ports()?;
        self.registry.update(ports.clone());
        let preferred = self.preferences.load_last_device();
        match select_port(&ports, preferred.as_deref()) {
            Some(info) => {
                let path = info.path.clone();
                log::info!("Auto-connect picked remembered device on {}", path);
                self.connect(&path, DEFAULT_BAUD_RATE).await?;
                Ok(Some(path))
            }
            None => {
                log::debug!("Auto-connect found no remembered device; leaving choice to user");
                Ok(None)
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.transport.close().await {
            log::debug!("Transport close failed: {}", e);
        }
        self.liveness.reset();
        self.poller.stop();
        self.reconnect = None;
        self.snapshot = SessionSnapshot::default();
        self.set_phase(Phase::Disconnected, None);
        self.publish();
        log::info!("Disconnected");
    }

    async fn apply_config(&mut self, config: &HapticConfig) -> Result<()> {
        for line in &encode_config(config) {
            self.write_checked(line).await?;
        }
        Ok(())
    }

    fn set_polling(&mut self, enabled: bool, interval_ms: Option<u64>) {
        let now = Instant::now();
        if let Some(ms) = interval_ms {
            self.poller.set_interval(Poller::clamp_interval_ms(ms), now);
        }
        let running = self.link_open();
        self.poller.set_enabled(enabled, running, now);
    }

    fn list_devices(&mut self) -> Result<Vec<DiscoveredDevice>> {
        let ports = self.transport.list_ports()?;
        self.registry.update(ports);
        Ok(self.registry.devices())
    }

    /// Write one command line, surfacing and returning transport failures.
    /// Used for user-initiated writes, which abort on error.
    async fn write_checked(&mut self, line: &str) -> Result<()> {
        if !self.link_open() {
            return Err(SessionError::NotConnected);
        }
        match self.transport.write_line(line).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.emit_error(ErrorKind::Transport, format!("Write failed: {}", e));
                Err(e.into())
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Line(line) => self.handle_line(&line),
            TransportEvent::Error(message) => {
                log::warn!("Transport error: {}", message);
                if self.link_open() {
                    self.emit_error(ErrorKind::Transport, message);
                }
            }
            TransportEvent::Disconnected => {
                if self.link_open() {
                    log::warn!("Link dropped unexpectedly");
                    self.emit_error(ErrorKind::Transport, "Link dropped".to_string());
                    let reconnect = self.liveness.link_dropped();
                    self.snapshot.responding = false;
                    self.set_phase(Phase::Degraded, Some("link dropped"));
                    if reconnect {
                        self.start_reconnect(Instant::now()).await;
                    }
                }
            }
        }
    }

    /// Phases in which the port is ours and inbound traffic is meaningful.
    /// Lines buffered in the event channel can arrive after `disconnect()`
    /// or while a reconnect is pending; acting on them would flip a dead or
    /// half-open session back to `Connected`.
    fn link_open(&self) -> bool {
        matches!(self.snapshot.phase, Phase::Connected | Phase::Degraded)
    }

    fn handle_line(&mut self, line: &str) {
        if !self.link_open() {
            log::debug!("Dropping stale line in phase {:?}: {:?}", self.snapshot.phase, line);
            return;
        }
        match classify_line(line) {
            DecodedLine::Unrecognized => {
                // Deliberately does not touch the liveness timer.
                log::debug!("Unrecognized line: {:?}", line);
            }
            decoded => {
                let recovered = self.liveness.note_classified(Instant::now());
                self.snapshot.last_valid_response_at = Some(Utc::now());
                if let DecodedLine::Telemetry(sample) = decoded {
                    if !sample.is_empty() {
                        self.snapshot.telemetry.merge(&sample);
                        let _ = self.events_tx.send(SessionEvent::Telemetry(sample));
                    }
                }
                if recovered {
                    self.snapshot.responding = true;
                    self.snapshot.reconnect_attempts = 0;
                    self.set_phase(Phase::Connected, Some("responding"));
                }
                self.publish();
            }
        }
    }

    async fn handle_deadlines(&mut self, now: Instant) {
        if self.liveness.grace_deadline().is_some_and(|d| now >= d) {
            self.liveness.grace_elapsed(now);
            log::debug!("Grace period over, probing device");
            if let Err(e) = self.transport.write_line(Query::All.line()).await {
                // The countdown keeps running; an unanswered probe is
                // reported when it elapses.
                log::warn!("Liveness probe write failed: {}", e);
                self.emit_error(ErrorKind::Transport, format!("Probe failed: {}", e));
            }
        }

        if self.liveness.timeout_deadline().is_some_and(|d| now >= d) {
            match self.liveness.timed_out() {
                LivenessLoss::NeverResponded => {
                    self.snapshot.responding = false;
                    self.set_phase(Phase::Degraded, Some("no response"));
                    self.emit_error(
                        ErrorKind::DeviceNotResponding,
                        "Device is not responding".to_string(),
                    );
                }
                LivenessLoss::LostContact { reconnect } => {
                    log::warn!("Device stopped responding");
                    self.snapshot.responding = false;
                    self.set_phase(Phase::Degraded, Some("stopped responding"));
                    self.emit_error(
                        ErrorKind::DeviceNotResponding,
                        "Device stopped responding".to_string(),
                    );
                    if reconnect {
                        self.start_reconnect(now).await;
                    }
                }
            }
        }

        if self.reconnect.as_ref().is_some_and(|r| now >= r.at) {
            self.attempt_reconnect(now).await;
        }

        if self.poller.tick_due(now) {
            // Fire and forget; transient poll failures are absorbed and only
            // show up as liveness loss if they persist.
            if let Err(e) = self.transport.write_line(Query::All.line()).await {
                log::warn!("Poll write failed: {}", e);
            }
        }
    }

    async fn start_reconnect(&mut self, now: Instant) {
        log::info!("Starting reconnect");
        self.poller.stop();
        if let Err(e) = self.transport.close().await {
            log::debug!("Close before reconnect failed: {}", e);
        }
        self.snapshot.reconnect_attempts = 0;
        self.reconnect = Some(ReconnectState {
            attempts: 0,
            at: now + self.config.reconnect_backoff,
        });
        self.set_phase(Phase::Reconnecting, None);
    }

    async fn attempt_reconnect(&mut self, now: Instant) {
        let (port, baud) = match (self.snapshot.port.clone(), self.snapshot.baud) {
            (Some(port), Some(baud)) => (port, baud),
            _ => {
                self.reconnect = None;
                return;
            }
        };
        let attempts = match self.reconnect.as_mut() {
            Some(state) => {
                state.attempts += 1;
                state.attempts
            }
            None => return,
        };
        self.snapshot.reconnect_attempts = attempts;
        log::info!(
            "Reconnect attempt {}/{} on {}",
            attempts,
            self.config.max_reconnect_attempts,
            port
        );

        match self.transport.open(&port, baud).await {
            Ok(()) => {
                self.reconnect = None;
                self.snapshot.responding = false;
                self.liveness.arm_grace(now);
                self.poller.start(now);
                self.set_phase(Phase::Connected, Some("reconnected"));
            }
            Err(e) => {
                log::warn!("Reconnect attempt {} failed: {}", attempts, e);
                if attempts >= self.config.max_reconnect_attempts {
                    self.reconnect = None;
                    self.set_phase(Phase::Degraded, Some("reconnect exhausted"));
                    self.emit_error(
                        ErrorKind::ReconnectExhausted,
                        format!(
                            "Gave up after {} reconnect attempts",
                            self.config.max_reconnect_attempts
                        ),
                    );
                } else if let Some(state) = self.reconnect.as_mut() {
                    state.at = now + self.config.reconnect_backoff;
                }
            }
        }
    }

    /// Persist the identifier of the port we just connected to, when the
    /// port exposes one.
    fn remember_device(&mut self, port: &str) {
        match self.transport.list_ports() {
            Ok(ports) => {
                if let Some(id) = ports
                    .iter()
                    .find(|p| p.path == port)
                    .and_then(|p| p.device_identifier())
                {
                    self.preferences.save_last_device(id);
                }
            }
            Err(e) => log::debug!("Port scan after connect failed: {}", e),
        }
    }

    fn set_phase(&mut self, phase: Phase, detail: Option<&str>) {
        if self.snapshot.phase != phase || detail.is_some() {
            self.snapshot.phase = phase;
            let _ = self.events_tx.send(SessionEvent::PhaseChanged {
                phase,
                detail: detail.map(str::to_string),
            });
            self.publish();
        }
    }

    fn emit_error(&mut self, kind: ErrorKind, message: String) {
        let _ = self.events_tx.send(SessionEvent::Error { kind, message });
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(self.snapshot.clone());
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400)
}
