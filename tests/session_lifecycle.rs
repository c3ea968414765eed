//! State machine, liveness and reconnect behavior, driven through a
//! scripted mock transport on a paused tokio clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hapticdial::discovery::{MemoryStore, PreferenceStore};
use hapticdial::session::ErrorKind;
use hapticdial::transport::{MockTransport, MockTransportHandle, PortInfo, TransportEvent};
use hapticdial::{
    DeviceSession, EndstopStyle, HapticConfig, HapticMode, Phase, SessionConfig, SessionError,
    SessionEvent, SessionHandle,
};

/// Preference store whose contents the test can observe after the session
/// has taken ownership.
#[derive(Clone, Default)]
struct SharedPrefs(Arc<Mutex<Option<String>>>);

impl SharedPrefs {
    fn get(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}

impl PreferenceStore for SharedPrefs {
    fn load_last_device(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }

    fn save_last_device(&mut self, identifier: &str) {
        *self.0.lock().unwrap() = Some(identifier.to_string());
    }
}

fn knob_port(path: &str, serial: &str) -> PortInfo {
    PortInfo {
        serial_number: Some(serial.to_string()),
        manufacturer: Some("HapticDial".to_string()),
        ..PortInfo::new(path)
    }
}

fn spawn_session() -> (SessionHandle, MockTransportHandle) {
    let (transport, mock) = MockTransport::new();
    mock.set_ports(vec![knob_port("COM3", "KNOB-42")]);
    let handle = DeviceSession::spawn(transport, MemoryStore::new(), SessionConfig::default());
    (handle, mock)
}

/// Let the session task drain its channels.
async fn settle() {
    for _ in 0..25 {
        tokio::task::yield_now().await;
    }
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    settle().await;
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn has_error(events: &[SessionEvent], kind: ErrorKind) -> bool {
    events
        .iter()
        .any(|e| matches!(e, SessionEvent::Error { kind: k, .. } if *k == kind))
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_suppresses_not_responding() {
    let (session, _mock) = spawn_session();
    let mut events = session.subscribe_events();

    session.connect("COM3", 115200).await.unwrap();
    sleep_ms(1900).await;
    let seen = drain(&mut events);
    assert!(
        !has_error(&seen, ErrorKind::DeviceNotResponding),
        "no liveness error may surface inside the grace window"
    );
    assert_eq!(session.snapshot().borrow().phase, Phase::Connected);

    // Grace over at 2000 ms, probe unanswered for another 2000 ms.
    sleep_ms(2200).await;
    let seen = drain(&mut events);
    assert!(has_error(&seen, ErrorKind::DeviceNotResponding));
    assert_eq!(session.snapshot().borrow().phase, Phase::Degraded);
}

#[tokio::test(start_paused = true)]
async fn test_probe_is_sent_when_grace_elapses() {
    let (session, mock) = spawn_session();
    session.connect("COM3", 115200).await.unwrap();

    sleep_ms(1900).await;
    assert!(mock.written_lines().is_empty());

    sleep_ms(200).await;
    assert_eq!(mock.written_lines(), vec!["get all\n"]);
}

#[tokio::test(start_paused = true)]
async fn test_probe_failure_does_not_auto_reconnect() {
    let (session, mock) = spawn_session();
    session.connect("COM3", 115200).await.unwrap();

    // Never respond at all; only the initial open should ever happen.
    sleep_ms(10_000).await;
    assert_eq!(session.snapshot().borrow().phase, Phase::Degraded);
    assert_eq!(mock.open_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_liveness_loss_reconnects_exactly_once() {
    let (session, mock) = spawn_session();
    let mut events = session.subscribe_events();
    session.connect("COM3", 115200).await.unwrap();

    mock.push_line("OK");
    settle().await;
    assert!(session.snapshot().borrow().responding);

    // Silence for the full timeout: degraded, then one reconnect.
    sleep_ms(2100).await;
    let seen = drain(&mut events);
    assert!(has_error(&seen, ErrorKind::DeviceNotResponding));
    assert!(seen
        .iter()
        .any(|e| matches!(e, SessionEvent::PhaseChanged { phase: Phase::Reconnecting, .. })));

    // Backoff elapses, reopen succeeds, fresh grace window.
    sleep_ms(1100).await;
    assert_eq!(mock.open_calls().len(), 2);
    assert_eq!(session.snapshot().borrow().phase, Phase::Connected);

    // Continued silence never spawns a second reconnect for the same loss.
    sleep_ms(20_000).await;
    assert_eq!(mock.open_calls().len(), 2);
    assert_eq!(session.snapshot().borrow().phase, Phase::Degraded);

    // A classified line recovers the session; a fresh loss reconnects again.
    mock.push_line("OK");
    settle().await;
    assert!(session.snapshot().borrow().responding);
    sleep_ms(3200).await;
    assert_eq!(mock.open_calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_exhausts_after_three_failures() {
    let (session, mock) = spawn_session();
    let mut events = session.subscribe_events();
    session.connect("COM3", 115200).await.unwrap();
    mock.push_line("OK");
    settle().await;

    for _ in 0..3 {
        mock.script_open(Err("port busy"));
    }

    // Loss at 2000 ms, reconnect attempts at 3000/4000/5000 ms.
    sleep_ms(6000).await;
    let seen = drain(&mut events);
    assert!(has_error(&seen, ErrorKind::ReconnectExhausted));
    assert_eq!(mock.open_calls().len(), 4, "initial open plus 3 attempts");
    let snapshot = session.snapshot().borrow().clone();
    assert_eq!(snapshot.phase, Phase::Degraded);
    assert_eq!(snapshot.reconnect_attempts, 3);

    // Exhaustion is terminal until a manual reconnect.
    sleep_ms(10_000).await;
    assert_eq!(mock.open_calls().len(), 4);

    session.connect("COM3", 115200).await.unwrap();
    assert_eq!(mock.open_calls().len(), 5);
    assert_eq!(session.snapshot().borrow().phase, Phase::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_rejected_while_reconnecting() {
    let (session, mock) = spawn_session();
    session.connect("COM3", 115200).await.unwrap();
    mock.push_line("OK");
    settle().await;

    // Enter the reconnect backoff window.
    sleep_ms(2100).await;
    assert_eq!(session.snapshot().borrow().phase, Phase::Reconnecting);
    let result = session.connect("COM3", 115200).await;
    assert!(matches!(result, Err(SessionError::Busy)));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let (session, mock) = spawn_session();
    session.connect("COM3", 115200).await.unwrap();

    session.disconnect().await.unwrap();
    assert_eq!(session.snapshot().borrow().phase, Phase::Disconnected);
    session.disconnect().await.unwrap();
    let snapshot = session.snapshot().borrow().clone();
    assert_eq!(snapshot.phase, Phase::Disconnected);
    assert_eq!(snapshot.port, None);
    assert!(!mock.is_open());

    // No timer may fire into the dead session.
    sleep_ms(30_000).await;
    assert_eq!(session.snapshot().borrow().phase, Phase::Disconnected);
    assert_eq!(mock.open_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_open_surfaces_error_and_stays_disconnected() {
    let (session, mock) = spawn_session();
    let mut events = session.subscribe_events();
    mock.script_open(Err("no such port"));

    let result = session.connect("COM9", 115200).await;
    assert!(matches!(result, Err(SessionError::Transport(_))));
    assert!(has_error(&drain(&mut events), ErrorKind::Transport));
    assert_eq!(session.snapshot().borrow().phase, Phase::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_merges_partial_samples() {
    let (session, mock) = spawn_session();
    let mut events = session.subscribe_events();
    session.connect("COM3", 115200).await.unwrap();

    mock.push_line("ANGLE:12.50,VEL:-3.20,TORQUE:0.75");
    settle().await;
    mock.push_line("VEL:9.9");
    settle().await;

    let snapshot = session.snapshot().borrow().clone();
    assert_eq!(snapshot.telemetry.angle, Some(12.5));
    assert_eq!(snapshot.telemetry.velocity, Some(9.9));
    assert_eq!(snapshot.telemetry.torque, Some(0.75));
    assert!(snapshot.last_valid_response_at.is_some());

    let telemetry_events = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Telemetry(_)))
        .count();
    assert_eq!(telemetry_events, 2);
}

#[tokio::test(start_paused = true)]
async fn test_garbage_lines_do_not_reset_liveness() {
    let (session, mock) = spawn_session();
    session.connect("COM3", 115200).await.unwrap();
    mock.push_line("OK");
    settle().await;

    // Unrecognized chatter at 1500 ms must not postpone the 2000 ms timeout.
    sleep_ms(1500).await;
    mock.push_line("boot banner v1.2");
    settle().await;
    sleep_ms(600).await;
    // Timeout fired at 2000 ms and the reconnect latch kicked in.
    assert_eq!(session.snapshot().borrow().phase, Phase::Reconnecting);
    assert!(!session.snapshot().borrow().responding);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_telemetry_still_counts_as_heartbeat() {
    let (session, mock) = spawn_session();
    session.connect("COM3", 115200).await.unwrap();
    mock.push_line("OK");
    settle().await;

    // A prefix-matched line with a garbage payload keeps the device alive.
    sleep_ms(1500).await;
    mock.push_line("VEL:abc");
    settle().await;
    sleep_ms(600).await;
    assert_eq!(session.snapshot().borrow().phase, Phase::Connected);
    assert!(session.snapshot().borrow().responding);
    // And it must not have produced a telemetry update.
    assert_eq!(session.snapshot().borrow().telemetry.velocity, None);
}

#[tokio::test(start_paused = true)]
async fn test_polling_issues_get_all_and_stops_on_disconnect() {
    let (session, mock) = spawn_session();
    session.connect("COM3", 115200).await.unwrap();
    mock.push_line("OK");
    settle().await;

    session.set_polling(true, Some(100)).await.unwrap();
    mock.clear_written();
    sleep_ms(350).await;
    let polls = mock
        .written_lines()
        .iter()
        .filter(|l| *l == "get all\n")
        .count();
    assert_eq!(polls, 3);

    session.disconnect().await.unwrap();
    mock.clear_written();
    sleep_ms(1000).await;
    assert!(mock.written_lines().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_poll_interval_is_clamped() {
    let (session, mock) = spawn_session();
    session.connect("COM3", 115200).await.unwrap();
    mock.push_line("OK");
    settle().await;

    // 10 ms requested, 50 ms floor applied.
    session.set_polling(true, Some(10)).await.unwrap();
    mock.clear_written();
    sleep_ms(99).await;
    let polls = mock
        .written_lines()
        .iter()
        .filter(|l| *l == "get all\n")
        .count();
    assert_eq!(polls, 1);
}

#[tokio::test(start_paused = true)]
async fn test_discrete_requests_and_zeroing() {
    let (session, mock) = spawn_session();
    session.connect("COM3", 115200).await.unwrap();
    mock.clear_written();

    session.request_angle().await.unwrap();
    session.request_velocity().await.unwrap();
    session.request_torque().await.unwrap();
    session.reset().await.unwrap();
    session.calibrate().await.unwrap();

    assert_eq!(
        mock.written_lines(),
        vec![
            "get angle\n",
            "get vel\n",
            "get torque\n",
            "set zero\n",
            "set zero\n",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_requests_require_connection() {
    let (session, _mock) = spawn_session();
    assert!(matches!(
        session.request_angle().await,
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(
        session.apply_config(HapticConfig::default()).await,
        Err(SessionError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_aborts_apply_config() {
    let (session, mock) = spawn_session();
    let mut events = session.subscribe_events();
    session.connect("COM3", 115200).await.unwrap();
    mock.clear_written();

    let mut config = HapticConfig::new(HapticMode::Endstops);
    config.set_endstop_turns(2.0);
    mock.script_write(Err("pipe broken"));

    let result = session.apply_config(config).await;
    assert!(matches!(result, Err(SessionError::Transport(_))));
    assert!(has_error(&drain(&mut events), ErrorKind::Transport));
    // The sticky follow-up line is not sent once the primary write failed.
    assert!(mock.written_lines().is_empty());

    // The session survives and keeps working.
    session.request_angle().await.unwrap();
    assert_eq!(mock.written_lines(), vec!["get angle\n"]);
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_disconnect_triggers_reconnect() {
    let (session, mock) = spawn_session();
    session.connect("COM3", 115200).await.unwrap();
    mock.push_line("OK");
    settle().await;

    mock.push_event(TransportEvent::Disconnected);
    settle().await;
    assert_eq!(session.snapshot().borrow().phase, Phase::Reconnecting);

    sleep_ms(1100).await;
    assert_eq!(mock.open_calls().len(), 2);
    assert_eq!(session.snapshot().borrow().phase, Phase::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_auto_connect_prefers_remembered_device() {
    let (transport, mock) = MockTransport::new();
    mock.set_ports(vec![
        PortInfo::new("COM1"),
        knob_port("COM3", "KNOB-42"),
        knob_port("COM4", "KNOB-99"),
    ]);
    let session = DeviceSession::spawn(
        transport,
        MemoryStore::with_last_device("KNOB-99"),
        SessionConfig::default(),
    );

    let chosen = session.auto_connect().await.unwrap();
    assert_eq!(chosen.as_deref(), Some("COM4"));
    assert_eq!(mock.open_calls(), vec![("COM4".to_string(), 115200)]);
    assert_eq!(session.snapshot().borrow().phase, Phase::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_auto_connect_without_match_stays_disconnected() {
    let (transport, mock) = MockTransport::new();
    mock.set_ports(vec![knob_port("COM3", "KNOB-42")]);
    let session = DeviceSession::spawn(
        transport,
        MemoryStore::with_last_device("KNOB-7"),
        SessionConfig::default(),
    );

    assert_eq!(session.auto_connect().await.unwrap(), None);
    assert!(mock.open_calls().is_empty());
    assert_eq!(session.snapshot().borrow().phase, Phase::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_successful_connect_remembers_identifier() {
    let (transport, mock) = MockTransport::new();
    mock.set_ports(vec![knob_port("COM3", "KNOB-42")]);
    let prefs = SharedPrefs::default();
    let session = DeviceSession::spawn(transport, prefs.clone(), SessionConfig::default());

    session.connect("COM3", 115200).await.unwrap();
    assert_eq!(prefs.get().as_deref(), Some("KNOB-42"));
}

#[tokio::test(start_paused = true)]
async fn test_list_devices_reflects_port_scans() {
    let (transport, mock) = MockTransport::new();
    mock.set_ports(vec![knob_port("COM3", "KNOB-42")]);
    let session = DeviceSession::spawn(transport, MemoryStore::new(), SessionConfig::default());

    let devices = session.list_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    let first_id = devices[0].id;

    mock.set_ports(vec![knob_port("COM3", "KNOB-42"), knob_port("COM4", "KNOB-99")]);
    let devices = session.list_devices().await.unwrap();
    assert_eq!(devices.len(), 2);
    assert!(devices.iter().any(|d| d.id == first_id));
}

/// Full happy path: connect, probe answered with `OK`, endstops config
/// applied.
#[tokio::test(start_paused = true)]
async fn test_end_to_end_connect_probe_configure() {
    let (session, mock) = spawn_session();
    let mut events = session.subscribe_events();

    session.connect("COM3", 115200).await.unwrap();
    assert_eq!(session.snapshot().borrow().phase, Phase::Connected);

    // Grace passes, the probe goes out, the device acknowledges.
    sleep_ms(2100).await;
    assert_eq!(mock.written_lines(), vec!["get all\n"]);
    mock.push_line("OK");
    settle().await;

    let snapshot = session.snapshot().borrow().clone();
    assert_eq!(snapshot.phase, Phase::Connected);
    assert!(snapshot.responding);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        SessionEvent::PhaseChanged { phase: Phase::Connected, detail: Some(d) } if d == "responding"
    )));

    mock.clear_written();
    let mut config = HapticConfig::new(HapticMode::Endstops);
    config.set_endstop_turns(2.0);
    config.endstop_style = EndstopStyle::Soft;
    config.is_sticky = true;
    session.apply_config(config).await.unwrap();

    assert_eq!(
        mock.written_lines(),
        vec!["set endstops-ultra:2.0\n", "set sticky:on\n"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stale_line_after_disconnect_is_ignored() {
    let (session, mock) = spawn_session();
    session.connect("COM3", 115200).await.unwrap();
    mock.push_line("OK");
    settle().await;
    assert!(session.snapshot().borrow().responding);

    session.disconnect().await.unwrap();
    assert_eq!(session.snapshot().borrow().phase, Phase::Disconnected);

    // Lines buffered in the reader channel before the close must not
    // revive the session.
    mock.push_line("OK");
    mock.push_line("ANGLE:12.5,VEL:0.0,TORQUE:0.1");
    settle().await;

    let snapshot = session.snapshot().borrow().clone();
    assert_eq!(snapshot.phase, Phase::Disconnected);
    assert!(!snapshot.responding);
    assert!(snapshot.telemetry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stale_line_while_reconnecting_is_ignored() {
    let (session, mock) = spawn_session();
    session.connect("COM3", 115200).await.unwrap();
    mock.push_line("OK");
    settle().await;

    // Silence long enough to lose the device and enter the backoff window.
    sleep_ms(2100).await;
    assert_eq!(session.snapshot().borrow().phase, Phase::Reconnecting);

    // The port is closed; a leftover line must not fake a recovery while
    // the reconnect attempt is still pending.
    mock.push_line("OK");
    settle().await;
    let snapshot = session.snapshot().borrow().clone();
    assert_eq!(snapshot.phase, Phase::Reconnecting);
    assert!(!snapshot.responding);

    // The scheduled attempt still runs and re-opens the port.
    sleep_ms(1100).await;
    assert_eq!(session.snapshot().borrow().phase, Phase::Connected);
    assert_eq!(mock.open_calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_apply_mode_by_name() {
    let (session, mock) = spawn_session();
    let mut events = session.subscribe_events();
    session.connect("COM3", 115200).await.unwrap();

    session.apply_mode("clockwise").await.unwrap();
    assert_eq!(mock.written_lines(), vec!["set cw\n"]);

    let err = session.apply_mode("turbo").await.unwrap_err();
    assert!(matches!(err, SessionError::Protocol(_)));
    assert_eq!(mock.written_lines(), vec!["set cw\n"]);
    assert!(has_error(&drain(&mut events), ErrorKind::Configuration));
}
